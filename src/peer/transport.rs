//! Граница с нативным WebRTC.
//!
//! Оркестрация согласования работает только через эти трейты: создание и
//! применение описаний, состояния соединения, data channel и треки. Все
//! уведомления от соединения приходят как [`PeerEvent`] в одну очередь.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::track::track_local::TrackLocal;

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// События data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(String),
    Closed,
}

/// Уведомления от соединения
pub enum PeerEvent {
    NegotiationNeeded,
    ConnectionState(RTCPeerConnectionState),
    /// Канал, открытый удалённой стороной
    DataChannel(Arc<dyn DataPipe>),
    Channel(ChannelEvent),
    Track {
        kind: String,
        track_id: String,
        stream_id: String,
    },
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            PeerEvent::ConnectionState(st) => write!(f, "ConnectionState({st})"),
            PeerEvent::DataChannel(pipe) => write!(f, "DataChannel({})", pipe.label()),
            PeerEvent::Channel(ev) => write!(f, "Channel({ev:?})"),
            PeerEvent::Track { kind, track_id, .. } => write!(f, "Track({kind}, {track_id})"),
        }
    }
}

/// Надёжный упорядоченный канал
#[async_trait]
pub trait DataPipe: Send + Sync {
    fn label(&self) -> String;
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: String) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<RTCSessionDescription>;
    async fn create_answer(&self) -> Result<RTCSessionDescription>;
    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()>;
    async fn local_description(&self) -> Option<RTCSessionDescription>;
    /// Разбирает описание, не применяя его
    fn check_description(&self, desc: &RTCSessionDescription) -> Result<()>;
    /// Есть ли локальные изменения, которых нет в текущем описании
    async fn needs_negotiation(&self) -> bool;

    fn signaling_state(&self) -> RTCSignalingState;
    fn ice_gathering_state(&self) -> RTCIceGatheringState;
    fn connection_state(&self) -> RTCPeerConnectionState;

    /// Канал закрывается, когда сбор кандидатов завершён
    async fn gathering_complete(&self) -> mpsc::Receiver<()>;

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataPipe>>;

    /// Возвращает id трека, по которому его можно удалить
    async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<String>;
    async fn remove_track(&self, track_id: &str) -> Result<()>;

    /// Снимок выбранной пары кандидатов для логов
    async fn log_selected_pair(&self, _moment: &str) {}

    async fn close(&self) -> Result<()>;
}

/// Создаёт новое соединение, события которого уходят в `events`
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn new_peer(&self, events: PeerEventSender) -> Result<Arc<dyn PeerTransport>>;
}
