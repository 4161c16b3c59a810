use crate::config::Config;
use crate::error::{Error, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::transport::{
    ChannelEvent, DataPipe, PeerEvent, PeerEventSender, PeerFactory, PeerTransport,
};
use crate::utils::random_id;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Создаёт конфигурацию для peer connection
fn rtc_config(config: &Config) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config.rtc_ice_servers(),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Id треков из строк `a=msid:<stream> <track>`
fn announced_tracks(sdp: &str) -> HashSet<String> {
    sdp.lines()
        .filter_map(|l| l.trim().strip_prefix("a=msid:"))
        .filter_map(|v| v.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

/// Фабрика соединений на webrtc-rs
pub struct WebrtcFactory {
    config: Config,
}

impl WebrtcFactory {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self { config })
    }
}

#[async_trait]
impl PeerFactory for WebrtcFactory {
    async fn new_peer(&self, events: PeerEventSender) -> Result<Arc<dyn PeerTransport>> {
        // кодеки нужны для треков при пересогласовании
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(&self.config)).await?);
        let peer = WebrtcPeer::attach(pc, events);
        Ok(peer)
    }
}

/// Соединение webrtc-rs за границей `PeerTransport`
pub struct WebrtcPeer {
    id: String,
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSender,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
}

impl WebrtcPeer {
    fn attach(pc: Arc<RTCPeerConnection>, events: PeerEventSender) -> Arc<Self> {
        let id = random_id();

        pc.on_ice_candidate(Box::new({
            let id = id.clone();
            move |cand: Option<RTCIceCandidate>| {
                match cand {
                    Some(c) => dump_candidate(&id, &c),
                    // None означает конец сбора
                    None => debug!(conn = %id, "ICE candidate gathering completed"),
                }
                Box::pin(async {})
            }
        }));

        pc.on_ice_gathering_state_change(Box::new({
            let id = id.clone();
            move |state: RTCIceGathererState| {
                debug!(conn = %id, ?state, "ICE gathering state changed");
                Box::pin(async {})
            }
        }));

        pc.on_negotiation_needed(Box::new({
            let tx = events.clone();
            move || {
                let _ = tx.send(PeerEvent::NegotiationNeeded);
                Box::pin(async {})
            }
        }));

        pc.on_peer_connection_state_change(Box::new({
            let tx = events.clone();
            let id = id.clone();
            move |st: RTCPeerConnectionState| {
                info!(conn = %id, state = %st, "peer connection state changed");
                let _ = tx.send(PeerEvent::ConnectionState(st));
                Box::pin(async {})
            }
        }));

        pc.on_data_channel(Box::new({
            let tx = events.clone();
            move |dc: Arc<RTCDataChannel>| {
                let pipe = RtcPipe::attach(dc, tx.clone());
                let _ = tx.send(PeerEvent::DataChannel(pipe));
                Box::pin(async {})
            }
        }));

        pc.on_track(Box::new({
            let tx = events.clone();
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let _ = tx.send(PeerEvent::Track {
                    kind: track.kind().to_string(),
                    track_id: track.id(),
                    stream_id: track.stream_id(),
                });
                Box::pin(async {})
            }
        }));

        Arc::new(Self {
            id,
            pc,
            events,
            senders: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl PeerTransport for WebrtcPeer {
    async fn create_offer(&self) -> Result<RTCSessionDescription> {
        Ok(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        Ok(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
        Ok(self.pc.set_local_description(desc).await?)
    }

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| Error::InvalidDescription(e.to_string()))
    }

    async fn local_description(&self) -> Option<RTCSessionDescription> {
        self.pc.local_description().await
    }

    fn check_description(&self, desc: &RTCSessionDescription) -> Result<()> {
        desc.unmarshal()
            .map(|_| ())
            .map_err(|e| Error::InvalidDescription(e.to_string()))
    }

    async fn needs_negotiation(&self) -> bool {
        let Some(local) = self.pc.current_local_description().await else {
            return true;
        };
        let announced = announced_tracks(&local.sdp);
        let senders = self.senders.lock();
        senders.len() != announced.len() || senders.keys().any(|id| !announced.contains(id))
    }

    fn signaling_state(&self) -> RTCSignalingState {
        self.pc.signaling_state()
    }

    fn ice_gathering_state(&self) -> RTCIceGatheringState {
        self.pc.ice_gathering_state()
    }

    fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    async fn gathering_complete(&self) -> mpsc::Receiver<()> {
        self.pc.gathering_complete_promise().await
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataPipe>> {
        let dc = self
            .pc
            .create_data_channel(
                label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        Ok(RtcPipe::attach(dc, self.events.clone()))
    }

    async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<String> {
        let track_id = track.id().to_string();
        let sender = self.pc.add_track(track).await?;
        self.senders.lock().insert(track_id.clone(), sender);
        debug!(conn = %self.id, %track_id, "local track added");
        Ok(track_id)
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        let sender = self.senders.lock().get(track_id).cloned();
        match sender {
            Some(sender) => {
                // sender остаётся в карте, пока удаление не прошло
                self.pc.remove_track(&sender).await?;
                self.senders.lock().remove(track_id);
                debug!(conn = %self.id, %track_id, "local track removed");
            }
            None => warn!(conn = %self.id, %track_id, "unknown track, nothing to remove"),
        }
        Ok(())
    }

    async fn log_selected_pair(&self, moment: &str) {
        dump_selected_pair(&self.pc, moment).await;
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.pc.close().await?;
        info!(conn = %self.id, "peer connection closed");
        Ok(())
    }
}

/// Data channel webrtc-rs за границей `DataPipe`
pub struct RtcPipe {
    dc: Arc<RTCDataChannel>,
}

impl RtcPipe {
    fn attach(dc: Arc<RTCDataChannel>, events: PeerEventSender) -> Arc<Self> {
        dc.on_open(Box::new({
            let tx = events.clone();
            let label = dc.label().to_string();
            move || {
                info!(%label, "data channel opened");
                let _ = tx.send(PeerEvent::Channel(ChannelEvent::Open));
                Box::pin(async {})
            }
        }));

        dc.on_message(Box::new({
            let tx = events.clone();
            move |msg: DataChannelMessage| {
                debug!(len = msg.data.len(), is_string = msg.is_string, "data channel message");
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = tx.send(PeerEvent::Channel(ChannelEvent::Message(text)));
                    }
                    Err(_) => warn!("dropping non-UTF-8 data channel message"),
                }
                Box::pin(async {})
            }
        }));

        dc.on_close(Box::new({
            let tx = events;
            move || {
                let _ = tx.send(PeerEvent::Channel(ChannelEvent::Closed));
                Box::pin(async {})
            }
        }));

        Arc::new(Self { dc })
    }
}

#[async_trait]
impl DataPipe for RtcPipe {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelNotReady);
        }
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(self.dc.close().await?)
    }
}
