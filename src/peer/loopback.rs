//! Соединения внутри процесса для тестов.
//!
//! Повторяет переходы signaling state так, как их разрешает webrtc-rs
//! (без rollback, локальный offer только последний созданный),
//! negotiation-needed при возврате в stable, парный data channel и анонс
//! треков. SDP здесь это строка вида
//! `loopback peer=1 rev=2 channel=chat tracks=video:v1:s1`.

use crate::error::{Error, Result};
use crate::peer::transport::{
    ChannelEvent, DataPipe, PeerEvent, PeerEventSender, PeerFactory, PeerTransport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Semaphore};
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::track::track_local::TrackLocal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LoopTrack {
    pub kind: String,
    pub id: String,
    pub stream: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FakeSdp {
    pub peer: u64,
    pub rev: u64,
    pub channel: Option<String>,
    pub tracks: Vec<LoopTrack>,
}

impl FakeSdp {
    fn render(&self) -> String {
        let tracks: Vec<String> = self
            .tracks
            .iter()
            .map(|t| format!("{}:{}:{}", t.kind, t.id, t.stream))
            .collect();
        format!(
            "loopback peer={} rev={} channel={} tracks={}\r\n",
            self.peer,
            self.rev,
            self.channel.as_deref().unwrap_or("-"),
            if tracks.is_empty() { "-".to_string() } else { tracks.join(",") }
        )
    }

    pub fn parse(sdp: &str) -> Option<Self> {
        let mut parts = sdp.trim().split(' ');
        if parts.next()? != "loopback" {
            return None;
        }
        let mut out = FakeSdp {
            peer: 0,
            rev: 0,
            channel: None,
            tracks: Vec::new(),
        };
        let mut seen_peer = false;
        for part in parts {
            let (k, v) = part.split_once('=')?;
            match k {
                "peer" => {
                    out.peer = v.parse().ok()?;
                    seen_peer = true;
                }
                "rev" => out.rev = v.parse().ok()?,
                "channel" if v != "-" => out.channel = Some(v.to_string()),
                "channel" => {}
                "tracks" if v != "-" => {
                    for t in v.split(',') {
                        let mut it = t.split(':');
                        out.tracks.push(LoopTrack {
                            kind: it.next()?.to_string(),
                            id: it.next()?.to_string(),
                            stream: it.next()?.to_string(),
                        });
                    }
                }
                "tracks" => {}
                _ => return None,
            }
        }
        seen_peer.then_some(out)
    }
}

fn description(sdp_type: RTCSdpType, sdp: String) -> RTCSessionDescription {
    let mut d = RTCSessionDescription::default();
    d.sdp_type = sdp_type;
    d.sdp = sdp;
    d
}

fn bad_state(op: &str, state: RTCSignalingState) -> Error {
    Error::InvalidDescription(format!("{op} in signaling state {state}"))
}

pub(crate) struct LoopbackHub {
    peers: Mutex<HashMap<u64, Weak<LoopbackPeer>>>,
    next: AtomicU64,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        })
    }

    pub fn spawn_peer(
        self: &Arc<Self>,
    ) -> (Arc<LoopbackPeer>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.register(tx), rx)
    }

    pub fn register(self: &Arc<Self>, events: PeerEventSender) -> Arc<LoopbackPeer> {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        let peer = Arc::new(LoopbackPeer {
            id,
            hub: Arc::downgrade(self),
            events,
            inner: Mutex::new(Inner::default()),
            offer_gate: Mutex::new(None),
            closes: AtomicUsize::new(0),
            refuse_removal: AtomicBool::new(false),
        });
        self.peers.lock().insert(id, Arc::downgrade(&peer));
        peer
    }

    fn get(&self, id: u64) -> Option<Arc<LoopbackPeer>> {
        self.peers.lock().get(&id).and_then(Weak::upgrade)
    }
}

struct Inner {
    signaling: RTCSignalingState,
    connection: RTCPeerConnectionState,
    stall_gathering: bool,
    gather_hold: Vec<mpsc::Sender<()>>,
    rev: u64,
    last_offer: String,
    pending_local: Option<RTCSessionDescription>,
    current_local: Option<RTCSessionDescription>,
    pending_remote: Option<RTCSessionDescription>,
    current_remote: Option<RTCSessionDescription>,
    tracks: Vec<LoopTrack>,
    /// Треки из последнего принятого локального offer
    negotiated: Vec<LoopTrack>,
    remote_tracks: Vec<LoopTrack>,
    channel: Option<Arc<LoopbackPipe>>,
    closed: bool,
    connected_once: bool,
    offers_created: usize,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            signaling: RTCSignalingState::Stable,
            connection: RTCPeerConnectionState::New,
            stall_gathering: false,
            gather_hold: Vec::new(),
            rev: 0,
            last_offer: String::new(),
            pending_local: None,
            current_local: None,
            pending_remote: None,
            current_remote: None,
            tracks: Vec::new(),
            negotiated: Vec::new(),
            remote_tracks: Vec::new(),
            channel: None,
            closed: false,
            connected_once: false,
            offers_created: 0,
        }
    }
}

pub(crate) struct LoopbackPeer {
    pub id: u64,
    hub: Weak<LoopbackHub>,
    events: PeerEventSender,
    inner: Mutex<Inner>,
    offer_gate: Mutex<Option<Arc<Semaphore>>>,
    closes: AtomicUsize,
    refuse_removal: AtomicBool,
}

impl LoopbackPeer {
    fn emit(&self, evt: PeerEvent) {
        let _ = self.events.send(evt);
    }

    /// Сбор кандидатов никогда не завершится
    pub fn stall_gathering(&self) {
        self.inner.lock().stall_gathering = true;
    }

    /// `create_offer` ждёт разрешения из возвращённого семафора
    pub fn hold_offers(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.offer_gate.lock() = Some(gate.clone());
        gate
    }

    /// `remove_track` падает, пока флаг стоит
    pub fn refuse_track_removal(&self, on: bool) {
        self.refuse_removal.store(on, Ordering::SeqCst);
    }

    pub fn local_tracks(&self) -> usize {
        self.inner.lock().tracks.len()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn offers_created(&self) -> usize {
        self.inner.lock().offers_created
    }

    pub fn channel(&self) -> Option<Arc<LoopbackPipe>> {
        self.inner.lock().channel.clone()
    }

    /// Имитирует смену состояния соединения сетью
    pub fn force_connection_state(&self, st: RTCPeerConnectionState) {
        self.inner.lock().connection = st;
        self.emit(PeerEvent::ConnectionState(st));
    }

    fn closed_err() -> Error {
        Error::Transport(webrtc::Error::ErrConnectionClosed)
    }

    /// Вызывается под блокировкой после перехода в stable
    fn on_stable(&self, inner: &mut Inner) {
        if !inner.connected_once && inner.current_local.is_some() && inner.current_remote.is_some()
        {
            inner.connected_once = true;
            inner.connection = RTCPeerConnectionState::Connected;
            self.emit(PeerEvent::ConnectionState(RTCPeerConnectionState::Connected));
            if let Some(pipe) = &inner.channel {
                pipe.open.store(true, Ordering::SeqCst);
                self.emit(PeerEvent::Channel(ChannelEvent::Open));
            }
        }
        if inner.connected_once && inner.tracks != inner.negotiated {
            self.emit(PeerEvent::NegotiationNeeded);
        }
    }

    fn announce_tracks(&self, inner: &mut Inner, remote: &FakeSdp) {
        for t in &remote.tracks {
            if !inner.remote_tracks.contains(t) {
                self.emit(PeerEvent::Track {
                    kind: t.kind.clone(),
                    track_id: t.id.clone(),
                    stream_id: t.stream.clone(),
                });
            }
        }
        inner.remote_tracks = remote.tracks.clone();
    }

    fn link_channel(&self, remote_peer: u64, label: &str) {
        let Some(remote) = self.hub.upgrade().and_then(|h| h.get(remote_peer)) else {
            return;
        };
        let Some(remote_pipe) = remote.channel() else {
            return;
        };
        let pipe = LoopbackPipe::new(label, self.events.clone());
        *pipe.remote.lock() = Some(Arc::downgrade(&remote_pipe));
        *remote_pipe.remote.lock() = Some(Arc::downgrade(&pipe));
        self.inner.lock().channel = Some(pipe.clone());
        self.emit(PeerEvent::DataChannel(pipe));
    }
}

#[async_trait]
impl PeerTransport for LoopbackPeer {
    async fn create_offer(&self) -> Result<RTCSessionDescription> {
        let gate = self.offer_gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Self::closed_err());
        }
        inner.rev += 1;
        inner.offers_created += 1;
        let sdp = FakeSdp {
            peer: self.id,
            rev: inner.rev,
            channel: inner.channel.as_ref().map(|c| c.label.clone()),
            tracks: inner.tracks.clone(),
        }
        .render();
        inner.last_offer = sdp.clone();
        Ok(description(RTCSdpType::Offer, sdp))
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Self::closed_err());
        }
        if inner.signaling != RTCSignalingState::HaveRemoteOffer {
            return Err(bad_state("create_answer", inner.signaling));
        }
        inner.rev += 1;
        let sdp = FakeSdp {
            peer: self.id,
            rev: inner.rev,
            channel: inner.channel.as_ref().map(|c| c.label.clone()),
            tracks: Vec::new(),
        };
        Ok(description(RTCSdpType::Answer, sdp.render()))
    }

    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Self::closed_err());
        }
        match desc.sdp_type {
            RTCSdpType::Offer if desc.sdp != inner.last_offer => Err(Error::Transport(
                webrtc::Error::ErrSDPDoesNotMatchOffer,
            )),
            RTCSdpType::Offer => match inner.signaling {
                RTCSignalingState::Stable | RTCSignalingState::HaveLocalOffer => {
                    inner.pending_local = Some(desc);
                    inner.signaling = RTCSignalingState::HaveLocalOffer;
                    Ok(())
                }
                st => Err(bad_state("set_local(offer)", st)),
            },
            RTCSdpType::Answer => match inner.signaling {
                RTCSignalingState::HaveRemoteOffer => {
                    inner.current_local = Some(desc);
                    inner.current_remote = inner.pending_remote.take();
                    inner.signaling = RTCSignalingState::Stable;
                    self.on_stable(&mut inner);
                    Ok(())
                }
                st => Err(bad_state("set_local(answer)", st)),
            },
            other => Err(Error::InvalidDescription(format!(
                "unsupported local description type {other}"
            ))),
        }
    }

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        let parsed = FakeSdp::parse(&desc.sdp)
            .ok_or_else(|| Error::InvalidDescription("unparseable sdp".into()))?;
        let link = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Self::closed_err());
            }
            match desc.sdp_type {
                RTCSdpType::Offer => {
                    if inner.signaling != RTCSignalingState::Stable {
                        return Err(bad_state("set_remote(offer)", inner.signaling));
                    }
                    inner.pending_remote = Some(desc);
                    inner.signaling = RTCSignalingState::HaveRemoteOffer;
                    self.announce_tracks(&mut inner, &parsed);
                    match (&inner.channel, &parsed.channel) {
                        (None, Some(label)) => Some(label.clone()),
                        _ => None,
                    }
                }
                RTCSdpType::Answer => {
                    if inner.signaling != RTCSignalingState::HaveLocalOffer {
                        return Err(bad_state("set_remote(answer)", inner.signaling));
                    }
                    let offered = inner
                        .pending_local
                        .take()
                        .and_then(|d| FakeSdp::parse(&d.sdp));
                    if let Some(offer) = &offered {
                        inner.negotiated = offer.tracks.clone();
                        inner.current_local = Some(description(RTCSdpType::Offer, offer.render()));
                    }
                    inner.current_remote = Some(desc);
                    inner.signaling = RTCSignalingState::Stable;
                    self.announce_tracks(&mut inner, &parsed);
                    self.on_stable(&mut inner);
                    None
                }
                other => {
                    return Err(Error::InvalidDescription(format!(
                        "unsupported remote description type {other}"
                    )))
                }
            }
        };
        if let Some(label) = link {
            self.link_channel(parsed.peer, &label);
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<RTCSessionDescription> {
        let inner = self.inner.lock();
        inner
            .pending_local
            .clone()
            .or_else(|| inner.current_local.clone())
    }

    fn check_description(&self, desc: &RTCSessionDescription) -> Result<()> {
        FakeSdp::parse(&desc.sdp)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidDescription("unparseable sdp".into()))
    }

    async fn needs_negotiation(&self) -> bool {
        let inner = self.inner.lock();
        inner.tracks != inner.negotiated
    }

    fn signaling_state(&self) -> RTCSignalingState {
        self.inner.lock().signaling
    }

    fn ice_gathering_state(&self) -> RTCIceGatheringState {
        if self.inner.lock().stall_gathering {
            RTCIceGatheringState::Gathering
        } else {
            RTCIceGatheringState::Complete
        }
    }

    fn connection_state(&self) -> RTCPeerConnectionState {
        self.inner.lock().connection
    }

    async fn gathering_complete(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        let mut inner = self.inner.lock();
        if inner.stall_gathering {
            inner.gather_hold.push(tx);
        }
        rx
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataPipe>> {
        let pipe = LoopbackPipe::new(label, self.events.clone());
        self.inner.lock().channel = Some(pipe.clone());
        self.emit(PeerEvent::NegotiationNeeded);
        Ok(pipe)
    }

    async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<String> {
        let t = LoopTrack {
            kind: track.kind().to_string(),
            id: track.id().to_string(),
            stream: track.stream_id().to_string(),
        };
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Self::closed_err());
        }
        inner.tracks.push(t.clone());
        if inner.signaling == RTCSignalingState::Stable {
            self.emit(PeerEvent::NegotiationNeeded);
        }
        Ok(t.id)
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        if self.refuse_removal.load(Ordering::SeqCst) {
            return Err(Error::Transport(webrtc::Error::ErrSenderNotCreatedByConnection));
        }
        let mut inner = self.inner.lock();
        inner.tracks.retain(|t| t.id != track_id);
        if inner.signaling == RTCSignalingState::Stable {
            self.emit(PeerEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.connection = RTCPeerConnectionState::Closed;
        inner.gather_hold.clear();
        if let Some(pipe) = &inner.channel {
            pipe.open.store(false, Ordering::SeqCst);
        }
        self.emit(PeerEvent::ConnectionState(RTCPeerConnectionState::Closed));
        Ok(())
    }
}

pub(crate) struct LoopbackPipe {
    label: String,
    events: PeerEventSender,
    pub open: AtomicBool,
    remote: Mutex<Option<Weak<LoopbackPipe>>>,
    sent: Mutex<Vec<String>>,
}

impl LoopbackPipe {
    fn new(label: &str, events: PeerEventSender) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            events,
            open: AtomicBool::new(false),
            remote: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Всё, что ушло в канал
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Доставить сырые байты как будто от удалённой стороны
    pub fn inject(&self, raw: &str) {
        let _ = self
            .events
            .send(PeerEvent::Channel(ChannelEvent::Message(raw.to_string())));
    }
}

#[async_trait]
impl DataPipe for LoopbackPipe {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelNotReady);
        }
        self.sent.lock().push(text.clone());
        let remote = self.remote.lock().as_ref().and_then(Weak::upgrade);
        if let Some(remote) = remote {
            let _ = remote
                .events
                .send(PeerEvent::Channel(ChannelEvent::Message(text)));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(PeerEvent::Channel(ChannelEvent::Closed));
        }
        Ok(())
    }
}

/// Фабрика для `Session::with_parts`
pub(crate) struct LoopbackFactory {
    hub: Arc<LoopbackHub>,
    peers: Mutex<Vec<Arc<LoopbackPeer>>>,
}

impl LoopbackFactory {
    pub fn new(hub: Arc<LoopbackHub>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            peers: Mutex::new(Vec::new()),
        })
    }

    pub fn last_peer(&self) -> Option<Arc<LoopbackPeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl PeerFactory for LoopbackFactory {
    async fn new_peer(&self, events: PeerEventSender) -> Result<Arc<dyn PeerTransport>> {
        let peer = self.hub.register(events);
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}
