//! Управление жизненным циклом соединения.
//!
//! `Session` это единственная точка входа для хоста: создать сессию,
//! присоединиться, принять answer, чат, медиа и закрытие. Все уведомления
//! соединения разбираются в одной задаче (`pump`), локальные раунды
//! пересогласования запускаются отдельными задачами.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::logger::EventBus;
use crate::media::{MediaProvider, SyntheticMedia};
use crate::peer::connection::WebrtcFactory;
use crate::peer::data_channel::{ControlChannel, Transcript};
use crate::peer::negotiation::Negotiator;
use crate::peer::state::{ConnectionPhase, PhaseCell};
use crate::peer::transport::{ChannelEvent, PeerEvent, PeerFactory, PeerTransport};
use crate::peer::types::{ChatEntry, SdpRole, SessionDescriptor, SessionEvent};
use crate::signaling;
use crate::utils::random_id;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Локальные треки, прикреплённые к соединению
struct LocalMedia {
    stream_id: String,
    track_ids: Vec<String>,
}

/// Одно соединение и всё, чем оно владеет
struct ActiveConnection {
    id: String,
    peer: Arc<dyn PeerTransport>,
    negotiator: Arc<Negotiator>,
    channel: Mutex<Option<Arc<ControlChannel>>>,
    media: tokio::sync::Mutex<Option<LocalMedia>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    grace: Mutex<Option<JoinHandle<()>>>,
    had_problem: AtomicBool,
    closed: AtomicBool,
}

impl ActiveConnection {
    fn channel(&self) -> Option<Arc<ControlChannel>> {
        self.channel.lock().clone()
    }

    fn cancel_grace(&self) {
        if let Some(handle) = self.grace.lock().take() {
            debug!(conn = %self.id, "aborting pending disconnect task");
            handle.abort();
        }
    }

    /// Закрывает соединение ровно один раз
    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
        self.cancel_grace();

        if let Some(channel) = self.channel() {
            if let Err(e) = channel.close().await {
                debug!(conn = %self.id, error = %e, "control channel close failed");
            }
        }
        match self.peer.close().await {
            Ok(()) => info!(conn = %self.id, "connection closed"),
            Err(e) => warn!(conn = %self.id, error = %e, "error while closing connection"),
        }
    }
}

struct Inner {
    config: Config,
    factory: Arc<dyn PeerFactory>,
    media: Arc<dyn MediaProvider>,
    phase: PhaseCell,
    bus: EventBus,
    transcript: Arc<Transcript>,
    active: Mutex<Option<Arc<ActiveConnection>>>,
}

impl Inner {
    fn set_phase(&self, next: ConnectionPhase) {
        if self.phase.advance(next) {
            self.bus.emit_phase(next);
        }
    }

    fn transition(&self, from: ConnectionPhase, to: ConnectionPhase) {
        if self.phase.transition(from, to) {
            self.bus.emit_phase(to);
        }
    }

    fn is_current(&self, conn: &Arc<ActiveConnection>) -> bool {
        matches!(&*self.active.lock(), Some(active) if Arc::ptr_eq(active, conn))
    }

    /// Включает пересогласование, когда соединение установлено и канал открыт.
    /// Триггеры, пропущенные до этого, догоняются одним раундом.
    fn try_arm(&self, conn: &ActiveConnection) -> bool {
        if self.phase.get() != ConnectionPhase::Connected {
            return false;
        }
        let channel = match conn.channel() {
            Some(channel) if channel.is_open() => channel,
            _ => {
                debug!(conn = %conn.id, "connected, waiting for control channel to open");
                return false;
            }
        };
        if !conn.negotiator.arm(channel) {
            return false;
        }
        let negotiator = conn.negotiator.clone();
        tokio::spawn(async move {
            let _ = negotiator.negotiate().await;
        });
        true
    }

    fn fail_connection(&self, conn: &ActiveConnection, reason: &str) {
        warn!(conn = %conn.id, reason, "connection failed");
        if self.phase.advance(ConnectionPhase::Failed) {
            self.bus.emit_phase(ConnectionPhase::Failed);
            self.bus.emit_connection_failed();
        }
    }

    async fn on_connection_state(
        self: &Arc<Self>,
        conn: &Arc<ActiveConnection>,
        st: RTCPeerConnectionState,
    ) {
        match st {
            RTCPeerConnectionState::Connected => {
                conn.cancel_grace();
                if self.phase.get() == ConnectionPhase::Failed {
                    debug!(conn = %conn.id, "connection already failed, ignoring late connected state");
                    return;
                }
                if conn.had_problem.swap(false, Ordering::SeqCst) {
                    self.bus.emit_connection_recovered();
                }
                self.set_phase(ConnectionPhase::Connected);
                self.try_arm(conn);
                conn.peer.log_selected_pair("CONNECTED").await;
            }

            RTCPeerConnectionState::Disconnected => {
                if conn.grace.lock().is_some() {
                    debug!(conn = %conn.id, "disconnect task already pending, ignoring");
                    return;
                }
                conn.had_problem.store(true, Ordering::SeqCst);
                self.bus.emit_connection_problem();

                let grace = self.config.grace_period;
                let weak = Arc::downgrade(self);
                let task_conn = conn.clone();
                let handle = tokio::spawn(async move {
                    info!(conn = %task_conn.id, secs = grace.as_secs(), "grace period started");
                    if let Some(inner) = weak.upgrade() {
                        inner.bus.emit_connection_recovering();
                    }
                    tokio::time::sleep(grace).await;

                    let state_now = task_conn.peer.connection_state();
                    info!(conn = %task_conn.id, state = %state_now, "grace period over");
                    task_conn.grace.lock().take();
                    if state_now == RTCPeerConnectionState::Connected {
                        return;
                    }
                    task_conn.peer.log_selected_pair("BEFORE-FAIL").await;
                    if let Some(inner) = weak.upgrade() {
                        inner.fail_connection(&task_conn, "connection did not recover in time");
                    }
                });
                *conn.grace.lock() = Some(handle);
            }

            RTCPeerConnectionState::Failed => {
                conn.cancel_grace();
                conn.peer.log_selected_pair("BEFORE-FAIL").await;
                self.fail_connection(conn, "transport reported failure");
            }

            RTCPeerConnectionState::Closed => {
                conn.cancel_grace();
                debug!(conn = %conn.id, "peer connection closed");
            }

            other => debug!(conn = %conn.id, state = %other, "connection state ignored"),
        }
    }

    async fn on_event(self: &Arc<Self>, conn: &Arc<ActiveConnection>, evt: PeerEvent) {
        match evt {
            PeerEvent::NegotiationNeeded => {
                let negotiator = conn.negotiator.clone();
                tokio::spawn(async move {
                    // ошибки уже залогированы внутри раунда
                    let _ = negotiator.negotiate().await;
                });
            }
            PeerEvent::ConnectionState(st) => self.on_connection_state(conn, st).await,
            PeerEvent::DataChannel(pipe) => {
                let channel = ControlChannel::accept(pipe, self.transcript.clone());
                *conn.channel.lock() = Some(channel);
                self.try_arm(conn);
            }
            PeerEvent::Channel(ChannelEvent::Open) => {
                info!(conn = %conn.id, "control channel open");
                self.try_arm(conn);
            }
            PeerEvent::Channel(ChannelEvent::Message(raw)) => match conn.channel() {
                Some(channel) => {
                    channel.route(&raw, &conn.negotiator).await;
                }
                None => warn!(conn = %conn.id, "message before control channel, dropping"),
            },
            PeerEvent::Channel(ChannelEvent::Closed) => {
                info!(conn = %conn.id, "control channel closed");
            }
            PeerEvent::Track {
                kind,
                track_id,
                stream_id,
            } => self.bus.emit_remote_track(kind, track_id, stream_id),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(conn) = self.active.get_mut().take() {
            if let Some(handle) = conn.pump.lock().take() {
                handle.abort();
            }
            conn.cancel_grace();
        }
    }
}

/// Очередь уведомлений одного соединения
async fn pump(
    weak: Weak<Inner>,
    conn: Arc<ActiveConnection>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    while let Some(evt) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if conn.closed.load(Ordering::SeqCst) || !inner.is_current(&conn) {
            break;
        }
        debug!(conn = %conn.id, event = ?evt, "peer event");
        inner.on_event(&conn, evt).await;
    }
    debug!(conn = %conn.id, "event pump finished");
}

/// Контроллер жизненного цикла
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Соединения на webrtc-rs и синтетическое медиа
    pub fn new(config: Config) -> Self {
        let factory = WebrtcFactory::new(config.clone());
        Self::with_parts(config, factory, Arc::new(SyntheticMedia::default()))
    }

    pub fn with_parts(
        config: Config,
        factory: Arc<dyn PeerFactory>,
        media: Arc<dyn MediaProvider>,
    ) -> Self {
        let bus = EventBus::new();
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                media,
                phase: PhaseCell::new(),
                transcript: Transcript::new(bus.clone()),
                bus,
                active: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.phase.get()
    }

    pub fn watch_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.inner.phase.subscribe()
    }

    /// Ждёт фазу, удовлетворяющую `pred`. `None` по таймауту.
    pub async fn wait_for_phase(
        &self,
        pred: impl FnMut(&ConnectionPhase) -> bool,
        limit: Duration,
    ) -> Option<ConnectionPhase> {
        let mut rx = self.watch_phase();
        let reached = match tokio::time::timeout(limit, rx.wait_for(pred)).await {
            Ok(Ok(phase)) => Some(*phase),
            _ => None,
        };
        reached
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.bus.subscribe()
    }

    pub fn transcript(&self) -> Vec<ChatEntry> {
        self.inner.transcript.entries()
    }

    fn active(&self) -> Result<Arc<ActiveConnection>> {
        self.inner
            .active
            .lock()
            .clone()
            .ok_or(Error::NoActiveConnection)
    }

    async fn close_previous(&self) {
        let previous = self.inner.active.lock().take();
        if let Some(conn) = previous {
            info!(conn = %conn.id, "closing previous connection");
            conn.shutdown().await;
        }
        if self.inner.phase.reset() {
            self.inner.bus.emit_phase(ConnectionPhase::Idle);
        }
    }

    /// Новое соединение, ставится активным; его очередь событий уже разбирается
    async fn connect(&self, is_initiator: bool) -> Result<Arc<ActiveConnection>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = self.inner.factory.new_peer(tx).await?;
        let id = random_id();
        info!(conn = %id, initiator = is_initiator, "new connection");

        let conn = Arc::new(ActiveConnection {
            negotiator: Negotiator::new(&id, peer.clone(), is_initiator, &self.inner.config),
            id,
            peer,
            channel: Mutex::new(None),
            media: tokio::sync::Mutex::new(None),
            pump: Mutex::new(None),
            grace: Mutex::new(None),
            had_problem: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        *self.inner.active.lock() = Some(conn.clone());

        let handle = tokio::spawn(pump(Arc::downgrade(&self.inner), conn.clone(), rx));
        *conn.pump.lock() = Some(handle);
        Ok(conn)
    }

    /// Ошибка первого рукопожатия: фаза `failed`, ошибка уходит вызывающему
    fn fail_initial(&self, e: Error) -> Error {
        warn!(error = %e, "initial handshake failed");
        self.inner.set_phase(ConnectionPhase::Failed);
        e
    }

    // ========== OPERATIONS ==========

    /// Создаёт сессию и возвращает ссылку с offer
    pub async fn create_session(&self) -> Result<String> {
        self.close_previous().await;
        let conn = self.connect(true).await?;
        self.inner.set_phase(ConnectionPhase::NegotiatingInitial);

        let progress = self.inner.bus.progress();
        progress.report("Opening control channel", 5);
        let channel = ControlChannel::open(
            conn.peer.as_ref(),
            &self.inner.config.channel_label,
            self.inner.transcript.clone(),
        )
        .await
        .map_err(|e| self.fail_initial(e))?;
        *conn.channel.lock() = Some(channel);

        let offer = conn
            .negotiator
            .initial_offer(&progress)
            .await
            .map_err(|e| self.fail_initial(e))?;

        let link = signaling::create_shareable_link(
            &SessionDescriptor::offer(offer),
            &self.inner.config.link_base,
            self.inner.config.compress_tokens,
        )
        .map_err(|e| self.fail_initial(e))?;

        self.inner.transition(
            ConnectionPhase::NegotiatingInitial,
            ConnectionPhase::AwaitingRemoteCode,
        );
        progress.finish("Link ready");
        info!(conn = %conn.id, link_len = link.len(), "session created");
        Ok(link)
    }

    /// Присоединение по offer. Возвращает токен answer для ручной передачи.
    pub async fn join_session(&self, offer: SessionDescriptor) -> Result<String> {
        if offer.role != SdpRole::Offer {
            return Err(Error::InvalidDescription(
                "a session can only be joined with an offer".into(),
            ));
        }
        self.close_previous().await;
        let conn = self.connect(false).await?;
        self.inner.set_phase(ConnectionPhase::NegotiatingInitial);

        let progress = self.inner.bus.progress();
        let answer = conn
            .negotiator
            .initial_answer(offer.payload, &progress)
            .await
            .map_err(|e| self.fail_initial(e))?;

        let token = signaling::encode_with(
            &SessionDescriptor::answer(answer),
            self.inner.config.compress_tokens,
        )
        .map_err(|e| self.fail_initial(e))?;

        progress.finish("Answer ready");
        info!(conn = %conn.id, token_len = token.len(), "answer ready, waiting for the peer");
        Ok(token)
    }

    /// Ссылка или голый токен offer
    pub async fn join_link(&self, input: &str) -> Result<String> {
        let offer = signaling::parse_code(input)?;
        self.join_session(offer).await
    }

    /// Answer, вставленный пользователем
    pub async fn submit_answer(&self, token: &str) -> Result<()> {
        let conn = self.active()?;
        let answer = signaling::parse_code(token)?;
        if answer.role != SdpRole::Answer {
            return Err(Error::InvalidDescription(
                "expected an answer code, got an offer".into(),
            ));
        }
        if !conn.negotiator.is_initiator()
            || self.inner.phase.get() != ConnectionPhase::AwaitingRemoteCode
        {
            return Err(Error::InvalidDescription(format!(
                "not awaiting an answer (phase {})",
                self.inner.phase.get()
            )));
        }

        conn.negotiator
            .apply_answer(answer.payload)
            .await
            .map_err(|e| self.fail_initial(e))?;

        self.inner.transition(
            ConnectionPhase::AwaitingRemoteCode,
            ConnectionPhase::Connecting,
        );
        Ok(())
    }

    /// Включает автоматическое пересогласование через control-канал
    pub fn enable_renegotiation(&self) -> Result<bool> {
        let conn = self.active()?;
        match conn.channel() {
            Some(channel) if channel.is_open() => {}
            _ => return Err(Error::ChannelNotReady),
        }
        if self.inner.phase.get() != ConnectionPhase::Connected {
            return Err(Error::ChannelNotReady);
        }
        Ok(self.inner.try_arm(&conn))
    }

    pub async fn send_chat(&self, text: &str) -> Result<ChatEntry> {
        let conn = self.active()?;
        let channel = conn.channel().ok_or_else(|| {
            warn!("chat message dropped, control channel is not open");
            Error::ChannelNotReady
        })?;
        channel.send(text).await
    }

    /// Добавляет локальные треки; пересогласование идёт по control-каналу
    pub async fn start_local_media(&self) -> Result<()> {
        let conn = self.active()?;
        if self.inner.phase.get() != ConnectionPhase::Connected {
            return Err(Error::ChannelNotReady);
        }
        let mut slot = conn.media.lock().await;
        if slot.is_some() {
            debug!(conn = %conn.id, "local media already active");
            return Ok(());
        }

        let stream = self.inner.media.get_user_media().await?;
        let mut track_ids = Vec::with_capacity(stream.tracks.len());
        for track in stream.tracks {
            match conn.peer.add_track(track).await {
                Ok(id) => track_ids.push(id),
                Err(e) => {
                    for id in &track_ids {
                        if let Err(cleanup) = conn.peer.remove_track(id).await {
                            warn!(conn = %conn.id, track = %id, error = %cleanup, "failed to remove track after add failure");
                        }
                    }
                    return Err(e);
                }
            }
        }
        info!(conn = %conn.id, stream = %stream.id, tracks = track_ids.len(), "local media started");
        *slot = Some(LocalMedia {
            stream_id: stream.id,
            track_ids,
        });
        Ok(())
    }

    /// Снимает локальные треки. Неудалённые остаются в слоте для повтора.
    pub async fn stop_local_media(&self) -> Result<()> {
        let conn = self.active()?;
        let mut slot = conn.media.lock().await;
        let Some(media) = slot.as_mut() else {
            return Ok(());
        };
        while let Some(id) = media.track_ids.first().cloned() {
            if let Err(e) = conn.peer.remove_track(&id).await {
                warn!(conn = %conn.id, track = %id, error = %e, "failed to remove local track");
                return Err(e);
            }
            media.track_ids.remove(0);
        }
        info!(conn = %conn.id, stream = %media.stream_id, "local media stopped");
        *slot = None;
        Ok(())
    }

    /// Закрывает активное соединение. Повторный вызов даёт `NoActiveConnection`.
    pub async fn close(&self) -> Result<()> {
        let conn = self
            .inner
            .active
            .lock()
            .take()
            .ok_or(Error::NoActiveConnection)?;
        conn.shutdown().await;
        if self.inner.phase.reset() {
            self.inner.bus.emit_phase(ConnectionPhase::Idle);
        }
        Ok(())
    }
}
