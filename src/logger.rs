use crate::peer::state::ConnectionPhase;
use crate::peer::types::{ChatEntry, SessionEvent};
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

/// Инициализация логирования. `RUST_LOG` имеет приоритет над `level`.
pub fn init(level: Option<&str>) {
    let default = match level {
        Some(l) => l.to_string(),
        None if crate::config::LOGGING_ENABLED => "ssc_p2p=debug,ssc=debug,webrtc=warn".into(),
        None => "warn".into(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // повторная инициализация (тесты, встраивание) не ошибка
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Печать ICE-candidate при появлении
pub fn dump_candidate(label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        debug!(
            label,
            candidate = %init.candidate,
            sdp_mid = ?init.sdp_mid,
            sdp_mline_index = ?init.sdp_mline_index,
            "ice candidate"
        );
    }
}

/// Быстрый снимок getStats -> выбранная пара
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    moment,
                    local = %pair.local_candidate_id,
                    remote = %pair.remote_candidate_id,
                    bytes_sent = pair.bytes_sent,
                    bytes_received = pair.bytes_received,
                    state = ?pair.state,
                    "selected candidate pair"
                );
            }
        }
    }
}

/// ========== EVENTS ==========

/// Рассылка событий хосту (вместо emit в окно)
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, evt: SessionEvent) {
        // нет подписчиков - не ошибка
        let _ = self.tx.send(evt);
    }

    pub fn emit_phase(&self, phase: ConnectionPhase) {
        info!(%phase, "connection phase");
        self.emit(SessionEvent::Phase(phase));
    }

    pub fn emit_message(&self, entry: ChatEntry) {
        self.emit(SessionEvent::Message(entry));
    }

    pub fn emit_remote_track(&self, kind: String, track_id: String, stream_id: String) {
        info!(%kind, %track_id, "remote track");
        self.emit(SessionEvent::RemoteTrack {
            kind,
            track_id,
            stream_id,
        });
    }

    pub fn emit_connection_problem(&self) {
        warn!("connection issues detected");
        self.emit(SessionEvent::ConnectionProblem);
    }

    pub fn emit_connection_recovering(&self) {
        info!("connection is recovering");
        self.emit(SessionEvent::ConnectionRecovering);
    }

    pub fn emit_connection_recovered(&self) {
        info!("connection recovered");
        self.emit(SessionEvent::ConnectionRecovered);
    }

    pub fn emit_connection_failed(&self) {
        warn!("connection recovery failed");
        self.emit(SessionEvent::ConnectionFailed);
    }

    pub fn progress(&self) -> Progress {
        Progress {
            bus: self.clone(),
            last: AtomicU8::new(0),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Прогресс одной операции. Процент не убывает; 100 только через `finish`.
pub struct Progress {
    bus: EventBus,
    last: AtomicU8,
}

impl Progress {
    pub fn report(&self, label: &str, percent: u8) {
        let percent = percent.min(99);
        let prev = self.last.fetch_max(percent, Ordering::SeqCst);
        if percent < prev {
            return;
        }
        self.bus.emit(SessionEvent::Progress {
            label: label.to_string(),
            percent,
        });
    }

    pub fn finish(&self, label: &str) {
        if self.last.swap(100, Ordering::SeqCst) == 100 {
            return;
        }
        self.bus.emit(SessionEvent::Progress {
            label: label.to_string(),
            percent: 100,
        });
    }

    pub fn percent(&self) -> u8 {
        self.last.load(Ordering::SeqCst)
    }
}
