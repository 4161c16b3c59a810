use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::debug;

/// ========== CONNECTION PHASE ==========

/// Макро-состояние соединения, которое видит хост
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPhase {
    Idle,
    NegotiatingInitial,
    AwaitingRemoteCode,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionPhase::Idle => "idle",
            ConnectionPhase::NegotiatingInitial => "negotiating-initial",
            ConnectionPhase::AwaitingRemoteCode => "awaiting-remote-code",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Хранилище фазы. `Failed` терминальна до явного `reset`.
pub struct PhaseCell {
    tx: watch::Sender<ConnectionPhase>,
}

impl PhaseCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionPhase::Idle);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionPhase {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionPhase> {
        self.tx.subscribe()
    }

    /// Возвращает true, если фаза действительно сменилась
    pub fn advance(&self, next: ConnectionPhase) -> bool {
        self.tx.send_if_modified(|cur| {
            if *cur == next {
                return false;
            }
            if *cur == ConnectionPhase::Failed {
                debug!(to = %next, "phase is failed, ignoring transition");
                return false;
            }
            debug!(from = %cur, to = %next, "phase transition");
            *cur = next;
            true
        })
    }

    /// Переход только из фазы `from`
    pub fn transition(&self, from: ConnectionPhase, to: ConnectionPhase) -> bool {
        self.tx.send_if_modified(|cur| {
            if *cur != from || from == to {
                return false;
            }
            debug!(from = %cur, to = %to, "phase transition");
            *cur = to;
            true
        })
    }

    pub fn reset(&self) -> bool {
        self.tx.send_if_modified(|cur| {
            if *cur == ConnectionPhase::Idle {
                return false;
            }
            *cur = ConnectionPhase::Idle;
            true
        })
    }
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new()
    }
}

/// ========== NEGOTIATION FLAGS ==========

/// Флаги perfect negotiation. Принадлежат только машине согласования.
#[derive(Debug, Default)]
pub struct NegotiationFlags {
    /// Локальный offer создаётся и ещё не отправлен
    pub making_offer: AtomicBool,
    /// Входящий offer отбрасывается из-за коллизии
    pub ignore_offer: AtomicBool,
    /// Пока offer был в полёте, пришёл ещё один negotiation-needed
    pub pending: AtomicBool,
    /// Счётчик принятых удалённых offer'ов
    pub remote_round: AtomicU64,
}

impl NegotiationFlags {
    pub fn is_making_offer(&self) -> bool {
        self.making_offer.load(Ordering::SeqCst)
    }

    pub fn is_ignoring_offer(&self) -> bool {
        self.ignore_offer.load(Ordering::SeqCst)
    }

    pub fn round(&self) -> u64 {
        self.remote_round.load(Ordering::SeqCst)
    }
}
