use crate::logger::Progress;
use crate::peer::transport::PeerTransport;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;

const TICK: Duration = Duration::from_millis(250);

/// Чем закончилось ожидание кандидатов
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gathering {
    Complete,
    /// Таймаут: продолжаем с тем, что успели собрать
    Partial,
}

/// Отрезок шкалы прогресса, который занимает ожидание
#[derive(Clone, Copy)]
pub struct ProgressSpan<'a> {
    pub progress: &'a Progress,
    pub label: &'a str,
    pub from: u8,
    pub to: u8,
}

/// Ждёт окончания сбора кандидатов, но не дольше `limit`.
/// Таймаут не ошибка.
pub async fn wait_for_gathering(
    peer: &dyn PeerTransport,
    limit: Duration,
    span: Option<ProgressSpan<'_>>,
) -> Gathering {
    if peer.ice_gathering_state() == RTCIceGatheringState::Complete {
        debug!("ICE gathering already complete");
        return Gathering::Complete;
    }

    let mut done = peer.gathering_complete().await;
    let started = Instant::now();
    let deadline = started + limit;
    let mut ticker = interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    if let Some(s) = span {
        s.progress.report(s.label, s.from);
    }

    loop {
        tokio::select! {
            // закрытие канала тоже означает завершение
            _ = done.recv() => {
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "ICE gathering complete");
                if let Some(s) = span {
                    s.progress.report(s.label, s.to);
                }
                return Gathering::Complete;
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    timeout_ms = limit.as_millis() as u64,
                    state = %peer.ice_gathering_state(),
                    "ICE gathering timeout, continuing with partial candidates"
                );
                if let Some(s) = span {
                    s.progress.report(s.label, s.to);
                }
                return Gathering::Partial;
            }
            _ = ticker.tick() => {
                if let Some(s) = span {
                    let frac = started.elapsed().as_secs_f64() / limit.as_secs_f64().max(f64::EPSILON);
                    let width = s.to.saturating_sub(s.from) as f64;
                    let pct = s.from as f64 + (width * frac.min(1.0)).floor();
                    s.progress.report(s.label, pct as u8);
                }
            }
        }
    }
}

/// Подсчёт типов кандидатов в SDP
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(sdp: &str) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for line in sdp.lines().filter(|l| l.starts_with("a=candidate:")) {
        if line.contains("typ host") {
            summary.host += 1;
        } else if line.contains("typ srflx") {
            summary.srflx += 1;
        } else if line.contains("typ relay") {
            summary.relay += 1;
        }
    }

    debug!(
        host = summary.host,
        srflx = summary.srflx,
        relay = summary.relay,
        "candidate analysis"
    );
    if summary.host + summary.srflx + summary.relay == 0 {
        warn!("description carries no ICE candidates, the peer will not be able to reach us");
    } else if summary.relay == 0 {
        debug!("no TURN relay candidates, connection through symmetric NAT may fail");
    }
    summary
}
