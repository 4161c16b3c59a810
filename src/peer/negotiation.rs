//! Машина согласования.
//!
//! Первое рукопожатие идёт через ручной обмен кодами, поэтому гонок там нет.
//! Все последующие раунды идут через control-канал по схеме perfect
//! negotiation: при коллизии инициатор сессии принимает чужой offer
//! (отбрасывая свой), а присоединившийся игнорирует его.
//!
//! webrtc-rs не умеет rollback, поэтому offer пересогласования применяется
//! локально только вместе с ответом на него. Пока ответа нет, signaling
//! остаётся в stable, а offer лежит в `outstanding`.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::logger::Progress;
use crate::peer::ice::{analyze_candidates, wait_for_gathering, ProgressSpan};
use crate::peer::state::NegotiationFlags;
use crate::peer::transport::PeerTransport;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

/// Итог одного шага согласования
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// Локальный offer отправлен удалённой стороне
    Sent,
    /// Удалённый offer принят, answer отправлен
    Answered,
    /// Удалённый answer применён
    Applied,
    /// Входящее описание отброшено (коллизия или устаревший answer)
    Ignored,
    /// Локальный offer вытеснен удалённым и не отправлялся
    Abandoned,
    /// Сейчас согласовывать нельзя, соединение повторит триггер само
    Deferred,
    /// Локальных изменений нет, offer не нужен
    Unchanged,
    /// Триггер объединён с уже идущим раундом
    Coalesced,
}

/// Куда уходят описания после первого рукопожатия
#[async_trait]
pub trait NegotiationSink: Send + Sync {
    async fn send_description(&self, desc: RTCSessionDescription) -> Result<()>;
}

pub struct Negotiator {
    conn: String,
    peer: Arc<dyn PeerTransport>,
    is_initiator: bool,
    flags: NegotiationFlags,
    sink: Mutex<Option<Arc<dyn NegotiationSink>>>,
    /// Отправленный offer, ещё не применённый локально
    outstanding: Mutex<Option<RTCSessionDescription>>,
    initial_timeout: Duration,
    renegotiation_timeout: Duration,
}

fn rejected(e: Error) -> Error {
    match e {
        Error::InvalidDescription(_) => e,
        other => Error::InvalidDescription(other.to_string()),
    }
}

impl Negotiator {
    pub fn new(
        conn: &str,
        peer: Arc<dyn PeerTransport>,
        is_initiator: bool,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn: conn.to_string(),
            peer,
            is_initiator,
            flags: NegotiationFlags::default(),
            sink: Mutex::new(None),
            outstanding: Mutex::new(None),
            initial_timeout: config.initial_gather_timeout,
            renegotiation_timeout: config.renegotiation_gather_timeout,
        })
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn flags(&self) -> &NegotiationFlags {
        &self.flags
    }

    /// Дальнейшие раунды идут через `sink`. Повторный вызов ничего не меняет.
    pub fn arm(&self, sink: Arc<dyn NegotiationSink>) -> bool {
        let mut slot = self.sink.lock();
        if slot.is_some() {
            return false;
        }
        info!(conn = %self.conn, initiator = self.is_initiator, "automatic renegotiation armed");
        *slot = Some(sink);
        true
    }

    pub fn is_armed(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Наш offer ушёл и ждёт answer
    pub fn has_outstanding_offer(&self) -> bool {
        self.outstanding.lock().is_some()
    }

    async fn finished_local(&self) -> Result<RTCSessionDescription> {
        let local = self
            .peer
            .local_description()
            .await
            .ok_or_else(|| Error::InvalidDescription("local description is missing".into()))?;
        analyze_candidates(&local.sdp);
        Ok(local)
    }

    // ========== INITIAL HANDSHAKE ==========

    /// Offer для ручной передачи: create -> set local -> ожидание кандидатов
    pub async fn initial_offer(&self, progress: &Progress) -> Result<RTCSessionDescription> {
        progress.report("Creating offer", 10);
        let offer = self.peer.create_offer().await?;

        progress.report("Applying local description", 25);
        self.peer.set_local_description(offer).await?;

        wait_for_gathering(
            self.peer.as_ref(),
            self.initial_timeout,
            Some(ProgressSpan {
                progress,
                label: "Gathering network candidates",
                from: 30,
                to: 90,
            }),
        )
        .await;

        let local = self.finished_local().await?;
        progress.report("Offer ready", 95);
        debug!(conn = %self.conn, sdp_len = local.sdp.len(), "initial offer ready");
        Ok(local)
    }

    /// Answer на offer, полученный вручную
    pub async fn initial_answer(
        &self,
        offer: RTCSessionDescription,
        progress: &Progress,
    ) -> Result<RTCSessionDescription> {
        progress.report("Applying remote offer", 10);
        self.flags.remote_round.fetch_add(1, Ordering::SeqCst);
        self.peer
            .set_remote_description(offer)
            .await
            .map_err(rejected)?;

        progress.report("Creating answer", 25);
        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer).await?;

        wait_for_gathering(
            self.peer.as_ref(),
            self.initial_timeout,
            Some(ProgressSpan {
                progress,
                label: "Gathering network candidates",
                from: 30,
                to: 90,
            }),
        )
        .await;

        let local = self.finished_local().await?;
        progress.report("Answer ready", 95);
        debug!(conn = %self.conn, sdp_len = local.sdp.len(), "initial answer ready");
        Ok(local)
    }

    /// Answer, вставленный пользователем, на наш первый offer
    pub async fn apply_answer(&self, answer: RTCSessionDescription) -> Result<()> {
        let state = self.peer.signaling_state();
        if state != RTCSignalingState::HaveLocalOffer {
            return Err(Error::InvalidDescription(format!(
                "no outstanding offer (signaling state {state})"
            )));
        }
        self.peer
            .set_remote_description(answer)
            .await
            .map_err(rejected)?;
        info!(conn = %self.conn, "remote answer applied");
        Ok(())
    }

    // ========== RENEGOTIATION ==========

    /// Реакция на negotiation-needed
    pub async fn negotiate(&self) -> Result<NegotiationOutcome> {
        let Some(sink) = self.sink.lock().clone() else {
            debug!(conn = %self.conn, "negotiation needed before renegotiation is armed, skipping");
            return Ok(NegotiationOutcome::Deferred);
        };

        if self.flags.making_offer.swap(true, Ordering::SeqCst) {
            self.flags.pending.store(true, Ordering::SeqCst);
            debug!(conn = %self.conn, "offer already in flight, coalescing trigger");
            return Ok(NegotiationOutcome::Coalesced);
        }

        let outcome = loop {
            self.flags.pending.store(false, Ordering::SeqCst);
            let outcome = self.produce_offer(sink.as_ref()).await;
            let again = self.flags.pending.swap(false, Ordering::SeqCst);
            match outcome {
                Ok(NegotiationOutcome::Abandoned | NegotiationOutcome::Deferred) if again => {
                    debug!(conn = %self.conn, "re-running negotiation for a trigger that arrived mid-offer");
                }
                other => break other,
            }
        };
        self.flags.making_offer.store(false, Ordering::SeqCst);

        match &outcome {
            Ok(o) => debug!(conn = %self.conn, outcome = ?o, "local negotiation round finished"),
            Err(e) => warn!(conn = %self.conn, error = %e, "local negotiation round failed"),
        }
        outcome
    }

    async fn produce_offer(&self, sink: &dyn NegotiationSink) -> Result<NegotiationOutcome> {
        let state = self.peer.signaling_state();
        // have-local-offer без outstanding остаётся после отвергнутого answer,
        // из него webrtc-rs разрешает новый offer
        let offerable = matches!(
            state,
            RTCSignalingState::Stable | RTCSignalingState::HaveLocalOffer
        ) && !self.has_outstanding_offer();
        if !offerable {
            debug!(conn = %self.conn, %state, "offer already outstanding or not stable, deferring");
            return Ok(NegotiationOutcome::Deferred);
        }
        if !self.peer.needs_negotiation().await {
            debug!(conn = %self.conn, "nothing changed since last round, no offer");
            return Ok(NegotiationOutcome::Unchanged);
        }

        let round = self.flags.round();
        let offer = self.peer.create_offer().await?;
        analyze_candidates(&offer.sdp);
        {
            let mut slot = self.outstanding.lock();
            if self.flags.round() != round {
                info!(conn = %self.conn, "remote offer accepted while creating ours, abandoning");
                return Ok(NegotiationOutcome::Abandoned);
            }
            *slot = Some(offer.clone());
        }

        if let Err(e) = sink.send_description(offer).await {
            // ничего не применено, signaling остаётся прежним
            self.outstanding.lock().take();
            return Err(e);
        }
        info!(conn = %self.conn, "renegotiation offer sent");
        Ok(NegotiationOutcome::Sent)
    }

    /// Описание, пришедшее по control-каналу. Answer уходит через `reply`.
    pub async fn handle_remote(
        &self,
        desc: RTCSessionDescription,
        reply: &dyn NegotiationSink,
    ) -> Result<NegotiationOutcome> {
        match desc.sdp_type {
            RTCSdpType::Offer => self.accept_offer(desc, reply).await,
            RTCSdpType::Answer => self.accept_answer(desc).await,
            other => {
                warn!(conn = %self.conn, kind = %other, "unexpected description kind over control channel");
                Ok(NegotiationOutcome::Ignored)
            }
        }
    }

    async fn accept_answer(&self, answer: RTCSessionDescription) -> Result<NegotiationOutcome> {
        self.peer.check_description(&answer).map_err(rejected)?;
        let Some(offer) = self.outstanding.lock().take() else {
            warn!(conn = %self.conn, "dropping answer with no outstanding offer");
            return Ok(NegotiationOutcome::Ignored);
        };

        self.peer.set_local_description(offer).await?;
        self.peer
            .set_remote_description(answer)
            .await
            .map_err(rejected)?;
        info!(conn = %self.conn, "renegotiation answer applied");
        Ok(NegotiationOutcome::Applied)
    }

    async fn accept_offer(
        &self,
        offer: RTCSessionDescription,
        reply: &dyn NegotiationSink,
    ) -> Result<NegotiationOutcome> {
        self.peer.check_description(&offer).map_err(rejected)?;
        let state = self.peer.signaling_state();
        let collision = self.flags.is_making_offer()
            || self.has_outstanding_offer()
            || state != RTCSignalingState::Stable;

        let ignore = collision && (!self.is_initiator || state != RTCSignalingState::Stable);
        self.flags.ignore_offer.store(ignore, Ordering::SeqCst);
        if ignore {
            warn!(conn = %self.conn, %state, initiator = self.is_initiator, "offer collision, ignoring remote offer");
            self.flags.ignore_offer.store(false, Ordering::SeqCst);
            return Ok(NegotiationOutcome::Ignored);
        }

        {
            // раунд сдвигается под той же блокировкой, что и запись offer,
            // чтобы наш offer в полёте не ушёл
            let mut slot = self.outstanding.lock();
            self.flags.remote_round.fetch_add(1, Ordering::SeqCst);
            if slot.take().is_some() {
                debug!(conn = %self.conn, "own outstanding offer dropped");
            }
        }
        if collision {
            info!(conn = %self.conn, "offer collision, accepting remote offer");
        }

        self.peer
            .set_remote_description(offer)
            .await
            .map_err(rejected)?;
        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer).await?;

        wait_for_gathering(self.peer.as_ref(), self.renegotiation_timeout, None).await;

        let local = self.finished_local().await?;
        reply.send_description(local).await?;
        info!(conn = %self.conn, "renegotiation answer sent");
        Ok(NegotiationOutcome::Answered)
    }
}
