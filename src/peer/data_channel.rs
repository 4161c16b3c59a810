use crate::error::{Error, Result};
use crate::logger::EventBus;
use crate::peer::negotiation::{NegotiationOutcome, NegotiationSink, Negotiator};
use crate::peer::transport::{DataPipe, PeerTransport};
use crate::peer::types::{ChatEntry, ControlMessage, Origin};
use crate::utils::now_ms;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Журнал чата. Каждая запись сразу уходит хосту.
pub struct Transcript {
    entries: Mutex<Vec<ChatEntry>>,
    bus: EventBus,
}

impl Transcript {
    pub fn new(bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            bus,
        })
    }

    pub fn push(&self, entry: ChatEntry) {
        self.entries.lock().push(entry.clone());
        self.bus.emit_message(entry);
    }

    pub fn entries(&self) -> Vec<ChatEntry> {
        self.entries.lock().clone()
    }
}

/// Что произошло с входящим сообщением
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Chat,
    Negotiation(NegotiationOutcome),
    /// Нераспознанное сообщение или ошибка его обработки
    Dropped,
}

/// Control-канал: чат и сообщения согласования поверх одного data channel
pub struct ControlChannel {
    pipe: Arc<dyn DataPipe>,
    transcript: Arc<Transcript>,
}

impl ControlChannel {
    /// Сторона-инициатор: канал создаётся до offer, чтобы попасть в описание
    pub async fn open(
        peer: &dyn PeerTransport,
        label: &str,
        transcript: Arc<Transcript>,
    ) -> Result<Arc<Self>> {
        let pipe = peer.create_data_channel(label).await?;
        debug!(label, "control channel created");
        Ok(Arc::new(Self { pipe, transcript }))
    }

    /// Сторона, принимающая канал от удалённого пира
    pub fn accept(pipe: Arc<dyn DataPipe>, transcript: Arc<Transcript>) -> Arc<Self> {
        debug!(label = %pipe.label(), "control channel accepted");
        Arc::new(Self { pipe, transcript })
    }

    pub fn label(&self) -> String {
        self.pipe.label()
    }

    pub fn is_open(&self) -> bool {
        self.pipe.is_open()
    }

    pub fn transcript(&self) -> &Arc<Transcript> {
        &self.transcript
    }

    /// Отправка чата. В транскрипт попадает только отправленное.
    pub async fn send(&self, text: &str) -> Result<ChatEntry> {
        if !self.pipe.is_open() {
            warn!("chat message dropped, control channel is not open");
            return Err(Error::ChannelNotReady);
        }
        let sent_at = now_ms();
        let raw = serde_json::to_string(&ControlMessage::Chat {
            text: text.to_string(),
            sent_at,
        })
        .map_err(|e| Error::MalformedCode(format!("serialize chat: {e}")))?;

        let entry = ChatEntry {
            text: text.to_string(),
            sent_at,
            origin: Origin::Local,
        };
        self.pipe.send_text(raw).await?;
        self.transcript.push(entry.clone());
        Ok(entry)
    }

    pub async fn send_negotiation(&self, description: RTCSessionDescription) -> Result<()> {
        if !self.pipe.is_open() {
            warn!(kind = %description.sdp_type, "negotiation message dropped, control channel is not open");
            return Err(Error::ChannelNotReady);
        }
        let kind = description.sdp_type;
        let raw = serde_json::to_string(&ControlMessage::Negotiation { description })
            .map_err(|e| Error::InvalidDescription(format!("serialize negotiation: {e}")))?;
        self.pipe.send_text(raw).await?;
        debug!(%kind, "negotiation message sent");
        Ok(())
    }

    /// Разбор входящего сообщения. Ошибки не выходят наружу.
    pub async fn route(&self, raw: &str, negotiator: &Negotiator) -> Routed {
        let msg = match serde_json::from_str::<ControlMessage>(raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, len = raw.len(), "dropping unreadable control message");
                return Routed::Dropped;
            }
        };

        match msg {
            ControlMessage::Chat { text, sent_at } => {
                self.transcript.push(ChatEntry {
                    text,
                    sent_at,
                    origin: Origin::Remote,
                });
                Routed::Chat
            }
            ControlMessage::Negotiation { description } => {
                info!(kind = %description.sdp_type, "negotiation message received");
                match negotiator.handle_remote(description, self).await {
                    Ok(outcome) => Routed::Negotiation(outcome),
                    Err(e) => {
                        // сессия остаётся в последнем стабильном состоянии
                        warn!(error = %e, "renegotiation round failed");
                        Routed::Dropped
                    }
                }
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.pipe.close().await
    }
}

#[async_trait]
impl NegotiationSink for ControlChannel {
    async fn send_description(&self, desc: RTCSessionDescription) -> Result<()> {
        self.send_negotiation(desc).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::peer::loopback::LoopbackHub;
    use crate::media::{MediaProvider, SyntheticMedia};
    use crate::peer::types::SessionEvent;
    use std::sync::atomic::Ordering;
    use webrtc::peer_connection::signaling_state::RTCSignalingState;

    #[tokio::test]
    async fn send_before_open_is_not_ready() {
        let hub = LoopbackHub::new();
        let (peer, _rx) = hub.spawn_peer();
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let ch = ControlChannel::open(peer.as_ref(), "chat", Transcript::new(bus))
            .await
            .unwrap();

        assert!(matches!(ch.send("hi").await, Err(Error::ChannelNotReady)));
        assert!(ch.transcript().entries().is_empty());
        assert!(peer.channel().unwrap().sent().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn open_channel_echoes_locally() {
        let hub = LoopbackHub::new();
        let (peer, _rx) = hub.spawn_peer();
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let ch = ControlChannel::open(peer.as_ref(), "chat", Transcript::new(bus))
            .await
            .unwrap();
        let pipe = peer.channel().unwrap();
        pipe.open.store(true, std::sync::atomic::Ordering::SeqCst);

        let entry = ch.send("hi").await.unwrap();
        assert_eq!(entry.origin, Origin::Local);
        assert_eq!(ch.transcript().entries(), vec![entry.clone()]);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Message(entry));

        let wire: serde_json::Value = serde_json::from_str(&pipe.sent()[0]).unwrap();
        assert_eq!(wire["type"], "chat");
        assert_eq!(wire["text"], "hi");
    }

    #[tokio::test]
    async fn routing_sorts_and_drops() {
        let hub = LoopbackHub::new();
        let (peer, _rx) = hub.spawn_peer();
        let neg = Negotiator::new("t", peer.clone(), false, &Config::default());
        let ch = ControlChannel::open(peer.as_ref(), "chat", Transcript::new(EventBus::new()))
            .await
            .unwrap();

        let routed = ch
            .route(r#"{"type":"chat","text":"привет","timestamp":42}"#, &neg)
            .await;
        assert_eq!(routed, Routed::Chat);
        assert_eq!(
            ch.transcript().entries(),
            vec![ChatEntry {
                text: "привет".into(),
                sent_at: 42,
                origin: Origin::Remote
            }]
        );

        for junk in ["", "{", r#"{"type":"file"}"#, r#"{"type":"chat"}"#] {
            assert_eq!(ch.route(junk, &neg).await, Routed::Dropped);
        }
        assert_eq!(ch.transcript().entries().len(), 1);

        // answer без нашего offer отбрасывается машиной согласования
        let stale = r#"{"type":"negotiation","description":{"type":"answer","sdp":"loopback peer=7 rev=1 channel=- tracks=-"}}"#;
        assert_eq!(
            ch.route(stale, &neg).await,
            Routed::Negotiation(NegotiationOutcome::Ignored)
        );
    }

    /// Канал, который закрылся между проверкой и отправкой
    struct ClosingPipe;

    #[async_trait]
    impl DataPipe for ClosingPipe {
        fn label(&self) -> String {
            "chat".into()
        }

        fn is_open(&self) -> bool {
            true
        }

        async fn send_text(&self, _text: String) -> Result<()> {
            Err(Error::ChannelNotReady)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_send_leaves_no_local_echo() {
        let ch = ControlChannel::accept(Arc::new(ClosingPipe), Transcript::new(EventBus::new()));
        assert!(matches!(ch.send("lost").await, Err(Error::ChannelNotReady)));
        assert!(ch.transcript().entries().is_empty());
    }

    /// Оба конца после первого рукопожатия, каналы открыты
    async fn linked_channels() -> (
        Arc<crate::peer::loopback::LoopbackPeer>,
        Arc<ControlChannel>,
        Arc<Negotiator>,
        Arc<crate::peer::loopback::LoopbackPeer>,
        Arc<ControlChannel>,
        Arc<Negotiator>,
    ) {
        let hub = LoopbackHub::new();
        let cfg = Config::default();
        let (a, a_rx) = hub.spawn_peer();
        let (b, b_rx) = hub.spawn_peer();
        // очереди событий здесь не нужны
        drop((a_rx, b_rx));

        let a_ch = ControlChannel::open(a.as_ref(), "chat", Transcript::new(EventBus::new()))
            .await
            .unwrap();
        let a_neg = Negotiator::new("a", a.clone(), true, &cfg);
        let b_neg = Negotiator::new("b", b.clone(), false, &cfg);
        let progress = EventBus::new().progress();
        let offer = a_neg.initial_offer(&progress).await.unwrap();
        let answer = b_neg.initial_answer(offer, &progress).await.unwrap();
        a_neg.apply_answer(answer).await.unwrap();

        let b_ch = ControlChannel::accept(b.channel().unwrap(), Transcript::new(EventBus::new()));
        assert!(a_ch.is_open() && b_ch.is_open());
        a_neg.arm(a_ch.clone());
        b_neg.arm(b_ch.clone());
        (a, a_ch, a_neg, b, b_ch, b_neg)
    }

    #[tokio::test]
    async fn rejected_offer_over_channel_is_dropped() {
        let (a, a_ch, a_neg, _b, _b_ch, _b_neg) = linked_channels().await;
        let sent_before = a.channel().unwrap().sent().len();

        let bad = r#"{"type":"negotiation","description":{"type":"offer","sdp":"v=0 garbage"}}"#;
        assert_eq!(a_ch.route(bad, &a_neg).await, Routed::Dropped);
        assert_eq!(a.signaling_state(), RTCSignalingState::Stable);
        assert!(!a_neg.has_outstanding_offer());
        // ответа не было
        assert_eq!(a.channel().unwrap().sent().len(), sent_before);
    }

    #[tokio::test]
    async fn answer_lost_on_closed_channel_keeps_stable_state() {
        let (a, a_ch, a_neg, b, _b_ch, b_neg) = linked_channels().await;
        let stream = SyntheticMedia::default().get_user_media().await.unwrap();
        for track in stream.tracks {
            b.add_track(track).await.unwrap();
        }
        assert_eq!(b_neg.negotiate().await.unwrap(), NegotiationOutcome::Sent);
        let offer = b.channel().unwrap().sent().pop().unwrap();

        a.channel().unwrap().open.store(false, Ordering::SeqCst);
        assert_eq!(a_ch.route(&offer, &a_neg).await, Routed::Dropped);
        assert_eq!(a.signaling_state(), RTCSignalingState::Stable);

        // канал вернулся, следующий раунд проходит
        a.channel().unwrap().open.store(true, Ordering::SeqCst);
        let stream = SyntheticMedia::default().get_user_media().await.unwrap();
        for track in stream.tracks {
            a.add_track(track).await.unwrap();
        }
        assert_eq!(a_neg.negotiate().await.unwrap(), NegotiationOutcome::Sent);
    }
}
