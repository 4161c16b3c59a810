use crate::peer::state::ConnectionPhase;
use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Роль описания в ручном обмене
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpRole {
    Offer,
    Answer,
}

impl SdpRole {
    pub fn matches(&self, sdp_type: RTCSdpType) -> bool {
        matches!(
            (self, sdp_type),
            (SdpRole::Offer, RTCSdpType::Offer) | (SdpRole::Answer, RTCSdpType::Answer)
        )
    }
}

/// Описание сессии для передачи вручную: `{ "type": "offer"|"answer", "data": {...} }`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionDescriptor {
    #[serde(rename = "type")]
    pub role: SdpRole,
    #[serde(rename = "data")]
    pub payload: RTCSessionDescription,
}

impl SessionDescriptor {
    pub fn offer(payload: RTCSessionDescription) -> Self {
        Self {
            role: SdpRole::Offer,
            payload,
        }
    }

    pub fn answer(payload: RTCSessionDescription) -> Self {
        Self {
            role: SdpRole::Answer,
            payload,
        }
    }
}

impl PartialEq for SessionDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.role == other.role
            && self.payload.sdp_type == other.payload.sdp_type
            && self.payload.sdp == other.payload.sdp
    }
}

/// Сообщение control-канала. Разбирается по полю `type`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Chat {
        text: String,
        #[serde(rename = "timestamp")]
        sent_at: i64,
    },
    Negotiation {
        description: RTCSessionDescription,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Remote,
}

/// Запись в журнале чата
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub text: String,
    pub sent_at: i64,
    pub origin: Origin,
}

/// События для UI/хоста
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Phase(ConnectionPhase),
    Progress { label: String, percent: u8 },
    Message(ChatEntry),
    RemoteTrack {
        kind: String,
        track_id: String,
        stream_id: String,
    },
    ConnectionProblem,
    ConnectionRecovering,
    ConnectionRecovered,
    ConnectionFailed,
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}
