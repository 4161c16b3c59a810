//! Чат и видео между двумя узлами поверх WebRTC без сигнального сервера:
//! описания сессии передаются вручную (ссылка и код ответа), дальше всё
//! идёт по data channel.

pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::Config;
pub use error::{Error, Result};
pub use peer::state::ConnectionPhase;
pub use peer::types::{ChatEntry, Origin, SessionDescriptor, SessionEvent};
pub use session::Session;
