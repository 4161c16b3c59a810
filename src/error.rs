//! Ошибки сессии.
//!
//! Первые шесть вариантов соответствуют условиям, которые видит пользователь
//! (неверный код, отклонённое описание, канал не готов и т.д.), остальные
//! оборачивают ошибки нижних слоёв.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Вставленный код не декодируется в описание сессии. Пользователь может ввести код заново.
    #[error("malformed session code: {0}")]
    MalformedCode(String),

    /// Удалённое описание отклонено соединением.
    #[error("remote description rejected: {0}")]
    InvalidDescription(String),

    /// Попытка отправки до открытия канала; сообщение отброшено.
    #[error("control channel is not open")]
    ChannelNotReady,

    #[error("no active connection")]
    NoActiveConnection,

    #[error("media capture permission denied")]
    PermissionDenied,

    #[error("media device unavailable: {0}")]
    MediaDeviceUnavailable(String),

    #[error("webrtc: {0}")]
    Transport(#[from] webrtc::Error),

    #[error("configuration: {0}")]
    Config(String),

    #[error("session link: {0}")]
    Link(#[from] url::ParseError),
}

impl Error {
    /// Ошибки, после которых пользователь может просто повторить ввод.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MalformedCode(_) | Error::ChannelNotReady | Error::PermissionDenied
        )
    }
}
