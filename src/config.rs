// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::{Error, Result};
use crate::peer::types::ServerConfig;
use crate::utils::add_ice_url_scheme;
use std::time::Duration;
use tracing::warn;
use webrtc::ice_transport::ice_server::RTCIceServer;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене только предупреждения

pub const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_LINK_BASE: &str = "http://localhost:5173/";
pub const DEFAULT_CHANNEL_LABEL: &str = "chat";

/// Первое рукопожатие может ждать кандидатов дольше
pub const INITIAL_GATHER_TIMEOUT: Duration = Duration::from_secs(5);
pub const RENEGOTIATION_GATHER_TIMEOUT: Duration = Duration::from_secs(2);

/// Период ожидания перед объявлением соединения потерянным
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Config {
    pub ice_servers: Vec<ServerConfig>,
    pub initial_gather_timeout: Duration,
    pub renegotiation_gather_timeout: Duration,
    pub grace_period: Duration,
    /// Адрес страницы, на которой строится ссылка с offer
    pub link_base: String,
    pub channel_label: String,
    /// gzip перед base64
    pub compress_tokens: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: vec![ServerConfig {
                id: "default-stun".into(),
                r#type: "stun".into(),
                url: DEFAULT_STUN.into(),
                username: None,
                credential: None,
            }],
            initial_gather_timeout: INITIAL_GATHER_TIMEOUT,
            renegotiation_gather_timeout: RENEGOTIATION_GATHER_TIMEOUT,
            grace_period: GRACE_PERIOD,
            link_base: DEFAULT_LINK_BASE.into(),
            channel_label: DEFAULT_CHANNEL_LABEL.into(),
            compress_tokens: true,
        }
    }
}

impl Config {
    /// Значения по умолчанию, переопределённые переменными окружения `SSC_*`
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(raw) = std::env::var("SSC_ICE_SERVERS") {
            let servers: Vec<ServerConfig> = serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("SSC_ICE_SERVERS: {e}")))?;
            cfg = cfg.with_ice_servers(servers)?;
        }
        if let Ok(base) = std::env::var("SSC_LINK_BASE") {
            url::Url::parse(&base)?;
            cfg.link_base = base;
        }
        if let Some(d) = env_millis("SSC_GATHER_TIMEOUT_MS")? {
            cfg.initial_gather_timeout = d;
        }
        if let Some(d) = env_millis("SSC_RENEGOTIATION_TIMEOUT_MS")? {
            cfg.renegotiation_gather_timeout = d;
        }
        if let Some(d) = env_millis("SSC_GRACE_PERIOD_MS")? {
            cfg.grace_period = d;
        }
        Ok(cfg)
    }

    /// Устанавливает пользовательские ICE серверы после валидации
    pub fn with_ice_servers(mut self, servers: Vec<ServerConfig>) -> Result<Self> {
        for server in &servers {
            if server.url.is_empty() {
                return Err(Error::Config("server URL cannot be empty".into()));
            }

            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(Error::Config(format!(
                    "TURN server {} requires username and credential",
                    server.url
                )));
            }
        }
        if servers.is_empty() {
            warn!("no ICE servers configured, only host candidates will be gathered");
        }
        self.ice_servers = servers;
        Ok(self)
    }

    /// Серверы в формате webrtc
    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .map(|config| RTCIceServer {
                urls: vec![add_ice_url_scheme(config)],
                username: config.username.clone().unwrap_or_default(),
                credential: config.credential.clone().unwrap_or_default(),
            })
            .collect()
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| Error::Config(format!("{key}: {e}"))),
        Err(_) => Ok(None),
    }
}
