//! Командная строка `ssc`: вместо окна Tauri.

pub mod chat;
pub mod session_api;

use crate::config::Config;
use crate::peer::types::ServerConfig;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "ssc",
    about = "Serverless peer-to-peer chat over WebRTC with copy/paste signaling",
    author,
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub network: NetworkArgs,

    #[arg(
        long = "log-level",
        global = true,
        env = "SSC_LOG_LEVEL",
        help = "Log filter when RUST_LOG is not set (error, warn, info, debug, trace)"
    )]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct NetworkArgs {
    #[arg(
        long = "ice-server",
        value_name = "URL",
        global = true,
        help = "STUN/TURN server, repeatable (replaces the default STUN server)"
    )]
    pub ice_servers: Vec<String>,

    #[arg(long, global = true, help = "Username for TURN servers")]
    pub turn_username: Option<String>,

    #[arg(long, global = true, help = "Credential for TURN servers")]
    pub turn_credential: Option<String>,

    #[arg(
        long,
        value_name = "URL",
        global = true,
        help = "Page the shareable link is built on"
    )]
    pub link_base: Option<String>,

    #[arg(long, global = true, help = "Do not gzip session codes")]
    pub no_compress: bool,
}

impl NetworkArgs {
    /// Переопределяет конфигурацию из окружения флагами
    pub fn apply(&self, mut config: Config) -> crate::error::Result<Config> {
        if !self.ice_servers.is_empty() {
            let servers = self
                .ice_servers
                .iter()
                .enumerate()
                .map(|(i, url)| {
                    let is_turn = url.starts_with("turn");
                    ServerConfig {
                        id: format!("cli-{i}"),
                        r#type: if is_turn { "turn" } else { "stun" }.into(),
                        url: url.clone(),
                        username: self.turn_username.clone().filter(|_| is_turn),
                        credential: self.turn_credential.clone().filter(|_| is_turn),
                    }
                })
                .collect();
            config = config.with_ice_servers(servers)?;
        }
        if let Some(base) = &self.link_base {
            url::Url::parse(base)?;
            config.link_base = base.clone();
        }
        if self.no_compress {
            config.compress_tokens = false;
        }
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a session: prints a link, then waits for the answer code
    Create,
    /// Join a session from a link or a bare offer code; prints the answer code
    Join {
        #[arg(value_name = "LINK|TOKEN")]
        code: String,
    },
    /// Decode a link or code and print the session description as JSON
    Decode {
        #[arg(value_name = "LINK|TOKEN")]
        code: String,
    },
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.network.apply(Config::from_env()?)?;
    match cli.command {
        Command::Create => session_api::create(config).await,
        Command::Join { code } => session_api::join(config, &code).await,
        Command::Decode { code } => session_api::decode(&code),
    }
}
