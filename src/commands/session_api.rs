use crate::commands::chat::{chat_loop, print_events, read_line};
use crate::config::Config;
use crate::error::Error;
use crate::peer::state::ConnectionPhase;
use crate::session::Session;
use crate::signaling;
use anyhow::{bail, Context};
use std::time::Duration;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tracing::debug;

/// Сколько ждём установления соединения после обмена кодами
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

fn settled(p: &ConnectionPhase) -> bool {
    matches!(p, ConnectionPhase::Connected | ConnectionPhase::Failed)
}

async fn wait_connected(session: &Session) -> anyhow::Result<()> {
    match session.wait_for_phase(settled, CONNECT_TIMEOUT).await {
        Some(ConnectionPhase::Connected) => Ok(()),
        Some(phase) => bail!("connection {phase}"),
        None => bail!("connection not established within {}s", CONNECT_TIMEOUT.as_secs()),
    }
}

pub async fn create(config: Config) -> anyhow::Result<()> {
    let session = Session::new(config);
    let printer = tokio::spawn(print_events(session.subscribe()));
    let mut lines = BufReader::new(stdin()).lines();

    let link = session
        .create_session()
        .await
        .context("failed to create session")?;
    println!("\nShare this link with your peer:\n\n{link}\n");

    loop {
        println!("Paste the answer code and press Enter:");
        let Some(code) = read_line(&mut lines).await? else {
            session.close().await.ok();
            bail!("stdin closed before an answer was entered");
        };
        if code.is_empty() {
            continue;
        }
        match session.submit_answer(&code).await {
            Ok(()) => break,
            Err(e @ (Error::MalformedCode(_) | Error::InvalidDescription(_)))
                if session.phase() == ConnectionPhase::AwaitingRemoteCode =>
            {
                eprintln!("✗ {e}, try again");
            }
            Err(e) => return Err(e).context("failed to apply answer"),
        }
    }

    wait_connected(&session).await?;
    chat_loop(&session, &mut lines).await?;
    session.close().await.ok();
    printer.abort();
    Ok(())
}

pub async fn join(config: Config, code: &str) -> anyhow::Result<()> {
    let session = Session::new(config);
    let printer = tokio::spawn(print_events(session.subscribe()));
    let mut lines = BufReader::new(stdin()).lines();

    let answer = session
        .join_link(code)
        .await
        .context("failed to join session")?;
    println!("\nSend this answer code back to your peer:\n\n{answer}\n");

    wait_connected(&session).await?;
    chat_loop(&session, &mut lines).await?;
    session.close().await.ok();
    printer.abort();
    Ok(())
}

pub fn decode(code: &str) -> anyhow::Result<()> {
    let descriptor = signaling::parse_code(code)?;
    debug!(role = ?descriptor.role, sdp_len = descriptor.payload.sdp.len(), "decoded session code");
    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(())
}
