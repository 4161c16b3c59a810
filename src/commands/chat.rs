use crate::peer::types::{ChatEntry, Origin, SessionEvent};
use crate::session::Session;
use chrono::{DateTime, Local};
use tokio::io::{AsyncBufRead, Lines};
use tokio::sync::broadcast;

/// Команда, введённая в чате
#[derive(Debug, PartialEq, Eq)]
pub enum Input<'a> {
    Chat(&'a str),
    VideoOn,
    VideoOff,
    Quit,
    Unknown(&'a str),
}

pub fn parse_input(line: &str) -> Input<'_> {
    match line.trim() {
        "/quit" | "/exit" => Input::Quit,
        "/video on" => Input::VideoOn,
        "/video off" => Input::VideoOff,
        cmd if cmd.starts_with('/') => Input::Unknown(cmd),
        text => Input::Chat(text),
    }
}

pub async fn read_line<R: AsyncBufRead + Unpin>(
    lines: &mut Lines<R>,
) -> std::io::Result<Option<String>> {
    Ok(lines.next_line().await?.map(|l| l.trim().to_string()))
}

fn clock(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.with_timezone(&Local).format("%H:%M").to_string())
        .unwrap_or_default()
}

fn format_entry(entry: &ChatEntry) -> String {
    let who = match entry.origin {
        Origin::Local => "you",
        Origin::Remote => "peer",
    };
    format!("[{}] {who}> {}", clock(entry.sent_at), entry.text)
}

/// Печатает события сессии, пока канал не закрыт
pub async fn print_events(mut rx: broadcast::Receiver<SessionEvent>) {
    loop {
        let evt = match rx.recv().await {
            Ok(evt) => evt,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                eprintln!("… {n} events skipped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match evt {
            SessionEvent::Progress { label, percent } => eprintln!("[{percent:>3}%] {label}"),
            SessionEvent::Phase(phase) => eprintln!("· {phase}"),
            SessionEvent::Message(entry) if entry.origin == Origin::Remote => {
                println!("{}", format_entry(&entry))
            }
            SessionEvent::Message(_) => {}
            SessionEvent::RemoteTrack { kind, track_id, .. } => {
                eprintln!("· peer started {kind} ({track_id})")
            }
            SessionEvent::ConnectionProblem => eprintln!("⚠ connection issues detected"),
            SessionEvent::ConnectionRecovering => eprintln!("… trying to recover"),
            SessionEvent::ConnectionRecovered => eprintln!("✓ connection recovered"),
            SessionEvent::ConnectionFailed => eprintln!("✗ connection lost"),
        }
    }
}

/// Интерактивный чат до `/quit` или конца ввода
pub async fn chat_loop<R: AsyncBufRead + Unpin>(
    session: &Session,
    lines: &mut Lines<R>,
) -> anyhow::Result<()> {
    eprintln!("Connected. Type to chat, /video on|off, /quit to leave.");
    while let Some(line) = read_line(lines).await? {
        match parse_input(&line) {
            Input::Quit => break,
            Input::Chat("") => {}
            Input::Chat(text) => match session.send_chat(text).await {
                Ok(entry) => println!("{}", format_entry(&entry)),
                Err(e) if e.is_recoverable() => eprintln!("✗ {e}, message not sent"),
                Err(e) => return Err(e.into()),
            },
            Input::VideoOn => match session.start_local_media().await {
                Ok(()) => eprintln!("· local media on"),
                Err(e) => eprintln!("✗ {e}"),
            },
            Input::VideoOff => match session.stop_local_media().await {
                Ok(()) => eprintln!("· local media off"),
                Err(e) => eprintln!("✗ {e}"),
            },
            Input::Unknown(cmd) => eprintln!("unknown command {cmd}"),
        }
    }
    Ok(())
}
