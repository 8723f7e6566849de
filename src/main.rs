//! pairlink - Main entry point
//!
//! Runs the rendezvous server, or one of the two pairing endpoints.

mod args;

use args::{Args, Mode};
use base64::Engine;
use clap::Parser;
use log::{error, info, warn};
use pairlink::config::Config;
use pairlink::{
    run_rendezvous_server, Command, EndpointError, InboundEvent, ReceiverEndpoint, SenderEndpoint, SignalError,
};
use serde_json::json;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();
    let loaded = args.load_config();

    // Initialize logging with noise filtering for third-party WebRTC crates
    let default_level = match (&loaded, args.verbose) {
        (_, true) => "debug".to_string(),
        (Ok(cfg), false) => cfg.logging.level.clone(),
        (Err(_), false) => "info".to_string(),
    };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("PAIRLINK_LOG").unwrap_or(default_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .filter_module("webrtc_sctp", log::LevelFilter::Error)
        .init();

    info!("pairlink v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match loaded {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };
    args.apply_overrides(&mut config);

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    match args.mode {
        Mode::Serve { .. } => serve(config).await,
        Mode::Receive { .. } => receive(config).await,
        Mode::Send { code, file, .. } => send(config, code, file).await,
    }
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    tokio::select! {
        result = run_rendezvous_server(&config.server) => result,
        _ = signal::ctrl_c() => {
            info!("Shutting down rendezvous server");
            Ok(())
        }
    }
}

async fn receive(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let receiver = ReceiverEndpoint::new(&config);
    receiver.on_event(|event| println!("{}", render_event(event)));

    let code = register_fresh_code(&receiver, config.endpoint.register_attempts).await?;
    println!("Pairing code: {}", code);

    let mut states = receiver.subscribe();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                receiver.disconnect().await;
                break;
            }
            changed = states.changed() => {
                if changed.is_err() || states.borrow_and_update().is_finished() {
                    break;
                }
            }
        }
    }

    info!("Receiver finished in state {:?}", receiver.state());
    Ok(())
}

/// Register a generated code, trying fresh ones on collision
async fn register_fresh_code(
    receiver: &ReceiverEndpoint,
    attempts: u32,
) -> Result<String, Box<dyn std::error::Error>> {
    for attempt in 1..=attempts.max(1) {
        match receiver.connect().await {
            Ok(code) => return Ok(code),
            Err(EndpointError::Rejected(SignalError::CodeExists)) => {
                warn!("Pairing code collision, retrying ({}/{})", attempt, attempts);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err("Could not register a free pairing code".into())
}

async fn send(config: Config, code: String, file: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let sender = SenderEndpoint::new(&config);
    sender.connect(&code).await?;
    sender
        .wait_until_connected(config.endpoint.negotiation_timeout())
        .await?;
    info!("Connected to receiver");

    if let Some(path) = file {
        let image = tokio::fs::read(&path).await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let frames = sender.send_command(Command::Screenshot(encoded)).await?;
        info!("Sent {:?} as screenshot in {} frame(s)", path, frames);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut states = sender.subscribe();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let Some(command) = command_from_line(&line) else {
                        continue;
                    };
                    if let Err(e) = sender.send_command(command).await {
                        error!("Send failed: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Reading stdin: {}", e);
                    break;
                }
            },
            changed = states.changed() => {
                if changed.is_err() || states.borrow_and_update().is_finished() {
                    info!("Pairing ended");
                    break;
                }
            }
        }
    }

    sender.disconnect().await;
    Ok(())
}

/// Map one stdin line to a command; blank lines send nothing
fn command_from_line(line: &str) -> Option<Command> {
    match line.trim() {
        "" => None,
        "/up" => Some(Command::ScrollUp),
        "/down" => Some(Command::ScrollDown),
        "/answer" => Some(Command::QuickAnswer),
        _ => Some(Command::Clipboard(line.to_string())),
    }
}

/// One JSON line per inbound event; screenshots are summarised
fn render_event(event: InboundEvent) -> String {
    match event {
        InboundEvent::Command(Command::Screenshot(image)) => {
            json!({"type": Command::SCREENSHOT, "length": image.len()}).to_string()
        }
        InboundEvent::Command(command) => {
            let (kind, data) = command.into_parts();
            json!({"type": kind, "data": data}).to_string()
        }
        InboundEvent::Text(event) => event
            .to_json()
            .unwrap_or_else(|e| json!({"error": e.to_string()}).to_string()),
    }
}
