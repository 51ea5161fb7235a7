//! Net Console
//!
//! Runs one voice session over the in-memory loopback transport and serves
//! the control surface, so the routing, discipline and PTT behaviour can be
//! driven from a browser or curl without a media server.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voicenet::{
    audio::list_devices,
    config::AppConfig,
    protocol::{Discipline, NetType, Operator, VoiceNet},
    session::ConnectParams,
    transport::LoopbackSession,
    ui::WebServer,
    VoiceSession,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting voice net console");

    let mut config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => AppConfig::load(&path)?,
        None => AppConfig::load_or_default()?,
    };
    seed_defaults(&mut config);

    println!("\n=== Audio Devices ===");
    let devices = list_devices();
    if devices.is_empty() {
        println!("  (none; build with --features host-audio to enumerate)");
    }
    for device in &devices {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}", device.name, default_marker);
        println!("    ID: {}", device.id);
    }

    println!("\n=== Nets ===");
    for net in &config.nets {
        println!("  {:<10} {:<20} {}", net.code, net.label, net.discipline);
    }
    println!();

    let session = Arc::new(VoiceSession::new(
        Arc::new(LoopbackSession::new()),
        &config,
    ));

    if let Some(first) = config.nets.first() {
        session
            .connect(ConnectParams {
                session_token: "netconsole".to_string(),
                net_id: first.code.clone(),
                endpoint_url: None,
            })
            .await?;
        tracing::info!("Joined {} as {}", first.code, config.operator.callsign);
    }

    let server = WebServer::new(config.ui.clone(), session.clone());
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
    }

    session.disconnect().await?;
    Ok(())
}

/// A roster and operator to play with when the config file has none
fn seed_defaults(config: &mut AppConfig) {
    if config.operator.user_id.is_empty() {
        config.operator = Operator::new("console", "Console")
            .with_rank(5)
            .with_command_net("COMMAND");
    }

    if config.nets.is_empty() {
        config.nets = vec![
            VoiceNet::new("COMMAND", "Command", Discipline::CommandOnly)
                .with_type(NetType::Command)
                .with_priority(1),
            VoiceNet::new("ALPHA", "Alpha Squad", Discipline::PushToTalk)
                .with_type(NetType::Squad)
                .with_priority(2),
            VoiceNet::new("BRAVO", "Bravo Squad", Discipline::PushToTalk)
                .with_type(NetType::Squad)
                .with_priority(2),
            VoiceNet::new("LOGI", "Logistics", Discipline::RequestToSpeak)
                .with_type(NetType::Support),
            VoiceNet::new("GENERAL", "General", Discipline::Open)
                .with_type(NetType::General)
                .with_priority(5),
        ];
    }
}
