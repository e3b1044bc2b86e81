//! Example: follow a Tor data directory
//!
//! Waits for Tor to publish its control port in the given directory,
//! connects, prints the version and listeners, then reports bootstrap
//! progress and log notices until interrupted.
//!
//! Run with: cargo run --example watch -- /var/lib/tor

use std::sync::Arc;
use tor_control_client::{
    ControlSession, EventType, Result, SessionState, TorControlConfig, TorControlObserver,
    TorEvent,
};

struct Printer;

impl TorControlObserver for Printer {
    fn on_ready(&self) {
        println!("[READY] control connection authenticated");
    }

    fn on_closed(&self, was_running: bool) {
        println!("[CLOSED] running={was_running}");
    }

    fn on_event(&self, event: &TorEvent) {
        if let Some(progress) = event.bootstrap_progress() {
            println!("[BOOTSTRAP] {progress}%");
        } else if let Some(log) = event.log() {
            println!("[LOG:{}] {}", log.severity.as_str(), log.message);
        } else if let Some(up) = event.network_liveness() {
            println!("[NETWORK] {}", if up { "up" } else { "down" });
        } else {
            println!("[{}] {}", event.event, event.initial);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tor_control_client=info".into()),
        )
        .init();

    let dir = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/var/lib/tor".to_string());

    let session = ControlSession::new(TorControlConfig::new().watch_dir(&dir))?;
    session.add_observer(Arc::new(Printer));
    session.start_configured().await?;
    println!("Watching {dir} for the control port...");

    session.wait_for_state(SessionState::Connected).await?;
    println!("\nTor version: {}", session.get_version().await?);
    match session.get_socks_listeners().await {
        Ok(listeners) => println!("SOCKS listeners: {}", listeners.join(", ")),
        Err(e) => println!("SOCKS listeners unavailable: {e}"),
    }
    println!("Circuit established: {}", session.get_circuit_established().await?);

    // Subscriptions are restored automatically after a reconnect.
    for event in [EventType::StatusClient, EventType::Notice, EventType::NetworkLiveness] {
        session.subscribe(event).await?;
    }

    let mut states = session.state_changes();
    while states.changed().await.is_ok() {
        println!("[STATE] {}", *states.borrow_and_update());
    }
    Ok(())
}
