use std::sync::Arc;

use bioconsole::config::{self, AppConfig};
use bioconsole::mqtt::{Handler, MqttService, RetryPolicy};
use color_eyre::Result;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = config::default_config_path();
    let app_config = AppConfig::load(&config_path)?;

    let service = MqttService::new();
    spawn_banner_logger(&service);

    match app_config.mqtt.as_ref() {
        Some(settings) => match settings.broker_config() {
            Some(broker) => {
                if let Err(e) = service.connect(&broker, &RetryPolicy::default()).await {
                    warn!(error = %e, "running without broker; registrations are kept for a later connect");
                }
                if !settings.watch_topics.is_empty() {
                    info!(topics = ?settings.watch_topics, "watching cluster topics");
                    service.subscribe_to_topic(&settings.watch_topics, console_handler(), "console");
                }
            }
            None => info!("mqtt config lists no hosts, staying offline"),
        },
        None => info!("no [mqtt] config section, staying offline"),
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    service.teardown();
    Ok(())
}

/// Logs every watched message. Retained messages are skipped so a restart
/// does not replay stale readings into the log.
fn console_handler() -> Handler {
    Arc::new(|topic, payload, meta| {
        if meta.retain {
            return;
        }
        match std::str::from_utf8(payload) {
            Ok(text) => info!(%topic, %text, "message"),
            Err(_) => info!(%topic, bytes = payload.len(), "binary message"),
        }
    })
}

/// Surfaces connection-banner changes in the log until a UI is attached.
fn spawn_banner_logger(service: &MqttService) {
    let mut status_rx = service.status();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            if let Some(banner) = status.error_messages.last() {
                warn!(state = ?status.connection_state, %banner, "mqtt status");
            }
        }
    });
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
