//! Long-running announcement listener mode
//!
//! This module implements a foreground service that:
//! - Listens for locker announcements on the configured UDP port
//! - Periodically broadcasts discovery requests
//! - Handles graceful shutdown via SIGTERM/SIGINT

use anyhow::{Context, Result};
use armario_core::config::ListenerConfig;
use armario_core::AnnouncementListener;
use tokio::time::{Duration, interval};

pub struct ListenOptions {
    pub seconds: Option<u64>,
    pub request: bool,
    pub interval_secs: u64,
    pub json: bool,
}

/// Run the listener until interrupted or until `seconds` elapse, then
/// print what was heard.
pub async fn run_listener(config: ListenerConfig, options: ListenOptions) -> Result<()> {
    let mut listener = AnnouncementListener::new(config);
    listener
        .start()
        .await
        .context("Failed to start announcement listener")?;

    let local_addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    tracing::info!(
        "Listening for announcements on {}{}",
        local_addr,
        options
            .seconds
            .map(|s| format!(" for {}s", s))
            .unwrap_or_default()
    );

    let deadline = async {
        match options.seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut request_interval = interval(Duration::from_secs(options.interval_secs.max(1)));
    let mut known = 0;

    loop {
        tokio::select! {
            _ = request_interval.tick() => {
                if options.request {
                    if let Err(e) = listener.request_announcements().await {
                        tracing::warn!("Discovery request failed: {}", e);
                    }
                }

                let devices = listener.snapshot().await;
                if devices.len() != known {
                    tracing::info!("{} locker(s) heard so far", devices.len());
                    known = devices.len();
                }
            }
            _ = &mut deadline => {
                tracing::debug!("Listen window elapsed");
                break;
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, stopping listener");
                break;
            }
        }
    }

    listener.shutdown();
    let devices = listener.snapshot().await;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else {
        println!("Heard {} locker(s):", devices.len());
        for device in &devices {
            println!(
                "  {:15} {:20} last seen {}",
                device.address,
                device.identity,
                device.last_seen.format("%H:%M:%S")
            );
        }
    }

    Ok(())
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM");
            }
            Err(e) => {
                tracing::error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => {}
    }
}
