//! Armario CLI - locker discovery and control for condominium package delivery
//!
//! This binary can:
//! - Sweep the local network for locker controllers
//! - Probe a single address
//! - Listen for locker announcements
//! - Relay commands to a locker
//! - Serve the HTTP gateway used by the web application

mod daemon;
mod server;

use anyhow::{Context, Result};
use armario_core::{
    AnnouncementListener, DeviceScanner, LockerAction, LockerClient, config, scanner,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "armario")]
#[command(author = "Armario Team")]
#[command(version)]
#[command(about = "Discover and control smart lockers on the local network")]
#[command(long_about = "
Armario finds locker controllers (AIRE-ESP32-*) on the local network,
relays commands to them and serves the HTTP gateway the web application
talks to.

Quick start:
  1. Find lockers:      armario scan
  2. Check one:         armario probe 192.168.1.50
  3. Open a door:       armario device 192.168.1.50 open
  4. Run the gateway:   armario serve
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sweep a /24 for lockers
    Scan {
        /// Range to sweep (e.g. 192.168.1 or 192.168.1.0/24)
        #[arg(short, long)]
        prefix: Option<String>,

        /// Derive the range from this client address instead of local interfaces
        #[arg(long)]
        client_ip: Option<String>,

        /// Also collect UDP announcements and merge them into the results
        #[arg(short, long)]
        listen: bool,
    },

    /// Probe a single address for a locker
    Probe {
        /// IPv4 address to probe
        ip: String,
    },

    /// Listen for locker announcements
    Listen {
        /// Stop after this many seconds (default: run until interrupted)
        #[arg(short, long)]
        seconds: Option<u64>,

        /// Broadcast a discovery request on start and every --interval seconds
        #[arg(short, long)]
        request: bool,

        /// Seconds between discovery requests
        #[arg(short, long, default_value = "60")]
        interval: u64,
    },

    /// Send a command to a locker
    Device {
        /// Locker IPv4 address
        ip: String,

        /// status, open (abrir), close (fechar) or reset-wifi
        action: LockerAction,

        /// JSON body forwarded with the command
        #[arg(short, long)]
        body: Option<String>,
    },

    /// Run the HTTP gateway
    Serve {
        /// Address to bind (default from config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Do not start the announcement listener
        #[arg(long)]
        no_listener: bool,
    },

    /// Show configuration paths and settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("armario={},armario_core={},tower_http={}", log_level, log_level, log_level)
                    .into()
            }),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = config::load_config();

    match &cli.command {
        Commands::Scan {
            prefix,
            client_ip,
            listen,
        } => cmd_scan(&cli, config, prefix.clone(), client_ip.clone(), *listen).await,
        Commands::Probe { ip } => cmd_probe(&cli, config, ip).await,
        Commands::Listen {
            seconds,
            request,
            interval,
        } => {
            let listener = daemon::ListenOptions {
                seconds: *seconds,
                request: *request,
                interval_secs: *interval,
                json: matches!(cli.format, OutputFormat::Json),
            };
            daemon::run_listener(config.listener, listener).await
        }
        Commands::Device { ip, action, body } => {
            cmd_device(&cli, config, ip, *action, body.as_deref()).await
        }
        Commands::Serve { bind, no_listener } => {
            cmd_serve(config, bind.clone(), !*no_listener).await
        }
        Commands::Config => cmd_config(&cli, &config),
    }
}

async fn cmd_scan(
    cli: &Cli,
    config: config::ArmarioConfig,
    prefix: Option<String>,
    client_ip: Option<String>,
    listen: bool,
) -> Result<()> {
    let mut device_scanner = DeviceScanner::new(config.scan).context("Failed to set up scanner")?;

    if listen {
        let grace = config.listener.grace_period;
        let mut listener = AnnouncementListener::new(config.listener);
        listener
            .start()
            .await
            .context("Failed to start announcement listener")?;
        device_scanner = device_scanner.with_listener(Arc::new(listener), grace);
    }

    match cli.format {
        OutputFormat::Text => println!("Scanning for lockers..."),
        OutputFormat::Json => {}
    }

    // Create progress callback for text mode
    let progress_callback: Option<scanner::ProgressCallback> = match cli.format {
        OutputFormat::Text => Some(Box::new(|progress: scanner::ScanProgress| {
            if let Some(pct) = progress.percent {
                println!("  [{:>3}%] {}", pct, progress.message);
            } else {
                println!("  {}", progress.message);
            }
        })),
        OutputFormat::Json => None,
    };

    let request = scanner::ScanRequest {
        prefix,
        client_address: client_ip,
    };
    let result = device_scanner
        .scan_network_with_progress(&request, progress_callback)
        .await;

    match cli.format {
        OutputFormat::Text => {
            println!();
            println!("{}", result.message);
            if !result.devices.is_empty() {
                println!();
                for device in &result.devices {
                    let hostname = device
                        .metadata
                        .get("hostname")
                        .and_then(|v| v.as_str())
                        .unwrap_or("-");
                    println!(
                        "  {:15} {:20} {:20} ({})",
                        device.address, device.identity, hostname, device.source
                    );
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    if !result.success {
        std::process::exit(1);
    }

    Ok(())
}

async fn cmd_probe(cli: &Cli, config: config::ArmarioConfig, ip: &str) -> Result<()> {
    let device_scanner = DeviceScanner::new(config.scan).context("Failed to set up scanner")?;
    let result = device_scanner.probe_one(ip).await;

    match cli.format {
        OutputFormat::Text => match &result.device {
            Some(device) => {
                println!("Locker found at {}", result.ip);
                println!("  Identity: {}", device.identity);
                println!("  Instance: {}", device.instance_id);
                for (key, value) in &device.metadata {
                    println!("  {}: {}", key, value);
                }
            }
            None => {
                println!("No locker at {}", result.ip);
                if let Some(error) = &result.error {
                    println!("  Reason: {}", error);
                }
            }
        },
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    if !result.success {
        std::process::exit(1);
    }

    Ok(())
}

async fn cmd_device(
    cli: &Cli,
    config: config::ArmarioConfig,
    ip: &str,
    action: LockerAction,
    body: Option<&str>,
) -> Result<()> {
    let body: Option<serde_json::Value> = body
        .map(serde_json::from_str)
        .transpose()
        .context("--body must be valid JSON")?;

    let client = LockerClient::new(&config.control).context("Failed to set up locker client")?;
    let reply = client.send(ip, action, body.as_ref()).await?;

    match cli.format {
        OutputFormat::Text => {
            println!("{} -> {}", action, ip);
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "success": true,
                    "ip": ip,
                    "action": action.to_string(),
                    "response": reply,
                })
            );
        }
    }

    Ok(())
}

async fn cmd_serve(
    config: config::ArmarioConfig,
    bind: Option<String>,
    with_listener: bool,
) -> Result<()> {
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());

    let listener = if with_listener {
        let mut listener = AnnouncementListener::new(config.listener.clone());
        listener
            .start()
            .await
            .context("Failed to start announcement listener")?;
        Some(Arc::new(listener))
    } else {
        None
    };

    let mut device_scanner =
        DeviceScanner::new(config.scan.clone()).context("Failed to set up scanner")?;
    if let Some(listener) = &listener {
        device_scanner =
            device_scanner.with_listener(listener.clone(), config.listener.grace_period);
    }

    let state = Arc::new(server::GatewayState {
        scanner: device_scanner,
        lockers: LockerClient::new(&config.control).context("Failed to set up locker client")?,
        listener: listener.clone(),
    });

    server::serve(&bind, state, daemon::shutdown_signal()).await?;

    if let Some(listener) = listener {
        listener.shutdown();
    }
    Ok(())
}

fn cmd_config(cli: &Cli, config: &config::ArmarioConfig) -> Result<()> {
    let config_path = config::get_config_file_path_string();

    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:       {}", config_path);
            println!("Loaded from:       {}", config.source);
            println!("Family prefix:     {}", config.scan.family_prefix);
            println!(
                "Discovery:         GET :{}{}",
                config.scan.device_port, config.scan.discovery_path
            );
            println!(
                "Sweep:             hosts {}..={}, batches of {}, {:?} timeout, {:?} pacing",
                config.scan.first_host,
                config.scan.last_host,
                config.scan.batch_size,
                config.scan.probe_timeout,
                config.scan.batch_delay
            );
            println!("Fallback ranges:   {}", config.scan.fallback_prefixes.join(", "));
            println!(
                "Listener:          {}:{} (broadcast {})",
                config.listener.bind_address,
                config.listener.port,
                config.listener.broadcast_address
            );
            println!(
                "Record max age:    {}",
                config
                    .listener
                    .max_age
                    .map(|d| format!("{}s", d.as_secs()))
                    .unwrap_or_else(|| "unlimited".to_string())
            );
            println!("Gateway bind:      {}", config.server.bind);
            println!();
            println!("Environment variables:");
            println!("  ARMARIO_BATCH_SIZE, ARMARIO_PROBE_TIMEOUT_MS, ARMARIO_FAMILY_PREFIX,");
            println!("  ARMARIO_LISTENER_PORT, ARMARIO_MAX_AGE_SECS, ARMARIO_SERVER_BIND");
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", config::generate_example_config());
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "config_file": config_path,
                    "source": config.source.to_string(),
                    "family_prefix": config.scan.family_prefix,
                    "discovery_path": config.scan.discovery_path,
                    "device_port": config.scan.device_port,
                    "batch_size": config.scan.batch_size,
                    "probe_timeout_ms": config.scan.probe_timeout.as_millis() as u64,
                    "batch_delay_ms": config.scan.batch_delay.as_millis() as u64,
                    "first_host": config.scan.first_host,
                    "last_host": config.scan.last_host,
                    "fallback_prefixes": config.scan.fallback_prefixes,
                    "listener_port": config.listener.port,
                    "broadcast_address": config.listener.broadcast_address,
                    "grace_period_secs": config.listener.grace_period.as_secs(),
                    "max_age_secs": config.listener.max_age.map(|d| d.as_secs()),
                    "server_bind": config.server.bind,
                })
            );
        }
    }

    Ok(())
}
