//! Armario Core Library
//!
//! This crate provides the core functionality for managing smart lockers
//! (ESP32 controllers) in a condominium package-delivery system:
//! - LAN discovery (range detection, batched `/discovery` probing)
//! - Passive UDP announcement listening
//! - Command forwarding (`/status`, `/abrir`, `/fechar`, `/reset-wifi`)
//! - Layered configuration (environment, config file, defaults)
//!
//! # Example
//!
//! ```no_run
//! use armario_core::{config, scanner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = config::load_config();
//!
//!     let scanner = scanner::DeviceScanner::new(config.scan)?;
//!     let result = scanner.scan_network(&scanner::ScanRequest::default()).await;
//!     println!("Found {} lockers on {}", result.devices.len(), result.network_range);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control;
pub mod scanner;

// Re-export commonly used types
pub use config::{ArmarioConfig, ConfigSource, load_config};
pub use control::{ControlError, LockerAction, LockerClient};
pub use scanner::{
    AnnouncementListener, DeviceRecord, DeviceScanner, DeviceSource, ListenerError, ListenerState,
    ProbeResponse, ScanProgress, ScanRequest, ScanResponse, ScanStage,
};
