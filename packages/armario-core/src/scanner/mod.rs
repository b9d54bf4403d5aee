//! Locker discovery module.
//!
//! Finds locker controllers on the local network using:
//! - Network range detection from the caller address or local interfaces
//! - HTTP probing of `/discovery` across a /24 in paced batches
//! - Passive UDP announcements merged by instance id

pub mod listener;
pub mod probe;
pub mod range;
pub mod registry;
pub mod sweep;

pub use listener::{AnnouncementListener, ListenerError, ListenerState};
pub use probe::{DeviceProbe, ProbeError, probe_target};
pub use range::LocalInterface;
pub use registry::DeviceRegistry;

use crate::config::ScanConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Fields of a locker report that are lifted out of the metadata map
const RESERVED_FIELDS: [&str; 4] = ["device", "id", "ip", "type"];

/// How a record was learned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceSource {
    ActiveProbe,
    PassiveAnnouncement,
}

impl std::fmt::Display for DeviceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSource::ActiveProbe => write!(f, "active-probe"),
            DeviceSource::PassiveAnnouncement => write!(f, "passive-announcement"),
        }
    }
}

/// A locker controller seen on the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub address: String,
    /// Self-reported `device` tag, e.g. `AIRE-ESP32-7`
    pub identity: String,
    /// Dedup key
    pub instance_id: String,
    /// Everything else the firmware reported (hostname, status, uptime,
    /// memoria_livre, rssi, ...), passed through untouched
    pub metadata: BTreeMap<String, Value>,
    pub last_seen: DateTime<Utc>,
    pub source: DeviceSource,
}

/// Why a locker report was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error("report is not a JSON object")]
    NotAnObject,
    #[error("report has no device identity")]
    MissingIdentity,
    #[error("device {0:?} is not part of the expected family")]
    WrongFamily(String),
}

impl DeviceRecord {
    /// Build a record from a locker's JSON self-description.
    pub fn from_report(
        address: String,
        report: &Value,
        family_prefix: &str,
        source: DeviceSource,
        seen: DateTime<Utc>,
    ) -> Result<Self, ReportError> {
        let fields = report.as_object().ok_or(ReportError::NotAnObject)?;

        let identity = fields
            .get("device")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ReportError::MissingIdentity)?;

        if !identity.starts_with(family_prefix) {
            return Err(ReportError::WrongFamily(identity.to_string()));
        }

        let instance_id = match fields.get("id") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => identity.to_string(),
        };

        let metadata = fields
            .iter()
            .filter(|(k, _)| !RESERVED_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            address,
            identity: identity.to_string(),
            instance_id,
            metadata,
            last_seen: seen,
            source,
        })
    }
}

/// Caller-facing result of a network scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResponse {
    pub success: bool,
    pub network_range: String,
    pub devices: Vec<DeviceRecord>,
    pub total_scanned: usize,
    pub message: String,
}

/// Caller-facing result of probing a single address
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceRecord>,
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Progress updates during a scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    pub stage: ScanStage,
    pub message: String,
    pub percent: Option<u8>,
    pub devices_found: Option<usize>,
    pub elapsed_secs: f64,
}

/// Stages of a scan
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanStage {
    Starting,
    ResolvingRange,
    Probing,
    CollectingAnnouncements,
    Complete,
}

/// Callback type for scan progress updates
pub type ProgressCallback = Box<dyn Fn(ScanProgress) + Send + Sync>;

/// What to scan
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    /// Explicit range (`192.168.1`, `192.168.1.0/24`, ...)
    pub prefix: Option<String>,
    /// Address of the requesting client, possibly a forwarding chain
    pub client_address: Option<String>,
}

/// Discovery entry point: active sweeps plus, when attached, the passive
/// announcement listener.
pub struct DeviceScanner {
    config: ScanConfig,
    probe: DeviceProbe,
    listener: Option<Arc<AnnouncementListener>>,
    grace_period: Duration,
    /// Overrides interface enumeration when set
    interfaces: Option<Vec<LocalInterface>>,
}

impl DeviceScanner {
    pub fn new(config: ScanConfig) -> Result<Self, ProbeError> {
        let probe = DeviceProbe::new(&config)?;
        Ok(Self {
            config,
            probe,
            listener: None,
            grace_period: Duration::ZERO,
            interfaces: None,
        })
    }

    /// Merge the listener's announcements into scan results, waiting
    /// `grace_period` after the sweep for stragglers.
    pub fn with_listener(
        mut self,
        listener: Arc<AnnouncementListener>,
        grace_period: Duration,
    ) -> Self {
        self.listener = Some(listener);
        self.grace_period = grace_period;
        self
    }

    /// Resolve ranges against `interfaces` rather than the host's own.
    pub fn with_interfaces(mut self, interfaces: Vec<LocalInterface>) -> Self {
        self.interfaces = Some(interfaces);
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn listener(&self) -> Option<&Arc<AnnouncementListener>> {
        self.listener.as_ref()
    }

    /// Scan the network. Always completes; individual probe failures are
    /// absorbed and only successful discoveries are reported.
    pub async fn scan_network(&self, request: &ScanRequest) -> ScanResponse {
        self.scan_network_with_progress(request, None).await
    }

    pub async fn scan_network_with_progress(
        &self,
        request: &ScanRequest,
        on_progress: Option<ProgressCallback>,
    ) -> ScanResponse {
        let scan_start = Instant::now();

        let emit_progress =
            |stage: ScanStage, message: &str, percent: Option<u8>, devices: Option<usize>| {
                let progress = ScanProgress {
                    stage,
                    message: message.to_string(),
                    percent,
                    devices_found: devices,
                    elapsed_secs: scan_start.elapsed().as_secs_f64(),
                };
                tracing::debug!("[Scan] {}", message);
                if let Some(ref callback) = on_progress {
                    callback(progress);
                }
            };

        emit_progress(ScanStage::Starting, "Starting locker discovery...", Some(0), None);

        // Stage 1: work out which /24 ranges to sweep
        emit_progress(
            ScanStage::ResolvingRange,
            "Detecting network range...",
            Some(2),
            None,
        );

        let (prefixes, used_fallback) = match request.prefix.as_deref() {
            Some(raw) => match range::parse_prefix(raw) {
                Some(prefix) if range::is_local_prefix(&prefix) => (vec![prefix], false),
                Some(prefix) => {
                    tracing::warn!("Refused to scan non-local range {}.0/24", prefix);
                    return ScanResponse {
                        success: false,
                        network_range: format!("{}.0/24", prefix),
                        devices: Vec::new(),
                        total_scanned: 0,
                        message: format!(
                            "{}.0/24 is not a local network range; only private, loopback and link-local ranges can be scanned",
                            prefix
                        ),
                    };
                }
                None => {
                    tracing::warn!("Rejected scan range {:?}", raw);
                    return ScanResponse {
                        success: false,
                        network_range: raw.to_string(),
                        devices: Vec::new(),
                        total_scanned: 0,
                        message: format!(
                            "Invalid network range {:?}; expected something like 192.168.1 or 192.168.1.0/24",
                            raw
                        ),
                    };
                }
            },
            None => match self.resolve_prefix(request.client_address.as_deref()) {
                Some(prefix) => (vec![prefix], false),
                None => {
                    tracing::info!(
                        "Could not determine local network, trying common ranges: {:?}",
                        self.config.fallback_prefixes
                    );
                    (self.config.fallback_prefixes.clone(), true)
                }
            },
        };

        let network_range = prefixes
            .iter()
            .map(|p| format!("{}.0/24", p))
            .collect::<Vec<_>>()
            .join(", ");

        // Ask lockers to announce themselves while the sweep runs
        if let Some(listener) = &self.listener {
            if let Err(e) = listener.request_announcements().await {
                tracing::warn!("Failed to broadcast discovery request: {}", e);
            }
        }

        // Stage 2: active sweep
        let mut found = DeviceRegistry::new();
        let mut total_scanned = 0;
        let range_count = prefixes.len();

        for (range_idx, prefix) in prefixes.iter().enumerate() {
            emit_progress(
                ScanStage::Probing,
                &format!("Probing {}.0/24 for lockers...", prefix),
                Some(sweep_percent(range_idx, range_count, 0, 1)),
                Some(found.len()),
            );

            let outcome = sweep::discovery_sweep(&self.probe, prefix, &self.config, |p| {
                emit_progress(
                    ScanStage::Probing,
                    &format!(
                        "{}.0/24: {}/{} addresses checked, {} locker(s) found",
                        prefix, p.addresses_done, p.addresses_total, p.hits
                    ),
                    Some(sweep_percent(
                        range_idx,
                        range_count,
                        p.addresses_done,
                        p.addresses_total,
                    )),
                    Some(found.len() + p.hits),
                );
            })
            .await;

            total_scanned += outcome.addresses_tried;
            found.merge_all(outcome.records);
        }

        // Stage 3: fold in passive announcements
        if let Some(listener) = &self.listener {
            if !self.grace_period.is_zero() {
                emit_progress(
                    ScanStage::CollectingAnnouncements,
                    &format!(
                        "Waiting {}s for locker announcements...",
                        self.grace_period.as_secs()
                    ),
                    Some(92),
                    Some(found.len()),
                );
                tokio::time::sleep(self.grace_period).await;
            }

            let announced = listener.snapshot().await;
            tracing::debug!("Merging {} announced locker(s)", announced.len());
            found.merge_all(announced);
        }

        let devices = found.into_records();

        let mut message = format!(
            "Found {} locker(s) on {} ({} addresses checked)",
            devices.len(),
            network_range,
            total_scanned
        );
        if used_fallback {
            message.push_str("; local network could not be detected, common ranges were scanned");
        }

        emit_progress(
            ScanStage::Complete,
            &format!(
                "Scan complete: {} locker(s) in {:.1}s",
                devices.len(),
                scan_start.elapsed().as_secs_f64()
            ),
            Some(100),
            Some(devices.len()),
        );
        tracing::info!("{}", message);

        ScanResponse {
            success: true,
            network_range,
            devices,
            total_scanned,
            message,
        }
    }

    fn resolve_prefix(&self, client_address: Option<&str>) -> Option<String> {
        match &self.interfaces {
            Some(interfaces) => range::resolve_prefix_with(client_address, interfaces),
            None => range::resolve_prefix(client_address),
        }
    }

    /// Probe a single address and explain the outcome. Only LAN addresses
    /// are probed.
    pub async fn probe_one(&self, ip: &str) -> ProbeResponse {
        let ip = ip.trim();
        let addr = match probe_target(ip) {
            Ok(addr) => addr,
            Err(e) => {
                return ProbeResponse {
                    success: false,
                    device: None,
                    ip: ip.to_string(),
                    error: Some(e.to_string()),
                    message: Some(
                        "Provide a local IPv4 address such as 192.168.1.50".to_string(),
                    ),
                };
            }
        };

        match self.probe.try_probe(addr).await {
            Ok(device) => ProbeResponse {
                success: true,
                message: Some(format!("Locker {} found at {}", device.identity, ip)),
                device: Some(device),
                ip: ip.to_string(),
                error: None,
            },
            Err(e) => ProbeResponse {
                success: false,
                device: None,
                ip: ip.to_string(),
                error: Some(e.to_string()),
                message: Some(format!("No locker answered on {}", self.probe.discovery_url(addr))),
            },
        }
    }
}

/// Overall percentage for probing stage, spread over 5..=90
fn sweep_percent(range_idx: usize, range_count: usize, done: usize, total: usize) -> u8 {
    let range_count = range_count.max(1);
    let within = if total == 0 { 1.0 } else { done as f64 / total as f64 };
    let overall = (range_idx as f64 + within) / range_count as f64;
    (5.0 + overall * 85.0).round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process stand-ins for locker firmware.

    use axum::{Router, http::StatusCode, routing::get};
    use std::net::SocketAddr;

    /// Serve `body` with `status` on `path`; returns the bound address.
    pub async fn spawn_device(path: &'static str, status: StatusCode, body: String) -> SocketAddr {
        let app = Router::new().route(
            path,
            get(move || {
                let body = body.clone();
                async move { (status, body) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// Accept connections and never answer.
    pub async fn spawn_silent() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr
    }

    pub fn locker_json(device: &str, id: u32) -> String {
        serde_json::json!({
            "device": device,
            "id": id,
            "hostname": format!("armario-{}", id),
            "status": "online",
            "uptime": 3600,
            "memoria_livre": 182_344,
            "rssi": -61,
        })
        .to_string()
    }
}
