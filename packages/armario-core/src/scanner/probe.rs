//! Single-host locker check over HTTP.

use super::range::is_local_ipv4;
use super::{DeviceRecord, DeviceSource, ReportError};
use crate::config::ScanConfig;
use chrono::Utc;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

/// Every way a probe can come back empty-handed
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid IPv4 address: {0:?}")]
    InvalidAddress(String),
    #[error("{0} is not a local network address")]
    NotLocal(Ipv4Addr),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("device returned HTTP {0}")]
    Status(u16),
    #[error("malformed discovery response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Rejected(#[from] ReportError),
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Checks one address for a locker answering on the discovery path.
#[derive(Debug, Clone)]
pub struct DeviceProbe {
    client: reqwest::Client,
    port: u16,
    path: String,
    timeout: Duration,
    family_prefix: String,
}

impl DeviceProbe {
    pub fn new(config: &ScanConfig) -> Result<Self, ProbeError> {
        // LAN addresses must never be routed through an HTTP proxy
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .connect_timeout(config.probe_timeout)
            .no_proxy()
            .build()
            .map_err(|e| ProbeError::Client(e.to_string()))?;

        Ok(Self {
            client,
            port: config.device_port,
            path: config.discovery_path.clone(),
            timeout: config.probe_timeout,
            family_prefix: config.family_prefix.clone(),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn discovery_url(&self, ip: Ipv4Addr) -> String {
        if self.port == 80 {
            format!("http://{}{}", ip, self.path)
        } else {
            format!("http://{}:{}{}", ip, self.port, self.path)
        }
    }

    /// Probe `ip`, returning a record only for a well-formed reply from a
    /// locker of the expected family. Failures are silent.
    pub async fn probe(&self, ip: Ipv4Addr) -> Option<DeviceRecord> {
        match self.try_probe(ip).await {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::trace!("{}: {}", ip, e);
                None
            }
        }
    }

    /// Probe `ip` and say why nothing was found.
    pub async fn try_probe(&self, ip: Ipv4Addr) -> Result<DeviceRecord, ProbeError> {
        let url = self.discovery_url(ip);

        let body = tokio::time::timeout(self.timeout, async {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| classify(e, self.timeout))?;

            if !resp.status().is_success() {
                return Err(ProbeError::Status(resp.status().as_u16()));
            }

            resp.bytes().await.map_err(|e| classify(e, self.timeout))
        })
        .await
        .map_err(|_| ProbeError::Timeout(self.timeout))??;

        let report: serde_json::Value =
            serde_json::from_slice(&body).map_err(|e| ProbeError::Malformed(e.to_string()))?;

        let record = DeviceRecord::from_report(
            ip.to_string(),
            &report,
            &self.family_prefix,
            DeviceSource::ActiveProbe,
            Utc::now(),
        )?;

        tracing::debug!(
            "Locker {} (instance {}) answered at {}",
            record.identity,
            record.instance_id,
            ip
        );
        Ok(record)
    }
}

/// Parse a caller-supplied probe target, refusing anything off the LAN.
pub fn probe_target(raw: &str) -> Result<Ipv4Addr, ProbeError> {
    let raw = raw.trim();
    let ip: Ipv4Addr = raw
        .parse()
        .map_err(|_| ProbeError::InvalidAddress(raw.to_string()))?;
    if !is_local_ipv4(ip) {
        return Err(ProbeError::NotLocal(ip));
    }
    Ok(ip)
}

fn classify(error: reqwest::Error, timeout: Duration) -> ProbeError {
    if error.is_timeout() {
        ProbeError::Timeout(timeout)
    } else {
        ProbeError::Connect(error.to_string())
    }
}
