//! Forwarders for locker commands.
//!
//! Browsers cannot call lockers directly (no CORS on the firmware), so the
//! gateway relays `/status`, `/abrir`, `/fechar` and `/reset-wifi` through
//! this client.

use crate::config::ControlConfig;
use crate::scanner::range::is_local_ipv4;
use serde_json::Value;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid locker address {0:?}")]
    InvalidAddress(String),
    #[error("{0} is not a local network address")]
    NotLocal(Ipv4Addr),
    #[error("locker at {address} did not respond within {timeout:?}")]
    Timeout { address: Ipv4Addr, timeout: Duration },
    #[error("failed to reach locker at {address}: {message}")]
    Unreachable { address: Ipv4Addr, message: String },
    #[error("locker at {address} returned HTTP {status}")]
    Status {
        address: Ipv4Addr,
        status: u16,
        body: Value,
    },
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Commands a locker understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockerAction {
    Status,
    Open,
    Close,
    ResetWifi,
}

impl LockerAction {
    pub fn path(&self) -> &'static str {
        match self {
            LockerAction::Status => "/status",
            LockerAction::Open => "/abrir",
            LockerAction::Close => "/fechar",
            LockerAction::ResetWifi => "/reset-wifi",
        }
    }

    pub fn method(&self) -> reqwest::Method {
        match self {
            LockerAction::Status => reqwest::Method::GET,
            _ => reqwest::Method::POST,
        }
    }
}

impl FromStr for LockerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "status" => Ok(LockerAction::Status),
            "open" | "abrir" => Ok(LockerAction::Open),
            "close" | "fechar" => Ok(LockerAction::Close),
            "reset-wifi" | "reset_wifi" | "resetwifi" => Ok(LockerAction::ResetWifi),
            other => Err(format!("unknown locker action {:?}", other)),
        }
    }
}

impl std::fmt::Display for LockerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path().trim_start_matches('/'))
    }
}

/// HTTP client relaying commands to lockers on the LAN
#[derive(Debug, Clone)]
pub struct LockerClient {
    client: reqwest::Client,
    port: u16,
    timeout: Duration,
}

impl LockerClient {
    pub fn new(config: &ControlConfig) -> Result<Self, ControlError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .no_proxy()
            .build()?;

        Ok(Self {
            client,
            port: config.device_port,
            timeout: config.timeout,
        })
    }

    pub async fn status(&self, address: &str) -> Result<Value, ControlError> {
        self.send(address, LockerAction::Status, None).await
    }

    pub async fn open(&self, address: &str, body: Option<&Value>) -> Result<Value, ControlError> {
        self.send(address, LockerAction::Open, body).await
    }

    pub async fn close(&self, address: &str, body: Option<&Value>) -> Result<Value, ControlError> {
        self.send(address, LockerAction::Close, body).await
    }

    pub async fn reset_wifi(&self, address: &str) -> Result<Value, ControlError> {
        self.send(address, LockerAction::ResetWifi, None).await
    }

    /// Relay `action` to the locker at `address` and return its reply.
    /// A reply that is not JSON comes back as `{ "raw": "<text>" }`.
    pub async fn send(
        &self,
        address: &str,
        action: LockerAction,
        body: Option<&Value>,
    ) -> Result<Value, ControlError> {
        let ip = parse_local_address(address)?;
        let url = if self.port == 80 {
            format!("http://{}{}", ip, action.path())
        } else {
            format!("http://{}:{}{}", ip, self.port, action.path())
        };

        tracing::info!("Forwarding {} to locker at {}", action, ip);

        let mut request = self.client.request(action.method(), &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let (status, bytes) = tokio::time::timeout(self.timeout, async {
            let resp = request.send().await?;
            let status = resp.status();
            let bytes = resp.bytes().await?;
            Ok::<_, reqwest::Error>((status, bytes))
        })
        .await
        .map_err(|_| ControlError::Timeout {
            address: ip,
            timeout: self.timeout,
        })?
        .map_err(|e| {
            if e.is_timeout() {
                ControlError::Timeout {
                    address: ip,
                    timeout: self.timeout,
                }
            } else {
                ControlError::Unreachable {
                    address: ip,
                    message: e.to_string(),
                }
            }
        })?;

        let reply = decode_reply(&bytes);

        if !status.is_success() {
            tracing::warn!("Locker at {} answered {} with HTTP {}", ip, action, status);
            return Err(ControlError::Status {
                address: ip,
                status: status.as_u16(),
                body: reply,
            });
        }

        Ok(reply)
    }
}

/// Accept only addresses a locker can actually live on, so the gateway
/// cannot be used to reach arbitrary hosts.
pub fn parse_local_address(address: &str) -> Result<Ipv4Addr, ControlError> {
    let ip: Ipv4Addr = address
        .trim()
        .parse()
        .map_err(|_| ControlError::InvalidAddress(address.to_string()))?;

    if is_local_ipv4(ip) {
        Ok(ip)
    } else {
        Err(ControlError::NotLocal(ip))
    }
}

fn decode_reply(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap_or_else(|_| {
        serde_json::json!({ "raw": String::from_utf8_lossy(bytes).trim() })
    })
}
