//! Passive UDP announcement listener.
//!
//! Lockers broadcast a JSON self-description when they boot and whenever
//! they receive a `discovery_request`. The listener keeps the latest
//! announcement per instance id for as long as it runs.

use super::registry::DeviceRegistry;
use super::{DeviceRecord, DeviceSource};
use crate::config::ListenerConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// `type` values that mark a datagram as a locker announcement
pub const ANNOUNCEMENT_TYPES: [&str; 3] = ["announce", "announcement", "discovery_response"];

/// `type` of the message asking lockers to announce themselves
pub const DISCOVERY_REQUEST_TYPE: &str = "discovery_request";

const MAX_DATAGRAM: usize = 2048;
const RECEIVE_BACKOFF_BASE: Duration = Duration::from_millis(50);
const RECEIVE_BACKOFF_MAX: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid listener address {0:?}")]
    InvalidAddress(String),
    #[error("failed to bind announcement listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to send discovery request to {addr}: {source}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("announcement listener is not running")]
    NotListening,
}

/// Listener lifecycle: `Unbound -> Listening -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Unbound,
    Listening,
    Closed,
}

struct Running {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    request_target: SocketAddr,
    task: JoinHandle<()>,
}

/// Long-lived receiver of locker announcements. Construct once, `start` it,
/// then share it (e.g. behind an `Arc`) with whatever needs its view.
pub struct AnnouncementListener {
    config: ListenerConfig,
    registry: Arc<RwLock<DeviceRegistry>>,
    running: Option<Running>,
    closed: AtomicBool,
}

impl AnnouncementListener {
    pub fn new(config: ListenerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(RwLock::new(DeviceRegistry::new())),
            running: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ListenerState {
        match &self.running {
            None => ListenerState::Unbound,
            Some(r) if self.closed.load(Ordering::SeqCst) || r.task.is_finished() => {
                ListenerState::Closed
            }
            Some(_) => ListenerState::Listening,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Bind the socket and start receiving. A bind failure is returned
    /// to the caller and not retried. Calling `start` on a running
    /// listener is a no-op; a closed listener cannot be restarted.
    pub async fn start(&mut self) -> Result<(), ListenerError> {
        match self.state() {
            ListenerState::Listening => return Ok(()),
            ListenerState::Closed => return Err(ListenerError::NotListening),
            ListenerState::Unbound => {}
        }

        let raw = format!("{}:{}", self.config.bind_address, self.config.port);
        let bind_addr: SocketAddr = raw
            .parse()
            .map_err(|_| ListenerError::InvalidAddress(raw.clone()))?;

        let socket = UdpSocket::bind(bind_addr).await.map_err(|source| {
            tracing::error!("Announcement listener bind on {} failed: {}", bind_addr, source);
            ListenerError::Bind {
                addr: bind_addr,
                source,
            }
        })?;

        if let Err(e) = socket.set_broadcast(true) {
            tracing::warn!("Could not enable broadcast on listener socket: {}", e);
        }

        let local_addr = socket.local_addr().unwrap_or(bind_addr);

        let broadcast: IpAddr = self
            .config
            .broadcast_address
            .parse()
            .map_err(|_| ListenerError::InvalidAddress(self.config.broadcast_address.clone()))?;
        // An ephemeral bind (port 0) answers on whatever port it got
        let request_port = if self.config.port == 0 {
            local_addr.port()
        } else {
            self.config.port
        };

        let socket = Arc::new(socket);
        let task = tokio::spawn(receive_loop(
            socket.clone(),
            self.registry.clone(),
            self.config.family_prefix.clone(),
        ));

        tracing::info!("Listening for locker announcements on {}", local_addr);

        self.running = Some(Running {
            socket,
            local_addr,
            request_target: SocketAddr::new(broadcast, request_port),
            task,
        });
        Ok(())
    }

    /// Broadcast a `discovery_request` so lockers announce themselves.
    pub async fn request_announcements(&self) -> Result<usize, ListenerError> {
        let running = match (&self.running, self.state()) {
            (Some(running), ListenerState::Listening) => running,
            _ => return Err(ListenerError::NotListening),
        };

        let message = serde_json::json!({
            "type": DISCOVERY_REQUEST_TYPE,
            "timestamp": Utc::now().timestamp_millis(),
        })
        .to_string();

        let sent = running
            .socket
            .send_to(message.as_bytes(), running.request_target)
            .await
            .map_err(|source| ListenerError::Send {
                addr: running.request_target,
                source,
            })?;

        tracing::debug!("Sent discovery request to {}", running.request_target);
        Ok(sent)
    }

    /// Current set of announced lockers. With a configured max age, stale
    /// records are evicted first.
    pub async fn snapshot(&self) -> Vec<DeviceRecord> {
        if let Some(max_age) = self.config.max_age {
            let evicted = self.registry.write().await.prune(max_age, Utc::now());
            if evicted > 0 {
                tracing::debug!("Evicted {} stale announcement(s)", evicted);
            }
        }
        self.registry.read().await.snapshot()
    }

    /// Stop receiving. The accumulated set stays readable.
    pub fn shutdown(&self) {
        if let Some(running) = &self.running {
            if !self.closed.swap(true, Ordering::SeqCst) {
                running.task.abort();
                tracing::info!("Announcement listener on {} closed", running.local_addr);
            }
        }
    }
}

impl Drop for AnnouncementListener {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.task.abort();
        }
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    registry: Arc<RwLock<DeviceRegistry>>,
    family_prefix: String,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut failures: u32 = 0;

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => {
                failures = 0;
                received
            }
            Err(e) => {
                // ICMP errors from earlier sends surface here on some platforms
                failures = failures.saturating_add(1);
                let delay = receive_backoff(failures);
                tracing::debug!("Announcement receive error (retry in {:?}): {}", delay, e);
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let Some(record) = parse_announcement(&buf[..len], from, &family_prefix, Utc::now()) else {
            continue;
        };

        let identity = record.identity.clone();
        let address = record.address.clone();
        if registry.write().await.upsert(record) {
            tracing::info!("Locker {} announced itself at {}", identity, address);
        } else {
            tracing::trace!("Refreshed announcement from {} at {}", identity, address);
        }
    }
}

/// Delay before the next receive after `failures` consecutive errors:
/// 50ms doubling up to 2s.
fn receive_backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(6);
    (RECEIVE_BACKOFF_BASE * 2u32.pow(exp)).min(RECEIVE_BACKOFF_MAX)
}

/// Decode one datagram. Anything that is not a well-formed announcement
/// from the expected family yields `None`.
pub fn parse_announcement(
    datagram: &[u8],
    from: SocketAddr,
    family_prefix: &str,
    seen: DateTime<Utc>,
) -> Option<DeviceRecord> {
    let message: Value = serde_json::from_slice(datagram).ok()?;

    let kind = message.get("type").and_then(Value::as_str)?;
    if !ANNOUNCEMENT_TYPES.contains(&kind) {
        return None;
    }

    // Prefer the address the locker reports; NAT or multi-homed senders
    // may not match the datagram source
    let address = message
        .get("ip")
        .and_then(Value::as_str)
        .and_then(|ip| ip.trim().parse::<Ipv4Addr>().ok())
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| from.ip().to_string());

    DeviceRecord::from_report(
        address,
        &message,
        family_prefix,
        DeviceSource::PassiveAnnouncement,
        seen,
    )
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const FAMILY: &str = "AIRE-ESP32-";

    fn from() -> SocketAddr {
        "192.168.1.77:4210".parse().unwrap()
    }

    fn announcement(id: u32, uptime: u64) -> Vec<u8> {
        json!({
            "type": "announcement",
            "device": format!("AIRE-ESP32-{}", id),
            "id": id,
            "ip": "192.168.1.50",
            "hostname": format!("armario-{}", id),
            "status": "online",
            "uptime": uptime,
            "memoria_livre": 150_000,
            "rssi": -70,
        })
        .to_string()
        .into_bytes()
    }

    fn loopback_config() -> ListenerConfig {
        ListenerConfig {
            port: 0,
            bind_address: "127.0.0.1".to_string(),
            broadcast_address: "127.0.0.1".to_string(),
            ..ListenerConfig::default()
        }
    }

    #[test]
    fn test_parse_valid_announcement() {
        let record = parse_announcement(&announcement(7, 10), from(), FAMILY, Utc::now()).unwrap();

        assert_eq!(record.instance_id, "7");
        assert_eq!(record.address, "192.168.1.50");
        assert_eq!(record.source, DeviceSource::PassiveAnnouncement);
        assert_eq!(record.metadata["uptime"], json!(10));
    }

    #[test]
    fn test_parse_uses_sender_without_reported_ip() {
        let datagram =
            json!({ "type": "announce", "device": "AIRE-ESP32-9", "id": "9" }).to_string();
        let record = parse_announcement(datagram.as_bytes(), from(), FAMILY, Utc::now()).unwrap();
        assert_eq!(record.address, "192.168.1.77");
    }

    #[test]
    fn test_parse_discards_garbage() {
        let now = Utc::now();
        assert!(parse_announcement(b"\x00\x01not json", from(), FAMILY, now).is_none());
        let untyped = br#"{"device":"AIRE-ESP32-1"}"#;
        assert!(parse_announcement(untyped, from(), FAMILY, now).is_none());

        let request = json!({ "type": "discovery_request", "timestamp": 1 }).to_string();
        assert!(parse_announcement(request.as_bytes(), from(), FAMILY, now).is_none());

        let foreign = json!({ "type": "announcement", "device": "OTHER-THING-1" }).to_string();
        assert!(parse_announcement(foreign.as_bytes(), from(), FAMILY, now).is_none());
    }

    #[test]
    fn test_repeat_announcements_update_in_place() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(30);
        let mut registry = DeviceRegistry::new();

        registry.upsert(parse_announcement(&announcement(7, 10), from(), FAMILY, t0).unwrap());
        registry.upsert(parse_announcement(&announcement(7, 40), from(), FAMILY, t1).unwrap());

        assert_eq!(registry.len(), 1);
        let stored = registry.get("7").unwrap();
        assert_eq!(stored.last_seen, t1);
        assert_eq!(stored.metadata["uptime"], json!(40));
    }

    #[test]
    fn test_receive_errors_back_off() {
        assert_eq!(receive_backoff(1), Duration::from_millis(50));
        assert_eq!(receive_backoff(2), Duration::from_millis(100));
        assert_eq!(receive_backoff(4), Duration::from_millis(400));
        assert_eq!(receive_backoff(7), Duration::from_secs(2));
        assert_eq!(receive_backoff(u32::MAX), Duration::from_secs(2));
        assert!((1..20).all(|n| receive_backoff(n) > Duration::ZERO));
    }

    #[tokio::test]
    async fn test_listener_lifecycle() {
        let mut listener = AnnouncementListener::new(loopback_config());
        assert_eq!(listener.state(), ListenerState::Unbound);
        assert!(matches!(
            listener.request_announcements().await,
            Err(ListenerError::NotListening)
        ));

        listener.start().await.unwrap();
        assert_eq!(listener.state(), ListenerState::Listening);
        assert!(listener.request_announcements().await.unwrap() > 0);

        listener.shutdown();
        assert_eq!(listener.state(), ListenerState::Closed);
        assert!(listener.start().await.is_err());
    }

    #[tokio::test]
    async fn test_listener_receives_announcements() {
        let mut listener = AnnouncementListener::new(loopback_config());
        listener.start().await.unwrap();
        let target = listener.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"garbage", target).await.unwrap();
        sender.send_to(&announcement(3, 5), target).await.unwrap();
        sender.send_to(&announcement(3, 6), target).await.unwrap();

        let mut devices = Vec::new();
        for _ in 0..50 {
            devices = listener.snapshot().await;
            if devices.first().is_some_and(|d| d.metadata["uptime"] == json!(6)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].instance_id, "3");
        assert_eq!(devices[0].metadata["uptime"], json!(6));
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let occupied = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let mut listener = AnnouncementListener::new(ListenerConfig {
            port,
            ..loopback_config()
        });

        assert!(matches!(listener.start().await, Err(ListenerError::Bind { .. })));
        assert_eq!(listener.state(), ListenerState::Unbound);
    }

    #[tokio::test]
    async fn test_snapshot_applies_max_age() {
        let listener = AnnouncementListener::new(ListenerConfig {
            max_age: Some(Duration::from_secs(60)),
            ..loopback_config()
        });

        let stale = Utc::now() - chrono::Duration::seconds(120);
        listener
            .registry
            .write()
            .await
            .upsert(parse_announcement(&announcement(1, 1), from(), FAMILY, stale).unwrap());
        listener
            .registry
            .write()
            .await
            .upsert(parse_announcement(&announcement(2, 1), from(), FAMILY, Utc::now()).unwrap());

        let devices = listener.snapshot().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].instance_id, "2");
    }
}
