//! Keyed set of discovered lockers.

use super::DeviceRecord;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Discovered lockers keyed by instance id. At most one record per id.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    by_instance: HashMap<String, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_instance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_instance.is_empty()
    }

    pub fn get(&self, instance_id: &str) -> Option<&DeviceRecord> {
        self.by_instance.get(instance_id)
    }

    /// Record an observation. A known instance id has its address,
    /// metadata, `last_seen` and `source` replaced in place.
    /// Returns true if the instance id was not known before.
    pub fn upsert(&mut self, record: DeviceRecord) -> bool {
        match self.by_instance.get_mut(&record.instance_id) {
            Some(existing) => {
                existing.address = record.address;
                existing.identity = record.identity;
                existing.metadata = record.metadata;
                existing.last_seen = record.last_seen;
                existing.source = record.source;
                false
            }
            None => {
                self.by_instance.insert(record.instance_id.clone(), record);
                true
            }
        }
    }

    /// Merge a record from another collection, keeping whichever
    /// observation of the instance is most recent.
    pub fn merge(&mut self, record: DeviceRecord) {
        match self.by_instance.get(&record.instance_id) {
            Some(existing) if existing.last_seen > record.last_seen => {}
            _ => {
                self.upsert(record);
            }
        }
    }

    pub fn merge_all(&mut self, records: impl IntoIterator<Item = DeviceRecord>) {
        for record in records {
            self.merge(record);
        }
    }

    /// Drop records whose last observation is older than `max_age`.
    /// Returns the number of records evicted.
    pub fn prune(&mut self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = now - max_age;
        let before = self.by_instance.len();
        self.by_instance.retain(|_, record| record.last_seen >= cutoff);
        before - self.by_instance.len()
    }

    /// Records ordered by address, then instance id.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self.by_instance.values().cloned().collect();
        records.sort_by(|a, b| {
            address_sort_key(&a.address)
                .cmp(&address_sort_key(&b.address))
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        records
    }

    pub fn into_records(self) -> Vec<DeviceRecord> {
        self.snapshot()
    }
}

/// Numeric ordering for dotted-quad addresses; anything else sorts last.
fn address_sort_key(address: &str) -> (u8, u32, String) {
    match address.parse::<std::net::Ipv4Addr>() {
        Ok(ip) => (0, u32::from(ip), String::new()),
        Err(_) => (1, 0, address.to_string()),
    }
}
