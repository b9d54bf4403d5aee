//! Batched /24 discovery sweep

use super::probe::DeviceProbe;
use super::registry::DeviceRegistry;
use super::{DeviceRecord, range};
use crate::config::ScanConfig;
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// Progress after each completed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepProgress {
    pub batch: usize,
    pub batches: usize,
    pub addresses_done: usize,
    pub addresses_total: usize,
    pub hits: usize,
}

/// Result of sweeping one range
#[derive(Debug, Clone)]
pub struct SweepOutcome {
    pub records: Vec<DeviceRecord>,
    pub addresses_tried: usize,
    pub batches: usize,
}

/// Host addresses `prefix.first..=prefix.last`. Empty for a malformed prefix.
pub fn candidate_addresses(prefix: &str, first_host: u8, last_host: u8) -> Vec<Ipv4Addr> {
    let Some(prefix) = range::parse_prefix(prefix) else {
        return Vec::new();
    };

    let octets: Vec<u8> = prefix.split('.').filter_map(|o| o.parse().ok()).collect();
    let [a, b, c] = octets[..] else {
        return Vec::new();
    };

    (first_host..=last_host)
        .map(|host| Ipv4Addr::new(a, b, c, host))
        .collect()
}

/// Split candidates into batches of at most `batch_size`.
pub fn partition<T>(items: &[T], batch_size: usize) -> Vec<&[T]> {
    items.chunks(batch_size.max(1)).collect()
}

/// Probe every candidate in a /24 using `probe`.
pub async fn discovery_sweep(
    probe: &DeviceProbe,
    prefix: &str,
    config: &ScanConfig,
    on_progress: impl FnMut(SweepProgress),
) -> SweepOutcome {
    let candidates = candidate_addresses(prefix, config.first_host, config.last_host);
    let start = Instant::now();

    tracing::info!(
        "Probing {} addresses in {}.0/24 (batches of {}, timeout {:?})",
        candidates.len(),
        prefix,
        config.batch_size,
        probe.timeout()
    );

    let outcome = sweep_with(
        &candidates,
        config.batch_size,
        config.batch_delay,
        |ip| probe.probe(ip),
        on_progress,
    )
    .await;

    tracing::info!(
        "Sweep of {}.0/24 complete: {} locker(s) in {:.1}s",
        prefix,
        outcome.records.len(),
        start.elapsed().as_secs_f64()
    );

    outcome
}

/// Run `probe` over `candidates` in sequential batches. Probes within a
/// batch run concurrently and every one settles before the next batch
/// starts; `batch_delay` paces consecutive batches.
pub async fn sweep_with<F, Fut>(
    candidates: &[Ipv4Addr],
    batch_size: usize,
    batch_delay: Duration,
    probe: F,
    mut on_progress: impl FnMut(SweepProgress),
) -> SweepOutcome
where
    F: Fn(Ipv4Addr) -> Fut,
    Fut: Future<Output = Option<DeviceRecord>>,
{
    let batches = partition(candidates, batch_size);
    let batch_count = batches.len();
    let mut found = DeviceRegistry::new();
    let mut completed = 0;

    for (batch_idx, batch) in batches.into_iter().enumerate() {
        if batch_idx > 0 && !batch_delay.is_zero() {
            tokio::time::sleep(batch_delay).await;
        }

        let results = futures::future::join_all(batch.iter().map(|ip| probe(*ip))).await;

        let mut batch_found = 0;
        for record in results.into_iter().flatten() {
            found.upsert(record);
            batch_found += 1;
        }

        completed += batch.len();
        if batch_found > 0 || (batch_idx + 1) % 3 == 0 {
            tracing::debug!(
                "Discovery progress: {}/{} hosts checked, {} locker(s)",
                completed,
                candidates.len(),
                found.len()
            );
        }

        on_progress(SweepProgress {
            batch: batch_idx + 1,
            batches: batch_count,
            addresses_done: completed,
            addresses_total: candidates.len(),
            hits: found.len(),
        });
    }

    SweepOutcome {
        records: found.into_records(),
        addresses_tried: completed,
        batches: batch_count,
    }
}
