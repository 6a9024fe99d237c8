//! Periodic table maintenance
//!
//! Three independent loops, each ending when the engine starts closing:
//! bootstrap pings every configured seed, refresh runs a self lookup and
//! then a lookup aimed at one stale bucket, and revalidation pings the least
//! recently seen entry of a random bucket.

use crate::lookup::lookup;
use crate::protocol::Engine;
use crate::routing::bucket_index;
use crate::{random_index, DhtError, Result};
use sonar_core::{random_bytes, NodeId, NodeRecord, PublicKey, Transport};
use tokio::task::JoinSet;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

/// Only the farthest buckets are refreshed by targeted lookups; the self
/// lookup covers the rest, and deeper targets get exponentially costlier
/// to find.
const REFRESH_BUCKET_LIMIT: usize = 16;

/// Random keys tried when searching for a target in a given bucket
const MAX_TARGET_ATTEMPTS: u64 = 1 << 20;

pub(crate) async fn bootstrap_loop<T: Transport>(engine: Engine<T>) {
    let seeds: Vec<NodeRecord> = engine
        .config()
        .bootstrap_seeds
        .iter()
        .filter(|seed| seed.id != engine.local_id())
        .cloned()
        .collect();
    if seeds.is_empty() {
        tracing::debug!("no bootstrap seeds configured");
        return;
    }

    let mut ticks = interval(engine.config().ping_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = engine.closing().cancelled() => break,
            _ = ticks.tick() => {}
        }
        ping_seeds(&engine, &seeds).await;
    }
    tracing::debug!("bootstrap loop stopped");
}

async fn ping_seeds<T: Transport>(engine: &Engine<T>, seeds: &[NodeRecord]) {
    let mut pings = JoinSet::new();
    for seed in seeds {
        let engine = engine.clone();
        let seed = seed.clone();
        pings.spawn(async move { engine.ping(&seed).await.is_ok() });
    }

    let mut alive = 0;
    while let Some(result) = pings.join_next().await {
        if matches!(result, Ok(true)) {
            alive += 1;
        }
    }
    tracing::debug!(alive, seeds = seeds.len(), "pinged bootstrap seeds");
}

pub(crate) async fn refresh_loop<T: Transport>(engine: Engine<T>) {
    let config = engine.config();
    // Give the first seed pings a chance to land
    let start = Instant::now() + config.request_timeout * 2;
    let mut ticks = interval_at(start, config.refresh_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = engine.closing().cancelled() => break,
            _ = ticks.tick() => {}
        }
        if let Err(e) = refresh(&engine).await {
            tracing::warn!(error = %e, "bucket refresh failed");
        }
    }
    tracing::debug!("refresh loop stopped");
}

async fn refresh<T: Transport>(engine: &Engine<T>) -> Result<()> {
    let k = engine.config().k;
    let own_key = engine.local_record().public_key;
    lookup(engine, &own_key, k).await;

    let max_age = engine.config().refresh_interval;
    let stale = engine
        .with_table(|table| table.stale_buckets(max_age, REFRESH_BUCKET_LIMIT))
        .await;
    if stale.is_empty() || engine.closing().is_cancelled() {
        return Ok(());
    }

    let index = stale[random_index(stale.len())?];
    let local = engine.local_id();
    let target = tokio::task::spawn_blocking(move || target_in_bucket(&local, index, MAX_TARGET_ATTEMPTS))
        .await
        .map_err(|e| DhtError::Network(format!("target search failed: {}", e)))??;

    match target {
        Some(target) => {
            tracing::debug!(bucket = index, "refreshing stale bucket");
            lookup(engine, &target, k).await;
            engine.with_table(|table| table.mark_refreshed(index)).await;
        }
        None => tracing::debug!(bucket = index, "no refresh target found"),
    }
    Ok(())
}

/// A random key whose node ID falls in bucket `index` relative to `local`
pub(crate) fn target_in_bucket(local: &NodeId, index: usize, max_attempts: u64) -> Result<Option<PublicKey>> {
    let mut key: [u8; 64] = random_bytes()?;
    let mut counter = [0u8; 8];
    counter.copy_from_slice(&key[..8]);
    let base = u64::from_le_bytes(counter);

    for attempt in 0..max_attempts {
        key[..8].copy_from_slice(&base.wrapping_add(attempt).to_le_bytes());
        let candidate = PublicKey::new(key);
        if bucket_index(local, &candidate.id()) == Some(index) {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

pub(crate) async fn revalidate_loop<T: Transport>(engine: Engine<T>) {
    let mut ticks = interval(engine.config().revalidate_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = engine.closing().cancelled() => break,
            _ = ticks.tick() => {}
        }
        revalidate(&engine).await;
    }
    tracing::debug!("revalidate loop stopped");
}

async fn revalidate<T: Transport>(engine: &Engine<T>) {
    let candidate = engine
        .with_table(|table| {
            let occupied = table.occupied_buckets();
            if occupied.is_empty() {
                return None;
            }
            let index = occupied[random_index(occupied.len()).unwrap_or(0)];
            table.least_recent(index).cloned()
        })
        .await;

    // Failures are counted by ping itself
    if let Some(record) = candidate {
        if engine.ping(&record).await.is_ok() {
            tracing::trace!(node = %record.id.short(), "revalidated peer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_in_bucket() {
        let local = PublicKey::new([5u8; 64]).id();
        for index in [0, 1, 4, 8] {
            let target = target_in_bucket(&local, index, MAX_TARGET_ATTEMPTS)
                .unwrap()
                .unwrap();
            assert_eq!(bucket_index(&local, &target.id()), Some(index));
        }
    }

    #[test]
    fn test_target_search_gives_up() {
        let local = PublicKey::new([5u8; 64]).id();
        assert_eq!(target_in_bucket(&local, 200, 16).unwrap(), None);
    }
}
