//! Iterative node lookup
//!
//! Starting from the routing table's closest entries, each round asks up to
//! `alpha` of the closest not-yet-queried candidates for their neighbors in
//! parallel and merges the answers into a shortlist of the `count` closest
//! IDs seen so far. The lookup ends when a round leaves the closest
//! candidate unchanged, when nothing is left to query, after
//! `max_lookup_rounds`, or when the engine starts shutting down.

use crate::protocol::Engine;
use sonar_core::{NodeId, NodeRecord, PublicKey, Transport};
use std::collections::HashSet;
use tokio::task::JoinSet;

/// Find the `count` nodes closest to `target`
pub async fn lookup<T: Transport>(engine: &Engine<T>, target: &PublicKey, count: usize) -> Vec<NodeRecord> {
    let target_id = target.id();
    let config = engine.config();
    let alpha = config.alpha.max(1);

    let mut shortlist = engine.closest(&target_id, count).await;
    let mut seen: HashSet<NodeId> = shortlist.iter().map(|r| r.id).collect();
    seen.insert(engine.local_id());
    let mut queried: HashSet<NodeId> = HashSet::new();
    let mut failed: HashSet<NodeId> = HashSet::new();
    let mut closest = shortlist.first().map(|r| r.id);
    let mut rounds = 0;

    'rounds: while rounds < config.max_lookup_rounds {
        let batch: Vec<NodeRecord> = shortlist
            .iter()
            .filter(|r| !queried.contains(&r.id))
            .take(alpha)
            .cloned()
            .collect();
        if batch.is_empty() {
            break;
        }
        rounds += 1;

        let mut requests = JoinSet::new();
        for peer in batch {
            queried.insert(peer.id);
            let engine = engine.clone();
            let target = *target;
            requests.spawn(async move {
                let result = engine.find_node(&peer, &target).await;
                (peer, result)
            });
        }

        loop {
            let joined = tokio::select! {
                joined = requests.join_next() => joined,
                _ = engine.closing().cancelled() => {
                    requests.abort_all();
                    break 'rounds;
                }
            };
            let Some(joined) = joined else {
                break;
            };

            match joined {
                Ok((_, Ok(records))) => {
                    for record in records {
                        if seen.insert(record.id) {
                            shortlist.push(record);
                        }
                    }
                }
                Ok((peer, Err(e))) => {
                    tracing::debug!(node = %peer.id.short(), error = %e, "lookup query failed");
                    failed.insert(peer.id);
                }
                Err(e) => tracing::warn!(error = %e, "lookup task failed"),
            }
        }

        shortlist.retain(|r| !failed.contains(&r.id));
        shortlist.sort_by(|a, b| {
            a.id.distance(&target_id)
                .cmp(&b.id.distance(&target_id))
                .then_with(|| a.id.cmp(&b.id))
        });
        shortlist.truncate(count);

        let now_closest = shortlist.first().map(|r| r.id);
        if now_closest == closest {
            break;
        }
        closest = now_closest;
    }

    tracing::info!(
        target = %target_id.short(),
        rounds,
        queried = queried.len(),
        found = shortlist.len(),
        "lookup completed"
    );
    shortlist
}
