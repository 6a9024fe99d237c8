//! Kademlia routing table implementation
//!
//! Peers are grouped into 256 buckets by the length of the prefix their ID
//! shares with ours. Each bucket keeps at most `k` entries ordered from
//! least to most recently seen, plus a short list of verified replacements
//! that arrived while it was full.

use sonar_core::{NodeId, NodeRecord, NODE_ID_BITS};
use std::collections::VecDeque;
use std::ops::Range;
use std::time::{Duration, Instant};

/// Maximum replacement candidates kept per bucket
pub const MAX_REPLACEMENTS: usize = 10;

/// Bucket for `id` relative to `local`: the length of their shared prefix
///
/// Returns `None` for the local ID itself.
pub fn bucket_index(local: &NodeId, id: &NodeId) -> Option<usize> {
    let prefix = local.distance(id).leading_zeros();
    (prefix < NODE_ID_BITS).then_some(prefix)
}

/// Outcome of [`RoutingTable::observe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Added as the most recently seen entry of its bucket
    Inserted,
    /// Already present; moved to most recently seen
    Refreshed,
    /// Bucket is full. The record is held as a replacement and the least
    /// recently seen entry should be challenged.
    BucketFull { least_recent: NodeRecord },
    /// The local node is never stored
    Ignored,
}

/// A record deleted by [`RoutingTable::remove`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub removed: NodeRecord,
    /// Replacement moved into the freed slot
    pub promoted: Option<NodeRecord>,
}

/// A k-bucket in the routing table
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Maximum number of nodes in this bucket
    k: usize,
    /// Nodes in this bucket, ordered by last seen (most recent at back)
    nodes: VecDeque<NodeRecord>,
    /// Candidates for a freed slot, freshest at back
    replacements: VecDeque<NodeRecord>,
    last_updated: Instant,
}

impl KBucket {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            nodes: VecDeque::with_capacity(k),
            replacements: VecDeque::new(),
            last_updated: Instant::now(),
        }
    }

    fn observe(&mut self, record: NodeRecord) -> Observation {
        if let Some(pos) = self.nodes.iter().position(|n| n.id == record.id) {
            if let Some(mut existing) = self.nodes.remove(pos) {
                existing.endpoint = record.endpoint;
                existing.seq = existing.seq.max(record.seq);
                existing.last_seen = existing.last_seen.max(record.last_seen);
                existing.last_ping = existing.last_ping.max(record.last_ping);
                existing.fail_count = 0;
                self.nodes.push_back(existing);
            }
            self.last_updated = Instant::now();
            return Observation::Refreshed;
        }

        self.replacements.retain(|n| n.id != record.id);

        if self.nodes.len() < self.k {
            self.nodes.push_back(record);
            self.last_updated = Instant::now();
            return Observation::Inserted;
        }

        self.replacements.push_back(record);
        if self.replacements.len() > MAX_REPLACEMENTS {
            self.replacements.pop_front();
        }
        match self.nodes.front() {
            Some(least_recent) => Observation::BucketFull {
                least_recent: least_recent.clone(),
            },
            // Only reachable with k == 0
            None => Observation::Ignored,
        }
    }

    fn remove(&mut self, id: &NodeId) -> Option<Removal> {
        if let Some(pos) = self.nodes.iter().position(|n| &n.id == id) {
            let removed = self.nodes.remove(pos)?;
            let promoted = self.replacements.pop_back();
            if let Some(promoted) = &promoted {
                self.nodes.push_back(promoted.clone());
            }
            return Some(Removal { removed, promoted });
        }

        let pos = self.replacements.iter().position(|n| &n.id == id)?;
        let removed = self.replacements.remove(pos)?;
        Some(Removal {
            removed,
            promoted: None,
        })
    }

    fn get_mut(&mut self, id: &NodeId) -> Option<&mut NodeRecord> {
        self.nodes.iter_mut().find(|n| &n.id == id)
    }

    /// Get all nodes in the bucket, least recently seen first
    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.iter()
    }

    pub fn replacements(&self) -> impl Iterator<Item = &NodeRecord> {
        self.replacements.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check if bucket is full
    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.k
    }

    pub fn least_recent(&self) -> Option<&NodeRecord> {
        self.nodes.front()
    }
}

/// Kademlia routing table
pub struct RoutingTable {
    /// Our own record
    local: NodeRecord,
    /// K-buckets (256 buckets for 256-bit IDs)
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local: NodeRecord, k: usize) -> Self {
        Self {
            local,
            buckets: (0..NODE_ID_BITS).map(|_| KBucket::new(k)).collect(),
        }
    }

    pub fn local_record(&self) -> &NodeRecord {
        &self.local
    }

    pub fn local_id(&self) -> NodeId {
        self.local.id
    }

    pub fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        bucket_index(&self.local.id, id)
    }

    /// Insert or refresh a record that has just proven liveness
    pub fn observe(&mut self, record: NodeRecord) -> Observation {
        match self.bucket_index(&record.id) {
            Some(index) => self.buckets[index].observe(record),
            None => Observation::Ignored,
        }
    }

    /// Delete a record, promoting the freshest replacement into its slot
    pub fn remove(&mut self, id: &NodeId) -> Option<Removal> {
        let index = self.bucket_index(id)?;
        self.buckets[index].remove(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeRecord> {
        let index = self.bucket_index(id)?;
        self.buckets[index].nodes().find(|n| &n.id == id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Count a failed liveness check, returning the new total
    pub fn record_failure(&mut self, id: &NodeId) -> Option<u32> {
        let index = self.bucket_index(id)?;
        let record = self.buckets[index].get_mut(id)?;
        record.fail_count = record.fail_count.saturating_add(1);
        Some(record.fail_count)
    }

    pub fn mark_pinged(&mut self, id: &NodeId, now: u64) {
        if let Some(index) = self.bucket_index(id) {
            if let Some(record) = self.buckets[index].get_mut(id) {
                record.last_ping = now;
            }
        }
    }

    /// The `count` records closest to `target`, nearest first
    ///
    /// Buckets are visited outward from the target's own bucket: records
    /// in that bucket are strictly closer than those in deeper buckets,
    /// which in turn are closer than any shallower bucket. Scanning stops
    /// once a whole group has been taken and `count` records are in hand.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<NodeRecord> {
        if count == 0 {
            return Vec::new();
        }

        let prefix = self.local.id.distance(target).leading_zeros();
        let mut groups: Vec<Range<usize>> = Vec::with_capacity(prefix + 2);
        if prefix < NODE_ID_BITS {
            groups.push(prefix..prefix + 1);
            groups.push(prefix + 1..NODE_ID_BITS);
        }
        groups.extend((0..prefix.min(NODE_ID_BITS)).rev().map(|i| i..i + 1));

        let mut found: Vec<NodeRecord> = Vec::new();
        for group in groups {
            if found.len() >= count {
                break;
            }
            for index in group {
                found.extend(self.buckets[index].nodes().cloned());
            }
        }

        found.sort_by(|a, b| {
            a.id.distance(target)
                .cmp(&b.id.distance(target))
                .then_with(|| a.id.cmp(&b.id))
        });
        found.truncate(count);
        found
    }

    /// All stored records, bucket by bucket
    pub fn records(&self) -> impl Iterator<Item = &NodeRecord> {
        self.buckets.iter().flat_map(|b| b.nodes())
    }

    pub fn bucket_nodes(&self, index: usize) -> impl Iterator<Item = &NodeRecord> {
        self.buckets.get(index).into_iter().flat_map(|b| b.nodes())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    /// Indices of non-empty buckets
    pub fn occupied_buckets(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Least recently seen entry of a bucket: the next one to revalidate
    pub fn least_recent(&self, index: usize) -> Option<&NodeRecord> {
        self.buckets.get(index)?.least_recent()
    }

    /// Buckets below `limit` not updated within `max_age`
    pub fn stale_buckets(&self, max_age: Duration, limit: usize) -> Vec<usize> {
        self.buckets
            .iter()
            .take(limit)
            .enumerate()
            .filter(|(_, b)| b.last_updated.elapsed() >= max_age)
            .map(|(i, _)| i)
            .collect()
    }

    /// Note that a bucket has just been refreshed by a lookup
    pub fn mark_refreshed(&mut self, index: usize) {
        if let Some(bucket) = self.buckets.get_mut(index) {
            bucket.last_updated = Instant::now();
        }
    }
}
