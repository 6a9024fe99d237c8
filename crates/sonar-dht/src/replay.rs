use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Hashes of recently accepted packets.
///
/// A packet is accepted only while its expiration lies within
/// `MAX_EXPIRATION_DRIFT_SECS` of now, so remembering hashes for that long
/// is enough to reject every replay. Two generations are kept: on rotation
/// the current set becomes the previous one, giving each hash between one
/// and two windows of memory.
#[derive(Debug)]
pub(crate) struct ReplayCache {
    current: HashSet<[u8; 32]>,
    previous: HashSet<[u8; 32]>,
    window_start: Instant,
    window: Duration,
    /// Per-generation cap; reaching it forces an early rotation
    capacity: usize,
}

impl ReplayCache {
    pub(crate) fn new(window: Duration, capacity: usize) -> Self {
        Self {
            current: HashSet::new(),
            previous: HashSet::new(),
            window_start: Instant::now(),
            window,
            capacity,
        }
    }

    /// Record a packet hash. Returns `false` if it was already seen.
    pub(crate) fn check(&mut self, hash: &[u8; 32]) -> bool {
        self.rotate_if_due();

        if self.current.contains(hash) || self.previous.contains(hash) {
            return false;
        }
        if self.current.len() >= self.capacity {
            self.rotate();
        }
        self.current.insert(*hash);
        true
    }

    pub(crate) fn rotate_if_due(&mut self) {
        if self.window_start.elapsed() >= self.window {
            self.rotate();
        }
    }

    fn rotate(&mut self) {
        self.previous = std::mem::take(&mut self.current);
        self.window_start = Instant::now();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.current.len() + self.previous.len()
    }
}
