use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Invocation counters of one node, accumulated over the executor's lifetime.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeStats {
    /// Calls into the node's function. Cache hits are not counted.
    pub calls: u64,
    pub invalidations: u64,
    pub total_time: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    invalidations: AtomicU64,
    nanos: AtomicU64,
}

/// Lock-free per-node counters, indexed like the graph's nodes.
#[derive(Debug)]
pub(crate) struct StatsTable {
    counters: Vec<Counters>,
}

impl StatsTable {
    pub(crate) fn new(nodes: usize) -> Self {
        Self {
            counters: (0..nodes).map(|_| Counters::default()).collect(),
        }
    }

    pub(crate) fn record(&self, node: usize, elapsed: Duration, invalidated: bool) {
        let Some(c) = self.counters.get(node) else {
            return;
        };
        c.calls.fetch_add(1, Ordering::Relaxed);
        if invalidated {
            c.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        c.nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub(crate) fn get(&self, node: usize) -> NodeStats {
        self.counters
            .get(node)
            .map(|c| NodeStats {
                calls: c.calls.load(Ordering::Relaxed),
                invalidations: c.invalidations.load(Ordering::Relaxed),
                total_time: Duration::from_nanos(c.nanos.load(Ordering::Relaxed)),
            })
            .unwrap_or_default()
    }

    pub(crate) fn reset(&self) {
        for c in &self.counters {
            c.calls.store(0, Ordering::Relaxed);
            c.invalidations.store(0, Ordering::Relaxed);
            c.nanos.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_reset() {
        let table = StatsTable::new(2);
        table.record(1, Duration::from_millis(3), false);
        table.record(1, Duration::from_millis(2), true);
        let stats = table.get(1);
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.invalidations, 1);
        assert_eq!(stats.total_time, Duration::from_millis(5));
        assert_eq!(table.get(0), NodeStats::default());

        table.reset();
        assert_eq!(table.get(1).calls, 0);
        // Out of range indices are ignored.
        table.record(7, Duration::ZERO, false);
        assert_eq!(table.get(7), NodeStats::default());
    }
}
