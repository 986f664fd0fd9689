//! Per-manager collective statistics

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Kind of operation, used both for counters and as the op code published
/// in a rank's control block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum CollectiveKind {
    AllReduce = 1,
    Gather = 2,
    AllGather = 3,
    Barrier = 4,
    Send = 5,
    Recv = 6,
}

impl CollectiveKind {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(CollectiveKind::AllReduce),
            2 => Some(CollectiveKind::Gather),
            3 => Some(CollectiveKind::AllGather),
            4 => Some(CollectiveKind::Barrier),
            5 => Some(CollectiveKind::Send),
            6 => Some(CollectiveKind::Recv),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CollectiveKind::AllReduce => "allreduce",
            CollectiveKind::Gather => "gather",
            CollectiveKind::AllGather => "all_gather",
            CollectiveKind::Barrier => "barrier",
            CollectiveKind::Send => "send",
            CollectiveKind::Recv => "recv",
        }
    }
}

impl std::fmt::Display for CollectiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free counters updated by a manager
#[derive(Debug, Default)]
pub struct CollectiveStats {
    allreduce_calls: AtomicU64,
    gather_calls: AtomicU64,
    all_gather_calls: AtomicU64,
    barrier_calls: AtomicU64,
    send_calls: AtomicU64,
    recv_calls: AtomicU64,
    rounds: AtomicU64,
    bytes_published: AtomicU64,
    bytes_consumed: AtomicU64,
    slow_waits: AtomicU64,
}

impl CollectiveStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self, kind: CollectiveKind) {
        let counter = match kind {
            CollectiveKind::AllReduce => &self.allreduce_calls,
            CollectiveKind::Gather => &self.gather_calls,
            CollectiveKind::AllGather => &self.all_gather_calls,
            CollectiveKind::Barrier => &self.barrier_calls,
            CollectiveKind::Send => &self.send_calls,
            CollectiveKind::Recv => &self.recv_calls,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_round(&self) {
        self.rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self, bytes: usize) {
        self.bytes_published
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_consumed(&self, bytes: usize) {
        self.bytes_consumed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// A wait that outlived the spin phase and blocked in the kernel
    pub fn record_slow_wait(&self) {
        self.slow_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allreduce_calls: self.allreduce_calls.load(Ordering::Relaxed),
            gather_calls: self.gather_calls.load(Ordering::Relaxed),
            all_gather_calls: self.all_gather_calls.load(Ordering::Relaxed),
            barrier_calls: self.barrier_calls.load(Ordering::Relaxed),
            send_calls: self.send_calls.load(Ordering::Relaxed),
            recv_calls: self.recv_calls.load(Ordering::Relaxed),
            rounds: self.rounds.load(Ordering::Relaxed),
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
            bytes_consumed: self.bytes_consumed.load(Ordering::Relaxed),
            slow_waits: self.slow_waits.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CollectiveStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub allreduce_calls: u64,
    pub gather_calls: u64,
    pub all_gather_calls: u64,
    pub barrier_calls: u64,
    pub send_calls: u64,
    pub recv_calls: u64,
    /// Publish/consume rounds, one per chunk
    pub rounds: u64,
    pub bytes_published: u64,
    pub bytes_consumed: u64,
    pub slow_waits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes() {
        for kind in [
            CollectiveKind::AllReduce,
            CollectiveKind::Gather,
            CollectiveKind::AllGather,
            CollectiveKind::Barrier,
            CollectiveKind::Send,
            CollectiveKind::Recv,
        ] {
            assert_eq!(CollectiveKind::from_code(kind.code()), Some(kind));
        }
        // Zero is the value of a never-written control block
        assert_eq!(CollectiveKind::from_code(0), None);
    }

    #[test]
    fn test_snapshot_counts() {
        let stats = CollectiveStats::new();
        stats.record_call(CollectiveKind::AllReduce);
        stats.record_call(CollectiveKind::AllReduce);
        stats.record_call(CollectiveKind::Send);
        stats.record_round();
        stats.record_published(128);
        stats.record_consumed(256);

        let snap = stats.snapshot();
        assert_eq!(snap.allreduce_calls, 2);
        assert_eq!(snap.send_calls, 1);
        assert_eq!(snap.gather_calls, 0);
        assert_eq!(snap.rounds, 1);
        assert_eq!(snap.bytes_published, 128);
        assert_eq!(snap.bytes_consumed, 256);
    }

    #[test]
    fn test_snapshot_serializable() {
        let stats = CollectiveStats::new();
        stats.record_call(CollectiveKind::Barrier);
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"barrier_calls\":1"));
    }
}
