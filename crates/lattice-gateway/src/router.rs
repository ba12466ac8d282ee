// Pluggable routing policy for client events.
use crate::core::WorkerEntry;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks a destination worker connection for one client event. Called
/// with a snapshot of the currently attached pool; `None` means no
/// worker is available and the caller decides the drop policy.
pub trait WorkerRouter: Send + Sync {
    fn route(&self, pool: &[WorkerEntry], fd: u64, cmd: u16) -> Option<usize>;
}

/// Default affinity-free policy: plain round-robin over the pool.
#[derive(Debug, Default)]
pub struct RoundRobinRouter {
    next: AtomicUsize,
}

impl WorkerRouter for RoundRobinRouter {
    fn route(&self, pool: &[WorkerEntry], _fd: u64, _cmd: u16) -> Option<usize> {
        if pool.is_empty() {
            return None;
        }
        Some(self.next.fetch_add(1, Ordering::Relaxed) % pool.len())
    }
}
