//! A bounded worker pool for the parallel phases.
//!
//! Phase 2 (input parsing) and phase 5d (relocation scan) run one task per
//! input file. Tasks produce private results that the driver merges serially
//! in command-line order, so the observable output never depends on thread
//! interleaving. Workers check a shared cancellation flag between items and
//! drain cleanly once it is set.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Cooperative cancellation flag shared between the driver and workers.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    /// A flag in the clear state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Run `work(index)` for every index in `0..count` on at most `threads`
/// workers and return the results in index order. Items claimed after the
/// cancel flag is set yield `None`.
pub fn run_indexed<T, F>(
    threads: usize,
    count: usize,
    cancel: &CancelFlag,
    work: F,
) -> Vec<Option<T>>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    let threads = threads.clamp(1, count.max(1));
    if threads == 1 || count <= 1 {
        return (0..count)
            .map(|i| if cancel.is_set() { None } else { Some(work(i)) })
            .collect();
    }
    let next = AtomicUsize::new(0);
    let results: Mutex<Vec<Option<T>>> = Mutex::new((0..count).map(|_| None).collect());
    std::thread::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|| loop {
                let idx = next.fetch_add(1, Ordering::Relaxed);
                if idx >= count || cancel.is_set() {
                    break;
                }
                let value = work(idx);
                if let Ok(mut res) = results.lock() {
                    res[idx] = Some(value);
                }
            });
        }
    });
    results.into_inner().unwrap_or_default()
}

/// Default worker count: the available parallelism, bounded to keep task
/// startup cheap for small links.
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(16)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_in_index_order() {
        let cancel = CancelFlag::new();
        let out = run_indexed(4, 32, &cancel, |i| i * 2);
        let values: Vec<usize> = out.into_iter().map(|v| v.unwrap()).collect();
        assert_eq!(values, (0..32).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_cancel_stops_new_work() {
        let cancel = CancelFlag::new();
        cancel.set();
        let out = run_indexed(4, 8, &cancel, |i| i);
        assert!(out.iter().all(|v| v.is_none()));
    }

    #[test]
    fn test_single_item_runs_inline() {
        let cancel = CancelFlag::new();
        let out = run_indexed(8, 1, &cancel, |i| i + 1);
        assert_eq!(out, vec![Some(1)]);
    }
}
