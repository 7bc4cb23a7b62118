//! Spawn-join functionality.
//!
//! **You may not need to check this if it is OK to run workers with [`std::thread`].**
//!
//! A key-value store is generally passive. However, some stores need their clients to run on
//! threads they manage, for example to register per-thread resources with a runtime. In that case,
//! the store returns its own [`Thread`] from [`crate::KVStore::thread`], and its join handle needs
//! to implement [`JoinHandle`].
//!
//! Workers do not return values; their results are handed back through shared slots.

use log::warn;

/// A join handle returned by a spawn function.
pub trait JoinHandle {
    /// Join the thread, consume the boxed self. Returns `false` if the thread panicked.
    fn join(self: Box<Self>) -> bool;
}

/// A thread management abstraction.
pub trait Thread {
    /// Spawn a new thread using a boxed closure.
    fn spawn(&self, f: Box<dyn FnOnce() + Send>) -> Box<dyn JoinHandle>;

    /// Yield the current thread.
    fn yield_now(&self);

    /// Pin the current thread to a certain CPU core.
    fn pin(&self, core: usize);
}

/// A zero-sized wrapper for [`std::thread`] functions.
#[derive(Clone)]
pub struct DefaultThread;

/// A wrapper for [`std::thread::JoinHandle`].
pub struct DefaultJoinHandle(std::thread::JoinHandle<()>);

impl JoinHandle for DefaultJoinHandle {
    fn join(self: Box<Self>) -> bool {
        self.0.join().is_ok()
    }
}

impl Thread for DefaultThread {
    fn spawn(&self, f: Box<dyn FnOnce() + Send>) -> Box<dyn JoinHandle> {
        let handle = std::thread::spawn(f);
        Box::new(DefaultJoinHandle(handle))
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn pin(&self, core: usize) {
        match core_affinity::get_core_ids() {
            Some(cores) if !cores.is_empty() => {
                if !core_affinity::set_for_current(cores[core % cores.len()]) {
                    warn!("Failed to pin worker to core {}", core);
                }
            }
            _ => warn!("Core ids are unavailable, worker {} is not pinned", core),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn spawn_join() {
        let counter = Arc::new(AtomicUsize::new(0));
        let thread = DefaultThread;
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let counter = counter.clone();
                thread.spawn(Box::new(move || {
                    DefaultThread.pin(i);
                    counter.fetch_add(1, Ordering::Relaxed);
                }))
            })
            .collect();
        assert!(handles.into_iter().all(|h| h.join()));
        assert_eq!(counter.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn panicked_worker_is_reported() {
        let handle = DefaultThread.spawn(Box::new(|| panic!("worker panic")));
        assert!(!handle.join());
    }
}
