//! Echo suppression for remote applies.
//!
//! Applying a remote snapshot mutates the surface, and the surface reports
//! every mutation through its change callback. Without a guard that change
//! would be sealed and broadcast straight back to the room.
//!
//! The guard is counted rather than a plain flag so overlapping holds (a
//! deferred release still pending while the next apply starts) do not clear
//! each other early.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared suppression state between the inbound and outbound paths.
#[derive(Debug, Clone, Default)]
pub struct EchoSuppressor {
    holds: Arc<AtomicUsize>,
}

impl EchoSuppressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engage suppression until the returned guard is dropped.
    pub fn engage(&self) -> EchoGuard {
        self.holds.fetch_add(1, Ordering::SeqCst);
        EchoGuard {
            holds: self.holds.clone(),
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.holds.load(Ordering::SeqCst) > 0
    }
}

/// RAII hold on an [`EchoSuppressor`]. Released on drop, including unwinding.
#[must_use = "suppression ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct EchoGuard {
    holds: Arc<AtomicUsize>,
}

impl EchoGuard {
    /// Keep the hold for `delay`, then release it.
    ///
    /// Used for surfaces that report changes after `update_scene` returns.
    pub fn release_after(self, delay: Duration) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    drop(self);
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    drop(self);
                });
            }
        }
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        self.holds.fetch_sub(1, Ordering::SeqCst);
    }
}
