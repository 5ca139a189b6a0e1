//! An in-memory key-value store served over HTTP, built around cooperative,
//! queued, per-key advisory locks with opaque lock ids.
//!
//! Clients write a value only while holding an entry's current lock id.
//! When the lock is taken, the request joins a per-key FIFO waitlist until
//! the holder releases or a bounded timeout evicts the waiter. Two single
//! tasks own all the shared state between them: the atomics dispatcher
//! serializes every entry mutation, and the waitlist dispatcher owns the
//! waiter queues and the release handoff.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate tracing;

pub mod atomic;
pub mod base;
pub mod config;
pub mod entry;
pub mod registry;
pub mod server;
pub mod waitlist;

use crate::{
    atomic::{AtomicDispatcher, Atomics},
    config::AppConfig,
    entry::EntryStore,
    registry::TokenRegistry,
    waitlist::{Waitlist, WaitlistDispatcher},
};

/// The running core: both dispatcher tasks, wired to the entry store and
/// the token registry.
pub struct Turnstile {
    pub store: Arc<EntryStore>,
    pub locks: Arc<TokenRegistry>,
    pub atomics: Atomics,
    pub waitlist: Waitlist,
    stop: broadcast::Sender<()>,
}

impl Turnstile {
    /// Spawns the atomics and waitlist dispatchers and wires them together:
    /// the atomics dispatcher feeds release events to the waitlist, which
    /// hands the oldest waiter back into the lock-write queue.
    pub fn launch(config: &AppConfig) -> Self {
        let (stop, _) = broadcast::channel(1);
        let locks = Arc::new(TokenRegistry::new());
        // mpsc::channel panics on a zero capacity.
        let buffer = config.atomic_buffer.max(1) as usize;

        let (release_tx, release_rx) = mpsc::channel(buffer);
        let (atomics, atomic_dispatcher) =
            AtomicDispatcher::new(buffer, locks.clone(), release_tx, stop.subscribe());
        let (waitlist, waitlist_dispatcher) =
            WaitlistDispatcher::new(buffer, atomics.lock_writes(), release_rx, stop.subscribe());

        tokio::spawn(atomic_dispatcher.run());
        tokio::spawn(waitlist_dispatcher.run());

        let store = Arc::new(EntryStore::new(locks.clone(), waitlist.clone()));

        Self {
            store,
            locks,
            atomics,
            waitlist,
            stop,
        }
    }

    /// Signals the dispatcher tasks (and anyone else subscribed) to stop.
    /// In-flight operations get no replies; callers rely on their own
    /// timeouts.
    pub fn stop(&self) {
        let _ = self.stop.send(());
    }

    pub fn stop_signal(&self) -> broadcast::Sender<()> {
        self.stop.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Once;

    static TRACING: Once = Once::new();

    /// Installs a test subscriber once per process; respects `RUST_LOG`.
    pub(crate) fn setup_tracing() {
        TRACING.call_once(|| {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .init();
        });
    }
}
