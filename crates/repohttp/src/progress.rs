//! Upload progress accounting.
//!
//! A process-wide registry maps the client-chosen `X-Progress-ID` of each
//! in-flight upload to its [`Progress`] counters. The registry mutex only
//! guards the map structure; the `uploaded` counter is an atomic so the
//! owning request can bump it on every body chunk without taking the lock,
//! while the polling endpoint still observes consistent 64-bit values.
//!
//! This registry is the only global state in the crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

/// Byte counters of one in-flight upload.
#[derive(Debug)]
pub struct Progress {
    uploaded: AtomicI64,
    size: i64,
}

impl Progress {
    /// Creates counters for a request with the given declared
    /// Content-Length.
    pub fn new(size: i64) -> Self {
        Self {
            uploaded: AtomicI64::new(0),
            size,
        }
    }

    /// Adds `n` wire bytes. Called by the owning request before each chunk
    /// is parsed; `uploaded` therefore counts received body bytes, not
    /// bytes written to disk.
    pub fn add_uploaded(&self, n: i64) {
        self.uploaded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn uploaded(&self) -> i64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// The declared Content-Length; constant for the request's lifetime.
    pub fn size(&self) -> i64 {
        self.size
    }
}

/// Process-wide `progress id → counters` map.
#[derive(Debug, Default)]
pub struct ProgressRegistry {
    entries: Mutex<HashMap<String, Arc<Progress>>>,
}

impl ProgressRegistry {
    pub fn insert(&self, id: &str, progress: Arc<Progress>) {
        debug!("register upload progress {id}");
        self.lock().insert(id.to_owned(), progress);
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Progress>> {
        self.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) {
        debug!("remove upload progress {id}");
        self.lock().remove(id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Progress>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

static REGISTRY: OnceLock<ProgressRegistry> = OnceLock::new();

/// Initializes the global registry. Invoked by the service builder; calling
/// it more than once is harmless.
pub fn init() {
    let _ = REGISTRY.set(ProgressRegistry::default());
}

/// The global registry, initializing it on first use.
pub fn registry() -> &'static ProgressRegistry {
    REGISTRY.get_or_init(ProgressRegistry::default)
}
