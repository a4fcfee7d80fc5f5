use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Identifies one in-flight execution across the controller process:
/// the agent address plus the run identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvocationKey {
    host: String,
    port: u16,
    run_id: i64,
}

impl InvocationKey {
    pub fn new(host: impl Into<String>, port: u16, run_id: i64) -> Self {
        Self {
            host: host.into(),
            port,
            run_id,
        }
    }
}

impl fmt::Display for InvocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.run_id)
    }
}

#[derive(Debug)]
struct Entry {
    generation: u64,
    trigger: CancellationToken,
}

/// Concurrent map from invocation key to the cancellation trigger of the
/// RPC currently running under that key.
///
/// Entries are only created through [`register`](Self::register), whose guard
/// removes the entry when dropped, so every exit path of a call releases it.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    entries: DashMap<InvocationKey, Entry>,
    generation: AtomicU64,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `trigger` under `key` and return a guard that unregisters it.
    ///
    /// A stale entry under the same key is replaced, and the stale guard will
    /// not remove the newer entry when it drops.
    pub fn register(self: &Arc<Self>, key: InvocationKey, trigger: CancellationToken) -> Registration {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let previous = self.entries.insert(
            key.clone(),
            Entry {
                generation,
                trigger,
            },
        );
        if previous.is_some() {
            tracing::warn!(key = %key, "Replaced existing cancellation entry");
        }
        tracing::debug!(key = %key, "Registered cancellation trigger");

        Registration {
            registry: Arc::clone(self),
            key,
            generation,
        }
    }

    /// Trigger registered under `key`. A miss means the run already finished
    /// or was started by an earlier controller process.
    pub fn lookup(&self, key: &InvocationKey) -> Option<CancellationToken> {
        self.entries.get(key).map(|entry| entry.trigger.clone())
    }

    fn unregister(&self, key: &InvocationKey, generation: u64) {
        self.entries
            .remove_if(key, |_, entry| entry.generation == generation);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scoped registry entry; dropping it unregisters the key.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<CancellationRegistry>,
    key: InvocationKey,
    generation: u64,
}

impl Registration {
    pub fn key(&self) -> &InvocationKey {
        &self.key
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.key, self.generation);
        tracing::debug!(key = %self.key, "Unregistered cancellation trigger");
    }
}
