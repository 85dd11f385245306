//! Request deduplication for side-effecting commands.
//!
//! Clients retry `send.text` and launch requests on flaky links. Each retry
//! carries the same request id, so the first call's effect is shared by every
//! retry: in flight, the retry awaits the same future; once settled
//! successfully, the retry gets the cached result until the TTL runs out.
//! Failed operations are forgotten immediately so a retry really re-runs.
//!
//! The table is bounded: inserts prune expired entries and then evict the
//! oldest inserted entries while over capacity.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

/// A result the executor can classify as success or failure.
pub trait Outcome: Clone + Send + Sync + 'static {
    fn is_success(&self) -> bool;
}

impl<T, E> Outcome for Result<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn is_success(&self) -> bool {
        self.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("request id was already used with a different payload")]
pub struct PayloadMismatch;

/// Canonical fingerprint of a request payload (serde_json sorts map keys).
pub fn fingerprint_of<T: Serialize>(payload: &T) -> String {
    serde_json::to_string(payload).unwrap_or_default()
}

struct Entry<R: Outcome> {
    id: u64,
    /// Only meaningful once settled; in-flight entries never expire.
    expires_at: Instant,
    fingerprint: String,
    settled: bool,
    succeeded: bool,
    result: Shared<BoxFuture<'static, R>>,
}

struct EntryTable<R: Outcome> {
    entries: HashMap<String, Entry<R>>,
    order: VecDeque<(String, u64)>,
    next_id: u64,
}

enum Lookup<R: Outcome> {
    Miss,
    Mismatch,
    Reuse(Shared<BoxFuture<'static, R>>),
}

impl<R: Outcome> EntryTable<R> {
    fn lookup(&mut self, key: &str, fingerprint: &str, now: Instant) -> Lookup<R> {
        let Some(entry) = self.entries.get(key) else {
            return Lookup::Miss;
        };
        if entry.settled && entry.expires_at <= now {
            self.entries.remove(key);
            return Lookup::Miss;
        }
        if entry.fingerprint != fingerprint {
            return Lookup::Mismatch;
        }
        if !entry.settled || entry.succeeded {
            return Lookup::Reuse(entry.result.clone());
        }
        self.entries.remove(key);
        Lookup::Miss
    }

    fn insert(&mut self, key: String, entry: Entry<R>, now: Instant, max_entries: usize) {
        self.entries
            .retain(|_, e| !(e.settled && e.expires_at <= now));
        let entries = &self.entries;
        self.order
            .retain(|(k, id)| entries.get(k).is_some_and(|e| e.id == *id));

        self.order.push_back((key.clone(), entry.id));
        self.entries.insert(key, entry);

        while self.entries.len() > max_entries {
            let Some((oldest, id)) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&oldest).is_some_and(|e| e.id == id) {
                debug!(key = %oldest, "idempotency table full, evicting oldest entry");
                self.entries.remove(&oldest);
            }
        }
    }
}

/// TTL-bounded, capacity-bounded request deduplicator.
pub struct IdempotentExecutor<R: Outcome> {
    table: Arc<Mutex<EntryTable<R>>>,
    ttl: Duration,
    max_entries: usize,
}

impl<R: Outcome> IdempotentExecutor<R> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            table: Arc::new(Mutex::new(EntryTable {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_id: 0,
            })),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Run `run` at most once per `(key, fingerprint)` within the TTL.
    ///
    /// Without a key the operation always runs. The operation is driven on
    /// its own task, so dropping the returned future never cancels it.
    pub async fn execute<F, Fut>(
        &self,
        key: Option<&str>,
        fingerprint: &str,
        run: F,
    ) -> Result<R, PayloadMismatch>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R> + Send + 'static,
    {
        let Some(key) = key.filter(|k| !k.is_empty()) else {
            let detached = run().boxed().shared();
            tokio::spawn(detached.clone());
            return Ok(detached.await);
        };

        let shared = {
            let mut table = lock(&self.table);
            let now = Instant::now();
            match table.lookup(key, fingerprint, now) {
                Lookup::Mismatch => return Err(PayloadMismatch),
                Lookup::Reuse(shared) => {
                    debug!(key, "reusing idempotent result");
                    shared
                }
                Lookup::Miss => {
                    let id = table.next_id;
                    table.next_id += 1;

                    let fut = run();
                    let settle_table = Arc::clone(&self.table);
                    let settle_key = key.to_string();
                    let ttl = self.ttl;
                    let shared = async move {
                        let result = fut.await;
                        settle(&settle_table, &settle_key, id, result.is_success(), ttl);
                        result
                    }
                    .boxed()
                    .shared();

                    table.insert(
                        key.to_string(),
                        Entry {
                            id,
                            expires_at: now + self.ttl,
                            fingerprint: fingerprint.to_string(),
                            settled: false,
                            succeeded: false,
                            result: shared.clone(),
                        },
                        now,
                        self.max_entries,
                    );
                    tokio::spawn(shared.clone());
                    shared
                }
            }
        };

        Ok(shared.await)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        lock(&self.table).entries.len()
    }
}

fn lock<R: Outcome>(table: &Mutex<EntryTable<R>>) -> MutexGuard<'_, EntryTable<R>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn settle<R: Outcome>(table: &Mutex<EntryTable<R>>, key: &str, id: u64, succeeded: bool, ttl: Duration) {
    let mut table = lock(table);
    let Some(entry) = table.entries.get_mut(key) else {
        return;
    };
    if entry.id != id {
        return;
    }
    if succeeded {
        entry.settled = true;
        entry.succeeded = true;
        entry.expires_at = Instant::now() + ttl;
    } else {
        debug!(key, "operation failed, dropping idempotency entry");
        table.entries.remove(key);
    }
}
