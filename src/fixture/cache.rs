// src/fixture/cache.rs

//! Memoized fixture instances keyed by (fixture, scope key, param).
//!
//! Every entry is built at most once: concurrent requests for a key that is
//! still being built wait on the entry's lock and then observe the memoized
//! value, or the memoized error. Entries with a teardown also carry a
//! consumer count; the release that takes the count from one to zero resumes
//! the teardown.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::errors::SharedError;
use crate::exec::task::TaskDescriptor;
use crate::fixture::descriptor::{Built, FixtureDescriptor, FixtureValue, Teardown};
use crate::types::Scope;

/// Which instance of a fixture a key refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKey {
    Session,
    Module(String),
    /// Function-scope entries live in a per-task cache, so no task id is needed.
    Function,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub fixture: String,
    pub scope: ScopeKey,
    pub param: Option<usize>,
}

impl CacheKey {
    /// The key under which `fixture` is cached for `task`.
    pub fn for_task(fixture: &FixtureDescriptor, task: &TaskDescriptor) -> Self {
        let scope = match fixture.get_scope() {
            Scope::Session => ScopeKey::Session,
            Scope::Module => ScopeKey::Module(task.module.clone()),
            Scope::Function => ScopeKey::Function,
        };
        let param = fixture
            .get_params()
            .and_then(|_| task.fixture_params.get(fixture.name()).copied());
        Self {
            fixture: fixture.name().to_string(),
            scope,
            param,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fixture)?;
        match &self.scope {
            ScopeKey::Session => f.write_str("[session]")?,
            ScopeKey::Module(m) => write!(f, "[module {m}]")?,
            ScopeKey::Function => {}
        }
        if let Some(p) = self.param {
            write!(f, "[{p}]")?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct EntryState {
    value: Option<Result<FixtureValue, SharedError>>,
    teardown: Option<Teardown>,
}

/// One memoized fixture instance.
#[derive(Default)]
pub struct CacheEntry {
    state: tokio::sync::Mutex<EntryState>,
    consumers: AtomicUsize,
    builds: AtomicUsize,
}

impl CacheEntry {
    /// Return the memoized outcome, running `build` if nobody has yet.
    pub async fn get_or_build<F, Fut>(&self, build: F) -> Result<FixtureValue, SharedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Built>>,
    {
        let mut state = self.state.lock().await;
        if let Some(memo) = &state.value {
            return memo.clone();
        }

        self.builds.fetch_add(1, Ordering::SeqCst);
        match build().await {
            Ok(built) => {
                state.value = Some(Ok(built.value.clone()));
                state.teardown = built.teardown;
                Ok(built.value)
            }
            Err(err) => {
                let err: SharedError = Arc::new(err);
                state.value = Some(Err(err.clone()));
                Err(err)
            }
        }
    }

    /// Take the pending teardown, leaving nothing to resume twice.
    pub async fn take_teardown(&self) -> Option<Teardown> {
        self.state.lock().await.teardown.take()
    }

    pub fn consumers(&self) -> usize {
        self.consumers.load(Ordering::SeqCst)
    }

    /// Number of times the builder has been invoked (0 or 1).
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

/// A map of cache entries plus the reservation counters that decide when a
/// shared instance is torn down.
#[derive(Default)]
pub struct FixtureCache {
    entries: Mutex<HashMap<CacheKey, Arc<CacheEntry>>>,
}

impl FixtureCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Arc<CacheEntry>>> {
        // Only inserts and lookups happen under the lock.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The entry for `key`, installed if absent.
    pub fn entry(&self, key: &CacheKey) -> Arc<CacheEntry> {
        self.lock().entry(key.clone()).or_default().clone()
    }

    pub fn existing(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.lock().get(key).cloned()
    }

    /// Single-flight lookup. The first caller runs `build`; every other caller
    /// waits for and shares its result.
    pub async fn get_or_build<F, Fut>(
        &self,
        key: &CacheKey,
        build: F,
    ) -> Result<FixtureValue, SharedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Built>>,
    {
        self.entry(key).get_or_build(build).await
    }

    /// Register one future consumer of `key`.
    pub fn reserve(&self, key: &CacheKey) {
        let entry = self.entry(key);
        let now = entry.consumers.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(fixture = %key, consumers = now, "reserved fixture");
    }

    /// Drop one consumer of `key`. The release that takes the count to zero
    /// resumes the teardown, if the entry was built with one.
    ///
    /// Returns `Ok(true)` when a teardown ran.
    pub async fn release(&self, key: &CacheKey) -> anyhow::Result<bool> {
        let Some(entry) = self.existing(key) else {
            warn!(fixture = %key, "release of a fixture that was never reserved");
            return Ok(false);
        };

        let previous = entry
            .consumers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Err(_) => {
                warn!(fixture = %key, "release without a matching reservation; ignoring");
                Ok(false)
            }
            Ok(1) => match entry.take_teardown().await {
                Some(teardown) => {
                    debug!(fixture = %key, "last consumer released; tearing down");
                    teardown.resume().await?;
                    Ok(true)
                }
                None => Ok(false),
            },
            Ok(remaining) => {
                debug!(fixture = %key, consumers = remaining - 1, "released fixture");
                Ok(false)
            }
        }
    }

    pub fn consumers(&self, key: &CacheKey) -> usize {
        self.existing(key).map_or(0, |e| e.consumers())
    }

    pub fn build_count(&self, key: &CacheKey) -> usize {
        self.existing(key).map_or(0, |e| e.build_count())
    }

    /// Resume every teardown still pending, e.g. because a consumer panicked
    /// before releasing. Errors are collected, never raised.
    pub async fn finalize(&self) -> Vec<(CacheKey, anyhow::Error)> {
        let mut entries: Vec<(CacheKey, Arc<CacheEntry>)> = self
            .lock()
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        // Widest scope last.
        entries.sort_by(|a, b| b.0.scope.cmp(&a.0.scope));

        let mut errors = Vec::new();
        for (key, entry) in entries {
            if let Some(teardown) = entry.take_teardown().await {
                warn!(
                    fixture = %key,
                    consumers = entry.consumers(),
                    "tearing down fixture left pending at end of run"
                );
                if let Err(err) = teardown.resume().await {
                    errors.push((key, err));
                }
            }
        }
        errors
    }
}
