//! Scope-keyed entity cache with at-most-one in-flight fetch per key.
//!
//! Every entity family (channels per workspace, friends, workspace roles) is an
//! [`EntityCache`] over its entity type. Entries are replaced wholesale: a
//! fetch stores the full server list, an invalidation removes the entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use devchat_shared::TransportError;
use futures_util::future::{BoxFuture, FutureExt, Shared};

/// Loads the full entity list for one scope key.
pub type Loader<T> =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Vec<T>, TransportError>> + Send + Sync>;

/// Called with the settled entries after every change, outside the cache lock.
///
/// Hooks can run concurrently and in any order; [`Snapshot::version`] orders them.
pub type ChangeHook<T> = Arc<dyn Fn(Snapshot<T>) + Send + Sync>;

type SharedFetch<T> = Shared<BoxFuture<'static, Result<Arc<Vec<T>>, TransportError>>>;

/// Lifecycle state of a scope key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Fresh,
    Stale,
    Fetching,
}

#[derive(Debug)]
pub struct CacheEntry<T> {
    pub scope_key: String,
    pub value: Arc<Vec<T>>,
    pub fetched_at: DateTime<Utc>,
}

impl<T> Clone for CacheEntry<T> {
    fn clone(&self) -> Self {
        Self {
            scope_key: self.scope_key.clone(),
            value: Arc::clone(&self.value),
            fetched_at: self.fetched_at,
        }
    }
}

/// Settled entries as of one change. Versions increase with every change.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub version: u64,
    pub entries: Vec<CacheEntry<T>>,
}

struct InFlight<T> {
    ticket: u64,
    fetch: SharedFetch<T>,
}

struct Slot<T> {
    entry: Option<CacheEntry<T>>,
    in_flight: Option<InFlight<T>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            entry: None,
            in_flight: None,
        }
    }
}

struct Inner<T> {
    slots: HashMap<String, Slot<T>>,
    next_ticket: u64,
    version: u64,
}

struct Core<T> {
    family: &'static str,
    state: Mutex<Inner<T>>,
    on_change: Option<ChangeHook<T>>,
}

impl<T> Core<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a change. Must be called under the lock that made it.
    fn snapshot(inner: &mut Inner<T>) -> Snapshot<T> {
        inner.version += 1;
        Snapshot {
            version: inner.version,
            entries: inner
                .slots
                .values()
                .filter_map(|slot| slot.entry.clone())
                .collect(),
        }
    }

    fn notify(&self, snapshot: Snapshot<T>) {
        if let Some(hook) = &self.on_change {
            hook(snapshot);
        }
    }
}

/// Cache of entity lists keyed by scope.
pub struct EntityCache<T> {
    core: Arc<Core<T>>,
    loader: Loader<T>,
    max_age: Option<Duration>,
}

impl<T> EntityCache<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(family: &'static str, loader: Loader<T>) -> Self {
        Self {
            core: Arc::new(Core {
                family,
                state: Mutex::new(Inner {
                    slots: HashMap::new(),
                    next_ticket: 0,
                    version: 0,
                }),
                on_change: None,
            }),
            loader,
            max_age: None,
        }
    }

    /// Entries older than `max_age` are reported stale and refetched on the next read.
    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    /// Install the change hook. Must be called before the cache is shared.
    pub fn with_change_hook(mut self, hook: ChangeHook<T>) -> Self {
        if let Some(core) = Arc::get_mut(&mut self.core) {
            core.on_change = Some(hook);
        } else {
            tracing::warn!(family = self.core.family, "change hook ignored, cache already shared");
        }
        self
    }

    /// Read the entity list for `scope`.
    ///
    /// A fresh entry is returned without I/O unless `force_refresh` is set.
    /// A read while a fetch for the same scope is in flight joins that fetch,
    /// forced or not, so a key never has two concurrent requests.
    pub async fn fetch(
        &self,
        scope: &str,
        force_refresh: bool,
    ) -> Result<Arc<Vec<T>>, TransportError> {
        let fetch = {
            let mut guard = self.core.lock();
            let inner = &mut *guard;
            let slot = inner.slots.entry(scope.to_string()).or_default();

            if let Some(in_flight) = &slot.in_flight {
                tracing::debug!(family = self.core.family, scope, "joining in-flight fetch");
                in_flight.fetch.clone()
            } else {
                if !force_refresh {
                    if let Some(entry) = &slot.entry {
                        if self.is_fresh(entry, Utc::now()) {
                            return Ok(Arc::clone(&entry.value));
                        }
                    }
                }

                inner.next_ticket += 1;
                let ticket = inner.next_ticket;
                let fetch = self.start_fetch(scope, ticket);
                slot.in_flight = Some(InFlight {
                    ticket,
                    fetch: fetch.clone(),
                });
                tracing::debug!(family = self.core.family, scope, force_refresh, "fetching");
                fetch
            }
        };

        fetch.await
    }

    fn start_fetch(&self, scope: &str, ticket: u64) -> SharedFetch<T> {
        let load = (self.loader)(scope.to_string());
        let core = Arc::clone(&self.core);
        let scope = scope.to_string();

        async move {
            let result = load.await.map(Arc::new);

            let settled = {
                let mut guard = core.lock();
                let owns_slot = guard
                    .slots
                    .get(&scope)
                    .and_then(|slot| slot.in_flight.as_ref())
                    .is_some_and(|in_flight| in_flight.ticket == ticket);

                if !owns_slot {
                    tracing::debug!(family = core.family, scope = %scope, "discarding result of invalidated fetch");
                    None
                } else {
                    match &result {
                        Ok(value) => {
                            if let Some(slot) = guard.slots.get_mut(&scope) {
                                slot.in_flight = None;
                                slot.entry = Some(CacheEntry {
                                    scope_key: scope.clone(),
                                    value: Arc::clone(value),
                                    fetched_at: Utc::now(),
                                });
                            }
                            Some(Core::snapshot(&mut guard))
                        }
                        Err(e) => {
                            // Previous value stays servable.
                            tracing::debug!(family = core.family, scope = %scope, error = %e, "fetch failed");
                            let empty = match guard.slots.get_mut(&scope) {
                                Some(slot) => {
                                    slot.in_flight = None;
                                    slot.entry.is_none()
                                }
                                None => false,
                            };
                            if empty {
                                guard.slots.remove(&scope);
                            }
                            None
                        }
                    }
                }
            };

            if let Some(snapshot) = settled {
                core.notify(snapshot);
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Remove the entry for `scope`. A fetch in flight for it still answers its
    /// callers but its result is not stored.
    pub fn invalidate(&self, scope: &str) -> bool {
        let settled = {
            let mut guard = self.core.lock();
            match guard.slots.remove(scope) {
                Some(_) => Some(Core::snapshot(&mut guard)),
                None => None,
            }
        };

        match settled {
            Some(snapshot) => {
                tracing::debug!(family = self.core.family, scope, "invalidated");
                self.core.notify(snapshot);
                true
            }
            None => false,
        }
    }

    /// Drop every entry and pending fetch result.
    pub fn invalidate_all(&self) {
        let snapshot = {
            let mut guard = self.core.lock();
            guard.slots.clear();
            Core::snapshot(&mut guard)
        };
        tracing::debug!(family = self.core.family, "cleared");
        self.core.notify(snapshot);
    }

    /// Seed entries restored from persistent storage. Existing keys win.
    pub fn hydrate(&self, entries: impl IntoIterator<Item = CacheEntry<T>>) {
        let mut guard = self.core.lock();
        for entry in entries {
            guard
                .slots
                .entry(entry.scope_key.clone())
                .or_insert_with(|| Slot {
                    entry: Some(entry),
                    in_flight: None,
                });
        }
    }

    /// Cached value without I/O, whatever its freshness
    pub fn peek(&self, scope: &str) -> Option<Arc<Vec<T>>> {
        self.core
            .lock()
            .slots
            .get(scope)
            .and_then(|slot| slot.entry.as_ref())
            .map(|entry| Arc::clone(&entry.value))
    }

    /// `None` means the key is absent (a cache miss).
    pub fn state(&self, scope: &str) -> Option<EntryState> {
        let guard = self.core.lock();
        let slot = guard.slots.get(scope)?;
        if slot.in_flight.is_some() {
            return Some(EntryState::Fetching);
        }
        let entry = slot.entry.as_ref()?;
        if self.is_fresh(entry, Utc::now()) {
            Some(EntryState::Fresh)
        } else {
            Some(EntryState::Stale)
        }
    }

    /// Scope keys that currently hold a value
    pub fn scopes(&self) -> Vec<String> {
        let guard = self.core.lock();
        let mut scopes: Vec<String> = guard
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(scope, _)| scope.clone())
            .collect();
        scopes.sort();
        scopes
    }

    fn is_fresh(&self, entry: &CacheEntry<T>, now: DateTime<Utc>) -> bool {
        let Some(max_age) = self.max_age else {
            return true;
        };
        match (now - entry.fetched_at).to_std() {
            Ok(age) => age < max_age,
            // fetched_at in the future (clock skew)
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Loader double counting calls per scope, optionally held until released.
    #[derive(Default)]
    struct TestLoader {
        calls: AtomicUsize,
        started: Notify,
        release: Notify,
        gated: AtomicBool,
        fail: AtomicBool,
    }

    impl TestLoader {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn loader(self: &Arc<Self>) -> Loader<String> {
            let this = Arc::clone(self);
            Arc::new(move |scope: String| {
                let this = Arc::clone(&this);
                async move {
                    let n = this.calls.fetch_add(1, Ordering::SeqCst) + 1;
                    this.started.notify_one();
                    if this.gated.load(Ordering::SeqCst) {
                        this.release.notified().await;
                    }
                    if this.fail.load(Ordering::SeqCst) {
                        return Err(TransportError::http(500, "boom"));
                    }
                    Ok(vec![format!("{scope}#{n}")])
                }
                .boxed()
            })
        }
    }

    fn cache(loader: &Arc<TestLoader>) -> EntityCache<String> {
        EntityCache::new("test", loader.loader())
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let loader = Arc::new(TestLoader::default());
        let cache = cache(&loader);

        let first = cache.fetch("W1", false).await.unwrap();
        let second = cache.fetch("W1", false).await.unwrap();

        assert_eq!(loader.calls(), 1);
        assert_eq!(first, second);
        assert_eq!(cache.state("W1"), Some(EntryState::Fresh));
    }

    #[tokio::test]
    async fn forced_refresh_always_hits_network() {
        let loader = Arc::new(TestLoader::default());
        let cache = cache(&loader);

        cache.fetch("W1", false).await.unwrap();
        let refreshed = cache.fetch("W1", true).await.unwrap();

        assert_eq!(loader.calls(), 2);
        assert_eq!(refreshed.as_slice(), ["W1#2".to_string()]);
    }

    #[tokio::test]
    async fn invalidate_forces_next_read_to_network() {
        let loader = Arc::new(TestLoader::default());
        let cache = cache(&loader);

        cache.fetch("W1", false).await.unwrap();
        assert!(cache.invalidate("W1"));
        assert_eq!(cache.state("W1"), None);
        assert!(!cache.invalidate("W1"));

        cache.fetch("W1", false).await.unwrap();
        assert_eq!(loader.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_reads_share_one_request() {
        let loader = Arc::new(TestLoader::default());
        loader.gated.store(true, Ordering::SeqCst);
        let cache = cache(&loader);

        let (a, b, _) = tokio::join!(cache.fetch("W1", false), cache.fetch("W1", true), async {
            loader.started.notified().await;
            assert_eq!(cache.state("W1"), Some(EntryState::Fetching));
            loader.release.notify_one();
        });

        assert_eq!(loader.calls(), 1);
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test]
    async fn different_scopes_are_independent() {
        let loader = Arc::new(TestLoader::default());
        let cache = cache(&loader);

        cache.fetch("W1", false).await.unwrap();
        cache.fetch("W2", false).await.unwrap();
        cache.invalidate("W2");

        assert_eq!(cache.scopes(), vec!["W1".to_string()]);
        assert_eq!(loader.calls(), 2);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_value() {
        let loader = Arc::new(TestLoader::default());
        let cache = cache(&loader);

        let before = cache.fetch("W1", false).await.unwrap();
        loader.fail.store(true, Ordering::SeqCst);

        let err = cache.fetch("W1", true).await.unwrap_err();
        assert_eq!(err.status, Some(500));
        assert_eq!(cache.peek("W1"), Some(before));
        assert_eq!(cache.state("W1"), Some(EntryState::Fresh));
    }

    #[tokio::test]
    async fn failed_first_fetch_leaves_no_entry() {
        let loader = Arc::new(TestLoader::default());
        loader.fail.store(true, Ordering::SeqCst);
        let cache = cache(&loader);

        assert!(cache.fetch("W1", false).await.is_err());
        assert_eq!(cache.state("W1"), None);
    }

    #[tokio::test]
    async fn invalidation_during_fetch_discards_result() {
        let loader = Arc::new(TestLoader::default());
        loader.gated.store(true, Ordering::SeqCst);
        let cache = Arc::new(cache(&loader));

        let reader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.fetch("W1", false).await })
        };

        loader.started.notified().await;
        cache.invalidate("W1");
        loader.release.notify_one();

        let value = reader.await.unwrap().unwrap();
        assert_eq!(value.as_slice(), ["W1#1".to_string()]);
        assert_eq!(cache.peek("W1"), None);
    }

    #[tokio::test]
    async fn entries_past_max_age_are_stale_and_refetched() {
        let loader = Arc::new(TestLoader::default());
        let cache = cache(&loader).with_max_age(Some(Duration::from_secs(60)));

        cache.hydrate([CacheEntry {
            scope_key: "W1".to_string(),
            value: Arc::new(vec!["old".to_string()]),
            fetched_at: Utc::now() - chrono::Duration::minutes(5),
        }]);
        assert_eq!(cache.state("W1"), Some(EntryState::Stale));

        let value = cache.fetch("W1", false).await.unwrap();
        assert_eq!(value.as_slice(), ["W1#1".to_string()]);
        assert_eq!(cache.state("W1"), Some(EntryState::Fresh));
    }

    #[tokio::test]
    async fn change_hook_sees_settled_entries() {
        let loader = Arc::new(TestLoader::default());
        let seen = Arc::new(Mutex::new(Vec::<(u64, usize)>::new()));
        let hook_seen = Arc::clone(&seen);
        let cache = cache(&loader).with_change_hook(Arc::new(move |snapshot: Snapshot<String>| {
            hook_seen
                .lock()
                .unwrap()
                .push((snapshot.version, snapshot.entries.len()));
        }));

        cache.fetch("W1", false).await.unwrap();
        cache.fetch("W2", false).await.unwrap();
        cache.invalidate("W1");
        cache.invalidate_all();

        assert_eq!(*seen.lock().unwrap(), vec![(1, 1), (2, 2), (3, 1), (4, 0)]);
    }
}
