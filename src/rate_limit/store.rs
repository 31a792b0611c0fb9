use crate::bucket::{BucketState, Transition};
use crate::error::StoreError;
use crate::policy::Policy;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Abstract storage interface for bucket state.
///
/// This trait supports both in-process and shared backends. Bucket state is only
/// mutated through [`StateStore::apply`] (or a `load`/`save` pair); no caller
/// caches a bucket between requests.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the bucket stored under `key`, if any.
    async fn load(&self, key: &str) -> Result<Option<BucketState>, StoreError>;

    /// Persist `state` under `key`, refreshing its time-to-live.
    async fn save(&self, key: &str, state: BucketState, ttl: Duration) -> Result<(), StoreError>;

    /// Load (or initialise a full bucket), run the transition, and persist.
    ///
    /// The default is a plain read-modify-write: two processes racing on one key
    /// may both read the same state and over-admit slightly. Backends with an
    /// atomic primitive should override this.
    async fn apply(
        &self,
        key: &str,
        now: f64,
        policy: &Policy,
        cost: f64,
        ttl: Duration,
    ) -> Result<Transition, StoreError> {
        let state = self.load(key).await?.unwrap_or_else(|| BucketState::full(policy, now));
        let transition = state.apply(now, policy, cost);
        self.save(key, transition.state, ttl).await?;
        Ok(transition)
    }

    /// Cheap reachability check used at startup and after outages.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Remove buckets idle for longer than both `max_idle` and the TTL they
    /// were last written with. Returns how many went.
    ///
    /// Stores that expire keys natively leave this as a no-op.
    fn evict_idle(&self, _now: f64, _max_idle: Duration) -> usize {
        0
    }

    /// Whether state lives in this process and needs the maintenance sweeper.
    fn is_local(&self) -> bool {
        false
    }

    /// Number of tracked buckets, when cheaply known.
    fn tracked_keys(&self) -> Option<usize> {
        None
    }
}

#[async_trait]
impl<S: StateStore + ?Sized> StateStore for Arc<S> {
    async fn load(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        (**self).load(key).await
    }

    async fn save(&self, key: &str, state: BucketState, ttl: Duration) -> Result<(), StoreError> {
        (**self).save(key, state, ttl).await
    }

    async fn apply(
        &self,
        key: &str,
        now: f64,
        policy: &Policy,
        cost: f64,
        ttl: Duration,
    ) -> Result<Transition, StoreError> {
        (**self).apply(key, now, policy, cost, ttl).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        (**self).ping().await
    }

    fn evict_idle(&self, now: f64, max_idle: Duration) -> usize {
        (**self).evict_idle(now, max_idle)
    }

    fn is_local(&self) -> bool {
        (**self).is_local()
    }

    fn tracked_keys(&self) -> Option<usize> {
        (**self).tracked_keys()
    }
}

const DEFAULT_SHARDS: usize = 16;

/// A bucket plus the TTL it was last written with, in seconds.
#[derive(Debug, Clone, Copy)]
struct Entry {
    state: BucketState,
    ttl: f64,
}

impl Entry {
    fn new(state: BucketState, ttl: Duration) -> Self {
        Self { state, ttl: ttl.as_secs_f64() }
    }

    fn expired(&self, now: f64, max_idle: f64) -> bool {
        now - self.state.last_refill > max_idle.max(self.ttl)
    }
}

type Shard = Mutex<HashMap<String, Entry>>;

/// In-process store with exact accounting.
///
/// Keys are spread over a fixed table of mutex-guarded shards; a key's
/// read-modify-write runs entirely under its shard lock, so concurrent checks
/// on one key are serialized. Entries are never expired on their own: run a
/// [`MaintenanceSweeper`](crate::sweeper::MaintenanceSweeper) to bound memory.
/// The sweeper never drops a bucket before its TTL has passed.
#[derive(Clone, Debug)]
pub struct LocalStore {
    shards: Arc<[Shard]>,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }
}

impl LocalStore {
    /// Store with the default shard count.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with `shards` lock shards (at least one).
    pub fn with_shards(shards: usize) -> Self {
        let shards: Vec<Shard> = (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect();
        Self { shards: shards.into() }
    }

    fn shard(&self, key: &str) -> MutexGuard<'_, HashMap<String, Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        // A panic while holding the lock cannot leave a bucket half-written:
        // entries are replaced whole.
        self.shards[idx].lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Synchronous peek at a bucket, without advancing it.
    pub fn get(&self, key: &str) -> Option<BucketState> {
        self.shard(key).get(key).map(|entry| entry.state)
    }

    /// Number of buckets held.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len())
            .sum()
    }

    /// Returns true if no buckets are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for LocalStore {
    async fn load(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        Ok(self.get(key))
    }

    async fn save(&self, key: &str, state: BucketState, ttl: Duration) -> Result<(), StoreError> {
        self.shard(key).insert(key.to_string(), Entry::new(state, ttl));
        Ok(())
    }

    async fn apply(
        &self,
        key: &str,
        now: f64,
        policy: &Policy,
        cost: f64,
        ttl: Duration,
    ) -> Result<Transition, StoreError> {
        let mut shard = self.shard(key);
        let state = shard.get(key).map(|entry| entry.state).unwrap_or_else(|| BucketState::full(policy, now));
        let transition = state.apply(now, policy, cost);
        shard.insert(key.to_string(), Entry::new(transition.state, ttl));
        Ok(transition)
    }

    fn evict_idle(&self, now: f64, max_idle: Duration) -> usize {
        let max_idle = max_idle.as_secs_f64();
        let mut evicted = 0;
        for shard in self.shards.iter() {
            let mut map = shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let before = map.len();
            map.retain(|_, entry| !entry.expired(now, max_idle));
            evicted += before - map.len();
        }
        evicted
    }

    fn is_local(&self) -> bool {
        true
    }

    fn tracked_keys(&self) -> Option<usize> {
        Some(self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Policy {
        Policy::per_second("s", 2).unwrap()
    }

    #[tokio::test]
    async fn apply_initialises_full_bucket() {
        let store = LocalStore::new();
        let t = store.apply("k", 0.0, &policy(), 1.0, Duration::from_secs(60)).await.unwrap();
        assert!(t.allowed);
        assert_eq!(store.get("k").unwrap().tokens, 1.0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn shared_handle_sees_same_buckets() {
        let store = Arc::new(LocalStore::with_shards(1));
        store.save("k", BucketState { tokens: 0.5, last_refill: 0.0 }, Duration::ZERO).await.unwrap();
        let t = store.apply("k", 0.25, &policy(), 1.0, Duration::ZERO).await.unwrap();
        assert!(t.allowed);
        assert_eq!(store.load("k").await.unwrap().unwrap().tokens, 0.0);
    }

    #[tokio::test]
    async fn evict_idle_drops_old_entries() {
        let store = LocalStore::new();
        store.save("old", BucketState { tokens: 1.0, last_refill: 10.0 }, Duration::ZERO).await.unwrap();
        store.save("new", BucketState { tokens: 1.0, last_refill: 500.0 }, Duration::ZERO).await.unwrap();
        assert_eq!(store.evict_idle(600.0, Duration::from_secs(500)), 1);
        assert!(store.get("old").is_none());
        assert!(store.get("new").is_some());
        assert_eq!(store.tracked_keys(), Some(1));
    }

    #[tokio::test]
    async fn evict_idle_honours_entry_ttl() {
        let store = LocalStore::new();
        let day = Duration::from_secs(86_400);
        store.save("quota", BucketState { tokens: 0.0, last_refill: 0.0 }, day).await.unwrap();
        store.save("burst", BucketState { tokens: 0.0, last_refill: 0.0 }, Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.evict_idle(3700.0, Duration::from_secs(3600)), 1);
        assert!(store.get("quota").is_some());
        assert!(store.get("burst").is_none());

        assert_eq!(store.evict_idle(86_401.0, Duration::from_secs(3600)), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn zero_shards_still_works() {
        let store = LocalStore::with_shards(0);
        assert!(store.is_empty());
        assert!(store.is_local());
    }
}
