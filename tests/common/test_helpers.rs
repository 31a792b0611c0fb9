use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use turnstile::{BucketState, LocalStore, StateStore, StoreError};

/// Local store that can be switched to fail every call, and counts calls.
#[derive(Debug, Default)]
pub struct SwitchableStore {
    inner: LocalStore,
    pub down: AtomicBool,
    pub calls: AtomicUsize,
}

impl SwitchableStore {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StateStore for SwitchableStore {
    async fn load(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        self.gate()?;
        self.inner.load(key).await
    }

    async fn save(&self, key: &str, state: BucketState, ttl: Duration) -> Result<(), StoreError> {
        self.gate()?;
        self.inner.save(key, state, ttl).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.gate()
    }
}

/// Store whose every call hangs for `delay`.
#[derive(Debug)]
pub struct SlowStore {
    pub delay: Duration,
}

#[async_trait]
impl StateStore for SlowStore {
    async fn load(&self, _key: &str) -> Result<Option<BucketState>, StoreError> {
        tokio::time::sleep(self.delay).await;
        Ok(None)
    }

    async fn save(&self, _key: &str, _state: BucketState, _ttl: Duration) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}
