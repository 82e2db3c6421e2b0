//! Shared fixtures for the pool integration tests.
#![allow(dead_code)]

use appbox_common::{InstanceConfig, Snapshot, SnapshotMetadata, SnapshotStore, StoreError};
use appbox_pool::{MemoryRuntime, MemorySnapshotStore, PoolConfig, PoolManager};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub struct Harness {
    pub pool: Arc<PoolManager>,
    pub runtime: Arc<MemoryRuntime>,
    pub store: Arc<CountingStore>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn harness(config: PoolConfig) -> Harness {
    init_tracing();
    let runtime = Arc::new(MemoryRuntime::new());
    let store = Arc::new(CountingStore::default());
    let pool = PoolManager::new(config, runtime.clone(), store.clone());
    Harness {
        pool,
        runtime,
        store,
    }
}

pub fn app(app_id: &str) -> InstanceConfig {
    InstanceConfig::new(app_id, format!("App {app_id}"))
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Memory store that counts writes and can fail or stall them.
#[derive(Default)]
pub struct CountingStore {
    pub inner: MemorySnapshotStore,
    puts: AtomicUsize,
    fail_puts: AtomicBool,
    next_put_delay: Mutex<Option<Duration>>,
}

impl CountingStore {
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Stall the next write, after it has been counted, for `delay`.
    pub fn delay_next_put(&self, delay: Duration) {
        *self.next_put_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl SnapshotStore for CountingStore {
    async fn get(&self, app_id: &str) -> Result<Option<Snapshot>, StoreError> {
        self.inner.get(app_id).await
    }

    async fn put(
        &self,
        app_id: &str,
        display_name: &str,
        snapshot: &Snapshot,
    ) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let delay = self.next_put_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("store unavailable")));
        }
        self.inner.put(app_id, display_name, snapshot).await
    }

    async fn delete(&self, app_id: &str) -> Result<(), StoreError> {
        self.inner.delete(app_id).await
    }

    async fn list(&self) -> Result<Vec<SnapshotMetadata>, StoreError> {
        self.inner.list().await
    }
}
