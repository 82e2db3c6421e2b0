//! Registry of instances with count and memory budgets.
//!
//! Every lookup moves the identifier to the most-recently-used end of an
//! explicit LRU list; eviction consumes from the least-recently-used end and
//! never picks a protected identifier.

use appbox_common::{
    AppId, InstanceConfig, InstanceMetrics, InstanceState, PoolError, PoolEvent, Result,
    RuntimePort, SnapshotMetadata, SnapshotStore, StoreError,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::config::PoolConfig;
use crate::cost::{BaselineCostModel, CostModel};
use crate::instance::{Instance, InstanceDeps};
use crate::snapshot::AutoSaver;

const EVENT_BUFFER_SIZE: usize = 256;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub total_instances: usize,
    pub active_instances: usize,
    pub suspended_instances: usize,
    pub memory_mb: u64,
    pub instances: Vec<InstanceMetrics>,
}

/// Invariant: `lru` holds exactly the keys of `instances`.
#[derive(Default)]
struct Registry {
    instances: HashMap<AppId, Arc<Instance>>,
    lru: VecDeque<AppId>,
}

impl Registry {
    fn touch(&mut self, app_id: &str) {
        if !self.instances.contains_key(app_id) {
            return;
        }
        if let Some(pos) = self.lru.iter().position(|id| id == app_id) {
            self.lru.remove(pos);
        }
        self.lru.push_back(app_id.to_string());
    }

    fn insert(&mut self, instance: Arc<Instance>) -> Option<Arc<Instance>> {
        let app_id = instance.app_id().to_string();
        let replaced = self.instances.insert(app_id.clone(), instance);
        self.touch(&app_id);
        replaced
    }

    fn remove(&mut self, app_id: &str) -> Option<Arc<Instance>> {
        let removed = self.instances.remove(app_id)?;
        self.lru.retain(|id| id != app_id);
        Some(removed)
    }

    /// Remove `instance` only if it is still the registered one.
    fn remove_exact(&mut self, instance: &Arc<Instance>) {
        let app_id = instance.app_id();
        if self
            .instances
            .get(app_id)
            .is_some_and(|current| Arc::ptr_eq(current, instance))
        {
            self.remove(app_id);
        }
    }

    /// Instances from least to most recently used.
    fn in_lru_order(&self) -> Vec<(AppId, Arc<Instance>)> {
        self.lru
            .iter()
            .filter_map(|id| self.instances.get(id).map(|i| (id.clone(), Arc::clone(i))))
            .collect()
    }
}

pub struct PoolManager {
    config: PoolConfig,
    deps: InstanceDeps,
    registry: RwLock<Registry>,
}

impl PoolManager {
    pub fn new(
        config: PoolConfig,
        runtime: Arc<dyn RuntimePort>,
        store: Arc<dyn SnapshotStore>,
    ) -> Arc<Self> {
        let cost_model = Arc::new(BaselineCostModel::from_config(&config));
        Self::with_cost_model(config, runtime, store, cost_model)
    }

    pub fn with_cost_model(
        config: PoolConfig,
        runtime: Arc<dyn RuntimePort>,
        store: Arc<dyn SnapshotStore>,
        cost_model: Arc<dyn CostModel>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        let autosaver = Arc::new(AutoSaver::new(
            Arc::clone(&store),
            config.export.clone(),
            config.autosave_debounce(),
        ));
        Arc::new(Self {
            deps: InstanceDeps {
                runtime,
                store,
                cost_model,
                autosaver,
                export_limits: config.export.clone(),
                events,
            },
            config,
            registry: RwLock::new(Registry::default()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn autosaver(&self) -> &Arc<AutoSaver> {
        &self.deps.autosaver
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.deps.events.subscribe()
    }

    pub fn is_protected(&self, app_id: &str) -> bool {
        self.config.protected.contains(app_id)
    }

    /// Look up an instance and mark it most recently used.
    pub async fn get(&self, app_id: &str) -> Option<Arc<Instance>> {
        let mut registry = self.registry.write().await;
        let instance = registry.instances.get(app_id).cloned();
        if instance.is_some() {
            registry.touch(app_id);
        }
        instance
    }

    /// Look up an instance without affecting LRU order.
    pub async fn peek(&self, app_id: &str) -> Option<Arc<Instance>> {
        self.registry.read().await.instances.get(app_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.registry.read().await.instances.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.read().await.instances.is_empty()
    }

    /// Identifiers from least to most recently used.
    pub async fn lru_order(&self) -> Vec<AppId> {
        self.registry.read().await.lru.iter().cloned().collect()
    }

    /// Return the instance for `config.app_id`, resuming it if suspended, or
    /// boot a new one after making room for it. An entry that was terminated
    /// directly through its handle counts as absent and is replaced.
    ///
    /// Two concurrent first requests for the same identifier can both boot a
    /// runtime; callers must serialize them.
    #[instrument(skip(self, config), fields(app_id = %config.app_id))]
    pub async fn create_or_get(&self, config: InstanceConfig) -> Result<Arc<Instance>> {
        if let Some(instance) = self.get(&config.app_id).await {
            match instance.state().await {
                InstanceState::Terminating | InstanceState::Terminated => {
                    debug!("Dropping terminated registry entry");
                    self.registry.write().await.remove_exact(&instance);
                }
                state => {
                    if state == InstanceState::Suspended {
                        instance.resume().await?;
                    }
                    instance.record_access().await;
                    return Ok(instance);
                }
            }
        }

        self.enforce_limits().await;

        let instance = Instance::new(config, self.deps.clone());
        let app_id = instance.app_id().to_string();
        if let Some(replaced) = self.registry.write().await.insert(Arc::clone(&instance)) {
            warn!(
                app_id = %replaced.app_id(),
                "Concurrent first request replaced a registered instance; the replaced runtime keeps running"
            );
        }
        info!("Registered new instance");

        instance.start().await?;
        instance.record_access().await;

        self.relieve_memory_pressure(Some(&app_id)).await;
        Ok(instance)
    }

    pub async fn suspend(&self, app_id: &str) -> Result<()> {
        let instance = self
            .peek(app_id)
            .await
            .ok_or_else(|| PoolError::NotFound(app_id.to_string()))?;
        instance.suspend().await;
        Ok(())
    }

    pub async fn resume(&self, app_id: &str) -> Result<()> {
        let instance = self
            .get(app_id)
            .await
            .ok_or_else(|| PoolError::NotFound(app_id.to_string()))?;
        instance.resume().await?;
        instance.record_access().await;
        Ok(())
    }

    /// Terminate and deregister.
    pub async fn terminate(&self, app_id: &str) -> Result<()> {
        let instance = self
            .registry
            .write()
            .await
            .remove(app_id)
            .ok_or_else(|| PoolError::NotFound(app_id.to_string()))?;
        instance.terminate().await;
        Ok(())
    }

    pub async fn metrics(&self) -> PoolMetrics {
        let instances = self.registry.read().await.in_lru_order();
        let mut metrics = PoolMetrics::default();
        for (_, instance) in instances {
            let m = instance.metrics().await;
            metrics.total_instances += 1;
            match m.state {
                InstanceState::Active => metrics.active_instances += 1,
                InstanceState::Suspended => metrics.suspended_instances += 1,
                _ => {}
            }
            metrics.memory_mb += m.memory_mb;
            metrics.instances.push(m);
        }
        metrics
    }

    pub async fn total_memory_mb(&self) -> u64 {
        let instances = self.registry.read().await.in_lru_order();
        let mut total = 0;
        for (_, instance) in instances {
            total += instance.memory_mb().await;
        }
        total
    }

    pub async fn list_snapshots(&self) -> std::result::Result<Vec<SnapshotMetadata>, StoreError> {
        self.deps.store.list().await
    }

    /// Terminate every instance and clear the registry.
    pub async fn shutdown(&self) {
        let instances: Vec<Arc<Instance>> = {
            let mut registry = self.registry.write().await;
            registry.lru.clear();
            registry.instances.drain().map(|(_, i)| i).collect()
        };
        info!(count = instances.len(), "Shutting down instance pool");
        join_all(instances.iter().map(|i| i.terminate())).await;
    }

    async fn snapshot_lru(&self) -> Vec<(AppId, Arc<Instance>)> {
        self.registry.read().await.in_lru_order()
    }

    async fn remove_and_terminate(&self, app_id: &str) {
        let removed = self.registry.write().await.remove(app_id);
        if let Some(instance) = removed {
            instance.terminate().await;
        }
    }

    /// Runs before every new boot: one count-based eviction if the registry is
    /// full, then the memory-pressure pass.
    async fn enforce_limits(&self) {
        let candidates = self.snapshot_lru().await;
        if candidates.len() >= self.config.max_instances {
            self.evict_one(candidates).await;
        }
        self.relieve_memory_pressure(None).await;
    }

    /// Evict the least recently used eligible instance: suspend it if active,
    /// terminate it if it is already suspended (or failed). Stops after one.
    async fn evict_one(&self, candidates: Vec<(AppId, Arc<Instance>)>) -> bool {
        for (app_id, instance) in candidates {
            if self.is_protected(&app_id) {
                continue;
            }
            match instance.state().await {
                InstanceState::Active => {
                    info!(app_id = %app_id, "Instance limit reached, suspending least recently used");
                    instance.suspend().await;
                    return true;
                }
                InstanceState::Suspended | InstanceState::Error => {
                    info!(app_id = %app_id, "Instance limit reached, terminating least recently used");
                    self.remove_and_terminate(&app_id).await;
                    return true;
                }
                InstanceState::Terminated => {
                    info!(app_id = %app_id, "Instance limit reached, dropping terminated entry");
                    self.registry.write().await.remove_exact(&instance);
                    return true;
                }
                state => debug!(app_id = %app_id, %state, "Not an eviction candidate"),
            }
        }
        warn!(
            max_instances = self.config.max_instances,
            "Instance limit reached but nothing is evictable"
        );
        false
    }

    /// While estimated memory exceeds the budget, suspend active instances in
    /// LRU order, then terminate suspended ones. Gives up quietly when nothing
    /// eligible remains.
    async fn relieve_memory_pressure(&self, exclude: Option<&str>) {
        let max = self.config.max_memory_mb;
        let mut total = self.total_memory_mb().await;
        if total <= max {
            return;
        }
        warn!(total_mb = total, max_mb = max, "Memory budget exceeded, evicting");

        let eligible = |app_id: &str| !self.is_protected(app_id) && exclude != Some(app_id);

        for (app_id, instance) in self.snapshot_lru().await {
            if total <= max {
                return;
            }
            if eligible(&app_id) && instance.state().await == InstanceState::Active {
                info!(app_id = %app_id, "Suspending under memory pressure");
                instance.suspend().await;
                total = self.total_memory_mb().await;
            }
        }

        for (app_id, instance) in self.snapshot_lru().await {
            if total <= max {
                return;
            }
            if eligible(&app_id) && instance.state().await == InstanceState::Suspended {
                info!(app_id = %app_id, "Terminating under memory pressure");
                self.remove_and_terminate(&app_id).await;
                total = self.total_memory_mb().await;
            }
        }

        if total > max {
            warn!(total_mb = total, max_mb = max, "Memory budget still exceeded after eviction");
        }
    }
}

