//! One application's isolated runtime and its lifecycle.
//!
//! `initializing -> active <-> suspended`, any state `-> terminating ->
//! terminated`, and any state `-> error`. An instance suspends itself after
//! `suspend_after` without a recorded access (debounced, not polled).

use appbox_common::{
    InstanceConfig, InstanceError, InstanceMetrics, InstanceState, PoolEvent, PoolEventKind,
    RuntimeEvent, RuntimeHandle, RuntimePort, ServerAddress, Snapshot, SnapshotStore,
};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Instant as StdInstant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ExportLimits;
use crate::cost::CostModel;
use crate::snapshot::{self, AutoSaver};

/// Collaborators shared by every instance of a pool.
#[derive(Clone)]
pub struct InstanceDeps {
    pub runtime: Arc<dyn RuntimePort>,
    pub store: Arc<dyn SnapshotStore>,
    pub cost_model: Arc<dyn CostModel>,
    pub autosaver: Arc<AutoSaver>,
    pub export_limits: ExportLimits,
    pub events: broadcast::Sender<PoolEvent>,
}

struct Inner {
    state: InstanceState,
    handle: Option<Arc<dyn RuntimeHandle>>,
    /// Set by the suspend that produced it; consumed by the next resume that
    /// boots successfully.
    last_snapshot: Option<Snapshot>,
    /// False when the suspend that produced `last_snapshot` could not write it.
    snapshot_persisted: bool,
    memory_mb: u64,
    last_accessed_at: DateTime<Utc>,
    address: Option<ServerAddress>,
}

#[derive(Default)]
struct Tasks {
    idle_timer: Option<JoinHandle<()>>,
    idle_generation: u64,
    runtime_listener: Option<JoinHandle<()>>,
}

pub struct Instance {
    config: InstanceConfig,
    runtime: Arc<dyn RuntimePort>,
    store: Arc<dyn SnapshotStore>,
    cost_model: Arc<dyn CostModel>,
    autosaver: Arc<AutoSaver>,
    export_limits: ExportLimits,
    events: StdMutex<Option<broadcast::Sender<PoolEvent>>>,
    inner: RwLock<Inner>,
    // Serializes suspend, resume, start and terminate.
    transition: Mutex<()>,
    tasks: StdMutex<Tasks>,
    created_at: DateTime<Utc>,
    started: StdInstant,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Instance {
    pub fn new(config: InstanceConfig, deps: InstanceDeps) -> Arc<Self> {
        let memory_mb = deps
            .cost_model
            .estimate_mb(&config, InstanceState::Initializing);
        let now = Utc::now();
        Arc::new(Self {
            config,
            runtime: deps.runtime,
            store: deps.store,
            cost_model: deps.cost_model,
            autosaver: deps.autosaver,
            export_limits: deps.export_limits,
            events: StdMutex::new(Some(deps.events)),
            inner: RwLock::new(Inner {
                state: InstanceState::Initializing,
                handle: None,
                last_snapshot: None,
                snapshot_persisted: true,
                memory_mb,
                last_accessed_at: now,
                address: None,
            }),
            transition: Mutex::new(()),
            tasks: StdMutex::new(Tasks::default()),
            created_at: now,
            started: StdInstant::now(),
        })
    }

    pub fn app_id(&self) -> &str {
        &self.config.app_id
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub async fn state(&self) -> InstanceState {
        self.inner.read().await.state
    }

    pub async fn memory_mb(&self) -> u64 {
        self.inner.read().await.memory_mb
    }

    pub async fn address(&self) -> Option<ServerAddress> {
        self.inner.read().await.address.clone()
    }

    /// The live runtime handle, if the instance is currently booted.
    pub async fn handle(&self) -> Option<Arc<dyn RuntimeHandle>> {
        self.inner.read().await.handle.clone()
    }

    pub async fn metrics(&self) -> InstanceMetrics {
        let inner = self.inner.read().await;
        InstanceMetrics {
            app_id: self.config.app_id.clone(),
            display_name: self.config.display_name.clone(),
            state: inner.state,
            memory_mb: inner.memory_mb,
            created_at: self.created_at,
            last_accessed_at: inner.last_accessed_at,
            uptime_ms: self.started.elapsed().as_millis() as u64,
            address: inner.address.clone(),
        }
    }

    fn emit(&self, kind: PoolEventKind) {
        let sender = lock(&self.events).clone();
        if let Some(sender) = sender {
            // No subscribers is fine.
            let _ = sender.send(PoolEvent::new(self.config.app_id.clone(), kind));
        }
    }

    async fn set_state(&self, state: InstanceState) {
        let mut inner = self.inner.write().await;
        inner.state = state;
        inner.memory_mb = self.cost_model.estimate_mb(&self.config, state);
    }

    /// First boot. Restores the last persisted snapshot if one exists.
    #[instrument(skip(self), fields(app_id = %self.config.app_id))]
    pub async fn start(self: &Arc<Self>) -> Result<(), InstanceError> {
        let _guard = self.transition.lock().await;
        if self.state().await != InstanceState::Initializing {
            return Ok(());
        }
        self.boot_and_restore(None).await?;
        info!("Instance started");
        self.emit(PoolEventKind::Created);
        Ok(())
    }

    /// No-op unless `active`. Export, persist and teardown failures are logged
    /// and never stop the transition; a failed persist means the next resume
    /// from the store will not reflect this suspension.
    #[instrument(skip(self), fields(app_id = %self.config.app_id))]
    pub async fn suspend(&self) {
        self.suspend_checked(None).await;
    }

    async fn suspend_checked(&self, idle_generation: Option<u64>) {
        let _guard = self.transition.lock().await;
        if let Some(generation) = idle_generation {
            if lock(&self.tasks).idle_generation != generation {
                debug!("Access recorded since the idle timer fired; staying active");
                return;
            }
        }
        let handle = {
            let inner = self.inner.read().await;
            if inner.state != InstanceState::Active {
                debug!(state = %inner.state, "Suspend skipped");
                return;
            }
            inner.handle.clone()
        };

        self.cancel_idle_timer();
        self.stop_runtime_listener();
        self.autosaver.cancel(&self.config.app_id).await;

        let mut saved = None;
        let mut persisted = true;
        if let Some(handle) = handle {
            match snapshot::export(handle.as_ref(), &self.export_limits).await {
                Ok(snapshot) => {
                    if let Err(e) = self
                        .store
                        .put(&self.config.app_id, &self.config.display_name, &snapshot)
                        .await
                    {
                        warn!(error = %e, "Failed to persist snapshot; state kept in memory only");
                        persisted = false;
                    }
                    saved = Some(snapshot);
                }
                Err(e) => warn!(error = %e, "Failed to export file tree before suspend"),
            }
            if let Err(e) = handle.teardown().await {
                warn!(error = %e, "Runtime teardown failed during suspend");
            }
        }

        {
            let mut inner = self.inner.write().await;
            inner.handle = None;
            inner.last_snapshot = saved;
            inner.snapshot_persisted = persisted;
            inner.address = None;
            inner.state = InstanceState::Suspended;
            inner.memory_mb = self
                .cost_model
                .estimate_mb(&self.config, InstanceState::Suspended);
        }
        info!("Instance suspended");
        self.emit(PoolEventKind::Suspended);
    }

    /// No-op unless `suspended`. Boot failures leave the instance in `error`
    /// and are returned; there is no retry.
    #[instrument(skip(self), fields(app_id = %self.config.app_id))]
    pub async fn resume(self: &Arc<Self>) -> Result<(), InstanceError> {
        let _guard = self.transition.lock().await;
        let in_memory = {
            let mut inner = self.inner.write().await;
            if inner.state != InstanceState::Suspended {
                debug!(state = %inner.state, "Resume skipped");
                return Ok(());
            }
            inner.state = InstanceState::Initializing;
            inner.memory_mb = self
                .cost_model
                .estimate_mb(&self.config, InstanceState::Initializing);
            inner.last_snapshot.take()
        };

        self.boot_and_restore(in_memory).await?;
        info!("Instance resumed");
        self.emit(PoolEventKind::Resumed);
        Ok(())
    }

    /// Boot a runtime, restore files into it and go `active`. Callers hold the
    /// transition lock. On boot failure `in_memory` is put back so a later
    /// terminate can still persist it.
    async fn boot_and_restore(
        self: &Arc<Self>,
        in_memory: Option<Snapshot>,
    ) -> Result<(), InstanceError> {
        let handle = match self.runtime.boot(&self.config.app_id).await {
            Ok(handle) => handle,
            Err(source) => {
                error!(error = %source, "Runtime boot failed");
                if in_memory.is_some() {
                    self.inner.write().await.last_snapshot = in_memory;
                }
                self.set_state(InstanceState::Error).await;
                self.emit(PoolEventKind::Error {
                    message: source.to_string(),
                });
                return Err(InstanceError::BootFailure {
                    app_id: self.config.app_id.clone(),
                    source,
                });
            }
        };

        let snapshot = match in_memory {
            Some(snapshot) => Some(snapshot),
            None => snapshot::load_persisted(self.store.as_ref(), &self.config.app_id).await,
        };
        if let Some(snapshot) = snapshot {
            let report = snapshot::import(handle.as_ref(), &snapshot).await;
            if report.is_complete() {
                debug!(files = report.written.len(), "Restored snapshot");
            } else {
                warn!(
                    written = report.written.len(),
                    failed = report.failed.len(),
                    "Snapshot restored partially"
                );
            }
        }

        {
            let mut inner = self.inner.write().await;
            inner.handle = Some(Arc::clone(&handle));
            inner.address = None;
            inner.last_accessed_at = Utc::now();
            inner.state = InstanceState::Active;
            inner.memory_mb = self
                .cost_model
                .estimate_mb(&self.config, InstanceState::Active);
        }
        self.listen_runtime(handle);
        self.arm_idle_timer();
        Ok(())
    }

    /// Idempotent. Teardown failures are logged only. A snapshot whose suspend
    /// could not persist it is written to the store before it is dropped.
    /// Drops the event sender, so this instance emits nothing afterwards.
    #[instrument(skip(self), fields(app_id = %self.config.app_id))]
    pub async fn terminate(&self) {
        self.cancel_idle_timer();
        let _guard = self.transition.lock().await;
        let handle = {
            let mut inner = self.inner.write().await;
            if inner.state == InstanceState::Terminated {
                return;
            }
            inner.state = InstanceState::Terminating;
            inner.handle.take()
        };
        self.stop_runtime_listener();
        self.autosaver.cancel(&self.config.app_id).await;

        if let Some(handle) = handle {
            if let Err(e) = handle.teardown().await {
                warn!(error = %e, "Runtime teardown failed during terminate");
            }
        }

        let unpersisted = {
            let mut inner = self.inner.write().await;
            let snapshot = inner.last_snapshot.take();
            let persisted = std::mem::replace(&mut inner.snapshot_persisted, true);
            snapshot.filter(|_| !persisted)
        };
        if let Some(snapshot) = unpersisted {
            match self
                .store
                .put(&self.config.app_id, &self.config.display_name, &snapshot)
                .await
            {
                Ok(()) => info!("Persisted the snapshot held in memory"),
                Err(e) => warn!(error = %e, "Snapshot held in memory is lost"),
            }
        }

        {
            let mut inner = self.inner.write().await;
            inner.address = None;
            inner.state = InstanceState::Terminated;
            inner.memory_mb = self
                .cost_model
                .estimate_mb(&self.config, InstanceState::Terminated);
        }
        info!("Instance terminated");
        self.emit(PoolEventKind::Terminated);
        lock(&self.events).take();
    }

    /// Mark the instance as used now and restart its idle countdown.
    pub async fn record_access(self: &Arc<Self>) {
        let state = {
            let mut inner = self.inner.write().await;
            inner.last_accessed_at = Utc::now();
            inner.state
        };
        if state == InstanceState::Active {
            self.arm_idle_timer();
        }
        self.emit(PoolEventKind::Access);
    }

    /// Schedule a debounced auto-save of the current file tree.
    pub async fn notify_files_changed(&self) {
        let handle = {
            let inner = self.inner.read().await;
            if inner.state != InstanceState::Active {
                return;
            }
            inner.handle.clone()
        };
        if let Some(handle) = handle {
            self.autosaver
                .enqueue(&self.config.app_id, handle, &self.config.display_name);
        }
    }

    fn arm_idle_timer(self: &Arc<Self>) {
        if !self.config.auto_suspend {
            return;
        }
        let delay = self.config.suspend_after();
        let weak: Weak<Self> = Arc::downgrade(self);

        let mut tasks = lock(&self.tasks);
        tasks.idle_generation += 1;
        let generation = tasks.idle_generation;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(instance) = weak.upgrade() {
                // Detached so that cancelling the timer cannot interrupt a
                // suspend already under way.
                tokio::spawn(async move {
                    info!(app_id = %instance.config.app_id, "Idle threshold reached");
                    instance.suspend_checked(Some(generation)).await;
                });
            }
        });
        if let Some(previous) = tasks.idle_timer.replace(timer) {
            previous.abort();
        }
    }

    fn cancel_idle_timer(&self) {
        let mut tasks = lock(&self.tasks);
        tasks.idle_generation += 1;
        if let Some(timer) = tasks.idle_timer.take() {
            timer.abort();
        }
    }

    fn listen_runtime(self: &Arc<Self>, handle: Arc<dyn RuntimeHandle>) {
        let mut events = handle.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        let listener = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Runtime event listener lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(instance) = weak.upgrade() else {
                    break;
                };
                instance.on_runtime_event(event, &handle).await;
            }
        });
        if let Some(previous) = lock(&self.tasks).runtime_listener.replace(listener) {
            previous.abort();
        }
    }

    fn stop_runtime_listener(&self) {
        if let Some(listener) = lock(&self.tasks).runtime_listener.take() {
            listener.abort();
        }
    }

    async fn on_runtime_event(&self, event: RuntimeEvent, handle: &Arc<dyn RuntimeHandle>) {
        match event {
            RuntimeEvent::ServerReady { port, url } => {
                info!(app_id = %self.config.app_id, port, url = %url, "Server ready");
                self.inner.write().await.address = Some(ServerAddress {
                    port,
                    url: url.clone(),
                });
                self.emit(PoolEventKind::ServerReady { port, url });
            }
            RuntimeEvent::Error { message } => {
                let _guard = self.transition.lock().await;
                let attached = self
                    .inner
                    .read()
                    .await
                    .handle
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, handle));
                if !attached {
                    debug!(app_id = %self.config.app_id, error = %message, "Ignoring error from a detached runtime");
                    return;
                }
                error!(app_id = %self.config.app_id, error = %message, "Runtime reported an error");
                self.cancel_idle_timer();
                self.set_state(InstanceState::Error).await;
                self.emit(PoolEventKind::Error { message });
            }
            RuntimeEvent::FileChanged { path } => {
                if self.state().await == InstanceState::Active {
                    debug!(app_id = %self.config.app_id, path = %path, "File changed, scheduling auto-save");
                    self.autosaver.enqueue(
                        &self.config.app_id,
                        Arc::clone(handle),
                        &self.config.display_name,
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("app_id", &self.config.app_id)
            .field("display_name", &self.config.display_name)
            .field("created_at", &self.created_at)
            .finish()
    }
}
