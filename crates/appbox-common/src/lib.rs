//! Shared vocabulary for the instance pool: lifecycle states, configuration,
//! metrics, events and the two ports (runtime, snapshot store) the pool consumes.

use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod runtime;
pub mod snapshot;

pub use runtime::{DirEntry, EntryKind, RuntimeEvent, RuntimeHandle, RuntimePort};
pub use snapshot::{Snapshot, SnapshotFile, SnapshotMetadata, SnapshotStore, SNAPSHOT_VERSION};

/// Opaque key of one logical application.
pub type AppId = String;

// --- Errors ---

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Runtime boot failed: {0}")]
    Boot(String),

    #[error("Runtime I/O error at {path}: {message}")]
    Io { path: String, message: String },

    #[error("Path not found in runtime: {0}")]
    NotFound(String),

    #[error("Invalid runtime path: {0}")]
    InvalidPath(String),

    #[error("Process spawn failed: {0}")]
    Spawn(String),

    #[error("Runtime teardown failed: {0}")]
    Teardown(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Snapshot store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization error: {0}")]
    Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Invalid payload for {path}: {message}")]
    InvalidPayload { path: String, message: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstanceError {
    #[error("Boot failure for {app_id}: {source}")]
    BootFailure {
        app_id: AppId,
        #[source]
        source: RuntimeError,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Instance not found: {0}")]
    NotFound(AppId),

    #[error(transparent)]
    Instance(#[from] InstanceError),
}

pub type Result<T> = std::result::Result<T, PoolError>;

// --- Lifecycle ---

/// `initializing -> active <-> suspended`, any state `-> terminating -> terminated`,
/// any state `-> error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Initializing,
    Active,
    Suspended,
    Terminating,
    Terminated,
    Error,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Initializing => "initializing",
            InstanceState::Active => "active",
            InstanceState::Suspended => "suspended",
            InstanceState::Terminating => "terminating",
            InstanceState::Terminated => "terminated",
            InstanceState::Error => "error",
        }
    }

    /// `error` is terminal until the instance is explicitly terminated.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Terminated | InstanceState::Error)
    }
}

impl Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub app_id: AppId,
    pub display_name: String,
    pub memory_limit_mb: Option<u32>,
    pub cpu_limit: Option<f32>,
    pub auto_suspend: bool,
    pub suspend_after_ms: u64,
}

impl InstanceConfig {
    pub fn new(app_id: impl Into<AppId>, display_name: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            display_name: display_name.into(),
            memory_limit_mb: None,
            cpu_limit: None,
            auto_suspend: true,
            suspend_after_ms: 5 * 60 * 1000,
        }
    }

    pub fn with_suspend_after(mut self, after: Duration) -> Self {
        self.suspend_after_ms = after.as_millis() as u64;
        self
    }

    pub fn with_auto_suspend(mut self, enabled: bool) -> Self {
        self.auto_suspend = enabled;
        self
    }

    pub fn suspend_after(&self) -> Duration {
        Duration::from_millis(self.suspend_after_ms)
    }
}

/// Connection info reported by the runtime's `server-ready` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddress {
    pub port: u16,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetrics {
    pub app_id: AppId,
    pub display_name: String,
    pub state: InstanceState,
    pub memory_mb: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub uptime_ms: u64,
    pub address: Option<ServerAddress>,
}

// --- Events ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEventKind {
    Created,
    Suspended,
    Resumed,
    Terminated,
    Error { message: String },
    Access,
    ServerReady { port: u16, url: String },
}

impl PoolEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            PoolEventKind::Created => "created",
            PoolEventKind::Suspended => "suspended",
            PoolEventKind::Resumed => "resumed",
            PoolEventKind::Terminated => "terminated",
            PoolEventKind::Error { .. } => "error",
            PoolEventKind::Access => "access",
            PoolEventKind::ServerReady { .. } => "server_ready",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEvent {
    pub app_id: AppId,
    pub kind: PoolEventKind,
    pub at: DateTime<Utc>,
}

impl PoolEvent {
    pub fn new(app_id: impl Into<AppId>, kind: PoolEventKind) -> Self {
        Self {
            app_id: app_id.into(),
            kind,
            at: Utc::now(),
        }
    }
}

impl Display for PoolEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PoolEvent({} {})", self.app_id, self.kind.name())
    }
}
