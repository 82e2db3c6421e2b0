//! Lifecycle management for many isolated application runtimes in one host:
//! a bounded pool with LRU eviction, idle suspension with file-tree
//! snapshots, and a path router in front of it.

pub mod config;
pub mod context;
pub mod cost;
pub mod instance;
pub mod pool;
pub mod router;
pub mod runtime;
pub mod snapshot;

pub use appbox_common as common;
pub use config::{AppConfig, ConfigError, ExportLimits, PoolConfig, RouterConfig};
pub use context::AppContext;
pub use cost::{BaselineCostModel, CostModel};
pub use instance::{Instance, InstanceDeps};
pub use pool::{PoolManager, PoolMetrics};
pub use router::{ParsedUrl, Route, Router, RouterStats};
pub use runtime::{LocalHandle, LocalRuntime, MemoryHandle, MemoryRuntime};
pub use snapshot::{AutoSaver, FsSnapshotStore, ImportReport, MemorySnapshotStore};
