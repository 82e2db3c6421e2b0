use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

impl DirEntry {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Notifications pushed by a booted runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    ServerReady { port: u16, url: String },
    Error { message: String },
    FileChanged { path: String },
}

/// Boots isolated runtimes. Supplied by the sandbox technology.
#[async_trait]
pub trait RuntimePort: Send + Sync {
    async fn boot(&self, workdir_hint: &str) -> Result<Arc<dyn RuntimeHandle>, RuntimeError>;
}

/// A live runtime. Paths are `/`-separated and relative to the runtime's root.
#[async_trait]
pub trait RuntimeHandle: Send + Sync {
    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, RuntimeError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, RuntimeError>;

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), RuntimeError>;

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), RuntimeError>;

    /// Runs a process to completion and returns its exit code.
    async fn spawn(&self, command: &str, args: &[String]) -> Result<i32, RuntimeError>;

    /// Subscribe to `server-ready`, `error` and file-change notifications.
    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent>;

    async fn teardown(&self) -> Result<(), RuntimeError>;
}
