use appbox_common::{DirEntry, RuntimeError, RuntimeEvent, RuntimeHandle, RuntimePort};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use super::components;

const EVENT_BUFFER_SIZE: usize = 64;

fn io_error(path: &str, e: std::io::Error) -> RuntimeError {
    if e.kind() == ErrorKind::NotFound {
        RuntimeError::NotFound(path.to_string())
    } else {
        RuntimeError::Io {
            path: path.to_string(),
            message: e.to_string(),
        }
    }
}

/// Runs each instance in a private directory on the host. Offers no isolation
/// beyond the directory boundary; intended for development.
pub struct LocalRuntime {
    base_path: PathBuf,
}

impl LocalRuntime {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl RuntimePort for LocalRuntime {
    async fn boot(&self, workdir_hint: &str) -> Result<Arc<dyn RuntimeHandle>, RuntimeError> {
        let label: String = workdir_hint
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let root = self
            .base_path
            .join(format!("{}-{}", label, &Uuid::new_v4().simple().to_string()[..8]));
        fs::create_dir_all(&root)
            .await
            .map_err(|e| RuntimeError::Boot(format!("{}: {}", root.display(), e)))?;

        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        info!(root = %root.display(), "Booted local runtime");
        Ok(Arc::new(LocalHandle { root, events }))
    }
}

pub struct LocalHandle {
    root: PathBuf,
    events: broadcast::Sender<RuntimeEvent>,
}

impl LocalHandle {
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, RuntimeError> {
        let mut resolved = self.root.clone();
        for part in components(path)? {
            resolved.push(part);
        }
        Ok(resolved)
    }
}

#[async_trait]
impl RuntimeHandle for LocalHandle {
    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, RuntimeError> {
        let dir = self.resolve(path)?;
        let mut reader = fs::read_dir(&dir).await.map_err(|e| io_error(path, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| io_error(path, e))? {
            let file_type = entry.file_type().await.map_err(|e| io_error(path, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if file_type.is_dir() {
                entries.push(DirEntry::dir(name));
            } else if file_type.is_file() {
                entries.push(DirEntry::file(name));
            }
        }
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, RuntimeError> {
        fs::read(self.resolve(path)?)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), RuntimeError> {
        fs::write(self.resolve(path)?, contents)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), RuntimeError> {
        let dir = self.resolve(path)?;
        let result = if recursive {
            fs::create_dir_all(&dir).await
        } else {
            fs::create_dir(&dir).await
        };
        match result {
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            other => other.map_err(|e| io_error(path, e)),
        }
    }

    async fn spawn(&self, command: &str, args: &[String]) -> Result<i32, RuntimeError> {
        debug!(command, ?args, root = %self.root.display(), "Spawning process");
        let status = Command::new(command)
            .args(args)
            .current_dir(&self.root)
            .status()
            .await
            .map_err(|e| RuntimeError::Spawn(format!("{command}: {e}")))?;
        // Killed by a signal: no exit code.
        Ok(status.code().unwrap_or(-1))
    }

    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    async fn teardown(&self) -> Result<(), RuntimeError> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RuntimeError::Teardown(format!(
                "{}: {}",
                self.root.display(),
                e
            ))),
        }
    }
}
