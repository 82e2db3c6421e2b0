use appbox_common::{DirEntry, RuntimeError, RuntimeEvent, RuntimeHandle, RuntimePort};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use super::normalize;

const EVENT_BUFFER_SIZE: usize = 64;

#[derive(Default)]
struct Faults {
    fail_boot: AtomicBool,
    fail_teardown: AtomicBool,
    fail_writes_under: std::sync::RwLock<Vec<String>>,
}

impl Faults {
    fn write_blocked(&self, path: &str) -> bool {
        self.fail_writes_under
            .read()
            .map(|prefixes| prefixes.iter().any(|p| path.starts_with(p.as_str())))
            .unwrap_or(false)
    }
}

/// In-process runtime whose file tree lives in memory. Each boot yields an
/// empty tree. Faults can be injected to exercise failure paths.
#[derive(Default)]
pub struct MemoryRuntime {
    faults: Arc<Faults>,
    boots: AtomicUsize,
    handles: Mutex<Vec<Arc<MemoryHandle>>>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_boot(&self, fail: bool) {
        self.faults.fail_boot.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_teardown(&self, fail: bool) {
        self.faults.fail_teardown.store(fail, Ordering::SeqCst);
    }

    /// Every write whose path starts with `prefix` fails.
    pub fn fail_writes_under(&self, prefix: impl Into<String>) {
        if let Ok(mut prefixes) = self.faults.fail_writes_under.write() {
            prefixes.push(prefix.into());
        }
    }

    pub fn clear_write_faults(&self) {
        if let Ok(mut prefixes) = self.faults.fail_writes_under.write() {
            prefixes.clear();
        }
    }

    pub fn boot_count(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }

    /// Handles in boot order.
    pub async fn handles(&self) -> Vec<Arc<MemoryHandle>> {
        self.handles.lock().await.clone()
    }

    pub async fn last_handle(&self) -> Option<Arc<MemoryHandle>> {
        self.handles.lock().await.last().cloned()
    }
}

#[async_trait]
impl RuntimePort for MemoryRuntime {
    async fn boot(&self, workdir_hint: &str) -> Result<Arc<dyn RuntimeHandle>, RuntimeError> {
        if self.faults.fail_boot.load(Ordering::SeqCst) {
            return Err(RuntimeError::Boot(format!(
                "memory runtime refused to boot {workdir_hint}"
            )));
        }
        self.boots.fetch_add(1, Ordering::SeqCst);
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        let handle = Arc::new(MemoryHandle {
            workdir: workdir_hint.to_string(),
            tree: Mutex::new(Tree::default()),
            events,
            faults: Arc::clone(&self.faults),
            torn_down: AtomicBool::new(false),
            spawned: Mutex::new(Vec::new()),
        });
        self.handles.lock().await.push(Arc::clone(&handle));
        Ok(handle)
    }
}

#[derive(Default)]
struct Tree {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

fn name_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

pub struct MemoryHandle {
    workdir: String,
    tree: Mutex<Tree>,
    events: broadcast::Sender<RuntimeEvent>,
    faults: Arc<Faults>,
    torn_down: AtomicBool,
    spawned: Mutex<Vec<(String, Vec<String>)>>,
}

impl MemoryHandle {
    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Push a runtime notification to subscribers.
    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }

    /// All file paths with their contents.
    pub async fn files(&self) -> BTreeMap<String, Vec<u8>> {
        self.tree.lock().await.files.clone()
    }

    pub async fn spawned(&self) -> Vec<(String, Vec<String>)> {
        self.spawned.lock().await.clone()
    }

    /// Write a file, creating its parent directories.
    pub async fn seed(&self, path: &str, contents: &[u8]) -> Result<(), RuntimeError> {
        let path = normalize(path)?;
        let mut tree = self.tree.lock().await;
        let mut dir = parent_of(&path).to_string();
        while !dir.is_empty() {
            tree.dirs.insert(dir.clone());
            dir = parent_of(&dir).to_string();
        }
        tree.files.insert(path, contents.to_vec());
        Ok(())
    }

    fn check_live(&self) -> Result<(), RuntimeError> {
        if self.is_torn_down() {
            return Err(RuntimeError::Io {
                path: self.workdir.clone(),
                message: "runtime has been torn down".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeHandle for MemoryHandle {
    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, RuntimeError> {
        self.check_live()?;
        let path = normalize(path)?;
        let tree = self.tree.lock().await;
        if !path.is_empty() && !tree.dirs.contains(&path) {
            return Err(RuntimeError::NotFound(path));
        }

        let mut entries: Vec<DirEntry> = tree
            .dirs
            .iter()
            .filter(|d| parent_of(d) == path)
            .map(|d| DirEntry::dir(name_of(d)))
            .collect();
        entries.extend(
            tree.files
                .keys()
                .filter(|f| parent_of(f) == path)
                .map(|f| DirEntry::file(name_of(f))),
        );
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, RuntimeError> {
        self.check_live()?;
        let path = normalize(path)?;
        self.tree
            .lock()
            .await
            .files
            .get(&path)
            .cloned()
            .ok_or(RuntimeError::NotFound(path))
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), RuntimeError> {
        self.check_live()?;
        let path = normalize(path)?;
        if path.is_empty() {
            return Err(RuntimeError::InvalidPath(path));
        }
        if self.faults.write_blocked(&path) {
            return Err(RuntimeError::Io {
                path,
                message: "injected write failure".to_string(),
            });
        }
        let mut tree = self.tree.lock().await;
        let parent = parent_of(&path);
        if !parent.is_empty() && !tree.dirs.contains(parent) {
            return Err(RuntimeError::NotFound(parent.to_string()));
        }
        tree.files.insert(path, contents.to_vec());
        Ok(())
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), RuntimeError> {
        self.check_live()?;
        let path = normalize(path)?;
        let mut tree = self.tree.lock().await;
        if tree.files.contains_key(&path) {
            return Err(RuntimeError::Io {
                path,
                message: "a file already exists at this path".to_string(),
            });
        }
        let parent = parent_of(&path).to_string();
        if !recursive && !parent.is_empty() && !tree.dirs.contains(&parent) {
            return Err(RuntimeError::NotFound(parent));
        }
        let mut dir = path;
        while !dir.is_empty() {
            let next = parent_of(&dir).to_string();
            tree.dirs.insert(dir);
            dir = next;
        }
        Ok(())
    }

    async fn spawn(&self, command: &str, args: &[String]) -> Result<i32, RuntimeError> {
        self.check_live()?;
        self.spawned
            .lock()
            .await
            .push((command.to_string(), args.to_vec()));
        Ok(0)
    }

    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    async fn teardown(&self) -> Result<(), RuntimeError> {
        if self.faults.fail_teardown.load(Ordering::SeqCst) {
            return Err(RuntimeError::Teardown(format!(
                "injected teardown failure for {}",
                self.workdir
            )));
        }
        self.torn_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}
