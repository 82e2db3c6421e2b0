//! File-tree snapshots: export from a live runtime, best-effort import into a
//! fresh one, and persistence helpers around a [`SnapshotStore`].

mod autosave;
mod store;

pub use autosave::AutoSaver;
pub use store::{FsSnapshotStore, MemorySnapshotStore};

use appbox_common::{
    RuntimeError, RuntimeHandle, Snapshot, SnapshotError, SnapshotFile, SnapshotMetadata,
    SnapshotStore, SNAPSHOT_VERSION,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use glob::Pattern;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, warn};

use crate::config::ExportLimits;

/// Runtime path of the tree root.
pub const ROOT: &str = ".";

/// Outcome of [`import`]. The restore is not atomic: files listed in `failed`
/// were skipped while the rest were written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub directories_created: usize,
    pub written: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ImportReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

fn compile_excludes(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!(pattern = %p, error = %e, "Ignoring invalid exclude pattern");
                None
            }
        })
        .collect()
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == ROOT {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Walk the runtime's file tree breadth-first and capture every file.
///
/// Entries whose name matches an exclude pattern are skipped, directories
/// deeper than `max_depth` are not entered and files past `max_files` are
/// dropped. Only a failure to list the root is an error; unreadable
/// subdirectories and files are logged and skipped.
pub async fn export(
    handle: &dyn RuntimeHandle,
    limits: &ExportLimits,
) -> Result<Snapshot, RuntimeError> {
    let excludes = compile_excludes(&limits.exclude);
    let mut files = Vec::new();
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();
    queue.push_back((ROOT.to_string(), 0));

    'walk: while let Some((dir, depth)) = queue.pop_front() {
        let mut entries = match handle.read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if dir == ROOT => return Err(e),
            Err(e) => {
                warn!(dir = %dir, error = %e, "Skipping unreadable directory during export");
                continue;
            }
        };
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        for entry in entries {
            if excludes.iter().any(|p| p.matches(&entry.name)) {
                continue;
            }
            let path = join(&dir, &entry.name);
            if entry.is_dir() {
                if depth < limits.max_depth {
                    queue.push_back((path, depth + 1));
                }
                continue;
            }
            if files.len() >= limits.max_files {
                debug!(max_files = limits.max_files, "Export file cap reached, dropping remaining files");
                break 'walk;
            }
            match handle.read_file(&path).await {
                Ok(bytes) => files.push(SnapshotFile {
                    path,
                    content: STANDARD.encode(bytes),
                }),
                Err(e) => warn!(path = %path, error = %e, "Skipping unreadable file during export"),
            }
        }
    }

    Ok(Snapshot {
        version: SNAPSHOT_VERSION,
        saved_at: Utc::now(),
        files,
    })
}

/// Every ancestor directory of the snapshot's files, shallowest first.
fn ancestor_dirs(snapshot: &Snapshot) -> Vec<String> {
    let mut dirs = BTreeSet::new();
    for file in &snapshot.files {
        let mut parts: Vec<&str> = file.path.split('/').filter(|s| !s.is_empty()).collect();
        parts.pop();
        for i in 1..=parts.len() {
            dirs.insert(parts[..i].join("/"));
        }
    }
    let mut dirs: Vec<String> = dirs.into_iter().collect();
    dirs.sort_by_key(|d| (d.matches('/').count(), d.clone()));
    dirs
}

pub fn decode_file(file: &SnapshotFile) -> Result<Vec<u8>, SnapshotError> {
    STANDARD
        .decode(file.content.as_bytes())
        .map_err(|e| SnapshotError::InvalidPayload {
            path: file.path.clone(),
            message: e.to_string(),
        })
}

/// Restore a snapshot into a runtime. Directories are created shallow-to-deep
/// before any file is written. Individual failures are recorded in the report
/// and skipped; this function itself never fails.
pub async fn import(handle: &dyn RuntimeHandle, snapshot: &Snapshot) -> ImportReport {
    let mut report = ImportReport::default();

    for dir in ancestor_dirs(snapshot) {
        match handle.mkdir(&dir, true).await {
            Ok(()) => report.directories_created += 1,
            Err(e) => warn!(dir = %dir, error = %e, "Failed to create directory during restore"),
        }
    }

    for file in &snapshot.files {
        let result = match decode_file(file) {
            Ok(bytes) => handle
                .write_file(&file.path, &bytes)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(()) => report.written.push(file.path.clone()),
            Err(reason) => {
                warn!(path = %file.path, error = %reason, "Skipping file during restore");
                report.failed.push((file.path.clone(), reason));
            }
        }
    }

    report
}

/// Load the persisted snapshot for `app_id`. Read failures and version
/// mismatches both mean "no prior state".
pub async fn load_persisted(store: &dyn SnapshotStore, app_id: &str) -> Option<Snapshot> {
    match store.get(app_id).await {
        Ok(Some(snapshot)) if snapshot.is_current() => Some(snapshot),
        Ok(Some(snapshot)) => {
            warn!(
                app_id,
                found = snapshot.version,
                expected = SNAPSHOT_VERSION,
                "Discarding snapshot with stale schema version"
            );
            None
        }
        Ok(None) => None,
        Err(e) => {
            warn!(app_id, error = %e, "Failed to read snapshot, starting without prior state");
            None
        }
    }
}

pub fn content_hash(snapshot: &Snapshot) -> String {
    let mut hasher = Sha256::new();
    for file in &snapshot.files {
        hasher.update(file.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(file.content.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

pub fn metadata_for(app_id: &str, display_name: &str, snapshot: &Snapshot) -> SnapshotMetadata {
    SnapshotMetadata {
        app_id: app_id.to_string(),
        display_name: display_name.to_string(),
        saved_at: snapshot.saved_at,
        file_count: snapshot.files.len(),
        total_size: snapshot.total_size(),
        content_hash: content_hash(snapshot),
    }
}
