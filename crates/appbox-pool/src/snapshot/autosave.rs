use appbox_common::{RuntimeHandle, SnapshotStore};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::export;
use crate::config::ExportLimits;

/// Debounced per-identifier snapshot writer. Each `enqueue` restarts the
/// identifier's timer, so a burst of changes produces one write.
///
/// A save keeps its slot until its write has finished, and `cancel` waits
/// for a write already in flight, so no auto-save can land after a caller
/// that cancelled and then wrote the same identifier.
pub struct AutoSaver {
    store: Arc<dyn SnapshotStore>,
    limits: ExportLimits,
    debounce: Duration,
    pending: DashMap<String, (u64, JoinHandle<()>)>,
    // Held for the export and write of one save.
    writers: DashMap<String, Arc<Mutex<()>>>,
    next_ticket: AtomicU64,
}

impl AutoSaver {
    pub fn new(store: Arc<dyn SnapshotStore>, limits: ExportLimits, debounce: Duration) -> Self {
        Self {
            store,
            limits,
            debounce,
            pending: DashMap::new(),
            writers: DashMap::new(),
            next_ticket: AtomicU64::new(0),
        }
    }

    pub fn enqueue(
        self: &Arc<Self>,
        app_id: &str,
        handle: Arc<dyn RuntimeHandle>,
        display_name: &str,
    ) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let saver = Arc::clone(self);
        let id = app_id.to_string();
        let name = display_name.to_string();

        let gate = self.writer(app_id);
        // Holding the entry keeps the task from clearing its own slot before
        // the slot is filled.
        let entry = self.pending.entry(app_id.to_string());
        let task = tokio::spawn(async move {
            tokio::time::sleep(saver.debounce).await;
            let writer = saver.writer(&id);
            let _write = writer.lock().await;
            if !saver.is_current(&id, ticket) {
                debug!(app_id = %id, "Auto-save superseded or cancelled before writing");
                return;
            }

            match export(handle.as_ref(), &saver.limits).await {
                Ok(snapshot) => match saver.store.put(&id, &name, &snapshot).await {
                    Ok(()) => info!(app_id = %id, files = snapshot.files.len(), "Auto-saved snapshot"),
                    Err(e) => warn!(app_id = %id, error = %e, "Auto-save failed to persist snapshot"),
                },
                Err(e) => warn!(app_id = %id, error = %e, "Auto-save failed to export file tree"),
            }
            saver.pending.remove_if(&id, |_, (t, _)| *t == ticket);
        });

        match entry {
            Entry::Occupied(mut slot) => {
                let (_, previous) = slot.insert((ticket, task));
                // A save that is already writing runs to completion.
                if gate.try_lock().is_ok() {
                    previous.abort();
                }
                debug!(app_id, "Coalesced auto-save into a new debounce window");
            }
            Entry::Vacant(slot) => {
                slot.insert((ticket, task));
            }
        }
    }

    /// Drop any pending save for `app_id`. A save that is already writing is
    /// allowed to finish first; when this returns no save for `app_id` is
    /// running or scheduled.
    pub async fn cancel(&self, app_id: &str) {
        let writer = self.writer(app_id);
        let _write = writer.lock().await;
        if let Some((_, (_, task))) = self.pending.remove(app_id) {
            task.abort();
        }
    }

    /// True while a save for `app_id` is scheduled or writing.
    pub fn is_pending(&self, app_id: &str) -> bool {
        self.pending.contains_key(app_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn writer(&self, app_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.writers.entry(app_id.to_string()).or_default().value())
    }

    fn is_current(&self, app_id: &str, ticket: u64) -> bool {
        self.pending
            .get(app_id)
            .map(|slot| slot.0 == ticket)
            .unwrap_or(false)
    }
}
