// Absorbs index writes made by other processes into a store's cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};
use workloop_common::error::StoreError;
use workloop_common::event::ChangeEvent;
use workloop_common::record::Record;

use super::debounce::{DebounceConfig, Debouncer};
use super::{IndexChange, IndexWatcher, WatchError};
use crate::store::index::INDEX_FILE_NAME;
use crate::store::{Absorb, DurableStore};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to read {entity} index: {source}")]
    Read {
        entity: &'static str,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The cache was replaced; this many events were emitted.
    Applied(usize),
    /// Nothing differed.
    Unchanged,
    /// A local write overtook the pass; its result was discarded.
    Stale,
}

/// Events that turn `old` into `new`, all stamped with `revision`.
///
/// Deletes come first, then creates, then updates; each group is sorted by
/// ID. Records equal in every field produce nothing.
pub fn diff<R: Record>(old: &[R], new: &[R], revision: u64) -> Vec<ChangeEvent<R>> {
    let old_by_id: BTreeMap<&str, &R> = old.iter().map(|r| (r.id(), r)).collect();
    let new_by_id: BTreeMap<&str, &R> = new.iter().map(|r| (r.id(), r)).collect();

    let deletes = old_by_id
        .iter()
        .filter(|(id, _)| !new_by_id.contains_key(*id))
        .map(|(_, r)| ChangeEvent::deleted((*r).clone(), revision));
    let creates = new_by_id
        .iter()
        .filter(|(id, _)| !old_by_id.contains_key(*id))
        .map(|(_, r)| ChangeEvent::created((*r).clone(), revision));
    let updates = new_by_id.iter().filter_map(|(id, next)| {
        let previous = old_by_id.get(id)?;
        (previous != next).then(|| ChangeEvent::updated((*previous).clone(), (*next).clone(), revision))
    });

    deletes.chain(creates).chain(updates).collect()
}

/// One reconciliation pass: read the index under a shared lock and fold it
/// into the cache unless a local write overtook the read.
pub fn reconcile_once<R: Record>(store: &DurableStore<R>) -> Result<ReconcileOutcome, ReconcileError> {
    let generation = store.write_generation();
    let loaded = store
        .index()
        .read::<R>()
        .map_err(|source| ReconcileError::Read { entity: R::ENTITY, source })?;

    // Our own writes come back through the watcher too.
    if loaded.digest == store.last_digest() {
        return Ok(ReconcileOutcome::Unchanged);
    }

    Ok(match store.absorb(loaded, generation) {
        Absorb::Applied(n) => ReconcileOutcome::Applied(n),
        Absorb::Unchanged => ReconcileOutcome::Unchanged,
        Absorb::Stale => ReconcileOutcome::Stale,
    })
}

struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
    watcher: IndexWatcher,
}

/// Keeps one store's cache in step with its index file on disk.
pub struct Reconciler<R: Record> {
    store: Arc<DurableStore<R>>,
    config: DebounceConfig,
    span: Span,
    running: Mutex<Option<Running>>,
}

impl<R: Record> Reconciler<R> {
    pub fn new(store: Arc<DurableStore<R>>, config: DebounceConfig) -> Self {
        Self {
            store,
            config,
            span: info_span!("reconciler", entity = R::ENTITY),
            running: Mutex::new(None),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Register the directory watch and spawn the debounce loop. Returns
    /// once the watch is in place.
    pub async fn start(&self) -> Result<(), WatchError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(WatchError::AlreadyWatching(R::ENTITY));
        }

        self.store.index().ensure_dir()?;
        let (watcher, changes) = IndexWatcher::start(self.store.index().dir(), INDEX_FILE_NAME)?;
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(
            run_loop(self.store.clone(), self.config, changes, shutdown_rx).instrument(self.span.clone()),
        );

        info!(parent: &self.span, dir = %watcher.dir().display(), "watching index");
        *running = Some(Running { shutdown, task, watcher });
        Ok(())
    }

    /// Cancel any pending pass, close the watch and wait for the loop to
    /// exit. No-op when not running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown.send(());
        drop(running.watcher);
        if let Err(error) = running.task.await {
            warn!(parent: &self.span, %error, "reconcile loop ended abnormally");
        }
        info!(parent: &self.span, "stopped watching index");
    }

    pub async fn is_watching(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Run a pass immediately, outside the debounce loop.
    pub async fn reconcile_now(&self) -> Result<ReconcileOutcome, ReconcileError> {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || reconcile_once(&store)).await {
            Ok(result) => result,
            Err(join) => Err(ReconcileError::Read {
                entity: R::ENTITY,
                source: StoreError::io("reconcile task failed", std::io::Error::other(join)),
            }),
        }
    }
}

async fn run_loop<R: Record>(
    store: Arc<DurableStore<R>>,
    config: DebounceConfig,
    mut changes: mpsc::Receiver<IndexChange>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut debouncer = Debouncer::new(config);

    loop {
        let deadline = debouncer.next_deadline();
        tokio::select! {
            _ = &mut shutdown => break,
            change = changes.recv() => match change {
                Some(change) => {
                    trace!(kind = ?change.kind, "index change");
                    debouncer.push();
                }
                None => {
                    debug!("index change channel closed");
                    break;
                }
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let Some(coalesced) = debouncer.take_ready() else { continue };
                let pass_store = store.clone();
                match tokio::task::spawn_blocking(move || reconcile_once(&pass_store)).await {
                    Ok(Ok(outcome)) => debug!(?outcome, coalesced, "reconcile pass finished"),
                    Ok(Err(error)) => warn!(%error, "reconcile pass failed; cache left as-is"),
                    Err(error) => error!(%error, "reconcile pass panicked"),
                }
            }
        }
    }

    debouncer.cancel();
}
