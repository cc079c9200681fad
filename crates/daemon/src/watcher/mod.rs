// Index watcher: inotify/fsevents on an entity directory → debounce →
// reconcile against the store cache.
// This module handles the first stage: raw event detection and filtering.

pub mod debounce;
pub mod reconcile;

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};
use workloop_common::error::StoreError;

pub use reconcile::{diff, ReconcileError, ReconcileOutcome, Reconciler};

/// Capacity for the internal event channel. When full, a pass is already
/// pending, so further events carry no information and are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to create directory watcher: {0}")]
    Create(#[source] notify::Error),

    #[error("failed to watch `{}`: {source}", path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("{0} index is already being watched")]
    AlreadyWatching(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexChangeKind {
    Created,
    Modified,
    Removed,
}

/// A filesystem event on the watched index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexChange {
    pub kind: IndexChangeKind,
    pub path: PathBuf,
}

/// Watches one directory, non-recursively, for events on a single file name.
///
/// The directory is watched rather than the file because writers replace the
/// file by rename. Events arrive on the returned receiver until the watcher
/// is dropped.
pub struct IndexWatcher {
    _watcher: RecommendedWatcher,
    dir: PathBuf,
}

impl IndexWatcher {
    pub fn start(
        dir: &Path,
        file_name: &'static str,
    ) -> Result<(Self, mpsc::Receiver<IndexChange>), WatchError> {
        let dir = dir.canonicalize().map_err(|source| {
            StoreError::io(format!("failed to canonicalize `{}`", dir.display()), source)
        })?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in translate_event(&event, file_name) {
                    match tx.try_send(change) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            trace!("index change channel full, dropping event");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            debug!("index change channel closed, stopping event dispatch");
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "index watcher error");
            }
        })
        .map_err(WatchError::Create)?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Watch { path: dir.clone(), source })?;

        debug!(path = %dir.display(), file_name, "index watcher started");
        Ok((Self { _watcher: watcher, dir }, rx))
    }

    /// The canonicalized directory being watched.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Translate a `notify::Event` into changes on `file_name`.
/// Sibling files (the lock and temp files) and metadata-only events are skipped.
fn translate_event(event: &Event, file_name: &str) -> Vec<IndexChange> {
    let kind = match &event.kind {
        EventKind::Create(_) => IndexChangeKind::Created,
        EventKind::Modify(modify_kind) => {
            use notify::event::ModifyKind;
            match modify_kind {
                ModifyKind::Metadata(_) => {
                    trace!("skipping metadata-only modify event");
                    return Vec::new();
                }
                // Data writes and renames onto the index both count.
                _ => IndexChangeKind::Modified,
            }
        }
        EventKind::Remove(_) => IndexChangeKind::Removed,
        _ => {
            trace!(kind = ?event.kind, "skipping non-content event");
            return Vec::new();
        }
    };

    event
        .paths
        .iter()
        .filter(|p| p.file_name() == Some(OsStr::new(file_name)))
        .map(|p| IndexChange { kind, path: p.clone() })
        .collect()
}
