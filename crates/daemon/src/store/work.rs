// Work items: the generic store plus parent references, default priority,
// and the done → closed cascade.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;
use workloop_common::error::{StoreError, ValidationError};
use workloop_common::record::new_id;
use workloop_common::types::{Work, WorkDraft, WorkPatch, WorkStatus};

use super::DurableStore;

pub struct WorkStore {
    records: Arc<DurableStore<Work>>,
}

impl WorkStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        Ok(Self::from_store(Arc::new(DurableStore::open(data_dir)?)))
    }

    pub fn from_store(records: Arc<DurableStore<Work>>) -> Self {
        Self { records }
    }

    pub fn durable(&self) -> &Arc<DurableStore<Work>> {
        &self.records
    }

    /// All work items, priority ascending.
    pub fn list(&self) -> Vec<Work> {
        self.records.list()
    }

    pub fn get(&self, id: &str) -> Option<Work> {
        self.records.get(id)
    }

    /// Create an open work item. Without an explicit priority it queues
    /// after everything that exists.
    pub fn create(&self, draft: WorkDraft) -> Result<Work, StoreError> {
        let explicit_priority = draft.priority.is_some();
        self.records.create_checked(new_id(), draft, |existing, work| {
            check_parent(existing, work)?;
            if !explicit_priority {
                let last = existing.iter().map(|w| w.priority).max().unwrap_or(0);
                work.priority = last.saturating_add(1);
            }
            Ok(())
        })
    }

    /// Patch a work item. A status change runs the close cascade.
    pub fn update(&self, id: &str, patch: WorkPatch) -> Result<Work, StoreError> {
        let status_changed = patch.status.is_some();
        let updated = self.records.update_checked(id, patch, check_parent)?;
        if status_changed {
            return self.settle(updated);
        }
        Ok(updated)
    }

    /// `open → in_progress`, bound to `session_id`, in one persist.
    pub fn start(&self, id: &str, session_id: &str) -> Result<Work, StoreError> {
        self.update(
            id,
            WorkPatch {
                status: Some(WorkStatus::InProgress),
                session_id: Some(session_id.to_string()),
                ..WorkPatch::default()
            },
        )
    }

    /// `in_progress → done`; closes straight away when nothing below it is
    /// still open.
    pub fn mark_done(&self, id: &str) -> Result<Work, StoreError> {
        self.update(id, WorkPatch { status: Some(WorkStatus::Done), ..WorkPatch::default() })
    }

    pub fn close(&self, id: &str) -> Result<Work, StoreError> {
        self.update(id, WorkPatch { status: Some(WorkStatus::Closed), ..WorkPatch::default() })
    }

    pub fn delete(&self, id: &str) -> Result<Work, StoreError> {
        self.records.delete(id)
    }

    /// Children of `id`, priority ascending.
    pub fn children(&self, id: &str) -> Vec<Work> {
        self.list().into_iter().filter(|w| w.parent_id.as_deref() == Some(id)).collect()
    }

    fn has_unclosed_children(&self, id: &str) -> bool {
        self.children(id).iter().any(|child| child.status != WorkStatus::Closed)
    }

    /// Apply the close cascade after `work` changed status and return its
    /// final value.
    fn settle(&self, work: Work) -> Result<Work, StoreError> {
        let work = if work.status == WorkStatus::Done && !self.has_unclosed_children(&work.id) {
            debug!(parent: self.records.span(), id = %work.id, "auto-closing finished work");
            self.records.update(
                &work.id,
                WorkPatch { status: Some(WorkStatus::Closed), ..WorkPatch::default() },
            )?
        } else {
            work
        };

        if work.status == WorkStatus::Closed {
            if let Some(parent) = work.parent_id.as_deref().and_then(|p| self.get(p)) {
                if parent.status == WorkStatus::Done {
                    self.settle(parent)?;
                }
            }
        }
        Ok(work)
    }
}

fn check_parent(existing: &[Work], work: &Work) -> Result<(), StoreError> {
    let Some(parent_id) = work.parent_id.as_deref() else {
        return Ok(());
    };
    if !existing.iter().any(|w| w.id == parent_id) {
        return Err(ValidationError::UnknownReference {
            field: "parentId",
            entity: "work",
            value: parent_id.to_string(),
        }
        .into());
    }
    Ok(())
}
