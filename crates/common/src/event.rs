// Change events emitted by durable stores.

use serde::{Deserialize, Serialize};

use crate::record::Record;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One mutation of a store, either local or absorbed from another process.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<R: Record> {
    pub operation: ChangeOperation,
    /// The record after the change; for deletes, the last known value.
    pub record: R,
    /// The value before an update. `None` for creates and deletes.
    pub previous: Option<R>,
    /// Store revision this change produced.
    pub revision: u64,
}

impl<R: Record> ChangeEvent<R> {
    pub fn created(record: R, revision: u64) -> Self {
        Self { operation: ChangeOperation::Create, record, previous: None, revision }
    }

    pub fn updated(previous: R, record: R, revision: u64) -> Self {
        Self { operation: ChangeOperation::Update, record, previous: Some(previous), revision }
    }

    pub fn deleted(record: R, revision: u64) -> Self {
        Self { operation: ChangeOperation::Delete, record, previous: None, revision }
    }

    pub fn record_id(&self) -> &str {
        self.record.id()
    }
}
