// The `Record` trait: what a durable store needs to know about an entity.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{StoreError, ValidationError};

/// A homogeneous, persistable entity kept in one index file.
///
/// Implementors are plain data; the store owns identity assignment,
/// timestamps and persistence.
pub trait Record:
    Clone + PartialEq + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Directory name under the data dir, e.g. `work`.
    const ENTITY: &'static str;
    /// JSON key holding the record array in `index.json`, e.g. `works`.
    const COLLECTION: &'static str;

    /// Fields supplied by the caller on creation.
    type Draft: Send;
    /// Partial update: `None` fields are left unchanged.
    type Patch: Send;

    fn id(&self) -> &str;

    fn from_draft(id: String, now: DateTime<Utc>, draft: Self::Draft) -> Self;

    /// Apply a patch in place. May reject the patch outright (e.g. an
    /// illegal status transition); field validation happens afterwards.
    fn apply_patch(&mut self, patch: Self::Patch) -> Result<(), StoreError>;

    /// Bump the update timestamp.
    fn touch(&mut self, now: DateTime<Utc>);

    fn validate(&self) -> Result<(), ValidationError>;

    /// Ordering applied to `List()` results. Must be deterministic.
    fn order(_records: &mut [Self]) {}
}

/// New globally unique, time-sortable record ID (UUIDv7).
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Fails when `value` is empty after trimming.
pub fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::empty(field));
    }
    Ok(())
}
