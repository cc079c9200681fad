// File-backed session registry.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use workloop_common::error::StoreError;
use workloop_common::types::{SessionDraft, SessionPatch, SessionRecord};

use crate::collab::SessionStore;
use crate::store::DurableStore;

pub struct FileSessionStore {
    records: Arc<DurableStore<SessionRecord>>,
}

impl FileSessionStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        Ok(Self::from_store(Arc::new(DurableStore::open(data_dir)?)))
    }

    pub fn from_store(records: Arc<DurableStore<SessionRecord>>) -> Self {
        Self { records }
    }

    pub fn durable(&self) -> &Arc<DurableStore<SessionRecord>> {
        &self.records
    }

    pub fn list(&self) -> Vec<SessionRecord> {
        self.records.list()
    }

    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        self.records.get(id)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create(&self, id: &str) -> anyhow::Result<SessionRecord> {
        self.records
            .create_with_id(id, SessionDraft::default())
            .with_context(|| format!("failed to create session `{id}`"))
    }

    async fn update(&self, id: &str, title: &str) -> anyhow::Result<()> {
        self.records
            .update(id, SessionPatch { title: Some(title.to_string()) })
            .with_context(|| format!("failed to retitle session `{id}`"))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.records.delete(id).with_context(|| format!("failed to delete session `{id}`"))?;
        Ok(())
    }
}
