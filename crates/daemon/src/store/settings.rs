// Singleton settings record.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use workloop_common::error::StoreError;
use workloop_common::types::{Settings, SettingsPatch, SettingsRecord};

use super::DurableStore;
use crate::collab::SettingsSource;

/// ID of the settings record written by this crate. Any single record found
/// on disk is honoured regardless of its ID.
pub const SETTINGS_ID: &str = "global";

pub struct FileSettingsStore {
    records: Arc<DurableStore<SettingsRecord>>,
}

impl FileSettingsStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        Ok(Self::from_store(Arc::new(DurableStore::open(data_dir)?)))
    }

    pub fn from_store(records: Arc<DurableStore<SettingsRecord>>) -> Self {
        Self { records }
    }

    pub fn durable(&self) -> &Arc<DurableStore<SettingsRecord>> {
        &self.records
    }

    /// Current settings; defaults when nothing has been saved.
    pub fn current(&self) -> Settings {
        self.records.list().first().map(Settings::from).unwrap_or_default()
    }

    pub fn set_autorun(&self, enabled: bool) -> Result<SettingsRecord, StoreError> {
        let patch = SettingsPatch { autorun: Some(enabled) };
        match self.records.list().into_iter().next() {
            Some(existing) => self.records.update(&existing.id, patch),
            None => self.records.create_with_id(SETTINGS_ID, patch),
        }
    }
}

#[async_trait]
impl SettingsSource for FileSettingsStore {
    async fn get(&self) -> anyhow::Result<Settings> {
        Ok(self.current())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn defaults_to_autorun_off() {
        let tmp = tempdir().unwrap();
        let settings = FileSettingsStore::open(tmp.path()).unwrap();
        assert_eq!(settings.current(), Settings { autorun: false });
    }

    #[test]
    fn toggling_reuses_the_singleton_record() {
        let tmp = tempdir().unwrap();
        let settings = FileSettingsStore::open(tmp.path()).unwrap();

        let first = settings.set_autorun(true).unwrap();
        let second = settings.set_autorun(false).unwrap();
        assert_eq!(first.id, SETTINGS_ID);
        assert_eq!(second.id, SETTINGS_ID);
        assert_eq!(settings.durable().list().len(), 1);
        assert!(!settings.current().autorun);
    }

    #[test]
    fn toggle_survives_reopen() {
        let tmp = tempdir().unwrap();
        FileSettingsStore::open(tmp.path()).unwrap().set_autorun(true).unwrap();
        let reopened = FileSettingsStore::open(tmp.path()).unwrap();
        assert!(reopened.current().autorun);
    }

    #[tokio::test]
    async fn settings_source_reports_current_value() {
        let tmp = tempdir().unwrap();
        let settings = FileSettingsStore::open(tmp.path()).unwrap();
        settings.set_autorun(true).unwrap();
        assert!(SettingsSource::get(&settings).await.unwrap().autorun);
    }
}
