// Core domain records shared across all workloop crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, ValidationError};
use crate::record::{require_non_empty, Record};

// ── Work ────────────────────────────────────────────────────────────

/// Lifecycle of a work item.
///
/// `open → in_progress → done → closed`; nothing else.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    #[default]
    Open,
    InProgress,
    Done,
    Closed,
}

impl WorkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::InProgress) | (Self::InProgress, Self::Done) | (Self::Done, Self::Closed)
        )
    }

    /// `done` or `closed`.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Closed)
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    Story,
    #[default]
    Task,
    Bug,
}

impl WorkType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Story => "story",
            Self::Task => "task",
            Self::Bug => "bug",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "story" => Some(Self::Story),
            "task" => Some(Self::Task),
            "bug" => Some(Self::Bug),
            _ => None,
        }
    }
}

/// A unit of agent-assigned work (a ticket).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Work {
    pub id: String,
    #[serde(rename = "type", default)]
    pub work_type: WorkType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub status: WorkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkDraft {
    pub work_type: WorkType,
    pub parent_id: Option<String>,
    pub title: String,
    pub body: String,
    pub role_id: Option<String>,
    /// `None` lets the work store queue the item last.
    pub priority: Option<i64>,
}

/// Partial update for a work item. `Some("")` on an optional reference
/// clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkPatch {
    pub work_type: Option<WorkType>,
    pub parent_id: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub status: Option<WorkStatus>,
    pub role_id: Option<String>,
    pub session_id: Option<String>,
    pub priority: Option<i64>,
}

fn clearable(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

impl Record for Work {
    const ENTITY: &'static str = "work";
    const COLLECTION: &'static str = "works";

    type Draft = WorkDraft;
    type Patch = WorkPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn from_draft(id: String, now: DateTime<Utc>, draft: WorkDraft) -> Self {
        Self {
            id,
            work_type: draft.work_type,
            parent_id: draft.parent_id.and_then(clearable),
            title: draft.title,
            body: draft.body,
            status: WorkStatus::Open,
            role_id: draft.role_id.and_then(clearable),
            session_id: None,
            priority: draft.priority.unwrap_or_default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn apply_patch(&mut self, patch: WorkPatch) -> Result<(), StoreError> {
        if let Some(next) = patch.status {
            if !self.status.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    id: self.id.clone(),
                    from: self.status,
                    to: next,
                });
            }
            self.status = next;
        }
        if let Some(work_type) = patch.work_type {
            self.work_type = work_type;
        }
        if let Some(parent_id) = patch.parent_id {
            self.parent_id = clearable(parent_id);
        }
        if let Some(title) = patch.title {
            self.title = title;
        }
        if let Some(body) = patch.body {
            self.body = body;
        }
        if let Some(role_id) = patch.role_id {
            self.role_id = clearable(role_id);
        }
        if let Some(session_id) = patch.session_id {
            self.session_id = clearable(session_id);
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("title", &self.title)?;
        if self.parent_id.as_deref() == Some(self.id.as_str()) {
            return Err(ValidationError::Invalid {
                field: "parentId",
                reason: "a work item cannot be its own parent".into(),
            });
        }
        Ok(())
    }

    fn order(records: &mut [Self]) {
        records.sort_by_key(|work| work.priority);
    }
}

// ── Agent roles ─────────────────────────────────────────────────────

/// A named system prompt assigned to work items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentRole {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentRoleDraft {
    pub name: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentRolePatch {
    pub name: Option<String>,
    pub prompt: Option<String>,
}

impl Record for AgentRole {
    const ENTITY: &'static str = "role";
    const COLLECTION: &'static str = "roles";

    type Draft = AgentRoleDraft;
    type Patch = AgentRolePatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn from_draft(id: String, now: DateTime<Utc>, draft: AgentRoleDraft) -> Self {
        Self { id, name: draft.name, prompt: draft.prompt, created_at: now, updated_at: now }
    }

    fn apply_patch(&mut self, patch: AgentRolePatch) -> Result<(), StoreError> {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(prompt) = patch.prompt {
            self.prompt = prompt;
        }
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("name", &self.name)
    }
}

// ── Saved commands ──────────────────────────────────────────────────

/// A reusable prompt snippet ("slash command").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SavedCommand {
    pub id: String,
    pub name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedCommandDraft {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedCommandPatch {
    pub name: Option<String>,
    pub content: Option<String>,
}

impl Record for SavedCommand {
    const ENTITY: &'static str = "command";
    const COLLECTION: &'static str = "commands";

    type Draft = SavedCommandDraft;
    type Patch = SavedCommandPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn from_draft(id: String, now: DateTime<Utc>, draft: SavedCommandDraft) -> Self {
        Self { id, name: draft.name, content: draft.content, created_at: now, updated_at: now }
    }

    fn apply_patch(&mut self, patch: SavedCommandPatch) -> Result<(), StoreError> {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(content) = patch.content {
            self.content = content;
        }
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("name", &self.name)?;
        require_non_empty("content", &self.content)
    }
}

// ── Sessions ────────────────────────────────────────────────────────

/// A coding-agent chat session known to this data directory.
///
/// Session IDs are chosen by the caller (the autorun controller mints
/// them before the session exists), so the draft carries the ID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDraft {
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub title: Option<String>,
}

impl Record for SessionRecord {
    const ENTITY: &'static str = "session";
    const COLLECTION: &'static str = "sessions";

    type Draft = SessionDraft;
    type Patch = SessionPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn from_draft(id: String, now: DateTime<Utc>, draft: SessionDraft) -> Self {
        Self { id, title: draft.title, created_at: now, updated_at: now }
    }

    fn apply_patch(&mut self, patch: SessionPatch) -> Result<(), StoreError> {
        if let Some(title) = patch.title {
            self.title = title;
        }
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

// ── Settings ────────────────────────────────────────────────────────

/// Global switches. Stored as a singleton collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SettingsRecord {
    pub id: String,
    #[serde(default)]
    pub autorun: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsPatch {
    pub autorun: Option<bool>,
}

impl Record for SettingsRecord {
    const ENTITY: &'static str = "settings";
    const COLLECTION: &'static str = "settings";

    type Draft = SettingsPatch;
    type Patch = SettingsPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn from_draft(id: String, now: DateTime<Utc>, draft: SettingsPatch) -> Self {
        Self { id, autorun: draft.autorun.unwrap_or(false), created_at: now, updated_at: now }
    }

    fn apply_patch(&mut self, patch: SettingsPatch) -> Result<(), StoreError> {
        if let Some(autorun) = patch.autorun {
            self.autorun = autorun;
        }
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Snapshot of the settings consumed by the autorun controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Settings {
    pub autorun: bool,
}

impl From<&SettingsRecord> for Settings {
    fn from(record: &SettingsRecord) -> Self {
        Self { autorun: record.autorun }
    }
}
