// Narrow interfaces to systems outside the store: agent sessions, the chat
// transport, settings, and agent process state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use workloop_common::types::{SessionRecord, Settings};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, id: &str) -> anyhow::Result<SessionRecord>;
    async fn update(&self, id: &str, title: &str) -> anyhow::Result<()>;
    async fn delete(&self, id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn send_message(&self, session_id: &str, content: &str) -> anyhow::Result<()>;

    async fn send_message_with_options(
        &self,
        session_id: &str,
        content: &str,
        options: MessageOptions,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn get(&self) -> anyhow::Result<Settings>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Idle,
    Running,
    Ended,
}

/// State change of a coding-agent process attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEvent {
    pub session_id: String,
    pub state: ProcessState,
    /// The idle state a session starts in, before any message was sent.
    #[serde(default)]
    pub is_initial: bool,
}

impl ProcessEvent {
    pub fn idle(session_id: impl Into<String>, is_initial: bool) -> Self {
        Self { session_id: session_id.into(), state: ProcessState::Idle, is_initial }
    }
}

/// Chat client with no agent transport behind it: messages are logged and
/// dropped. Used by the standalone daemon.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChat;

#[async_trait]
impl ChatClient for LogChat {
    async fn send_message(&self, session_id: &str, content: &str) -> anyhow::Result<()> {
        tracing::info!(session_id, bytes = content.len(), "chat message");
        Ok(())
    }

    async fn send_message_with_options(
        &self,
        session_id: &str,
        content: &str,
        options: MessageOptions,
    ) -> anyhow::Result<()> {
        tracing::info!(session_id, bytes = content.len(), mode = ?options.mode, "chat message");
        Ok(())
    }
}
