// Autorun: starts the next open work item when the active one finishes or
// when autorun is switched on, and nudges idle sessions to keep going.
//
// Holds no durable state. The only state is the processing flag that keeps
// scheduling passes single-flight; it is independent of every store lock.

pub mod prompt;

use std::sync::{Arc, Mutex, PoisonError, Weak};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use workloop_common::error::StoreError;
use workloop_common::event::{ChangeEvent, ChangeOperation};
use workloop_common::record::new_id;
use workloop_common::types::{AgentRole, SettingsRecord, Work, WorkStatus};

use crate::collab::{
    ChatClient, MessageOptions, ProcessEvent, ProcessState, SessionStore, SettingsSource,
};
use crate::store::{DurableStore, WorkStore};
use prompt::{kickoff_message, DEFAULT_CONTINUE_MESSAGE};

const KICKOFF_MODE: &str = "agent";

#[derive(Debug, Error)]
pub enum AutorunError {
    #[error("work `{work_id}` has no role")]
    MissingRole { work_id: String },

    #[error("work `{work_id}` references unknown role `{role_id}`")]
    UnknownRole { work_id: String, role_id: String },

    #[error("failed to read settings: {0:#}")]
    Settings(anyhow::Error),

    #[error("failed to prepare session: {0:#}")]
    Session(anyhow::Error),

    #[error("failed to send kickoff message: {0:#}")]
    Kickoff(anyhow::Error),

    #[error("failed to send continue message: {0:#}")]
    Continue(anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { work_id: String, session_id: String },
    /// Another pass holds the processing flag.
    Busy,
    /// A work item is already in progress.
    AlreadyActive,
    NoOpenWork,
    Disabled,
}

/// Clears the processing flag on drop, so every exit path releases it.
struct ProcessingGuard<'a> {
    flag: &'a Mutex<bool>,
}

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a Mutex<bool>) -> Option<Self> {
        let mut busy = flag.lock().unwrap_or_else(PoisonError::into_inner);
        if *busy {
            return None;
        }
        *busy = true;
        Some(Self { flag })
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        *self.flag.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

pub struct AutorunController {
    works: Arc<WorkStore>,
    roles: Arc<DurableStore<AgentRole>>,
    settings: Arc<dyn SettingsSource>,
    sessions: Arc<dyn SessionStore>,
    chat: Arc<dyn ChatClient>,
    processing: Mutex<bool>,
    continue_message: String,
    span: Span,
}

impl AutorunController {
    pub fn new(
        works: Arc<WorkStore>,
        roles: Arc<DurableStore<AgentRole>>,
        settings: Arc<dyn SettingsSource>,
        sessions: Arc<dyn SessionStore>,
        chat: Arc<dyn ChatClient>,
    ) -> Self {
        Self {
            works,
            roles,
            settings,
            sessions,
            chat,
            processing: Mutex::new(false),
            continue_message: DEFAULT_CONTINUE_MESSAGE.to_string(),
            span: info_span!("autorun"),
        }
    }

    pub fn with_continue_message(mut self, message: impl Into<String>) -> Self {
        self.continue_message = message.into();
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    async fn enabled(&self) -> Result<bool, AutorunError> {
        Ok(self.settings.get().await.map_err(AutorunError::Settings)?.autorun)
    }

    // ── Scheduling ─────────────────────────────────────────────────

    /// Start the first open work item (priority ascending) unless one is
    /// already in progress. At most one pass runs at a time.
    pub async fn start_next_open_work(&self) -> Result<StartOutcome, AutorunError> {
        if !self.enabled().await? {
            return Ok(StartOutcome::Disabled);
        }
        let Some(_guard) = ProcessingGuard::acquire(&self.processing) else {
            debug!(parent: &self.span, "pass already running, skipping");
            return Ok(StartOutcome::Busy);
        };

        let works = self.works.list();
        if works.iter().any(|w| w.status == WorkStatus::InProgress) {
            return Ok(StartOutcome::AlreadyActive);
        }
        let Some(next) = works.into_iter().find(|w| w.status == WorkStatus::Open) else {
            return Ok(StartOutcome::NoOpenWork);
        };
        self.start_work(next).await
    }

    async fn start_work(&self, work: Work) -> Result<StartOutcome, AutorunError> {
        let role = self.resolve_role(&work)?;
        let session_id = new_id();

        self.sessions.create(&session_id).await.map_err(AutorunError::Session)?;
        if let Err(error) = self.sessions.update(&session_id, &work.title).await {
            self.discard_session(&session_id).await;
            return Err(AutorunError::Session(error));
        }

        let started = match self.works.start(&work.id, &session_id) {
            Ok(started) => started,
            Err(error) => {
                self.discard_session(&session_id).await;
                return Err(error.into());
            }
        };

        let parent_title =
            started.parent_id.as_deref().and_then(|id| self.works.get(id)).map(|parent| parent.title);
        let message = kickoff_message(&started, parent_title.as_deref());
        let options = MessageOptions {
            mode: Some(KICKOFF_MODE.to_string()),
            system_prompt: Some(role.prompt).filter(|p| !p.trim().is_empty()),
        };

        if let Err(error) = self.chat.send_message_with_options(&session_id, &message, options).await {
            // The work item stays in_progress, pointing at the deleted session.
            self.discard_session(&session_id).await;
            return Err(AutorunError::Kickoff(error));
        }

        info!(parent: &self.span, work_id = %started.id, %session_id, "work started");
        Ok(StartOutcome::Started { work_id: started.id, session_id })
    }

    fn resolve_role(&self, work: &Work) -> Result<AgentRole, AutorunError> {
        let role_id = work
            .role_id
            .as_deref()
            .ok_or_else(|| AutorunError::MissingRole { work_id: work.id.clone() })?;
        self.roles.get(role_id).ok_or_else(|| AutorunError::UnknownRole {
            work_id: work.id.clone(),
            role_id: role_id.to_string(),
        })
    }

    async fn discard_session(&self, session_id: &str) {
        if let Err(error) = self.sessions.delete(session_id).await {
            warn!(parent: &self.span, %session_id, error = %format!("{error:#}"), "failed to delete orphaned session");
        }
    }

    async fn run_pass(&self, trigger: &'static str) {
        match self.start_next_open_work().await {
            Ok(outcome) => debug!(trigger, ?outcome, "autorun pass finished"),
            Err(error) => warn!(trigger, %error, "autorun pass failed"),
        }
    }

    // ── Idle sessions ──────────────────────────────────────────────

    /// Nudge the session of the in-progress work item that went idle.
    /// Returns whether a message was sent.
    pub async fn handle_process_event(&self, event: &ProcessEvent) -> Result<bool, AutorunError> {
        if event.state != ProcessState::Idle || event.is_initial {
            return Ok(false);
        }
        if !self.enabled().await? {
            return Ok(false);
        }
        let active = self.works.list().into_iter().find(|w| {
            w.status == WorkStatus::InProgress && w.session_id.as_deref() == Some(event.session_id.as_str())
        });
        let Some(work) = active else {
            return Ok(false);
        };

        self.chat
            .send_message(&event.session_id, &self.continue_message)
            .await
            .map_err(AutorunError::Continue)?;
        debug!(parent: &self.span, work_id = %work.id, session_id = %event.session_id, "nudged idle session");
        Ok(true)
    }

    // ── Wiring ─────────────────────────────────────────────────────

    /// Schedule a pass whenever a work item finishes. Must be called within
    /// a tokio runtime; passes run as detached tasks.
    pub fn watch_work(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = Handle::current();
        self.works.durable().add_on_change_listener(Arc::new(move |event: &ChangeEvent<Work>| {
            if became_done(event) {
                spawn_pass(&weak, &handle, "work finished");
            }
        }));
    }

    /// Schedule a pass whenever autorun is switched on.
    pub fn watch_settings(self: &Arc<Self>, store: &DurableStore<SettingsRecord>) {
        let weak = Arc::downgrade(self);
        let handle = Handle::current();
        store.add_on_change_listener(Arc::new(move |event: &ChangeEvent<SettingsRecord>| {
            if autorun_enabled(event) {
                spawn_pass(&weak, &handle, "autorun enabled");
            }
        }));
    }

    /// Consume process events until the channel closes.
    pub fn watch_processes(self: &Arc<Self>, mut events: broadcast::Receiver<ProcessEvent>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let span = self.span.clone();
        tokio::spawn(
            async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            let Some(controller) = weak.upgrade() else { break };
                            tokio::spawn(
                                async move {
                                    if let Err(error) = controller.handle_process_event(&event).await {
                                        warn!(%error, session_id = %event.session_id, "idle handling failed");
                                    }
                                }
                                .in_current_span(),
                            );
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "process events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            .instrument(span),
        )
    }
}

fn spawn_pass(weak: &Weak<AutorunController>, handle: &Handle, trigger: &'static str) {
    let Some(controller) = weak.upgrade() else {
        return;
    };
    let span = controller.span.clone();
    handle.spawn(async move { controller.run_pass(trigger).await }.instrument(span));
}

/// An update that moved a work item from unfinished to `done` or `closed`.
pub fn became_done(event: &ChangeEvent<Work>) -> bool {
    event.operation == ChangeOperation::Update
        && event.record.status.is_finished()
        && event.previous.as_ref().is_some_and(|p| !p.status.is_finished())
}

/// A create or update that turned autorun on.
pub fn autorun_enabled(event: &ChangeEvent<SettingsRecord>) -> bool {
    event.operation != ChangeOperation::Delete
        && event.record.autorun
        && !event.previous.as_ref().is_some_and(|p| p.autorun)
}
