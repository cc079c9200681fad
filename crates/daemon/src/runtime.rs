use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};
use workloop_common::error::StoreError;
use workloop_common::record::Record;
use workloop_common::types::{AgentRole, SavedCommand, SessionRecord, SettingsRecord, Work};

use crate::autorun::AutorunController;
use crate::collab::{ChatClient, LogChat, ProcessEvent};
use crate::config::DaemonConfig;
use crate::fanout::{ChangeNotifier, LogSink};
use crate::sessions::FileSessionStore;
use crate::store::{DurableStore, FileSettingsStore, WorkStore};
use crate::watcher::{Reconciler, WatchError};

const PROCESS_EVENT_CAPACITY: usize = 64;

/// Type-erased reconciler so one list can hold every entity's.
#[async_trait]
trait IndexReconciler: Send + Sync {
    fn entity(&self) -> &'static str;
    async fn start(&self) -> Result<(), WatchError>;
    async fn stop(&self);
}

#[async_trait]
impl<R: Record> IndexReconciler for Reconciler<R> {
    fn entity(&self) -> &'static str {
        R::ENTITY
    }

    async fn start(&self) -> Result<(), WatchError> {
        Reconciler::start(self).await
    }

    async fn stop(&self) {
        Reconciler::stop(self).await
    }
}

/// Every store for one data directory, with its notifiers and reconcilers.
pub struct Services {
    data_dir: PathBuf,
    config: DaemonConfig,
    pub works: Arc<WorkStore>,
    pub roles: Arc<DurableStore<AgentRole>>,
    pub commands: Arc<DurableStore<SavedCommand>>,
    pub sessions: Arc<FileSessionStore>,
    pub settings: Arc<FileSettingsStore>,
    pub work_notifier: ChangeNotifier<Work>,
    pub role_notifier: ChangeNotifier<AgentRole>,
    pub command_notifier: ChangeNotifier<SavedCommand>,
    reconcilers: Vec<Arc<dyn IndexReconciler>>,
}

impl Services {
    /// Open every store under `data_dir`, each reading its index once under
    /// a shared lock. Must be called within a tokio runtime.
    pub fn open(config: &DaemonConfig, data_dir: &Path) -> Result<Self, StoreError> {
        let capacity = config.notifier.queue_capacity;
        let debounce = config.reconcile.debounce();

        let works = Arc::new(DurableStore::<Work>::open(data_dir)?);
        let roles = Arc::new(DurableStore::<AgentRole>::open(data_dir)?);
        let commands = Arc::new(DurableStore::<SavedCommand>::open(data_dir)?);
        let sessions = Arc::new(DurableStore::<SessionRecord>::open(data_dir)?);
        let settings = Arc::new(DurableStore::<SettingsRecord>::open(data_dir)?);

        let reconcilers: Vec<Arc<dyn IndexReconciler>> = vec![
            Arc::new(Reconciler::new(works.clone(), debounce)),
            Arc::new(Reconciler::new(roles.clone(), debounce)),
            Arc::new(Reconciler::new(commands.clone(), debounce)),
            Arc::new(Reconciler::new(sessions.clone(), debounce)),
            Arc::new(Reconciler::new(settings.clone(), debounce)),
        ];

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            config: config.clone(),
            work_notifier: ChangeNotifier::attach(works.clone(), capacity),
            role_notifier: ChangeNotifier::attach(roles.clone(), capacity),
            command_notifier: ChangeNotifier::attach(commands.clone(), capacity),
            works: Arc::new(WorkStore::from_store(works)),
            roles,
            commands,
            sessions: Arc::new(FileSessionStore::from_store(sessions)),
            settings: Arc::new(FileSettingsStore::from_store(settings)),
            reconcilers,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Start every reconciler. On failure the ones already started are
    /// stopped again.
    pub async fn start_watching(&self) -> Result<(), WatchError> {
        for (started, reconciler) in self.reconcilers.iter().enumerate() {
            if let Err(error) = reconciler.start().await {
                warn!(entity = reconciler.entity(), %error, "failed to start reconciler");
                for previous in &self.reconcilers[..started] {
                    previous.stop().await;
                }
                return Err(error);
            }
        }
        Ok(())
    }

    /// Stop every reconciler. Safe to call more than once.
    pub async fn shutdown(&self) {
        for reconciler in &self.reconcilers {
            reconciler.stop().await;
        }
    }

    /// Build the autorun controller over these stores and wire it to work
    /// and settings changes and to `process_events`.
    pub fn attach_autorun(
        &self,
        chat: Arc<dyn ChatClient>,
        process_events: broadcast::Receiver<ProcessEvent>,
    ) -> AutorunHandle {
        let controller = Arc::new(
            AutorunController::new(
                self.works.clone(),
                self.roles.clone(),
                self.settings.clone(),
                self.sessions.clone(),
                chat,
            )
            .with_continue_message(self.config.autorun.continue_message.clone()),
        );
        controller.watch_work();
        controller.watch_settings(self.settings.durable());
        let processes = controller.watch_processes(process_events);

        // Autorun may already be on with open work waiting.
        let initial = controller.clone();
        tokio::spawn(
            async move {
                if let Err(error) = initial.start_next_open_work().await {
                    warn!(%error, "initial autorun pass failed");
                }
            }
            .instrument(info_span!("autorun", trigger = "startup")),
        );

        AutorunHandle { controller, processes }
    }
}

pub struct AutorunHandle {
    pub controller: Arc<AutorunController>,
    processes: JoinHandle<()>,
}

impl Drop for AutorunHandle {
    fn drop(&mut self) {
        self.processes.abort();
    }
}

/// Run the daemon against `data_dir` until Ctrl-C.
pub async fn run_standalone(config: DaemonConfig, data_dir: PathBuf) -> Result<()> {
    let services = Services::open(&config, &data_dir)
        .with_context(|| format!("failed to open stores in `{}`", data_dir.display()))?;
    services.start_watching().await.context("failed to watch data directory")?;

    let (work_sub, works) = services.work_notifier.subscribe(Arc::new(LogSink));
    let (_process_tx, process_rx) = broadcast::channel(PROCESS_EVENT_CAPACITY);
    let _autorun = services.attach_autorun(Arc::new(LogChat), process_rx);

    info!(data_dir = %data_dir.display(), works = works.len(), "daemon started");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;

    info!("shutting down");
    services.work_notifier.unsubscribe(&work_sub);
    services.shutdown().await;
    Ok(())
}
