// `workloop autorun`: toggle automatic work pickup.
//
// The setting lives in the data directory; a running daemon notices the
// change and starts the next open work item when autorun turns on.

use anyhow::Context as _;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use tracing::info;
use workloop_common::types::WorkStatus;
use workloop_daemon::store::{FileSettingsStore, WorkStore};

use super::Context;
use crate::output;

#[derive(Debug, Subcommand)]
pub enum AutorunCommand {
    /// Enable autorun
    On,
    /// Disable autorun (work already in progress keeps running)
    Off,
    /// Show whether autorun is enabled
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutorunStatus {
    pub autorun: bool,
    pub open_work: usize,
    pub in_progress: usize,
}

pub fn run(ctx: &Context, cmd: AutorunCommand) -> anyhow::Result<()> {
    let settings =
        FileSettingsStore::open(&ctx.data_dir).context("failed to open settings store")?;
    let works = WorkStore::open(&ctx.data_dir).context("failed to open work store")?;

    match cmd {
        AutorunCommand::On => {
            settings.set_autorun(true).context("failed to enable autorun")?;
            info!("autorun enabled");
        }
        AutorunCommand::Off => {
            settings.set_autorun(false).context("failed to disable autorun")?;
            info!("autorun disabled");
        }
        AutorunCommand::Status => {}
    }

    let result = status(&settings, &works);
    if result.autorun && result.open_work == 0 && result.in_progress == 0 {
        output::print_warning(ctx.format, "NO_OPEN_WORK", "autorun is on but no work is queued");
    }
    output::print_output(ctx.format, &result, format_human)?;
    Ok(())
}

pub fn status(settings: &FileSettingsStore, works: &WorkStore) -> AutorunStatus {
    let items = works.list();
    let count = |status: WorkStatus| items.iter().filter(|w| w.status == status).count();
    AutorunStatus {
        autorun: settings.current().autorun,
        open_work: count(WorkStatus::Open),
        in_progress: count(WorkStatus::InProgress),
    }
}

fn format_human(result: &AutorunStatus) -> String {
    let state = if result.autorun { "on" } else { "off" };
    format!(
        "autorun: {state} ({} open, {} in progress)",
        result.open_work, result.in_progress
    )
}
