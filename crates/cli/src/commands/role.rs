// `workloop role`: agent roles (named system prompts).

use anyhow::Context as _;
use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};
use workloop_common::error::{StoreError, ValidationError};
use workloop_common::types::{AgentRole, AgentRoleDraft, AgentRolePatch};
use workloop_daemon::store::{DurableStore, WorkStore};

use super::{short_time, Context, UsageError};
use crate::output;

#[derive(Debug, Subcommand)]
pub enum RoleCommand {
    /// List roles
    Ls,
    /// Create a role
    Add(AddArgs),
    /// Rename a role or change its prompt
    Edit(EditArgs),
    /// Delete a role no unfinished work refers to
    Rm(RmArgs),
}

#[derive(Debug, Args)]
pub struct AddArgs {
    /// Role name, e.g. "reviewer".
    pub name: String,

    /// System prompt sent with every kickoff.
    #[arg(long, default_value = "")]
    pub prompt: String,
}

#[derive(Debug, Args)]
pub struct EditArgs {
    /// Role ID or name.
    pub role: String,

    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub prompt: Option<String>,
}

#[derive(Debug, Args)]
pub struct RmArgs {
    /// Role ID or name.
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleList {
    pub roles: Vec<AgentRole>,
}

pub fn run(ctx: &Context, cmd: RoleCommand) -> anyhow::Result<()> {
    let roles = DurableStore::<AgentRole>::open(&ctx.data_dir).context("failed to open role store")?;

    match cmd {
        RoleCommand::Ls => {
            let result = RoleList { roles: roles.list() };
            output::print_output(ctx.format, &result, format_list)?;
        }
        RoleCommand::Add(args) => {
            let role = add(&roles, args).context("failed to create role")?;
            output::print_output(ctx.format, &role, |r| format!("created role {} ({})", r.name, r.id))?;
        }
        RoleCommand::Edit(args) => {
            let role = edit(&roles, args).context("failed to edit role")?;
            output::print_output(ctx.format, &role, |r| format!("updated role {} ({})", r.name, r.id))?;
        }
        RoleCommand::Rm(args) => {
            let works = WorkStore::open(&ctx.data_dir).context("failed to open work store")?;
            let role = remove(&roles, &works, &args.role).context("failed to delete role")?;
            output::print_output(ctx.format, &role, |r| format!("deleted role {} ({})", r.name, r.id))?;
        }
    }
    Ok(())
}

/// Find a role by exact ID, then by exact name.
pub fn find(roles: &DurableStore<AgentRole>, key: &str) -> Option<AgentRole> {
    roles.get(key).or_else(|| roles.list().into_iter().find(|r| r.name == key))
}

pub fn add(roles: &DurableStore<AgentRole>, args: AddArgs) -> anyhow::Result<AgentRole> {
    if find(roles, &args.name).is_some() {
        return Err(ValidationError::Invalid {
            field: "name",
            reason: format!("a role named `{}` already exists", args.name),
        }
        .into());
    }
    Ok(roles.create(AgentRoleDraft { name: args.name, prompt: args.prompt })?)
}

pub fn edit(roles: &DurableStore<AgentRole>, args: EditArgs) -> anyhow::Result<AgentRole> {
    if args.name.is_none() && args.prompt.is_none() {
        return Err(UsageError("nothing to change; pass --name or --prompt".into()).into());
    }
    let role = find(roles, &args.role).ok_or_else(|| StoreError::not_found("role", &args.role))?;
    Ok(roles.update(&role.id, AgentRolePatch { name: args.name, prompt: args.prompt })?)
}

pub fn remove(
    roles: &DurableStore<AgentRole>,
    works: &WorkStore,
    key: &str,
) -> anyhow::Result<AgentRole> {
    let role = find(roles, key).ok_or_else(|| StoreError::not_found("role", key))?;
    let assigned = works
        .list()
        .into_iter()
        .filter(|w| w.role_id.as_deref() == Some(role.id.as_str()) && !w.status.is_finished())
        .count();
    if assigned > 0 {
        return Err(ValidationError::Invalid {
            field: "role",
            reason: format!("{assigned} unfinished work item(s) still use role `{}`", role.name),
        }
        .into());
    }
    Ok(roles.delete(&role.id)?)
}

fn format_list(result: &RoleList) -> String {
    if result.roles.is_empty() {
        return "No roles. Create one with: workloop role add <name> --prompt <text>".into();
    }
    let mut lines = vec![format!("{} role(s)", result.roles.len())];
    for role in &result.roles {
        let prompt = role.prompt.lines().next().unwrap_or("");
        lines.push(format!(
            "  {}  {:<16} {}  {}",
            role.id,
            role.name,
            short_time(&role.updated_at),
            prompt
        ));
    }
    lines.join("\n")
}
