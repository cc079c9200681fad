// `workloop work`: work items.

use anyhow::Context as _;
use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};
use workloop_common::error::{StoreError, ValidationError};
use workloop_common::types::{
    AgentRole, Work, WorkDraft, WorkPatch, WorkStatus, WorkType,
};
use workloop_daemon::store::{DurableStore, WorkStore};

use super::{role, short_time, Context, UsageError};
use crate::output;

#[derive(Debug, Subcommand)]
pub enum WorkCommand {
    /// List work items in priority order
    Ls(LsArgs),
    /// Show one work item with its children
    Show(IdArg),
    /// Queue a new work item
    Add(AddArgs),
    /// Change fields of a work item
    Edit(EditArgs),
    /// Mark in-progress work as done
    Done(IdArg),
    /// Close finished work
    Close(IdArg),
    /// Delete a work item with no children
    Rm(IdArg),
}

#[derive(Debug, Args)]
pub struct LsArgs {
    /// Only items in this status (open, in_progress, done, closed).
    #[arg(long, value_parser = parse_status)]
    pub status: Option<WorkStatus>,

    /// Only children of this work item.
    #[arg(long)]
    pub parent: Option<String>,
}

#[derive(Debug, Args)]
pub struct IdArg {
    /// Work item ID.
    pub id: String,
}

#[derive(Debug, Args)]
pub struct AddArgs {
    pub title: String,

    /// story, task, or bug.
    #[arg(long = "type", value_parser = parse_type, default_value = "task")]
    pub work_type: WorkType,

    /// Parent work item ID.
    #[arg(long)]
    pub parent: Option<String>,

    /// Role ID or name.
    #[arg(long)]
    pub role: Option<String>,

    #[arg(long, default_value = "")]
    pub body: String,

    /// Lower runs first. Defaults to after everything queued.
    #[arg(long, allow_negative_numbers = true)]
    pub priority: Option<i64>,
}

#[derive(Debug, Args)]
pub struct EditArgs {
    /// Work item ID.
    pub id: String,

    #[arg(long)]
    pub title: Option<String>,

    #[arg(long)]
    pub body: Option<String>,

    #[arg(long = "type", value_parser = parse_type)]
    pub work_type: Option<WorkType>,

    /// Parent work item ID; "" clears it.
    #[arg(long)]
    pub parent: Option<String>,

    /// Role ID or name; "" clears it.
    #[arg(long)]
    pub role: Option<String>,

    #[arg(long, allow_negative_numbers = true)]
    pub priority: Option<i64>,

    /// Next status; only one forward step is allowed.
    #[arg(long, value_parser = parse_status)]
    pub status: Option<WorkStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkList {
    pub works: Vec<Work>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkDetail {
    pub work: Work,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<AgentRole>,
    #[serde(default)]
    pub children: Vec<Work>,
}

fn parse_status(value: &str) -> Result<WorkStatus, String> {
    WorkStatus::parse(value)
        .ok_or_else(|| format!("unknown status `{value}` (open, in_progress, done, closed)"))
}

fn parse_type(value: &str) -> Result<WorkType, String> {
    WorkType::parse(value).ok_or_else(|| format!("unknown type `{value}` (story, task, bug)"))
}

pub fn run(ctx: &Context, cmd: WorkCommand) -> anyhow::Result<()> {
    let works = WorkStore::open(&ctx.data_dir).context("failed to open work store")?;

    match cmd {
        WorkCommand::Ls(args) => {
            let result = list(&works, &args);
            output::print_output(ctx.format, &result, format_list)?;
        }
        WorkCommand::Show(args) => {
            let roles = open_roles(ctx)?;
            let detail = show(&works, &roles, &args.id)?;
            output::print_output(ctx.format, &detail, format_detail)?;
        }
        WorkCommand::Add(args) => {
            let roles = open_roles(ctx)?;
            let work = add(&works, &roles, args).context("failed to create work item")?;
            output::print_output(ctx.format, &work, |w| format!("queued {} {}", w.id, w.title))?;
        }
        WorkCommand::Edit(args) => {
            let roles = open_roles(ctx)?;
            let work = edit(&works, &roles, args).context("failed to edit work item")?;
            output::print_output(ctx.format, &work, format_changed)?;
        }
        WorkCommand::Done(args) => {
            let work = works.mark_done(&args.id).context("failed to mark work item done")?;
            output::print_output(ctx.format, &work, format_changed)?;
        }
        WorkCommand::Close(args) => {
            let work = works.close(&args.id).context("failed to close work item")?;
            output::print_output(ctx.format, &work, format_changed)?;
        }
        WorkCommand::Rm(args) => {
            let work = remove(&works, &args.id).context("failed to delete work item")?;
            output::print_output(ctx.format, &work, |w| format!("deleted {} {}", w.id, w.title))?;
        }
    }
    Ok(())
}

fn open_roles(ctx: &Context) -> anyhow::Result<DurableStore<AgentRole>> {
    DurableStore::open(&ctx.data_dir).context("failed to open role store")
}

pub fn list(works: &WorkStore, args: &LsArgs) -> WorkList {
    let works = works
        .list()
        .into_iter()
        .filter(|w| args.status.map_or(true, |s| w.status == s))
        .filter(|w| args.parent.as_ref().map_or(true, |p| w.parent_id.as_ref() == Some(p)))
        .collect();
    WorkList { works }
}

pub fn show(
    works: &WorkStore,
    roles: &DurableStore<AgentRole>,
    id: &str,
) -> Result<WorkDetail, StoreError> {
    let work = works.get(id).ok_or_else(|| StoreError::not_found("work", id))?;
    let role = work.role_id.as_deref().and_then(|r| roles.get(r));
    let children = works.children(id);
    Ok(WorkDetail { work, role, children })
}

pub fn add(
    works: &WorkStore,
    roles: &DurableStore<AgentRole>,
    args: AddArgs,
) -> anyhow::Result<Work> {
    let role_id = args.role.map(|key| resolve_role(roles, &key)).transpose()?;
    Ok(works.create(WorkDraft {
        work_type: args.work_type,
        parent_id: args.parent,
        title: args.title,
        body: args.body,
        role_id,
        priority: args.priority,
    })?)
}

pub fn edit(
    works: &WorkStore,
    roles: &DurableStore<AgentRole>,
    args: EditArgs,
) -> anyhow::Result<Work> {
    let role_id = match args.role {
        Some(key) if key.is_empty() => Some(key),
        Some(key) => Some(resolve_role(roles, &key)?),
        None => None,
    };
    let patch = WorkPatch {
        work_type: args.work_type,
        parent_id: args.parent,
        title: args.title,
        body: args.body,
        status: args.status,
        role_id,
        session_id: None,
        priority: args.priority,
    };
    if patch == WorkPatch::default() {
        return Err(UsageError("nothing to change; pass at least one field flag".into()).into());
    }
    Ok(works.update(&args.id, patch)?)
}

pub fn remove(works: &WorkStore, id: &str) -> anyhow::Result<Work> {
    let children = works.children(id);
    if !children.is_empty() {
        return Err(ValidationError::Invalid {
            field: "id",
            reason: format!("work `{id}` has {} child item(s); delete them first", children.len()),
        }
        .into());
    }
    Ok(works.delete(id)?)
}

fn resolve_role(roles: &DurableStore<AgentRole>, key: &str) -> Result<String, ValidationError> {
    role::find(roles, key).map(|r| r.id).ok_or_else(|| ValidationError::UnknownReference {
        field: "roleId",
        entity: "role",
        value: key.to_string(),
    })
}

fn format_row(work: &Work) -> String {
    format!(
        "{}  {:<11} {:>4}  {:<5}  {}",
        work.id,
        work.status.as_str(),
        work.priority,
        work.work_type.as_str(),
        work.title
    )
}

fn format_list(result: &WorkList) -> String {
    if result.works.is_empty() {
        return "No work items.".into();
    }
    let mut lines = vec![format!("{} work item(s)", result.works.len())];
    lines.extend(result.works.iter().map(|w| format!("  {}", format_row(w))));
    lines.join("\n")
}

fn format_detail(detail: &WorkDetail) -> String {
    let work = &detail.work;
    let mut lines = vec![
        format!("{} ({})", work.title, work.work_type.as_str()),
        format!("  id:       {}", work.id),
        format!("  status:   {}", work.status),
        format!("  priority: {}", work.priority),
    ];
    if let Some(parent) = &work.parent_id {
        lines.push(format!("  parent:   {parent}"));
    }
    match (&detail.role, &work.role_id) {
        (Some(role), _) => lines.push(format!("  role:     {} ({})", role.name, role.id)),
        (None, Some(missing)) => lines.push(format!("  role:     {missing} (missing)")),
        (None, None) => {}
    }
    if let Some(session) = &work.session_id {
        lines.push(format!("  session:  {session}"));
    }
    lines.push(format!("  updated:  {}", short_time(&work.updated_at)));
    if !work.body.is_empty() {
        lines.push(String::new());
        lines.push(work.body.clone());
    }
    if !detail.children.is_empty() {
        lines.push(String::new());
        lines.push(format!("{} child item(s)", detail.children.len()));
        lines.extend(detail.children.iter().map(|c| format!("  {}", format_row(c))));
    }
    lines.join("\n")
}

fn format_changed(work: &Work) -> String {
    format!("{} {} is now {}", work.id, work.title, work.status)
}

#[cfg(test)]
mod tests {
    use tempfile::{tempdir, TempDir};
    use workloop_common::types::AgentRoleDraft;

    use super::*;
    use crate::exit_code::ExitCode;

    struct Fixture {
        _tmp: TempDir,
        works: WorkStore,
        roles: DurableStore<AgentRole>,
    }

    fn fixture() -> Fixture {
        let tmp = tempdir().unwrap();
        let works = WorkStore::open(tmp.path()).unwrap();
        let roles = DurableStore::open(tmp.path()).unwrap();
        Fixture { _tmp: tmp, works, roles }
    }

    fn add_args(title: &str) -> AddArgs {
        AddArgs {
            title: title.into(),
            work_type: WorkType::Task,
            parent: None,
            role: None,
            body: String::new(),
            priority: None,
        }
    }

    fn edit_args(id: &str) -> EditArgs {
        EditArgs {
            id: id.into(),
            title: None,
            body: None,
            work_type: None,
            parent: None,
            role: None,
            priority: None,
            status: None,
        }
    }

    #[test]
    fn add_resolves_role_by_name() {
        let f = fixture();
        let dev = f.roles.create(AgentRoleDraft { name: "dev".into(), prompt: String::new() }).unwrap();

        let work = add(&f.works, &f.roles, AddArgs { role: Some("dev".into()), ..add_args("t") }).unwrap();
        assert_eq!(work.role_id.as_deref(), Some(dev.id.as_str()));

        let err = add(&f.works, &f.roles, AddArgs { role: Some("ghost".into()), ..add_args("t") })
            .unwrap_err();
        assert_eq!(ExitCode::from_error(&err), ExitCode::Usage);
        assert_eq!(f.works.list().len(), 1);
    }

    #[test]
    fn add_rejects_unknown_parent_and_empty_title() {
        let f = fixture();
        let err = add(&f.works, &f.roles, AddArgs { parent: Some("nope".into()), ..add_args("t") })
            .unwrap_err();
        assert_eq!(ExitCode::from_error(&err), ExitCode::Usage);

        let err = add(&f.works, &f.roles, add_args("")).unwrap_err();
        assert_eq!(ExitCode::from_error(&err), ExitCode::Usage);
        assert!(f.works.list().is_empty());
    }

    #[test]
    fn list_filters_by_status_and_parent() {
        let f = fixture();
        let story = add(&f.works, &f.roles, AddArgs { work_type: WorkType::Story, ..add_args("s") }).unwrap();
        let child = add(&f.works, &f.roles, AddArgs { parent: Some(story.id.clone()), ..add_args("c") })
            .unwrap();
        f.works.start(&child.id, "s1").unwrap();

        let all = list(&f.works, &LsArgs { status: None, parent: None });
        assert_eq!(all.works.len(), 2);

        let running = list(&f.works, &LsArgs { status: Some(WorkStatus::InProgress), parent: None });
        assert_eq!(running.works.iter().map(|w| w.id.as_str()).collect::<Vec<_>>(), vec![child.id.as_str()]);

        let children = list(&f.works, &LsArgs { status: None, parent: Some(story.id.clone()) });
        assert_eq!(children.works.len(), 1);
    }

    #[test]
    fn show_includes_role_and_children() {
        let f = fixture();
        let dev = f.roles.create(AgentRoleDraft { name: "dev".into(), prompt: String::new() }).unwrap();
        let story = add(&f.works, &f.roles, AddArgs { role: Some(dev.id.clone()), ..add_args("s") }).unwrap();
        add(&f.works, &f.roles, AddArgs { parent: Some(story.id.clone()), ..add_args("c") }).unwrap();

        let detail = show(&f.works, &f.roles, &story.id).unwrap();
        assert_eq!(detail.role.map(|r| r.name), Some("dev".to_string()));
        assert_eq!(detail.children.len(), 1);

        let err = show(&f.works, &f.roles, "missing").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn edit_needs_a_field_and_follows_transitions() {
        let f = fixture();
        let work = add(&f.works, &f.roles, add_args("t")).unwrap();

        let err = edit(&f.works, &f.roles, edit_args(&work.id)).unwrap_err();
        assert_eq!(ExitCode::from_error(&err), ExitCode::Usage);

        let err = edit(&f.works, &f.roles, EditArgs { status: Some(WorkStatus::Done), ..edit_args(&work.id) })
            .unwrap_err();
        assert_eq!(ExitCode::from_error(&err), ExitCode::InvalidTransition);

        let err = edit(&f.works, &f.roles, EditArgs { title: Some("x".into()), ..edit_args("missing") })
            .unwrap_err();
        assert_eq!(ExitCode::from_error(&err), ExitCode::NotFound);

        let edited = edit(
            &f.works,
            &f.roles,
            EditArgs { title: Some("renamed".into()), priority: Some(-1), ..edit_args(&work.id) },
        )
        .unwrap();
        assert_eq!(edited.title, "renamed");
        assert_eq!(edited.priority, -1);
    }

    #[test]
    fn edit_clears_role_with_empty_string() {
        let f = fixture();
        f.roles.create(AgentRoleDraft { name: "dev".into(), prompt: String::new() }).unwrap();
        let work = add(&f.works, &f.roles, AddArgs { role: Some("dev".into()), ..add_args("t") }).unwrap();

        let edited = edit(&f.works, &f.roles, EditArgs { role: Some(String::new()), ..edit_args(&work.id) })
            .unwrap();
        assert_eq!(edited.role_id, None);
    }

    #[test]
    fn remove_refuses_parents_with_children() {
        let f = fixture();
        let story = add(&f.works, &f.roles, add_args("s")).unwrap();
        let child = add(&f.works, &f.roles, AddArgs { parent: Some(story.id.clone()), ..add_args("c") })
            .unwrap();

        let err = remove(&f.works, &story.id).unwrap_err();
        assert_eq!(ExitCode::from_error(&err), ExitCode::Usage);

        remove(&f.works, &child.id).unwrap();
        remove(&f.works, &story.id).unwrap();
        assert!(f.works.list().is_empty());

        let err = remove(&f.works, &story.id).unwrap_err();
        assert_eq!(ExitCode::from_error(&err), ExitCode::NotFound);
    }

    #[test]
    fn human_formats() {
        let f = fixture();
        assert_eq!(format_list(&WorkList { works: vec![] }), "No work items.");

        let story = add(
            &f.works,
            &f.roles,
            AddArgs { work_type: WorkType::Story, body: "Details.".into(), ..add_args("Auth") },
        )
        .unwrap();
        add(&f.works, &f.roles, AddArgs { parent: Some(story.id.clone()), ..add_args("Keys") }).unwrap();

        let listing = format_list(&list(&f.works, &LsArgs { status: None, parent: None }));
        assert!(listing.starts_with("2 work item(s)"));
        assert!(listing.contains("open"));
        assert!(listing.contains("story"));

        let detail = format_detail(&show(&f.works, &f.roles, &story.id).unwrap());
        assert!(detail.starts_with("Auth (story)"));
        assert!(detail.contains("Details."));
        assert!(detail.contains("1 child item(s)"));
        assert!(detail.contains("Keys"));
    }

    #[test]
    fn value_parsers_accept_wire_names() {
        assert_eq!(parse_status("in_progress"), Ok(WorkStatus::InProgress));
        assert!(parse_status("doing").is_err());
        assert_eq!(parse_type("bug"), Ok(WorkType::Bug));
        assert!(parse_type("epic").unwrap_err().contains("story, task, bug"));
    }
}
