// Kickoff message for a work item.

use std::fmt::Write as _;

use workloop_common::types::Work;

pub const DEFAULT_CONTINUE_MESSAGE: &str = "continue";

/// First message sent to a fresh session: the work title, its parent's
/// title when there is one, the body, and how to finish.
pub fn kickoff_message(work: &Work, parent_title: Option<&str>) -> String {
    let mut message = format!("# {} ({})\n", work.title, work.work_type.as_str());
    if let Some(parent) = parent_title {
        let _ = writeln!(message, "\nPart of: {parent}");
    }
    let body = work.body.trim();
    if !body.is_empty() {
        let _ = writeln!(message, "\n{body}");
    }
    let _ = writeln!(
        message,
        "\nWhen the work is complete, mark work item `{id}` as done (`workloop work done {id}`).",
        id = work.id
    );
    message
}
