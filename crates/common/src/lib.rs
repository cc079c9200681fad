// workloop-common: records, events and errors shared by the daemon and CLI.

pub mod error;
pub mod event;
pub mod protocol;
pub mod record;
pub mod types;
