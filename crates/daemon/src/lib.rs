// workloop-daemon library entry point (shared by workloopd and the CLI).

pub mod autorun;
pub mod collab;
pub mod config;
pub mod fanout;
pub mod fs_perms;
pub mod runtime;
pub mod sessions;
pub mod store;
pub mod watcher;
