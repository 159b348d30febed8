//! subsync core library.
//!
//! Tracks nested repositories ("subrepos") of a parent repository: resolving
//! their declared and recorded state, driving native, svn and git working
//! copies, and reconciling subrepo state when the parent merges.

pub mod archive;
pub mod config;
pub mod errors;
pub mod exec;
pub mod git;
pub mod models;
pub mod native;
pub mod propagate;
pub mod reconcile;
pub mod snapshot;
pub mod source;
pub mod state;
pub mod subrepo;
pub mod svn;
pub mod ui;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience.
pub use config::SubsyncConfig;
pub use errors::CoreError;
pub use models::{SubrepoKind, SubrepoPointer, SubrepoState};
pub use reconcile::{reconcile, WorkingCopy};
pub use subrepo::{Collaborators, RepoContext, Subrepo};
