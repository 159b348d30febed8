//! Error types for the subsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

use crate::models::SubrepoKind;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// State resolver errors
// ---------------------------------------------------------------------------

/// Errors from reading or writing the declared / recorded subrepo state.
#[derive(Debug, Error)]
pub enum StateError {
    /// A spec or state file line could not be parsed.
    #[error("{file}:{line}: {detail}")]
    MalformedSpec {
        file: String,
        line: usize,
        detail: String,
    },

    /// A spec file referenced by name is not part of the snapshot.
    #[error("subrepo spec file {0} not found")]
    MissingSpecFile(String),

    /// A remap rule pattern is not a valid regular expression.
    #[error("bad subrepository pattern '{pattern}': {detail}")]
    BadRemapPattern {
        pattern: String,
        detail: String,
    },

    /// Generic I/O wrapper.
    #[error("subrepo state I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Backend adapter errors
// ---------------------------------------------------------------------------

/// Errors from the native, svn and git subrepo backends.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The recorded kind is not one of the known backends.
    #[error("unknown subrepo type {0}")]
    UnknownKind(String),

    /// A subrepo path escapes the parent working directory.
    #[error("path '{0}' is not inside the repository")]
    UnsafePath(String),

    /// Uncommitted changes would be lost by the requested operation.
    #[error("uncommitted changes in subrepo {path}")]
    DirtyWorkingCopy {
        path: String,
    },

    /// An external tool exited with an unexpected status.
    #[error("{kind} {} error {status}: {stderr}", .args.join(" "))]
    CommandFailed {
        kind: SubrepoKind,
        args: Vec<String>,
        status: i32,
        stderr: String,
    },

    /// The external tool binary was not found on `$PATH`.
    #[error("{0} binary not found")]
    BinaryNotFound(String),

    /// Tool output could not be parsed.
    #[error("unexpected {kind} output: {detail}")]
    UnexpectedOutput {
        kind: SubrepoKind,
        detail: String,
    },

    /// The operator declined to choose between diverging sources.
    #[error("merge aborted in subrepo {path}")]
    MergeAborted {
        path: String,
    },

    /// The requested revision is not available locally nor from any source.
    #[error("revision {revision} does not exist in subrepo {path}")]
    RevisionNotFound {
        path: String,
        revision: String,
    },

    /// No absolute pull/push location could be derived for a subrepo.
    #[error("default path for subrepository {0} not found")]
    NoDefaultPath(String),

    /// Changes inside svn externals cannot be committed.
    #[error("cannot commit svn externals in {0}")]
    ExternalsNotCommittable(String),

    /// A `git2` library error from the native backend.
    #[error("git2 error: {0}")]
    Git2(#[from] git2::Error),

    /// Nested state could not be resolved.
    #[error(transparent)]
    State(#[from] StateError),

    /// Generic I/O wrapper.
    #[error("subrepo I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Reconciliation errors
// ---------------------------------------------------------------------------

/// Errors that abort a reconciliation. No state is recorded when one occurs.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A backend operation or prompt for one path failed.
    #[error("subrepository {path}: {source}")]
    Subrepo {
        path: String,
        #[source]
        source: BackendError,
    },

    /// Writing the merged state failed.
    #[error(transparent)]
    State(#[from] StateError),
}

impl ReconcileError {
    /// Wrap a backend failure with the path it happened on.
    pub fn at(path: &str, source: BackendError) -> Self {
        Self::Subrepo {
            path: path.to_string(),
            source,
        }
    }

    /// The path that failed, when the error is path specific.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Subrepo { path, .. } => Some(path),
            Self::State(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
