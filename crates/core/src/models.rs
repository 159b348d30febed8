//! Domain model types used throughout subsync.
//!
//! A [`SubrepoState`] maps each subrepo path to the [`SubrepoPointer`]
//! recorded for it in one snapshot of the parent repository.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::BackendError;

/// Suffix appended to a revision when the subrepo has uncommitted changes.
/// Only ever used in memory; never written to the state file.
pub const DIRTY_MARKER: char = '+';

/// Kind recorded for paths that do not declare one.
pub const DEFAULT_KIND: &str = "native";

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// The backend responsible for a subrepo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubrepoKind {
    /// In-process repository operations (git2).
    Native,
    /// Subversion working copy driven through the `svn` binary.
    Svn,
    /// Git clone driven through the `git` binary.
    Git,
}

impl SubrepoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Svn => "svn",
            Self::Git => "git",
        }
    }
}

impl fmt::Display for SubrepoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubrepoKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(Self::Native),
            "svn" => Ok(Self::Svn),
            "git" => Ok(Self::Git),
            other => Err(BackendError::UnknownKind(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Pointer / state
// ---------------------------------------------------------------------------

/// Declared source, recorded revision and kind of one subrepo.
///
/// `kind` is kept as the raw declared string; it is only validated when an
/// adapter is bound for the path (see [`SubrepoPointer::kind`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubrepoPointer {
    pub source: String,
    pub revision: String,
    pub kind: String,
}

impl SubrepoPointer {
    pub fn new(
        source: impl Into<String>,
        revision: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            revision: revision.into(),
            kind: kind.into(),
        }
    }

    /// The pointer used for paths with no prior record.
    pub fn null() -> Self {
        Self::new("", "", DEFAULT_KIND)
    }

    /// True if no revision has ever been recorded.
    pub fn is_null_revision(&self) -> bool {
        self.revision.is_empty()
    }

    /// A copy of this pointer with the dirty marker appended to the revision.
    pub fn with_dirty_marker(&self) -> Self {
        let mut marked = self.clone();
        marked.revision.push(DIRTY_MARKER);
        marked
    }

    /// The revision without any dirty marker.
    pub fn clean_revision(&self) -> &str {
        self.revision
            .strip_suffix(DIRTY_MARKER)
            .unwrap_or(&self.revision)
    }

    /// Parse the declared kind.
    pub fn kind(&self) -> Result<SubrepoKind, BackendError> {
        self.kind.parse()
    }
}

impl fmt::Display for SubrepoPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source, self.revision, self.kind)
    }
}

/// All subrepo pointers of one parent snapshot, ordered by path.
pub type SubrepoState = BTreeMap<String, SubrepoPointer>;

// ---------------------------------------------------------------------------
// File content
// ---------------------------------------------------------------------------

/// Flags of a file stored in a subrepo revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFlags {
    pub executable: bool,
    pub symlink: bool,
}

impl FileFlags {
    /// Interpret a git tree entry mode (`100755`, `120000`, ...).
    pub fn from_git_mode(mode: u32) -> Self {
        Self {
            executable: mode & 0o170000 == 0o100000 && mode & 0o111 != 0,
            symlink: mode & 0o170000 == 0o120000,
        }
    }

    /// Permission bits to use when materializing the file.
    pub fn mode(&self) -> u32 {
        if self.executable {
            0o755
        } else {
            0o644
        }
    }
}

impl fmt::Display for FileFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.symlink {
            f.write_str("l")
        } else if self.executable {
            f.write_str("x")
        } else {
            Ok(())
        }
    }
}

/// Files that differ between two revisions of a subrepo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubrepoStatus {
    pub modified: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl SubrepoStatus {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }
}
