//! Native subrepos: repositories handled in-process.
//!
//! The backend only talks to the [`RepositoryAccess`] trait; the default
//! implementation in [`git2_access`] is built on `git2`.

pub mod git2_access;

use std::path::Path;

use chrono::{DateTime, FixedOffset};
use tracing::instrument;

use crate::errors::BackendError;
use crate::models::{FileFlags, SubrepoPointer, SubrepoStatus};
use crate::snapshot::Snapshot;
use crate::source::{abs_source, require_abs_source, ParentRef};
use crate::state;
use crate::subrepo::{update_prompt, Collaborators, RepoContext};

pub use git2_access::{Git2Provider, Git2Repository};

/// Pull / push locations written into a freshly created repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultPaths {
    pub pull: Option<String>,
    pub push: Option<String>,
}

/// Opens nested repositories for the native backend.
pub trait RepositoryProvider {
    /// Open the repository at `root`, creating it (and the directory) when
    /// missing. `paths` is only used for a newly created repository.
    fn open_or_create(
        &self,
        root: &Path,
        paths: &DefaultPaths,
    ) -> Result<Box<dyn RepositoryAccess>, BackendError>;
}

/// Repository operations the native backend is built from.
///
/// Revisions are hex strings; `""` is the null revision, which every
/// repository has and which is the ancestor of everything.
pub trait RepositoryAccess {
    fn root(&self) -> &Path;

    fn has_revision(&self, revision: &str) -> bool;

    /// Fetch everything from `source` without touching the working copy.
    fn pull(&self, source: &str) -> Result<(), BackendError>;

    /// Revision checked out in the working copy, `""` if none.
    fn working_parent(&self) -> Result<String, BackendError>;

    /// Changes to tracked files, staged or not. Untracked files don't count.
    fn has_uncommitted_changes(&self) -> Result<bool, BackendError>;

    /// Check out `revision`, discarding nothing unless `overwrite` is set.
    /// Fails with `DirtyWorkingCopy` when local changes are in the way.
    fn clean_update(&self, revision: &str, overwrite: bool) -> Result<(), BackendError>;

    /// Move to `revision` carrying local changes along.
    fn update(&self, revision: &str) -> Result<(), BackendError>;

    /// Merge `revision` into the working copy without committing.
    /// Returns the files left with conflicts.
    fn merge(&self, revision: &str) -> Result<Vec<String>, BackendError>;

    /// Closest common ancestor of two revisions, `""` if there is none.
    fn ancestor(&self, a: &str, b: &str) -> Result<String, BackendError>;

    /// Commit outstanding changes. `None` when there was nothing to commit.
    fn commit(
        &self,
        message: &str,
        user: Option<&str>,
        date: Option<DateTime<FixedOffset>>,
    ) -> Result<Option<String>, BackendError>;

    /// Push to `dest`; `false` when the remote refused.
    fn push(&self, dest: &str, force: bool) -> Result<bool, BackendError>;

    fn files(&self, revision: &str) -> Result<Vec<String>, BackendError>;

    fn file_data(&self, revision: &str, name: &str) -> Result<Vec<u8>, BackendError>;

    fn file_flags(&self, revision: &str, name: &str) -> Result<FileFlags, BackendError>;

    /// Read-only view of the files committed in `revision`.
    fn snapshot(&self, revision: &str) -> Result<Box<dyn Snapshot + '_>, BackendError>;

    /// Files changed between `from` and `to` (the working copy when `None`).
    fn status(&self, from: &str, to: Option<&str>) -> Result<SubrepoStatus, BackendError>;

    /// Patch text between `from` and `to` (the working copy when `None`).
    fn diff(&self, from: &str, to: Option<&str>) -> Result<String, BackendError>;
}

/// A native subrepo bound to one pointer of its parent.
pub struct NativeSubrepo<'a> {
    path: String,
    pointer: SubrepoPointer,
    parent: ParentRef,
    repo: Box<dyn RepositoryAccess>,
    collab: Collaborators<'a>,
}

impl<'a> NativeSubrepo<'a> {
    pub(crate) fn open(
        parent: ParentRef,
        path: &str,
        pointer: SubrepoPointer,
        collab: Collaborators<'a>,
    ) -> Result<Self, BackendError> {
        let paths = DefaultPaths {
            pull: abs_source(&parent, &pointer.source, false),
            push: abs_source(&parent, &pointer.source, true),
        };
        let repo = collab.repos.open_or_create(&parent.join(path), &paths)?;
        Ok(Self {
            path: path.to_string(),
            pointer,
            parent,
            repo,
            collab,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn pointer(&self) -> &SubrepoPointer {
        &self.pointer
    }

    pub fn relpath(&self) -> String {
        self.parent.relpath_of(&self.path)
    }

    pub(crate) fn collab(&self) -> Collaborators<'a> {
        self.collab
    }

    pub fn repository(&self) -> &dyn RepositoryAccess {
        self.repo.as_ref()
    }

    /// Subrepos committed in `revision` of this repository.
    pub(crate) fn children_at(&self, revision: &str) -> Result<RepoContext, BackendError> {
        let snapshot = self.repo.snapshot(revision)?;
        let state = state::resolve(snapshot.as_ref(), self.collab.rules, self.collab.diag)?;
        Ok(RepoContext::new(
            self.parent.child(&self.path, &self.pointer.source),
            state,
        ))
    }

    fn relabel(&self, err: BackendError) -> BackendError {
        match err {
            BackendError::DirtyWorkingCopy { .. } => BackendError::DirtyWorkingCopy {
                path: self.relpath(),
            },
            other => other,
        }
    }

    pub fn dirty(&self, ignore_update: bool) -> Result<bool, BackendError> {
        if !ignore_update {
            if self.pointer.is_null_revision() {
                return Ok(true);
            }
            if self.repo.working_parent()? != self.pointer.revision {
                return Ok(true);
            }
        }
        self.repo.has_uncommitted_changes()
    }

    pub fn commit(
        &self,
        message: &str,
        user: Option<&str>,
        date: Option<DateTime<FixedOffset>>,
    ) -> Result<String, BackendError> {
        self.collab
            .diag
            .debug(&format!("committing subrepo {}\n", self.relpath()));
        match self.repo.commit(message, user, date)? {
            Some(revision) => Ok(revision),
            None => self.repo.working_parent(),
        }
    }

    /// Reset to the null revision. History stays in the repository.
    pub fn remove(&self) -> Result<(), BackendError> {
        self.collab
            .diag
            .note(&format!("removing subrepo {}\n", self.relpath()));
        self.repo.clean_update("", true)
    }

    fn fetch(&self, target: &SubrepoPointer) -> Result<(), BackendError> {
        if self.repo.has_revision(&target.revision) {
            return Ok(());
        }
        let relpath = self.relpath();
        let url = require_abs_source(&self.parent, &target.source, false, &relpath)?;
        self.collab
            .diag
            .status(&format!("pulling subrepo {relpath} from {url}\n"));
        self.repo.pull(&url)?;
        if !self.repo.has_revision(&target.revision) {
            return Err(BackendError::RevisionNotFound {
                path: relpath,
                revision: target.revision.clone(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(path = %self.path))]
    pub fn get(&self, target: &SubrepoPointer, overwrite: bool) -> Result<(), BackendError> {
        self.fetch(target)?;
        self.collab
            .diag
            .debug(&format!("getting subrepo {}\n", self.path));
        self.repo
            .clean_update(&target.revision, overwrite)
            .map_err(|e| self.relabel(e))
    }

    #[instrument(skip(self), fields(path = %self.path))]
    pub fn merge(&self, target: &SubrepoPointer) -> Result<(), BackendError> {
        self.fetch(target)?;
        let relpath = self.relpath();
        let cur = self.repo.working_parent()?;
        let dst = target.revision.as_str();
        let anc = self.repo.ancestor(&cur, dst)?;

        let merge = || -> Result<(), BackendError> {
            if anc == cur {
                self.collab
                    .diag
                    .debug(&format!("updating subrepo {relpath}\n"));
                self.repo.update(dst)
            } else if anc == dst {
                self.collab
                    .diag
                    .debug(&format!("skipping subrepo {relpath}\n"));
                Ok(())
            } else {
                self.collab
                    .diag
                    .debug(&format!("merging subrepo {relpath}\n"));
                for file in self.repo.merge(dst)? {
                    self.collab
                        .diag
                        .warn(&format!("warning: conflicts while merging {relpath}/{file}\n"));
                }
                Ok(())
            }
        };

        if self.dirty(false)? && anc != dst {
            let changed = self.repo.has_uncommitted_changes()?;
            match update_prompt(self.collab.prompt, &relpath, changed, &cur, dst) {
                None => return Err(BackendError::MergeAborted { path: relpath.clone() }),
                Some(1) => merge()?,
                Some(_) => {}
            }
            return Ok(());
        }
        merge()
    }

    /// Push nested subrepos depth-first, then this repository.
    #[instrument(skip(self), fields(path = %self.path))]
    pub fn push(&self, force: bool) -> Result<bool, BackendError> {
        let working = self.repo.working_parent()?;
        let children = self.children_at(&working)?;
        for path in children.state.keys() {
            if !children.sub(path, self.collab)?.push(force)? {
                return Ok(false);
            }
        }

        let relpath = self.relpath();
        let dest = require_abs_source(&self.parent, &self.pointer.source, true, &relpath)?;
        self.collab
            .diag
            .status(&format!("pushing subrepo {relpath} to {dest}\n"));
        self.repo.push(&dest, force)
    }

    pub fn files(&self) -> Result<Vec<String>, BackendError> {
        self.repo.files(&self.pointer.revision)
    }

    pub fn file_data(&self, name: &str) -> Result<Vec<u8>, BackendError> {
        self.repo.file_data(&self.pointer.revision, name)
    }

    pub fn file_flags(&self, name: &str) -> Result<FileFlags, BackendError> {
        self.repo.file_flags(&self.pointer.revision, name)
    }

    pub fn status(&self, rev2: Option<&str>) -> Result<SubrepoStatus, BackendError> {
        match self.repo.status(&self.pointer.revision, rev2) {
            Ok(status) => Ok(status),
            Err(BackendError::Git2(e)) => {
                self.lookup_warning(&e);
                Ok(SubrepoStatus::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn diff(&self, rev2: Option<&str>) -> Result<String, BackendError> {
        match self.repo.diff(&self.pointer.revision, rev2) {
            Ok(patch) => Ok(patch),
            Err(BackendError::Git2(e)) => {
                self.lookup_warning(&e);
                Ok(String::new())
            }
            Err(e) => Err(e),
        }
    }

    fn lookup_warning(&self, err: &git2::Error) {
        self.collab.diag.warn(&format!(
            "warning: error \"{}\" in subrepository \"{}\"\n",
            err.message(),
            self.relpath()
        ));
    }
}
