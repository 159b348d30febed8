//! Subrepo handles: one pointer of one parent snapshot bound to the backend
//! that knows how to operate on it.

use chrono::{DateTime, FixedOffset};
use tracing::debug;

use crate::archive::ArchiveSink;
use crate::errors::BackendError;
use crate::exec::CommandExecutor;
use crate::git::GitSubrepo;
use crate::models::{FileFlags, SubrepoKind, SubrepoPointer, SubrepoState, SubrepoStatus};
use crate::native::{NativeSubrepo, RepositoryProvider};
use crate::source::{audit_path, ParentRef};
use crate::state::RemapRule;
use crate::svn::SvnSubrepo;
use crate::ui::{Diagnostics, Prompt};

/// Everything a backend needs from the outside world, passed explicitly.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub exec: &'a dyn CommandExecutor,
    pub repos: &'a dyn RepositoryProvider,
    pub prompt: &'a dyn Prompt,
    pub diag: &'a dyn Diagnostics,
    /// Remap rules applied when resolving nested state.
    pub rules: &'a [RemapRule],
}

/// The subrepo state of one parent snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoContext {
    pub parent: ParentRef,
    pub state: SubrepoState,
}

impl RepoContext {
    pub fn new(parent: ParentRef, state: SubrepoState) -> Self {
        Self { parent, state }
    }

    pub fn sub<'a>(&self, path: &str, collab: Collaborators<'a>) -> Result<Subrepo<'a>, BackendError> {
        bind(self, path, collab)
    }
}

/// Bind `path` of `ctx` to its backend. Paths missing from the state get
/// the null pointer.
pub fn bind<'a>(
    ctx: &RepoContext,
    path: &str,
    collab: Collaborators<'a>,
) -> Result<Subrepo<'a>, BackendError> {
    audit_path(path)?;
    let pointer = ctx
        .state
        .get(path)
        .cloned()
        .unwrap_or_else(SubrepoPointer::null);
    let parent = ctx.parent.clone();
    debug!(path, kind = %pointer.kind, revision = %pointer.revision, "binding subrepo");
    Ok(match pointer.kind()? {
        SubrepoKind::Native => Subrepo::Native(NativeSubrepo::open(parent, path, pointer, collab)?),
        SubrepoKind::Svn => Subrepo::Svn(SvnSubrepo::new(parent, path, pointer, collab)),
        SubrepoKind::Git => Subrepo::Git(GitSubrepo::new(parent, path, pointer, collab)),
    })
}

/// A subrepo of any supported kind.
pub enum Subrepo<'a> {
    Native(NativeSubrepo<'a>),
    Svn(SvnSubrepo<'a>),
    Git(GitSubrepo<'a>),
}

macro_rules! dispatch {
    ($self:ident, $sub:ident => $call:expr) => {
        match $self {
            Subrepo::Native($sub) => $call,
            Subrepo::Svn($sub) => $call,
            Subrepo::Git($sub) => $call,
        }
    };
}

impl<'a> Subrepo<'a> {
    pub fn kind(&self) -> SubrepoKind {
        match self {
            Self::Native(_) => SubrepoKind::Native,
            Self::Svn(_) => SubrepoKind::Svn,
            Self::Git(_) => SubrepoKind::Git,
        }
    }

    pub fn path(&self) -> &str {
        dispatch!(self, s => s.path())
    }

    /// Path as seen from the outermost repository.
    pub fn relpath(&self) -> String {
        dispatch!(self, s => s.relpath())
    }

    pub fn pointer(&self) -> &SubrepoPointer {
        dispatch!(self, s => s.pointer())
    }

    fn collab(&self) -> Collaborators<'a> {
        dispatch!(self, s => s.collab())
    }

    /// True when the working copy has uncommitted changes or, unless
    /// `ignore_update`, is not at the recorded revision.
    pub fn dirty(&self, ignore_update: bool) -> Result<bool, BackendError> {
        dispatch!(self, s => s.dirty(ignore_update))
    }

    /// Commit local changes and return the new revision. The svn server
    /// decides author and date itself.
    pub fn commit(
        &self,
        message: &str,
        user: Option<&str>,
        date: Option<DateTime<FixedOffset>>,
    ) -> Result<String, BackendError> {
        match self {
            Self::Native(s) => s.commit(message, user, date),
            Self::Svn(s) => s.commit(message),
            Self::Git(s) => s.commit(message, user, date),
        }
    }

    pub fn remove(&self) -> Result<(), BackendError> {
        dispatch!(self, s => s.remove())
    }

    pub fn get(&self, target: &SubrepoPointer, overwrite: bool) -> Result<(), BackendError> {
        dispatch!(self, s => s.get(target, overwrite))
    }

    pub fn merge(&self, target: &SubrepoPointer) -> Result<(), BackendError> {
        dispatch!(self, s => s.merge(target))
    }

    pub fn push(&self, force: bool) -> Result<bool, BackendError> {
        dispatch!(self, s => s.push(force))
    }

    pub fn files(&self) -> Result<Vec<String>, BackendError> {
        dispatch!(self, s => s.files())
    }

    pub fn file_data(&self, name: &str) -> Result<Vec<u8>, BackendError> {
        dispatch!(self, s => s.file_data(name))
    }

    pub fn file_flags(&self, name: &str) -> Result<FileFlags, BackendError> {
        dispatch!(self, s => s.file_flags(name))
    }

    pub fn status(&self, rev2: Option<&str>) -> Result<SubrepoStatus, BackendError> {
        dispatch!(self, s => s.status(rev2))
    }

    pub fn diff(&self, rev2: Option<&str>) -> Result<String, BackendError> {
        dispatch!(self, s => s.diff(rev2))
    }

    /// Write every file at the recorded revision to `sink` below
    /// `prefix/<path>`. Native subrepos continue into their own children.
    /// Returns the number of files written.
    pub fn archive(&self, sink: &mut dyn ArchiveSink, prefix: &str) -> Result<usize, BackendError> {
        let diag = self.collab().diag;
        let topic = format!("archiving ({})", self.relpath());
        let base = join_prefix(prefix, self.path());

        let files = self.files()?;
        let total = files.len();
        diag.progress(&topic, Some(0), Some(total));
        for (i, name) in files.iter().enumerate() {
            let flags = self.file_flags(name)?;
            let data = self.file_data(name)?;
            sink.add_file(&format!("{base}/{name}"), flags.mode(), flags.symlink, &data)?;
            diag.progress(&topic, Some(i + 1), Some(total));
        }
        diag.progress(&topic, None, None);

        let mut written = total;
        if let Self::Native(native) = self {
            let revision = &native.pointer().revision;
            if !native.pointer().is_null_revision() {
                let children = native.children_at(revision)?;
                for path in children.state.keys() {
                    written += children.sub(path, self.collab())?.archive(sink, &base)?;
                }
            }
        }
        Ok(written)
    }
}

fn join_prefix(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), path)
    }
}

/// Ask whether to keep the local or take the remote revision of a subrepo
/// whose sources differ. `Some(1)` means remote.
pub(crate) fn update_prompt(
    prompt: &dyn Prompt,
    relpath: &str,
    dirty: bool,
    local: &str,
    remote: &str,
) -> Option<usize> {
    let message = if dirty {
        format!(
            " subrepository sources for {relpath} differ\n\
             use (l)ocal source ({local}) or (r)emote source ({remote})?\n"
        )
    } else {
        format!(
            " subrepository sources for {relpath} differ (in checked out version)\n\
             use (l)ocal source ({local}) or (r)emote source ({remote})?\n"
        )
    };
    prompt.choose(&message, ["&Local", "&Remote"], 0)
}
