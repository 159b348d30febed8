//! Subversion subrepos driven through the `svn` binary.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use super::parser::{
    is_checkout_confirmation, last_line, parse_committed_revision, parse_file_list,
    parse_proplist, parse_wc_revisions, parse_wc_status, WcChanges, WcRevisions,
};
use crate::errors::BackendError;
use crate::exec::{CommandOutput, Invocation};
use crate::models::{FileFlags, SubrepoKind, SubrepoPointer, SubrepoStatus};
use crate::source::{abs_source, ParentRef};
use crate::subrepo::{update_prompt, Collaborators};

/// An svn working copy bound to one pointer of its parent.
pub struct SvnSubrepo<'a> {
    path: String,
    pointer: SubrepoPointer,
    parent: ParentRef,
    collab: Collaborators<'a>,
}

impl<'a> SvnSubrepo<'a> {
    pub(crate) fn new(
        parent: ParentRef,
        path: &str,
        pointer: SubrepoPointer,
        collab: Collaborators<'a>,
    ) -> Self {
        Self {
            path: path.to_string(),
            pointer,
            parent,
            collab,
        }
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

    fn wc_path(&self, filename: &str) -> PathBuf {
        let root = self.parent.join(&self.path);
        if filename.is_empty() {
            root
        } else {
            root.join(filename)
        }
    }

    /// Run `svn <args> --non-interactive <wc path>/<filename>` with
    /// untranslated messages.
    fn svn_output(&self, args: &[&str], filename: &str) -> Result<CommandOutput, BackendError> {
        let inv = Invocation::new("svn")
            .args(args.iter().copied())
            .arg("--non-interactive")
            .arg(self.wc_path(filename).to_string_lossy())
            .env("LC_MESSAGES", "C");
        self.collab
            .diag
            .debug(&format!("{}: {inv}\n", self.relpath()));

        let output = self.collab.exec.run(&inv).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                BackendError::BinaryNotFound("svn".into())
            } else {
                BackendError::Io(e)
            }
        })?;
        if !output.success() {
            let stderr = output.stderr.trim().to_string();
            warn!(status = output.status, %stderr, "svn command failed");
            return Err(BackendError::CommandFailed {
                kind: SubrepoKind::Svn,
                args: args.iter().map(|a| a.to_string()).collect(),
                status: output.status,
                stderr,
            });
        }
        Ok(output)
    }

    fn svn(&self, args: &[&str], filename: &str) -> Result<String, BackendError> {
        Ok(self.svn_output(args, filename)?.stdout_str())
    }

    fn wc_revisions(&self) -> Result<WcRevisions, BackendError> {
        Ok(parse_wc_revisions(&self.svn(&["info", "--xml"], "")?))
    }

    /// Last committed revision of the working copy.
    fn wc_revision(&self) -> Result<String, BackendError> {
        Ok(self.wc_revisions()?.last_changed)
    }

    fn wc_changes(&self) -> Result<WcChanges, BackendError> {
        Ok(parse_wc_status(&self.svn(&["status", "--xml"], "")?))
    }

    pub fn dirty(&self, ignore_update: bool) -> Result<bool, BackendError> {
        if !self.wc_changes()?.changed
            && (ignore_update || self.wc_revisions()?.contains(&self.pointer.revision))
        {
            return Ok(false);
        }
        Ok(true)
    }

    /// Commit local changes. Author and date are decided by the server.
    #[instrument(skip(self, message), fields(path = %self.path))]
    pub fn commit(&self, message: &str) -> Result<String, BackendError> {
        let changes = self.wc_changes()?;
        if !changes.changed {
            return self.wc_revision();
        }
        if changes.externals_changed {
            return Err(BackendError::ExternalsNotCommittable(self.relpath()));
        }
        let commit_info = self.svn(&["commit", "-m", message], "")?;
        self.collab.diag.status(&commit_info);
        let revision = parse_committed_revision(&commit_info).ok_or_else(|| {
            BackendError::UnexpectedOutput {
                kind: SubrepoKind::Svn,
                detail: last_line(&commit_info),
            }
        })?;
        self.collab
            .diag
            .status(&self.svn(&["update", "-r", &revision], "")?);
        info!(revision = %revision, "svn commit succeeded");
        Ok(revision)
    }

    /// Delete the working copy unless it has changes.
    pub fn remove(&self) -> Result<(), BackendError> {
        if self.dirty(false)? {
            self.collab.diag.warn(&format!(
                "not removing repo {} because it has changes.\n",
                self.path
            ));
            return Ok(());
        }
        self.collab
            .diag
            .note(&format!("removing subrepo {}\n", self.path));
        let wc = self.wc_path("");
        remove_tree(&wc)?;
        prune_empty_parents(&wc, &self.parent.root);
        Ok(())
    }

    #[instrument(skip(self), fields(path = %self.path))]
    pub fn get(&self, target: &SubrepoPointer, overwrite: bool) -> Result<(), BackendError> {
        if overwrite && self.wc_path(".svn").exists() {
            self.svn(&["revert", "--recursive"], "")?;
        }
        let source = abs_source(&self.parent, &target.source, false)
            .unwrap_or_else(|| target.source.clone());
        let status = self.svn(&["checkout", &source, "--revision", &target.revision], "")?;
        if !is_checkout_confirmation(&status) {
            return Err(BackendError::UnexpectedOutput {
                kind: SubrepoKind::Svn,
                detail: last_line(&status),
            });
        }
        self.collab.diag.status(&status);
        Ok(())
    }

    pub fn merge(&self, target: &SubrepoPointer) -> Result<(), BackendError> {
        let current = self.wc_revision()?;
        if target.revision == current {
            return Ok(());
        }
        let dirty = self.pointer.revision == current || self.wc_changes()?.changed;
        match update_prompt(self.collab.prompt, &self.relpath(), dirty, &current, &target.revision) {
            None => Err(BackendError::MergeAborted {
                path: self.relpath(),
            }),
            Some(1) => self.get(target, false),
            Some(_) => Ok(()),
        }
    }

    pub fn push(&self, _force: bool) -> Result<bool, BackendError> {
        debug!(path = %self.path, "push is a no-op for svn");
        Ok(true)
    }

    pub fn files(&self) -> Result<Vec<String>, BackendError> {
        if self.pointer.is_null_revision() {
            return Ok(Vec::new());
        }
        let output = self.svn(&["list", "--recursive", "-r", &self.pointer.revision], "")?;
        Ok(parse_file_list(&output))
    }

    pub fn file_data(&self, name: &str) -> Result<Vec<u8>, BackendError> {
        Ok(self
            .svn_output(&["cat", "-r", &self.pointer.revision], name)?
            .stdout)
    }

    pub fn file_flags(&self, name: &str) -> Result<FileFlags, BackendError> {
        let props = parse_proplist(&self.svn(&["proplist", "-r", &self.pointer.revision], name)?);
        Ok(FileFlags {
            executable: props.iter().any(|p| p == "svn:executable"),
            symlink: props.iter().any(|p| p == "svn:special"),
        })
    }

    pub fn status(&self, _rev2: Option<&str>) -> Result<SubrepoStatus, BackendError> {
        Ok(SubrepoStatus::default())
    }

    pub fn diff(&self, rev2: Option<&str>) -> Result<String, BackendError> {
        let range = match rev2 {
            Some(rev2) => format!("{}:{}", self.pointer.revision, rev2),
            None => self.pointer.revision.clone(),
        };
        self.svn(&["diff", "-r", &range], "")
    }
}

/// Remove `path` recursively, making read-only files writable when the
/// platform refuses to unlink them.
fn remove_tree(path: &Path) -> Result<(), BackendError> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        for entry in std::fs::read_dir(path)? {
            remove_tree(&entry?.path())?;
        }
        std::fs::remove_dir(path)?;
        return Ok(());
    }
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::PermissionDenied && meta.permissions().readonly() => {
            let mut perms = meta.permissions();
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
            std::fs::set_permissions(path, perms)?;
            std::fs::remove_file(path)?;
            Ok(())
        }
        other => Ok(other?),
    }
}

/// Remove now-empty directories between `path` and `stop` (exclusive).
fn prune_empty_parents(path: &Path, stop: &Path) {
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == stop || !d.starts_with(stop) || std::fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}
