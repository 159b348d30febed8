//! Three-way reconciliation of subrepo state.
//!
//! Given the local, remote and ancestor pointer mappings of a parent merge,
//! [`reconcile`] decides per path whether to keep, fetch, merge or remove the
//! subrepo, drives those side effects through a [`WorkingCopy`], and returns
//! the mapping to record. Any backend failure aborts the whole run.

use tracing::{debug, info};

use crate::errors::{BackendError, ReconcileError};
use crate::models::{SubrepoPointer, SubrepoState};
use crate::ui::{Diagnostics, Prompt};

/// The subrepo side effects available while reconciling one parent.
pub trait WorkingCopy {
    fn is_dirty(&mut self, path: &str) -> Result<bool, BackendError>;

    fn get(&mut self, path: &str, target: &SubrepoPointer, overwrite: bool) -> Result<(), BackendError>;

    fn merge(&mut self, path: &str, target: &SubrepoPointer) -> Result<(), BackendError>;

    fn remove(&mut self, path: &str) -> Result<(), BackendError>;
}

const CHANGED_OR_DELETE: [&str; 2] = ["&Changed", "&Delete"];
const LOCAL_OR_REMOTE: [&str; 2] = ["&Local", "&Remote"];

struct Engine<'w, 'u, W: WorkingCopy> {
    wc: &'w mut W,
    prompt: &'u dyn Prompt,
    diag: &'u dyn Diagnostics,
}

impl<W: WorkingCopy> Engine<'_, '_, W> {
    fn note(&self, path: &str, what: &str, target: Option<&SubrepoPointer>) {
        debug!(path, what, target = ?target.map(ToString::to_string), "subrepo decision");
        match target {
            Some(r) => self.diag.debug(&format!("  subrepo {path}: {what} {r}\n")),
            None => self.diag.debug(&format!("  subrepo {path}: {what}\n")),
        }
    }

    fn ask(&self, path: &str, message: &str, choices: [&str; 2]) -> Result<usize, ReconcileError> {
        self.prompt.choose(message, choices, 0).ok_or_else(|| {
            ReconcileError::at(
                path,
                BackendError::MergeAborted {
                    path: path.to_string(),
                },
            )
        })
    }

    fn get(&mut self, path: &str, target: &SubrepoPointer, overwrite: bool) -> Result<(), ReconcileError> {
        self.wc
            .get(path, target, overwrite)
            .map_err(|e| ReconcileError::at(path, e))
    }

    fn remove(&mut self, path: &str) -> Result<(), ReconcileError> {
        self.wc.remove(path).map_err(|e| ReconcileError::at(path, e))
    }

    /// Decide a path that exists locally. Returns the pointer to record.
    fn local_path(
        &mut self,
        path: &str,
        l: &SubrepoPointer,
        remote: Option<&SubrepoPointer>,
        ancestor: Option<&SubrepoPointer>,
        overwrite_local: bool,
    ) -> Result<Option<SubrepoPointer>, ReconcileError> {
        let ld = if self.wc.is_dirty(path).map_err(|e| ReconcileError::at(path, e))? {
            l.with_dirty_marker()
        } else {
            l.clone()
        };
        let a = if overwrite_local {
            ld.clone()
        } else {
            ancestor.cloned().unwrap_or_else(SubrepoPointer::null)
        };

        if let Some(r) = remote {
            if ld == *r || *r == a {
                return Ok(Some(l.clone()));
            }
            if ld == a {
                self.note(path, "other changed, get", Some(r));
                self.get(path, r, true)?;
                return Ok(Some(r.clone()));
            }
            if ld.source != r.source {
                let message = format!(
                    " subrepository sources for {path} differ\n\
                     use (l)ocal source ({}) or (r)emote source ({})?",
                    l.source, r.source
                );
                if self.ask(path, &message, LOCAL_OR_REMOTE)? == 1 {
                    self.note(path, "prompt changed, get", Some(r));
                    self.get(path, r, true)?;
                    return Ok(Some(r.clone()));
                }
                self.note(path, "prompt keep local", None);
                return Ok(Some(l.clone()));
            }
            if l.revision == a.revision {
                self.note(path, "other side changed, get", Some(r));
                self.get(path, r, true)?;
                return Ok(Some(r.clone()));
            }
            self.note(path, "both sides changed, merge with", Some(r));
            self.wc.merge(path, r).map_err(|e| ReconcileError::at(path, e))?;
            // recorded at the pre-merge revision until the parent commits
            return Ok(Some(l.clone()));
        }

        if ld == a {
            self.note(path, "remote removed, remove", None);
            self.remove(path)?;
            return Ok(None);
        }
        let message = format!(
            " local changed subrepository {path} which remote removed\n\
             use (c)hanged version or (d)elete?"
        );
        if self.ask(path, &message, CHANGED_OR_DELETE)? == 1 {
            self.note(path, "prompt remove", None);
            self.remove(path)?;
            return Ok(None);
        }
        self.note(path, "prompt keep changed", None);
        Ok(Some(l.clone()))
    }

    /// Decide a path that exists only remotely.
    fn remote_path(
        &mut self,
        path: &str,
        r: &SubrepoPointer,
        ancestor: Option<&SubrepoPointer>,
    ) -> Result<Option<SubrepoPointer>, ReconcileError> {
        let Some(a) = ancestor else {
            self.note(path, "remote added, get", Some(r));
            self.get(path, r, false)?;
            return Ok(Some(r.clone()));
        };
        if r == a {
            return Ok(None);
        }
        let message = format!(
            " remote changed subrepository {path} which local removed\n\
             use (c)hanged version or (d)elete?"
        );
        if self.ask(path, &message, CHANGED_OR_DELETE)? == 0 {
            self.note(path, "prompt recreate", Some(r));
            self.get(path, r, false)?;
            return Ok(Some(r.clone()));
        }
        self.note(path, "prompt keep removed", None);
        Ok(None)
    }
}

/// Reconcile `local` with `remote` against their common `ancestor`.
///
/// With `overwrite_local` the local state is its own base: every local
/// path is treated as unchanged, so remote changes always win without a
/// merge. Returns the state to record; nothing is returned when any
/// backend operation fails or a prompt is declined.
pub fn reconcile(
    wc: &mut impl WorkingCopy,
    local: &SubrepoState,
    remote: &SubrepoState,
    ancestor: &SubrepoState,
    overwrite_local: bool,
    prompt: &dyn Prompt,
    diag: &dyn Diagnostics,
) -> Result<SubrepoState, ReconcileError> {
    info!(
        local = local.len(),
        remote = remote.len(),
        ancestor = ancestor.len(),
        overwrite_local,
        "reconciling subrepo state"
    );
    let mut engine = Engine { wc, prompt, diag };
    let mut merged = SubrepoState::new();

    for (path, l) in local {
        let decided = engine.local_path(path, l, remote.get(path), ancestor.get(path), overwrite_local)?;
        if let Some(pointer) = decided {
            merged.insert(path.clone(), pointer);
        }
    }
    for (path, r) in remote {
        if local.contains_key(path) {
            continue;
        }
        if let Some(pointer) = engine.remote_path(path, r, ancestor.get(path))? {
            merged.insert(path.clone(), pointer);
        }
    }
    Ok(merged)
}
