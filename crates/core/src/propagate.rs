//! Operations that walk every subrepo of a parent: recursive push, archive,
//! commit, and reconciliation of a parent merge.

use std::collections::BTreeSet;

use chrono::{DateTime, FixedOffset};
use tracing::{info, instrument};

use crate::archive::ArchiveSink;
use crate::errors::{BackendError, ReconcileError};
use crate::models::{SubrepoPointer, SubrepoState};
use crate::reconcile::{reconcile, WorkingCopy};
use crate::state::write_state;
use crate::subrepo::{Collaborators, RepoContext, Subrepo};

/// The subrepos of a parent working directory, seen by the reconciler.
///
/// Paths present in the local state bind with their local pointer; any
/// other path binds with the pointer it is being fetched at.
pub struct ParentWorkingCopy<'c, 'a> {
    local: &'c RepoContext,
    collab: Collaborators<'a>,
}

impl<'c, 'a> ParentWorkingCopy<'c, 'a> {
    pub fn new(local: &'c RepoContext, collab: Collaborators<'a>) -> Self {
        Self { local, collab }
    }

    fn bind(&self, path: &str, fallback: Option<&SubrepoPointer>) -> Result<Subrepo<'a>, BackendError> {
        if self.local.state.contains_key(path) {
            return self.local.sub(path, self.collab);
        }
        let mut state = SubrepoState::new();
        state.insert(
            path.to_string(),
            fallback.cloned().unwrap_or_else(SubrepoPointer::null),
        );
        RepoContext::new(self.local.parent.clone(), state).sub(path, self.collab)
    }
}

impl WorkingCopy for ParentWorkingCopy<'_, '_> {
    fn is_dirty(&mut self, path: &str) -> Result<bool, BackendError> {
        self.bind(path, None)?.dirty(false)
    }

    fn get(&mut self, path: &str, target: &SubrepoPointer, overwrite: bool) -> Result<(), BackendError> {
        self.bind(path, Some(target))?.get(target, overwrite)
    }

    fn merge(&mut self, path: &str, target: &SubrepoPointer) -> Result<(), BackendError> {
        self.bind(path, None)?.merge(target)
    }

    fn remove(&mut self, path: &str) -> Result<(), BackendError> {
        self.bind(path, None)?.remove()
    }
}

/// Every path declared in either context, sorted, bound to `ctx1` when it
/// declares the path and to `ctx2` otherwise.
pub fn iter_subrepos<'c, 'a: 'c>(
    ctx1: &'c RepoContext,
    ctx2: &'c RepoContext,
    collab: Collaborators<'a>,
) -> impl Iterator<Item = Result<(String, Subrepo<'a>), BackendError>> + 'c {
    let paths: BTreeSet<&String> = ctx1.state.keys().chain(ctx2.state.keys()).collect();
    paths.into_iter().map(move |path| {
        let ctx = if ctx1.state.contains_key(path) { ctx1 } else { ctx2 };
        Ok((path.clone(), ctx.sub(path, collab)?))
    })
}

/// Push every subrepo depth-first. Stops at the first push that reports
/// failure and returns `false`.
#[instrument(skip(ctx, collab), fields(root = %ctx.parent.root.display()))]
pub fn push_all(ctx: &RepoContext, force: bool, collab: Collaborators<'_>) -> Result<bool, ReconcileError> {
    for path in ctx.state.keys() {
        let pushed = ctx
            .sub(path, collab)
            .and_then(|sub| sub.push(force))
            .map_err(|e| ReconcileError::at(path, e))?;
        if !pushed {
            info!(path = %path, "push stopped");
            return Ok(false);
        }
    }
    Ok(true)
}

/// Archive every subrepo at its recorded revision. Returns the number of
/// files written.
pub fn archive_all(
    ctx: &RepoContext,
    sink: &mut dyn ArchiveSink,
    prefix: &str,
    collab: Collaborators<'_>,
) -> Result<usize, ReconcileError> {
    let mut written = 0;
    for path in ctx.state.keys() {
        written += ctx
            .sub(path, collab)
            .and_then(|sub| sub.archive(sink, prefix))
            .map_err(|e| ReconcileError::at(path, e))?;
    }
    info!(files = written, "archived subrepos");
    Ok(written)
}

/// Commit every dirty subrepo and record the new revisions in the parent's
/// state file. Returns the recorded state.
#[instrument(skip(ctx, message, collab), fields(root = %ctx.parent.root.display()))]
pub fn commit_all(
    ctx: &RepoContext,
    message: &str,
    user: Option<&str>,
    date: Option<DateTime<FixedOffset>>,
    collab: Collaborators<'_>,
) -> Result<SubrepoState, ReconcileError> {
    let mut state = ctx.state.clone();
    for (path, pointer) in state.iter_mut() {
        let sub = ctx.sub(path, collab).map_err(|e| ReconcileError::at(path, e))?;
        if !sub.dirty(false).map_err(|e| ReconcileError::at(path, e))? {
            continue;
        }
        collab
            .diag
            .status(&format!("committing subrepository {}\n", sub.relpath()));
        let revision = sub
            .commit(message, user, date)
            .map_err(|e| ReconcileError::at(path, e))?;
        pointer.revision = revision;
    }
    write_state(&ctx.parent.root, &state)?;
    Ok(state)
}

/// Reconcile the subrepos of a parent merge and record the result in the
/// local working directory. Nothing is written when reconciliation fails.
pub fn merge_and_record(
    local: &RepoContext,
    remote: &SubrepoState,
    ancestor: &SubrepoState,
    overwrite_local: bool,
    collab: Collaborators<'_>,
) -> Result<SubrepoState, ReconcileError> {
    let mut wc = ParentWorkingCopy::new(local, collab);
    let merged = reconcile(
        &mut wc,
        &local.state,
        remote,
        ancestor,
        overwrite_local,
        collab.prompt,
        collab.diag,
    )?;
    write_state(&local.parent.root, &merged)?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubrepoKind;
    use crate::native::Git2Provider;
    use crate::source::ParentRef;
    use crate::state::{SPEC_FILE, STATE_FILE};
    use crate::testing::{RecordingDiagnostics, ScriptedExecutor};
    use crate::ui::NonInteractive;
    use git2::Repository;
    use std::path::Path;

    const INFO_AT_9: &str = r#"<info><entry revision="9"><commit revision="9"></commit></entry></info>"#;
    const STATUS_CLEAN: &str = r#"<status><target path="."></target></status>"#;
    const STATUS_MODIFIED: &str = r#"<status><target path=".">
<entry path="a.txt"><wc-status props="none" item="modified"></wc-status></entry>
</target></status>"#;

    fn collab<'a>(exec: &'a ScriptedExecutor, diag: &'a RecordingDiagnostics) -> Collaborators<'a> {
        Collaborators {
            exec,
            repos: &Git2Provider,
            prompt: &NonInteractive,
            diag,
            rules: &[],
        }
    }

    fn svn(source: &str, revision: &str) -> SubrepoPointer {
        SubrepoPointer::new(source, revision, "svn")
    }

    fn context(root: &Path, entries: &[(&str, SubrepoPointer)]) -> RepoContext {
        RepoContext::new(
            ParentRef::top(root, None, None),
            entries.iter().map(|(p, s)| (p.to_string(), s.clone())).collect(),
        )
    }

    /// Commit `files` to the repository at `root`, creating it if needed.
    fn commit_files(root: &Path, files: &[(&str, &str)]) -> String {
        let repo = Repository::open(root).or_else(|_| Repository::init(root)).unwrap();
        let mut index = repo.index().unwrap();
        for (name, content) in files {
            let file = root.join(name);
            std::fs::create_dir_all(file.parent().unwrap()).unwrap();
            std::fs::write(&file, content).unwrap();
            index.add_path(Path::new(name)).unwrap();
        }
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("Test", "test@test.com").unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, "nested", &tree, &parents)
            .unwrap()
            .to_string()
    }

    #[derive(Default)]
    struct MemorySink {
        names: Vec<String>,
    }

    impl ArchiveSink for MemorySink {
        fn add_file(&mut self, name: &str, _mode: u32, _symlink: bool, _data: &[u8]) -> std::io::Result<()> {
            self.names.push(name.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_iter_subrepos_prefers_first_context() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ScriptedExecutor::new();
        let diag = RecordingDiagnostics::default();
        let ctx1 = context(dir.path(), &[("a", svn("S", "1"))]);
        let ctx2 = context(
            dir.path(),
            &[
                ("a", SubrepoPointer::new("G", "x", "git")),
                ("b", SubrepoPointer::new("G", "y", "git")),
            ],
        );
        let subs: Vec<(String, SubrepoKind, String)> = iter_subrepos(&ctx1, &ctx2, collab(&exec, &diag))
            .map(|r| {
                let (path, sub) = r.unwrap();
                (path, sub.kind(), sub.pointer().revision.clone())
            })
            .collect();
        assert_eq!(
            subs,
            vec![
                ("a".to_string(), SubrepoKind::Svn, "1".to_string()),
                ("b".to_string(), SubrepoKind::Git, "y".to_string()),
            ]
        );
    }

    #[test]
    fn test_push_stops_at_first_failing_grandchild() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("lib");
        let rev = commit_files(
            &lib,
            &[
                (SPEC_FILE, "a = [git]https://example.com/a\nb = [git]https://example.com/b\n"),
                (STATE_FILE, "aaa a\nbbb b\n"),
            ],
        );
        std::fs::create_dir_all(lib.join("a/.git")).unwrap();
        std::fs::create_dir_all(lib.join("b/.git")).unwrap();

        let exec = ScriptedExecutor::new()
            .on("git", &["for-each-ref"], 0, "")
            .on("git", &["symbolic-ref"], 128, "");
        let diag = RecordingDiagnostics::default();
        let ctx = context(
            dir.path(),
            &[("lib", SubrepoPointer::new("https://example.com/lib", rev, "native"))],
        );

        assert!(!push_all(&ctx, false, collab(&exec, &diag)).unwrap());
        let calls = exec.calls();
        assert!(!calls.is_empty());
        assert!(calls.iter().all(|c| c.cwd.as_deref() == Some(lib.join("a").as_path())));
        assert_eq!(
            diag.warnings(),
            vec!["no branch checked out in subrepo lib/a\ncannot push revision aaa\n".to_string()]
        );
        assert!(diag.statuses().iter().all(|s| !s.starts_with("pushing subrepo lib")));
    }

    #[test]
    fn test_archive_recurses_into_native_children() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("lib");
        let rev = commit_files(
            &lib,
            &[
                ("README", "lib"),
                (SPEC_FILE, "docs = [svn]https://svn.example.com/docs\n"),
                (STATE_FILE, "9 docs\n"),
            ],
        );
        let exec = ScriptedExecutor::new()
            .on("svn", &["list"], 0, "a.txt\n")
            .on("svn", &["proplist"], 0, "")
            .on("svn", &["cat"], 0, "A");
        let diag = RecordingDiagnostics::default();
        let ctx = context(
            dir.path(),
            &[("lib", SubrepoPointer::new("https://example.com/lib", rev, "native"))],
        );
        let mut sink = MemorySink::default();

        let written = archive_all(&ctx, &mut sink, "out", collab(&exec, &diag)).unwrap();
        assert_eq!(written, 4);
        let mut names = sink.names.clone();
        names.sort();
        assert_eq!(
            names,
            vec![
                "out/lib/.subrepos",
                "out/lib/.subrepostate",
                "out/lib/README",
                "out/lib/docs/a.txt",
            ]
        );
        assert!(diag
            .progress()
            .iter()
            .any(|(topic, _, _)| topic == "archiving (lib/docs)"));
    }

    #[test]
    fn test_merge_and_record_writes_result() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ScriptedExecutor::new()
            .on("svn", &["status", "--xml"], 0, STATUS_CLEAN)
            .on("svn", &["info", "--xml"], 0, INFO_AT_9)
            .on("svn", &["checkout"], 0, "Checked out revision 3.\n");
        let diag = RecordingDiagnostics::default();
        let local = context(dir.path(), &[("docs", svn("S", "9"))]);
        let remote = context(dir.path(), &[("docs", svn("S", "9")), ("more", svn("T", "3"))]).state;

        let merged = merge_and_record(&local, &remote, &SubrepoState::new(), false, collab(&exec, &diag)).unwrap();
        assert_eq!(merged, remote);
        assert_eq!(exec.count(&["checkout", "T", "--revision", "3"]), 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(STATE_FILE)).unwrap(),
            "9 docs\n3 more\n"
        );
    }

    #[test]
    fn test_failed_merge_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ScriptedExecutor::new().on("svn", &["checkout"], 1, "");
        let diag = RecordingDiagnostics::default();
        let local = context(dir.path(), &[]);
        let remote = context(dir.path(), &[("more", svn("T", "3"))]).state;

        let err = merge_and_record(&local, &remote, &SubrepoState::new(), false, collab(&exec, &diag)).unwrap_err();
        assert_eq!(err.path(), Some("more"));
        assert!(!dir.path().join(STATE_FILE).exists());
    }

    #[test]
    fn test_commit_all_records_new_revisions() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ScriptedExecutor::new()
            .on("svn", &["status", "--xml"], 0, STATUS_MODIFIED)
            .on("svn", &["commit"], 0, "Committed revision 10.\n")
            .on("svn", &["update"], 0, "At revision 10.\n");
        let diag = RecordingDiagnostics::default();
        let ctx = context(dir.path(), &[("docs", svn("S", "9"))]);

        let state = commit_all(&ctx, "sync", None, None, collab(&exec, &diag)).unwrap();
        assert_eq!(state["docs"], svn("S", "10"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join(STATE_FILE)).unwrap(),
            "10 docs\n"
        );
        assert!(diag.statuses().contains(&"committing subrepository docs\n".to_string()));
    }
}
