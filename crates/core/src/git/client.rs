//! Git subrepos driven through the `git` binary.
//!
//! Unlike the native backend this one never touches the object database
//! directly: every operation is a `git` invocation handed to the
//! [`CommandExecutor`](crate::exec::CommandExecutor), so the operator's own
//! git configuration (credentials, hooks, aliases) applies.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset};
use tracing::{debug, info, instrument, warn};

use crate::errors::BackendError;
use crate::exec::{CommandOutput, Invocation, OutputMode};
use crate::models::{FileFlags, SubrepoKind, SubrepoPointer, SubrepoStatus};
use crate::source::{require_abs_source, ParentRef};
use crate::subrepo::{update_prompt, Collaborators};

/// Commands whose exit status is reported to the caller instead of failing.
const STATUS_COMMANDS: [&str; 2] = ["cat-file", "symbolic-ref"];

/// Branch refs by name, and the refs pointing at each revision in
/// `for-each-ref` order.
#[derive(Debug, Default)]
pub struct BranchMap {
    pub branch_to_rev: BTreeMap<String, String>,
    pub rev_to_branches: HashMap<String, Vec<String>>,
}

/// One blob from `git ls-tree`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: u32,
    pub name: String,
}

/// A git working copy bound to one pointer of its parent.
pub struct GitSubrepo<'a> {
    path: String,
    pointer: SubrepoPointer,
    parent: ParentRef,
    collab: Collaborators<'a>,
}

impl<'a> GitSubrepo<'a> {
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

    fn abspath(&self) -> PathBuf {
        self.parent.join(&self.path)
    }

    fn run(
        &self,
        args: &[&str],
        env: &[(&str, String)],
        mode: OutputMode,
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, BackendError> {
        self.collab
            .diag
            .debug(&format!("{}: git {}\n", self.relpath(), args.join(" ")));
        let mut inv = Invocation::new("git").args(args.iter().copied()).mode(mode);
        for (key, value) in env {
            inv = inv.env(*key, value.clone());
        }
        if let Some(cwd) = cwd {
            inv = inv.current_dir(cwd);
        }

        let output = self.collab.exec.run(&inv).map_err(|e| {
            let missing_cwd = cwd.is_some_and(|dir| !dir.exists());
            if e.kind() == ErrorKind::NotFound && !missing_cwd {
                BackendError::BinaryNotFound("git".into())
            } else {
                BackendError::Io(e)
            }
        })?;

        if output.status != 0 && output.status != 1 {
            let command = args.first().copied().unwrap_or_default();
            if STATUS_COMMANDS.contains(&command) {
                return Ok(output);
            }
            let stderr = output.stderr.trim().to_string();
            warn!(command, status = output.status, %stderr, path = %self.relpath(), "git command failed");
            return Err(BackendError::CommandFailed {
                kind: SubrepoKind::Git,
                args: args.iter().map(|a| a.to_string()).collect(),
                status: output.status,
                stderr,
            });
        }
        Ok(output)
    }

    /// Run inside the working copy; returns trimmed stdout and exit status.
    fn git_dir(&self, args: &[&str]) -> Result<(String, i32), BackendError> {
        let output = self.run(args, &[], OutputMode::Buffered, Some(&self.abspath()))?;
        Ok((output.stdout_str().trim().to_string(), output.status))
    }

    fn git(&self, args: &[&str]) -> Result<String, BackendError> {
        Ok(self.git_dir(args)?.0)
    }

    fn git_streamed(&self, args: &[&str]) -> Result<(), BackendError> {
        self.run(args, &[], OutputMode::Streamed, Some(&self.abspath()))?;
        Ok(())
    }

    fn head(&self) -> Result<String, BackendError> {
        self.git(&["rev-parse", "HEAD"])
    }

    fn current_branch(&self) -> Result<Option<String>, BackendError> {
        let (current, status) = self.git_dir(&["symbolic-ref", "HEAD", "--quiet"])?;
        Ok((status == 0 && !current.is_empty()).then_some(current))
    }

    fn have_locally(&self, revision: &str) -> Result<bool, BackendError> {
        Ok(self.git_dir(&["cat-file", "-e", revision])?.1 == 0)
    }

    fn is_ancestor(&self, r1: &str, r2: &str) -> Result<bool, BackendError> {
        Ok(self.git(&["merge-base", r1, r2])? == r1)
    }

    /// Staged or modified tracked files; untracked files are ignored.
    fn has_changes(&self) -> Result<bool, BackendError> {
        Ok(self.git_dir(&["diff-index", "--quiet", "HEAD"])?.1 == 1)
    }

    fn branch_map(&self) -> Result<BranchMap, BackendError> {
        let out = self.git(&["for-each-ref", "--format", "%(objectname) %(refname)"])?;
        Ok(parse_branch_map(&out))
    }

    /// Remote branch ref to the local branch tracking it.
    fn tracking<'b>(
        &self,
        branches: impl Iterator<Item = &'b String>,
    ) -> Result<HashMap<String, String>, BackendError> {
        let mut tracking = HashMap::new();
        for branch in branches {
            let Some(short) = branch.strip_prefix("refs/heads/") else {
                continue;
            };
            let remote = self.git(&["config", &format!("branch.{short}.remote")])?;
            if remote.is_empty() {
                continue;
            }
            let merge = self.git(&["config", &format!("branch.{short}.merge")])?;
            if let Some(name) = merge.splitn(3, '/').nth(2) {
                tracking.insert(format!("refs/remotes/{remote}/{name}"), branch.clone());
            }
        }
        Ok(tracking)
    }

    /// Make `revision` available locally, cloning the working copy first
    /// when it does not exist yet.
    fn fetch(&self, source: &str, revision: &str) -> Result<(), BackendError> {
        let relpath = self.relpath();
        let abspath = self.abspath();
        if !abspath.join(".git").exists() {
            self.collab
                .diag
                .status(&format!("cloning subrepo {relpath}\n"));
            let url = require_abs_source(&self.parent, source, false, &relpath)?;
            let dest = abspath.to_string_lossy();
            self.run(
                &["clone", url.as_str(), dest.as_ref()],
                &[],
                OutputMode::Streamed,
                None,
            )?;
        }
        if self.have_locally(revision)? {
            return Ok(());
        }
        self.collab
            .diag
            .status(&format!("pulling subrepo {relpath}\n"));
        self.git_streamed(&["fetch"])?;
        if self.have_locally(revision)? {
            return Ok(());
        }
        let url = require_abs_source(&self.parent, source, false, &relpath)?;
        self.git_streamed(&["fetch", &url])?;
        if !self.have_locally(revision)? {
            return Err(BackendError::RevisionNotFound {
                path: relpath,
                revision: revision.to_string(),
            });
        }
        Ok(())
    }

    pub fn dirty(&self, ignore_update: bool) -> Result<bool, BackendError> {
        if !self.abspath().join(".git").exists() {
            return Ok(!ignore_update);
        }
        if !ignore_update && self.pointer.revision != self.head()? {
            return Ok(true);
        }
        self.has_changes()
    }

    #[instrument(skip(self, message), fields(path = %self.path))]
    pub fn commit(
        &self,
        message: &str,
        user: Option<&str>,
        date: Option<DateTime<FixedOffset>>,
    ) -> Result<String, BackendError> {
        let mut args = vec!["commit", "-a", "-m", message];
        if let Some(user) = user {
            args.extend(["--author", user]);
        }
        let env: Vec<(&str, String)> = date
            .map(|d| ("GIT_AUTHOR_DATE", d.format("%Y-%m-%dT%H:%M:%S %z").to_string()))
            .into_iter()
            .collect();
        self.run(&args, &env, OutputMode::Buffered, Some(&self.abspath()))?;
        // HEAD may not exist when there was nothing to commit in a fresh repo
        let head = self.head()?;
        info!(revision = %head, "git commit recorded");
        Ok(head)
    }

    fn checkout(&self, args: &[&str], overwrite: bool) -> Result<(), BackendError> {
        let mut cmd = vec!["checkout"];
        if overwrite {
            // unstage first so -f does not throw away newly added files
            self.git(&["reset", "HEAD"])?;
            cmd.push("-f");
        }
        cmd.extend_from_slice(args);
        self.git(&cmd)?;
        Ok(())
    }

    fn raw_checkout(&self, revision: &str, overwrite: bool) -> Result<(), BackendError> {
        let relpath = self.relpath();
        self.collab
            .diag
            .warn(&format!("checking out detached HEAD in subrepo {relpath}\n"));
        self.collab
            .diag
            .warn("check out a git branch if you intend to make changes\n");
        self.checkout(&["-q", revision], overwrite)
    }

    #[instrument(skip(self), fields(path = %self.path))]
    pub fn get(&self, target: &SubrepoPointer, overwrite: bool) -> Result<(), BackendError> {
        let revision = target.revision.as_str();
        self.fetch(&target.source, revision)?;

        if self.git(&["config", "--bool", "core.bare"])? == "true" {
            self.git(&["config", "core.bare", "false"])?;
            if self.head()? == revision {
                self.git(&["reset", "--hard", "HEAD"])?;
                return Ok(());
            }
        } else if self.head()? == revision {
            if overwrite {
                self.git(&["reset", "HEAD"])?;
                self.git(&["reset", "--hard", "HEAD"])?;
            }
            return Ok(());
        }

        if !overwrite && self.has_changes()? {
            return Err(BackendError::DirtyWorkingCopy {
                path: self.relpath(),
            });
        }

        let branches = self.branch_map()?;
        let Some(refs) = branches.rev_to_branches.get(revision) else {
            return self.raw_checkout(revision, overwrite);
        };
        if refs.iter().any(|b| b == "refs/heads/master") {
            return self.checkout(&["refs/heads/master"], overwrite);
        }
        if let Some(local) = refs.iter().find(|b| !b.starts_with("refs/remotes/")) {
            return self.checkout(&[local.as_str()], overwrite);
        }

        let tracking = self.tracking(branches.branch_to_rev.keys())?;
        let remote = refs
            .iter()
            .find(|b| tracking.contains_key(*b))
            .unwrap_or(&refs[0]);
        match tracking.get(remote) {
            None => {
                let local = remote.splitn(3, '/').nth(2).unwrap_or(remote);
                self.checkout(&["-b", local, remote.as_str()], overwrite)
            }
            Some(local) => {
                let local_rev = branches
                    .branch_to_rev
                    .get(local)
                    .map(String::as_str)
                    .unwrap_or_default();
                if !self.is_ancestor(local_rev, remote)? {
                    return self.raw_checkout(revision, overwrite);
                }
                // the local branch is behind: fast-forward it lazily
                if self.current_branch()?.as_deref() != Some(local.as_str()) {
                    self.checkout(&[local.as_str()], overwrite)?;
                }
                self.git(&["merge", "--ff", remote])?;
                Ok(())
            }
        }
    }

    pub fn merge(&self, target: &SubrepoPointer) -> Result<(), BackendError> {
        let revision = target.revision.as_str();
        let recorded = self.pointer.revision.as_str();
        self.fetch(&target.source, revision)?;
        let base = self.git(&["merge-base", revision, recorded])?;
        let changed = self.has_changes()?;

        let merge_func = || -> Result<(), BackendError> {
            if base == revision {
                debug!(path = %self.path, "fast-forwarding git subrepo");
                self.get(target, false)
            } else if base != recorded {
                self.git(&["merge", "--no-commit", revision])?;
                Ok(())
            } else {
                Ok(())
            }
        };

        if !self.dirty(false)? {
            return merge_func();
        }
        let head = self.head()?;
        if head == revision {
            return Ok(());
        }
        let dirty = head == recorded || changed;
        match update_prompt(
            self.collab.prompt,
            &self.relpath(),
            dirty,
            short_rev(recorded),
            short_rev(revision),
        ) {
            None => Err(BackendError::MergeAborted {
                path: self.relpath(),
            }),
            Some(1) => merge_func(),
            Some(_) => Ok(()),
        }
    }

    /// Push the checked-out branch to `origin` unless the recorded revision
    /// is already reachable from an `origin` branch.
    pub fn push(&self, force: bool) -> Result<bool, BackendError> {
        let relpath = self.relpath();
        let recorded = self.pointer.revision.as_str();
        let branches = self.branch_map()?;
        if branches
            .rev_to_branches
            .get(recorded)
            .is_some_and(|refs| refs.iter().any(|b| b.starts_with("refs/remotes/origin/")))
        {
            return Ok(true);
        }
        for (branch, revision) in &branches.branch_to_rev {
            if branch.starts_with("refs/remotes/origin/") && self.is_ancestor(recorded, revision)? {
                return Ok(true);
            }
        }

        let Some(current) = self.current_branch()? else {
            self.collab.diag.warn(&format!(
                "no branch checked out in subrepo {relpath}\ncannot push revision {recorded}\n"
            ));
            return Ok(false);
        };
        if !self.is_ancestor(recorded, &current)? {
            self.collab
                .diag
                .warn(&format!("unrelated git branch checked out in subrepo {relpath}\n"));
            return Ok(false);
        }
        let short = current.splitn(3, '/').nth(2).unwrap_or(&current);
        self.collab
            .diag
            .status(&format!("pushing branch {short} of subrepo {relpath}\n"));
        let mut args = vec!["push"];
        if force {
            args.push("--force");
        }
        args.extend(["origin", current.as_str()]);
        self.git_streamed(&args)?;
        Ok(true)
    }

    /// Strip the working files but keep `.git`, which may hold local-only
    /// history.
    pub fn remove(&self) -> Result<(), BackendError> {
        let relpath = self.relpath();
        if self.dirty(false)? {
            self.collab
                .diag
                .warn(&format!("not removing repo {relpath} because it has changes.\n"));
            return Ok(());
        }
        self.collab
            .diag
            .note(&format!("removing subrepo {relpath}\n"));
        self.git(&["config", "core.bare", "true"])?;
        for entry in std::fs::read_dir(self.abspath())? {
            let entry = entry?;
            if entry.file_name() == ".git" {
                continue;
            }
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
            } else {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn tree_entries(&self, pathspec: Option<&str>) -> Result<Vec<TreeEntry>, BackendError> {
        let mut args = vec!["ls-tree", "-r", "-z", "--full-tree", self.pointer.revision.as_str()];
        if let Some(pathspec) = pathspec {
            args.extend(["--", pathspec]);
        }
        let output = self.run(&args, &[], OutputMode::Buffered, Some(&self.abspath()))?;
        Ok(parse_tree_entries(&output.stdout_str()))
    }

    /// Files at the recorded revision, fetching it first if needed.
    pub fn files(&self) -> Result<Vec<String>, BackendError> {
        if self.pointer.is_null_revision() {
            return Ok(Vec::new());
        }
        self.fetch(&self.pointer.source, &self.pointer.revision)?;
        Ok(self.tree_entries(None)?.into_iter().map(|e| e.name).collect())
    }

    pub fn file_data(&self, name: &str) -> Result<Vec<u8>, BackendError> {
        let object = format!("{}:{}", self.pointer.revision, name);
        let args = ["cat-file", "blob", object.as_str()];
        let output = self.run(&args, &[], OutputMode::Buffered, Some(&self.abspath()))?;
        if !output.success() {
            return Err(BackendError::CommandFailed {
                kind: SubrepoKind::Git,
                args: args.iter().map(|a| a.to_string()).collect(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    pub fn file_flags(&self, name: &str) -> Result<FileFlags, BackendError> {
        Ok(self
            .tree_entries(Some(name))?
            .into_iter()
            .find(|e| e.name == name)
            .map(|e| FileFlags::from_git_mode(e.mode))
            .unwrap_or_default())
    }

    pub fn status(&self, rev2: Option<&str>) -> Result<SubrepoStatus, BackendError> {
        let rev1 = self.pointer.revision.as_str();
        let out = match rev2 {
            Some(rev2) => self.git(&["diff-tree", "-r", rev1, rev2])?,
            None => self.git(&["diff-index", rev1])?,
        };
        Ok(parse_raw_diff(&out))
    }

    pub fn diff(&self, rev2: Option<&str>) -> Result<String, BackendError> {
        let mut args = vec!["diff", self.pointer.revision.as_str()];
        if let Some(rev2) = rev2 {
            args.push(rev2);
        }
        self.git(&args)
    }
}

fn short_rev(revision: &str) -> &str {
    revision.get(..7).unwrap_or(revision)
}

/// Parse `for-each-ref --format '%(objectname) %(refname)'`, keeping local
/// and remote branches but not `remotes/*/HEAD` redirects.
pub fn parse_branch_map(output: &str) -> BranchMap {
    let mut map = BranchMap::default();
    for line in output.lines() {
        let Some((revision, name)) = line.trim().split_once(' ') else {
            continue;
        };
        let remote = name.starts_with("refs/remotes/");
        if !remote && !name.starts_with("refs/heads/") {
            continue;
        }
        if remote && name.ends_with("/HEAD") {
            continue;
        }
        map.branch_to_rev.insert(name.to_string(), revision.to_string());
        map.rev_to_branches
            .entry(revision.to_string())
            .or_default()
            .push(name.to_string());
    }
    map
}

/// Parse `ls-tree -r -z` output into blob entries; gitlinks are skipped.
pub fn parse_tree_entries(output: &str) -> Vec<TreeEntry> {
    output
        .split('\0')
        .filter_map(|record| {
            let (meta, name) = record.split_once('\t')?;
            let mut parts = meta.split_whitespace();
            let mode = u32::from_str_radix(parts.next()?, 8).ok()?;
            (parts.next()? == "blob").then(|| TreeEntry {
                mode,
                name: name.to_string(),
            })
        })
        .collect()
}

/// Parse raw `diff-tree` / `diff-index` lines (`:... M\tpath`).
pub fn parse_raw_diff(output: &str) -> SubrepoStatus {
    let mut status = SubrepoStatus::default();
    for line in output.lines() {
        let Some(tab) = line.find('\t') else {
            continue;
        };
        let file = line[tab + 1..].to_string();
        match line[..tab].chars().last() {
            Some('M') => status.modified.push(file),
            Some('A') => status.added.push(file),
            Some('D') => status.removed.push(file),
            _ => {}
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::Git2Provider;
    use crate::testing::{RecordingDiagnostics, ScriptedExecutor, ScriptedPrompt};
    use crate::ui::{NonInteractive, Prompt};

    struct Env {
        dir: tempfile::TempDir,
        exec: ScriptedExecutor,
        diag: RecordingDiagnostics,
    }

    impl Env {
        fn new(exec: ScriptedExecutor) -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                exec,
                diag: RecordingDiagnostics::default(),
            }
        }

        /// A working copy that already has a `.git` directory.
        fn checked_out(exec: ScriptedExecutor) -> Self {
            let env = Self::new(exec);
            std::fs::create_dir_all(env.dir.path().join("lib/.git")).unwrap();
            env
        }

        fn sub<'a>(&'a self, revision: &str, prompt: &'a dyn Prompt) -> GitSubrepo<'a> {
            let collab = Collaborators {
                exec: &self.exec,
                repos: &Git2Provider,
                prompt,
                diag: &self.diag,
                rules: &[],
            };
            GitSubrepo::new(
                ParentRef::top(self.dir.path(), Some("https://example.com/top".into()), None),
                "lib",
                SubrepoPointer::new("https://example.com/lib", revision, "git"),
                collab,
            )
        }

        fn ran(&self, command: &str) -> bool {
            self.exec.commands().iter().any(|c| c == command)
        }
    }

    fn target(revision: &str) -> SubrepoPointer {
        SubrepoPointer::new("https://example.com/lib", revision, "git")
    }

    #[test]
    fn test_parse_branch_map() {
        let map = parse_branch_map(
            "aaa refs/heads/master\naaa refs/remotes/origin/master\nbbb refs/remotes/origin/HEAD\nccc refs/tags/v1\n",
        );
        assert_eq!(map.branch_to_rev.len(), 2);
        assert_eq!(
            map.rev_to_branches["aaa"],
            vec!["refs/heads/master", "refs/remotes/origin/master"]
        );
        assert!(!map.rev_to_branches.contains_key("bbb"));
        assert!(!map.rev_to_branches.contains_key("ccc"));
    }

    #[test]
    fn test_parse_tree_entries() {
        let out = "100644 blob 1111\ta.txt\0100755 blob 2222\tbin/run\0160000 commit 3333\tnested\0120000 blob 4444\tlink\0";
        let entries = parse_tree_entries(out);
        assert_eq!(
            entries,
            vec![
                TreeEntry { mode: 0o100644, name: "a.txt".into() },
                TreeEntry { mode: 0o100755, name: "bin/run".into() },
                TreeEntry { mode: 0o120000, name: "link".into() },
            ]
        );
    }

    #[test]
    fn test_parse_raw_diff() {
        let out = ":100644 100644 aaa bbb M\ta.txt\n:000000 100644 000 ccc A\tnew.txt\n:100644 000000 ddd 000 D\told.txt\n";
        let status = parse_raw_diff(out);
        assert_eq!(status.modified, vec!["a.txt"]);
        assert_eq!(status.added, vec!["new.txt"]);
        assert_eq!(status.removed, vec!["old.txt"]);
    }

    #[test]
    fn test_dirty() {
        let env = Env::checked_out(
            ScriptedExecutor::new()
                .on("git", &["rev-parse", "HEAD"], 0, "abc\n")
                .on("git", &["diff-index", "--quiet", "HEAD"], 1, ""),
        );
        assert!(env.sub("abc", &NonInteractive).dirty(false).unwrap());
        assert!(env.sub("def", &NonInteractive).dirty(false).unwrap());
        assert_eq!(env.exec.count(&["diff-index"]), 1);
        assert!(env.exec.calls()[0].cwd.as_deref() == Some(env.dir.path().join("lib").as_path()));
    }

    #[test]
    fn test_dirty_without_checkout() {
        let env = Env::new(ScriptedExecutor::new());
        assert!(env.sub("abc", &NonInteractive).dirty(false).unwrap());
        assert!(!env.sub("abc", &NonInteractive).dirty(true).unwrap());
        assert!(env.exec.calls().is_empty());
    }

    #[test]
    fn test_failed_command_and_status_commands() {
        let env = Env::checked_out(
            ScriptedExecutor::new()
                .on("git", &["rev-parse"], 128, "")
                .on("git", &["cat-file"], 128, ""),
        );
        let sub = env.sub("abc", &NonInteractive);
        assert!(!sub.have_locally("abc").unwrap());
        match sub.head().unwrap_err() {
            BackendError::CommandFailed { kind, args, status, .. } => {
                assert_eq!(kind, SubrepoKind::Git);
                assert_eq!(args, vec!["rev-parse", "HEAD"]);
                assert_eq!(status, 128);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(env.diag.debugs()[0], "lib: git cat-file -e abc\n");
    }

    fn get_script(head: &str, branches: &str) -> ScriptedExecutor {
        ScriptedExecutor::new()
            .on("git", &["cat-file", "-e"], 0, "")
            .on("git", &["config", "--bool", "core.bare"], 1, "")
            .on("git", &["rev-parse", "HEAD"], 0, head)
            .on("git", &["diff-index"], 0, "")
            .on("git", &["for-each-ref"], 0, branches)
            .on("git", &["checkout"], 0, "")
            .on("git", &["reset"], 0, "")
    }

    #[test]
    fn test_get_prefers_master() {
        let env = Env::checked_out(get_script(
            "old",
            "new refs/heads/feature\nnew refs/heads/master\nnew refs/remotes/origin/master\n",
        ));
        env.sub("old", &NonInteractive).get(&target("new"), false).unwrap();
        assert!(env.ran("git checkout refs/heads/master"));
        assert_eq!(env.exec.count(&["reset"]), 0);
        assert_eq!(env.exec.count(&["fetch"]), 0);
    }

    #[test]
    fn test_get_uses_first_local_branch() {
        let env = Env::checked_out(get_script(
            "old",
            "new refs/remotes/origin/feature\nnew refs/heads/feature\nnew refs/heads/other\n",
        ));
        env.sub("old", &NonInteractive).get(&target("new"), false).unwrap();
        assert!(env.ran("git checkout refs/heads/feature"));
    }

    #[test]
    fn test_get_creates_tracking_branch() {
        let env = Env::checked_out(
            get_script("old", "old refs/heads/master\nnew refs/remotes/origin/feature\n")
                .on("git", &["config", "branch.master.remote"], 1, ""),
        );
        env.sub("old", &NonInteractive).get(&target("new"), false).unwrap();
        assert!(env.ran("git checkout -b feature refs/remotes/origin/feature"));
    }

    #[test]
    fn test_get_fast_forwards_tracking_branch() {
        let env = Env::checked_out(
            get_script("old", "old refs/heads/topic\nnew refs/remotes/origin/topic\n")
                .on("git", &["config", "branch.topic.remote"], 0, "origin")
                .on("git", &["config", "branch.topic.merge"], 0, "refs/heads/topic")
                .on("git", &["merge-base", "old", "refs/remotes/origin/topic"], 0, "old")
                .on("git", &["symbolic-ref"], 0, "refs/heads/topic")
                .on("git", &["merge", "--ff"], 0, ""),
        );
        env.sub("old", &NonInteractive).get(&target("new"), false).unwrap();
        assert!(env.ran("git merge --ff refs/remotes/origin/topic"));
        assert_eq!(env.exec.count(&["checkout"]), 0);
    }

    #[test]
    fn test_get_detached_with_overwrite() {
        let env = Env::checked_out(get_script("old", "old refs/heads/master\n"));
        env.sub("old", &NonInteractive).get(&target("new"), true).unwrap();
        assert!(env.ran("git reset HEAD"));
        assert!(env.ran("git checkout -f -q new"));
        assert_eq!(
            env.diag.warnings(),
            vec![
                "checking out detached HEAD in subrepo lib\n".to_string(),
                "check out a git branch if you intend to make changes\n".to_string(),
            ]
        );
    }

    #[test]
    fn test_get_refuses_to_lose_changes() {
        let env = Env::checked_out(
            ScriptedExecutor::new()
                .on("git", &["cat-file", "-e"], 0, "")
                .on("git", &["config", "--bool", "core.bare"], 1, "")
                .on("git", &["rev-parse", "HEAD"], 0, "old")
                .on("git", &["diff-index"], 1, ""),
        );
        let err = env.sub("old", &NonInteractive).get(&target("new"), false).unwrap_err();
        assert!(matches!(err, BackendError::DirtyWorkingCopy { ref path } if path == "lib"));
        assert_eq!(env.exec.count(&["checkout"]), 0);
    }

    #[test]
    fn test_get_unbares_removed_checkout() {
        let env = Env::checked_out(
            ScriptedExecutor::new()
                .on("git", &["cat-file", "-e"], 0, "")
                .on("git", &["config", "--bool", "core.bare"], 0, "true")
                .on("git", &["config", "core.bare", "false"], 0, "")
                .on("git", &["rev-parse", "HEAD"], 0, "new")
                .on("git", &["reset", "--hard"], 0, ""),
        );
        env.sub("new", &NonInteractive).get(&target("new"), false).unwrap();
        assert!(env.ran("git config core.bare false"));
        assert!(env.ran("git reset --hard HEAD"));
    }

    #[test]
    fn test_fetch_clones_then_fetches() {
        let env = Env::new(
            ScriptedExecutor::new()
                .on("git", &["clone"], 0, "")
                .on("git", &["cat-file", "-e"], 1, "")
                .on("git", &["fetch"], 0, ""),
        );
        let sub = env.sub("abc", &NonInteractive);
        let err = sub.fetch("https://example.com/lib", "abc").unwrap_err();
        assert!(matches!(
            err,
            BackendError::RevisionNotFound { ref path, ref revision } if path == "lib" && revision == "abc"
        ));
        let clone = &env.exec.calls()[0];
        assert_eq!(clone.args[1], "https://example.com/lib");
        assert_eq!(clone.cwd, None);
        assert_eq!(clone.mode, OutputMode::Streamed);
        assert!(env.ran("git fetch"));
        assert!(env.ran("git fetch https://example.com/lib"));
        assert_eq!(
            env.diag.statuses(),
            vec!["cloning subrepo lib\n".to_string(), "pulling subrepo lib\n".to_string()]
        );
    }

    #[test]
    fn test_commit_passes_author_and_date() {
        let env = Env::checked_out(
            ScriptedExecutor::new()
                .on("git", &["commit"], 0, "")
                .on("git", &["rev-parse", "HEAD"], 0, "fff\n"),
        );
        let date = DateTime::parse_from_rfc3339("2024-03-01T12:30:00+02:00").unwrap();
        let rev = env
            .sub("abc", &NonInteractive)
            .commit("msg", Some("Jane <jane@example.com>"), Some(date))
            .unwrap();
        assert_eq!(rev, "fff");
        let commit = &env.exec.calls()[0];
        assert_eq!(
            commit.args,
            vec!["commit", "-a", "-m", "msg", "--author", "Jane <jane@example.com>"]
        );
        assert_eq!(
            commit.env,
            vec![("GIT_AUTHOR_DATE".to_string(), "2024-03-01T12:30:00 +0200".to_string())]
        );
    }

    #[test]
    fn test_merge_fast_forward_and_diverged() {
        let ff = Env::checked_out(
            get_script("cur", "tgt refs/heads/master\n").on("git", &["merge-base"], 0, "tgt"),
        );
        ff.sub("cur", &NonInteractive).merge(&target("tgt")).unwrap();
        assert!(ff.ran("git checkout refs/heads/master"));

        let diverged = Env::checked_out(
            get_script("cur", "")
                .on("git", &["merge-base"], 0, "base")
                .on("git", &["merge", "--no-commit"], 0, ""),
        );
        diverged.sub("cur", &NonInteractive).merge(&target("tgt")).unwrap();
        assert!(diverged.ran("git merge --no-commit tgt"));
    }

    #[test]
    fn test_dirty_merge_prompts() {
        let script = || {
            ScriptedExecutor::new()
                .on("git", &["cat-file", "-e"], 0, "")
                .on("git", &["merge-base"], 0, "base")
                .on("git", &["diff-index"], 1, "")
                .on("git", &["rev-parse", "HEAD"], 0, "cur0000000")
                .on("git", &["merge", "--no-commit"], 0, "")
        };
        let keep = Env::checked_out(script());
        let prompt = ScriptedPrompt::answering(&[Some(0)]);
        keep.sub("cur0000000", &prompt).merge(&target("tgt")).unwrap();
        assert_eq!(keep.exec.count(&["merge", "--no-commit"]), 0);
        assert_eq!(
            prompt.asked(),
            vec![" subrepository sources for lib differ\nuse (l)ocal source (cur0000) or (r)emote source (tgt)?\n".to_string()]
        );

        let abort = Env::checked_out(script());
        let prompt = ScriptedPrompt::answering(&[None]);
        let err = abort.sub("cur0000000", &prompt).merge(&target("tgt")).unwrap_err();
        assert!(matches!(err, BackendError::MergeAborted { .. }));
    }

    #[test]
    fn test_push_skips_when_on_origin() {
        let env = Env::checked_out(
            ScriptedExecutor::new().on("git", &["for-each-ref"], 0, "abc refs/remotes/origin/master\n"),
        );
        assert!(env.sub("abc", &NonInteractive).push(false).unwrap());
        assert_eq!(env.exec.count(&["push"]), 0);
    }

    #[test]
    fn test_push_current_branch() {
        let env = Env::checked_out(
            ScriptedExecutor::new()
                .on("git", &["for-each-ref"], 0, "old refs/remotes/origin/main\nabc refs/heads/main\n")
                .on("git", &["merge-base", "abc", "old"], 0, "old")
                .on("git", &["symbolic-ref"], 0, "refs/heads/main")
                .on("git", &["merge-base", "abc", "refs/heads/main"], 0, "abc")
                .on("git", &["push"], 0, ""),
        );
        assert!(env.sub("abc", &NonInteractive).push(true).unwrap());
        assert!(env.ran("git push --force origin refs/heads/main"));
        assert_eq!(env.diag.statuses(), vec!["pushing branch main of subrepo lib\n".to_string()]);
    }

    #[test]
    fn test_push_refuses_without_branch() {
        let env = Env::checked_out(
            ScriptedExecutor::new()
                .on("git", &["for-each-ref"], 0, "")
                .on("git", &["symbolic-ref"], 128, ""),
        );
        assert!(!env.sub("abc", &NonInteractive).push(false).unwrap());
        assert_eq!(
            env.diag.warnings(),
            vec!["no branch checked out in subrepo lib\ncannot push revision abc\n".to_string()]
        );
    }

    #[test]
    fn test_remove_keeps_git_dir() {
        let env = Env::checked_out(
            ScriptedExecutor::new()
                .on("git", &["rev-parse", "HEAD"], 0, "abc")
                .on("git", &["diff-index"], 0, "")
                .on("git", &["config", "core.bare", "true"], 0, ""),
        );
        let wc = env.dir.path().join("lib");
        std::fs::create_dir_all(wc.join("src")).unwrap();
        std::fs::write(wc.join("src/lib.rs"), "").unwrap();
        std::fs::write(wc.join("README"), "").unwrap();

        env.sub("abc", &NonInteractive).remove().unwrap();
        let left: Vec<_> = std::fs::read_dir(&wc)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(left, vec![std::ffi::OsString::from(".git")]);
        assert!(env.ran("git config core.bare true"));
    }

    #[test]
    fn test_files_and_flags() {
        let env = Env::checked_out(
            ScriptedExecutor::new()
                .on("git", &["cat-file", "-e"], 0, "")
                .on("git", &["ls-tree"], 0, "100755 blob 1111\trun.sh\0100644 blob 2222\tREADME\0")
                .on("git", &["cat-file", "blob", "abc:README"], 0, "hello"),
        );
        let sub = env.sub("abc", &NonInteractive);
        assert_eq!(sub.files().unwrap(), vec!["run.sh", "README"]);
        assert!(sub.file_flags("run.sh").unwrap().executable);
        assert!(!sub.file_flags("README").unwrap().executable);
        assert_eq!(sub.file_data("README").unwrap(), b"hello");
    }
}
