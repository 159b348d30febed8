//! [`RepositoryAccess`] on top of `git2`.

use std::cell::RefCell;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset};
use git2::{
    build::CheckoutBuilder, BranchType, DiffFormat, ErrorCode, ObjectType, Oid,
    PushOptions, RemoteCallbacks, Repository, Signature, StatusOptions, Time, Tree, TreeWalkMode,
    TreeWalkResult,
};
use tracing::{debug, info, instrument, warn};

use super::{DefaultPaths, RepositoryAccess, RepositoryProvider};
use crate::errors::BackendError;
use crate::models::{FileFlags, SubrepoStatus};
use crate::snapshot::Snapshot;
use crate::state::{SPEC_FILE, STATE_FILE};

/// Unborn branch HEAD points at while the working copy is at the null
/// revision.
const NULL_BRANCH: &str = "refs/heads/null";

const FETCH_REFSPECS: [&str; 2] = [
    "+refs/heads/*:refs/remotes/origin/*",
    "+refs/tags/*:refs/tags/*",
];

/// Opens or initializes repositories with `git2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Git2Provider;

impl RepositoryProvider for Git2Provider {
    fn open_or_create(
        &self,
        root: &Path,
        paths: &DefaultPaths,
    ) -> Result<Box<dyn RepositoryAccess>, BackendError> {
        if root.join(".git").exists() {
            return Ok(Box::new(Git2Repository::open(root)?));
        }
        Ok(Box::new(Git2Repository::create(root, paths)?))
    }
}

/// A working copy opened through `git2`.
pub struct Git2Repository {
    repo: Repository,
    root: PathBuf,
}

impl Git2Repository {
    /// Open an existing repository at `root`.
    pub fn open(root: &Path) -> Result<Self, BackendError> {
        debug!(path = %root.display(), "opening repository");
        let repo = Repository::open(root)?;
        Ok(Self {
            repo,
            root: root.to_path_buf(),
        })
    }

    /// Initialize a repository at `root`, recording `paths` as the `origin`
    /// remote.
    #[instrument(fields(path = %root.display()))]
    pub fn create(root: &Path, paths: &DefaultPaths) -> Result<Self, BackendError> {
        std::fs::create_dir_all(root)?;
        let repo = Repository::init(root)?;
        if let Some(pull) = &paths.pull {
            repo.remote("origin", pull)?;
            if let Some(push) = paths.push.as_ref().filter(|p| *p != pull) {
                repo.remote_set_pushurl("origin", Some(push))?;
            }
        }
        info!(default = ?paths.pull, default_push = ?paths.push, "created subrepo repository");
        Ok(Self {
            repo,
            root: root.to_path_buf(),
        })
    }

    /// Configured pull (or push) URL of `origin`.
    pub fn remote_url(&self, push: bool) -> Option<String> {
        let remote = self.repo.find_remote("origin").ok()?;
        let url = if push {
            remote.pushurl().or(remote.url())
        } else {
            remote.url()
        };
        url.map(str::to_string)
    }

    fn commit_tree(&self, revision: &str) -> Result<Option<Tree<'_>>, BackendError> {
        if revision.is_empty() {
            return Ok(None);
        }
        let commit = self.repo.revparse_single(revision)?.peel_to_commit()?;
        Ok(Some(commit.tree()?))
    }

    fn head_oid(&self) -> Result<Option<Oid>, BackendError> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?.id())),
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Point HEAD at `oid`, preferring a local branch that is already there.
    fn move_head(&self, oid: Oid) -> Result<(), BackendError> {
        let current = self
            .repo
            .head()
            .ok()
            .filter(|h| h.is_branch() && h.target() == Some(oid))
            .and_then(|h| h.name().map(str::to_string));
        if let Some(name) = current {
            return Ok(self.repo.set_head(&name)?);
        }
        for branch in self.repo.branches(Some(BranchType::Local))? {
            let (branch, _) = branch?;
            let reference = branch.get();
            if reference.target() == Some(oid) {
                if let Some(name) = reference.name() {
                    return Ok(self.repo.set_head(name)?);
                }
            }
        }
        Ok(self.repo.set_head_detached(oid)?)
    }

    fn checkout(&self, revision: &str, builder: &mut CheckoutBuilder<'_>) -> Result<(), BackendError> {
        let object = self.repo.revparse_single(revision)?;
        let commit = object.peel_to_commit()?;
        self.repo.checkout_tree(commit.as_object(), Some(builder))?;
        self.move_head(commit.id())
    }

    /// Empty the working copy and leave HEAD on an unborn branch.
    fn checkout_null(&self) -> Result<(), BackendError> {
        let mut index = self.repo.index()?;
        for entry in index.iter() {
            let rel = String::from_utf8_lossy(&entry.path).into_owned();
            match std::fs::remove_file(self.root.join(&rel)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        index.clear()?;
        index.write()?;
        self.repo.set_head(NULL_BRANCH)?;
        Ok(())
    }

    fn signature(
        &self,
        user: Option<&str>,
        date: Option<DateTime<FixedOffset>>,
    ) -> Result<Signature<'static>, BackendError> {
        let (name, email) = match user {
            Some(user) => split_user(user),
            None => match self.repo.signature() {
                Ok(sig) => (
                    sig.name().unwrap_or("subsync").to_string(),
                    sig.email().unwrap_or("").to_string(),
                ),
                Err(_) => ("subsync".to_string(), String::new()),
            },
        };
        let sig = match date {
            Some(date) => Signature::new(
                &name,
                &email,
                &Time::new(date.timestamp(), date.offset().local_minus_utc() / 60),
            )?,
            None => Signature::now(&name, &email)?,
        };
        Ok(sig)
    }

    fn diff_between(&self, from: &str, to: Option<&str>) -> Result<git2::Diff<'_>, BackendError> {
        let old = self.commit_tree(from)?;
        let diff = match to {
            Some(to) => {
                let new = self.commit_tree(to)?;
                self.repo
                    .diff_tree_to_tree(old.as_ref(), new.as_ref(), None)?
            }
            None => self
                .repo
                .diff_tree_to_workdir_with_index(old.as_ref(), None)?,
        };
        Ok(diff)
    }
}

/// Split `"Name <email>"`; a bare string is taken as the name.
fn split_user(user: &str) -> (String, String) {
    match (user.find('<'), user.rfind('>')) {
        (Some(lt), Some(gt)) if lt < gt => (
            user[..lt].trim().to_string(),
            user[lt + 1..gt].trim().to_string(),
        ),
        _ => (user.trim().to_string(), String::new()),
    }
}

impl RepositoryAccess for Git2Repository {
    fn root(&self) -> &Path {
        &self.root
    }

    fn has_revision(&self, revision: &str) -> bool {
        revision.is_empty()
            || self
                .repo
                .revparse_single(revision)
                .and_then(|o| o.peel_to_commit())
                .is_ok()
    }

    #[instrument(skip(self), fields(path = %self.root.display()))]
    fn pull(&self, source: &str) -> Result<(), BackendError> {
        let mut remote = self.repo.remote_anonymous(source)?;
        remote.fetch(&FETCH_REFSPECS, None, None)?;
        debug!("fetch completed");
        Ok(())
    }

    fn working_parent(&self) -> Result<String, BackendError> {
        Ok(self.head_oid()?.map(|oid| oid.to_string()).unwrap_or_default())
    }

    fn has_uncommitted_changes(&self) -> Result<bool, BackendError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(false)
            .include_ignored(false)
            .exclude_submodules(true);
        let statuses = self.repo.statuses(Some(&mut opts))?;
        Ok(statuses.iter().any(|e| {
            let s = e.status();
            !s.is_empty() && !s.is_ignored() && !s.is_wt_new()
        }))
    }

    #[instrument(skip(self), fields(path = %self.root.display()))]
    fn clean_update(&self, revision: &str, overwrite: bool) -> Result<(), BackendError> {
        if !overwrite && self.has_uncommitted_changes()? {
            return Err(BackendError::DirtyWorkingCopy {
                path: self.root.display().to_string(),
            });
        }
        if revision.is_empty() {
            return self.checkout_null();
        }
        self.checkout(revision, CheckoutBuilder::new().force())?;
        debug!(revision, "checked out");
        Ok(())
    }

    fn update(&self, revision: &str) -> Result<(), BackendError> {
        if revision.is_empty() {
            return self.checkout_null();
        }
        self.checkout(revision, CheckoutBuilder::new().safe())
    }

    #[instrument(skip(self), fields(path = %self.root.display()))]
    fn merge(&self, revision: &str) -> Result<Vec<String>, BackendError> {
        let oid = self.repo.revparse_single(revision)?.peel_to_commit()?.id();
        let theirs = self.repo.find_annotated_commit(oid)?;
        let mut checkout = CheckoutBuilder::new();
        checkout.allow_conflicts(true).conflict_style_merge(true);
        self.repo.merge(&[&theirs], None, Some(&mut checkout))?;

        let index = self.repo.index()?;
        let mut conflicted = Vec::new();
        if index.has_conflicts() {
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
                if let Some(entry) = entry {
                    conflicted.push(String::from_utf8_lossy(&entry.path).into_owned());
                }
            }
        }
        info!(conflicts = conflicted.len(), "merged");
        Ok(conflicted)
    }

    fn ancestor(&self, a: &str, b: &str) -> Result<String, BackendError> {
        if a.is_empty() || b.is_empty() {
            return Ok(String::new());
        }
        let a = self.repo.revparse_single(a)?.peel_to_commit()?.id();
        let b = self.repo.revparse_single(b)?.peel_to_commit()?.id();
        match self.repo.merge_base(a, b) {
            Ok(base) => Ok(base.to_string()),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, message), fields(path = %self.root.display()))]
    fn commit(
        &self,
        message: &str,
        user: Option<&str>,
        date: Option<DateTime<FixedOffset>>,
    ) -> Result<Option<String>, BackendError> {
        let mut index = self.repo.index()?;
        index.update_all(["*"].iter(), None)?;
        for name in [SPEC_FILE, STATE_FILE] {
            if self.root.join(name).is_file() {
                index.add_path(Path::new(name))?;
            }
        }
        index.write()?;
        let tree = self.repo.find_tree(index.write_tree()?)?;

        let head = match self.head_oid()? {
            Some(oid) => Some(self.repo.find_commit(oid)?),
            None => None,
        };
        let merge_head = match self.repo.find_reference("MERGE_HEAD") {
            Ok(r) => r.target().map(|oid| self.repo.find_commit(oid)).transpose()?,
            Err(_) => None,
        };
        let unchanged = match &head {
            Some(head) => head.tree_id() == tree.id(),
            None => index.is_empty(),
        };
        if unchanged && merge_head.is_none() {
            debug!("nothing to commit");
            return Ok(None);
        }

        let sig = self.signature(user, date)?;
        let parents: Vec<&git2::Commit> = head.iter().chain(merge_head.iter()).collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        if merge_head.is_some() {
            self.repo.cleanup_state()?;
        }
        info!(sha = %oid, "created commit");
        Ok(Some(oid.to_string()))
    }

    #[instrument(skip(self), fields(path = %self.root.display()))]
    fn push(&self, dest: &str, force: bool) -> Result<bool, BackendError> {
        let mut refspecs = Vec::new();
        for branch in self.repo.branches(Some(BranchType::Local))? {
            let (branch, _) = branch?;
            if let Some(name) = branch.get().name() {
                let plus = if force { "+" } else { "" };
                refspecs.push(format!("{plus}{name}:{name}"));
            }
        }
        if refspecs.is_empty() {
            debug!("no branches to push");
            return Ok(true);
        }

        let rejected = RefCell::new(None::<String>);
        let mut callbacks = RemoteCallbacks::new();
        callbacks.push_update_reference(|refname, status| {
            if let Some(msg) = status {
                warn!(refname, msg, "push rejected");
                *rejected.borrow_mut() = Some(format!("{refname}: {msg}"));
            }
            Ok(())
        });
        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks);

        let mut remote = self.repo.remote_anonymous(dest)?;
        match remote.push(&refspecs, Some(&mut push_opts)) {
            Ok(()) => {}
            Err(e) if e.code() == ErrorCode::NotFastForward => {
                warn!(error = %e, "push rejected");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        drop(push_opts);
        let accepted = rejected.borrow().is_none();
        if accepted {
            info!("push completed");
        }
        Ok(accepted)
    }

    fn files(&self, revision: &str) -> Result<Vec<String>, BackendError> {
        let Some(tree) = self.commit_tree(revision)? else {
            return Ok(Vec::new());
        };
        let mut files = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    files.push(format!("{dir}{name}"));
                }
            }
            TreeWalkResult::Ok
        })?;
        Ok(files)
    }

    fn file_data(&self, revision: &str, name: &str) -> Result<Vec<u8>, BackendError> {
        let tree = self
            .commit_tree(revision)?
            .ok_or_else(|| git2::Error::from_str("null revision has no files"))?;
        let blob = tree
            .get_path(Path::new(name))?
            .to_object(&self.repo)?
            .peel_to_blob()?;
        Ok(blob.content().to_vec())
    }

    fn file_flags(&self, revision: &str, name: &str) -> Result<FileFlags, BackendError> {
        let tree = self
            .commit_tree(revision)?
            .ok_or_else(|| git2::Error::from_str("null revision has no files"))?;
        let entry = tree.get_path(Path::new(name))?;
        Ok(FileFlags::from_git_mode(entry.filemode() as u32))
    }

    fn snapshot(&self, revision: &str) -> Result<Box<dyn Snapshot + '_>, BackendError> {
        Ok(Box::new(CommitSnapshot {
            repo: &self.repo,
            tree: self.commit_tree(revision)?,
        }))
    }

    fn status(&self, from: &str, to: Option<&str>) -> Result<SubrepoStatus, BackendError> {
        let diff = self.diff_between(from, to)?;
        let mut status = SubrepoStatus::default();
        for delta in diff.deltas() {
            let file = delta
                .new_file()
                .path()
                .or(delta.old_file().path())
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            match delta.status() {
                git2::Delta::Added | git2::Delta::Untracked => status.added.push(file),
                git2::Delta::Deleted => status.removed.push(file),
                _ => status.modified.push(file),
            }
        }
        Ok(status)
    }

    fn diff(&self, from: &str, to: Option<&str>) -> Result<String, BackendError> {
        let diff = self.diff_between(from, to)?;
        let mut patch = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            if matches!(line.origin(), '+' | '-' | ' ') {
                patch.push(line.origin());
            }
            patch.push_str(&String::from_utf8_lossy(line.content()));
            true
        })?;
        Ok(patch)
    }
}

/// Files of one commit, for resolving nested subrepo state.
struct CommitSnapshot<'r> {
    repo: &'r Repository,
    tree: Option<Tree<'r>>,
}

impl Snapshot for CommitSnapshot<'_> {
    fn contains(&self, name: &str) -> bool {
        self.tree
            .as_ref()
            .is_some_and(|t| t.get_path(Path::new(name)).is_ok())
    }

    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        let not_found = || io::Error::new(ErrorKind::NotFound, format!("{name} not in commit"));
        let tree = self.tree.as_ref().ok_or_else(not_found)?;
        let entry = tree.get_path(Path::new(name)).map_err(|_| not_found())?;
        let blob = entry
            .to_object(self.repo)
            .and_then(|o| o.peel_to_blob())
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.message().to_string()))?;
        Ok(blob.content().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_with_file(dir: &Path, name: &str, content: &str) -> (Git2Repository, String) {
        let repo = Git2Repository::create(dir, &DefaultPaths::default()).unwrap();
        std::fs::write(dir.join(name), content).unwrap();
        let mut index = repo.repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let rev = repo
            .commit("initial", Some("Test <test@test.com>"), None)
            .unwrap()
            .unwrap();
        (repo, rev)
    }

    #[test]
    fn test_split_user() {
        assert_eq!(
            split_user("Jane Doe <jane@example.com>"),
            ("Jane Doe".to_string(), "jane@example.com".to_string())
        );
        assert_eq!(split_user("jane"), ("jane".to_string(), String::new()));
    }

    #[test]
    fn test_create_records_default_paths() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DefaultPaths {
            pull: Some("https://example.com/lib".into()),
            push: Some("ssh://example.com/lib".into()),
        };
        let repo = Git2Repository::create(&dir.path().join("lib"), &paths).unwrap();
        assert_eq!(repo.remote_url(false).as_deref(), Some("https://example.com/lib"));
        assert_eq!(repo.remote_url(true).as_deref(), Some("ssh://example.com/lib"));
    }

    #[test]
    fn test_commit_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, rev) = init_with_file(dir.path(), "hello.txt", "hello world");
        assert_eq!(repo.working_parent().unwrap(), rev);
        assert!(repo.has_revision(&rev));
        assert!(repo.has_revision(""));
        assert_eq!(repo.files(&rev).unwrap(), vec!["hello.txt".to_string()]);
        assert_eq!(repo.file_data(&rev, "hello.txt").unwrap(), b"hello world");
        assert_eq!(repo.file_flags(&rev, "hello.txt").unwrap(), FileFlags::default());

        let snap = repo.snapshot(&rev).unwrap();
        assert!(snap.contains("hello.txt"));
        assert!(!snap.contains(SPEC_FILE));
    }

    #[test]
    fn test_commit_date_and_author() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, _) = init_with_file(dir.path(), "a", "1");
        std::fs::write(dir.path().join("a"), "2").unwrap();
        let date = DateTime::parse_from_rfc3339("2024-05-01T12:00:00+02:00").unwrap();
        let rev = repo
            .commit("second", Some("Jane <jane@example.com>"), Some(date))
            .unwrap()
            .unwrap();
        let commit = repo.repo.find_commit(Oid::from_str(&rev).unwrap()).unwrap();
        assert_eq!(commit.author().email(), Some("jane@example.com"));
        assert_eq!(commit.author().when().seconds(), date.timestamp());
        assert_eq!(commit.author().when().offset_minutes(), 120);
    }

    #[test]
    fn test_null_checkout_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, rev) = init_with_file(dir.path(), "a.txt", "1");
        repo.clean_update("", true).unwrap();
        assert_eq!(repo.working_parent().unwrap(), "");
        assert!(!dir.path().join("a.txt").exists());

        repo.clean_update(&rev, false).unwrap();
        assert_eq!(repo.working_parent().unwrap(), rev);
        std::fs::write(dir.path().join("a.txt"), "changed").unwrap();
        let status = repo.status(&rev, None).unwrap();
        assert_eq!(status.modified, vec!["a.txt".to_string()]);
        assert!(repo.diff(&rev, None).unwrap().contains("+changed"));
    }

    #[test]
    fn test_ancestor_and_push() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dest.git");
        Repository::init_bare(&dest).unwrap();
        let (repo, first) = init_with_file(&dir.path().join("src"), "a", "1");
        std::fs::write(dir.path().join("src/a"), "2").unwrap();
        let second = repo.commit("second", None, None).unwrap().unwrap();

        assert_eq!(repo.ancestor(&first, &second).unwrap(), first);
        assert_eq!(repo.ancestor("", &second).unwrap(), "");

        assert!(repo.push(&dest.display().to_string(), false).unwrap());
        let pushed = Repository::open_bare(&dest).unwrap();
        assert!(pushed.find_commit(Oid::from_str(&second).unwrap()).is_ok());
    }

    #[test]
    fn test_unrelated_histories_resolve_to_empty_ancestor_state() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, first) = init_with_file(&dir.path().join("top"), crate::state::SPEC_FILE, "lib = ../lib\n");
        let other = Repository::init(dir.path().join("other")).unwrap();
        let sig = git2::Signature::now("Test", "test@test.com").unwrap();
        let tree_id = other.index().unwrap().write_tree().unwrap();
        let tree = other.find_tree(tree_id).unwrap();
        let unrelated = other.commit(Some("HEAD"), &sig, &sig, "root", &tree, &[]).unwrap();
        repo.pull(&dir.path().join("other").display().to_string()).unwrap();

        let base = repo.ancestor(&first, &unrelated.to_string()).unwrap();
        assert_eq!(base, "");
        let diag = crate::ui::TracingDiagnostics;
        let snapshot = repo.snapshot(&base).unwrap();
        assert!(crate::state::resolve(snapshot.as_ref(), &[], &diag).unwrap().is_empty());
        let snapshot = repo.snapshot(&first).unwrap();
        assert_eq!(crate::state::resolve(snapshot.as_ref(), &[], &diag).unwrap().len(), 1);
    }
}
