//! Locating subrepos relative to their parent.

use std::path::{Path, PathBuf};

use crate::errors::BackendError;

/// Non-owning description of the repository a subrepo is embedded in.
///
/// `default_path` / `default_push_path` are the parent's own absolute
/// pull / push locations; relative subrepo sources are joined onto them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    pub root: PathBuf,
    /// Path of `root` as seen from the outermost repository ("" at the top).
    pub relpath: String,
    pub default_path: Option<String>,
    pub default_push_path: Option<String>,
}

impl ParentRef {
    /// The outermost repository.
    pub fn top(
        root: impl Into<PathBuf>,
        default_path: Option<String>,
        default_push_path: Option<String>,
    ) -> Self {
        Self {
            root: root.into(),
            relpath: String::new(),
            default_path,
            default_push_path,
        }
    }

    /// Working directory of the subrepo at `path`.
    pub fn join(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Path of the subrepo at `path` as seen from the outermost repository.
    pub fn relpath_of(&self, path: &str) -> String {
        if self.relpath.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.relpath, path)
        }
    }

    /// The handle a subrepo at `path` declared with `source` passes to its
    /// own nested subrepos.
    pub fn child(&self, path: &str, source: &str) -> ParentRef {
        ParentRef {
            root: self.join(path),
            relpath: self.relpath_of(path),
            default_path: abs_source(self, source, false),
            default_push_path: abs_source(self, source, true),
        }
    }
}

/// Absolute pull (or push) location of a subrepo declared with `source`.
///
/// Absolute paths and URLs are returned unchanged; anything else is joined
/// onto the parent's location. Returns `None` when the parent has none.
pub fn abs_source(parent: &ParentRef, source: &str, push: bool) -> Option<String> {
    if source.starts_with('/') || source.contains("://") {
        return Some(source.to_string());
    }
    let base = if push {
        parent
            .default_push_path
            .as_deref()
            .or(parent.default_path.as_deref())
    } else {
        parent.default_path.as_deref()
    }?;

    if base.contains("://") {
        let base = base.strip_suffix('/').unwrap_or(base);
        Some(normalize_url(&format!("{base}/{source}")))
    } else {
        Some(normpath(&format!("{base}/{source}")))
    }
}

/// Like [`abs_source`], failing with `NoDefaultPath` when nothing is found.
pub fn require_abs_source(
    parent: &ParentRef,
    source: &str,
    push: bool,
    relpath: &str,
) -> Result<String, BackendError> {
    abs_source(parent, source, push).ok_or_else(|| BackendError::NoDefaultPath(relpath.to_string()))
}

/// Normalize the path component of `scheme://host/path?query#fragment`.
fn normalize_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let (netloc, tail) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => return url.to_string(),
    };
    let path_end = tail.find(|c: char| c == '?' || c == '#').unwrap_or(tail.len());
    let (path, suffix) = tail.split_at(path_end);
    format!("{scheme}://{netloc}{}{suffix}", normpath(path))
}

/// Lexical POSIX path normalization: collapses `.`, `..` and repeated
/// separators without touching the filesystem.
pub fn normpath(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => match parts.last().copied() {
                Some(last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Reject subrepo paths that would escape the parent working directory or
/// reach into repository metadata.
pub fn audit_path(path: &str) -> Result<(), BackendError> {
    let unsafe_path = || BackendError::UnsafePath(path.to_string());
    if path.is_empty() || Path::new(path).is_absolute() || path.starts_with('/') {
        return Err(unsafe_path());
    }
    for comp in path.split(['/', '\\']) {
        match comp {
            "" | "." | ".." => return Err(unsafe_path()),
            c if c.eq_ignore_ascii_case(".git") || c.eq_ignore_ascii_case(".svn") => {
                return Err(unsafe_path())
            }
            _ => {}
        }
    }
    Ok(())
}
