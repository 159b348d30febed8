//! Read-only views of a parent repository snapshot.
//!
//! The state resolver only needs two things from a snapshot: whether a file
//! is part of it, and the file's content. A file can be part of a snapshot
//! and still fail to read with `NotFound` (tracked, but deleted from the
//! working copy); the resolver treats that case as "no entries".

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

/// A read-only repository context.
pub trait Snapshot {
    /// True if `name` (a `/`-separated path) belongs to the snapshot.
    fn contains(&self, name: &str) -> bool;

    /// Content of `name`.
    fn read(&self, name: &str) -> io::Result<Vec<u8>>;
}

/// The checked-out working directory of a parent repository.
#[derive(Debug, Clone)]
pub struct WorkingDir {
    root: PathBuf,
}

impl WorkingDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Snapshot for WorkingDir {
    fn contains(&self, name: &str) -> bool {
        self.root.join(name).symlink_metadata().is_ok()
    }

    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.root.join(name))
    }
}

/// An in-memory snapshot.
///
/// Entries set to `None` are tracked but missing, which is how a file deleted
/// from a working copy looks to the resolver.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    files: BTreeMap<String, Option<Vec<u8>>>,
}

impl MemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: &str, data: impl Into<Vec<u8>>) -> Self {
        self.insert(name, data);
        self
    }

    pub fn insert(&mut self, name: &str, data: impl Into<Vec<u8>>) {
        self.files.insert(name.to_string(), Some(data.into()));
    }

    /// Keep `name` listed in the snapshot but make reads fail with `NotFound`.
    pub fn mark_deleted(&mut self, name: &str) {
        self.files.insert(name.to_string(), None);
    }
}

impl Snapshot for MemorySnapshot {
    fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        match self.files.get(name) {
            Some(Some(data)) => Ok(data.clone()),
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{name} not found in snapshot"),
            )),
        }
    }
}
