//! Destinations for archived subrepo content.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Receives the files of an archive one at a time.
pub trait ArchiveSink {
    /// Add `name` (a `/`-separated relative path). For symlinks `data` is
    /// the link target.
    fn add_file(&mut self, name: &str, mode: u32, symlink: bool, data: &[u8]) -> io::Result<()>;
}

/// Writes archived files below a directory on disk.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
    written: usize,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            written: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of files written so far.
    pub fn written(&self) -> usize {
        self.written
    }
}

impl ArchiveSink for DirectorySink {
    fn add_file(&mut self, name: &str, mode: u32, symlink: bool, data: &[u8]) -> io::Result<()> {
        let dest = self.root.join(name);
        if let Some(dir) = dest.parent() {
            std::fs::create_dir_all(dir)?;
        }
        debug!(file = %dest.display(), mode = format_args!("{mode:o}"), symlink, "archiving file");

        if symlink {
            write_symlink(&dest, data)?;
        } else {
            std::fs::write(&dest, data)?;
            set_mode(&dest, mode)?;
        }
        self.written += 1;
        Ok(())
    }
}

#[cfg(unix)]
fn write_symlink(dest: &Path, target: &[u8]) -> io::Result<()> {
    use std::os::unix::ffi::OsStrExt;
    std::os::unix::fs::symlink(std::ffi::OsStr::from_bytes(target), dest)
}

// no portable symlinks: store the target as file content
#[cfg(not(unix))]
fn write_symlink(dest: &Path, target: &[u8]) -> io::Result<()> {
    std::fs::write(dest, target)
}

#[cfg(unix)]
fn set_mode(dest: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_dest: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_sink_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = DirectorySink::new(dir.path());
        sink.add_file("lib/src/a.txt", 0o644, false, b"hello").unwrap();
        sink.add_file("lib/run.sh", 0o755, false, b"#!/bin/sh\n").unwrap();

        assert_eq!(std::fs::read(dir.path().join("lib/src/a.txt")).unwrap(), b"hello");
        assert_eq!(sink.written(), 2);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("lib/run.sh"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_sink_writes_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = DirectorySink::new(dir.path());
        sink.add_file("link", 0o644, true, b"target.txt").unwrap();
        assert_eq!(
            std::fs::read_link(dir.path().join("link")).unwrap(),
            PathBuf::from("target.txt")
        );
    }
}
