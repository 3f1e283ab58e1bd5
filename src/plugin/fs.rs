//! Filesystem access used by plugin discovery

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

/// What discovery cares about for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    Socket,
    Other,
}

pub trait Filesystem: Send + Sync {
    /// Classify `path`, following symlinks.
    fn stat(&self, path: &Path) -> io::Result<EntryKind>;

    /// Children of a directory, in no particular order.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// The real filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFilesystem;

impl Filesystem for LocalFilesystem {
    fn stat(&self, path: &Path) -> io::Result<EntryKind> {
        let file_type = std::fs::metadata(path)?.file_type();
        Ok(if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_socket() {
            EntryKind::Socket
        } else {
            EntryKind::Other
        })
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        std::fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect()
    }
}
