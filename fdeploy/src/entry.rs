//! Entries of the publish tree and of the remote target.
//!
//! An entry is identified by its path relative to the tree root. Two entries
//! with the same relative path are the same object, whatever tree they come
//! from, so equality and hashing only look at that path.
use std::{hash, ops};

use serde::{Deserialize, Serialize};

use crate::path::{FsPath, FsPathBuf, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    path: PathBuf,
    kind: EntryKind,
    created: i64,
    modified: i64,
    size: u64,
    deleted: bool,
}

impl Entry {
    pub fn new(path: PathBuf, kind: EntryKind, created: i64, modified: i64, size: u64) -> Self {
        let size = match kind {
            EntryKind::File => size,
            EntryKind::Directory => 0,
        };
        Self {
            path,
            kind,
            created,
            modified,
            size,
            deleted: false,
        }
    }

    pub fn file(path: impl Into<PathBuf>, modified: i64, size: u64) -> Self {
        Self::new(path.into(), EntryKind::File, modified, modified, size)
    }

    pub fn directory(path: impl Into<PathBuf>, modified: i64) -> Self {
        Self::new(path.into(), EntryKind::Directory, modified, modified, 0)
    }

    /// Path relative to the tree root, the identity of the entry
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.path.file_name().unwrap_or("")
    }

    /// Relative path of the parent directory, empty at the tree root
    pub fn parent(&self) -> &Path {
        self.path.parent().unwrap_or(Path::root())
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.segments()
    }

    pub fn depth(&self) -> usize {
        self.path.depth()
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Creation time, seconds since the Unix epoch
    pub fn created(&self) -> i64 {
        self.created
    }

    /// Last write time, seconds since the Unix epoch
    pub fn modified(&self) -> i64 {
        self.modified
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Entry {}

impl hash::Hash for Entry {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.path.hash(state)
    }
}

/// An entry of the local publish tree
#[derive(Debug, Clone)]
pub struct LocalEntry {
    entry: Entry,
    fs_path: FsPathBuf,
    remote_path: PathBuf,
    online_safe: bool,
    always_overwrite: bool,
}

impl LocalEntry {
    /// `remote_root` is the target directory within the remote namespace.
    pub fn new(
        entry: Entry,
        publish_root: &FsPath,
        remote_root: &Path,
        online_safe: bool,
        always_overwrite: bool,
    ) -> Self {
        let fs_path = entry.path().to_fs_path(publish_root);
        let remote_path = remote_root.join(entry.path());
        Self {
            entry,
            fs_path,
            remote_path,
            online_safe,
            always_overwrite,
        }
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Absolute path on the local file system
    pub fn fs_path(&self) -> &FsPath {
        &self.fs_path
    }

    /// Where this entry lands in the remote namespace
    pub fn remote_path(&self) -> &Path {
        &self.remote_path
    }

    /// May be copied while the site is still serving
    pub fn is_online_safe(&self) -> bool {
        self.online_safe
    }

    /// Copied regardless of date and size comparison
    pub fn is_always_overwrite(&self) -> bool {
        self.always_overwrite
    }
}

impl ops::Deref for LocalEntry {
    type Target = Entry;
    fn deref(&self) -> &Entry {
        &self.entry
    }
}

/// An entry of the remote target tree
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    entry: Entry,
    remote_path: PathBuf,
}

impl RemoteEntry {
    pub fn new(entry: Entry, remote_root: &Path) -> Self {
        let remote_path = remote_root.join(entry.path());
        Self { entry, remote_path }
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Absolute path in the remote namespace
    pub fn remote_path(&self) -> &Path {
        &self.remote_path
    }

    pub fn mark_deleted(&mut self) {
        self.entry.mark_deleted();
    }
}

impl ops::Deref for RemoteEntry {
    type Target = Entry;
    fn deref(&self) -> &Entry {
        &self.entry
    }
}

macro_rules! impl_identity {
    ($($lhs:ty => $rhs:ty),*) => {
        $(
            impl PartialEq<$rhs> for $lhs {
                fn eq(&self, other: &$rhs) -> bool {
                    self.path() == other.path()
                }
            }
        )*
    };
}

impl_identity!(
    LocalEntry => LocalEntry,
    RemoteEntry => RemoteEntry,
    LocalEntry => RemoteEntry,
    RemoteEntry => LocalEntry
);

impl Eq for LocalEntry {}
impl Eq for RemoteEntry {}

impl hash::Hash for LocalEntry {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.path().hash(state)
    }
}

impl hash::Hash for RemoteEntry {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.path().hash(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_ignores_origin_and_separators() {
        let local = LocalEntry::new(
            Entry::file("wwwroot\\css\\site.css", 10, 100),
            FsPath::new("/tmp/publish"),
            Path::new("sites/www"),
            false,
            false,
        );
        let remote = RemoteEntry::new(Entry::file("wwwroot/css/site.css", 20, 5), Path::new("sites/www"));
        assert!(local == remote);
        assert!(remote == local);
        assert_eq!(local.remote_path(), remote.remote_path());
        assert_eq!(local.fs_path(), FsPath::new("/tmp/publish/wwwroot/css/site.css"));
        assert_eq!(remote.remote_path(), Path::new("sites/www/wwwroot/css/site.css"));
    }

    #[test]
    fn entry_accessors() {
        let e = Entry::file("a/b/c.txt", 3, 12);
        assert_eq!(e.name(), "c.txt");
        assert_eq!(e.parent(), Path::new("a/b"));
        assert_eq!(e.depth(), 3);
        assert_eq!(e.segments().collect::<Vec<_>>(), ["a", "b", "c.txt"]);

        let d = Entry::new(PathBuf::from("a"), EntryKind::Directory, 1, 2, 42);
        assert_eq!(d.size(), 0);
        assert_eq!(d.parent(), Path::root());
    }
}
