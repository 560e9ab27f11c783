//! Remote storage abstraction.
//!
//! Paths handed to storages are absolute within the remote namespace, that is
//! relative to the share root (or the mount root for [`fs::FileSystem`]).
use fdeploy::{path::Path, Entry, EntryKind};
use futures::{Future, Stream};
use tokio::io;

use crate::Shutdown;

pub mod fs;
pub mod smb;

pub trait Stat {
    /// Metadata of the entry at `path`, or `None` if it does not exist.
    fn stat(&self, path: &Path) -> impl Future<Output = fdeploy::Result<Option<Entry>>> + Send;
}

pub trait DirEntries {
    /// Lists the direct children of `parent_path`.
    /// Yielded entries carry their full path in the remote namespace.
    fn dir_entries(&self, parent_path: &Path)
        -> impl Stream<Item = fdeploy::Result<Entry>> + Send;
}

pub trait MkDir {
    /// Creates the directory at `path`. With `parents`, missing ancestors are
    /// created too. A directory that already exists is not an error.
    fn mkdir(&self, path: &Path, parents: bool) -> impl Future<Output = fdeploy::Result<()>> + Send;
}

pub trait WriteFile {
    /// Creates or truncates the file at `path` and fills it with `data`.
    /// Returns the number of bytes written.
    fn write_file(
        &self,
        path: &Path,
        data: impl io::AsyncRead + Send,
    ) -> impl Future<Output = fdeploy::Result<u64>> + Send;
}

pub trait SetMtime {
    /// Sets the last write time of `path`, in seconds since the Unix epoch.
    fn set_mtime(&self, path: &Path, mtime: i64) -> impl Future<Output = fdeploy::Result<()>> + Send;
}

/// A trait to delete files or folders
pub trait Delete {
    /// Deletes the file or folder pointed to by `path`.
    /// Only empty folders can be deleted. Deleting a missing entry succeeds.
    fn delete(&self, path: &Path, kind: EntryKind) -> impl Future<Output = fdeploy::Result<()>> + Send;
}

/// A trait for path-based remote storage
pub trait Storage:
    Stat + DirEntries + MkDir + WriteFile + SetMtime + Delete + Shutdown + Send + Sync + 'static
{
}

/// Opens new storage sessions.
///
/// Each copy worker owns its session, so a connector is asked for as many
/// sessions as there are concurrent workers.
pub trait Connect: Send + Sync + 'static {
    type Storage: Storage;

    fn connect(&self) -> impl Future<Output = fdeploy::Result<Self::Storage>> + Send;
}
