use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use fdeploy::{
    path::{FsPath, FsPathBuf, Path, PathBuf},
    Entry, EntryKind, Error, MAINTENANCE_MARKER,
};
use fdeploy_engine::{
    storage::{self, fs::FileSystem, Delete, DirEntries, MkDir, SetMtime, Stat, WriteFile},
    Shutdown,
};
use futures::{Future, Stream};
use tokio::io;

/// A write that reached the server
#[derive(Debug, Clone)]
pub struct Write {
    pub path: PathBuf,
    /// The maintenance marker was on the server at that time
    pub offline: bool,
}

#[derive(Debug, Default)]
struct Faults {
    /// Remaining failures of writes to a file, by file name
    write_failures: HashMap<String, u32>,
    write_attempts: HashMap<String, u32>,
    writes: Vec<Write>,
}

/// Mounted-share storage that records writes and injects write failures
#[derive(Debug, Clone)]
pub struct Stub {
    inner: FileSystem,
    marker: FsPathBuf,
    faults: Arc<Mutex<Faults>>,
}

impl Stub {
    /// `root` is the share root, `remote_root` the deployment target in it
    pub fn new(root: &FsPath, remote_root: &Path) -> anyhow::Result<Self> {
        let inner = FileSystem::new(root)?;
        let marker = remote_root.join(MAINTENANCE_MARKER).to_fs_path(inner.root());
        Ok(Self {
            inner,
            marker,
            faults: Arc::default(),
        })
    }

    /// Writes to files named `name` fail `times` times with a transient error.
    pub fn fail_writes(&self, name: &str, times: u32) {
        self.faults
            .lock()
            .unwrap()
            .write_failures
            .insert(name.to_string(), times);
    }

    pub fn write_attempts(&self, name: &str) -> u32 {
        let faults = self.faults.lock().unwrap();
        faults.write_attempts.get(name).copied().unwrap_or(0)
    }

    pub fn writes(&self) -> Vec<Write> {
        self.faults.lock().unwrap().writes.clone()
    }

    pub fn reset(&self) {
        *self.faults.lock().unwrap() = Faults::default();
    }
}

impl storage::Stat for Stub {
    fn stat(&self, path: &Path) -> impl Future<Output = fdeploy::Result<Option<Entry>>> + Send {
        self.inner.stat(path)
    }
}

impl storage::DirEntries for Stub {
    fn dir_entries(
        &self,
        parent_path: &Path,
    ) -> impl Stream<Item = fdeploy::Result<Entry>> + Send {
        self.inner.dir_entries(parent_path)
    }
}

impl storage::MkDir for Stub {
    fn mkdir(&self, path: &Path, parents: bool) -> impl Future<Output = fdeploy::Result<()>> + Send {
        self.inner.mkdir(path, parents)
    }
}

impl storage::WriteFile for Stub {
    async fn write_file(&self, path: &Path, data: impl io::AsyncRead + Send) -> fdeploy::Result<u64> {
        let name = path.file_name().unwrap_or_default().to_string();
        {
            let mut faults = self.faults.lock().unwrap();
            *faults.write_attempts.entry(name.clone()).or_default() += 1;
            if let Some(remaining) = faults.write_failures.get_mut(&name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::Io(format!("injected failure writing {path}")));
                }
            }
            if name != MAINTENANCE_MARKER {
                let offline = self.marker.exists();
                faults.writes.push(Write {
                    path: path.to_path_buf(),
                    offline,
                });
            }
        }
        self.inner.write_file(path, data).await
    }
}

impl storage::SetMtime for Stub {
    fn set_mtime(&self, path: &Path, mtime: i64) -> impl Future<Output = fdeploy::Result<()>> + Send {
        self.inner.set_mtime(path, mtime)
    }
}

impl storage::Delete for Stub {
    fn delete(&self, path: &Path, kind: EntryKind) -> impl Future<Output = fdeploy::Result<()>> + Send {
        self.inner.delete(path, kind)
    }
}

impl Shutdown for Stub {}

impl storage::Storage for Stub {}

impl storage::Connect for Stub {
    type Storage = Stub;

    async fn connect(&self) -> fdeploy::Result<Stub> {
        Ok(self.clone())
    }
}
