use std::time::{Duration, SystemTime};

use async_stream::try_stream;
use fdeploy::{
    comparable_time,
    path::{FsPath, FsPathBuf, Path},
    Entry, EntryKind,
};
use futures::Stream;
use tokio::{fs, io};

use crate::Shutdown;

/// Storage backed by a locally mounted share
#[derive(Debug, Clone)]
pub struct FileSystem {
    root: FsPathBuf,
}

impl FileSystem {
    /// Build a new filesystem storage.
    /// Panics if [root] is not an absolute path.
    pub fn new<P>(root: P) -> anyhow::Result<Self>
    where
        P: AsRef<FsPath>,
    {
        let root = root.as_ref();
        assert!(root.is_absolute());
        let root = root.canonicalize_utf8()?;
        log::info!("Initializing FS storage in {root}");

        Ok(FileSystem { root })
    }

    pub fn root(&self) -> &FsPath {
        &self.root
    }

    fn fs_path(&self, path: &Path) -> FsPathBuf {
        path.to_fs_path(&self.root)
    }
}

impl super::Stat for FileSystem {
    async fn stat(&self, path: &Path) -> fdeploy::Result<Option<Entry>> {
        let fs_path = self.fs_path(path);
        match fs::metadata(&fs_path).await {
            Ok(metadata) => Ok(Some(map_metadata(path, &metadata)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl super::DirEntries for FileSystem {
    fn dir_entries(
        &self,
        parent_path: &Path,
    ) -> impl Stream<Item = fdeploy::Result<Entry>> + Send {
        let fs_base = self.fs_path(parent_path);
        log::trace!("listing entries of {fs_base}");
        try_stream! {
            let mut read_dir = fs::read_dir(&fs_base).await?;
            while let Some(direntry) = read_dir.next_entry().await? {
                let file_name = String::from_utf8(direntry.file_name().into_encoded_bytes())?;
                let path = parent_path.join(&file_name);
                let metadata = direntry.metadata().await?;
                yield map_metadata(&path, &metadata)?;
            }
        }
    }
}

impl super::MkDir for FileSystem {
    async fn mkdir(&self, path: &Path, parents: bool) -> fdeploy::Result<()> {
        let fs_path = self.fs_path(path);
        if fs_path.is_dir() {
            return Ok(());
        }
        log::info!("mkdir {}{}", if parents { "-p " } else { "" }, fs_path);
        let res = if parents {
            fs::create_dir_all(&fs_path).await
        } else {
            fs::create_dir(&fs_path).await
        };
        match res {
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists && fs_path.is_dir() => Ok(()),
            res => Ok(res?),
        }
    }
}

impl super::WriteFile for FileSystem {
    async fn write_file(&self, path: &Path, data: impl io::AsyncRead + Send) -> fdeploy::Result<u64> {
        let fs_path = self.fs_path(path);
        log::info!("writing {fs_path}");
        if fs_path.is_dir() {
            fdeploy::io_bail!("{path} is a directory: {fs_path}");
        }
        tokio::pin!(data);
        let mut f = fs::File::create(&fs_path).await?;
        let written = io::copy(&mut data, &mut f).await?;
        f.sync_all().await?;
        Ok(written)
    }
}

impl super::SetMtime for FileSystem {
    async fn set_mtime(&self, path: &Path, mtime: i64) -> fdeploy::Result<()> {
        let fs_path = self.fs_path(path);
        log::trace!("set mtime {mtime} on {fs_path}");
        let f = fs::OpenOptions::new().write(true).open(&fs_path).await?;
        let f = f.into_std().await;
        f.set_modified(system_time(mtime))?;
        Ok(())
    }
}

impl super::Delete for FileSystem {
    async fn delete(&self, path: &Path, kind: EntryKind) -> fdeploy::Result<()> {
        let fs_path = self.fs_path(path);
        log::info!("deleting {fs_path}");
        let res = match kind {
            EntryKind::File => fs::remove_file(&fs_path).await,
            EntryKind::Directory => fs::remove_dir(&fs_path).await,
        };
        match res {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            res => Ok(res?),
        }
    }
}

impl Shutdown for FileSystem {}

impl super::Storage for FileSystem {}

impl super::Connect for FileSystem {
    type Storage = FileSystem;

    async fn connect(&self) -> fdeploy::Result<FileSystem> {
        if !self.root.is_dir() {
            return Err(fdeploy::Error::Unreachable(format!(
                "{} is not a mounted directory",
                self.root
            )));
        }
        Ok(self.clone())
    }
}

pub(crate) fn system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

pub(crate) fn map_metadata(path: &Path, metadata: &std::fs::Metadata) -> fdeploy::Result<Entry> {
    let modified = comparable_time(metadata.modified()?);
    let created = metadata
        .created()
        .map(comparable_time)
        .unwrap_or(modified);
    let (kind, size) = if metadata.is_dir() {
        (EntryKind::Directory, 0)
    } else {
        (EntryKind::File, metadata.len())
    };
    Ok(Entry::new(path.to_path_buf(), kind, created, modified, size))
}
