//! Indexing of the publish tree and of the remote target.
use std::sync::Arc;

use fdeploy::{
    other_error,
    path::{FsPath, Path, PathBuf},
    Entry, Error, LocalEntry, RemoteEntry, Rules,
};
use futures::{future::BoxFuture, TryStreamExt};
use tokio::{fs, sync::Semaphore, task::JoinSet};
use tokio_stream::{wrappers::ReadDirStream, StreamExt};

use crate::{
    state::RunState,
    storage::{fs::map_metadata, DirEntries, Stat, Storage},
};

struct LocalWalk<'a> {
    publish_root: &'a FsPath,
    remote_root: &'a Path,
    rules: &'a Rules,
    state: &'a RunState,
}

/// Walks the publish tree into `state`.
///
/// An entry that cannot be read fails the run. Directories are pushed
/// before their content.
pub async fn index_local(
    publish_root: &FsPath,
    remote_root: &Path,
    rules: &Rules,
    state: &RunState,
) {
    if !publish_root.is_dir() {
        state.fail(format!(
            "Publish path `{publish_root}` is not a directory"
        ));
        return;
    }
    let walk = LocalWalk {
        publish_root,
        remote_root,
        rules,
        state,
    };
    local_recurse(&walk, PathBuf::root()).await;
    log::debug!("{} local entries indexed", state.local_len());
}

fn local_recurse<'a>(walk: &'a LocalWalk<'a>, dir: PathBuf) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        let fs_dir = dir.to_fs_path(walk.publish_root);
        let mut read_dir = match fs::read_dir(&fs_dir).await {
            Ok(read_dir) => ReadDirStream::new(read_dir),
            Err(err) => {
                walk.state.fail(format!("Could not list `{fs_dir}`: {err}"));
                return;
            }
        };
        let mut children = Vec::new();
        while let Some(direntry) = read_dir.next().await {
            match direntry {
                Ok(direntry) => children.push(direntry),
                Err(err) => {
                    walk.state.fail(format!("Could not list `{fs_dir}`: {err}"));
                    break;
                }
            }
        }
        children.sort_by_key(|direntry| direntry.file_name());

        for direntry in children {
            if walk.state.is_cancelled() {
                return;
            }
            let name = match direntry.file_name().into_string() {
                Ok(name) => name,
                Err(name) => {
                    walk.state.fail(format!(
                        "Non UTF-8 file name in `{fs_dir}`: {}",
                        name.to_string_lossy()
                    ));
                    continue;
                }
            };
            let path = dir.join(&name);
            let metadata = match fs::metadata(direntry.path()).await {
                Ok(metadata) => metadata,
                Err(err) => {
                    walk.state.fail(format!("Could not read `{path}`: {err}"));
                    continue;
                }
            };
            if is_hidden(&name, &metadata) {
                log::trace!("skipping hidden {path}");
                continue;
            }
            let entry = match map_metadata(&path, &metadata) {
                Ok(entry) => entry,
                Err(err) => {
                    walk.state.fail(format!("Could not read `{path}`: {err}"));
                    continue;
                }
            };

            let ignored = if entry.is_dir() {
                walk.rules.ignore_dir(&path)
            } else {
                walk.rules.ignore_file(&path)
            };
            if ignored {
                log::debug!("ignoring {path}");
                continue;
            }

            let is_dir = entry.is_dir();
            walk.state.push_local(LocalEntry::new(
                entry,
                walk.publish_root,
                walk.remote_root,
                walk.rules.is_online_safe(&path),
                walk.rules.is_always_overwrite(&path),
            ));
            if is_dir {
                local_recurse(walk, path).await;
            }
        }
    })
}

#[cfg(windows)]
fn is_hidden(name: &str, metadata: &std::fs::Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    name.starts_with('.') || metadata.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0
}

#[cfg(not(windows))]
fn is_hidden(name: &str, _metadata: &std::fs::Metadata) -> bool {
    name.starts_with('.')
}

struct RemoteWalk<S> {
    storage: Arc<S>,
    root: PathBuf,
    rules: Arc<Rules>,
    state: Arc<RunState>,
    permits: Semaphore,
}

/// Walks the remote target into `state`, with paths relative to `remote_root`.
///
/// Sibling directories are listed concurrently, at most `concurrency`
/// listings at a time. A missing root is an empty tree.
pub async fn index_remote<S>(
    storage: Arc<S>,
    remote_root: &Path,
    rules: Arc<Rules>,
    state: Arc<RunState>,
    concurrency: usize,
) -> fdeploy::Result<()>
where
    S: Storage,
{
    match storage.stat(remote_root).await? {
        None => {
            log::info!("Remote root `{remote_root}` does not exist yet");
            return Ok(());
        }
        Some(root) if !root.is_dir() => {
            return Err(Error::Path(
                remote_root.to_path_buf(),
                "Remote root is not a directory".into(),
            ));
        }
        Some(_) => (),
    }

    let walk = Arc::new(RemoteWalk {
        storage,
        root: remote_root.to_path_buf(),
        rules,
        state: state.clone(),
        permits: Semaphore::new(concurrency.max(1)),
    });
    remote_recurse(walk, remote_root.to_path_buf()).await?;
    log::debug!("{} remote entries indexed", state.remote_len());
    Ok(())
}

fn remote_recurse<S>(walk: Arc<RemoteWalk<S>>, dir: PathBuf) -> BoxFuture<'static, fdeploy::Result<()>>
where
    S: Storage,
{
    Box::pin(async move {
        if walk.state.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let entries: Vec<Entry> = {
            let _permit = walk
                .permits
                .acquire()
                .await
                .map_err(|err| other_error!("{err}"))?;
            walk.storage.dir_entries(&dir).try_collect().await?
        };

        let mut set = JoinSet::new();
        for entry in entries {
            let Some(path) = entry.path().strip_prefix(&walk.root) else {
                log::warn!("{} listed outside of {}", entry.path(), walk.root);
                continue;
            };
            let ignored = if entry.is_dir() {
                walk.rules.ignore_dir(&path)
            } else {
                walk.rules.ignore_file(&path)
            };
            if ignored {
                log::debug!("ignoring remote {path}");
                continue;
            }
            let relative = Entry::new(
                path,
                entry.kind(),
                entry.created(),
                entry.modified(),
                entry.size(),
            );
            walk.state.insert_remote(RemoteEntry::new(relative, &walk.root));
            if entry.is_dir() {
                set.spawn(remote_recurse(walk.clone(), entry.path().to_path_buf()));
            }
        }

        while let Some(res) = set.join_next().await {
            res.map_err(|err| other_error!("remote indexing task failed: {err}"))??;
        }
        Ok(())
    })
}
