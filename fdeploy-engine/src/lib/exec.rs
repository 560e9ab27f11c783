//! Bounded-concurrency application of copy and delete work on the remote target.
//!
//! Work items are grouped in batches of [`GROUP_SIZE`]. Each batch runs on
//! its own task with its own storage session, at most `concurrency` batches
//! at a time. Every remote mutation goes through the retry policy.
use std::{
    cmp::Reverse,
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use fdeploy::{
    local_error,
    path::Path,
    progress::{Event, Reporter, Stage},
    EntryKind, Error, LocalEntry, RemoteEntry,
};
use tokio::{fs, sync::Semaphore, task::JoinSet};

use crate::{
    diff::{needs_copy, Compare},
    retry::Policy,
    state::{lock, RunState},
    storage::{Connect, Delete, MkDir, SetMtime, Stat, WriteFile},
    Shutdown,
};

/// Number of work items handled in sequence by one worker
pub const GROUP_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub enum Job {
    Copy(LocalEntry),
    Delete(RemoteEntry),
}

impl Job {
    pub fn path(&self) -> &Path {
        match self {
            Job::Copy(entry) => entry.path(),
            Job::Delete(entry) => entry.path(),
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Copy(entry) => write!(f, "copy of `{}`", entry.path()),
            Job::Delete(entry) => write!(f, "deletion of `{}`", entry.path()),
        }
    }
}

/// What a run of the executor achieved
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub items: usize,
    pub bytes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    items: AtomicUsize,
    bytes: AtomicU64,
}

pub struct Executor<C: Connect> {
    inner: Arc<Inner<C>>,
    permits: Arc<Semaphore>,
}

struct Inner<C: Connect> {
    connector: C,
    idle: Mutex<Vec<C::Storage>>,
    policy: Policy,
    compare: Compare,
    state: Arc<RunState>,
    reporter: Arc<dyn Reporter>,
}

impl<C: Connect> Executor<C> {
    pub fn new(
        connector: C,
        policy: Policy,
        compare: Compare,
        concurrency: usize,
        state: Arc<RunState>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                idle: Mutex::new(Vec::new()),
                policy,
                compare,
                state,
                reporter,
            }),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Applies `jobs`, in order within each batch.
    ///
    /// The first failure is recorded in the run state, which cancels the
    /// run: batches not started yet are dropped and running ones stop
    /// before their next item.
    pub async fn run(&self, stage: Stage, jobs: Vec<Job>) -> Summary {
        let counters = Arc::new(Counters::default());
        let state = &self.inner.state;
        let mut workers = JoinSet::new();

        let mut jobs = jobs.into_iter().peekable();
        while jobs.peek().is_some() {
            let batch: Vec<Job> = jobs.by_ref().take(GROUP_SIZE).collect();
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = state.cancel_token().cancelled() => break,
            };
            let inner = self.inner.clone();
            let counters = counters.clone();
            workers.spawn(async move {
                let _permit = permit;
                inner.run_batch(stage, batch, &counters).await;
            });
        }

        while let Some(res) = workers.join_next().await {
            if let Err(err) = res {
                state.fail(format!("{stage} worker failed: {err}"));
            }
        }

        Summary {
            items: counters.items.load(Ordering::SeqCst),
            bytes: counters.bytes.load(Ordering::SeqCst),
        }
    }

    /// Writes the maintenance marker at `path`, replacing any previous one.
    pub async fn put_marker(&self, stage: Stage, path: &Path, content: &str) -> fdeploy::Result<()> {
        let inner = &self.inner;
        let session = inner.session().await?;
        let storage = &session;
        let res = inner
            .policy
            .run(
                inner.state.cancel_token(),
                move |_| async move {
                    storage.delete(path, EntryKind::File).await?;
                    if let Some(parent) = path.parent() {
                        storage.mkdir(parent, true).await?;
                    }
                    storage.write_file(path, content.as_bytes()).await?;
                    match storage.stat(path).await? {
                        Some(e) if e.size() == content.len() as u64 => Ok(()),
                        _ => Err(Error::Integrity(format!("`{path}` was not written"))),
                    }
                },
                |attempt, err| inner.retried(stage, path, attempt, err),
            )
            .await;
        inner.release(session);
        res
    }

    /// Deletes the maintenance marker at `path` and checks it is gone.
    pub async fn remove_marker(&self, stage: Stage, path: &Path) -> fdeploy::Result<()> {
        let inner = &self.inner;
        let storage = inner.session().await?;
        let res = inner.delete_path(&storage, stage, path, EntryKind::File).await;
        inner.release(storage);
        res
    }

    /// Closes every pooled session.
    pub async fn shutdown(&self) {
        let sessions = std::mem::take(&mut *lock(&self.inner.idle));
        for session in sessions {
            if let Err(err) = session.shutdown().await {
                log::warn!("Could not close storage session: {err}");
            }
        }
    }
}

impl<C: Connect> Inner<C> {
    async fn session(&self) -> fdeploy::Result<C::Storage> {
        let idle = lock(&self.idle).pop();
        match idle {
            Some(session) => Ok(session),
            None => self.connector.connect().await,
        }
    }

    fn release(&self, session: C::Storage) {
        lock(&self.idle).push(session);
    }

    fn report(&self, event: Event) {
        self.reporter.report(event);
    }

    fn retried(&self, stage: Stage, path: &Path, attempt: u32, err: &Error) {
        self.report(Event::Retry {
            stage,
            text: format!("{path}: {err}"),
            attempt,
            of: self.policy.attempts(),
        });
    }

    async fn run_batch(&self, stage: Stage, batch: Vec<Job>, counters: &Counters) {
        if self.state.is_cancelled() {
            return;
        }
        let storage = match self.session().await {
            Ok(storage) => storage,
            Err(err) => {
                self.state.fail(format!("Could not open a storage session: {err}"));
                return;
            }
        };

        for job in batch {
            if self.state.is_cancelled() {
                break;
            }
            self.report(Event::Item {
                stage,
                text: job.path().to_string(),
            });
            let res = match &job {
                Job::Copy(entry) => self.copy_file(&storage, stage, entry).await,
                Job::Delete(entry) => self.delete_entry(&storage, stage, entry).await.map(|_| 0),
            };
            match res {
                Ok(bytes) => {
                    counters.items.fetch_add(1, Ordering::SeqCst);
                    counters.bytes.fetch_add(bytes, Ordering::SeqCst);
                }
                Err(Error::Cancelled) => break,
                Err(err) => {
                    self.state.fail(format!("{stage} failed for {job}: {err}"));
                    break;
                }
            }
        }
        self.release(storage);
    }

    /// Copies `entry` unless the remote file turns out to be up to date.
    /// Returns the number of bytes transferred.
    async fn copy_file(
        &self,
        storage: &C::Storage,
        stage: Stage,
        entry: &LocalEntry,
    ) -> fdeploy::Result<u64> {
        let path = entry.remote_path();
        let compare = self.compare;
        self.policy
            .run(
                self.state.cancel_token(),
                move |_| async move {
                    let remote = storage.stat(path).await?;
                    if !needs_copy(entry, remote.as_ref(), compare) {
                        log::debug!("{path} is up to date");
                        return Ok(0);
                    }
                    if let Some(parent) = path.parent() {
                        storage.mkdir(parent, true).await?;
                    }
                    let file = fs::File::open(entry.fs_path())
                        .await
                        .map_err(|err| local_error!("Could not open `{}`: {err}", entry.fs_path()))?;
                    let written = storage.write_file(path, file).await?;
                    storage.set_mtime(path, entry.modified()).await?;

                    match storage.stat(path).await? {
                        Some(remote) if remote.is_file() && remote.size() == entry.size() => {
                            Ok(written)
                        }
                        Some(remote) => Err(Error::Integrity(format!(
                            "`{path}` has {} bytes on the server, {} expected",
                            remote.size(),
                            entry.size()
                        ))),
                        None => Err(Error::Integrity(format!("`{path}` missing after copy"))),
                    }
                },
                |attempt, err| self.retried(stage, path, attempt, err),
            )
            .await
    }

    /// Deletes an orphan. A directory is emptied first, from the indexed
    /// entries below it: files, then directories deepest first.
    async fn delete_entry(
        &self,
        storage: &C::Storage,
        stage: Stage,
        entry: &RemoteEntry,
    ) -> fdeploy::Result<()> {
        if entry.is_dir() {
            let (files, mut dirs): (Vec<_>, Vec<_>) = self
                .state
                .remote_descendants(entry.path())
                .into_iter()
                .partition(|e| e.is_file());
            dirs.sort_by_key(|d| Reverse(d.depth()));
            for e in files.iter().chain(dirs.iter()) {
                self.delete_path(storage, stage, e.remote_path(), e.kind())
                    .await?;
                self.state.mark_deleted(e.path());
            }
        }
        self.delete_path(storage, stage, entry.remote_path(), entry.kind())
            .await?;
        self.state.mark_deleted(entry.path());
        Ok(())
    }

    async fn delete_path(
        &self,
        storage: &C::Storage,
        stage: Stage,
        path: &Path,
        kind: EntryKind,
    ) -> fdeploy::Result<()> {
        self.policy
            .run(
                self.state.cancel_token(),
                move |_| async move {
                    storage.delete(path, kind).await?;
                    if storage.stat(path).await?.is_some() {
                        return Err(Error::Integrity(format!("`{path}` still exists after delete")));
                    }
                    Ok(())
                },
                |attempt, err| self.retried(stage, path, attempt, err),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fdeploy::{
        path::{FsPath, FsPathBuf},
        progress::LogReporter,
        Entry,
    };

    use super::*;
    use crate::{storage::fs::FileSystem, test_utils::temp_root};

    struct Fixture {
        root: FsPathBuf,
        publish: FsPathBuf,
        remote: FsPathBuf,
        state: Arc<RunState>,
        executor: Executor<FileSystem>,
    }

    impl Fixture {
        fn new(name: &str) -> Self {
            let root = temp_root(name);
            let publish = root.join("publish");
            let remote = root.join("remote");
            std::fs::create_dir_all(&publish).unwrap();
            std::fs::create_dir_all(&remote).unwrap();
            let state = Arc::new(RunState::new());
            let executor = Executor::new(
                FileSystem::new(&remote).unwrap(),
                Policy::new(3, Duration::from_millis(1)),
                Compare::default(),
                2,
                state.clone(),
                Arc::new(LogReporter),
            );
            Self {
                root,
                publish,
                remote,
                state,
                executor,
            }
        }

        fn local(&self, rel: &str, content: &str, mtime: i64) -> LocalEntry {
            let fs_path = self.publish.join(rel);
            std::fs::create_dir_all(fs_path.parent().unwrap()).unwrap();
            std::fs::write(&fs_path, content).unwrap();
            let f = std::fs::File::options().write(true).open(&fs_path).unwrap();
            f.set_modified(crate::storage::fs::system_time(mtime)).unwrap();
            LocalEntry::new(
                Entry::file(rel, mtime, content.len() as u64),
                &self.publish,
                Path::new("site"),
                false,
                false,
            )
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn read(root: &FsPath, rel: &str) -> String {
        std::fs::read_to_string(root.join(rel)).unwrap()
    }

    #[tokio::test]
    async fn copies_in_batches_and_skips_up_to_date() {
        let fx = Fixture::new("exec-copy");
        let mut jobs = Vec::new();
        for i in 0..25 {
            jobs.push(Job::Copy(fx.local(&format!("dir{}/f{i}.txt", i % 3), "content", 1_600_000_000)));
        }
        let summary = fx.executor.run(Stage::OfflineCopy, jobs.clone()).await;
        assert!(fx.state.errors().is_empty(), "{:?}", fx.state.errors());
        assert_eq!(summary, Summary { items: 25, bytes: 25 * 7 });
        assert_eq!(read(&fx.remote, "site/dir1/f4.txt"), "content");

        let meta = std::fs::metadata(fx.remote.join("site/dir2/f5.txt")).unwrap();
        assert_eq!(fdeploy::comparable_time(meta.modified().unwrap()), 1_600_000_000);

        // the recheck finds every file up to date
        let summary = fx.executor.run(Stage::OfflineCopy, jobs).await;
        assert_eq!(summary, Summary { items: 25, bytes: 0 });
        fx.executor.shutdown().await;
    }

    #[tokio::test]
    async fn missing_source_fails_without_retry() {
        let fx = Fixture::new("exec-missing");
        let entry = fx.local("gone.txt", "x", 0);
        std::fs::remove_file(entry.fs_path()).unwrap();

        let summary = fx.executor.run(Stage::OfflineCopy, vec![Job::Copy(entry)]).await;
        assert_eq!(summary.items, 0);
        assert!(fx.state.is_cancelled());
        let errors = fx.state.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("gone.txt"), "{}", errors[0]);
    }

    #[tokio::test]
    async fn directory_deletion_uses_indexed_descendants() {
        let fx = Fixture::new("exec-delete");
        for rel in ["site/old/a.txt", "site/old/sub/b.txt", "site/keep.txt"] {
            let p = fx.remote.join(rel);
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(p, "x").unwrap();
        }
        let root = Path::new("site");
        for entry in [
            Entry::directory("old", 0),
            Entry::file("old/a.txt", 0, 1),
            Entry::directory("old/sub", 0),
            Entry::file("old/sub/b.txt", 0, 1),
            Entry::file("keep.txt", 0, 1),
        ] {
            fx.state.insert_remote(RemoteEntry::new(entry, root));
        }
        let orphan = fx.state.remote(Path::new("old")).unwrap();

        let summary = fx.executor.run(Stage::DeleteOrphans, vec![Job::Delete(orphan)]).await;
        assert!(fx.state.errors().is_empty(), "{:?}", fx.state.errors());
        assert_eq!(summary.items, 1);
        assert!(!fx.remote.join("site/old").exists());
        assert!(fx.remote.join("site/keep.txt").exists());
        assert!(fx.state.remote(Path::new("old/sub/b.txt")).unwrap().is_deleted());
        assert!(fx.state.remote_descendants(Path::new("old")).is_empty());
    }

    #[tokio::test]
    async fn marker_is_written_then_removed() {
        let fx = Fixture::new("exec-marker");
        let marker = Path::new("site/app_offline.htm");
        fx.executor
            .put_marker(Stage::TakeOffline, marker, "<h1>down</h1>")
            .await
            .unwrap();
        assert_eq!(read(&fx.remote, "site/app_offline.htm"), "<h1>down</h1>");
        fx.executor
            .put_marker(Stage::TakeOffline, marker, "<h1>again</h1>")
            .await
            .unwrap();
        assert_eq!(read(&fx.remote, "site/app_offline.htm"), "<h1>again</h1>");

        fx.executor.remove_marker(Stage::BringOnline, marker).await.unwrap();
        assert!(!fx.remote.join("site/app_offline.htm").exists());
        fx.executor.remove_marker(Stage::BringOnline, marker).await.unwrap();
    }
}
