use std::sync::Mutex;

use dashmap::DashMap;
use fdeploy::{
    path::{Path, PathBuf},
    LocalEntry, RemoteEntry,
};
use tokio_util::sync::CancellationToken;

/// Mutable state of one deployment run.
///
/// Entry collections may be written concurrently by indexing and deletion
/// workers. The first fatal error cancels the run, and every error message is
/// kept for the final report.
#[derive(Debug, Default)]
pub struct RunState {
    cancel: CancellationToken,
    errors: Mutex<Vec<String>>,
    local: Mutex<Vec<LocalEntry>>,
    remote: DashMap<PathBuf, RemoteEntry>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A state cancelled together with `parent`
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            ..Self::default()
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Records a fatal error and cancels the run.
    pub fn fail(&self, msg: impl Into<String>) {
        let msg = msg.into();
        log::error!("{msg}");
        lock(&self.errors).push(msg);
        self.cancel.cancel();
    }

    pub fn errors(&self) -> Vec<String> {
        lock(&self.errors).clone()
    }

    pub fn push_local(&self, entry: LocalEntry) {
        lock(&self.local).push(entry);
    }

    /// Local entries in path order
    pub fn local_entries(&self) -> Vec<LocalEntry> {
        let mut entries = lock(&self.local).clone();
        entries.sort_by(|a, b| a.path().cmp(b.path()));
        entries
    }

    pub fn local_len(&self) -> usize {
        lock(&self.local).len()
    }

    pub fn insert_remote(&self, entry: RemoteEntry) {
        self.remote.insert(entry.path().to_path_buf(), entry);
    }

    pub fn remote(&self, path: &Path) -> Option<RemoteEntry> {
        self.remote.get(path).map(|e| e.clone())
    }

    /// Remote entries in path order
    pub fn remote_entries(&self) -> Vec<RemoteEntry> {
        let mut entries: Vec<_> = self.remote.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.path().cmp(b.path()));
        entries
    }

    pub fn remote_len(&self) -> usize {
        self.remote.len()
    }

    /// Remote entries strictly below `dir` that are not deleted yet
    pub fn remote_descendants(&self, dir: &Path) -> Vec<RemoteEntry> {
        let mut entries: Vec<_> = self
            .remote
            .iter()
            .filter(|e| !e.is_deleted() && e.path().is_descendant_of(dir))
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| a.path().cmp(b.path()));
        entries
    }

    pub fn mark_deleted(&self, path: &Path) {
        if let Some(mut entry) = self.remote.get_mut(path) {
            entry.mark_deleted();
        }
    }

    /// Drops the remote snapshot before indexing the server again.
    pub fn clear_remote(&self) {
        self.remote.clear();
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use fdeploy::Entry;

    use super::*;

    #[test]
    fn fail_records_and_cancels() {
        let state = RunState::new();
        assert!(!state.is_cancelled());
        state.fail("first");
        state.fail("second");
        assert!(state.is_cancelled());
        assert_eq!(state.errors(), ["first", "second"]);
    }

    #[test]
    fn parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let state = RunState::with_parent(&parent);
        parent.cancel();
        assert!(state.is_cancelled());
        assert!(state.errors().is_empty());
    }

    #[test]
    fn descendants_skip_deleted() {
        let state = RunState::new();
        let root = Path::new("site");
        for entry in [
            Entry::directory("old", 0),
            Entry::file("old/a.txt", 0, 1),
            Entry::directory("old/sub", 0),
            Entry::file("old/sub/b.txt", 0, 1),
            Entry::file("older.txt", 0, 1),
        ] {
            state.insert_remote(RemoteEntry::new(entry, root));
        }
        state.mark_deleted(Path::new("old\\a.txt"));

        let paths: Vec<_> = state
            .remote_descendants(Path::new("old"))
            .iter()
            .map(|e| e.path().to_string())
            .collect();
        assert_eq!(paths, ["old/sub", "old/sub/b.txt"]);
        assert!(state.remote(Path::new("old/a.txt")).unwrap().is_deleted());
    }
}
