//! Classification of indexed entries into what to copy and what to delete.
use std::collections::HashMap;

use fdeploy::{path::Path, Config, Entry, LocalEntry, RemoteEntry, Rules};

/// Which attributes must match for a remote file to be up to date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compare {
    pub dates: bool,
    pub sizes: bool,
}

impl Compare {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dates: config.compare_file_dates,
            sizes: config.compare_file_sizes,
        }
    }
}

impl Default for Compare {
    fn default() -> Self {
        Self {
            dates: true,
            sizes: true,
        }
    }
}

/// Whether `local` must be transferred given the remote entry at the same path.
pub fn needs_copy(local: &LocalEntry, remote: Option<&Entry>, compare: Compare) -> bool {
    if local.is_always_overwrite() {
        return true;
    }
    let Some(remote) = remote else {
        return true;
    };
    remote.kind() != local.kind()
        || (compare.dates && remote.modified() != local.modified())
        || (compare.sizes && remote.size() != local.size())
}

/// Work to apply on the remote target, each list in path order
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    /// Files that may be copied while the site is serving
    pub online_copy: Vec<LocalEntry>,
    pub offline_copy: Vec<LocalEntry>,
    pub orphans: Vec<RemoteEntry>,
}

impl SyncPlan {
    pub fn new(
        local: &[LocalEntry],
        remote: &[RemoteEntry],
        rules: &Rules,
        compare: Compare,
    ) -> Self {
        let (online_copy, offline_copy) = copies(local, remote, compare);
        Self {
            online_copy,
            offline_copy,
            orphans: orphans(local, remote, rules),
        }
    }

    pub fn copy_len(&self) -> usize {
        self.online_copy.len() + self.offline_copy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.copy_len() == 0 && self.orphans.is_empty()
    }
}

/// Local files to copy, split into the online-safe and offline sets.
pub fn copies(
    local: &[LocalEntry],
    remote: &[RemoteEntry],
    compare: Compare,
) -> (Vec<LocalEntry>, Vec<LocalEntry>) {
    let remote: HashMap<&Path, &Entry> = remote.iter().map(|r| (r.path(), r.entry())).collect();

    let (mut online, mut offline): (Vec<_>, Vec<_>) = local
        .iter()
        .filter(|l| l.is_file())
        .filter(|l| needs_copy(l, remote.get(l.path()).copied(), compare))
        .cloned()
        .partition(|l| l.is_online_safe());
    online.sort_by(|a, b| a.path().cmp(b.path()));
    offline.sort_by(|a, b| a.path().cmp(b.path()));
    (online, offline)
}

/// Remote entries without local counterpart, pruned so that no directory
/// enclosing an ignored path is deleted and nothing is deleted twice.
pub fn orphans(local: &[LocalEntry], remote: &[RemoteEntry], rules: &Rules) -> Vec<RemoteEntry> {
    let local: HashMap<&Path, &LocalEntry> = local.iter().map(|l| (l.path(), l)).collect();

    let mut orphans: Vec<RemoteEntry> = remote
        .iter()
        .filter(|r| !r.is_deleted() && !local.contains_key(r.path()))
        .cloned()
        .collect();
    orphans.sort_by(|a, b| a.path().cmp(b.path()));

    orphans.retain(|o| {
        let keep = !(o.is_dir() && rules.encloses_ignored(o.path()));
        if !keep {
            log::debug!("keeping {} as it encloses an ignored path", o.path());
        }
        keep
    });

    let dirs: Vec<_> = orphans
        .iter()
        .filter(|o| o.is_dir())
        .map(|o| o.path().to_path_buf())
        .collect();
    orphans.retain(|o| !dirs.iter().any(|d| o.path().is_descendant_of(d)));
    orphans
}
