//! Path rules applied while indexing: what to skip, what may be copied while
//! the site is serving, and what is always overwritten.
use std::collections::HashSet;

use crate::config;
use crate::path::{Path, PathBuf};
use crate::MAINTENANCE_MARKER;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Overwrite {
    /// `~` or empty rule
    Root { recurse: bool },
    Dir { path: PathBuf, recurse: bool },
}

impl Overwrite {
    fn parse(rule: &str, recurse: bool) -> Self {
        let rule = rule.trim();
        if rule == "~" || Path::new(rule).is_root() {
            Overwrite::Root { recurse }
        } else {
            Overwrite::Dir {
                path: PathBuf::from(rule),
                recurse,
            }
        }
    }

    /// `parent` is the relative path of the directory holding the file
    fn matches(&self, parent: &Path) -> bool {
        match self {
            Overwrite::Root { recurse: true } => true,
            Overwrite::Root { recurse: false } => parent.is_root(),
            Overwrite::Dir {
                path,
                recurse: false,
            } => eq_ignore_case(parent, path),
            Overwrite::Dir {
                path,
                recurse: true,
            } => starts_with_ignore_case(parent, path),
        }
    }
}

fn eq_ignore_case(lhs: &Path, rhs: &Path) -> bool {
    lhs.depth() == rhs.depth() && starts_with_ignore_case(lhs, rhs)
}

fn starts_with_ignore_case(path: &Path, base: &Path) -> bool {
    let mut segs = path.segments();
    base.segments()
        .all(|b| segs.next().map_or(false, |s| s.eq_ignore_ascii_case(b)))
}

#[derive(Debug, Clone, Default)]
pub struct Rules {
    ignore_folder_paths: Vec<PathBuf>,
    ignore_file_paths: Vec<PathBuf>,
    ignore_folders_named: HashSet<String>,
    ignore_files_named: HashSet<String>,
    online_folders: Vec<PathBuf>,
    online_files: Vec<PathBuf>,
    overwrite: Vec<Overwrite>,
}

impl Rules {
    pub fn new(paths: &config::Paths) -> Self {
        let overwrite = paths
            .always_overwrite_paths
            .iter()
            .map(|r| Overwrite::parse(r, false))
            .chain(
                paths
                    .always_overwrite_paths_with_recurse
                    .iter()
                    .map(|r| Overwrite::parse(r, true)),
            )
            .collect();
        Self {
            ignore_folder_paths: paths.ignore_folder_paths.clone(),
            ignore_file_paths: paths.ignore_file_paths.clone(),
            ignore_folders_named: paths.ignore_folders_named.iter().cloned().collect(),
            ignore_files_named: paths.ignore_files_named.iter().cloned().collect(),
            online_folders: paths.online_copy_folder_paths.clone(),
            online_files: paths.online_copy_file_paths.clone(),
            overwrite,
        }
    }

    /// Whether the directory at `path` is skipped, along with everything below it.
    pub fn ignore_dir(&self, path: &Path) -> bool {
        if self.ignore_folder_paths.iter().any(|p| p == path) {
            return true;
        }
        path.file_name()
            .map_or(false, |name| self.ignore_folders_named.contains(name))
    }

    /// Whether the file at `path` is skipped. The maintenance marker always is.
    pub fn ignore_file(&self, path: &Path) -> bool {
        if self.ignore_file_paths.iter().any(|p| p == path) {
            return true;
        }
        match path.file_name() {
            Some(name) => name == MAINTENANCE_MARKER || self.ignore_files_named.contains(name),
            None => false,
        }
    }

    /// The file may be copied while the site is still serving.
    pub fn is_online_safe(&self, path: &Path) -> bool {
        self.online_folders.iter().any(|f| path.starts_with(f))
            || self.online_files.iter().any(|f| f == path)
    }

    /// The file is copied whatever the date and size comparison says.
    /// Rules match on the parent directory of the file.
    pub fn is_always_overwrite(&self, path: &Path) -> bool {
        let parent = path.parent().unwrap_or(Path::root());
        self.overwrite.iter().any(|rule| rule.matches(parent))
    }

    /// Whether deleting the directory at `path` would also remove a path the
    /// operator asked to keep.
    pub fn encloses_ignored(&self, path: &Path) -> bool {
        self.ignore_folder_paths
            .iter()
            .any(|ignored| ignored.is_descendant_of(path))
    }
}
