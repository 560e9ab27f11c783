use std::time::{Duration, SystemTime};

use fdeploy::path::{FsPath, Path, PathBuf};
use futures::future::BoxFuture;

mod build {
    #[derive(Debug, Copy, Clone)]
    pub enum Entry {
        Dir {
            /// Name of the directory
            name: &'static str,
            /// Entries of the directory
            entries: &'static [Entry],
        },
        File {
            /// Name of the file
            name: &'static str,
            /// Content of the file
            content: &'static str,
            /// Age of the file in seconds, relative to the dataset reference time
            age: u32,
        },
    }

    #[rustfmt::skip]
    pub const PUBLISH: &[Entry] = &[
        Entry::File{name: "index.html", content: "<html>v2</html>", age: 0},
        Entry::File{name: "logo.png", content: "PNG", age: 3600},
        Entry::Dir{name: "assets", entries: &[
            Entry::File{name: "app.css", content: "body{}", age: 0},
        ]},
        Entry::Dir{name: "bin", entries: &[
            Entry::File{name: "Web.dll", content: "dll v2", age: 3600},
        ]},
    ];

    #[rustfmt::skip]
    pub const SERVER: &[Entry] = &[
        Entry::File{name: "index.html", content: "<html>v1</html>", age: 7200},
        Entry::File{name: "logo.png", content: "PNG", age: 3600},
        Entry::File{name: "old.txt", content: "old", age: 7200},
        Entry::Dir{name: "bin", entries: &[
            Entry::File{name: "Web.dll", content: "dll v1", age: 3600},
        ]},
        Entry::Dir{name: "logs", entries: &[
            Entry::File{name: "today.log", content: "GET /", age: 0},
        ]},
        Entry::Dir{name: "stale", entries: &[
            Entry::File{name: "a.txt", content: "a", age: 7200},
            Entry::Dir{name: "deep", entries: &[
                Entry::File{name: "b.txt", content: "b", age: 7200},
            ]},
        ]},
        Entry::Dir{name: "uploads", entries: &[
            Entry::File{name: "tmp.txt", content: "tmp", age: 7200},
            Entry::Dir{name: "keep", entries: &[
                Entry::File{name: "u.bin", content: "user data", age: 7200},
            ]},
        ]},
    ];
}

#[derive(Debug, Clone)]
pub enum Entry {
    Dir {
        name: String,
        entries: Vec<Entry>,
    },
    File {
        name: String,
        content: String,
        age: u32,
    },
}

impl Entry {
    pub fn name(&self) -> &str {
        match self {
            Entry::Dir { name, .. } => name,
            Entry::File { name, .. } => name,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            Entry::File { content, .. } => Some(content.as_str()),
            _ => None,
        }
    }
}

impl From<build::Entry> for Entry {
    fn from(e: build::Entry) -> Self {
        match e {
            build::Entry::Dir { name, entries } => Entry::Dir {
                name: name.into(),
                entries: entries.iter().map(|e| (*e).into()).collect(),
            },
            build::Entry::File { name, content, age } => Entry::File {
                name: name.into(),
                content: content.into(),
                age,
            },
        }
    }
}

fn resolve_entry<'a>(entries: &'a mut [Entry], path: &Path) -> Option<&'a mut Entry> {
    let mut segments = path.segments();
    let first = segments.next()?;
    let mut entry = entries.iter_mut().find(|e| e.name() == first)?;
    for name in segments {
        entry = match entry {
            Entry::Dir { entries, .. } => entries.iter_mut().find(|e| e.name() == name)?,
            Entry::File { .. } => return None,
        };
    }
    Some(entry)
}

/// A publish tree and a server tree, written with file times relative to
/// a fixed reference so both sides compare deterministically.
pub struct Dataset {
    pub publish: Vec<Entry>,
    pub server: Vec<Entry>,
    pub mtime_ref: SystemTime,
}

impl Default for Dataset {
    fn default() -> Self {
        Self {
            publish: build::PUBLISH.iter().map(|e| (*e).into()).collect(),
            server: build::SERVER.iter().map(|e| (*e).into()).collect(),
            mtime_ref: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        }
    }
}

pub enum Patch {
    /// Writes a file, creating missing directories
    Put(PathBuf, String, u32),
    Delete(PathBuf),
}

impl Patch {
    pub fn apply(self, root_entries: &mut Vec<Entry>) {
        match self {
            Patch::Put(path, new_content, new_age) => {
                let mut entries = root_entries;
                let mut segments: Vec<&str> = path.segments().collect();
                let name = segments.pop().expect("Expected a file name");
                for dir in segments {
                    let pos = match entries.iter().position(|e| e.name() == dir) {
                        Some(pos) => pos,
                        None => {
                            entries.push(Entry::Dir {
                                name: dir.into(),
                                entries: Vec::new(),
                            });
                            entries.len() - 1
                        }
                    };
                    entries = match &mut entries[pos] {
                        Entry::Dir { entries, .. } => entries,
                        Entry::File { .. } => panic!("Expected a directory"),
                    };
                }
                entries.retain(|e| e.name() != name);
                entries.push(Entry::File {
                    name: name.into(),
                    content: new_content,
                    age: new_age,
                });
            }
            Patch::Delete(path) => {
                let file_name = path.file_name().expect("Expected a file name");
                let parent_entries = match path.parent() {
                    None => root_entries,
                    Some(parent) if parent.is_root() => root_entries,
                    Some(parent) => match resolve_entry(root_entries, parent) {
                        Some(Entry::Dir { entries, .. }) => entries,
                        _ => panic!("Expected a directory as parent entry"),
                    },
                };
                let prev_len = parent_entries.len();
                parent_entries.retain(|e| e.name() != file_name);
                assert!(
                    prev_len == parent_entries.len() + 1,
                    "Expected to delete an entry"
                );
            }
        }
    }
}

#[test]
fn test_patch_apply() {
    let mut entries = build::SERVER.iter().map(|e| (*e).into()).collect::<Vec<_>>();

    Patch::Put("stale/deep/b.txt".into(), "new".into(), 0).apply(&mut entries);
    Patch::Put("fresh/dir/c.txt".into(), "c".into(), 0).apply(&mut entries);
    Patch::Delete("uploads/keep".into()).apply(&mut entries);
    Patch::Delete("old.txt".into()).apply(&mut entries);

    assert_eq!(
        Some("new"),
        resolve_entry(&mut entries, Path::new("stale/deep/b.txt"))
            .unwrap()
            .content()
    );
    assert_eq!(
        Some("c"),
        resolve_entry(&mut entries, Path::new("fresh/dir/c.txt"))
            .unwrap()
            .content()
    );
    assert!(resolve_entry(&mut entries, Path::new("uploads/keep")).is_none());
    assert!(resolve_entry(&mut entries, Path::new("old.txt")).is_none());
    assert!(resolve_entry(&mut entries, Path::new("uploads/tmp.txt")).is_some());
}

impl Dataset {
    pub fn apply_publish(mut self, patch: Patch) -> Self {
        patch.apply(&mut self.publish);
        self
    }

    pub fn apply_server(mut self, patch: Patch) -> Self {
        patch.apply(&mut self.server);
        self
    }

    /// Writes the publish tree into `publish` and the server tree into `server`.
    pub async fn create_fs(&self, publish: &FsPath, server: &FsPath) {
        tokio::fs::create_dir_all(publish).await.unwrap();
        tokio::fs::create_dir_all(server).await.unwrap();
        for entry in self.publish.iter() {
            entry.create_fs(publish, self.mtime_ref).await;
        }
        for entry in self.server.iter() {
            entry.create_fs(server, self.mtime_ref).await;
        }
    }
}

impl Entry {
    pub fn create_fs<'a>(&'a self, path: &'a FsPath, now: SystemTime) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            match self {
                Entry::Dir { name, entries } => {
                    let path = path.join(name);
                    tokio::fs::create_dir(&path).await.unwrap();
                    for entry in entries.iter() {
                        entry.create_fs(&path, now).await;
                    }
                }
                Entry::File { name, content, age } => {
                    let path = path.join(name);
                    tokio::fs::write(&path, content.as_bytes()).await.unwrap();
                    let f = std::fs::File::options().write(true).open(&path).unwrap();
                    f.set_modified(now - Duration::from_secs(*age as u64))
                        .unwrap();
                }
            }
        })
    }
}
