#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use fdeploy::{
    path::{FsPathBuf, Path, PathBuf},
    progress::{Event, LogReporter, Reporter, Stage},
    Config, MAINTENANCE_MARKER,
};
use fdeploy_engine::{diff::SyncPlan, Deployment, Report, RunState};

use crate::{stubs::fs::Stub, utils};

/// Keeps every event of a run, and logs them too
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn retries(&self, stage: Stage) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Retry { stage: s, .. } if *s == stage))
            .count()
    }

    pub fn downtime_reported(&self) -> bool {
        self.events()
            .iter()
            .any(|e| matches!(e, Event::Downtime(..)))
    }
}

impl Reporter for Recorder {
    fn report(&self, event: Event) {
        LogReporter.report(event.clone());
        self.events.lock().unwrap().push(event);
    }
}

pub struct Harness {
    pub root: FsPathBuf,
    pub config: Config,
    pub stub: Stub,
    pub recorder: Arc<Recorder>,
}

impl Harness {
    pub fn remote_root(&self) -> &Path {
        &self.config.server_connection.remote_root_path
    }

    pub fn server_path(&self, rel: &str) -> FsPathBuf {
        self.remote_root()
            .join(rel)
            .to_fs_path(&self.root.join("share"))
    }

    pub async fn server_content(&self, rel: &str) -> Option<String> {
        utils::file_content(&self.server_path(rel)).await.unwrap()
    }

    pub fn has_server(&self, rel: &str) -> bool {
        self.server_path(rel).exists()
    }

    pub fn has_marker(&self) -> bool {
        self.has_server(MAINTENANCE_MARKER)
    }

    fn deployment(&self) -> Deployment<Stub> {
        Deployment::new(
            self.config.clone(),
            self.stub.clone(),
            Arc::new(RunState::new()),
            self.recorder.clone(),
        )
    }

    pub async fn plan(&self) -> SyncPlan {
        self.deployment().plan().await.expect("Should not fail")
    }

    pub async fn run(&self) -> Report {
        self.deployment().run().await
    }

    /// Paths written to the server, with whether the site was offline then
    pub fn writes(&self) -> Vec<(PathBuf, bool)> {
        self.stub
            .writes()
            .into_iter()
            .map(|w| (w.path, w.offline))
            .collect()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

pub fn names<E: std::ops::Deref<Target = fdeploy::Entry>>(entries: &[E]) -> Vec<String> {
    entries.iter().map(|e| e.path().to_string()).collect()
}
