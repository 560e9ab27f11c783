//! Two-phase delivery of the publish tree with a minimal offline window.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use fdeploy::{
    path::{Path, PathBuf},
    progress::{Event, Reporter, Stage},
    Config, Error, Rules, MAINTENANCE_MARKER,
};

use crate::{
    diff::{self, Compare, SyncPlan},
    exec::{Executor, Job, Summary},
    index,
    retry::Policy,
    state::RunState,
    storage::Connect,
    Shutdown,
};

/// Where a deployment run stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Online,
    OnlineCopy,
    Offline,
    OfflineCopy,
    OrphanCleanup,
    Done,
    Cancelled,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Cancelled | Phase::Failed)
    }
}

/// Outcome of [`Deployment::run`]
#[derive(Debug, Clone)]
pub struct Report {
    /// `Done`, `Cancelled` or `Failed`
    pub phase: Phase,
    /// Last phase entered before the run ended
    pub reached: Phase,
    pub copied: usize,
    pub bytes: u64,
    pub deleted: usize,
    /// Time the site spent behind the maintenance marker
    pub downtime: Option<Duration>,
    /// The marker is still on the server
    pub marker_left: bool,
    pub errors: Vec<String>,
}

impl Report {
    pub fn is_success(&self) -> bool {
        self.phase == Phase::Done
    }
}

pub struct Deployment<C: Connect> {
    config: Config,
    rules: Arc<Rules>,
    compare: Compare,
    state: Arc<RunState>,
    reporter: Arc<dyn Reporter>,
    executor: Executor<C>,
}

struct StageTimer {
    stage: Stage,
    start: Instant,
}

impl<C: Connect> Deployment<C> {
    pub fn new(
        config: Config,
        connector: C,
        state: Arc<RunState>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let rules = Arc::new(Rules::new(&config.paths));
        let compare = Compare::from_config(&config);
        let executor = Executor::new(
            connector,
            Policy::from_config(&config),
            compare,
            config.max_thread_count,
            state.clone(),
            reporter.clone(),
        );
        Self {
            config,
            rules,
            compare,
            state,
            reporter,
            executor,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    fn remote_root(&self) -> &Path {
        &self.config.server_connection.remote_root_path
    }

    fn marker_path(&self) -> PathBuf {
        self.remote_root().join(MAINTENANCE_MARKER)
    }

    fn start(&self, stage: Stage) -> StageTimer {
        self.reporter.report(Event::StageStarted(stage));
        StageTimer {
            stage,
            start: Instant::now(),
        }
    }

    fn finish(&self, timer: StageTimer, summary: Summary) {
        self.reporter.report(Event::StageFinished {
            stage: timer.stage,
            success: !self.state.is_cancelled(),
            elapsed: timer.start.elapsed(),
            items: summary.items,
            bytes: summary.bytes,
        });
    }

    /// Indexes both trees and computes the work to apply.
    /// Nothing is changed on the server.
    pub async fn plan(&self) -> fdeploy::Result<SyncPlan> {
        self.index_local().await;
        if self.state.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.index_remote().await?;
        Ok(SyncPlan::new(
            &self.state.local_entries(),
            &self.state.remote_entries(),
            &self.rules,
            self.compare,
        ))
    }

    async fn index_local(&self) {
        let timer = self.start(Stage::IndexLocal);
        index::index_local(
            &self.config.paths.publish_path,
            self.remote_root(),
            &self.rules,
            &self.state,
        )
        .await;
        let items = self.state.local_len();
        self.finish(timer, Summary { items, bytes: 0 });
    }

    async fn index_remote(&self) -> fdeploy::Result<()> {
        let timer = self.start(Stage::IndexRemote);
        let res = self.index_remote_with_session().await;
        if let Err(err) = &res {
            if !matches!(err, Error::Cancelled) {
                self.state.fail(format!("Could not index the server: {err}"));
            }
        }
        let items = self.state.remote_len();
        self.finish(timer, Summary { items, bytes: 0 });
        res
    }

    async fn index_remote_with_session(&self) -> fdeploy::Result<()> {
        let storage = Arc::new(self.executor.connector().connect().await?);
        let res = index::index_remote(
            storage.clone(),
            self.remote_root(),
            self.rules.clone(),
            self.state.clone(),
            self.config.max_thread_count,
        )
        .await;
        if let Err(err) = storage.shutdown().await {
            log::warn!("Could not close the indexing session: {err}");
        }
        res
    }

    /// Waits for `delay`, or until the run is cancelled.
    async fn pause(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        log::info!("Waiting {}s", delay.as_secs());
        tokio::select! {
            _ = self.state.cancel_token().cancelled() => (),
            _ = tokio::time::sleep(delay) => (),
        }
    }

    async fn copy(&self, stage: Stage, entries: Vec<fdeploy::LocalEntry>, report: &mut Report) {
        let timer = self.start(stage);
        let jobs = entries.into_iter().map(Job::Copy).collect();
        let summary = self.executor.run(stage, jobs).await;
        report.copied += summary.items;
        report.bytes += summary.bytes;
        self.finish(timer, summary);
    }

    async fn take_offline(&self) -> fdeploy::Result<()> {
        let timer = self.start(Stage::TakeOffline);
        let page = self.config.render_offline_page();
        let res = self
            .executor
            .put_marker(Stage::TakeOffline, &self.marker_path(), &page)
            .await;
        if let Err(err) = &res {
            if !matches!(err, Error::Cancelled) {
                self.state.fail(format!("Could not take the website offline: {err}"));
            }
        }
        self.finish(timer, Summary::default());
        res
    }

    async fn delete_orphans(&self, report: &mut Report) {
        self.state.clear_remote();
        if self.index_remote().await.is_err() {
            return;
        }
        let orphans = diff::orphans(
            &self.state.local_entries(),
            &self.state.remote_entries(),
            &self.rules,
        );
        let timer = self.start(Stage::DeleteOrphans);
        let jobs = orphans.into_iter().map(Job::Delete).collect();
        let summary = self.executor.run(Stage::DeleteOrphans, jobs).await;
        report.deleted += summary.items;
        self.finish(timer, summary);
    }

    async fn bring_online(&self) -> fdeploy::Result<()> {
        let timer = self.start(Stage::BringOnline);
        let res = self
            .executor
            .remove_marker(Stage::BringOnline, &self.marker_path())
            .await;
        if let Err(err) = &res {
            if !matches!(err, Error::Cancelled) {
                self.state.fail(format!("Could not bring the website online: {err}"));
            }
        }
        self.finish(timer, Summary::default());
        res
    }

    /// Runs the whole deployment.
    ///
    /// Once the marker is placed it is removed only when every step
    /// succeeded, so a failed run leaves the site offline.
    pub async fn run(&self) -> Report {
        let mut report = Report {
            phase: Phase::Online,
            reached: Phase::Online,
            copied: 0,
            bytes: 0,
            deleted: 0,
            downtime: None,
            marker_left: false,
            errors: Vec::new(),
        };
        self.run_phases(&mut report).await;
        self.executor.shutdown().await;

        report.errors = self.state.errors();
        report.phase = if !report.errors.is_empty() {
            Phase::Failed
        } else if self.state.is_cancelled() {
            Phase::Cancelled
        } else {
            Phase::Done
        };
        if report.marker_left {
            log::warn!("The maintenance marker is still on the server");
        }
        report
    }

    async fn run_phases(&self, report: &mut Report) {
        let plan = match self.plan().await {
            Ok(plan) => plan,
            Err(_) => return,
        };
        log::info!(
            "{} file(s) to copy ({} online), {} orphan(s)",
            plan.copy_len(),
            plan.online_copy.len(),
            plan.orphans.len()
        );

        if !plan.online_copy.is_empty() {
            report.reached = Phase::OnlineCopy;
            self.copy(Stage::OnlineCopy, plan.online_copy, report).await;
            if self.state.is_cancelled() {
                return;
            }
        }

        let mut offline_since = None;
        if self.config.take_server_offline {
            report.reached = Phase::Offline;
            if self.take_offline().await.is_err() {
                return;
            }
            report.marker_left = true;
            offline_since = Some(Instant::now());
            self.pause(self.config.offline_delay()).await;
            if self.state.is_cancelled() {
                return;
            }
        }

        report.reached = Phase::OfflineCopy;
        self.copy(Stage::OfflineCopy, plan.offline_copy, report).await;
        if self.state.is_cancelled() {
            return;
        }

        if self.config.delete_orphans {
            report.reached = Phase::OrphanCleanup;
            self.delete_orphans(report).await;
            if self.state.is_cancelled() {
                return;
            }
        }

        report.reached = Phase::Online;
        if let Some(since) = offline_since {
            if self.bring_online().await.is_err() {
                return;
            }
            report.marker_left = false;
            self.pause(self.config.online_delay()).await;
            let downtime = since.elapsed();
            report.downtime = Some(downtime);
            self.reporter.report(Event::Downtime(downtime));
        }
    }
}
