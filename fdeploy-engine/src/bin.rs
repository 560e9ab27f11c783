use std::{process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use fdeploy::{
    path::{FsPath, FsPathBuf},
    progress::{LogReporter, Reporter},
    Config,
};
use fdeploy_engine::{
    diff::SyncPlan,
    storage::{fs::FileSystem, smb, Connect},
    Deployment, RunState,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Talk SMB2 to the server
    Smb,
    /// Use a share mounted on this machine
    Mount,
}

#[derive(Parser)]
#[command(name = "fdeploy")]
#[command(author, version, about, long_about=None)]
struct Cli {
    /// Config file, or the NAME of `fdeploy-NAME.json`
    config: Option<String>,

    #[arg(long, value_enum, default_value_t = Backend::Smb)]
    backend: Backend,

    /// Mount point of the share, required with `--backend mount`
    #[arg(long)]
    mount_root: Option<FsPathBuf>,

    /// Print what would be done without changing the server
    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            log::error!("Could not start the runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    rt.block_on(async move {
        let cancel = CancellationToken::new();
        handle_shutdown_signals(cancel.clone());
        match run(Cli::parse(), cancel).await {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::FAILURE,
            Err(err) => {
                log::error!("{err:#}");
                ExitCode::FAILURE
            }
        }
    })
}

/// `None` is `fdeploy.json`, a `.json` name is taken as is, any other name
/// selects `fdeploy-<name>.json`.
fn config_file(arg: Option<&str>) -> FsPathBuf {
    match arg {
        None => FsPathBuf::from("fdeploy.json"),
        Some(name) if name.to_ascii_lowercase().ends_with(".json") => FsPathBuf::from(name),
        Some(name) => FsPathBuf::from(format!("fdeploy-{name}.json")),
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<bool> {
    let config_file = config_file(cli.config.as_deref());
    if !config_file.exists() {
        anyhow::bail!("No such config file: {config_file}");
    }
    log::info!("Found config file: {config_file}");

    let config = Config::load_from_file(&config_file).await?;
    log::trace!("Loaded config: {config:?}");

    match cli.backend {
        Backend::Smb => {
            let connector = smb::Connector::new(&config.server_connection);
            deploy(config, connector, cli.dry_run, &cancel).await
        }
        Backend::Mount => {
            let mount_root = cli
                .mount_root
                .as_deref()
                .context("--mount-root is required with the mount backend")?;
            let connector = FileSystem::new(absolute(mount_root)?)?;
            deploy(config, connector, cli.dry_run, &cancel).await
        }
    }
}

fn absolute(path: &FsPath) -> anyhow::Result<FsPathBuf> {
    if path.is_absolute() {
        return Ok(path.to_owned());
    }
    let cwd = FsPathBuf::try_from(std::env::current_dir()?)?;
    Ok(cwd.join(path))
}

async fn deploy<C: Connect>(
    config: Config,
    connector: C,
    dry_run: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<bool> {
    let state = Arc::new(RunState::with_parent(cancel));
    let reporter: Arc<dyn Reporter> = Arc::new(LogReporter);
    let deployment = Deployment::new(config, connector, state.clone(), reporter);

    if dry_run {
        let res = deployment.plan().await;
        print_errors(&state.errors());
        return match res {
            Ok(plan) => {
                print_plan(&plan);
                Ok(true)
            }
            Err(_) => Ok(false),
        };
    }

    let report = deployment.run().await;
    log::info!(
        "{:?}: {} file(s) copied, {} orphan(s) deleted",
        report.phase,
        report.copied,
        report.deleted
    );
    if report.marker_left {
        println!("The website is still offline, remove app_offline.htm once fixed");
    }
    print_errors(&report.errors);
    Ok(report.is_success())
}

fn print_plan(plan: &SyncPlan) {
    let sections = [
        ("Online copy", plan.online_copy.iter().map(|e| e.path()).collect::<Vec<_>>()),
        ("Offline copy", plan.offline_copy.iter().map(|e| e.path()).collect()),
        ("Orphans", plan.orphans.iter().map(|e| e.path()).collect()),
    ];
    for (title, paths) in sections {
        println!("{title} ({}):", paths.len());
        for path in paths {
            println!("  {path}");
        }
    }
}

fn print_errors(errors: &[String]) {
    if errors.is_empty() {
        return;
    }
    println!("Deployment failed:");
    for err in errors {
        println!("  • {err}");
    }
}

#[cfg(unix)]
fn handle_shutdown_signals(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sig_term, mut sig_int) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            _ => {
                log::warn!("Could not install signal handlers");
                return;
            }
        };

    tokio::spawn(async move {
        tokio::select! {
            _ = sig_term.recv() => {
                log::warn!("received SIGTERM");
            }
            _ = sig_int.recv() => {
                log::warn!("received SIGINT");
            }
        };
        cancel.cancel();
    });
}

#[cfg(not(unix))]
fn handle_shutdown_signals(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("received Ctrl-C");
            cancel.cancel();
        }
    });
}
