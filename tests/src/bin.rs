#![cfg(test)]

use std::sync::{Arc, Once};

use dataset::Dataset;
use fdeploy::{config, path::PathBuf, Config};

mod dataset;
mod harness;
mod utils;
mod stubs {
    pub mod fs;
}
mod tests;

use harness::{Harness, Recorder};

static LOG_INIT: Once = Once::new();

/// Configuration the dataset is written for: `assets` is online-safe, `bin`
/// always overwritten, `logs` and `uploads/keep` preserved on the server.
fn base_config(root: &fdeploy::path::FsPath) -> Config {
    let mut config = Config {
        retry_count: 3,
        write_retry_delay_seconds: 0,
        max_thread_count: 4,
        ..Config::default()
    };
    config.server_connection.remote_root_path = PathBuf::from("www");
    config.paths = config::Paths {
        publish_path: root.join("publish"),
        online_copy_folder_paths: vec!["assets".into()],
        always_overwrite_paths: vec!["bin".into()],
        ignore_folder_paths: vec!["uploads/keep".into()],
        ignore_folders_named: vec!["logs".into()],
        ..config::Paths::default()
    };
    config
}

async fn harness<D: Into<Dataset>>(dataset: D) -> Harness {
    harness_with(dataset, |_| ()).await
}

async fn harness_with<D, F>(dataset: D, configure: F) -> Harness
where
    D: Into<Dataset>,
    F: FnOnce(&mut Config),
{
    LOG_INIT.call_once(env_logger::init);

    let dataset = dataset.into();

    let root = utils::temp_path(Some("fdeploy-it"), None);
    tokio::fs::create_dir(&root).await.unwrap();

    let mut config = base_config(&root);
    configure(&mut config);

    let share = root.join("share");
    let server = config
        .server_connection
        .remote_root_path
        .to_fs_path(&share);
    dataset.create_fs(&root.join("publish"), &server).await;

    let stub = stubs::fs::Stub::new(&share, &config.server_connection.remote_root_path).unwrap();

    Harness {
        root,
        config,
        stub,
        recorder: Arc::new(Recorder::default()),
    }
}
