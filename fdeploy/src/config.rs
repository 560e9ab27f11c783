use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::path::{FsPath, FsPathBuf, PathBuf};

const OFFLINE_TEMPLATE: &str = include_str!("../res/app_offline.html");

fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub delete_orphans: bool,
    pub take_server_offline: bool,
    pub compare_file_dates: bool,
    pub compare_file_sizes: bool,
    pub server_offline_delay_seconds: u64,
    pub server_online_delay_seconds: u64,
    pub write_retry_delay_seconds: u64,
    pub retry_count: u32,
    pub max_thread_count: usize,
    pub server_connection: ServerConnection,
    pub paths: Paths,
    pub offline: Offline,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            delete_orphans: true,
            take_server_offline: true,
            compare_file_dates: true,
            compare_file_sizes: true,
            server_offline_delay_seconds: 0,
            server_online_delay_seconds: 0,
            write_retry_delay_seconds: 10,
            retry_count: 10,
            max_thread_count: default_thread_count(),
            server_connection: ServerConnection::default(),
            paths: Paths::default(),
            offline: Offline::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConnection {
    pub server_address: String,
    pub port: u16,
    pub share_name: String,
    /// Target directory within the share
    pub remote_root_path: PathBuf,
    pub domain: String,
    pub user_name: String,
    pub password: String,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
    /// Check that the share is listed by the server before connecting to it
    pub verify_share: bool,
}

impl Default for ServerConnection {
    fn default() -> Self {
        Self {
            server_address: String::new(),
            port: 445,
            share_name: String::new(),
            remote_root_path: PathBuf::root(),
            domain: String::new(),
            user_name: String::new(),
            password: String::new(),
            connect_timeout_ms: 5000,
            response_timeout_ms: 15000,
            verify_share: false,
        }
    }
}

impl ServerConnection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Paths {
    pub publish_path: FsPathBuf,
    pub online_copy_folder_paths: Vec<PathBuf>,
    pub online_copy_file_paths: Vec<PathBuf>,
    pub always_overwrite_paths: Vec<String>,
    pub always_overwrite_paths_with_recurse: Vec<String>,
    pub ignore_folder_paths: Vec<PathBuf>,
    pub ignore_file_paths: Vec<PathBuf>,
    pub ignore_folders_named: Vec<String>,
    pub ignore_files_named: Vec<String>,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            publish_path: FsPathBuf::from("bin/publish"),
            online_copy_folder_paths: Vec::new(),
            online_copy_file_paths: Vec::new(),
            always_overwrite_paths: Vec::new(),
            always_overwrite_paths_with_recurse: Vec::new(),
            ignore_folder_paths: Vec::new(),
            ignore_file_paths: Vec::new(),
            ignore_folders_named: Vec::new(),
            ignore_files_named: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Offline {
    pub meta_title: String,
    pub page_title: String,
    pub content_html: String,
}

impl Default for Offline {
    fn default() -> Self {
        Self {
            meta_title: "Unavailable for Maintenance".to_string(),
            page_title: "Unavailable for Maintenance".to_string(),
            content_html: "<p>The website is being updated and should be available shortly.</p><p><strong>Check back soon!</strong></p>".to_string(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Credentials {
    pub domain: String,
    pub user_name: String,
    pub password: String,
}

impl Config {
    pub async fn load_from_file(path: &FsPath) -> anyhow::Result<Self> {
        let config_json = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read config from {path}"))?;
        let config_json = std::str::from_utf8(&config_json)?;
        let mut config: Config = serde_json::from_str(config_json)
            .with_context(|| format!("Failed to parse config {path}"))?;

        if let Some(creds_path) = Self::find_credentials_file(path) {
            log::info!("Found credentials file: {creds_path}");
            let creds = tokio::fs::read(&creds_path)
                .await
                .with_context(|| format!("Failed to read credentials from {creds_path}"))?;
            let creds: Credentials = serde_json::from_slice(&creds)
                .with_context(|| format!("Failed to parse credentials {creds_path}"))?;
            config.apply_credentials(creds);
        }

        let base_dir = path.parent().unwrap_or(FsPath::new("."));
        config.normalize(base_dir);
        Ok(config)
    }

    /// Looks for `fdeploy-creds.json`, then `<config-stem>-creds.json`, next to
    /// the config file.
    pub fn find_credentials_file(config_path: &FsPath) -> Option<FsPathBuf> {
        let dir = config_path.parent().unwrap_or(FsPath::new("."));
        let shared = dir.join("fdeploy-creds.json");
        if shared.exists() {
            return Some(shared);
        }
        let stem = config_path.file_stem()?;
        let specific = dir.join(format!("{stem}-creds.json"));
        specific.exists().then_some(specific)
    }

    pub fn apply_credentials(&mut self, creds: Credentials) {
        let conn = &mut self.server_connection;
        conn.domain = creds.domain;
        conn.user_name = creds.user_name;
        conn.password = creds.password;
    }

    /// Resolves the publish path against `base_dir` and puts every path rule
    /// in normalized form.
    pub fn normalize(&mut self, base_dir: &FsPath) {
        if self.max_thread_count < 1 {
            self.max_thread_count = default_thread_count();
        }
        if self.paths.publish_path.is_relative() {
            self.paths.publish_path = base_dir.join(&self.paths.publish_path);
        }
        let paths = &mut self.paths;
        for rule in paths
            .always_overwrite_paths
            .iter_mut()
            .chain(paths.always_overwrite_paths_with_recurse.iter_mut())
        {
            *rule = normalize_rule(rule);
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.write_retry_delay_seconds)
    }

    pub fn offline_delay(&self) -> Duration {
        Duration::from_secs(self.server_offline_delay_seconds)
    }

    pub fn online_delay(&self) -> Duration {
        Duration::from_secs(self.server_online_delay_seconds)
    }

    /// The maintenance page placed on the server while it is offline
    pub fn render_offline_page(&self) -> String {
        OFFLINE_TEMPLATE
            .replace("{{MetaTitle}}", &self.offline.meta_title)
            .replace("{{PageTitle}}", &self.offline.page_title)
            .replace("{{PageHtml}}", &self.offline.content_html)
    }
}

/// Overwrite rules keep `~` as the root marker, everything else is a
/// normalized relative path.
fn normalize_rule(rule: &str) -> String {
    let trimmed = rule.trim();
    if trimmed == "~" {
        return trimmed.to_string();
    }
    PathBuf::from(trimmed).into_string()
}
