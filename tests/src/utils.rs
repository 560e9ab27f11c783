use fdeploy::path::{FsPath, FsPathBuf};
use tokio::io;

pub fn temp_path(prefix: Option<&str>, ext: Option<&str>) -> FsPathBuf {
    use rand::{distributions::Alphanumeric, Rng};

    let mut filename = String::new();
    if let Some(prefix) = prefix {
        filename.push_str(prefix);
        filename.push('-');
    }
    let rnd: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(7)
        .map(char::from)
        .collect();
    filename.push_str(&rnd);
    if let Some(ext) = ext {
        filename.push('.');
        filename.push_str(ext);
    }
    let mut p = std::env::temp_dir();
    p.push(filename);
    p.try_into().unwrap()
}

/// Content of a file, or `None` if it does not exist
pub async fn file_content(path: &FsPath) -> anyhow::Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Modification time of a file in seconds since the Unix epoch
pub fn mtime(path: &FsPath) -> i64 {
    let modified = std::fs::metadata(path).unwrap().modified().unwrap();
    fdeploy::comparable_time(modified)
}
