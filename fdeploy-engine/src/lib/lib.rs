#![allow(async_fn_in_trait)]

use futures::{future, Future};

pub mod deploy;
pub mod diff;
pub mod exec;
pub mod index;
pub mod retry;
pub mod state;
pub mod storage;

pub use deploy::{Deployment, Phase, Report};
pub use state::RunState;

/// Releases the resources held by a storage session.
pub trait Shutdown: Sync + Send + 'static {
    fn shutdown(&self) -> impl Future<Output = fdeploy::Result<()>> + Send {
        future::ready(Ok(()))
    }
}

#[cfg(test)]
mod test_utils {
    use fdeploy::path::FsPathBuf;
    use rand::{distributions::Alphanumeric, Rng};

    /// A fresh directory under the system temp dir
    pub fn temp_root(prefix: &str) -> FsPathBuf {
        let rnd: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(7)
            .map(char::from)
            .collect();
        let p = std::env::temp_dir().join(format!("fdeploy-{prefix}-{rnd}"));
        std::fs::create_dir_all(&p).unwrap();
        FsPathBuf::try_from(p).unwrap()
    }
}
