use crate::{
    cache::{ContentCache, DiskCache},
    fetch::RetryPolicy,
    util::ProgressTarget,
    PathBuf,
};
use anyhow::Context as _;
use std::{sync::Arc, time::Duration};

/// Shared state for a pipeline run: the cache collaborator, the HTTP agent,
/// the retry policy and the worker pool bound.
pub struct Ctx {
    pub cache: Arc<dyn ContentCache>,
    pub agent: ureq::Agent,
    pub retry: RetryPolicy,
    /// Worker pool size, zero means one thread per core
    pub concurrency: usize,
    pub draw_target: ProgressTarget,
    /// Keeps a throwaway cache directory alive for the life of the context
    tempdir: Option<tempfile::TempDir>,
}

fn build_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .user_agent(concat!("winsplat/", env!("CARGO_PKG_VERSION")))
        .timeout_connect(Duration::from_secs(30))
        .timeout_read(Duration::from_secs(60))
        .build()
}

impl Ctx {
    /// Context backed by a persistent cache directory
    pub fn with_dir(cache_dir: PathBuf, draw_target: ProgressTarget) -> anyhow::Result<Self> {
        Ok(Self {
            cache: Arc::new(DiskCache::new(cache_dir)?),
            agent: build_agent(),
            retry: RetryPolicy::default(),
            concurrency: 0,
            draw_target,
            tempdir: None,
        })
    }

    /// Context whose cache vanishes when the context is dropped
    pub fn with_temp(draw_target: ProgressTarget) -> anyhow::Result<Self> {
        let td = tempfile::TempDir::new().context("unable to create temp dir")?;
        let root = PathBuf::from_path_buf(td.path().to_owned())
            .map_err(|pb| anyhow::anyhow!("temp dir {} is not utf-8", pb.display()))?;

        Ok(Self {
            cache: Arc::new(DiskCache::new(root)?),
            agent: build_agent(),
            retry: RetryPolicy::default(),
            concurrency: 0,
            draw_target,
            tempdir: Some(td),
        })
    }

    /// Context over a caller supplied cache, used by tests and embedders
    pub fn with_cache(cache: Arc<dyn ContentCache>, draw_target: ProgressTarget) -> Self {
        Self {
            cache,
            agent: build_agent(),
            retry: RetryPolicy::default(),
            concurrency: 0,
            draw_target,
            tempdir: None,
        }
    }
}

impl Drop for Ctx {
    fn drop(&mut self) {
        if let Some(td) = self.tempdir.take() {
            let _ = td.close();
        }
    }
}
