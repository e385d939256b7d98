//! The run-wide configuration context.
//!
//! ybd-style orchestrators keep a process-global settings dictionary; mason
//! instead threads one [`Settings`] value through the scheduler, resolver,
//! sandbox, and stores. The only mutable state it carries is the registry of
//! live sandbox directories, which the retry handler clears between passes.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use bon::Builder;
use color_eyre::{Result, eyre::Context};
use tracing::{instrument, trace};
use url::Url;

use crate::{fs, keys::CacheKey};

/// Configuration for one orchestrator run.
#[derive(Clone, Debug, Builder)]
pub struct Settings {
    /// The architecture artifacts are built for.
    ///
    /// Components declaring a different `arch` are skipped.
    #[builder(into, default = std::env::consts::ARCH.to_string())]
    pub arch: String,

    /// Directory holding artifact blobs, build logs, and unpack directories.
    #[builder(into)]
    pub artifacts: PathBuf,

    /// Directory holding bare source mirrors, one per sanitised remote name.
    #[builder(into)]
    pub gits: PathBuf,

    /// Directory for per-key lockfiles and ephemeral sandboxes.
    #[builder(into)]
    pub tmp: PathBuf,

    /// Host-side ccache tree, one subdirectory per upstream repository.
    #[builder(into)]
    pub ccache_dir: PathBuf,

    /// Disable the ccache bind mount entirely.
    #[builder(default = false)]
    pub no_ccache: bool,

    /// Base URL of the tree cache server, queried before mirroring.
    pub cache_server_url: Option<Url>,

    /// Base URL serving pre-built bare-mirror tarballs, tried before a full
    /// clone. Must end with a trailing slash.
    pub tarball_server_url: Option<Url>,

    /// Base URL of the remote artifact server.
    pub kbas_url: Option<Url>,

    /// How long a contended worker waits on the shared lock before retrying.
    #[builder(default = Duration::from_secs(60))]
    pub timeout: Duration,

    /// How many sibling worker processes share the stores.
    ///
    /// Above one, faults inside a claim are swallowed so another instance
    /// can finish the key.
    #[builder(default = 1)]
    pub instances: usize,

    /// Emit per-component progress at info level rather than debug.
    #[builder(default = false)]
    pub log_verbose: bool,

    /// Sandbox directories created and not yet removed in this process.
    #[builder(skip)]
    sandboxes: Arc<Mutex<Vec<PathBuf>>>,
}

impl Settings {
    /// The advisory lockfile path gating builds of `key`.
    pub fn lockfile(&self, key: &CacheKey) -> PathBuf {
        self.tmp.join(format!("{key}.lock"))
    }

    /// Record a live sandbox directory for the retry cleaner.
    pub fn track_sandbox(&self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        trace!(?dir, "track sandbox");
        self.sandboxes.lock().expect("sandbox registry poisoned").push(dir);
    }

    /// Forget a sandbox directory that was removed normally.
    pub fn untrack_sandbox(&self, dir: &Path) {
        let mut sandboxes = self.sandboxes.lock().expect("sandbox registry poisoned");
        sandboxes.retain(|known| known != dir);
    }

    /// Remove every live sandbox directory.
    ///
    /// Called between retry passes so a contended worker does not accumulate
    /// half-populated staging areas.
    #[instrument(skip_all)]
    pub async fn clear_sandboxes(&self) -> Result<()> {
        let doomed = {
            let mut sandboxes = self.sandboxes.lock().expect("sandbox registry poisoned");
            std::mem::take(&mut *sandboxes)
        };
        for dir in doomed {
            fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("remove sandbox: {dir:?}"))?;
        }
        Ok(())
    }

    /// Create every directory the run writes into.
    #[instrument(skip_all)]
    pub async fn prepare_directories(&self) -> Result<()> {
        for dir in [&self.artifacts, &self.gits, &self.tmp, &self.ccache_dir] {
            fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}
