//! Client for the remote key-value artifact server.
//!
//! Only retrieval is modelled: a worker holding the claim for a key asks the
//! server for the blob before building it locally. A miss and a transport
//! failure look the same to the scheduler, so both surface as `None` with a
//! debug event carrying the detail.

use std::path::PathBuf;

use color_eyre::{Result, eyre::Context};
use tap::Pipe;
use tokio::task::spawn_blocking;
use tracing::{debug, instrument, trace};
use url::Url;

use crate::{artifacts::ArtifactStore, keys::CacheKey};

/// Read-only client for the remote artifact server.
#[derive(Clone, Debug)]
pub struct Kbas {
    base: Url,
    http: reqwest::Client,
}

impl Kbas {
    /// Create a new client with the given base URL.
    pub fn new(base: impl Into<Url>) -> Self {
        Self {
            base: base.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Fetch the artifact for `key` into the local store.
    ///
    /// Returns the local blob path on success; misses and transport errors
    /// are both `None`.
    #[instrument(skip(self, store))]
    pub async fn get_remote(&self, key: &CacheKey, store: &ArtifactStore) -> Option<PathBuf> {
        match self.fetch(key, store).await {
            Ok(blob) => {
                debug!(%key, ?blob, "artifact pulled from remote");
                Some(blob)
            }
            Err(err) => {
                debug!(%key, ?err, "no remote artifact");
                None
            }
        }
    }

    async fn fetch(&self, key: &CacheKey, store: &ArtifactStore) -> Result<PathBuf> {
        let url = self
            .base
            .join(&format!("get/{key}.tar.gz"))
            .context("build artifact url")?;
        trace!(%url, "requesting remote artifact");

        let bytes = self
            .http
            .get(url)
            .send()
            .await
            .context("send GET request")?
            .error_for_status()
            .context("artifact not available")?
            .bytes()
            .await
            .context("read artifact body")?;

        // Stage next to the final blob and rename, so a concurrent reader
        // never observes a partial artifact.
        let blob = store.blob_path(key);
        let root = store.root().to_path_buf();
        let target = blob.clone();
        spawn_blocking(move || -> Result<()> {
            let mut staging = tempfile::Builder::new()
                .prefix(".pull.")
                .tempfile_in(&root)
                .context("create staging blob")?;
            std::io::Write::write_all(&mut staging, &bytes).context("write artifact bytes")?;
            staging.persist(&target).context("persist artifact blob")?;
            Ok(())
        })
        .await
        .context("join task")??;

        blob.pipe(Ok)
    }
}
