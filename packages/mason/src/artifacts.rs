//! The local artifact store.
//!
//! Artifacts are gzipped tars named `<key>.tar.gz` in a flat directory that
//! also holds each key's build log and unpack directory. The store is
//! write-once per key: concurrent writers for distinct keys are fine, and
//! writers for the same key are serialised by the scheduler's claim.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use flate2::{Compression, write::GzEncoder};
use tap::Pipe;
use tokio::task::spawn_blocking;
use tracing::{debug, instrument, trace};

use crate::{
    defs::Kind,
    error::Fault,
    fs,
    keys::CacheKey,
    tree::{self, MAGIC_TIMESTAMP},
};

/// Put/get/unpack of artifact blobs keyed by cache key.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open the store in the provided directory, creating it if needed.
    #[instrument(name = "ArtifactStore::open_dir")]
    pub async fn open_dir(root: impl Into<PathBuf> + std::fmt::Debug) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .context("create artifact directory")?;
        Ok(Self { root })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The blob path for `key`, whether or not it exists yet.
    pub fn blob_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{key}.tar.gz"))
    }

    /// The build log path for `key`.
    pub fn log_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{key}.build-log"))
    }

    /// Look up the artifact blob for `key`.
    #[instrument(skip(self))]
    pub async fn get(&self, key: &CacheKey) -> Result<Option<PathBuf>> {
        let blob = self.blob_path(key);
        fs::metadata(&blob).await?.map(|_| blob).pipe(Ok)
    }

    /// Package `dir` as the artifact for `key`.
    ///
    /// Non-system artifacts have every mtime under `dir` normalised to the
    /// magic timestamp first, and entries are added under a canonical walk,
    /// so byte-identical inputs produce byte-identical archives.
    #[instrument(skip(self))]
    pub async fn put(&self, key: &CacheKey, dir: &Path, kind: Kind) -> Result<PathBuf> {
        if kind != Kind::System {
            tree::set_mtime_recursively(dir, MAGIC_TIMESTAMP).await?;
        }

        let blob = self.blob_path(key);
        let (dir, root, target) = (dir.to_path_buf(), self.root.clone(), blob.clone());
        spawn_blocking(move || pack(&dir, &root, &target))
            .await
            .context("join task")??;

        debug!(%key, ?blob, "artifact stored");
        Ok(blob)
    }

    /// Ensure the blob for `key` is extracted exactly once; return the
    /// directory.
    ///
    /// Extraction happens in a temporary sibling that is renamed into place,
    /// so the unpack directory is only ever observed complete.
    #[instrument(skip(self))]
    pub async fn unpack(&self, key: &CacheKey) -> Result<PathBuf> {
        let blob = self
            .get(key)
            .await?
            .ok_or_else(|| Fault::Storage {
                path: self.blob_path(key),
            })
            .context("cached artifact not found")?;

        let unpacked = self.root.join(format!("{key}.tar.gz.unpacked"));
        if fs::metadata(&unpacked).await?.is_some() {
            trace!(%key, "already unpacked");
            return Ok(unpacked);
        }

        let (root, target) = (self.root.clone(), unpacked.clone());
        spawn_blocking(move || extract(&blob, &root, &target))
            .await
            .context("join task")??;

        debug!(%key, ?unpacked, "artifact unpacked");
        Ok(unpacked)
    }
}

fn pack(dir: &Path, store_root: &Path, blob: &Path) -> Result<()> {
    let staging = tempfile::Builder::new()
        .prefix(".pack.")
        .tempfile_in(store_root)
        .context("create staging blob")?;

    {
        let encoder = GzEncoder::new(staging.as_file(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        for rel in tree::canonical_walk(dir)? {
            let path = dir.join(&rel);
            let meta = std::fs::symlink_metadata(&path)
                .with_context(|| format!("stat archive entry: {path:?}"))?;
            let kind = meta.file_type();
            if kind.is_dir() || kind.is_file() || kind.is_symlink() {
                builder
                    .append_path_with_name(&path, &rel)
                    .with_context(|| format!("archive entry: {rel:?}"))?;
            } else {
                append_device(&mut builder, &rel, &meta)
                    .with_context(|| format!("archive device node: {rel:?}"))?;
            }
        }

        let encoder = builder.into_inner().context("finish tar stream")?;
        encoder.finish().context("finish gzip stream")?;
    }

    staging.persist(blob).context("persist artifact blob")?;
    Ok(())
}

fn append_device<W: Write>(
    builder: &mut tar::Builder<W>,
    rel: &Path,
    meta: &std::fs::Metadata,
) -> Result<()> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let kind = meta.file_type();
    let entry_type = if kind.is_char_device() {
        tar::EntryType::Char
    } else if kind.is_block_device() {
        tar::EntryType::Block
    } else {
        bail!("unsupported file type in archive");
    };

    let mut header = tar::Header::new_gnu();
    header.set_metadata(meta);
    header.set_entry_type(entry_type);
    header.set_size(0);
    header.set_device_major(libc::major(meta.rdev()))?;
    header.set_device_minor(libc::minor(meta.rdev()))?;
    builder
        .append_data(&mut header, rel, std::io::empty())
        .context("append device entry")
}

fn extract(blob: &Path, store_root: &Path, target: &Path) -> Result<()> {
    let staging = tempfile::Builder::new()
        .prefix(".unpack.")
        .tempdir_in(store_root)
        .context("create staging directory")?;

    let file = std::fs::File::open(blob).with_context(|| format!("open blob: {blob:?}"))?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive
        .unpack(staging.path())
        .with_context(|| format!("extract blob: {blob:?}"))?;

    let staged = staging.keep();
    match std::fs::rename(&staged, target) {
        Ok(()) => Ok(()),
        Err(_) if target.exists() => {
            // A sibling worker finished first; its directory is complete.
            let _ = std::fs::remove_dir_all(&staged);
            Ok(())
        }
        Err(err) => Err(err).context(format!("move unpack directory into place: {target:?}")),
    }
}
