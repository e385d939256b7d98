//! Deterministic file-tree operations for staging areas.
//!
//! Artifacts are staged by copying or hardlinking whole trees, and archives
//! are only reproducible if every file they contain carries the same mtime.
//! These helpers implement both halves: a tree walk that recreates regular
//! files, symlinks, and device nodes, and a recursive mtime rewrite to the
//! magic timestamp.

use std::{
    ffi::CString,
    fmt::Debug as StdDebug,
    os::unix::{
        ffi::OsStrExt,
        fs::{FileTypeExt, MetadataExt, PermissionsExt},
    },
    path::{Path, PathBuf},
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use filetime::FileTime;
use tokio::task::spawn_blocking;
use tracing::{instrument, trace};
use walkdir::WalkDir;

/// The magic mtime applied to normalise builds: 2011-11-11 11:11:11 UTC.
pub const MAGIC_TIMESTAMP: i64 = 1_321_009_871;

#[derive(Copy, Clone, Debug)]
enum Action {
    Copy,
    Hardlink,
}

/// Copy every file under `src` into `dst`, preserving file types.
///
/// If an error is raised the staging area is indeterminate.
#[instrument]
pub async fn copy_tree(
    src: impl AsRef<Path> + StdDebug,
    dst: impl AsRef<Path> + StdDebug,
) -> Result<()> {
    let (src, dst) = (src.as_ref().to_path_buf(), dst.as_ref().to_path_buf());
    spawn_blocking(move || process_tree(&src, &dst, Action::Copy))
        .await
        .context("join task")?
}

/// Hardlink every file under `src` into `dst`.
///
/// If an error is raised the staging area is indeterminate.
#[instrument]
pub async fn hardlink_tree(
    src: impl AsRef<Path> + StdDebug,
    dst: impl AsRef<Path> + StdDebug,
) -> Result<()> {
    let (src, dst) = (src.as_ref().to_path_buf(), dst.as_ref().to_path_buf());
    spawn_blocking(move || process_tree(&src, &dst, Action::Hardlink))
        .await
        .context("join task")?
}

fn process_tree(src: &Path, dst: &Path, action: Action) -> Result<()> {
    let meta = std::fs::symlink_metadata(src).with_context(|| format!("stat source: {src:?}"))?;
    let kind = meta.file_type();

    if kind.is_dir() {
        match std::fs::symlink_metadata(dst) {
            Ok(existing) if existing.file_type().is_dir() => {}
            Ok(existing) if existing.file_type().is_symlink() => {
                // A symlinked directory in the destination is followed, the
                // same way the staging area behaves inside the chroot.
                let target = std::fs::metadata(dst).with_context(|| format!("stat: {dst:?}"))?;
                if !target.is_dir() {
                    bail!("destination is not a directory: {src:?} -> {dst:?}");
                }
            }
            Ok(_) => bail!("destination is not a directory: {src:?} -> {dst:?}"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(dst).with_context(|| format!("create dir: {dst:?}"))?;
            }
            Err(err) => return Err(err).context(format!("stat destination: {dst:?}")),
        }

        let mut entries = std::fs::read_dir(src)
            .with_context(|| format!("read dir: {src:?}"))?
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("read dir entries: {src:?}"))?;
        entries.sort_by_key(|entry| entry.file_name());
        for entry in entries {
            let name = entry.file_name();
            process_tree(&src.join(&name), &dst.join(&name), action)?;
        }
        return Ok(());
    }

    remove_existing(dst)?;

    if kind.is_symlink() {
        let target = std::fs::read_link(src).with_context(|| format!("read link: {src:?}"))?;
        std::os::unix::fs::symlink(&target, dst)
            .with_context(|| format!("create symlink: {dst:?} -> {target:?}"))?;
    } else if kind.is_file() {
        match action {
            Action::Copy => {
                std::fs::copy(src, dst).with_context(|| format!("copy: {src:?} -> {dst:?}"))?;
                let mtime = FileTime::from_last_modification_time(&meta);
                let atime = FileTime::from_last_access_time(&meta);
                filetime::set_file_times(dst, atime, mtime)
                    .with_context(|| format!("copy file times: {dst:?}"))?;
            }
            Action::Hardlink => {
                std::fs::hard_link(src, dst)
                    .with_context(|| format!("hardlink: {src:?} -> {dst:?}"))?;
            }
        }
    } else if kind.is_char_device() || kind.is_block_device() {
        mknod(dst, meta.mode(), meta.rdev())?;
        let permissions = std::fs::Permissions::from_mode(meta.mode() & 0o7777);
        std::fs::set_permissions(dst, permissions)
            .with_context(|| format!("set device permissions: {dst:?}"))?;
    } else {
        bail!("cannot stage {src:?}: unsupported file type");
    }

    trace!(?src, ?dst, ?action, "staged entry");
    Ok(())
}

fn remove_existing(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove existing: {path:?}")),
    }
}

/// Recreate a device node with the original `st_rdev`.
pub fn mknod(path: &Path, mode: u32, rdev: u64) -> Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes()).context("path contains NUL")?;
    let rc = unsafe { libc::mknod(cpath.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context(format!("mknod: {path:?}"));
    }
    Ok(())
}

/// Set the mtime for every file in a directory tree to the same instant.
///
/// Directories are processed bottom-up so their own mtimes survive the
/// writes to their children. Broken symlinks are skipped.
#[instrument]
pub async fn set_mtime_recursively(root: impl AsRef<Path> + StdDebug, timestamp: i64) -> Result<()> {
    let root = root.as_ref().to_path_buf();
    spawn_blocking(move || set_mtime_recursively_sync(&root, timestamp))
        .await
        .context("join task")?
}

fn set_mtime_recursively_sync(root: &Path, timestamp: i64) -> Result<()> {
    let stamp = FileTime::from_unix_time(timestamp, 0);
    for entry in WalkDir::new(root).contents_first(true) {
        let entry = entry.context("walk tree")?;
        let path = entry.path();
        if entry.file_type().is_symlink() {
            if !path.exists() {
                // Broken symlink: nothing to stamp.
                trace!(?path, "skipped broken symlink");
                continue;
            }
            // Stamp the link itself; the target is its own walk entry.
            filetime::set_symlink_file_times(path, stamp, stamp)
                .with_context(|| format!("set symlink mtime: {path:?}"))?;
            continue;
        }
        filetime::set_file_times(path, stamp, stamp)
            .with_context(|| format!("set mtime: {path:?}"))?;
    }
    Ok(())
}

/// Collect the paths of every entry under `root`, relative to it, in a
/// canonical (sorted, depth-first) order.
pub fn canonical_walk(root: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.context("walk tree")?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("relativise {:?} against {root:?}", entry.path()))?;
        paths.push(rel.to_path_buf());
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use pretty_assertions::assert_eq;

    use super::*;

    fn seed_tree(root: &Path) {
        std::fs::create_dir_all(root.join("usr/bin")).expect("create dirs");
        std::fs::write(root.join("usr/bin/sh"), b"#!/bin/sh\n").expect("write file");
        std::fs::write(root.join("readme"), b"hello").expect("write file");
        std::os::unix::fs::symlink("usr/bin/sh", root.join("sh")).expect("create symlink");
    }

    #[test_log::test(tokio::test)]
    async fn copy_preserves_shape_and_symlink_targets() {
        let src = tempfile::TempDir::new().expect("create src");
        let dst = tempfile::TempDir::new().expect("create dst");
        seed_tree(src.path());

        copy_tree(src.path(), dst.path()).await.expect("copy tree");

        assert_eq!(
            canonical_walk(src.path()).expect("walk src"),
            canonical_walk(dst.path()).expect("walk dst"),
        );
        let link = std::fs::read_link(dst.path().join("sh")).expect("read copied link");
        assert_eq!(link, PathBuf::from("usr/bin/sh"));
    }

    #[test_log::test(tokio::test)]
    async fn hardlink_shares_inodes() {
        let src = tempfile::TempDir::new().expect("create src");
        let dst = tempfile::TempDir::new().expect("create dst");
        seed_tree(src.path());

        hardlink_tree(src.path(), dst.path())
            .await
            .expect("hardlink tree");

        let original = std::fs::metadata(src.path().join("readme")).expect("stat src");
        let linked = std::fs::metadata(dst.path().join("readme")).expect("stat dst");
        assert_eq!(original.ino(), linked.ino(), "hardlink must share the inode");
    }

    #[test_log::test(tokio::test)]
    async fn mtimes_normalise_to_the_magic_timestamp() {
        let root = tempfile::TempDir::new().expect("create root");
        seed_tree(root.path());

        set_mtime_recursively(root.path(), MAGIC_TIMESTAMP)
            .await
            .expect("normalise mtimes");

        for rel in ["usr", "usr/bin", "usr/bin/sh", "readme"] {
            let meta = std::fs::metadata(root.path().join(rel)).expect("stat entry");
            assert_eq!(meta.mtime(), MAGIC_TIMESTAMP, "mtime of {rel}");
        }
    }

    #[test_log::test(tokio::test)]
    async fn broken_symlinks_are_skipped() {
        let root = tempfile::TempDir::new().expect("create root");
        std::os::unix::fs::symlink("missing-target", root.path().join("dangling"))
            .expect("create dangling symlink");

        set_mtime_recursively(root.path(), MAGIC_TIMESTAMP)
            .await
            .expect("normalise tree containing dangling symlink");
    }
}
