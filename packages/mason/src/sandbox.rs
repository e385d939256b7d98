//! Sandboxed build execution.
//!
//! A staging-mode command runs wrapped in three layers: an outer
//! mount-namespace unshare that makes `/` recursively private and performs
//! the requested mounts, a middle `linux-user-chroot` invocation that pins
//! the working directory, applies read-only remounts to everything not
//! whitelisted as writable, bind-mounts caches, and chroots into the
//! assembly, and finally `sh -c` around the command itself. Bootstrap-mode
//! commands run on the bare host with no chroot and no extra namespaces.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use itertools::Itertools;
use tokio::process::Command;
use tracing::{debug, instrument, trace, warn};

use crate::{
    artifacts::ArtifactStore,
    defs::{BuildMode, BuildSystem, Definition},
    error::Fault,
    fs,
    keys::CacheKey,
    settings::Settings,
    tree,
};

/// Fixed PATH base inside a staging chroot.
const BASE_PATH: &[&str] = &["/sbin", "/usr/sbin", "/bin", "/usr/bin"];

/// Skeleton directories created under a fresh assembly root.
const ASSEMBLY_DIRS: &[&str] = &["dev", "etc", "lib", "usr", "bin", "tmp", "proc"];

/// The in-chroot ccache directory; bind-mounted from the host cache.
const CCACHE_TARGET: &str = "tmp/ccache";

/// Working paths for one component build.
#[derive(Clone, Debug)]
pub struct BuildPaths {
    /// Ephemeral per-component root, removed when the build ends.
    pub sandbox: PathBuf,

    /// The chroot root, populated from dependency artifacts.
    pub assembly: PathBuf,

    /// The source checkout and working directory for build commands.
    pub build: PathBuf,

    /// The subtree captured as the component's artifact.
    pub install: PathBuf,

    /// The build log, kept next to the artifact blob.
    pub log: PathBuf,
}

impl BuildPaths {
    /// The install directory as commands see it: inside the chroot for
    /// staging builds, on the host for bootstrap builds.
    pub fn destdir(&self, mode: BuildMode) -> PathBuf {
        match mode {
            BuildMode::Staging => {
                Path::new("/").join(self.install.file_name().expect("install dir has a name"))
            }
            BuildMode::Bootstrap => self.install.clone(),
        }
    }

    /// The working directory as commands see it.
    pub fn workdir(&self, mode: BuildMode) -> PathBuf {
        match mode {
            BuildMode::Staging => {
                Path::new("/").join(self.build.file_name().expect("build dir has a name"))
            }
            BuildMode::Bootstrap => self.build.clone(),
        }
    }
}

/// Create the sandbox and assembly skeleton for one component.
#[instrument(skip(settings))]
pub async fn setup(def: &Definition, key: &CacheKey, settings: &Settings) -> Result<BuildPaths> {
    fs::create_dir_all(&settings.tmp).await?;
    let stem = def.name.replace('/', "-");
    let sandbox = tempfile::Builder::new()
        .prefix(&format!("{stem}."))
        .tempdir_in(&settings.tmp)
        .context("create sandbox directory")
        .map_err(|err| {
            err.wrap_err(Fault::Sandbox {
                name: def.name.clone(),
            })
        })?
        .keep();
    settings.track_sandbox(&sandbox);

    let assembly = sandbox.join("assembly");
    for dir in ASSEMBLY_DIRS {
        fs::create_dir_all(&assembly.join(dir)).await?;
    }
    mknod_devnull(&assembly).await;

    let build = assembly.join(format!("{stem}.build"));
    let install = assembly.join(format!("{stem}.inst"));
    fs::create_dir_all(&build).await?;
    fs::create_dir_all(&install).await?;

    debug!(name = %def.name, ?sandbox, "sandbox ready");
    Ok(BuildPaths {
        sandbox,
        assembly,
        build,
        install,
        log: settings.artifacts.join(format!("{key}.build-log")),
    })
}

/// Create the `/dev/null` character device (major 1, minor 3, mode 0666).
///
/// Device nodes need privilege: done directly when already root, otherwise
/// through the `sudo` helper, non-interactively. Best-effort: components
/// that never touch `/dev/null` build fine without it.
async fn mknod_devnull(assembly: &Path) {
    let devnull = assembly.join("dev/null");
    if matches!(fs::metadata(&devnull).await, Ok(Some(_))) {
        return;
    }

    if unsafe { libc::geteuid() } == 0 {
        let created = tree::mknod(&devnull, libc::S_IFCHR | 0o666, libc::makedev(1, 3));
        if let Err(err) = created {
            warn!(?devnull, ?err, "could not create /dev/null; builds that need it will fail");
        }
        return;
    }

    let devnull = devnull.display().to_string();
    let created = Command::new("sudo")
        .args(["-n", "mknod", &devnull, "c", "1", "3"])
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false);
    let adjusted = created
        && Command::new("sudo")
            .args(["-n", "chmod", "666", &devnull])
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false);
    if !adjusted {
        warn!(%devnull, "could not create /dev/null; builds that need it will fail");
    }
}

/// The sentinel path marking `dep` as installed in an assembly.
pub fn sentinel_path(assembly: &Path, dep: &str) -> PathBuf {
    assembly
        .join("mason")
        .join(format!("{}.meta", dep.replace('/', "-")))
}

/// Stage `dep`'s artifact into the component's assembly and mark it
/// installed.
#[instrument(skip(store, paths))]
pub async fn install(
    paths: &BuildPaths,
    dep: &Definition,
    key: &CacheKey,
    store: &ArtifactStore,
) -> Result<()> {
    let unpacked = store.unpack(key).await?;
    tree::hardlink_tree(&unpacked, &paths.assembly)
        .await
        .with_context(|| format!("stage '{}' into assembly", dep.name))?;

    // Chunk and stratum artifacts carry their own metadata file; write the
    // sentinel only when the artifact did not provide one.
    let sentinel = sentinel_path(&paths.assembly, &dep.name);
    if fs::metadata(&sentinel).await?.is_none() {
        fs::write(&sentinel, format!("{key}\n")).await?;
    }
    debug!(dep = %dep.name, %key, "dependency staged");
    Ok(())
}

/// Compose the PATH for a build command.
///
/// Staging builds see the recipe's extra paths followed by the fixed base;
/// bootstrap builds see the extra paths rooted in the assembly, then the
/// inherited host PATH, with `<assembly>/tools/bin` prepended when present.
pub fn compose_path(
    mode: BuildMode,
    assembly: &Path,
    extra_path: &[String],
    host_path: &str,
) -> String {
    match mode {
        BuildMode::Staging => extra_path
            .iter()
            .map(String::as_str)
            .chain(BASE_PATH.iter().copied())
            .join(":"),
        BuildMode::Bootstrap => {
            let mut parts = extra_path
                .iter()
                .map(|p| {
                    let rel = p.trim_start_matches('/');
                    assembly.join(rel).display().to_string()
                })
                .chain(host_path.split(':').map(String::from))
                .collect_vec();
            let tools = assembly.join("tools/bin");
            if tools.is_dir() {
                parts.insert(0, tools.display().to_string());
            }
            parts.join(":")
        }
    }
}

/// The environment overlay for one build command.
///
/// Entries here replace the corresponding host variables for the duration
/// of the command; everything not named is inherited unchanged, and nothing
/// outlives the subprocess.
pub fn build_env(
    def: &Definition,
    paths: &BuildPaths,
    settings: &Settings,
    recipe: &BuildSystem,
    allow_parallel: bool,
) -> BTreeMap<String, String> {
    let mut env = recipe.env.clone();

    let host_path = std::env::var("PATH").unwrap_or_default();
    env.insert(
        String::from("PATH"),
        compose_path(def.build_mode, &paths.assembly, &recipe.extra_path, &host_path),
    );
    env.insert(String::from("PREFIX"), String::from("/usr"));
    env.insert(
        String::from("DESTDIR"),
        paths.destdir(def.build_mode).display().to_string(),
    );
    env.insert(String::from("TERM"), String::from("dumb"));

    let jobs = if allow_parallel {
        std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(1)
    } else {
        1
    };
    env.insert(String::from("MAKEFLAGS"), format!("-j{jobs}"));

    if !settings.no_ccache {
        env.insert(String::from("CCACHE_DIR"), format!("/{CCACHE_TARGET}"));
    }

    env
}

/// Run one build command inside the component's isolation layers.
///
/// The command and its full containerised argv are appended to the build
/// log before execution; all output goes to the log. Non-zero exit is a
/// build failure whose final log lines name the command and its working
/// directory.
#[instrument(skip_all, fields(name = %def.name, %command))]
pub async fn run_sandboxed(
    def: &Definition,
    paths: &BuildPaths,
    settings: &Settings,
    command: &str,
    env: &BTreeMap<String, String>,
) -> Result<()> {
    let argv = vec![
        String::from("sh"),
        String::from("-c"),
        String::from(command),
    ];

    let cmdline = match def.build_mode {
        BuildMode::Staging => {
            let mut writable = vec![
                paths.build.clone(),
                paths.install.clone(),
                paths.assembly.join("dev"),
                paths.assembly.join("proc"),
                paths.assembly.join("tmp"),
            ];

            let mut binds = Vec::new();
            if !settings.no_ccache {
                let (source, target) = ccache_dirs(def, paths, settings).await?;
                writable.push(target.clone());
                binds.push((source, target));
            }

            let mounts = [(
                String::from("dev/shm"),
                String::from("tmpfs"),
                String::from("none"),
            )];
            containerised_cmdline(
                argv,
                &paths.workdir(BuildMode::Staging),
                &paths.assembly,
                &binds,
                true,
                false,
                &writable,
                &mounts,
            )?
        }
        // Bootstrap commands run on the bare host: no chroot, no mount
        // table, the host's namespaces carry through.
        BuildMode::Bootstrap => argv,
    };

    fs::append(
        &paths.log,
        format!("# # {command}\n{}\n", cmdline.join(" ")),
    )
    .await?;

    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log)
        .with_context(|| format!("open build log: {:?}", paths.log))?;
    let stderr_log = log.try_clone().context("clone log handle")?;

    let status = Command::new(&cmdline[0])
        .args(&cmdline[1..])
        .envs(env)
        .current_dir(&paths.build)
        .stdout(std::process::Stdio::from(log))
        .stderr(std::process::Stdio::from(stderr_log))
        .status()
        .await
        .with_context(|| format!("spawn build command: {}", cmdline[0]))?;

    if !status.success() {
        let workdir = paths.workdir(def.build_mode);
        fs::append(
            &paths.log,
            format!(
                "# # ERROR: command failed in directory {}: {command}\n",
                workdir.display()
            ),
        )
        .await?;
        return Err(Fault::BuildFailed {
            name: def.name.clone(),
            command: String::from(command),
        })
        .context(format!("command exited with {status}"));
    }

    trace!("command succeeded");
    Ok(())
}

/// Resolve (and create) the host ccache directory for `def`'s repository
/// and its bind target inside the assembly.
async fn ccache_dirs(
    def: &Definition,
    paths: &BuildPaths,
    settings: &Settings,
) -> Result<(PathBuf, PathBuf)> {
    let repo = def.repo.as_deref().unwrap_or(&def.name);
    let basename = repo
        .split(':')
        .next_back()
        .unwrap_or(repo)
        .rsplit('/')
        .next()
        .unwrap_or(repo);
    let source = settings.ccache_dir.join(basename);
    let target = paths.assembly.join(CCACHE_TARGET);
    fs::create_dir_all(&source).await?;
    fs::create_dir_all(&target).await?;
    Ok((source, target))
}

/// Refresh the ld cache inside the assembly. Failure is non-fatal.
pub async fn ldconfig(paths: &BuildPaths) {
    let conf = paths.assembly.join("sbin/ldconfig");
    if !matches!(fs::metadata(&conf).await, Ok(Some(_))) {
        trace!("no staged ldconfig, skipping");
        return;
    }
    let outcome = Command::new("ldconfig")
        .arg("-r")
        .arg(&paths.assembly)
        .status()
        .await;
    match outcome {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(%status, "ldconfig failed"),
        Err(err) => warn!(?err, "could not run ldconfig"),
    }
}

/// Recreate the device nodes a definition declares in its install tree.
#[instrument(skip(paths))]
pub async fn create_devices(def: &Definition, paths: &BuildPaths) -> Result<()> {
    for device in &def.devices {
        let dest = paths.install.join(device.filename.trim_start_matches('/'));
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let permissions = match device.permissions.as_deref() {
            Some(text) => u32::from_str_radix(text, 8)
                .with_context(|| format!("parse device permissions: {text:?}"))?,
            None => 0o644,
        };
        let type_bit = match device.kind.as_str() {
            "c" => libc::S_IFCHR,
            "b" => libc::S_IFBLK,
            other => bail!("unknown device type '{other}' for {:?}", device.filename),
        };

        let dest_arg = dest.display().to_string();
        debug!(device = %device.filename, "creating device node");
        if unsafe { libc::geteuid() } == 0 {
            let rdev = libc::makedev(device.major, device.minor);
            tree::mknod(&dest, permissions | type_bit, rdev)?;
        } else {
            // Device creation needs privilege; defer to the helper.
            let status = Command::new("sudo")
                .args([
                    "-n",
                    "mknod",
                    "-m",
                    &format!("{permissions:o}"),
                    &dest_arg,
                    &device.kind,
                    &device.major.to_string(),
                    &device.minor.to_string(),
                ])
                .status()
                .await
                .context("spawn mknod helper")?;
            if !status.success() {
                return Err(eyre!("mknod helper failed for {dest_arg}"));
            }
        }
    }
    Ok(())
}

/// Describe how to run `args` inside a `linux-user-chroot` container.
///
/// The subprocess may only write to `writable_paths`; every other location
/// under `root` is remounted read-only. `binds` are host-source to
/// chroot-target pairs; `mounts` are performed inside the mount namespace
/// before anything else. The whole invocation is wrapped by
/// [`unshared_cmdline`].
#[allow(clippy::too_many_arguments)]
pub fn containerised_cmdline(
    args: Vec<String>,
    cwd: &Path,
    root: &Path,
    binds: &[(PathBuf, PathBuf)],
    mount_proc: bool,
    unshare_net: bool,
    writable_paths: &[PathBuf],
    mounts: &[(String, String, String)],
) -> Result<Vec<String>> {
    let mut cmdargs = vec![
        String::from("linux-user-chroot"),
        String::from("--chdir"),
        cwd.display().to_string(),
    ];
    if unshare_net {
        cmdargs.push(String::from("--unshare-net"));
    }
    for (source, target) in binds {
        // linux-user-chroot's mount target paths are relative to the chroot.
        cmdargs.push(String::from("--mount-bind"));
        cmdargs.push(source.display().to_string());
        cmdargs.push(chroot_relative(target, root)?);
    }
    for path in invert_paths(root, writable_paths)? {
        if path.is_symlink() {
            continue;
        }
        cmdargs.push(String::from("--mount-readonly"));
        cmdargs.push(chroot_relative(&path, root)?);
    }
    if mount_proc {
        cmdargs.push(String::from("--mount-proc"));
        cmdargs.push(String::from("proc"));
    }
    cmdargs.push(root.display().to_string());
    cmdargs.extend(args);

    Ok(unshared_cmdline(cmdargs, root, mounts))
}

fn chroot_relative(path: &Path, root: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .with_context(|| format!("{path:?} is outside the chroot {root:?}"))?;
    Ok(rel.display().to_string())
}

/// Wrap `args` so they run inside a separate mount namespace.
///
/// The wrapper makes `/` recursively private, performs each `(target,
/// type, source)` mount relative to `root`, and execs the inner command.
/// Mounts made by the command are unmounted by the kernel when the
/// namespace dies.
pub fn unshared_cmdline(
    args: Vec<String>,
    root: &Path,
    mounts: &[(String, String, String)],
) -> Vec<String> {
    let script = "\
mount --make-rprivate /\n\
root=\"$1\"\n\
shift\n\
while true; do\n\
    case \"$1\" in\n\
    --)\n\
        shift\n\
        break\n\
        ;;\n\
    *)\n\
        mount_point=\"$1\"\n\
        mount_type=\"$2\"\n\
        mount_source=\"$3\"\n\
        shift 3\n\
        path=\"$root/$mount_point\"\n\
        mkdir -p \"$path\"\n\
        mount -t \"$mount_type\" \"$mount_source\" \"$path\"\n\
        ;;\n\
    esac\n\
done\n\
exec \"$@\"\n";

    // The single - is just a shell convention to fill $0 when using -c,
    // since ordinarily $0 contains the program name.
    let mut cmdline: Vec<String> = ["unshare", "--mount", "--", "sh", "-ec", script, "-"]
        .into_iter()
        .map(String::from)
        .collect();
    cmdline.push(root.display().to_string());
    for (target, mount_type, source) in mounts {
        cmdline.push(target.clone());
        cmdline.push(mount_type.clone());
        cmdline.push(source.clone());
    }
    cmdline.push(String::from("--"));
    cmdline.extend(args);
    cmdline
}

/// List the paths under `root` to remount read-only so that exactly the
/// `writable` set stays writable.
///
/// A subtree containing no writable path is yielded whole and its contents
/// culled; an ancestor of a writable path is descended into; a listed path
/// yields nothing.
pub fn invert_paths(root: &Path, writable: &[PathBuf]) -> Result<Vec<PathBuf>> {
    if writable.iter().any(|w| w == root) {
        return Ok(Vec::new());
    }
    if !writable.iter().any(|w| w.starts_with(root)) {
        return Ok(vec![root.to_path_buf()]);
    }
    let mut out = Vec::new();
    invert_visit(root, writable, &mut out)?;
    Ok(out)
}

fn invert_visit(dir: &Path, writable: &[PathBuf], out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("read dir: {dir:?}"))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("read dir entries: {dir:?}"))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        if writable.iter().any(|w| w == &path) {
            // Writable itself: nothing to remount, nothing to descend into.
            continue;
        }
        let file_type = entry
            .file_type()
            .with_context(|| format!("file type: {path:?}"))?;
        if file_type.is_dir() && writable.iter().any(|w| w.starts_with(&path)) {
            // An ancestor of something writable: leave it alone but keep
            // looking inside.
            invert_visit(&path, writable, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}
