use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Args;
use color_eyre::{Result, eyre::Context};
use tracing::instrument;
use url::Url;

use mason::{assembly::Assembler, defs::Registry, settings::Settings};

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Component names to assemble, in order.
    #[arg(required = true)]
    pub targets: Vec<String>,

    /// Directory containing the definition catalogue.
    #[arg(long, env = "MASON_DEFINITIONS", default_value = "definitions")]
    pub definitions: PathBuf,

    /// Architecture to build for; components declaring another arch are
    /// skipped. Defaults to the host architecture.
    #[arg(long, env = "MASON_ARCH")]
    pub arch: Option<String>,

    /// Artifact store directory.
    #[arg(long, env = "MASON_ARTIFACTS", default_value = "artifacts")]
    pub artifacts: PathBuf,

    /// Bare source mirror directory.
    #[arg(long, env = "MASON_GITS", default_value = "gits")]
    pub gits: PathBuf,

    /// Directory for lockfiles and ephemeral sandboxes.
    #[arg(long, env = "MASON_TMP", default_value = "tmp")]
    pub tmp: PathBuf,

    /// Host-side ccache directory.
    #[arg(long, env = "MASON_CCACHE_DIR", default_value = "ccache")]
    pub ccache_dir: PathBuf,

    /// Disable the ccache bind mount.
    #[arg(long, default_value_t = false)]
    pub no_ccache: bool,

    /// Tree cache server base URL, up to and including the query prefix.
    #[arg(long, env = "MASON_CACHE_SERVER_URL")]
    pub cache_server_url: Option<Url>,

    /// Mirror tarball server base URL (must end with a slash).
    #[arg(long, env = "MASON_TARBALL_SERVER_URL")]
    pub tarball_server_url: Option<Url>,

    /// Remote artifact server base URL.
    #[arg(long, env = "MASON_KBAS_URL")]
    pub kbas_url: Option<Url>,

    /// Seconds to wait on a contended build lock before retrying.
    #[arg(long, env = "MASON_TIMEOUT", default_value_t = 60)]
    pub timeout: u64,

    /// Number of sibling worker processes sharing the stores.
    #[arg(long, env = "MASON_INSTANCES", default_value_t = 1)]
    pub instances: usize,

    /// Per-component progress at info level.
    #[arg(long, default_value_t = false)]
    pub log_verbose: bool,
}

#[instrument(skip_all)]
pub async fn exec(options: Options) -> Result<()> {
    let registry = Registry::load_dir(&options.definitions)
        .await
        .context("load definition catalogue")?;

    let settings = Settings::builder()
        .maybe_arch(options.arch)
        .artifacts(options.artifacts)
        .gits(options.gits)
        .tmp(options.tmp)
        .ccache_dir(options.ccache_dir)
        .no_ccache(options.no_ccache)
        .maybe_cache_server_url(options.cache_server_url)
        .maybe_tarball_server_url(options.tarball_server_url)
        .maybe_kbas_url(options.kbas_url)
        .timeout(Duration::from_secs(options.timeout))
        .instances(options.instances)
        .log_verbose(options.log_verbose)
        .build();
    let settings = Arc::new(settings);

    let assembler = Assembler::new(settings, Arc::new(registry)).await?;
    for target in &options.targets {
        let outcome = assembler
            .run(target)
            .await
            .with_context(|| format!("assemble '{target}'"))?;
        match outcome {
            Some(key) => println!("{key}"),
            None => println!("{target}: skipped, arch does not match this host"),
        }
    }
    Ok(())
}
