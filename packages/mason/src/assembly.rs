//! The assembly scheduler.
//!
//! `Assembler::run` drives the recursive build: compute the cache key,
//! short-circuit on a local or remote artifact, materialise dependencies
//! into the sandbox, and build under a per-key claim. Sibling order is
//! randomised on purpose so parallel workers racing over the same catalogue
//! spread their contention instead of convoying.
//!
//! Lock contention is not an error. `claim` returns a tagged [`Claim`] and
//! the recursion bubbles a [`Pass::Contended`] back to the driver loop,
//! which waits on the holder (shared lock, bounded by the configured
//! timeout) when retries come fast, clears the live sandboxes, and
//! re-enters from the top. By then the cache is either populated or the
//! key is free to claim.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use color_eyre::{Result, eyre::Context};
use futures::{FutureExt, future::BoxFuture};
use rand::seq::SliceRandom;
use tracing::{debug, info, instrument, warn};

use crate::{
    artifacts::ArtifactStore,
    defs::{BuildMode, BuildSystem, Definition, Kind, Registry},
    fs::{self, LockGuard, Lockfile},
    kbas::Kbas,
    keys::{CacheKey, Keys},
    repos::Resolver,
    sandbox::{self, BuildPaths},
    settings::Settings,
};

/// The outcome of claiming the build lock for one cache key.
pub enum Claim {
    /// This worker holds the exclusive lock until the guard drops.
    Acquired(LockGuard),

    /// Another worker holds the lock in some mode.
    Contended,
}

/// One pass of the recursive assembly over a component.
#[derive(Debug)]
enum Pass {
    /// The component and its transitive closure are cached. `None` means
    /// the component's arch does not match this host.
    Done(Option<CacheKey>),

    /// A sibling worker holds the claim for this key; the driver loop
    /// waits and re-enters from the top.
    Contended(CacheKey),
}

/// Drives recursive builds over the shared stores.
pub struct Assembler {
    settings: Arc<Settings>,
    registry: Arc<Registry>,
    keys: Keys<Resolver>,
    resolver: Resolver,
    store: ArtifactStore,
    kbas: Option<Kbas>,
}

impl Assembler {
    /// Wire up an assembler over the run's settings and catalogue.
    pub async fn new(settings: Arc<Settings>, registry: Arc<Registry>) -> Result<Self> {
        settings.prepare_directories().await?;
        let resolver = Resolver::new(Arc::clone(&settings));
        let keys = Keys::new(
            Arc::clone(&registry),
            resolver.clone(),
            settings.arch.clone(),
        );
        let store = ArtifactStore::open_dir(settings.artifacts.clone()).await?;
        let kbas = settings.kbas_url.clone().map(Kbas::new);
        Ok(Self {
            settings,
            registry,
            keys,
            resolver,
            store,
            kbas,
        })
    }

    /// The cache key engine backing this run.
    pub fn keys(&self) -> &Keys<Resolver> {
        &self.keys
    }

    /// The artifact store backing this run.
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Produce (or confirm) a cached artifact for `target` and every
    /// transitive dependency.
    ///
    /// Returns the target's cache key, or `None` when the target declares
    /// an architecture this host cannot build.
    #[instrument(skip(self))]
    pub async fn run(&self, target: &str) -> Result<Option<CacheKey>> {
        let mut last_retry: Option<Instant> = None;
        loop {
            match self.assemble(target).await? {
                Pass::Done(key) => return Ok(key),
                Pass::Contended(key) => {
                    if self.settings.log_verbose {
                        info!(%key, "already downloading/building, so wait/retry");
                    }
                    // A retry within a second means the holder is still
                    // busy: block on the shared lock instead of spinning.
                    if last_retry.is_some_and(|at| at.elapsed() < Duration::from_secs(1)) {
                        let lock = Lockfile::new(self.settings.lockfile(&key));
                        lock.wait_shared(self.settings.timeout).await?;
                    }
                    last_retry = Some(Instant::now());
                    self.settings.clear_sandboxes().await?;
                }
            }
        }
    }

    fn assemble<'a>(&'a self, target: &'a str) -> BoxFuture<'a, Result<Pass>> {
        async move {
            let def = self.registry.require(target)?;
            let key = self.keys.of(target).await?;

            if self.store.get(&key).await?.is_some() {
                return Ok(Pass::Done(Some(key)));
            }

            if let Some(kbas) = &self.kbas {
                match self.claim(&key).await? {
                    Claim::Acquired(_guard) => {
                        if kbas.get_remote(&key, &self.store).await.is_some() {
                            return Ok(Pass::Done(Some(key)));
                        }
                    }
                    Claim::Contended => return Ok(Pass::Contended(key)),
                }
            }

            if def
                .arch
                .as_ref()
                .is_some_and(|arch| *arch != self.settings.arch)
            {
                debug!(name = %def.name, arch = ?def.arch, "arch mismatch, skipping");
                return Ok(Pass::Done(None));
            }

            let paths = sandbox::setup(&def, &key, &self.settings).await?;

            let mut systems = def.systems.clone();
            systems.shuffle(&mut rand::thread_rng());
            for system in &systems {
                match self.assemble(&system.path).await? {
                    Pass::Done(_) => {}
                    contended => return Ok(contended),
                }
                for subsystem in &system.subsystems {
                    match self.assemble(subsystem).await? {
                        Pass::Done(_) => {}
                        contended => return Ok(contended),
                    }
                }
            }

            for dep in &def.build_depends {
                if let Some(key) = self.preinstall(&paths, dep).await? {
                    return Ok(Pass::Contended(key));
                }
            }

            let mut contents = def.contents.clone();
            contents.shuffle(&mut rand::thread_rng());
            for name in &contents {
                let sub = self.registry.require(name)?;
                if sub.build_mode != BuildMode::Bootstrap {
                    if let Some(key) = self.preinstall(&paths, name).await? {
                        return Ok(Pass::Contended(key));
                    }
                }
            }

            if def.systems.is_empty() && self.store.get(&key).await?.is_none() {
                match self.claim(&key).await? {
                    Claim::Acquired(_guard) => {
                        if self.settings.instances > 1 {
                            // A sibling worker can still finish this key;
                            // swallow so the next scheduling pass retries.
                            if let Err(err) = self.do_build(&def, &key, &paths).await {
                                warn!(name = %def.name, ?err, "build failed, leaving the key to a sibling");
                            }
                        } else {
                            self.do_build(&def, &key, &paths).await?;
                        }
                    }
                    Claim::Contended => return Ok(Pass::Contended(key)),
                }
            }

            fs::remove_dir_all(&paths.sandbox).await?;
            self.settings.untrack_sandbox(&paths.sandbox);

            Ok(Pass::Done(Some(key)))
        }
        .boxed()
    }

    /// Install `dep` and all its recursed dependencies into the sandbox.
    ///
    /// Idempotent per `(component, dep)`: the sentinel metadata file in the
    /// assembly marks a dependency as already present.
    fn preinstall<'a>(
        &'a self,
        paths: &'a BuildPaths,
        dep: &'a str,
    ) -> BoxFuture<'a, Result<Option<CacheKey>>> {
        async move {
            let dependency = self.registry.require(dep)?;
            let sentinel = sandbox::sentinel_path(&paths.assembly, &dependency.name);
            if fs::metadata(&sentinel).await?.is_some() {
                return Ok(None);
            }

            for sub in &dependency.build_depends {
                let subdef = self.registry.require(sub)?;
                if subdef.build_mode == dependency.build_mode {
                    if let Some(key) = self.preinstall(paths, sub).await? {
                        return Ok(Some(key));
                    }
                }
            }

            let mut contents = dependency.contents.clone();
            contents.shuffle(&mut rand::thread_rng());
            for sub in &contents {
                let subdef = self.registry.require(sub)?;
                if subdef.build_mode != BuildMode::Bootstrap {
                    if let Some(key) = self.preinstall(paths, sub).await? {
                        return Ok(Some(key));
                    }
                }
            }

            match self.assemble(&dependency.name).await? {
                Pass::Contended(key) => Ok(Some(key)),
                // Arch-skipped components contribute nothing to parents.
                Pass::Done(None) => Ok(None),
                Pass::Done(Some(key)) => {
                    sandbox::install(paths, &dependency, &key, &self.store).await?;
                    Ok(None)
                }
            }
        }
        .boxed()
    }

    /// Build one component and store its artifact, per kind.
    #[instrument(skip(self, def, paths), fields(name = %def.name, %key))]
    async fn do_build(&self, def: &Definition, key: &CacheKey, paths: &BuildPaths) -> Result<()> {
        let started = Instant::now();
        info!("building");

        self.build(def, paths).await?;

        match def.kind {
            Kind::Chunk | Kind::Stratum => {
                self.write_metadata(def, key, paths).await?;
                self.store.put(key, &paths.install, def.kind).await?;
            }
            Kind::System => {
                self.store.put(key, &paths.assembly, def.kind).await?;
            }
            // Purely aggregate; nothing to package.
            Kind::Cluster => {}
        }

        fs::append(
            &paths.log,
            format!("# # elapsed: {:.3}s\n", started.elapsed().as_secs_f64()),
        )
        .await?;
        info!(elapsed = ?started.elapsed(), "now cached");
        Ok(())
    }

    /// Run the component's recipe. Every dependency is staged by now.
    async fn build(&self, def: &Definition, paths: &BuildPaths) -> Result<()> {
        if def.build_mode != BuildMode::Bootstrap {
            sandbox::ldconfig(paths).await;
        }

        if let (Some(repo), Some(reference)) = (&def.repo, &def.reference) {
            self.resolver
                .checkout(&def.name, repo, reference, &paths.build)
                .await?;
        }

        let (recipe, steps) = self.build_commands(def, paths).await?;
        debug!(name = %def.name, log = ?paths.log, "logging build commands");

        for step in &self.registry.defaults.build_steps {
            let Some(commands) = steps.get(step) else {
                continue;
            };
            if !commands.is_empty() {
                debug!(name = %def.name, %step, "running step");
            }
            let env = sandbox::build_env(
                def,
                paths,
                &self.settings,
                &recipe,
                step.contains("build"),
            );
            for command in commands {
                sandbox::run_sandboxed(def, paths, &self.settings, command, &env).await?;
            }
        }

        if !def.devices.is_empty() {
            sandbox::create_devices(def, paths).await?;
        }
        Ok(())
    }

    /// The commands to run for each step: the definition's own lists, with
    /// gaps filled from the declared (or detected) recipe.
    async fn build_commands(
        &self,
        def: &Definition,
        paths: &BuildPaths,
    ) -> Result<(BuildSystem, BTreeMap<String, Vec<String>>)> {
        let defaults = &self.registry.defaults;

        let recipe = if let Some(name) = &def.build_system {
            debug!(name = %def.name, recipe = %name, "declared build system");
            defaults.build_system(name).clone()
        } else if def.steps.is_empty() && def.repo.is_some() {
            // Neither commands nor a recipe name: probe the checkout.
            let mut files = Vec::new();
            let mut entries = tokio::fs::read_dir(&paths.build)
                .await
                .context("list source tree")?;
            while let Some(entry) = entries.next_entry().await.context("list source tree")? {
                files.push(entry.file_name().to_string_lossy().into_owned());
            }
            let detected = defaults.detect_build_system(&files);
            debug!(name = %def.name, recipe = %detected, "autodetected build system");
            defaults.build_system(detected).clone()
        } else {
            defaults.build_system("manual").clone()
        };

        let mut steps = BTreeMap::new();
        for step in &defaults.build_steps {
            let commands = match def.commands(step) {
                Some(commands) => commands.to_vec(),
                None => recipe.commands.get(step).cloned().unwrap_or_default(),
            };
            steps.insert(step.clone(), commands);
        }
        Ok((recipe, steps))
    }

    /// Emit the artifact metadata file into the install tree.
    async fn write_metadata(
        &self,
        def: &Definition,
        key: &CacheKey,
        paths: &BuildPaths,
    ) -> Result<()> {
        let meta = serde_json::json!({
            "artifact": key.as_str(),
            "name": def.name,
            "kind": def.kind.as_str(),
            "repo": def.repo,
            "ref": def.reference,
            "contents": def.contents,
        });
        let path = sandbox::sentinel_path(&paths.install, &def.name);
        let encoded = serde_json::to_string_pretty(&meta).context("encode metadata")?;
        fs::write(&path, encoded).await
    }

    /// Take (or observe) the exclusive advisory lock gating `key`.
    async fn claim(&self, key: &CacheKey) -> Result<Claim> {
        let lockfile = Lockfile::new(self.settings.lockfile(key));
        Ok(match lockfile.try_exclusive().await? {
            Some(guard) => Claim::Acquired(guard),
            None => Claim::Contended,
        })
    }
}
