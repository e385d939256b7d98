//! The cache key engine.
//!
//! A component's cache key is a SHA-256 over the canonical serialisation of
//! every input that can influence its build output: the target architecture,
//! the keys of its dependencies and contents (each paired with its name), the
//! resolved source tree, the literal text of its build-step command lists,
//! and, for clusters, the keys of every referenced system.
//!
//! Keys are memoised in a table owned by the engine, keyed by component name;
//! definitions themselves stay immutable. The engine keeps a stack of names
//! currently being keyed and refuses re-entry, so a cyclic catalogue fails
//! loudly instead of recursing forever.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use dashmap::DashMap;
use derive_more::Display;
use futures::{FutureExt, future::BoxFuture};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, trace};

use crate::{
    defs::{Definition, Kind, Registry},
    error::Fault,
};

/// A content-addressed component identifier: `<name>@<sha256-hex>`.
///
/// Slashes in the component name are replaced by dashes so the key is always
/// safe as a file name.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize)]
pub struct CacheKey(String);

impl CacheKey {
    fn new(name: &str, digest: &[u8]) -> Self {
        Self(format!("{}@{}", name.replace('/', "-"), hex::encode(digest)))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for CacheKey {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        let (name, digest) = s
            .split_once('@')
            .ok_or_else(|| color_eyre::eyre::eyre!("cache key must look like <name>@<sha256>"))?;
        if name.is_empty() || name.contains('/') {
            bail!("malformed cache key name: {name:?}");
        }
        let well_formed = digest.len() == 64
            && digest
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
        if !well_formed {
            bail!("malformed cache key digest: {digest:?}");
        }
        Ok(Self(String::from(s)))
    }
}

/// Resolves a symbolic `(repo, ref)` pair to an immutable tree identity.
///
/// The seam exists so the key engine can be exercised without touching the
/// network or a git binary.
pub trait TreeSource {
    /// Resolve the tree for `name`'s source coordinates.
    fn tree<'a>(
        &'a self,
        name: &'a str,
        repo: &'a str,
        reference: &'a str,
    ) -> BoxFuture<'a, Result<String>>;
}

/// The memoising cache key engine for one scheduler run.
#[derive(Debug)]
pub struct Keys<S> {
    registry: Arc<Registry>,
    source: S,
    arch: String,
    keys: DashMap<String, CacheKey>,
    trees: DashMap<String, String>,
    in_progress: Mutex<Vec<String>>,
}

impl<S: TreeSource + Send + Sync> Keys<S> {
    /// Create an engine over `registry`, resolving trees through `source`.
    pub fn new(registry: Arc<Registry>, source: S, arch: impl Into<String>) -> Self {
        Self {
            registry,
            source,
            arch: arch.into(),
            keys: DashMap::new(),
            trees: DashMap::new(),
            in_progress: Mutex::new(Vec::new()),
        }
    }

    /// Compute (or recall) the cache key of `name`.
    ///
    /// Idempotent: the second call for a name returns the identical key and
    /// performs no tree resolution.
    pub fn of<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<CacheKey>> {
        async move {
            if let Some(key) = self.keys.get(name) {
                return Ok(key.value().clone());
            }

            self.enter(name)?;
            let computed = self.compute(name).await;
            self.leave(name);

            let key = computed?;
            debug!(%name, %key, "cache key");
            self.keys.insert(String::from(name), key.clone());
            Ok(key)
        }
        .boxed()
    }

    /// The resolved tree identity for `def`, memoised per component name.
    ///
    /// Returns `None` for components without source coordinates.
    #[instrument(skip_all, fields(name = %def.name))]
    pub async fn tree(&self, def: &Definition) -> Result<Option<String>> {
        if let Some(tree) = &def.tree {
            return Ok(Some(tree.clone()));
        }
        let Some(repo) = &def.repo else {
            return Ok(None);
        };
        if let Some(tree) = self.trees.get(&def.name) {
            return Ok(Some(tree.value().clone()));
        }

        let Some(reference) = def.reference.as_deref() else {
            return Err(Fault::SourceUnresolvable {
                repo: repo.clone(),
                reference: String::from("(no ref declared)"),
            }
            .into());
        };
        let tree = self
            .source
            .tree(&def.name, repo, reference)
            .await
            .with_context(|| format!("resolve tree for '{}'", def.name))?;
        trace!(name = %def.name, %tree, "resolved tree");
        self.trees.insert(def.name.clone(), tree.clone());
        Ok(Some(tree))
    }

    async fn compute(&self, name: &str) -> Result<CacheKey> {
        let def = self.registry.require(name)?;
        let mut factors: BTreeMap<String, Value> = BTreeMap::new();
        factors.insert(String::from("arch"), Value::String(self.arch.clone()));

        for dep in &def.build_depends {
            let key = self.of(dep).await?;
            factors.insert(dep.clone(), Value::String(String::from(key.as_str())));
        }
        for content in &def.contents {
            let key = self.of(content).await?;
            factors.insert(content.clone(), Value::String(String::from(key.as_str())));
        }

        if let Some(tree) = self.tree(&def).await? {
            factors.insert(String::from("tree"), Value::String(tree));
        }

        for (step, commands) in &def.steps {
            if commands.is_empty() {
                continue;
            }
            factors.insert(
                step.clone(),
                serde_json::to_value(commands).context("serialise command list")?,
            );
        }

        if def.kind == Kind::Cluster {
            for system in &def.systems {
                let key = self.of(&system.path).await?;
                factors.insert(
                    system.path.clone(),
                    Value::String(String::from(key.as_str())),
                );
            }
        }

        // BTreeMap serialises with sorted keys; compact JSON keeps the
        // canonical form free of whitespace variation.
        let canonical = serde_json::to_vec(&factors).context("serialise hash factors")?;
        let digest = Sha256::digest(&canonical);
        Ok(CacheKey::new(&def.name, digest.as_slice()))
    }

    fn enter(&self, name: &str) -> Result<()> {
        let mut stack = self.in_progress.lock().expect("key stack poisoned");
        if stack.iter().any(|entry| entry == name) {
            bail!(
                "dependency cycle in catalogue: {} -> {name}",
                stack.join(" -> ")
            );
        }
        stack.push(String::from(name));
        Ok(())
    }

    fn leave(&self, name: &str) {
        let mut stack = self.in_progress.lock().expect("key stack poisoned");
        if let Some(position) = stack.iter().rposition(|entry| entry == name) {
            stack.remove(position);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::defs::{BuildMode, SystemRef};

    /// Tree source that returns a fixed tree and counts invocations.
    #[derive(Debug, Default)]
    struct FixedTrees {
        resolutions: AtomicUsize,
    }

    impl TreeSource for FixedTrees {
        fn tree<'a>(
            &'a self,
            _name: &'a str,
            repo: &'a str,
            reference: &'a str,
        ) -> BoxFuture<'a, Result<String>> {
            self.resolutions.fetch_add(1, Ordering::SeqCst);
            let tree = format!("{repo}:{reference}:tree");
            async move { Ok(tree) }.boxed()
        }
    }

    fn chunk(name: &str) -> Definition {
        Definition {
            name: String::from(name),
            ..Definition::default()
        }
    }

    fn engine(definitions: Vec<Definition>) -> Keys<FixedTrees> {
        Keys::new(
            Arc::new(Registry::new(definitions)),
            FixedTrees::default(),
            "x86_64",
        )
    }

    #[test_log::test(tokio::test)]
    async fn key_has_the_canonical_form() {
        let keys = engine(vec![chunk("core/libc")]);
        let key = keys.of("core/libc").await.expect("compute key");
        let (name, digest) = key.as_str().split_once('@').expect("name@digest");
        assert_eq!(name, "core-libc", "slashes become dashes");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn keys_parse_back_from_their_display_form() {
        let digest = hex::encode([0u8; 32]);
        let key: CacheKey = format!("core-libc@{digest}").parse().expect("well-formed");
        assert_eq!(key.as_str(), format!("core-libc@{digest}"));

        assert!("no-digest".parse::<CacheKey>().is_err());
        assert!(format!("core/libc@{digest}").parse::<CacheKey>().is_err());
        assert!("short@abc123".parse::<CacheKey>().is_err());
    }

    #[test_log::test(tokio::test)]
    async fn unrelated_fields_do_not_perturb_the_key() {
        let mut plain = chunk("widget");
        plain.build_depends = vec![String::from("a"), String::from("b")];
        let mut described = plain.clone();
        described.description = Some(String::from("a widget, but described"));
        described.build_depends = vec![String::from("b"), String::from("a")];

        let first = engine(vec![plain, chunk("a"), chunk("b")])
            .of("widget")
            .await
            .expect("key of plain widget");
        let second = engine(vec![described, chunk("a"), chunk("b")])
            .of("widget")
            .await
            .expect("key of described widget");
        assert_eq!(first, second);
    }

    #[test_log::test(tokio::test)]
    async fn command_lists_perturb_the_key_and_empty_lists_do_not() {
        let mut noisy = chunk("widget");
        noisy.steps.insert(
            String::from("build-commands"),
            vec![String::from("make everything")],
        );
        let mut vacuous = chunk("widget");
        vacuous.steps.insert(String::from("build-commands"), Vec::new());

        let base = engine(vec![chunk("widget")]).of("widget").await.expect("base");
        let noisy = engine(vec![noisy]).of("widget").await.expect("noisy");
        let vacuous = engine(vec![vacuous]).of("widget").await.expect("vacuous");
        assert_ne!(base, noisy, "command text is a hash factor");
        assert_eq!(base, vacuous, "an empty command list is not");
    }

    #[test_log::test(tokio::test)]
    async fn trees_resolve_once_and_keys_memoise() {
        let mut def = chunk("libc");
        def.repo = Some(String::from("upstream:glibc"));
        def.reference = Some(String::from("abc123"));
        let keys = engine(vec![def]);

        let first = keys.of("libc").await.expect("first key");
        let second = keys.of("libc").await.expect("second key");
        assert_eq!(first, second);
        assert_eq!(
            keys.source.resolutions.load(Ordering::SeqCst),
            1,
            "the resolver must be consulted exactly once",
        );
    }

    #[test_log::test(tokio::test)]
    async fn pinned_trees_skip_the_resolver() {
        let mut def = chunk("libc");
        def.repo = Some(String::from("upstream:glibc"));
        def.reference = Some(String::from("abc123"));
        def.tree = Some(String::from("feedface"));
        let keys = engine(vec![def]);

        keys.of("libc").await.expect("key with pinned tree");
        assert_eq!(keys.source.resolutions.load(Ordering::SeqCst), 0);
    }

    #[test_log::test(tokio::test)]
    async fn dependency_keys_fold_into_the_parent() {
        let mut stratum = chunk("core");
        stratum.kind = Kind::Stratum;
        stratum.contents = vec![String::from("libc")];
        let mut libc = chunk("libc");
        libc.build_mode = BuildMode::Bootstrap;

        let before = engine(vec![stratum.clone(), libc.clone()])
            .of("core")
            .await
            .expect("key before");

        libc.steps.insert(
            String::from("install-commands"),
            vec![String::from("make install")],
        );
        let after = engine(vec![stratum, libc])
            .of("core")
            .await
            .expect("key after");
        assert_ne!(before, after, "a content's key change must cascade");
    }

    #[test_log::test(tokio::test)]
    async fn cluster_keys_fold_referenced_systems() {
        let mut cluster = chunk("deploy");
        cluster.kind = Kind::Cluster;
        cluster.systems = vec![SystemRef {
            path: String::from("base-system"),
            subsystems: Vec::new(),
        }];
        let mut system = chunk("base-system");
        system.kind = Kind::System;

        let before = engine(vec![cluster.clone(), system.clone()])
            .of("deploy")
            .await
            .expect("cluster key");

        system.contents = vec![String::from("extra")];
        let after = engine(vec![cluster, system, chunk("extra")])
            .of("deploy")
            .await
            .expect("cluster key after system change");
        assert_ne!(before, after);
    }

    #[test_log::test(tokio::test)]
    async fn cycles_are_fatal_catalogue_errors() {
        let mut a = chunk("a");
        a.build_depends = vec![String::from("b")];
        let mut b = chunk("b");
        b.build_depends = vec![String::from("a")];

        let err = engine(vec![a, b]).of("a").await.expect_err("cycle must fail");
        assert!(err.to_string().contains("cycle"), "error names the cycle: {err}");
    }

    #[test_log::test(tokio::test)]
    async fn unknown_dependencies_fault() {
        let mut def = chunk("widget");
        def.build_depends = vec![String::from("phantom")];
        let err = engine(vec![def]).of("widget").await.expect_err("must fail");
        let fault = err.downcast_ref::<Fault>().expect("fault in report");
        assert!(matches!(fault, Fault::DefinitionMissing { name } if name == "phantom"));
    }
}
