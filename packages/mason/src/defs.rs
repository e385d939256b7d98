//! The definition catalogue: component records, defaults, and the loader.
//!
//! Definitions are read once and are immutable for the rest of the run; the
//! scheduler never writes back into them. Resolved trees and cache keys live
//! in the scheduler-owned memo table instead.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use color_eyre::{Result, eyre::Context};
use enum_assoc::Assoc;
use serde::Deserialize;
use strum::Display;
use tracing::{debug, instrument, trace, warn};

use crate::error::Fault;

/// What a definition aggregates, and how its artifact is packaged.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Assoc, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[func(pub const fn as_str(&self) -> &str)]
pub enum Kind {
    /// A leaf buildable component with source and commands.
    #[assoc(as_str = "chunk")]
    #[default]
    Chunk,

    /// An aggregation of chunks packaged as a single artifact.
    #[assoc(as_str = "stratum")]
    Stratum,

    /// A bootable assembly containing one or more strata.
    /// Its artifact captures the whole assembly tree, not just `install`.
    #[assoc(as_str = "system")]
    System,

    /// A top-level grouping of systems. Never built directly.
    #[assoc(as_str = "cluster")]
    Cluster,
}

/// Whether a component builds inside a chroot or on the bare host.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Assoc, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[func(pub const fn as_str(&self) -> &str)]
pub enum BuildMode {
    /// Build inside a chroot populated from dependency artifacts.
    #[assoc(as_str = "staging")]
    #[default]
    Staging,

    /// Build without a chroot, using the host toolchain.
    #[assoc(as_str = "bootstrap")]
    Bootstrap,
}

/// A reference from a cluster to one of its systems.
#[derive(Clone, Debug, Deserialize)]
pub struct SystemRef {
    /// The name of the referenced system definition.
    pub path: String,

    /// Nested system names assembled alongside the parent.
    #[serde(default)]
    pub subsystems: Vec<String>,
}

/// A device node to recreate in a component's install tree.
#[derive(Clone, Debug, Deserialize)]
pub struct Device {
    /// `c` for character devices, `b` for block devices.
    #[serde(rename = "type")]
    pub kind: String,

    /// Path of the node, relative to the install root.
    pub filename: String,

    /// Device major number.
    pub major: u32,

    /// Device minor number.
    pub minor: u32,

    /// Octal permission string, e.g. `0666`.
    #[serde(default)]
    pub permissions: Option<String>,
}

/// One buildable unit as declared in the catalogue.
#[derive(Clone, Debug, Default)]
pub struct Definition {
    /// Unique name within the catalogue.
    pub name: String,

    /// Aggregation and packaging rules.
    pub kind: Kind,

    /// Free-form description. Never part of the cache key.
    pub description: Option<String>,

    /// Symbolic remote alias, e.g. `upstream:glibc`.
    pub repo: Option<String>,

    /// Symbolic ref within `repo`: branch, tag, or commit.
    pub reference: Option<String>,

    /// Pre-resolved immutable tree identity, when the catalogue pins one.
    pub tree: Option<String>,

    /// Names that must be cache-resolved and installed into the sandbox
    /// before this component builds.
    pub build_depends: Vec<String>,

    /// Names whose artifacts are staged into this component's output.
    pub contents: Vec<String>,

    /// For clusters: the systems this cluster aggregates.
    pub systems: Vec<SystemRef>,

    /// Named default recipe, e.g. `autotools`.
    pub build_system: Option<String>,

    /// Chroot or bare-host execution.
    pub build_mode: BuildMode,

    /// Required architecture; mismatching hosts skip the component.
    pub arch: Option<String>,

    /// Device nodes recreated after the install step.
    pub devices: Vec<Device>,

    /// Build-step command lists declared directly on the definition,
    /// keyed by step name. Boolean literals are already normalised to the
    /// `true`/`false` shell builtins.
    pub steps: BTreeMap<String, Vec<String>>,
}

impl Definition {
    /// The command list this definition declares for `step`, if any.
    pub fn commands(&self, step: &str) -> Option<&[String]> {
        self.steps.get(step).map(Vec::as_slice)
    }
}

/// Raw deserialisation target; [`RawDefinition::cook`] turns it into the
/// public record.
#[derive(Debug, Deserialize)]
struct RawDefinition {
    name: String,
    #[serde(default)]
    kind: Kind,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    repo: Option<String>,
    #[serde(default, rename = "ref")]
    reference: Option<String>,
    #[serde(default)]
    tree: Option<String>,
    #[serde(default, rename = "build-depends")]
    build_depends: Vec<String>,
    #[serde(default)]
    contents: Vec<String>,
    #[serde(default)]
    systems: Vec<SystemRef>,
    #[serde(default, rename = "build-system")]
    build_system: Option<String>,
    #[serde(default, rename = "build-mode")]
    build_mode: BuildMode,
    #[serde(default)]
    arch: Option<String>,
    #[serde(default)]
    devices: Vec<Device>,
    #[serde(flatten)]
    rest: BTreeMap<String, serde_yaml::Value>,
}

/// A command list entry: either a shell command, or a bare boolean that
/// normalises to the shell builtin of the same name.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandEntry {
    Shell(String),
    Literal(bool),
}

impl From<CommandEntry> for String {
    fn from(entry: CommandEntry) -> Self {
        match entry {
            CommandEntry::Shell(command) => command,
            CommandEntry::Literal(true) => String::from("true"),
            CommandEntry::Literal(false) => String::from("false"),
        }
    }
}

impl RawDefinition {
    fn cook(self) -> Result<Definition> {
        let mut steps = BTreeMap::new();
        for (key, value) in self.rest {
            if !key.ends_with("-commands") {
                trace!(name = %self.name, %key, "ignored unknown definition field");
                continue;
            }
            let entries: Vec<CommandEntry> = serde_yaml::from_value(value)
                .with_context(|| format!("parse command list '{key}' of '{}'", self.name))?;
            steps.insert(key, entries.into_iter().map(String::from).collect());
        }
        Ok(Definition {
            name: self.name,
            kind: self.kind,
            description: self.description,
            repo: self.repo,
            reference: self.reference,
            tree: self.tree,
            build_depends: self.build_depends,
            contents: self.contents,
            systems: self.systems,
            build_system: self.build_system,
            build_mode: self.build_mode,
            arch: self.arch,
            devices: self.devices,
            steps,
        })
    }
}

/// A recipe: per-step command lists plus the environment it asks for.
#[derive(Clone, Debug, Default)]
pub struct BuildSystem {
    /// Recipe name as referenced by `build-system`.
    pub name: String,

    /// Default command lists, keyed by step name.
    pub commands: BTreeMap<String, Vec<String>>,

    /// Directories prepended to the sandbox PATH.
    pub extra_path: Vec<String>,

    /// Environment variables the recipe requests during builds.
    pub env: BTreeMap<String, String>,
}

/// The canonical step sequence and the built-in recipe library.
#[derive(Clone, Debug)]
pub struct Defaults {
    /// Step names in execution order.
    pub build_steps: Vec<String>,
    build_systems: BTreeMap<String, BuildSystem>,
}

impl Default for Defaults {
    fn default() -> Self {
        let build_steps = [
            "pre-configure-commands",
            "configure-commands",
            "post-configure-commands",
            "pre-build-commands",
            "build-commands",
            "post-build-commands",
            "pre-install-commands",
            "install-commands",
            "post-install-commands",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let mut build_systems = BTreeMap::new();
        for (name, commands) in [
            ("manual", vec![]),
            (
                "autotools",
                vec![
                    (
                        "configure-commands",
                        vec![concat!(
                            "export NOCONFIGURE=1; ",
                            "if [ -e autogen ]; then ./autogen; ",
                            "elif [ -e autogen.sh ]; then ./autogen.sh; ",
                            "elif [ -e bootstrap ]; then ./bootstrap; ",
                            "elif [ ! -e ./configure ]; then autoreconf -ivf; fi; ",
                            "./configure --prefix=\"$PREFIX\""
                        )],
                    ),
                    ("build-commands", vec!["make"]),
                    (
                        "install-commands",
                        vec!["make DESTDIR=\"$DESTDIR\" install"],
                    ),
                ],
            ),
            (
                "cmake",
                vec![
                    (
                        "configure-commands",
                        vec!["cmake -DCMAKE_INSTALL_PREFIX=\"$PREFIX\" -DCMAKE_BUILD_TYPE=Release ."],
                    ),
                    ("build-commands", vec!["make"]),
                    (
                        "install-commands",
                        vec!["make DESTDIR=\"$DESTDIR\" install"],
                    ),
                ],
            ),
            (
                "python-distutils",
                vec![
                    ("build-commands", vec!["python setup.py build"]),
                    (
                        "install-commands",
                        vec!["python setup.py install --prefix \"$PREFIX\" --root \"$DESTDIR\""],
                    ),
                ],
            ),
        ] {
            let commands = commands
                .into_iter()
                .map(|(step, list)| {
                    (
                        String::from(step),
                        list.into_iter().map(String::from).collect(),
                    )
                })
                .collect();
            build_systems.insert(
                String::from(name),
                BuildSystem {
                    name: String::from(name),
                    commands,
                    extra_path: Vec::new(),
                    env: BTreeMap::new(),
                },
            );
        }

        Self {
            build_steps,
            build_systems,
        }
    }
}

impl Defaults {
    /// Look up a recipe by name, falling back to `manual`.
    pub fn build_system(&self, name: &str) -> &BuildSystem {
        self.build_systems
            .get(name)
            .unwrap_or_else(|| &self.build_systems["manual"])
    }

    /// Probe a checked-out source tree's file listing for a recipe.
    pub fn detect_build_system<S: AsRef<str>>(&self, files: &[S]) -> &str {
        let has = |needle: &str| files.iter().any(|file| file.as_ref() == needle);
        if has("configure.ac") || has("configure.in") || has("autogen.sh") {
            "autotools"
        } else if has("CMakeLists.txt") {
            "cmake"
        } else if has("setup.py") {
            "python-distutils"
        } else {
            "manual"
        }
    }
}

/// Read-only lookup from component name to its definition record.
#[derive(Clone, Debug)]
pub struct Registry {
    definitions: BTreeMap<String, Arc<Definition>>,

    /// Step sequence and recipe library shared by every component.
    pub defaults: Defaults,
}

impl Registry {
    /// Build a registry from already-cooked definitions.
    pub fn new(definitions: impl IntoIterator<Item = Definition>) -> Self {
        let definitions = definitions
            .into_iter()
            .map(|def| (def.name.clone(), Arc::new(def)))
            .collect();
        Self {
            definitions,
            defaults: Defaults::default(),
        }
    }

    /// Parse every `.yaml`/`.yml` file under `dir` into the registry.
    #[instrument]
    pub async fn load_dir(dir: impl AsRef<Path> + std::fmt::Debug) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let definitions = tokio::task::spawn_blocking(move || -> Result<Vec<Definition>> {
            let mut definitions = Vec::new();
            for entry in walkdir::WalkDir::new(&dir).sort_by_file_name() {
                let entry = entry.context("walk definitions")?;
                let path = entry.path();
                let is_yaml = path
                    .extension()
                    .is_some_and(|ext| ext == "yaml" || ext == "yml");
                if !entry.file_type().is_file() || !is_yaml {
                    continue;
                }
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("read definition: {path:?}"))?;
                let raw: RawDefinition = serde_yaml::from_str(&content)
                    .with_context(|| format!("parse definition: {path:?}"))?;
                definitions.push(raw.cook()?);
            }
            Ok(definitions)
        })
        .await
        .context("join task")??;

        debug!(count = definitions.len(), "loaded definitions");
        Ok(Self::new(definitions))
    }

    /// Look up a definition by name.
    pub fn get(&self, name: &str) -> Option<Arc<Definition>> {
        self.definitions.get(name).cloned()
    }

    /// Look up a definition, failing with [`Fault::DefinitionMissing`].
    pub fn require(&self, name: &str) -> Result<Arc<Definition>> {
        self.get(name).ok_or_else(|| {
            warn!(%name, "unknown component name");
            Fault::DefinitionMissing {
                name: String::from(name),
            }
            .into()
        })
    }

    /// Iterate all definitions in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Definition>> {
        self.definitions.values()
    }
}
