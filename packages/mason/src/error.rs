//! The fault taxonomy shared by the whole crate.
//!
//! Faults are embedded in [`color_eyre::Report`]s so that call sites keep the
//! usual `.context(...)` texture; the scheduler downcasts where its behaviour
//! depends on the class of failure. Lock contention is intentionally not a
//! fault: see [`crate::assembly::Claim`].

use std::path::PathBuf;

use thiserror::Error;

/// A fatal failure class.
///
/// Every variant terminates the run in single-worker mode. In multi-worker
/// mode, faults raised while holding a claim are logged and swallowed so a
/// sibling worker can retry the key.
#[derive(Debug, Error)]
pub enum Fault {
    /// A name was referenced that the catalogue does not define.
    #[error("no definition found for '{name}'")]
    DefinitionMissing {
        /// The unknown component name.
        name: String,
    },

    /// A symbolic ref could not be resolved to a tree in any mirror,
    /// and no remote tree was available.
    #[error("could not resolve '{reference}' in {repo}")]
    SourceUnresolvable {
        /// The repository coordinate as written in the definition.
        repo: String,
        /// The symbolic ref that failed to resolve.
        reference: String,
    },

    /// A build-step command exited non-zero.
    #[error("build command failed for '{name}': {command}")]
    BuildFailed {
        /// The component being built.
        name: String,
        /// The command that failed, verbatim.
        command: String,
    },

    /// The artifact store could not be read or written.
    #[error("artifact store failure at {path:?}")]
    Storage {
        /// The blob or unpack path involved.
        path: PathBuf,
    },

    /// Namespace or chroot setup failed before the build command ran.
    #[error("sandbox setup failed for '{name}'")]
    Sandbox {
        /// The component whose sandbox could not be prepared.
        name: String,
    },
}
