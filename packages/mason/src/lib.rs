//! Library for `mason`.
//!
//! mason is a reproducible, content-addressed build orchestrator for
//! component-based systems. Given a declarative catalogue of components
//! (leaf chunks, aggregate strata, bootable systems, and clusters of
//! systems), it resolves build inputs, fetches source trees from remote
//! version control, executes build recipes inside isolated
//! filesystem/mount namespaces, and stores resulting artifacts in a cache
//! keyed by the transitive hash of every input that could influence the
//! output.
//!
//! This library exists to share code between the `mason` binary and the
//! integration tests; it is not a supported public API.

pub mod artifacts;
pub mod assembly;
pub mod defs;
pub mod error;
pub mod fs;
pub mod kbas;
pub mod keys;
pub mod repos;
pub mod sandbox;
pub mod settings;
pub mod tree;
