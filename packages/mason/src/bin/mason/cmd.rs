use clap::Parser;

pub mod assemble;

/// Reproducible, content-addressed build orchestrator for component-based
/// systems.
#[derive(Parser, Debug)]
#[command(name = "mason", version, about)]
pub enum Cmd {
    /// Assemble targets and every transitive dependency into artifacts.
    Assemble(assemble::Options),
}
