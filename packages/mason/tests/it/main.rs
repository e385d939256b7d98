use std::{path::Path, sync::Arc, time::Duration};

use mason::{
    defs::{Definition, Registry},
    settings::Settings,
};

pub mod assembly;
pub mod checkout;

/// Settings rooted in a temporary directory, tuned for fast tests.
pub fn test_settings(root: &Path) -> Arc<Settings> {
    Arc::new(
        Settings::builder()
            .artifacts(root.join("artifacts"))
            .gits(root.join("gits"))
            .tmp(root.join("tmp"))
            .ccache_dir(root.join("ccache"))
            .no_ccache(true)
            .timeout(Duration::from_millis(300))
            .build(),
    )
}

/// A minimal chunk definition with the given name.
pub fn chunk(name: &str) -> Definition {
    Definition {
        name: String::from(name),
        ..Definition::default()
    }
}

/// A registry over the given definitions.
pub fn registry(definitions: Vec<Definition>) -> Arc<Registry> {
    Arc::new(Registry::new(definitions))
}
