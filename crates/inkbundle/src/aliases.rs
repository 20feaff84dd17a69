use std::path::PathBuf;

use indexmap::IndexMap;

use crate::config::Config;

/// Package name -> artifact path, in entry order; empty outside production
pub fn resolution_aliases(config: &Config) -> IndexMap<String, PathBuf> {
    if !config.mode.is_production() {
        return IndexMap::new();
    }
    config
        .entries
        .iter()
        .map(|entry| (entry.package.clone(), config.artifact_path(entry)))
        .collect()
}
