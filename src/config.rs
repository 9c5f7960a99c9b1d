//! Pipeline settings, loadable from TOML.
//!
//! ```toml
//! recompute_bounds = true
//!
//! [skip]
//! join = true
//!
//! [dedup]
//! keep_unique_names = true
//!
//! [weld]
//! strict = true
//!
//! [prune]
//! keep_extras = true
//! ```

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    dedup::DedupOptions, error::Result, join::JoinOptions, prune::PruneOptions,
    weld::WeldOptions,
};

/// Passes to leave out of the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SkipPasses {
    pub dedup: bool,
    pub join: bool,
    pub weld: bool,
    pub prune: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizeConfig {
    pub skip: SkipPasses,
    pub dedup: DedupOptions,
    pub weld: WeldOptions,
    pub join: JoinOptions,
    pub prune: PruneOptions,
    /// Refresh POSITION `min`/`max` once every pass has run.
    pub recompute_bounds: bool,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            skip: SkipPasses::default(),
            dedup: DedupOptions::default(),
            weld: WeldOptions::default(),
            join: JoinOptions::default(),
            prune: PruneOptions::default(),
            recompute_bounds: true,
        }
    }
}

impl OptimizeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }
}
