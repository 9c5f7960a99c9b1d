//! Resource-graph optimizer for glTF binaries: deduplicates, joins, welds and
//! prunes the indexed arrays of a `.glb` while keeping every cross-reference
//! valid.

pub mod accessor;
pub mod bounds;
pub mod config;
pub mod dedup;
pub mod document;
pub mod error;
pub mod extensions;
pub mod info;
pub mod io;
pub mod join;
pub mod opt;
pub mod progress;
pub mod prune;
pub mod remap;
pub mod weld;

#[cfg(test)]
mod fixtures;

pub use document::Document;
pub use error::{Error, Result};

pub mod prelude {
    pub use crate::{
        config::{OptimizeConfig, SkipPasses},
        dedup::{dedup, DedupOptions, DedupReport},
        document::Document,
        error::{Error, Result},
        io::{read_glb, write_glb},
        join::{join, JoinOptions, JoinReport},
        opt::{optimize, run_passes, OptimizeReport},
        progress::{JsonLines, Logged, Progress, Silent},
        prune::{prune, PruneOptions, PruneReport},
        weld::{weld, WeldOptions, WeldReport},
    };
}
