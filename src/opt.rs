use std::{
    fmt,
    io::{Read, Seek},
};

use tracing::info;

use crate::{
    bounds::recompute_position_bounds,
    config::OptimizeConfig,
    dedup::{dedup, DedupReport},
    document::Document,
    error::Result,
    info::Stats,
    io::{read_glb, write_glb},
    join::{join, JoinReport},
    progress::{Logged, Progress},
    prune::{prune, PruneReport},
    weld::{weld, WeldReport},
};

/// What each pass did. A pass that was skipped has no report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizeReport {
    pub before: Stats,
    pub after: Stats,
    pub dedup: Option<DedupReport>,
    pub join: Option<JoinReport>,
    pub weld: Option<WeldReport>,
    pub prune: Option<PruneReport>,
    /// POSITION accessors whose bounds were rewritten.
    pub bounds: usize,
}

impl fmt::Display for OptimizeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== Before ==")?;
        write!(f, "{}", self.before)?;
        if let Some(report) = &self.dedup {
            writeln!(f, "== Deduplicate ==")?;
            write!(f, "{report}")?;
        }
        if let Some(report) = &self.join {
            writeln!(f, "== Join ==")?;
            write!(f, "{report}")?;
        }
        if let Some(report) = &self.weld {
            writeln!(f, "== Weld ==")?;
            write!(f, "{report}")?;
        }
        if let Some(report) = &self.prune {
            writeln!(f, "== Prune ==")?;
            write!(f, "{report}")?;
        }
        writeln!(f, "== After ==")?;
        write!(f, "{}", self.after)
    }
}

/// Runs deduplication, joining, welding and pruning in that order, then
/// refreshes position bounds. Joining runs before welding so that merged
/// primitives are welded as a whole.
pub fn run_passes(
    doc: &mut Document,
    config: &OptimizeConfig,
    progress: &mut dyn Progress,
) -> Result<OptimizeReport> {
    let mut report = OptimizeReport {
        before: Stats::of(doc),
        ..Default::default()
    };
    let skip = config.skip;

    if !skip.dedup {
        report.dedup = Some(dedup(doc, &config.dedup, progress)?);
    }
    if !skip.join {
        report.join = Some(join(doc, &config.join, progress)?);
    }
    if !skip.weld {
        report.weld = Some(weld(doc, &config.weld, progress)?);
    }
    if !skip.prune {
        report.prune = Some(prune(doc, &config.prune, progress)?);
    }
    if config.recompute_bounds {
        report.bounds = recompute_position_bounds(doc);
    }

    report.after = Stats::of(doc);
    info!(
        before = report.before.buffer_bytes,
        after = report.after.buffer_bytes,
        "optimization finished"
    );
    Ok(report)
}

/// Reads a GLB, optimizes it and returns the new GLB bytes.
pub fn optimize<R: Read + Seek>(reader: &mut R, config: &OptimizeConfig) -> Result<Vec<u8>> {
    let mut doc = read_glb(reader)?;
    run_passes(&mut doc, config, &mut Logged)?;
    write_glb(&doc)
}
