//! Vertex welding: collapse bit-identical vertices of a primitive into shared
//! indices.

use std::fmt;

use gltf::json::{
    self,
    buffer::Target,
    mesh::{Mode, Semantic},
    validation::Checked,
    Index,
};
use hashbrown::HashTable;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3;

use crate::{
    accessor::{AccessorView, IndexWidth},
    bounds,
    document::{Document, StagedAccessor, Staging},
    error::{Error, FailureCounts, Result},
    extensions,
    progress::{Event, Progress},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WeldOptions {
    /// Re-weld primitives that already carry an index accessor.
    pub overwrite: bool,
    /// Fail a primitive on an out-of-range index instead of dropping the face
    /// that holds it.
    pub strict: bool,
}

impl Default for WeldOptions {
    fn default() -> Self {
        Self {
            overwrite: true,
            strict: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeldReport {
    pub primitives: usize,
    pub welded: usize,
    pub skipped: usize,
    pub vertices_before: usize,
    pub vertices_after: usize,
    /// Indices dropped because they addressed a vertex past the end.
    pub dropped_indices: usize,
    pub failures: FailureCounts,
}

impl fmt::Display for WeldReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Welded {} of {} primitives: {} -> {} vertices",
            self.welded, self.primitives, self.vertices_before, self.vertices_after
        )?;
        if self.dropped_indices > 0 {
            writeln!(f, "Dropped {} out-of-range indices", self.dropped_indices)?;
        }
        if self.failures.total() > 0 {
            writeln!(f, "Failed primitives: {}", self.failures)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Skipped(&'static str),
    /// Already welded with the narrowest index width.
    Unchanged,
    Welded {
        before: usize,
        after: usize,
        dropped: usize,
    },
}

/// Welds every primitive of every mesh. Failures are local to the primitive.
pub fn weld(
    doc: &mut Document,
    options: &WeldOptions,
    progress: &mut dyn Progress,
) -> Result<WeldReport> {
    const STAGE: &str = "weld";
    let mut report = WeldReport::default();
    let meshes = doc.root.meshes.len();

    for m in 0..meshes {
        let message = format!("Mesh {}/{meshes}", m + 1);
        progress.report(&Event::new(STAGE, &message).fraction(m as f64 / meshes as f64));

        for p in 0..doc.root.meshes[m].primitives.len() {
            report.primitives += 1;
            match weld_primitive(doc, m, p, options) {
                Ok(Outcome::Welded {
                    before,
                    after,
                    dropped,
                }) => {
                    report.welded += 1;
                    report.vertices_before += before;
                    report.vertices_after += after;
                    report.dropped_indices += dropped;
                }
                Ok(Outcome::Unchanged) => {}
                Ok(Outcome::Skipped(reason)) => {
                    debug!(mesh = m, primitive = p, reason, "weld skipped");
                    report.skipped += 1;
                }
                Err(err) => {
                    warn!(mesh = m, primitive = p, "weld failed: {err}");
                    let details = err.to_string();
                    progress.report(&Event::new(STAGE, "primitive skipped").details(&details));
                    report.failures.record(&err);
                }
            }
        }
    }

    progress.report(&Event::new(STAGE, "done").fraction(1.0));
    info!(
        welded = report.welded,
        before = report.vertices_before,
        after = report.vertices_after,
        "welding finished"
    );
    Ok(report)
}

/// Raw per-vertex records of every attribute and morph-target stream.
struct VertexStream<'a> {
    views: Vec<AccessorView<'a>>,
}

impl VertexStream<'_> {
    fn hash(&self, vertex: usize) -> u64 {
        let mut hasher = Xxh3::new();
        for view in &self.views {
            hasher.update(view.element(vertex).unwrap_or_default());
        }
        hasher.digest()
    }

    fn equal(&self, a: usize, b: usize) -> bool {
        self.views
            .iter()
            .all(|view| view.element(a) == view.element(b))
    }
}

/// Where a rebuilt stream goes back into the primitive.
#[derive(Debug, Clone)]
enum Slot {
    Attribute(Checked<Semantic>),
    Morph(usize, Semantic),
}

/// Keeps whole faces of list modes; other modes lose single indices.
fn face_size(mode: Mode) -> usize {
    match mode {
        Mode::Triangles => 3,
        Mode::Lines => 2,
        _ => 1,
    }
}

/// Drops every face holding an index `>= vertex_count`.
fn drop_out_of_range(
    indices: Vec<u32>,
    vertex_count: usize,
    mode: Mode,
    strict: bool,
) -> Result<(Vec<u32>, usize)> {
    let valid = |index: &u32| (*index as usize) < vertex_count;
    if indices.iter().all(valid) {
        return Ok((indices, 0));
    }
    if strict {
        return Err(Error::Structural(format!(
            "index stream addresses vertices past {vertex_count}"
        )));
    }
    let size = face_size(mode);
    let kept: Vec<u32> = indices
        .chunks(size)
        .filter(|face| face.len() == size && face.iter().all(valid))
        .flatten()
        .copied()
        .collect();
    let dropped = indices.len() - kept.len();
    Ok((kept, dropped))
}

pub fn weld_primitive(
    doc: &mut Document,
    mesh: usize,
    primitive: usize,
    options: &WeldOptions,
) -> Result<Outcome> {
    let source = doc
        .root
        .meshes
        .get(mesh)
        .and_then(|m| m.primitives.get(primitive))
        .ok_or_else(|| Error::Structural(format!("mesh {mesh} primitive {primitive} missing")))?;

    let mode = match source.mode {
        Checked::Valid(mode) => mode,
        Checked::Invalid => return Err(Error::UnsupportedFormat("unknown draw mode".into())),
    };
    if mode == Mode::Points {
        return Ok(Outcome::Skipped("point cloud"));
    }
    if source.indices.is_some() && !options.overwrite {
        return Ok(Outcome::Skipped("already indexed"));
    }
    if extensions::draco_buffer_view(source).is_some() {
        return Ok(Outcome::Skipped("compressed"));
    }

    let position = source
        .attributes
        .get(&Checked::Valid(Semantic::Positions))
        .copied()
        .ok_or_else(|| Error::Structural("primitive has no POSITION".into()))?;
    let vertex_count = AccessorView::resolve(doc, position)?.count();
    if vertex_count == 0 {
        return Ok(Outcome::Skipped("empty"));
    }

    let mut slots = Vec::new();
    let mut views = Vec::new();
    let mut sources = Vec::new();
    let morphs = source.targets.iter().flatten().enumerate().flat_map(|(t, target)| {
        [
            (Semantic::Positions, target.positions),
            (Semantic::Normals, target.normals),
            (Semantic::Tangents, target.tangents),
        ]
        .into_iter()
        .filter_map(move |(semantic, accessor)| Some((Slot::Morph(t, semantic), accessor?)))
    });
    let streams = source
        .attributes
        .iter()
        .map(|(semantic, &accessor)| (Slot::Attribute(semantic.clone()), accessor))
        .chain(morphs);
    for (slot, accessor) in streams {
        let view = AccessorView::resolve(doc, accessor)?;
        if view.count() != vertex_count {
            return Err(Error::Structural(format!(
                "accessor {} holds {} elements for {vertex_count} vertices",
                accessor.value(),
                view.count()
            )));
        }
        slots.push(slot);
        views.push(view);
        sources.push(accessor);
    }

    let (indices, current_width) = match source.indices {
        Some(accessor) => {
            let view = AccessorView::resolve(doc, accessor)?;
            let width = IndexWidth::of(view.format().component);
            (view.read_indices()?, width)
        }
        None => ((0..vertex_count as u32).collect(), None),
    };
    let (indices, dropped) = drop_out_of_range(indices, vertex_count, mode, options.strict)?;
    if indices.is_empty() {
        if dropped > 0 {
            return Err(Error::Structural(format!(
                "every face addresses vertices past {vertex_count}"
            )));
        }
        return Ok(Outcome::Skipped("no faces"));
    }

    let stream = VertexStream { views };
    let mut table: HashTable<u32> =
        HashTable::with_capacity((vertex_count + vertex_count / 4).next_power_of_two());
    let mut remap = vec![u32::MAX; vertex_count];
    let mut welded = 0u32;
    for &index in &indices {
        let vertex = index as usize;
        if remap[vertex] != u32::MAX {
            continue;
        }
        let hash = stream.hash(vertex);
        match table.find(hash, |&other| stream.equal(other as usize, vertex)) {
            Some(&canonical) => remap[vertex] = remap[canonical as usize],
            None => {
                table.insert_unique(hash, index, |&other| stream.hash(other as usize));
                remap[vertex] = welded;
                welded += 1;
            }
        }
    }
    let after = welded as usize;

    let width = IndexWidth::for_vertex_count(after);
    let identity = remap.iter().enumerate().all(|(i, &to)| to as usize == i);
    if identity && dropped == 0 && current_width == Some(width) {
        return Ok(Outcome::Unchanged);
    }

    let mut staging = Staging::new();
    let remapped: Vec<u32> = indices.iter().map(|&i| remap[i as usize]).collect();
    staging.stage(
        StagedAccessor::new(width.encode(&remapped), width.format(), remapped.len())
            .target(Target::ElementArrayBuffer),
    );

    for ((slot, view), &accessor) in slots.iter().zip(&stream.views).zip(&sources) {
        let element = view.width();
        let mut data = vec![0u8; after * element];
        let mut written = vec![false; after];
        for &index in &indices {
            let to = remap[index as usize] as usize;
            if written[to] {
                continue;
            }
            written[to] = true;
            if let Some(bytes) = view.element(index as usize) {
                data[to * element..(to + 1) * element].copy_from_slice(bytes);
            }
        }

        let mut staged = StagedAccessor::new(data, view.format(), after);
        let is_position = matches!(slot, Slot::Attribute(Checked::Valid(Semantic::Positions)));
        staged = if is_position {
            match bounds::vec3_bounds(staged.data.chunks(element)) {
                Some(b) => {
                    let (min, max) = bounds::to_json(b);
                    staged.bounds(Some(min), Some(max))
                }
                None => staged,
            }
        } else {
            let original = &doc.root.accessors[accessor.value()];
            let (min, max) = (original.min.clone(), original.max.clone());
            staged.bounds(min, max)
        };
        if matches!(slot, Slot::Attribute(_)) {
            staged = staged.target(Target::ArrayBuffer);
        }
        staging.stage(staged);
    }
    drop(stream);

    let committed = staging.commit(doc);
    let primitive = &mut doc.root.meshes[mesh].primitives[primitive];
    primitive.indices = committed.first().copied();
    for (slot, &accessor) in slots.into_iter().zip(&committed[1..]) {
        match slot {
            Slot::Attribute(semantic) => {
                primitive.attributes.insert(semantic, accessor);
            }
            Slot::Morph(t, semantic) => {
                if let Some(target) = primitive.targets.as_mut().and_then(|targets| targets.get_mut(t)) {
                    let field = match semantic {
                        Semantic::Positions => &mut target.positions,
                        Semantic::Normals => &mut target.normals,
                        _ => &mut target.tangents,
                    };
                    *field = Some(accessor);
                }
            }
        }
    }

    Ok(Outcome::Welded {
        before: vertex_count,
        after,
        dropped,
    })
}

/// Element count of the primitive's POSITION accessor.
pub fn vertex_count(doc: &Document, primitive: &json::mesh::Primitive) -> Result<usize> {
    let position = primitive
        .attributes
        .get(&Checked::Valid(Semantic::Positions))
        .copied()
        .ok_or_else(|| Error::Structural("primitive has no POSITION".into()))?;
    Ok(AccessorView::resolve(doc, position)?.count())
}
