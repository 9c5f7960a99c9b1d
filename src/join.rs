//! Primitive joining: concatenate compatible primitives of a mesh into one.

use std::fmt;

use gltf::json::{
    self,
    accessor::{ComponentType, Type},
    buffer::Target,
    mesh::{Mode, Semantic},
    validation::Checked,
    Index,
};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    accessor::{AccessorView, ElementFormat, IndexWidth},
    bounds,
    document::{Document, StagedAccessor, Staging},
    error::{Error, FailureCounts, Result},
    extensions,
    progress::{Event, Progress},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JoinOptions {
    /// Carry the mesh name in every group key, so groups never mix
    /// primitives from differently named meshes.
    pub keep_named: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinReport {
    pub meshes_modified: usize,
    pub groups_merged: usize,
    pub primitives_removed: usize,
    /// Groups abandoned and left untouched.
    pub failures: FailureCounts,
}

impl fmt::Display for JoinReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.groups_merged == 0 {
            writeln!(f, "No compatible primitives found")?;
        } else {
            writeln!(f, "Meshes modified: {}", self.meshes_modified)?;
            writeln!(f, "Groups merged: {}", self.groups_merged)?;
            writeln!(f, "Primitives removed: {}", self.primitives_removed)?;
        }
        if self.failures.total() > 0 {
            writeln!(f, "Groups left unjoined: {}", self.failures)?;
        }
        Ok(())
    }
}

/// Primitives sharing a key can be concatenated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct JoinKey {
    material: Option<u32>,
    mode: u32,
    indexed: bool,
    attributes: Vec<(String, (u32, usize, bool))>,
    extensions: String,
    mesh: Option<String>,
}

fn mode_code(mode: Mode) -> u32 {
    match mode {
        Mode::Points => 0,
        Mode::Lines => 1,
        Mode::LineLoop => 2,
        Mode::LineStrip => 3,
        Mode::Triangles => 4,
        Mode::TriangleStrip => 5,
        Mode::TriangleFan => 6,
    }
}

pub fn semantic_name(semantic: &Checked<Semantic>) -> Option<String> {
    match serde_json::to_value(semantic).ok()? {
        serde_json::Value::String(name) => Some(name),
        _ => None,
    }
}

/// `None` for primitives that never join: morph targets, compressed data,
/// strip/fan/loop topologies and unreadable metadata.
fn join_key(
    doc: &Document,
    primitive: &json::mesh::Primitive,
    mesh: Option<&str>,
) -> Option<JoinKey> {
    if primitive.targets.as_ref().is_some_and(|targets| !targets.is_empty()) {
        return None;
    }
    if extensions::draco_buffer_view(primitive).is_some() {
        return None;
    }
    let mode = match primitive.mode {
        Checked::Valid(mode @ (Mode::Points | Mode::Lines | Mode::Triangles)) => mode,
        _ => return None,
    };
    let mut attributes = primitive
        .attributes
        .iter()
        .map(|(semantic, accessor)| {
            let accessor = doc.root.accessors.get(accessor.value())?;
            let format = ElementFormat::of(accessor).ok()?;
            Some((semantic_name(semantic)?, format.key()))
        })
        .collect::<Option<Vec<_>>>()?;
    attributes.sort();
    Some(JoinKey {
        material: primitive.material.map(|m| m.value() as u32),
        mode: mode_code(mode),
        indexed: primitive.indices.is_some(),
        attributes,
        extensions: extensions::canonical(&primitive.extensions),
        mesh: mesh.map(str::to_string),
    })
}

/// Groups of at least two primitives, in order of first appearance.
fn candidate_groups(
    doc: &Document,
    mesh: &json::Mesh,
    options: &JoinOptions,
) -> Vec<Vec<usize>> {
    let name = mesh.name.as_deref().filter(|_| options.keep_named);
    let mut slots: HashMap<JoinKey, usize> = HashMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (p, primitive) in mesh.primitives.iter().enumerate() {
        let Some(key) = join_key(doc, primitive, name) else {
            debug!(primitive = p, "primitive excluded from joining");
            continue;
        };
        let slot = *slots.entry(key).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(p);
    }
    groups.retain(|group| group.len() >= 2);
    groups
}

pub fn join(
    doc: &mut Document,
    options: &JoinOptions,
    progress: &mut dyn Progress,
) -> Result<JoinReport> {
    const STAGE: &str = "join";
    let mut report = JoinReport::default();
    let meshes = doc.root.meshes.len();

    for m in 0..meshes {
        let message = format!("Mesh {}/{meshes}", m + 1);
        progress.report(&Event::new(STAGE, &message).fraction(m as f64 / meshes as f64));

        let mesh = &doc.root.meshes[m];
        if mesh.primitives.len() < 2 {
            continue;
        }
        let groups = candidate_groups(doc, mesh, options);

        let mut merged = Vec::new();
        let mut removed = vec![false; doc.root.meshes[m].primitives.len()];
        for group in &groups {
            let staged = match stage_group(doc, m, group) {
                Ok(staged) => staged,
                Err(err) => {
                    warn!(mesh = m, primitives = ?group, "join abandoned: {err}");
                    let details = err.to_string();
                    progress.report(&Event::new(STAGE, "group left unjoined").details(&details));
                    report.failures.record(&err);
                    continue;
                }
            };
            merged.push(staged.commit(doc));
            for &p in group {
                removed[p] = true;
            }
            report.groups_merged += 1;
            report.primitives_removed += group.len() - 1;
        }

        if merged.is_empty() {
            continue;
        }
        let primitives = &mut doc.root.meshes[m].primitives;
        let mut position = 0;
        primitives.retain(|_| {
            position += 1;
            !removed[position - 1]
        });
        primitives.extend(merged);
        report.meshes_modified += 1;
    }

    progress.report(&Event::new(STAGE, "done").fraction(1.0));
    info!(
        groups = report.groups_merged,
        removed = report.primitives_removed,
        "joining finished"
    );
    Ok(report)
}

/// A merged primitive whose accessors are still off-graph.
struct StagedPrimitive {
    template: json::mesh::Primitive,
    semantics: Vec<Checked<Semantic>>,
    indexed: bool,
    staging: Staging,
}

impl StagedPrimitive {
    /// Splices the accessors in and returns the finished primitive.
    fn commit(self, doc: &mut Document) -> json::mesh::Primitive {
        let accessors = self.staging.commit(doc);
        let mut primitive = self.template;
        let mut accessors = accessors.into_iter();
        primitive.indices = if self.indexed {
            accessors.next()
        } else {
            None
        };
        primitive.attributes = self.semantics.into_iter().zip(accessors).collect();
        primitive.targets = None;
        primitive
    }
}

fn member_vertex_count(doc: &Document, primitive: &json::mesh::Primitive) -> Result<usize> {
    let position = primitive
        .attributes
        .get(&Checked::Valid(Semantic::Positions))
        .ok_or_else(|| Error::Structural("member has no POSITION".into()))?;
    Ok(AccessorView::resolve(doc, *position)?.count())
}

/// Builds the merged primitive of one group without touching the document.
/// Any error abandons the group.
fn stage_group(doc: &Document, mesh: usize, group: &[usize]) -> Result<StagedPrimitive> {
    let primitives = &doc.root.meshes[mesh].primitives;
    let members: Vec<&json::mesh::Primitive> = group.iter().map(|&p| &primitives[p]).collect();
    let template = members[0];
    let indexed = template.indices.is_some();

    let mut vertex_counts = Vec::with_capacity(members.len());
    for member in &members {
        vertex_counts.push(member_vertex_count(doc, member)?);
    }
    let total_vertices: usize = vertex_counts.iter().sum();
    if total_vertices > u32::MAX as usize {
        return Err(Error::UnsupportedFormat(format!(
            "{total_vertices} vertices exceed 32-bit indices"
        )));
    }

    let mut staging = Staging::new();

    if indexed {
        let mut indices = Vec::new();
        let mut base = 0u32;
        for (member, &count) in members.iter().zip(&vertex_counts) {
            match member.indices {
                Some(accessor) => {
                    let source = AccessorView::resolve(doc, accessor)?.read_indices()?;
                    if let Some(bad) = source.iter().find(|&&i| i as usize >= count) {
                        return Err(Error::Structural(format!(
                            "index {bad} past {count} member vertices"
                        )));
                    }
                    indices.extend(source.into_iter().map(|i| i + base));
                }
                None => indices.extend(base..base + count as u32),
            }
            base += count as u32;
        }
        let width = IndexWidth::for_vertex_count(total_vertices);
        staging.stage(
            StagedAccessor::new(width.encode(&indices), width.format(), indices.len())
                .target(Target::ElementArrayBuffer),
        );
    }

    let semantics: Vec<Checked<Semantic>> = template.attributes.keys().cloned().collect();
    for semantic in &semantics {
        let mut format = None;
        let mut data = Vec::new();
        for (member, &count) in members.iter().zip(&vertex_counts) {
            let accessor = member.attributes.get(semantic).ok_or_else(|| {
                Error::Incompatible(format!(
                    "member lacks {}",
                    semantic_name(semantic).unwrap_or_default()
                ))
            })?;
            let view = AccessorView::resolve(doc, *accessor)?;
            match format {
                None => format = Some(view.format()),
                Some(expected) if expected != view.format() => {
                    return Err(Error::Incompatible(format!(
                        "{} differs in format",
                        semantic_name(semantic).unwrap_or_default()
                    )));
                }
                Some(_) => {}
            }
            if view.count() != count {
                return Err(Error::Structural(format!(
                    "accessor {} holds {} elements for {count} vertices",
                    accessor.value(),
                    view.count()
                )));
            }
            data.extend(view.to_packed());
        }
        let format = format.ok_or_else(|| Error::Structural("empty join group".into()))?;

        let mut staged =
            StagedAccessor::new(data, format, total_vertices).target(Target::ArrayBuffer);
        let float_vec3 = format == ElementFormat::new(ComponentType::F32, Type::Vec3);
        if float_vec3
            && *semantic == Checked::Valid(Semantic::Positions)
            && let Some(b) = bounds::vec3_bounds(staged.data.chunks(format.width()))
        {
            let (min, max) = bounds::to_json(b);
            staged = staged.bounds(Some(min), Some(max));
        }
        staging.stage(staged);
    }

    Ok(StagedPrimitive {
        template: template.clone(),
        semantics,
        indexed,
        staging,
    })
}
