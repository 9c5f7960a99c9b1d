//! Element counts and geometry statistics of a document.

use std::{fmt, ops::Sub};

use gltf::json::{
    self,
    mesh::{Mode, Semantic},
    validation::Checked,
};
use serde::Serialize;

use crate::document::Document;

/// Length of every resource array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceCounts {
    pub accessors: usize,
    pub animations: usize,
    pub buffers: usize,
    pub buffer_views: usize,
    pub cameras: usize,
    pub images: usize,
    pub materials: usize,
    pub meshes: usize,
    pub nodes: usize,
    pub samplers: usize,
    pub scenes: usize,
    pub skins: usize,
    pub textures: usize,
}

impl ResourceCounts {
    pub fn of(doc: &Document) -> Self {
        let root = &doc.root;
        Self {
            accessors: root.accessors.len(),
            animations: root.animations.len(),
            buffers: root.buffers.len(),
            buffer_views: root.buffer_views.len(),
            cameras: root.cameras.len(),
            images: root.images.len(),
            materials: root.materials.len(),
            meshes: root.meshes.len(),
            nodes: root.nodes.len(),
            samplers: root.samplers.len(),
            scenes: root.scenes.len(),
            skins: root.skins.len(),
            textures: root.textures.len(),
        }
    }

    fn entries(&self) -> [((&'static str, &'static str), usize); 13] {
        [
            (("accessor", "accessors"), self.accessors),
            (("animation", "animations"), self.animations),
            (("buffer", "buffers"), self.buffers),
            (("buffer view", "buffer views"), self.buffer_views),
            (("camera", "cameras"), self.cameras),
            (("image", "images"), self.images),
            (("material", "materials"), self.materials),
            (("mesh", "meshes"), self.meshes),
            (("node", "nodes"), self.nodes),
            (("sampler", "samplers"), self.samplers),
            (("scene", "scenes"), self.scenes),
            (("skin", "skins"), self.skins),
            (("texture", "textures"), self.textures),
        ]
    }

    pub fn total(&self) -> usize {
        self.entries().iter().map(|(_, count)| count).sum()
    }
}

/// Saturating per-array difference.
impl Sub for ResourceCounts {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            accessors: self.accessors.saturating_sub(rhs.accessors),
            animations: self.animations.saturating_sub(rhs.animations),
            buffers: self.buffers.saturating_sub(rhs.buffers),
            buffer_views: self.buffer_views.saturating_sub(rhs.buffer_views),
            cameras: self.cameras.saturating_sub(rhs.cameras),
            images: self.images.saturating_sub(rhs.images),
            materials: self.materials.saturating_sub(rhs.materials),
            meshes: self.meshes.saturating_sub(rhs.meshes),
            nodes: self.nodes.saturating_sub(rhs.nodes),
            samplers: self.samplers.saturating_sub(rhs.samplers),
            scenes: self.scenes.saturating_sub(rhs.scenes),
            skins: self.skins.saturating_sub(rhs.skins),
            textures: self.textures.saturating_sub(rhs.textures),
        }
    }
}

/// Lists the non-zero arrays in field order, e.g. `1 mesh, 3 nodes`.
impl fmt::Display for ResourceCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for ((singular, plural), count) in self.entries() {
            if count == 0 {
                continue;
            }
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            let label = if count == 1 { singular } else { plural };
            write!(f, "{count} {label}")?;
        }
        if first {
            f.write_str("nothing")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub counts: ResourceCounts,
    pub primitives: usize,
    /// Sum of the POSITION counts of every primitive.
    pub vertices: usize,
    pub indices: usize,
    pub triangles: usize,
    pub buffer_bytes: usize,
}

/// Drawn elements: index count, or vertex count when non-indexed.
fn element_count(doc: &Document, primitive: &json::mesh::Primitive) -> (usize, usize) {
    let count = |accessor: json::Index<json::Accessor>| {
        doc.root
            .accessors
            .get(accessor.value())
            .map_or(0, |accessor| accessor.count.0 as usize)
    };
    let vertices = primitive
        .attributes
        .get(&Checked::Valid(Semantic::Positions))
        .map_or(0, |&position| count(position));
    let elements = primitive.indices.map_or(vertices, count);
    (vertices, elements)
}

pub fn triangle_count(mode: &Checked<Mode>, elements: usize) -> usize {
    match mode {
        Checked::Valid(Mode::Triangles) => elements / 3,
        Checked::Valid(Mode::TriangleStrip | Mode::TriangleFan) => elements.saturating_sub(2),
        _ => 0,
    }
}

impl Stats {
    /// Reads counts from accessor metadata only, so compressed primitives
    /// are counted too.
    pub fn of(doc: &Document) -> Self {
        let mut stats = Self {
            counts: ResourceCounts::of(doc),
            buffer_bytes: doc.buffers.iter().map(Vec::len).sum(),
            ..Default::default()
        };
        for primitive in doc.root.meshes.iter().flat_map(|mesh| &mesh.primitives) {
            let (vertices, elements) = element_count(doc, primitive);
            stats.primitives += 1;
            stats.vertices += vertices;
            if primitive.indices.is_some() {
                stats.indices += elements;
            }
            stats.triangles += triangle_count(&primitive.mode, elements);
        }
        stats
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Resources: {}", self.counts)?;
        writeln!(
            f,
            "Geometry: {} primitives, {} vertices, {} indices, {} triangles",
            self.primitives, self.vertices, self.indices, self.triangles
        )?;
        writeln!(f, "Buffers: {} bytes", self.buffer_bytes)
    }
}
