//! Reachability pruning: mark everything reachable from the scenes, skins and
//! animations, then sweep the rest.

use std::fmt;

use gltf::json::{self, mesh::Semantic, validation::Checked, Index};
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    document::{accessor_views, primitive_accessors, texture_slots, Document},
    error::{Error, Result},
    extensions,
    info::ResourceCounts,
    progress::{Event, Progress},
    remap::{GraphRemap, Remap},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PruneOptions {
    /// Keep nodes that hold nothing.
    pub keep_leaves: bool,
    /// Keep vertex attributes the bound material never reads.
    pub keep_attributes: bool,
    /// Treat nodes with `extras` as non-empty.
    pub keep_extras: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Empty nodes detached from their parent or scene.
    pub leaves: usize,
    pub attributes: usize,
    pub removed: ResourceCounts,
}

impl fmt::Display for PruneReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Removed: {}", self.removed)?;
        if self.leaves > 0 {
            writeln!(f, "Detached empty leaves: {}", self.leaves)?;
        }
        if self.attributes > 0 {
            writeln!(f, "Dropped unused attributes: {}", self.attributes)?;
        }
        Ok(())
    }
}

/// One mark bit per element of every array the sweep compacts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reachability {
    pub accessors: Vec<bool>,
    pub buffers: Vec<bool>,
    pub buffer_views: Vec<bool>,
    pub cameras: Vec<bool>,
    pub images: Vec<bool>,
    pub materials: Vec<bool>,
    pub meshes: Vec<bool>,
    pub nodes: Vec<bool>,
    pub samplers: Vec<bool>,
    pub skins: Vec<bool>,
    pub textures: Vec<bool>,
}

/// Sets bit `index` and reports whether it was newly set. Out-of-range
/// indices are ignored; the sweep clears them.
fn set(marks: &mut [bool], index: usize) -> bool {
    match marks.get_mut(index) {
        Some(mark) if !*mark => {
            *mark = true;
            true
        }
        _ => false,
    }
}

impl Reachability {
    fn empty(root: &json::Root) -> Self {
        Self {
            accessors: vec![false; root.accessors.len()],
            buffers: vec![false; root.buffers.len()],
            buffer_views: vec![false; root.buffer_views.len()],
            cameras: vec![false; root.cameras.len()],
            images: vec![false; root.images.len()],
            materials: vec![false; root.materials.len()],
            meshes: vec![false; root.meshes.len()],
            nodes: vec![false; root.nodes.len()],
            samplers: vec![false; root.samplers.len()],
            skins: vec![false; root.skins.len()],
            textures: vec![false; root.textures.len()],
        }
    }

    /// Marks everything reachable. Fails when no scene lists a root that
    /// resolves to a node.
    pub fn mark(doc: &Document) -> Result<Self> {
        let root = &doc.root;
        let resolvable = root
            .scenes
            .iter()
            .flat_map(|scene| &scene.nodes)
            .any(|node| node.value() < root.nodes.len());
        if !resolvable {
            return Err(Error::NoSceneRoots);
        }
        Ok(Self::mark_from_scenes(doc))
    }

    fn mark_from_scenes(doc: &Document) -> Self {
        let root = &doc.root;
        let mut marks = Self::empty(root);
        let mut stack: Vec<usize> = root
            .scenes
            .iter()
            .flat_map(|scene| &scene.nodes)
            .map(|node| node.value())
            .collect();
        marks.mark_nodes(doc, &mut stack);

        for animation in &root.animations {
            for channel in &animation.channels {
                set(&mut marks.nodes, channel.target.node.value());
            }
            for sampler in &animation.samplers {
                marks.mark_accessor(doc, sampler.input);
                marks.mark_accessor(doc, sampler.output);
            }
        }
        marks
    }

    fn mark_nodes(&mut self, doc: &Document, stack: &mut Vec<usize>) {
        let root = &doc.root;
        while let Some(n) = stack.pop() {
            if !set(&mut self.nodes, n) {
                continue;
            }
            let node = &root.nodes[n];
            if let Some(mesh) = node.mesh {
                self.mark_mesh(doc, mesh);
            }
            if let Some(camera) = node.camera {
                set(&mut self.cameras, camera.value());
            }
            if let Some(skin) = node.skin
                && set(&mut self.skins, skin.value())
                && let Some(skin) = root.skins.get(skin.value())
            {
                if let Some(matrices) = skin.inverse_bind_matrices {
                    self.mark_accessor(doc, matrices);
                }
                stack.extend(skin.skeleton.map(|node| node.value()));
                stack.extend(skin.joints.iter().map(|joint| joint.value()));
            }
            stack.extend(node.children.iter().flatten().map(|child| child.value()));
        }
    }

    fn mark_mesh(&mut self, doc: &Document, mesh: Index<json::Mesh>) {
        if !set(&mut self.meshes, mesh.value()) {
            return;
        }
        let Some(mesh) = doc.root.meshes.get(mesh.value()) else {
            return;
        };
        for primitive in &mesh.primitives {
            for accessor in primitive_accessors(primitive) {
                self.mark_accessor(doc, accessor);
            }
            if let Some(material) = primitive.material {
                self.mark_material(doc, material);
            }
            if let Some(view) = extensions::draco_buffer_view(primitive) {
                self.mark_view(doc, view);
            }
        }
    }

    fn mark_material(&mut self, doc: &Document, material: Index<json::Material>) {
        if !set(&mut self.materials, material.value()) {
            return;
        }
        let Some(material) = doc.root.materials.get(material.value()) else {
            return;
        };
        for (texture, _) in texture_slots(material) {
            self.mark_texture(doc, texture.value());
        }
    }

    fn mark_texture(&mut self, doc: &Document, texture: usize) {
        if !set(&mut self.textures, texture) {
            return;
        }
        let Some(texture) = doc.root.textures.get(texture) else {
            return;
        };
        if let Some(sampler) = texture.sampler {
            set(&mut self.samplers, sampler.value());
        }
        let sources = extensions::texture_sources(texture).into_iter().map(|(_, image)| image);
        for image in std::iter::once(texture.source.value()).chain(sources) {
            if set(&mut self.images, image)
                && let Some(view) = doc.root.images.get(image).and_then(|i| i.buffer_view)
            {
                self.mark_view(doc, view.value());
            }
        }
    }

    fn mark_accessor(&mut self, doc: &Document, accessor: Index<json::Accessor>) {
        if !set(&mut self.accessors, accessor.value()) {
            return;
        }
        if let Some(accessor) = doc.root.accessors.get(accessor.value()) {
            for view in accessor_views(accessor) {
                self.mark_view(doc, view.value());
            }
        }
    }

    fn mark_view(&mut self, doc: &Document, view: usize) {
        set(&mut self.buffer_views, view);
        if let Some(view) = doc.root.buffer_views.get(view) {
            set(&mut self.buffers, view.buffer.value());
        }
    }

    pub fn into_remap(self) -> GraphRemap {
        GraphRemap {
            accessors: Some(Remap::from_kept(&self.accessors)),
            buffers: Some(Remap::from_kept(&self.buffers)),
            buffer_views: Some(Remap::from_kept(&self.buffer_views)),
            cameras: Some(Remap::from_kept(&self.cameras)),
            images: Some(Remap::from_kept(&self.images)),
            materials: Some(Remap::from_kept(&self.materials)),
            meshes: Some(Remap::from_kept(&self.meshes)),
            nodes: Some(Remap::from_kept(&self.nodes)),
            samplers: Some(Remap::from_kept(&self.samplers)),
            skins: Some(Remap::from_kept(&self.skins)),
            textures: Some(Remap::from_kept(&self.textures)),
        }
    }
}

/// Detaches nodes that hold nothing from their parents and scenes until no
/// such node is left. Joints never count as empty. Returns the number of
/// detachments.
pub fn remove_empty_leaves(doc: &mut Document, keep_extras: bool) -> usize {
    let root = &mut doc.root;
    let joints: HashSet<usize> = root
        .skins
        .iter()
        .flat_map(|skin| skin.joints.iter().chain(&skin.skeleton))
        .map(|node| node.value())
        .collect();

    let mut detached = 0;
    loop {
        let empty: Vec<bool> = root
            .nodes
            .iter()
            .enumerate()
            .map(|(n, node)| {
                node.mesh.is_none()
                    && node.camera.is_none()
                    && node.skin.is_none()
                    && node.children.as_ref().is_none_or(Vec::is_empty)
                    && !joints.contains(&n)
                    && !(keep_extras && extensions::has_extras(node))
            })
            .collect();
        let is_empty = |index: &Index<json::Node>| empty.get(index.value()).copied().unwrap_or(false);

        let mut changed = 0;
        for node in &mut root.nodes {
            if let Some(children) = &mut node.children {
                let before = children.len();
                children.retain(|child| !is_empty(child));
                changed += before - children.len();
                if children.is_empty() {
                    node.children = None;
                }
            }
        }
        for scene in &mut root.scenes {
            let before = scene.nodes.len();
            scene.nodes.retain(|node| !is_empty(node));
            changed += before - scene.nodes.len();
        }

        if changed == 0 {
            break;
        }
        detached += changed;
    }
    detached
}

/// Whether a material reads vertex attribute `semantic`.
///
/// POSITION, COLOR_0, JOINTS_n and WEIGHTS_n are always kept. NORMAL is kept
/// unless the material is unlit, TANGENT only with a normal map, TEXCOORD_n
/// only when some texture slot samples UV set n. Other colour sets go.
pub fn required_by_material(semantic: &Semantic, material: Option<&json::Material>) -> bool {
    match semantic {
        Semantic::Positions | Semantic::Joints(_) | Semantic::Weights(_) => true,
        Semantic::Colors(set) => *set == 0,
        Semantic::Normals => material.is_none_or(|m| !extensions::is_unlit(m)),
        Semantic::Tangents => material.is_some_and(|m| m.normal_texture.is_some()),
        Semantic::TexCoords(set) => material.is_some_and(|m| {
            texture_slots(m)
                .into_iter()
                .any(|(_, tex_coord)| tex_coord == *set)
        }),
        #[allow(unreachable_patterns)]
        _ => true,
    }
}

/// Drops attributes the bound material never reads, together with the
/// matching morph-target deltas. Returns the number of attributes dropped.
pub fn remove_unused_attributes(doc: &mut Document) -> usize {
    let root = &mut doc.root;
    let materials = &root.materials;
    let mut dropped = 0;
    for primitive in root.meshes.iter_mut().flat_map(|mesh| &mut mesh.primitives) {
        let material = primitive.material.and_then(|m| materials.get(m.value()));
        let before = primitive.attributes.len();
        primitive.attributes.retain(|semantic, _| match semantic {
            Checked::Valid(semantic) => required_by_material(semantic, material),
            Checked::Invalid => true,
        });
        dropped += before - primitive.attributes.len();

        let has = |semantic: Semantic| primitive.attributes.contains_key(&Checked::Valid(semantic));
        let (normals, tangents) = (has(Semantic::Normals), has(Semantic::Tangents));
        for target in primitive.targets.iter_mut().flatten() {
            if !normals {
                target.normals = None;
            }
            if !tangents {
                target.tangents = None;
            }
        }
    }
    dropped
}

pub fn prune(
    doc: &mut Document,
    options: &PruneOptions,
    progress: &mut dyn Progress,
) -> Result<PruneReport> {
    const STAGE: &str = "prune";
    let mut report = PruneReport::default();

    progress.report(&Event::new(STAGE, "Marking reachable resources").fraction(0.0));
    let mut marks = Reachability::mark(doc)?;

    if !options.keep_leaves {
        progress.report(&Event::new(STAGE, "Removing empty leaf nodes").fraction(0.25));
        report.leaves = remove_empty_leaves(doc, options.keep_extras);
    }
    if !options.keep_attributes {
        progress.report(&Event::new(STAGE, "Removing unused attributes").fraction(0.5));
        report.attributes = remove_unused_attributes(doc);
    }
    if report.leaves > 0 || report.attributes > 0 {
        marks = Reachability::mark_from_scenes(doc);
    }

    progress.report(&Event::new(STAGE, "Sweeping").fraction(0.75));
    let before = ResourceCounts::of(doc);
    marks.into_remap().apply(doc)?;
    report.removed = before - ResourceCounts::of(doc);

    let details = report.removed.to_string();
    progress.report(&Event::new(STAGE, "done").fraction(1.0).details(&details));
    debug!(leaves = report.leaves, attributes = report.attributes, "pre-sweep passes");
    info!(removed = report.removed.total(), "pruning finished");
    Ok(report)
}
