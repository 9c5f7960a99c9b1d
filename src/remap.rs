//! Old → new index maps and the single place that rewrites cross-references.
//!
//! Every pass that removes elements builds a [Remap] per affected array and
//! hands them to [GraphRemap::apply], which validates, rewrites every index
//! field of the graph and finally compacts the arrays in a stable order.

use gltf::json::{self, Index};
use hashbrown::HashMap;

use crate::{
    document::Document,
    error::{Error, Result},
    extensions,
};

/// Dense old → new index table over one array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remap {
    targets: Vec<Option<u32>>,
    survives: Vec<bool>,
}

impl Remap {
    pub fn identity(len: usize) -> Self {
        Self::from_kept(&vec![true; len])
    }

    /// Keeps every element flagged in `kept`, in order.
    pub fn from_kept(kept: &[bool]) -> Self {
        let mut next = 0u32;
        let targets = kept
            .iter()
            .map(|&keep| {
                keep.then(|| {
                    next += 1;
                    next - 1
                })
            })
            .collect();
        Self {
            targets,
            survives: kept.to_vec(),
        }
    }

    /// Removes every key of `duplicates` and sends it to its canonical
    /// element's new index. Chains (`a → b → c`) are followed.
    pub fn from_duplicates(len: usize, duplicates: &HashMap<usize, usize>) -> Result<Self> {
        let survives: Vec<bool> = (0..len).map(|i| !duplicates.contains_key(&i)).collect();
        let mut remap = Self::from_kept(&survives);
        for (&duplicate, &canonical) in duplicates {
            let mut canonical = canonical;
            let mut hops = 0;
            while let Some(&next) = duplicates.get(&canonical) {
                canonical = next;
                hops += 1;
                if hops > len {
                    return Err(Error::Structural(format!(
                        "duplicate chain from element {duplicate} does not terminate"
                    )));
                }
            }
            if duplicate >= len || canonical >= len {
                return Err(Error::Structural(format!(
                    "duplicate {duplicate} -> {canonical} outside array of {len}"
                )));
            }
            remap.targets[duplicate] = remap.targets[canonical];
        }
        Ok(remap)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, old: usize) -> Option<usize> {
        self.targets.get(old).copied().flatten().map(|new| new as usize)
    }

    pub fn get_index<T>(&self, old: Index<T>) -> Option<Index<T>> {
        self.get(old.value()).map(|new| Index::new(new as u32))
    }

    /// Whether element `old` stays in the compacted array.
    pub fn survives(&self, old: usize) -> bool {
        self.survives.get(old).copied().unwrap_or(false)
    }

    /// Number of elements compaction drops.
    pub fn removed(&self) -> usize {
        self.survives.iter().filter(|&&keep| !keep).count()
    }

    pub fn is_identity(&self) -> bool {
        self.removed() == 0
    }

    /// Drops non-surviving elements, preserving the order of the rest.
    pub fn compact<T>(&self, items: &mut Vec<T>) {
        let mut position = 0;
        items.retain(|_| {
            position += 1;
            self.survives(position - 1)
        });
    }
}

/// One optional [Remap] per resource array.
#[derive(Debug, Clone, Default)]
pub struct GraphRemap {
    pub accessors: Option<Remap>,
    pub buffers: Option<Remap>,
    pub buffer_views: Option<Remap>,
    pub cameras: Option<Remap>,
    pub images: Option<Remap>,
    pub materials: Option<Remap>,
    pub meshes: Option<Remap>,
    pub nodes: Option<Remap>,
    pub samplers: Option<Remap>,
    pub skins: Option<Remap>,
    pub textures: Option<Remap>,
}

fn mapped<T>(remap: &Option<Remap>, index: Index<T>) -> Option<Index<T>> {
    match remap {
        Some(remap) => remap.get_index(index),
        None => Some(index),
    }
}

fn retarget<T>(remap: &Option<Remap>, slot: &mut Option<Index<T>>) {
    *slot = slot.and_then(|index| mapped(remap, index));
}

fn retarget_list<T>(remap: &Option<Remap>, list: &mut Vec<Index<T>>) {
    if remap.is_some() {
        *list = list.iter().filter_map(|&index| mapped(remap, index)).collect();
    }
}

fn retarget_required<T>(remap: &Option<Remap>, index: &mut Index<T>, what: &str) -> Result<()> {
    *index = mapped(remap, *index).ok_or_else(|| {
        Error::Structural(format!("{what} {} was removed", index.value()))
    })?;
    Ok(())
}

fn survives(remap: &Option<Remap>, index: usize) -> bool {
    remap.as_ref().is_none_or(|remap| remap.survives(index))
}

fn check_len(remap: &Option<Remap>, len: usize, what: &str) -> Result<()> {
    match remap {
        Some(remap) if remap.len() != len => Err(Error::Structural(format!(
            "{what} remap covers {} elements but the array holds {len}",
            remap.len()
        ))),
        _ => Ok(()),
    }
}

/// Texture references embedded in the three material slot types.
trait TextureSlot {
    fn texture(&mut self) -> &mut Index<json::Texture>;
}

impl TextureSlot for json::texture::Info {
    fn texture(&mut self) -> &mut Index<json::Texture> {
        &mut self.index
    }
}

impl TextureSlot for json::material::NormalTexture {
    fn texture(&mut self) -> &mut Index<json::Texture> {
        &mut self.index
    }
}

impl TextureSlot for json::material::OcclusionTexture {
    fn texture(&mut self) -> &mut Index<json::Texture> {
        &mut self.index
    }
}

fn retarget_slot<S: TextureSlot>(remap: &Remap, slot: &mut Option<S>) {
    let Some(info) = slot.as_mut() else {
        return;
    };
    match remap.get_index(*info.texture()) {
        Some(texture) => *info.texture() = texture,
        None => *slot = None,
    }
}

impl GraphRemap {
    pub fn is_identity(&self) -> bool {
        [
            &self.accessors,
            &self.buffers,
            &self.buffer_views,
            &self.cameras,
            &self.images,
            &self.materials,
            &self.meshes,
            &self.nodes,
            &self.samplers,
            &self.skins,
            &self.textures,
        ]
        .into_iter()
        .flatten()
        .all(Remap::is_identity)
    }

    /// Rejects the remap if it would leave a mandatory reference of a
    /// surviving element without a target. Runs before anything mutates.
    fn validate(&self, doc: &Document) -> Result<()> {
        let root = &doc.root;
        check_len(&self.accessors, root.accessors.len(), "accessor")?;
        check_len(&self.buffers, root.buffers.len(), "buffer")?;
        check_len(&self.buffer_views, root.buffer_views.len(), "buffer view")?;
        check_len(&self.cameras, root.cameras.len(), "camera")?;
        check_len(&self.images, root.images.len(), "image")?;
        check_len(&self.materials, root.materials.len(), "material")?;
        check_len(&self.meshes, root.meshes.len(), "mesh")?;
        check_len(&self.nodes, root.nodes.len(), "node")?;
        check_len(&self.samplers, root.samplers.len(), "sampler")?;
        check_len(&self.skins, root.skins.len(), "skin")?;
        check_len(&self.textures, root.textures.len(), "texture")?;

        let lost = |what: &str, owner: String| {
            Err(Error::Structural(format!("{owner} would lose its {what}")))
        };

        for (t, texture) in root.textures.iter().enumerate() {
            if survives(&self.textures, t) && mapped(&self.images, texture.source).is_none() {
                return lost("source image", format!("texture {t}"));
            }
        }
        for (v, view) in root.buffer_views.iter().enumerate() {
            if survives(&self.buffer_views, v) && mapped(&self.buffers, view.buffer).is_none() {
                return lost("buffer", format!("buffer view {v}"));
            }
        }
        for (a, accessor) in root.accessors.iter().enumerate() {
            let Some(sparse) = &accessor.sparse else {
                continue;
            };
            if !survives(&self.accessors, a) {
                continue;
            }
            for view in [sparse.indices.buffer_view, sparse.values.buffer_view] {
                if mapped(&self.buffer_views, view).is_none() {
                    return lost("sparse buffer view", format!("accessor {a}"));
                }
            }
        }
        for (s, skin) in root.skins.iter().enumerate() {
            if !survives(&self.skins, s) {
                continue;
            }
            if skin.joints.iter().any(|&joint| mapped(&self.nodes, joint).is_none()) {
                return lost("joints", format!("skin {s}"));
            }
        }
        for (a, animation) in root.animations.iter().enumerate() {
            for channel in &animation.channels {
                if mapped(&self.nodes, channel.target.node).is_none() {
                    return lost("target node", format!("animation {a}"));
                }
            }
            for sampler in &animation.samplers {
                if mapped(&self.accessors, sampler.input).is_none()
                    || mapped(&self.accessors, sampler.output).is_none()
                {
                    return lost("sampler accessors", format!("animation {a}"));
                }
            }
        }
        Ok(())
    }

    /// Rewrites every cross-reference of `doc`, then compacts the arrays.
    ///
    /// Optional references whose target disappears become `None`; list
    /// entries are dropped. Nothing is modified when an error is returned.
    pub fn apply(&self, doc: &mut Document) -> Result<()> {
        self.validate(doc)?;
        if self.is_identity() {
            return Ok(());
        }
        let root = &mut doc.root;

        for scene in &mut root.scenes {
            retarget_list(&self.nodes, &mut scene.nodes);
        }

        for node in &mut root.nodes {
            retarget(&self.cameras, &mut node.camera);
            retarget(&self.meshes, &mut node.mesh);
            retarget(&self.skins, &mut node.skin);
            if let Some(children) = &mut node.children {
                retarget_list(&self.nodes, children);
                if children.is_empty() {
                    node.children = None;
                }
            }
        }

        for mesh in &mut root.meshes {
            for primitive in &mut mesh.primitives {
                retarget(&self.accessors, &mut primitive.indices);
                retarget(&self.materials, &mut primitive.material);
                if self.accessors.is_some() {
                    let attributes = std::mem::take(&mut primitive.attributes);
                    primitive.attributes = attributes
                        .into_iter()
                        .filter_map(|(semantic, accessor)| {
                            mapped(&self.accessors, accessor).map(|accessor| (semantic, accessor))
                        })
                        .collect();
                }
                for target in primitive.targets.iter_mut().flatten() {
                    retarget(&self.accessors, &mut target.positions);
                    retarget(&self.accessors, &mut target.normals);
                    retarget(&self.accessors, &mut target.tangents);
                }
                if let Some(views) = &self.buffer_views
                    && let Some(view) = extensions::draco_buffer_view(primitive)
                {
                    extensions::set_draco_buffer_view(primitive, views.get(view))?;
                }
            }
        }

        if let Some(textures) = &self.textures {
            for material in &mut root.materials {
                let pbr = &mut material.pbr_metallic_roughness;
                retarget_slot(textures, &mut pbr.base_color_texture);
                retarget_slot(textures, &mut pbr.metallic_roughness_texture);
                retarget_slot(textures, &mut material.normal_texture);
                retarget_slot(textures, &mut material.occlusion_texture);
                retarget_slot(textures, &mut material.emissive_texture);
                extensions::remap_material_textures(material, |t| textures.get(t))?;
            }
        }

        for (t, texture) in root.textures.iter_mut().enumerate() {
            if survives(&self.textures, t) {
                retarget_required(&self.images, &mut texture.source, "image")?;
                if let Some(images) = &self.images {
                    for (extension, image) in extensions::texture_sources(texture) {
                        extensions::set_texture_source(texture, extension, images.get(image))?;
                    }
                }
            }
            retarget(&self.samplers, &mut texture.sampler);
        }

        for image in &mut root.images {
            retarget(&self.buffer_views, &mut image.buffer_view);
        }

        for (a, accessor) in root.accessors.iter_mut().enumerate() {
            retarget(&self.buffer_views, &mut accessor.buffer_view);
            if let Some(sparse) = &mut accessor.sparse
                && survives(&self.accessors, a)
            {
                retarget_required(&self.buffer_views, &mut sparse.indices.buffer_view, "buffer view")?;
                retarget_required(&self.buffer_views, &mut sparse.values.buffer_view, "buffer view")?;
            }
        }

        for (v, view) in root.buffer_views.iter_mut().enumerate() {
            if survives(&self.buffer_views, v) {
                retarget_required(&self.buffers, &mut view.buffer, "buffer")?;
            }
        }

        for skin in &mut root.skins {
            retarget(&self.accessors, &mut skin.inverse_bind_matrices);
            retarget(&self.nodes, &mut skin.skeleton);
            retarget_list(&self.nodes, &mut skin.joints);
        }

        for animation in &mut root.animations {
            for channel in &mut animation.channels {
                retarget_required(&self.nodes, &mut channel.target.node, "node")?;
            }
            for sampler in &mut animation.samplers {
                retarget_required(&self.accessors, &mut sampler.input, "accessor")?;
                retarget_required(&self.accessors, &mut sampler.output, "accessor")?;
            }
        }

        macro_rules! compact {
            ($($field:ident),*) => {
                $(if let Some(remap) = &self.$field {
                    remap.compact(&mut root.$field);
                })*
            };
        }
        compact!(
            accessors,
            buffer_views,
            cameras,
            images,
            materials,
            meshes,
            nodes,
            samplers,
            skins,
            textures
        );
        if let Some(buffers) = &self.buffers {
            buffers.compact(&mut root.buffers);
            buffers.compact(&mut doc.buffers);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use serde_json::json;

    #[test]
    fn kept_set_is_stable() {
        let remap = Remap::from_kept(&[true, false, true, true, false]);
        assert_eq!(remap.get(0), Some(0));
        assert_eq!(remap.get(1), None);
        assert_eq!(remap.get(3), Some(2));
        assert_eq!(remap.removed(), 2);

        let mut items = vec!['a', 'b', 'c', 'd', 'e'];
        remap.compact(&mut items);
        assert_eq!(items, vec!['a', 'c', 'd']);
    }

    #[test]
    fn duplicates_follow_chains() {
        let duplicates = HashMap::from([(3, 1), (1, 0)]);
        let remap = Remap::from_duplicates(4, &duplicates).unwrap();
        assert_eq!(remap.get(0), Some(0));
        assert_eq!(remap.get(1), Some(0));
        assert_eq!(remap.get(2), Some(1));
        assert_eq!(remap.get(3), Some(0));
        assert!(!remap.survives(3));

        let cycle = HashMap::from([(0, 1), (1, 0)]);
        assert!(Remap::from_duplicates(2, &cycle).is_err());
    }

    #[test]
    fn removed_material_clears_primitive_reference() {
        let mut doc = fixtures::document(
            json!({
                "materials": [{ "name": "a" }, { "name": "b" }],
                "meshes": [{ "primitives": [
                    { "attributes": {}, "material": 0 },
                    { "attributes": {}, "material": 1 }
                ]}]
            }),
            vec![],
        );
        let remap = GraphRemap {
            materials: Some(Remap::from_kept(&[false, true])),
            ..Default::default()
        };
        remap.apply(&mut doc).unwrap();

        let primitives = &doc.root.meshes[0].primitives;
        assert_eq!(primitives[0].material, None);
        assert_eq!(primitives[1].material, Some(Index::new(0)));
        assert_eq!(doc.root.materials.len(), 1);
        doc.check_references().unwrap();
    }

    #[test]
    fn dropping_a_required_target_is_rejected_untouched() {
        let mut doc = fixtures::document(
            json!({
                "images": [{ "uri": "a.png" }],
                "textures": [{ "source": 0 }]
            }),
            vec![],
        );
        let remap = GraphRemap {
            images: Some(Remap::from_kept(&[false])),
            ..Default::default()
        };
        assert!(matches!(remap.apply(&mut doc), Err(Error::Structural(_))));
        assert_eq!(doc.root.images.len(), 1);
    }

    #[test]
    fn buffers_compact_in_lockstep() {
        let mut doc = fixtures::document(
            json!({
                "buffers": [{ "byteLength": 1 }, { "byteLength": 2 }],
                "bufferViews": [{ "buffer": 1, "byteLength": 2 }]
            }),
            vec![vec![7], vec![8, 9]],
        );
        let remap = GraphRemap {
            buffers: Some(Remap::from_kept(&[false, true])),
            ..Default::default()
        };
        remap.apply(&mut doc).unwrap();
        assert_eq!(doc.buffers, vec![vec![8, 9]]);
        assert_eq!(doc.root.buffer_views[0].buffer.value(), 0);
    }
}
