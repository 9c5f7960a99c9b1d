//! The in-memory resource graph every pass mutates.

use std::borrow::Cow;

use gltf::json::{
    self,
    accessor::GenericComponentType,
    buffer::{Stride, Target},
    validation::Checked,
    Index, Value,
};

use crate::{
    accessor::ElementFormat,
    error::{Error, Result},
    extensions,
};

/// glTF JSON plus the payload of every buffer it declares.
///
/// `buffers[i]` is the byte content of `root.buffers[i]`; both vectors always
/// have the same length.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub root: json::Root,
    pub buffers: Vec<Vec<u8>>,
}

impl Document {
    pub fn new(root: json::Root, buffers: Vec<Vec<u8>>) -> Result<Self> {
        if root.buffers.len() != buffers.len() {
            return Err(Error::Structural(format!(
                "{} buffers declared but {} payloads supplied",
                root.buffers.len(),
                buffers.len()
            )));
        }
        Ok(Self { root, buffers })
    }

    pub fn push_buffer(&mut self, data: Vec<u8>) -> Index<json::Buffer> {
        let index = self.root.push(json::Buffer {
            byte_length: data.len().into(),
            name: None,
            uri: None,
            extensions: None,
            extras: Default::default(),
        });
        self.buffers.push(data);
        index
    }

    pub fn push_view(
        &mut self,
        buffer: Index<json::Buffer>,
        offset: usize,
        length: usize,
        stride: Option<usize>,
        target: Option<Target>,
    ) -> Index<json::buffer::View> {
        self.root.push(json::buffer::View {
            buffer,
            byte_length: length.into(),
            byte_offset: if offset == 0 {
                None
            } else {
                Some(offset.into())
            },
            byte_stride: stride.map(Stride),
            name: None,
            target: target.map(Checked::Valid),
            extensions: None,
            extras: Default::default(),
        })
    }

    pub fn push_accessor(
        &mut self,
        view: Index<json::buffer::View>,
        offset: usize,
        count: usize,
        format: ElementFormat,
    ) -> Index<json::Accessor> {
        self.root.push(json::Accessor {
            buffer_view: Some(view),
            byte_offset: if offset == 0 {
                None
            } else {
                Some(offset.into())
            },
            count: count.into(),
            component_type: Checked::Valid(GenericComponentType(format.component)),
            extensions: None,
            extras: Default::default(),
            type_: Checked::Valid(format.shape),
            min: None,
            max: None,
            name: None,
            normalized: format.normalized,
            sparse: None,
        })
    }

    /// Appends a tightly packed accessor backed by its own buffer and view.
    pub fn append_accessor(
        &mut self,
        data: Vec<u8>,
        format: ElementFormat,
        count: usize,
        target: Option<Target>,
    ) -> Index<json::Accessor> {
        let length = data.len();
        let buffer = self.push_buffer(data);
        let view = self.push_view(buffer, 0, length, None, target);
        self.push_accessor(view, 0, count, format)
    }

    /// Verifies that every cross-reference addresses a live element.
    pub fn check_references(&self) -> Result<()> {
        let root = &self.root;
        if root.buffers.len() != self.buffers.len() {
            return Err(Error::Structural(format!(
                "{} buffers declared but {} payloads held",
                root.buffers.len(),
                self.buffers.len()
            )));
        }

        let nodes = root.nodes.len();
        let accessors = root.accessors.len();
        let views = root.buffer_views.len();

        if let Some(scene) = root.scene {
            ensure(scene.value(), root.scenes.len(), || "default scene".into())?;
        }
        for (s, scene) in root.scenes.iter().enumerate() {
            for node in &scene.nodes {
                ensure(node.value(), nodes, || format!("scene {s} root"))?;
            }
        }

        for (n, node) in root.nodes.iter().enumerate() {
            for child in node.children.iter().flatten() {
                ensure(child.value(), nodes, || format!("node {n} child"))?;
            }
            if let Some(mesh) = node.mesh {
                ensure(mesh.value(), root.meshes.len(), || format!("node {n} mesh"))?;
            }
            if let Some(skin) = node.skin {
                ensure(skin.value(), root.skins.len(), || format!("node {n} skin"))?;
            }
            if let Some(camera) = node.camera {
                ensure(camera.value(), root.cameras.len(), || format!("node {n} camera"))?;
            }
        }

        for (m, mesh) in root.meshes.iter().enumerate() {
            for (p, primitive) in mesh.primitives.iter().enumerate() {
                let owner = || format!("mesh {m} primitive {p}");
                for accessor in primitive_accessors(primitive) {
                    ensure(accessor.value(), accessors, owner)?;
                }
                if let Some(material) = primitive.material {
                    ensure(material.value(), root.materials.len(), owner)?;
                }
                if let Some(view) = extensions::draco_buffer_view(primitive) {
                    ensure(view, views, owner)?;
                }
            }
        }

        for (m, material) in root.materials.iter().enumerate() {
            for (texture, _) in texture_slots(material) {
                ensure(texture.value(), root.textures.len(), || {
                    format!("material {m} texture slot")
                })?;
            }
        }

        for (t, texture) in root.textures.iter().enumerate() {
            ensure(texture.source.value(), root.images.len(), || {
                format!("texture {t} source")
            })?;
            for (extension, image) in extensions::texture_sources(texture) {
                ensure(image, root.images.len(), || format!("texture {t} {extension}"))?;
            }
            if let Some(sampler) = texture.sampler {
                ensure(sampler.value(), root.samplers.len(), || {
                    format!("texture {t} sampler")
                })?;
            }
        }

        for (i, image) in root.images.iter().enumerate() {
            if let Some(view) = image.buffer_view {
                ensure(view.value(), views, || format!("image {i} buffer view"))?;
            }
        }

        for (a, accessor) in root.accessors.iter().enumerate() {
            for view in accessor_views(accessor) {
                ensure(view.value(), views, || format!("accessor {a} buffer view"))?;
            }
        }

        for (v, view) in root.buffer_views.iter().enumerate() {
            ensure(view.buffer.value(), root.buffers.len(), || {
                format!("buffer view {v} buffer")
            })?;
        }

        for (s, skin) in root.skins.iter().enumerate() {
            if let Some(matrices) = skin.inverse_bind_matrices {
                ensure(matrices.value(), accessors, || {
                    format!("skin {s} inverse bind matrices")
                })?;
            }
            if let Some(skeleton) = skin.skeleton {
                ensure(skeleton.value(), nodes, || format!("skin {s} skeleton"))?;
            }
            for joint in &skin.joints {
                ensure(joint.value(), nodes, || format!("skin {s} joint"))?;
            }
        }

        for (a, animation) in root.animations.iter().enumerate() {
            for channel in &animation.channels {
                ensure(channel.target.node.value(), nodes, || {
                    format!("animation {a} channel target")
                })?;
                ensure(channel.sampler.value(), animation.samplers.len(), || {
                    format!("animation {a} channel sampler")
                })?;
            }
            for sampler in &animation.samplers {
                ensure(sampler.input.value(), accessors, || {
                    format!("animation {a} sampler input")
                })?;
                ensure(sampler.output.value(), accessors, || {
                    format!("animation {a} sampler output")
                })?;
            }
        }

        Ok(())
    }
}

/// Tightly packed accessor data waiting to be added to a document.
#[derive(Debug, Clone)]
pub struct StagedAccessor {
    pub data: Vec<u8>,
    pub format: ElementFormat,
    pub count: usize,
    pub target: Option<Target>,
    pub min: Option<Value>,
    pub max: Option<Value>,
}

impl StagedAccessor {
    pub fn new(data: Vec<u8>, format: ElementFormat, count: usize) -> Self {
        Self {
            data,
            format,
            count,
            target: None,
            min: None,
            max: None,
        }
    }

    pub fn target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn bounds(mut self, min: Option<Value>, max: Option<Value>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Stored bytes and view stride. Vertex attribute elements must start on
    /// 4-byte boundaries, so narrower vertex elements are padded out.
    fn layout(&self) -> (Cow<'_, [u8]>, Option<usize>) {
        let width = self.format.width();
        let vertex = matches!(self.target, Some(Target::ArrayBuffer));
        if !vertex || width == 0 || width % 4 == 0 {
            return (Cow::Borrowed(&self.data), None);
        }
        let stride = width.next_multiple_of(4);
        let mut padded = vec![0u8; stride * self.count];
        for (slot, element) in padded
            .chunks_exact_mut(stride)
            .zip(self.data.chunks_exact(width))
        {
            slot[..width].copy_from_slice(element);
        }
        (Cow::Owned(padded), Some(stride))
    }
}

/// Accessors built off-graph and spliced in all at once.
///
/// Nothing touches the document until [Staging::commit]; dropping a staging
/// area discards everything in it.
#[derive(Debug, Default)]
pub struct Staging {
    accessors: Vec<StagedAccessor>,
}

impl Staging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the position of the accessor in the committed list.
    pub fn stage(&mut self, accessor: StagedAccessor) -> usize {
        self.accessors.push(accessor);
        self.accessors.len() - 1
    }

    pub fn len(&self) -> usize {
        self.accessors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accessors.is_empty()
    }

    /// Appends one buffer holding every staged payload, 4-byte aligned, plus
    /// one view and one accessor per payload. Vertex streams whose elements
    /// are not a multiple of 4 bytes wide get a padded `byteStride`. Indices
    /// come back in staging order.
    pub fn commit(self, doc: &mut Document) -> Vec<Index<json::Accessor>> {
        if self.accessors.is_empty() {
            return Vec::new();
        }
        let mut blob = Vec::with_capacity(
            self.accessors.iter().map(|a| a.data.len() + 3).sum(),
        );
        let mut placements = Vec::with_capacity(self.accessors.len());
        for accessor in &self.accessors {
            let (bytes, stride) = accessor.layout();
            pad_to_4bytes(&mut blob);
            placements.push((blob.len(), bytes.len(), stride));
            blob.extend_from_slice(&bytes);
        }
        let buffer = doc.push_buffer(blob);

        self.accessors
            .into_iter()
            .zip(placements)
            .map(|(staged, (offset, length, stride))| {
                let view = doc.push_view(buffer, offset, length, stride, staged.target);
                let index = doc.push_accessor(view, 0, staged.count, staged.format);
                let accessor = &mut doc.root.accessors[index.value()];
                accessor.min = staged.min;
                accessor.max = staged.max;
                index
            })
            .collect()
    }
}

pub fn pad_to_4bytes(data: &mut Vec<u8>) {
    while data.len() % 4 != 0 {
        data.push(0);
    }
}

fn ensure(index: usize, len: usize, owner: impl FnOnce() -> String) -> Result<()> {
    if index < len {
        Ok(())
    } else {
        Err(Error::Structural(format!(
            "{} references index {index} of {len}",
            owner()
        )))
    }
}

/// Every accessor a primitive reads: indices, attributes and morph targets.
pub fn primitive_accessors(
    primitive: &json::mesh::Primitive,
) -> impl Iterator<Item = Index<json::Accessor>> + '_ {
    primitive
        .indices
        .into_iter()
        .chain(primitive.attributes.values().copied())
        .chain(primitive.targets.iter().flatten().flat_map(|target| {
            [target.positions, target.normals, target.tangents]
                .into_iter()
                .flatten()
        }))
}

/// The buffer views backing an accessor, including sparse storage.
pub fn accessor_views(
    accessor: &json::Accessor,
) -> impl Iterator<Item = Index<json::buffer::View>> + '_ {
    accessor.buffer_view.into_iter().chain(
        accessor
            .sparse
            .iter()
            .flat_map(|sparse| [sparse.indices.buffer_view, sparse.values.buffer_view]),
    )
}

/// `(texture, uv set)` of every texture a material samples: the five core
/// slots, then the texture infos nested in its extensions.
pub fn texture_slots(material: &json::Material) -> Vec<(Index<json::Texture>, u32)> {
    let pbr = &material.pbr_metallic_roughness;
    let core = [
        pbr.base_color_texture
            .as_ref()
            .map(|info| (info.index, info.tex_coord)),
        pbr.metallic_roughness_texture
            .as_ref()
            .map(|info| (info.index, info.tex_coord)),
        material
            .normal_texture
            .as_ref()
            .map(|info| (info.index, info.tex_coord)),
        material
            .occlusion_texture
            .as_ref()
            .map(|info| (info.index, info.tex_coord)),
        material
            .emissive_texture
            .as_ref()
            .map(|info| (info.index, info.tex_coord)),
    ];
    let nested = extensions::material_textures(material)
        .into_iter()
        .map(|(texture, tex_coord)| (Index::new(texture as u32), tex_coord));
    core.into_iter().flatten().chain(nested).collect()
}

/// Reads an accessor's `min`/`max` pair as floats.
pub fn bounds_of(accessor: &json::Accessor) -> Option<(Vec<f64>, Vec<f64>)> {
    fn floats(value: &Option<Value>) -> Option<Vec<f64>> {
        value.as_ref()?.as_array()?.iter().map(Value::as_f64).collect()
    }
    Some((floats(&accessor.min)?, floats(&accessor.max)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::AccessorView;
    use gltf::json::accessor::{ComponentType, Type};

    #[test]
    fn new_rejects_mismatched_payloads() {
        let mut root = json::Root::default();
        root.push(json::Buffer {
            byte_length: 4usize.into(),
            name: None,
            uri: None,
            extensions: None,
            extras: Default::default(),
        });
        assert!(Document::new(root.clone(), vec![]).is_err());
        assert!(Document::new(root, vec![vec![0; 4]]).is_ok());
    }

    #[test]
    fn appended_accessor_is_self_contained() {
        let mut doc = Document::default();
        let index = doc.append_accessor(
            vec![0; 12],
            ElementFormat::new(ComponentType::F32, Type::Vec3),
            1,
            Some(Target::ArrayBuffer),
        );
        assert_eq!(index.value(), 0);
        assert_eq!(doc.buffers.len(), 1);
        assert_eq!(doc.root.buffer_views[0].byte_length.0, 12);
        doc.check_references().unwrap();
    }

    #[test]
    fn staging_commits_one_aligned_buffer() {
        let mut doc = Document::default();
        let mut staging = Staging::new();
        staging.stage(StagedAccessor::new(
            vec![1, 2, 3],
            ElementFormat::new(ComponentType::U8, Type::Scalar),
            3,
        ));
        staging.stage(
            StagedAccessor::new(
                vec![4, 0, 0, 0],
                ElementFormat::new(ComponentType::U32, Type::Scalar),
                1,
            )
            .target(Target::ElementArrayBuffer),
        );

        let indices = staging.commit(&mut doc);
        assert_eq!(indices.iter().map(|i| i.value()).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(doc.buffers, vec![vec![1, 2, 3, 0, 4, 0, 0, 0]]);
        assert_eq!(doc.root.buffer_views[1].byte_offset.map(|o| o.0), Some(4));
        doc.check_references().unwrap();
    }

    #[test]
    fn narrow_vertex_elements_get_a_padded_stride() {
        let mut doc = Document::default();
        let mut staging = Staging::new();
        staging.stage(
            StagedAccessor::new(
                vec![1, 0, 2, 0, 3, 0, 4, 0, 5, 0, 6, 0],
                ElementFormat::new(ComponentType::I16, Type::Vec3),
                2,
            )
            .target(Target::ArrayBuffer),
        );
        staging.stage(StagedAccessor::new(
            vec![7, 8, 9],
            ElementFormat::new(ComponentType::U8, Type::Vec3),
            1,
        ));

        let indices = staging.commit(&mut doc);
        let view = &doc.root.buffer_views[0];
        assert_eq!(view.byte_stride.map(|s| s.0), Some(8));
        assert_eq!(view.byte_length.0, 16);
        assert_eq!(doc.root.buffer_views[1].byte_stride, None);
        let positions = AccessorView::resolve(&doc, indices[0]).unwrap();
        assert_eq!(positions.to_packed(), vec![1, 0, 2, 0, 3, 0, 4, 0, 5, 0, 6, 0]);
        doc.check_references().unwrap();
    }

    #[test]
    fn dropped_staging_leaves_document_alone() {
        let mut doc = Document::default();
        let mut staging = Staging::new();
        staging.stage(StagedAccessor::new(
            vec![0; 4],
            ElementFormat::new(ComponentType::F32, Type::Scalar),
            1,
        ));
        drop(staging);
        assert!(doc.root.accessors.is_empty());
        assert!(Staging::new().commit(&mut doc).is_empty());
        assert!(doc.buffers.is_empty());
    }

    #[test]
    fn dangling_child_is_reported() {
        let mut doc = Document::default();
        let node: json::Node =
            serde_json::from_value(serde_json::json!({ "children": [3] })).unwrap();
        doc.root.push(node);
        let err = doc.check_references().unwrap_err();
        assert!(err.to_string().contains("node 0 child"));
    }
}
