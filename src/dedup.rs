//! Duplicate elimination for accessors, images, textures, materials and meshes.

use std::fmt;

use gltf::json::{self, buffer::Target, validation::Checked, Index};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

use crate::{
    accessor::AccessorView,
    document::Document,
    error::{FailureCounts, Result},
    progress::{Event, Progress},
    remap::{GraphRemap, Remap},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedupOptions {
    pub accessors: bool,
    /// Images and the textures sampling them.
    pub textures: bool,
    pub materials: bool,
    pub meshes: bool,
    /// Only merge images, textures, materials and meshes that share a name.
    pub keep_unique_names: bool,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            accessors: true,
            textures: true,
            materials: true,
            meshes: true,
            keep_unique_names: false,
        }
    }
}

/// Array length before a sub-pass and how many elements it merged away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Merged {
    pub before: usize,
    pub removed: usize,
}

impl Merged {
    pub fn remaining(&self) -> usize {
        self.before - self.removed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupReport {
    pub accessors: Merged,
    pub images: Merged,
    pub textures: Merged,
    pub materials: Merged,
    pub meshes: Merged,
    /// Accessors that could not be read and were left alone.
    pub failures: FailureCounts,
}

impl DedupReport {
    pub fn removed(&self) -> usize {
        self.accessors.removed
            + self.images.removed
            + self.textures.removed
            + self.materials.removed
            + self.meshes.removed
    }
}

impl fmt::Display for DedupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, merged) in [
            ("Accessors", self.accessors),
            ("Images", self.images),
            ("Textures", self.textures),
            ("Materials", self.materials),
            ("Meshes", self.meshes),
        ] {
            writeln!(
                f,
                "{label}: Merged {} of {} ({} remaining)",
                merged.removed,
                merged.before,
                merged.remaining()
            )?;
        }
        if self.failures.total() > 0 {
            writeln!(f, "Skipped accessors: {}", self.failures)?;
        }
        Ok(())
    }
}

/// Runs the enabled sub-passes in dependency order: accessors, images and
/// textures, materials, meshes.
pub fn dedup(
    doc: &mut Document,
    options: &DedupOptions,
    progress: &mut dyn Progress,
) -> Result<DedupReport> {
    let mut report = DedupReport::default();

    if options.accessors {
        report.accessors = dedup_accessors(doc, progress, &mut report.failures)?;
    }
    if options.textures {
        report.images = dedup_images(doc, options, progress)?;
        report.textures = dedup_textures(doc, options, progress)?;
    }
    if options.materials {
        report.materials = dedup_materials(doc, options, progress)?;
    }
    if options.meshes {
        report.meshes = dedup_meshes(doc, options, progress)?;
    }

    info!(removed = report.removed(), "deduplication finished");
    Ok(report)
}

fn finish(
    stage: &str,
    before: usize,
    duplicates: &HashMap<usize, usize>,
    remap: impl FnOnce(Remap) -> GraphRemap,
    doc: &mut Document,
    progress: &mut dyn Progress,
) -> Result<Merged> {
    let merged = Merged {
        before,
        removed: duplicates.len(),
    };
    if !duplicates.is_empty() {
        remap(Remap::from_duplicates(before, duplicates)?).apply(doc)?;
    }
    let details = format!("merged {} of {before}", merged.removed);
    progress.report(&Event::new(stage, "done").fraction(1.0).details(&details));
    debug!(stage, removed = merged.removed, before, "duplicates merged");
    Ok(merged)
}

/// Structural key of an accessor: count, element format, view usage and the
/// content hash. Only accessors sharing a key are byte-compared.
type AccessorKey = (usize, (u32, usize, bool), Option<u32>, u64);

fn target_code(target: &Checked<Target>) -> u32 {
    match target {
        Checked::Valid(Target::ArrayBuffer) => 34962,
        Checked::Valid(Target::ElementArrayBuffer) => 34963,
        Checked::Invalid => 0,
    }
}

pub fn dedup_accessors(
    doc: &mut Document,
    progress: &mut dyn Progress,
    failures: &mut FailureCounts,
) -> Result<Merged> {
    const STAGE: &str = "dedupe-accessors";
    let before = doc.root.accessors.len();
    let details = format!("{before} total");
    progress.report(&Event::new(STAGE, "Deduplicating accessors").fraction(0.0).details(&details));

    let mut duplicates = HashMap::new();
    {
        let doc = &*doc;
        let mut buckets: HashMap<AccessorKey, Vec<(usize, AccessorView<'_>)>> = HashMap::new();

        for (i, accessor) in doc.root.accessors.iter().enumerate() {
            if i > 0 && i % 10_000 == 0 {
                let message = format!("Hashed {i}/{before} accessors");
                progress.report(&Event::new(STAGE, &message).fraction(i as f64 / before as f64));
            }
            if accessor.sparse.is_some() {
                continue;
            }
            let Some(view_index) = accessor.buffer_view else {
                continue;
            };
            let view = match AccessorView::resolve(doc, Index::new(i as u32)) {
                Ok(view) => view,
                Err(err) => {
                    debug!(accessor = i, "left unmerged: {err}");
                    failures.record(&err);
                    continue;
                }
            };
            let usage = doc
                .root
                .buffer_views
                .get(view_index.value())
                .and_then(|view| view.target.as_ref())
                .map(target_code);
            let key = (view.count(), view.format().key(), usage, view.content_hash());

            let bucket = buckets.entry(key).or_default();
            match bucket.iter().find(|(_, other)| other.same_content(&view)) {
                Some(&(canonical, _)) => {
                    duplicates.insert(i, canonical);
                }
                None => bucket.push((i, view)),
            }
        }
    }

    finish(
        STAGE,
        before,
        &duplicates,
        |accessors| GraphRemap {
            accessors: Some(accessors),
            ..Default::default()
        },
        doc,
        progress,
    )
}

/// Encoded bytes of an image: its buffer view, or the URI text for external
/// images.
fn image_payload<'a>(doc: &'a Document, image: &'a json::Image) -> Option<&'a [u8]> {
    if let Some(view) = image.buffer_view {
        let view = doc.root.buffer_views.get(view.value())?;
        let buffer = doc.buffers.get(view.buffer.value())?;
        let offset = view.byte_offset.map_or(0, |o| o.0 as usize);
        let length = view.byte_length.0 as usize;
        return buffer.get(offset..offset.checked_add(length)?);
    }
    image.uri.as_deref().map(str::as_bytes)
}

type ImageKey = (Option<String>, Option<(usize, usize)>, Option<String>, u64);

pub fn dedup_images(
    doc: &mut Document,
    options: &DedupOptions,
    progress: &mut dyn Progress,
) -> Result<Merged> {
    const STAGE: &str = "dedupe-images";
    let before = doc.root.images.len();
    let details = format!("{before} total");
    progress.report(&Event::new(STAGE, "Deduplicating images").fraction(0.0).details(&details));

    let mut duplicates = HashMap::new();
    {
        let mut seen: HashMap<ImageKey, Vec<(usize, &[u8])>> = HashMap::new();
        for (i, image) in doc.root.images.iter().enumerate() {
            let Some(payload) = image_payload(doc, image) else {
                debug!(image = i, "image payload unreadable, left unmerged");
                continue;
            };
            let dimensions = imagesize::blob_size(payload)
                .ok()
                .map(|size| (size.width, size.height));
            let key = (
                image.mime_type.as_ref().map(|mime| mime.0.clone()),
                dimensions,
                options.keep_unique_names.then(|| image.name.clone()).flatten(),
                xxh3_64(payload),
            );
            let bucket = seen.entry(key).or_default();
            match bucket.iter().find(|(_, other)| *other == payload) {
                Some(&(canonical, _)) => {
                    duplicates.insert(i, canonical);
                }
                None => bucket.push((i, payload)),
            }
        }
    }

    finish(
        STAGE,
        before,
        &duplicates,
        |images| GraphRemap {
            images: Some(images),
            ..Default::default()
        },
        doc,
        progress,
    )
}

/// Serialized form of an element with its name stripped unless names are
/// significant. Object keys serialize sorted, so equal content gives equal
/// keys.
fn canonical_key<T: Serialize>(item: &T, keep_name: bool) -> Result<String> {
    let mut value = serde_json::to_value(item)?;
    if !keep_name && let Value::Object(object) = &mut value {
        object.remove("name");
    }
    Ok(value.to_string())
}

fn duplicates_by_key<T: Serialize>(
    items: &[T],
    keep_name: bool,
) -> Result<HashMap<usize, usize>> {
    let mut first: HashMap<String, usize> = HashMap::new();
    let mut duplicates = HashMap::new();
    for (i, item) in items.iter().enumerate() {
        let key = canonical_key(item, keep_name)?;
        match first.get(&key) {
            Some(&canonical) => {
                duplicates.insert(i, canonical);
            }
            None => {
                first.insert(key, i);
            }
        }
    }
    Ok(duplicates)
}

/// Textures are equal when source image, sampler and extensions match; runs
/// after [dedup_images] so the source indices are already canonical.
pub fn dedup_textures(
    doc: &mut Document,
    options: &DedupOptions,
    progress: &mut dyn Progress,
) -> Result<Merged> {
    const STAGE: &str = "dedupe-textures";
    let before = doc.root.textures.len();
    progress.report(&Event::new(STAGE, "Deduplicating textures").fraction(0.0));
    let duplicates = duplicates_by_key(&doc.root.textures, options.keep_unique_names)?;
    finish(
        STAGE,
        before,
        &duplicates,
        |textures| GraphRemap {
            textures: Some(textures),
            ..Default::default()
        },
        doc,
        progress,
    )
}

/// Materials are equal when every factor, texture slot, alpha setting,
/// the double-sided flag and every extension match.
pub fn dedup_materials(
    doc: &mut Document,
    options: &DedupOptions,
    progress: &mut dyn Progress,
) -> Result<Merged> {
    const STAGE: &str = "dedupe-materials";
    let before = doc.root.materials.len();
    progress.report(&Event::new(STAGE, "Deduplicating materials").fraction(0.0));
    let duplicates = duplicates_by_key(&doc.root.materials, options.keep_unique_names)?;
    finish(
        STAGE,
        before,
        &duplicates,
        |materials| GraphRemap {
            materials: Some(materials),
            ..Default::default()
        },
        doc,
        progress,
    )
}

/// Meshes are equal when their primitives reference the same accessors,
/// materials and modes in the same order. Runs after accessor merging so
/// copies made from identical data collapse too.
pub fn dedup_meshes(
    doc: &mut Document,
    options: &DedupOptions,
    progress: &mut dyn Progress,
) -> Result<Merged> {
    const STAGE: &str = "dedupe-meshes";
    let before = doc.root.meshes.len();
    progress.report(&Event::new(STAGE, "Deduplicating meshes").fraction(0.0));
    let duplicates = duplicates_by_key(&doc.root.meshes, options.keep_unique_names)?;
    finish(
        STAGE,
        before,
        &duplicates,
        |meshes| GraphRemap {
            meshes: Some(meshes),
            ..Default::default()
        },
        doc,
        progress,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{extensions, fixtures, progress::Silent};
    use serde_json::json;

    #[test]
    fn identical_accessors_at_different_offsets_merge() {
        let data = fixtures::f32_bytes(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let mut buffer = vec![0xee; 8];
        buffer.extend_from_slice(&data);
        buffer.extend_from_slice(&data);
        let mut doc = fixtures::document(
            json!({
                "buffers": [{ "byteLength": buffer.len() }],
                "bufferViews": [{ "buffer": 0, "byteLength": buffer.len() }],
                "accessors": [
                    { "bufferView": 0, "byteOffset": 8, "count": 3, "componentType": 5126, "type": "VEC3" },
                    { "bufferView": 0, "byteOffset": 44, "count": 3, "componentType": 5126, "type": "VEC3" }
                ],
                "meshes": [
                    { "primitives": [{ "attributes": { "POSITION": 0 } }] },
                    { "primitives": [{ "attributes": { "POSITION": 1 } }] }
                ]
            }),
            vec![buffer],
        );

        let mut failures = FailureCounts::default();
        let merged = dedup_accessors(&mut doc, &mut Silent, &mut failures).unwrap();
        assert_eq!(merged, Merged { before: 2, removed: 1 });
        assert_eq!(doc.root.accessors.len(), 1);
        for mesh in &doc.root.meshes {
            assert_eq!(mesh.primitives[0].attributes.values().next().unwrap().value(), 0);
        }
        doc.check_references().unwrap();
    }

    #[test]
    fn differing_formats_never_merge() {
        let mut doc = fixtures::document(
            json!({
                "buffers": [{ "byteLength": 8 }],
                "bufferViews": [{ "buffer": 0, "byteLength": 8 }],
                "accessors": [
                    { "bufferView": 0, "count": 2, "componentType": 5123, "type": "SCALAR" },
                    { "bufferView": 0, "count": 1, "componentType": 5125, "type": "SCALAR" },
                    { "bufferView": 0, "count": 2, "componentType": 5123, "type": "SCALAR", "normalized": true }
                ]
            }),
            vec![vec![0; 8]],
        );
        let report = dedup(&mut doc, &DedupOptions::default(), &mut Silent).unwrap();
        assert_eq!(report.accessors.removed, 0);
    }

    #[test]
    fn textures_collapse_after_their_images() {
        let png = fixtures::png(2, 2);
        let len = png.len();
        let mut buffer = png.clone();
        buffer.extend_from_slice(&png);
        let mut doc = fixtures::document(
            json!({
                "buffers": [{ "byteLength": buffer.len() }],
                "bufferViews": [
                    { "buffer": 0, "byteLength": len },
                    { "buffer": 0, "byteOffset": len, "byteLength": len }
                ],
                "images": [
                    { "bufferView": 0, "mimeType": "image/png" },
                    { "bufferView": 1, "mimeType": "image/png" }
                ],
                "textures": [{ "source": 0 }, { "source": 1 }],
                "materials": [
                    { "pbrMetallicRoughness": { "baseColorTexture": { "index": 0 } } },
                    { "pbrMetallicRoughness": { "baseColorTexture": { "index": 1 } } }
                ]
            }),
            vec![buffer],
        );

        let report = dedup(&mut doc, &DedupOptions::default(), &mut Silent).unwrap();
        assert_eq!(report.images.removed, 1);
        assert_eq!(report.textures.removed, 1);
        assert_eq!(report.materials.removed, 1);
        assert_eq!(doc.root.materials.len(), 1);
        doc.check_references().unwrap();
    }

    #[test]
    fn merged_textures_are_retargeted_inside_material_extensions() {
        let mut doc = fixtures::document(
            json!({
                "images": [{ "uri": "a.png" }, { "uri": "b.png" }],
                "samplers": [{}, { "magFilter": 9728 }],
                "textures": [
                    { "source": 0 },
                    { "source": 0 },
                    { "source": 1, "sampler": 1 }
                ],
                "materials": [{
                    "pbrMetallicRoughness": { "baseColorTexture": { "index": 1 } },
                    "extensions": {
                        "KHR_materials_clearcoat": {
                            "clearcoatTexture": { "index": 2 },
                            "clearcoatRoughnessTexture": { "index": 1 }
                        }
                    }
                }]
            }),
            vec![],
        );

        let report = dedup(&mut doc, &DedupOptions::default(), &mut Silent).unwrap();
        assert_eq!(report.images.removed, 0);
        assert_eq!(report.textures.removed, 1);
        let mut nested = extensions::material_textures(&doc.root.materials[0]);
        nested.sort_unstable();
        assert_eq!(nested, vec![(0, 0), (1, 0)]);
        assert_eq!(doc.root.textures[1].sampler.map(|s| s.value()), Some(1));
        doc.check_references().unwrap();
    }

    #[test]
    fn unique_names_keep_materials_apart() {
        let fixture = json!({
            "materials": [
                { "name": "left", "doubleSided": true },
                { "name": "right", "doubleSided": true },
                { "name": "left", "doubleSided": false }
            ]
        });

        let mut doc = fixtures::document(fixture.clone(), vec![]);
        let merged = dedup_materials(&mut doc, &DedupOptions::default(), &mut Silent).unwrap();
        assert_eq!(merged.removed, 1);

        let options = DedupOptions {
            keep_unique_names: true,
            ..Default::default()
        };
        let mut doc = fixtures::document(fixture, vec![]);
        let merged = dedup_materials(&mut doc, &options, &mut Silent).unwrap();
        assert_eq!(merged.removed, 0);
    }

    #[test]
    fn meshes_merge_once_materials_do() {
        let mut doc = fixtures::document(
            json!({
                "materials": [{ "alphaMode": "MASK" }, { "alphaMode": "MASK" }],
                "meshes": [
                    { "primitives": [{ "attributes": {}, "material": 0 }] },
                    { "primitives": [{ "attributes": {}, "material": 1 }] }
                ],
                "nodes": [{ "mesh": 0 }, { "mesh": 1 }]
            }),
            vec![],
        );
        let report = dedup(&mut doc, &DedupOptions::default(), &mut Silent).unwrap();
        assert_eq!(report.meshes.removed, 1);
        assert!(doc.root.nodes.iter().all(|node| node.mesh == Some(Index::new(0))));
    }

    #[test]
    fn second_run_finds_nothing() {
        let mut doc = fixtures::document(
            json!({
                "materials": [{}, {}, { "doubleSided": true }]
            }),
            vec![],
        );
        dedup(&mut doc, &DedupOptions::default(), &mut Silent).unwrap();
        let again = dedup(&mut doc, &DedupOptions::default(), &mut Silent).unwrap();
        assert_eq!(again.removed(), 0);
    }
}
