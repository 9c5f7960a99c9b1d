//! Access to the few glTF extensions the graph passes have to understand.
//!
//! Extension objects are kept as opaque JSON by `gltf::json`; these helpers
//! round-trip them through `serde_json` so the passes never depend on which
//! typed extension fields are compiled in.

use gltf::json;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::error::Result;

pub const DRACO_MESH_COMPRESSION: &str = "KHR_draco_mesh_compression";
pub const MATERIALS_UNLIT: &str = "KHR_materials_unlit";

/// Texture extensions that point at an alternative source image.
pub const TEXTURE_SOURCES: [&str; 4] = [
    "KHR_texture_basisu",
    "EXT_texture_webp",
    "EXT_texture_avif",
    "MSFT_texture_dds",
];

pub fn to_object<T: Serialize>(extensions: &Option<T>) -> Map<String, Value> {
    match serde_json::to_value(extensions) {
        Ok(Value::Object(object)) => object,
        _ => Map::new(),
    }
}

fn from_object<T: DeserializeOwned>(object: Map<String, Value>) -> Result<Option<T>> {
    if object.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(Value::Object(object))?))
}

/// Stable text form of an extension block, used inside equivalence keys.
pub fn canonical<T: Serialize>(extensions: &Option<T>) -> String {
    let object = to_object(extensions);
    if object.is_empty() {
        return String::new();
    }
    Value::Object(object).to_string()
}

fn index_field(object: &Map<String, Value>, extension: &str, field: &str) -> Option<usize> {
    object
        .get(extension)?
        .get(field)?
        .as_u64()
        .map(|index| index as usize)
}

/// Rewrites `extension.field`, or removes the extension when `index` is
/// `None`. Blocks without the extension are left as they are.
fn set_index_field<T: Serialize + DeserializeOwned>(
    extensions: &mut Option<T>,
    extension: &str,
    field: &str,
    index: Option<usize>,
) -> Result<()> {
    let mut object = to_object(extensions);
    match index {
        Some(index) => match object.get_mut(extension) {
            Some(Value::Object(block)) => {
                block.insert(field.to_string(), Value::from(index));
            }
            _ => return Ok(()),
        },
        None => {
            if object.remove(extension).is_none() {
                return Ok(());
            }
        }
    }
    *extensions = from_object(object)?;
    Ok(())
}

/// Buffer view holding a primitive's compressed geometry, if it has one.
pub fn draco_buffer_view(primitive: &json::mesh::Primitive) -> Option<usize> {
    index_field(
        &to_object(&primitive.extensions),
        DRACO_MESH_COMPRESSION,
        "bufferView",
    )
}

pub fn set_draco_buffer_view(
    primitive: &mut json::mesh::Primitive,
    view: Option<usize>,
) -> Result<()> {
    set_index_field(
        &mut primitive.extensions,
        DRACO_MESH_COMPRESSION,
        "bufferView",
        view,
    )
}

/// `(extension, image)` for every alternative source a texture declares.
pub fn texture_sources(texture: &json::Texture) -> Vec<(&'static str, usize)> {
    let object = to_object(&texture.extensions);
    if object.is_empty() {
        return Vec::new();
    }
    TEXTURE_SOURCES
        .into_iter()
        .filter_map(|extension| Some((extension, index_field(&object, extension, "source")?)))
        .collect()
}

pub fn set_texture_source(
    texture: &mut json::Texture,
    extension: &str,
    image: Option<usize>,
) -> Result<()> {
    set_index_field(&mut texture.extensions, extension, "source", image)
}

/// `(texture, uv set)` of a texture-info object: a `*Texture` member
/// holding an integer `index`.
fn texture_info(key: &str, value: &Value) -> Option<(usize, u32)> {
    if !key.ends_with("Texture") {
        return None;
    }
    let index = value.get("index")?.as_u64()?;
    let tex_coord = value.get("texCoord").and_then(Value::as_u64).unwrap_or(0);
    Some((index as usize, tex_coord as u32))
}

fn collect_texture_infos(value: &Value, found: &mut Vec<(usize, u32)>) {
    match value {
        Value::Object(object) => {
            for (key, value) in object {
                match texture_info(key, value) {
                    Some(info) => found.push(info),
                    None => collect_texture_infos(value, found),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_texture_infos(item, found);
            }
        }
        _ => {}
    }
}

/// `(texture, uv set)` of every texture info nested in a material's
/// extensions: `clearcoatTexture`, `sheenColorTexture`, `thicknessTexture`
/// and the like.
pub fn material_textures(material: &json::Material) -> Vec<(usize, u32)> {
    let mut found = Vec::new();
    for value in to_object(&material.extensions).values() {
        collect_texture_infos(value, &mut found);
    }
    found
}

fn retarget_texture_infos(value: &mut Value, texture: &impl Fn(usize) -> Option<usize>) -> bool {
    let mut changed = false;
    match value {
        Value::Object(object) => {
            let mut lost = Vec::new();
            for (key, value) in object.iter_mut() {
                let Some((index, _)) = texture_info(key, value) else {
                    changed |= retarget_texture_infos(value, texture);
                    continue;
                };
                match texture(index) {
                    Some(new) if new == index => {}
                    Some(new) => {
                        value["index"] = Value::from(new);
                        changed = true;
                    }
                    None => lost.push(key.clone()),
                }
            }
            for key in lost {
                object.remove(&key);
                changed = true;
            }
        }
        Value::Array(items) => {
            for item in items {
                changed |= retarget_texture_infos(item, texture);
            }
        }
        _ => {}
    }
    changed
}

/// Rewrites the texture indices listed by [material_textures]. A texture
/// info whose texture maps to `None` is removed, like a core slot.
pub fn remap_material_textures(
    material: &mut json::Material,
    texture: impl Fn(usize) -> Option<usize>,
) -> Result<()> {
    let mut object = to_object(&material.extensions);
    let mut changed = false;
    for value in object.values_mut() {
        changed |= retarget_texture_infos(value, &texture);
    }
    if changed {
        material.extensions = from_object(object)?;
    }
    Ok(())
}

pub fn is_unlit(material: &json::Material) -> bool {
    to_object(&material.extensions).contains_key(MATERIALS_UNLIT)
}

/// Whether a node carries custom metadata in `extras`.
pub fn has_extras(node: &json::Node) -> bool {
    node.extras
        .as_ref()
        .is_some_and(|raw| !matches!(raw.get().trim(), "" | "{}" | "null"))
}
