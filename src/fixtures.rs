//! Document builders shared by the unit tests.

use gltf::json::{self, Index};
use serde_json::{json, Map, Value};

use crate::document::Document;

/// Builds a document from glTF JSON; `asset` is filled in when missing.
pub fn document(mut value: Value, buffers: Vec<Vec<u8>>) -> Document {
    if let Value::Object(object) = &mut value {
        object
            .entry("asset")
            .or_insert_with(|| json!({ "version": "2.0" }));
    }
    let root: json::Root = serde_json::from_value(value).unwrap();
    Document::new(root, buffers).unwrap()
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

pub fn primitive(
    attributes: &[(&str, Index<json::Accessor>)],
    indices: Option<Index<json::Accessor>>,
    material: Option<u32>,
) -> json::mesh::Primitive {
    let attributes: Map<String, Value> = attributes
        .iter()
        .map(|(semantic, accessor)| (semantic.to_string(), json!(accessor.value())))
        .collect();
    let mut value = json!({ "attributes": attributes });
    if let Some(indices) = indices {
        value["indices"] = json!(indices.value());
    }
    if let Some(material) = material {
        value["material"] = json!(material);
    }
    serde_json::from_value(value).unwrap()
}

pub fn mesh(primitives: Vec<json::mesh::Primitive>) -> json::Mesh {
    let mut mesh: json::Mesh = serde_json::from_value(json!({ "primitives": [] })).unwrap();
    mesh.primitives = primitives;
    mesh
}

/// An encoded `width × height` PNG.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let pixels = image::RgbaImage::from_pixel(width, height, image::Rgba([200, 40, 40, 255]));
    let mut encoded = std::io::Cursor::new(Vec::new());
    pixels
        .write_to(&mut encoded, image::ImageFormat::Png)
        .unwrap();
    encoded.into_inner()
}
