//! Builds documents with real binary payloads for the integration tests.

#![allow(dead_code)]

use gltf::json::{self, Index};
use gltf_squash::{accessor::AccessorView, Document};
use serde_json::{json, Value};

/// Packs accessors into a single buffer while the JSON around them is
/// written by hand.
#[derive(Default)]
pub struct Builder {
    buffer: Vec<u8>,
    views: Vec<Value>,
    accessors: Vec<Value>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_view(&mut self, bytes: &[u8]) -> usize {
        while self.buffer.len() % 4 != 0 {
            self.buffer.push(0);
        }
        self.views.push(json!({
            "buffer": 0,
            "byteOffset": self.buffer.len(),
            "byteLength": bytes.len()
        }));
        self.buffer.extend_from_slice(bytes);
        self.views.len() - 1
    }

    fn push(&mut self, bytes: &[u8], accessor: Value) -> u32 {
        let mut accessor = accessor;
        accessor["bufferView"] = json!(self.push_view(bytes));
        self.accessors.push(accessor);
        (self.accessors.len() - 1) as u32
    }

    /// Gives a float VEC3 accessor sparse substitutions for the listed
    /// elements.
    pub fn sparse(&mut self, accessor: u32, overrides: &[(u8, [f32; 3])]) {
        let indices: Vec<u8> = overrides.iter().map(|&(index, _)| index).collect();
        let values: Vec<[f32; 3]> = overrides.iter().map(|&(_, value)| value).collect();
        let indices = self.push_view(&indices);
        let values = self.push_view(bytemuck::cast_slice(&values));
        self.accessors[accessor as usize]["sparse"] = json!({
            "count": overrides.len(),
            "indices": { "bufferView": indices, "componentType": 5121 },
            "values": { "bufferView": values }
        });
    }

    /// A float VEC3 POSITION stream with exact `min`/`max`.
    pub fn positions(&mut self, points: &[[f32; 3]]) -> u32 {
        let mut min = [f32::MAX; 3];
        let mut max = [f32::MIN; 3];
        for point in points {
            for axis in 0..3 {
                min[axis] = min[axis].min(point[axis]);
                max[axis] = max[axis].max(point[axis]);
            }
        }
        self.push(
            bytemuck::cast_slice(points),
            json!({
                "count": points.len(),
                "componentType": 5126,
                "type": "VEC3",
                "min": min,
                "max": max
            }),
        )
    }

    pub fn vec3(&mut self, values: &[[f32; 3]]) -> u32 {
        self.push(
            bytemuck::cast_slice(values),
            json!({ "count": values.len(), "componentType": 5126, "type": "VEC3" }),
        )
    }

    pub fn scalars(&mut self, values: &[f32]) -> u32 {
        self.push(
            bytemuck::cast_slice(values),
            json!({ "count": values.len(), "componentType": 5126, "type": "SCALAR" }),
        )
    }

    pub fn indices(&mut self, indices: &[u16]) -> u32 {
        self.push(
            bytemuck::cast_slice(indices),
            json!({ "count": indices.len(), "componentType": 5123, "type": "SCALAR" }),
        )
    }

    /// Merges the packed arrays into `rest` and builds the document.
    pub fn finish(self, rest: Value) -> Document {
        let mut value = rest;
        value["asset"] = json!({ "version": "2.0" });
        if !self.buffer.is_empty() {
            value["buffers"] = json!([{ "byteLength": self.buffer.len() }]);
            value["bufferViews"] = Value::Array(self.views);
            value["accessors"] = Value::Array(self.accessors);
        }
        let root: json::Root = serde_json::from_value(value).unwrap();
        let buffers = if self.buffer.is_empty() {
            vec![]
        } else {
            vec![self.buffer]
        };
        Document::new(root, buffers).unwrap()
    }
}

pub fn accessor(doc: &Document, index: Index<json::Accessor>) -> AccessorView<'_> {
    AccessorView::resolve(doc, index).unwrap()
}

pub fn position_of(primitive: &json::mesh::Primitive) -> Index<json::Accessor> {
    primitive
        .attributes
        .get(&json::validation::Checked::Valid(json::mesh::Semantic::Positions))
        .copied()
        .unwrap()
}

/// Vertex bytes in draw order: POSITION looked up through the index stream.
pub fn drawn_positions(doc: &Document, primitive: &json::mesh::Primitive) -> Vec<Vec<u8>> {
    let positions = accessor(doc, position_of(primitive));
    let order: Vec<u32> = match primitive.indices {
        Some(indices) => accessor(doc, indices).read_indices().unwrap(),
        None => (0..positions.count() as u32).collect(),
    };
    order
        .into_iter()
        .map(|i| positions.element(i as usize).unwrap().to_vec())
        .collect()
}
