//! GLB decoding into a [Document] and encoding back out.

use std::{
    borrow::Cow,
    io::{Cursor, Read, Seek},
};

use gltf::json::{self, Index};
use tracing::debug;

use crate::{
    document::{pad_to_4bytes, Document},
    error::{Error, Result},
};

/// Reads a binary glTF. Only the embedded BIN chunk can back a buffer;
/// buffers that point at a URI are rejected.
pub fn read_glb<R: Read + Seek>(reader: &mut R) -> Result<Document> {
    let gltf::Gltf { document, mut blob } = gltf::Gltf::from_reader(reader)?;
    let root = document.into_json();

    let mut buffers = Vec::with_capacity(root.buffers.len());
    for (b, buffer) in root.buffers.iter().enumerate() {
        if let Some(uri) = &buffer.uri {
            return Err(Error::UnsupportedFormat(format!(
                "buffer {b} is stored outside the container ({uri})"
            )));
        }
        let Some(mut data) = blob.take() else {
            return Err(Error::Structural(format!("buffer {b} has no BIN chunk to read")));
        };
        let length = buffer.byte_length.0 as usize;
        if data.len() < length {
            return Err(Error::Structural(format!(
                "BIN chunk holds {} bytes but buffer {b} declares {length}",
                data.len()
            )));
        }
        data.truncate(length);
        buffers.push(data);
    }

    debug!(buffers = buffers.len(), "glb decoded");
    Document::new(root, buffers)
}

/// Packs every buffer into one BIN chunk, rewriting view offsets to match,
/// and serializes the result as GLB.
pub fn write_glb(doc: &Document) -> Result<Vec<u8>> {
    let mut root = doc.root.clone();
    let mut blob: Vec<u8> = Vec::with_capacity(doc.buffers.iter().map(|b| b.len() + 3).sum());
    let mut bases = Vec::with_capacity(doc.buffers.len());
    for data in &doc.buffers {
        pad_to_4bytes(&mut blob);
        bases.push(blob.len());
        blob.extend_from_slice(data);
    }
    pad_to_4bytes(&mut blob);

    for view in &mut root.buffer_views {
        let base = bases.get(view.buffer.value()).copied().ok_or_else(|| {
            Error::Structural(format!("buffer view references buffer {}", view.buffer.value()))
        })?;
        let offset = view.byte_offset.map_or(0, |o| o.0 as usize) + base;
        view.buffer = Index::new(0);
        view.byte_offset = if offset == 0 {
            None
        } else {
            Some(offset.into())
        };
    }

    root.buffers.clear();
    if !blob.is_empty() {
        root.push(json::Buffer {
            byte_length: blob.len().into(),
            name: None,
            uri: None,
            extensions: None,
            extras: Default::default(),
        });
    }

    let json_bytes = json::serialize::to_vec(&root)?;
    let length = container_length(json_bytes.len(), (!blob.is_empty()).then_some(blob.len()))?;
    let glb = gltf::binary::Glb {
        header: gltf::binary::Header {
            magic: *b"glTF",
            version: 2,
            length,
        },
        json: Cow::Owned(json_bytes),
        bin: if blob.is_empty() {
            None
        } else {
            Some(Cow::Owned(blob))
        },
    };

    let mut result: Vec<u8> = Vec::new();
    glb.to_writer(Cursor::new(&mut result))?;
    Ok(result)
}

/// Total GLB size: 12-byte header plus each chunk's 8-byte header and
/// 4-aligned payload. GLB stores it, and every chunk length, as a `u32`.
fn container_length(json: usize, bin: Option<usize>) -> Result<u32> {
    let chunk = |len: usize| len.checked_next_multiple_of(4)?.checked_add(8);
    let total = chunk(json)
        .and_then(|json| json.checked_add(12))
        .and_then(|total| match bin {
            Some(bin) => total.checked_add(chunk(bin)?),
            None => Some(total),
        });
    total
        .and_then(|total| u32::try_from(total).ok())
        .ok_or_else(|| {
            Error::UnsupportedFormat(format!(
                "GLB of {json} JSON bytes and {} BIN bytes exceeds 4 GiB",
                bin.unwrap_or(0)
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{accessor::AccessorView, fixtures};
    use serde_json::json;

    #[test]
    fn buffers_are_packed_into_one_chunk() {
        let doc = fixtures::document(
            json!({
                "buffers": [{ "byteLength": 3 }, { "byteLength": 4 }],
                "bufferViews": [
                    { "buffer": 0, "byteLength": 3 },
                    { "buffer": 1, "byteOffset": 0, "byteLength": 4 }
                ],
                "accessors": [
                    { "bufferView": 1, "count": 1, "componentType": 5126, "type": "SCALAR" }
                ]
            }),
            vec![vec![1, 2, 3], fixtures::f32_bytes(&[2.5])],
        );

        let bytes = write_glb(&doc).unwrap();
        let back = read_glb(&mut Cursor::new(bytes)).unwrap();

        assert_eq!(back.buffers.len(), 1);
        assert_eq!(back.buffers[0].len(), 8);
        assert_eq!(back.root.buffer_views[1].buffer.value(), 0);
        assert_eq!(back.root.buffer_views[1].byte_offset.map(|o| o.0), Some(4));
        let view = AccessorView::resolve(&back, Index::new(0)).unwrap();
        assert_eq!(view.element(0), Some(&fixtures::f32_bytes(&[2.5])[..]));
    }

    #[test]
    fn document_without_buffers_has_no_bin_chunk() {
        let doc = fixtures::document(json!({ "nodes": [{}] }), vec![]);
        let back = read_glb(&mut Cursor::new(write_glb(&doc).unwrap())).unwrap();
        assert!(back.buffers.is_empty());
        assert_eq!(back.root.nodes.len(), 1);
    }

    #[test]
    fn container_length_counts_headers_and_padding() {
        assert_eq!(container_length(13, None).unwrap(), 12 + 8 + 16);
        assert_eq!(container_length(16, Some(6)).unwrap(), 12 + 8 + 16 + 8 + 8);
        assert!(matches!(
            container_length(16, Some(u32::MAX as usize)),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn external_buffers_are_unsupported() {
        let text = json!({
            "asset": { "version": "2.0" },
            "buffers": [{ "byteLength": 4, "uri": "data.bin" }]
        })
        .to_string();
        let err = read_glb(&mut Cursor::new(text.into_bytes())).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }
}
