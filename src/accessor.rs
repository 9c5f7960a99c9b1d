//! Typed, strided views over accessor storage.
//!
//! [AccessorView] is the only place that follows the
//! accessor → buffer view → buffer indirection. Every pass reads vertex and
//! index data through it, so none of them assume tight packing.

use gltf::json::{
    self,
    accessor::{ComponentType, GenericComponentType, Type},
    buffer::Stride,
    validation::Checked,
    Index,
};
use xxhash_rust::xxh3::Xxh3;

use crate::{
    document::Document,
    error::{Error, Result},
};

pub fn component_width(component: ComponentType) -> usize {
    match component {
        ComponentType::I8 | ComponentType::U8 => 1,
        ComponentType::I16 | ComponentType::U16 => 2,
        ComponentType::U32 | ComponentType::F32 => 4,
    }
}

/// The GL enum glTF stores for a component type.
pub fn component_code(component: ComponentType) -> u32 {
    match component {
        ComponentType::I8 => 5120,
        ComponentType::U8 => 5121,
        ComponentType::I16 => 5122,
        ComponentType::U16 => 5123,
        ComponentType::U32 => 5125,
        ComponentType::F32 => 5126,
    }
}

pub fn shape_arity(shape: Type) -> usize {
    match shape {
        Type::Scalar => 1,
        Type::Vec2 => 2,
        Type::Vec3 => 3,
        Type::Vec4 | Type::Mat2 => 4,
        Type::Mat3 => 9,
        Type::Mat4 => 16,
    }
}

/// Component type, element shape and normalization of one accessor element.
#[derive(Debug, Clone, Copy)]
pub struct ElementFormat {
    pub component: ComponentType,
    pub shape: Type,
    pub normalized: bool,
}

impl ElementFormat {
    pub fn new(component: ComponentType, shape: Type) -> Self {
        Self {
            component,
            shape,
            normalized: false,
        }
    }

    pub fn of(accessor: &json::Accessor) -> Result<Self> {
        let component = match &accessor.component_type {
            Checked::Valid(GenericComponentType(component)) => *component,
            Checked::Invalid => {
                return Err(Error::UnsupportedFormat(
                    "unknown accessor component type".to_string(),
                ));
            }
        };
        let shape = match &accessor.type_ {
            Checked::Valid(shape) => *shape,
            Checked::Invalid => {
                return Err(Error::UnsupportedFormat(
                    "unknown accessor element shape".to_string(),
                ));
            }
        };
        Ok(Self {
            component,
            shape,
            normalized: accessor.normalized,
        })
    }

    /// Byte width of one element: component width × shape arity.
    pub fn width(&self) -> usize {
        component_width(self.component) * shape_arity(self.shape)
    }

    /// Hashable identity of the format.
    pub fn key(&self) -> (u32, usize, bool) {
        (
            component_code(self.component),
            shape_arity(self.shape) | shape_tag(self.shape),
            self.normalized,
        )
    }
}

// Mat2 and Vec4 share an arity, so the key tags matrices apart.
fn shape_tag(shape: Type) -> usize {
    match shape {
        Type::Mat2 | Type::Mat3 | Type::Mat4 => 1 << 8,
        _ => 0,
    }
}

impl PartialEq for ElementFormat {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ElementFormat {}

/// A resolved accessor: base slice, element stride, element width and count.
///
/// The bounds of the whole element range are validated once in
/// [AccessorView::resolve]; the view borrows the document, so it can never
/// outlive a mutation of the buffers it points into. Sparse accessors do not
/// resolve: their base view alone is not their content.
#[derive(Debug, Clone, Copy)]
pub struct AccessorView<'a> {
    bytes: &'a [u8],
    stride: usize,
    format: ElementFormat,
    count: usize,
}

impl<'a> AccessorView<'a> {
    pub fn resolve(doc: &'a Document, index: Index<json::Accessor>) -> Result<Self> {
        let accessor = doc.root.accessors.get(index.value()).ok_or_else(|| {
            Error::Structural(format!("accessor {} out of range", index.value()))
        })?;
        if accessor.sparse.is_some() {
            return Err(Error::UnsupportedFormat(format!(
                "accessor {} carries sparse substitutions",
                index.value()
            )));
        }
        let format = ElementFormat::of(accessor)?;

        let view_index = accessor.buffer_view.ok_or_else(|| {
            Error::Structural(format!("accessor {} has no buffer view", index.value()))
        })?;
        let view = doc.root.buffer_views.get(view_index.value()).ok_or_else(|| {
            Error::Structural(format!("buffer view {} out of range", view_index.value()))
        })?;
        let buffer = doc.buffers.get(view.buffer.value()).ok_or_else(|| {
            Error::Structural(format!("buffer {} out of range", view.buffer.value()))
        })?;

        let width = format.width();
        let stride = match view.byte_stride {
            Some(Stride(stride)) if stride > 0 => stride,
            _ => width,
        };
        let offset = view.byte_offset.map_or(0, |o| o.0 as usize)
            + accessor.byte_offset.map_or(0, |o| o.0 as usize);
        let count = accessor.count.0 as usize;

        let span = match count {
            0 => Some(0),
            _ => stride
                .checked_mul(count - 1)
                .and_then(|span| span.checked_add(width)),
        };
        let bytes = span
            .and_then(|span| offset.checked_add(span))
            .and_then(|end| buffer.get(offset..end))
            .ok_or_else(|| {
                Error::Structural(format!(
                    "accessor {} ({count} x {width} bytes, stride {stride}, offset {offset}) \
                     overruns buffer {} of {} bytes",
                    index.value(),
                    view.buffer.value(),
                    buffer.len()
                ))
            })?;

        Ok(Self {
            bytes,
            stride,
            format,
            count,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn width(&self) -> usize {
        self.format.width()
    }

    pub fn format(&self) -> ElementFormat {
        self.format
    }

    pub fn element(&self, i: usize) -> Option<&'a [u8]> {
        if i >= self.count {
            return None;
        }
        let start = i * self.stride;
        self.bytes.get(start..start + self.format.width())
    }

    pub fn elements(self) -> impl Iterator<Item = &'a [u8]> {
        (0..self.count).filter_map(move |i| self.element(i))
    }

    /// Reads element `i` as an unsigned integer index.
    pub fn index(&self, i: usize) -> Option<u32> {
        let bytes = self.element(i)?;
        match self.format.component {
            ComponentType::U8 => Some(u32::from(bytes[0])),
            ComponentType::U16 => Some(u32::from(u16::from_le_bytes([bytes[0], bytes[1]]))),
            ComponentType::U32 => Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            _ => None,
        }
    }

    pub fn read_indices(&self) -> Result<Vec<u32>> {
        let unsigned = matches!(
            self.format.component,
            ComponentType::U8 | ComponentType::U16 | ComponentType::U32
        );
        if !unsigned || !matches!(self.format.shape, Type::Scalar) {
            return Err(Error::UnsupportedFormat(format!(
                "index accessor of component type {}",
                component_code(self.format.component)
            )));
        }
        (0..self.count)
            .map(|i| {
                self.index(i)
                    .ok_or_else(|| Error::Structural(format!("index element {i} unreadable")))
            })
            .collect()
    }

    /// Folds every element's raw bytes into one xxh3 digest.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = Xxh3::new();
        for element in self.elements() {
            hasher.update(element);
        }
        hasher.digest()
    }

    /// Element-by-element byte comparison, independent of stride.
    pub fn same_content(&self, other: &AccessorView<'_>) -> bool {
        self.count == other.count
            && self.width() == other.width()
            && self.elements().eq(other.elements())
    }

    /// Copies the elements into a tightly packed vector.
    pub fn to_packed(&self) -> Vec<u8> {
        let mut packed = Vec::with_capacity(self.count * self.width());
        for element in self.elements() {
            packed.extend_from_slice(element);
        }
        packed
    }
}

/// Narrowest unsigned component able to address a vertex range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexWidth {
    U8,
    U16,
    U32,
}

impl IndexWidth {
    pub fn for_vertex_count(vertex_count: usize) -> Self {
        if vertex_count <= u8::MAX as usize {
            Self::U8
        } else if vertex_count <= u16::MAX as usize {
            Self::U16
        } else {
            Self::U32
        }
    }

    pub fn of(component: ComponentType) -> Option<Self> {
        match component {
            ComponentType::U8 => Some(Self::U8),
            ComponentType::U16 => Some(Self::U16),
            ComponentType::U32 => Some(Self::U32),
            _ => None,
        }
    }

    pub fn component_type(self) -> ComponentType {
        match self {
            Self::U8 => ComponentType::U8,
            Self::U16 => ComponentType::U16,
            Self::U32 => ComponentType::U32,
        }
    }

    pub fn format(self) -> ElementFormat {
        ElementFormat::new(self.component_type(), Type::Scalar)
    }

    /// Little-endian encoding; values are truncated to the width.
    pub fn encode(self, indices: &[u32]) -> Vec<u8> {
        match self {
            Self::U8 => indices.iter().map(|&i| i as u8).collect(),
            Self::U16 => indices
                .iter()
                .flat_map(|&i| (i as u16).to_le_bytes())
                .collect(),
            Self::U32 => indices.iter().flat_map(|&i| i.to_le_bytes()).collect(),
        }
    }
}
