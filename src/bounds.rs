//! `min`/`max` of float VEC3 position accessors.

use gltf::json::{
    accessor::{ComponentType, Type},
    mesh::Semantic,
    validation::Checked,
    Value,
};
use hashbrown::HashSet;
use tracing::debug;

use crate::{accessor::AccessorView, document::Document};

pub type Bounds = ([f32; 3], [f32; 3]);

/// Component-wise bounds of packed or strided `f32` triples. NaN components
/// are ignored; `None` when there is no finite element.
pub fn vec3_bounds<'a>(elements: impl IntoIterator<Item = &'a [u8]>) -> Option<Bounds> {
    let mut min = [f32::INFINITY; 3];
    let mut max = [f32::NEG_INFINITY; 3];
    for element in elements {
        let Some(bytes) = element.get(..12) else {
            continue;
        };
        let xyz: [f32; 3] = bytemuck::pod_read_unaligned(bytes);
        for axis in 0..3 {
            min[axis] = min[axis].min(xyz[axis]);
            max[axis] = max[axis].max(xyz[axis]);
        }
    }
    (0..3)
        .all(|axis| min[axis] <= max[axis])
        .then_some((min, max))
}

pub fn to_json((min, max): Bounds) -> (Value, Value) {
    let array = |values: [f32; 3]| {
        Value::Array(values.iter().map(|&v| Value::from(f64::from(v))).collect())
    };
    (array(min), array(max))
}

fn is_float_vec3(view: &AccessorView<'_>) -> bool {
    let format = view.format();
    matches!(format.component, ComponentType::F32) && matches!(format.shape, Type::Vec3)
}

/// Bounds of a resolved accessor when it holds float triples.
pub fn of_view(view: &AccessorView<'_>) -> Option<Bounds> {
    if !is_float_vec3(view) {
        return None;
    }
    vec3_bounds(view.elements())
}

/// Refreshes `min`/`max` of every float VEC3 accessor bound to a POSITION
/// attribute. Returns how many accessors were updated.
pub fn recompute_position_bounds(doc: &mut Document) -> usize {
    let mut positions = HashSet::new();
    for primitive in doc.root.meshes.iter().flat_map(|mesh| &mesh.primitives) {
        if let Some(&accessor) = primitive.attributes.get(&Checked::Valid(Semantic::Positions)) {
            positions.insert(accessor.value());
        }
    }

    let mut updates: Vec<(usize, Bounds)> = positions
        .into_iter()
        .filter(|&index| {
            doc.root
                .accessors
                .get(index)
                .is_some_and(|accessor| accessor.sparse.is_none())
        })
        .filter_map(|index| {
            let view = AccessorView::resolve(doc, gltf::json::Index::new(index as u32)).ok()?;
            of_view(&view).map(|bounds| (index, bounds))
        })
        .collect();
    updates.sort_unstable_by_key(|(index, _)| *index);

    for &(index, bounds) in &updates {
        let (min, max) = to_json(bounds);
        let accessor = &mut doc.root.accessors[index];
        accessor.min = Some(min);
        accessor.max = Some(max);
    }
    debug!(updated = updates.len(), "position bounds recomputed");
    updates.len()
}
