//! The validated catalog of item types.
//!
//! [`ItemTable`] is built once from configuration and is immutable
//! afterwards. Construction enforces the structural invariants the rest of
//! the engine relies on: at least one type, unique names, consistent scent
//! and color dimensions, and per-type vectors (requirements, costs,
//! interactions) that cover every type.

use std::collections::BTreeSet;

use patchwork_types::{ItemType, Position};

use crate::energy::{IntensityFunction, InteractionFunction};
use crate::error::WorldError;

/// Validated item catalog with compiled energy functions.
#[derive(Debug, Clone)]
pub struct ItemTable {
    types: Vec<ItemType>,
    intensities: Vec<IntensityFunction>,
    /// `interactions[t][u]` is the energy a `u` item exerts on a `t` candidate.
    interactions: Vec<Vec<InteractionFunction>>,
    scent_dimension: usize,
    color_dimension: usize,
    reach: u64,
}

impl ItemTable {
    /// Validate `types` against the configured dimensions and compile their
    /// energy functions.
    pub fn new(
        types: Vec<ItemType>,
        scent_dimension: usize,
        color_dimension: usize,
    ) -> Result<Self, WorldError> {
        if types.is_empty() {
            return Err(WorldError::EmptyItemTable);
        }
        let count = types.len();
        let mut names = BTreeSet::new();
        let mut intensities = Vec::with_capacity(count);
        let mut interactions = Vec::with_capacity(count);

        for item in &types {
            if !names.insert(item.name.as_str()) {
                return Err(WorldError::DuplicateItemName {
                    name: item.name.clone(),
                });
            }
            if item.scent.len() != scent_dimension {
                return Err(WorldError::ScentDimension {
                    item: item.name.clone(),
                    expected: scent_dimension,
                    actual: item.scent.len(),
                });
            }
            if item.color.len() != color_dimension {
                return Err(WorldError::ColorDimension {
                    item: item.name.clone(),
                    expected: color_dimension,
                    actual: item.color.len(),
                });
            }
            check_per_type(item, "required_item_counts", item.required_item_counts.len(), count)?;
            check_per_type(item, "required_item_costs", item.required_item_costs.len(), count)?;
            check_per_type(item, "interactions", item.interactions.len(), count)?;
            if !(0.0..=1.0).contains(&item.visual_occlusion) {
                return Err(WorldError::Occlusion {
                    item: item.name.clone(),
                    value: item.visual_occlusion,
                });
            }

            intensities.push(IntensityFunction::compile(&item.name, &item.intensity)?);
            let row = item
                .interactions
                .iter()
                .map(|spec| InteractionFunction::compile(&item.name, spec))
                .collect::<Result<Vec<_>, _>>()?;
            interactions.push(row);
        }

        let reach = interactions
            .iter()
            .flatten()
            .map(InteractionFunction::reach)
            .max()
            .unwrap_or(0);

        Ok(Self {
            types,
            intensities,
            interactions,
            scent_dimension,
            color_dimension,
            reach,
        })
    }

    /// Number of item types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Always false: construction rejects an empty table.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// The configured description of type `index`.
    pub fn get(&self, index: usize) -> Result<&ItemType, WorldError> {
        self.types
            .get(index)
            .ok_or(WorldError::UnknownItemType(index))
    }

    /// All item type descriptions in index order.
    pub fn types(&self) -> &[ItemType] {
        &self.types
    }

    /// Length of every scent vector.
    pub const fn scent_dimension(&self) -> usize {
        self.scent_dimension
    }

    /// Length of every color vector.
    pub const fn color_dimension(&self) -> usize {
        self.color_dimension
    }

    /// Largest Chebyshev distance over which any interaction is non-zero.
    pub const fn interaction_reach(&self) -> u64 {
        self.reach
    }

    /// True if items of type `index` block movement. Unknown types never block.
    pub fn blocks_movement(&self, index: usize) -> bool {
        self.types.get(index).is_some_and(|t| t.blocks_movement)
    }

    /// Intensity of type `t` at `pos`.
    pub fn intensity(&self, t: usize, pos: Position) -> f32 {
        self.intensities.get(t).map_or(0.0, |f| f.evaluate(pos))
    }

    /// Symmetrized pairwise energy between a candidate of type `t` at `pos`
    /// and an existing item of type `u` at `other`.
    pub fn pair_energy(&self, t: usize, pos: Position, u: usize, other: Position) -> f32 {
        let forward = self
            .interactions
            .get(t)
            .and_then(|row| row.get(u))
            .map_or(0.0, |f| f.evaluate(pos, other));
        let backward = self
            .interactions
            .get(u)
            .and_then(|row| row.get(t))
            .map_or(0.0, |f| f.evaluate(other, pos));
        forward + backward
    }
}

fn check_per_type(
    item: &ItemType,
    field: &'static str,
    actual: usize,
    expected: usize,
) -> Result<(), WorldError> {
    if actual == expected {
        Ok(())
    } else {
        Err(WorldError::NotPerType {
            item: item.name.clone(),
            field,
            expected,
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use patchwork_types::{IntensityKind, IntensitySpec, InteractionKind, InteractionSpec};

    use super::*;

    /// A one-type table: "banana" repelling itself with a piecewise box.
    pub(crate) fn banana() -> ItemType {
        ItemType {
            name: "banana".into(),
            scent: vec![1.0, 0.0, 0.0],
            color: vec![1.0, 1.0, 0.0],
            required_item_counts: vec![0],
            required_item_costs: vec![0],
            blocks_movement: false,
            visual_occlusion: 0.0,
            intensity: IntensitySpec {
                kind: IntensityKind::Constant,
                args: vec![-2.0],
            },
            interactions: vec![InteractionSpec {
                kind: InteractionKind::PiecewiseBox,
                args: vec![40.0, 200.0, 0.0, -40.0],
            }],
        }
    }

    #[test]
    fn accepts_valid_table() {
        let table = ItemTable::new(vec![banana()], 3, 3).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.interaction_reach(), 15);
        assert!(!table.blocks_movement(0));
    }

    #[test]
    fn rejects_empty_table() {
        assert!(matches!(
            ItemTable::new(Vec::new(), 3, 3),
            Err(WorldError::EmptyItemTable)
        ));
    }

    #[test]
    fn rejects_scent_dimension_mismatch() {
        let err = ItemTable::new(vec![banana()], 2, 3).unwrap_err();
        assert!(matches!(err, WorldError::ScentDimension { expected: 2, actual: 3, .. }));
    }

    #[test]
    fn rejects_incomplete_interaction_matrix() {
        let mut onion = banana();
        onion.name = "onion".into();
        let mut b = banana();
        b.required_item_counts = vec![0, 0];
        b.required_item_costs = vec![0, 0];
        onion.required_item_counts = vec![0, 0];
        onion.required_item_costs = vec![0, 0];
        let err = ItemTable::new(vec![b, onion], 3, 3).unwrap_err();
        assert!(matches!(
            err,
            WorldError::NotPerType {
                field: "interactions",
                expected: 2,
                actual: 1,
                ..
            }
        ));
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut a = banana();
        a.required_item_counts = vec![0, 0];
        a.required_item_costs = vec![0, 0];
        a.interactions.push(InteractionSpec::default());
        let err = ItemTable::new(vec![a.clone(), a], 3, 3).unwrap_err();
        assert!(matches!(err, WorldError::DuplicateItemName { .. }));
    }

    #[test]
    fn pair_energy_sums_both_directions() {
        let table = ItemTable::new(vec![banana()], 3, 3).unwrap();
        let e = table.pair_energy(0, Position::new(0, 0), 0, Position::new(7, 0));
        assert!((e - -80.0).abs() < f32::EPSILON);
    }
}
