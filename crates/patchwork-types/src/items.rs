//! Item type descriptions as they appear in configuration and snapshots.
//!
//! Energy functions are carried here in their raw `{ fn, args }` form. The
//! world crate compiles them into typed evaluators and reports arity
//! mistakes as construction errors.

use serde::{Deserialize, Serialize};

/// Named intensity (per-cell bias) function families.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntensityKind {
    /// Contributes nothing. Takes no arguments.
    #[default]
    Zero,
    /// A location-independent bias. Takes one argument.
    Constant,
    /// Concentric rings of hashed density. Takes four arguments.
    RadialHash,
}

/// Named interaction (pairwise energy) function families.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    /// Contributes nothing. Takes no arguments.
    #[default]
    Zero,
    /// Two nested squared-distance boxes. Takes four arguments.
    PiecewiseBox,
    /// Axis-aligned versus diagonal values inside two Chebyshev radii. Takes six arguments.
    Cross,
    /// [`InteractionKind::Cross`] with a hashed, x-dependent inner radius. Takes eight arguments.
    CrossHash,
}

/// An intensity function reference with its arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntensitySpec {
    /// Function family.
    #[serde(rename = "fn")]
    pub kind: IntensityKind,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<f32>,
}

/// An interaction function reference with its arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionSpec {
    /// Function family.
    #[serde(rename = "fn")]
    pub kind: InteractionKind,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<f32>,
}

/// One kind of item that can appear in the world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemType {
    /// Human-readable unique name.
    pub name: String,
    /// Scent emitted by each instance; length is the scent dimension.
    pub scent: Vec<f32>,
    /// Color seen in vision; length is the color dimension.
    pub color: Vec<f32>,
    /// For each item type `j`, how many units of `j` an agent must hold
    /// before it can collect this item.
    pub required_item_counts: Vec<u32>,
    /// For each item type `j`, how many units of `j` are consumed when this
    /// item is collected.
    pub required_item_costs: Vec<u32>,
    /// Whether agents are prevented from entering a cell holding this item.
    #[serde(default)]
    pub blocks_movement: bool,
    /// Fraction of light blocked by this item, in `[0, 1]`.
    #[serde(default)]
    pub visual_occlusion: f32,
    /// Location bias for sampling this type.
    #[serde(default)]
    pub intensity: IntensitySpec,
    /// Interaction with every item type, indexed by the other type.
    pub interactions: Vec<InteractionSpec>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_item_from_yaml() {
        let yaml = r"
name: banana
scent: [1.0, 0.0, 0.0]
color: [1.0, 1.0, 0.0]
required_item_counts: [0]
required_item_costs: [0]
intensity: { fn: constant, args: [-5.3] }
interactions:
  - { fn: piecewise_box, args: [40.0, 200.0, 0.0, -40.0] }
";
        let item: ItemType = serde_yml::from_str(yaml).unwrap();
        assert_eq!(item.name, "banana");
        assert!(!item.blocks_movement);
        assert_eq!(item.intensity.kind, IntensityKind::Constant);
        assert_eq!(item.interactions.len(), 1);
        assert_eq!(item.interactions[0].kind, InteractionKind::PiecewiseBox);
        assert_eq!(item.interactions[0].args.len(), 4);
    }

    #[test]
    fn zero_functions_need_no_args() {
        let spec: InteractionSpec = serde_yml::from_str("{ fn: zero }").unwrap();
        assert_eq!(spec.kind, InteractionKind::Zero);
        assert!(spec.args.is_empty());
    }
}
