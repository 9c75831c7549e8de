//! Typed energy functions used by the patch sampler.
//!
//! Configuration carries functions as `{ fn, args }` pairs. [`IntensityFunction`]
//! and [`InteractionFunction`] are the compiled forms: the argument count is
//! checked once, and evaluation is a plain `match` with no slice indexing.

use patchwork_types::{IntensityKind, IntensitySpec, InteractionKind, InteractionSpec, Position};

use crate::error::WorldError;

/// The murmur3 32-bit finalizer.
pub const fn mix32(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x045d_9f3b);
    x ^= x >> 16;
    x = x.wrapping_mul(0x045d_9f3b);
    x ^= x >> 16;
    x
}

/// Hash `x` into `[0, 1]`, constant over runs of `scale` consecutive inputs.
#[allow(clippy::cast_precision_loss)]
fn hash_unit(x: u32, shift: u32, scale: u32) -> f32 {
    let bucket = x.wrapping_add(shift) / scale.max(1);
    mix32(bucket) as f32 / u32::MAX as f32
}

/// Linear interpolation between the hash of `s`'s bucket and the next bucket.
#[allow(clippy::cast_precision_loss)]
fn smooth_hash(s: u32, shift: u32, scale: u32) -> f32 {
    let scale = scale.max(1);
    let x = hash_unit(s, shift, scale);
    let x_next = hash_unit(s.wrapping_add(scale), shift, scale);
    let t = (s % scale) as f32 / scale as f32;
    x.mul_add(1.0 - t, x_next * t)
}

/// A compiled per-cell bias for one item type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IntensityFunction {
    /// No bias.
    Zero,
    /// The same bias everywhere.
    Constant {
        /// Bias value.
        value: f32,
    },
    /// Bias that varies in rings around the origin.
    RadialHash {
        /// Offset added to the radius before hashing.
        shift: u32,
        /// Ring width in cells.
        scale: u32,
        /// Baseline bias.
        bias: f32,
        /// How far the hashed term pulls the bias down.
        amplitude: f32,
    },
}

/// A compiled pairwise energy between two item types.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InteractionFunction {
    /// No interaction.
    Zero,
    /// `c1` inside squared distance `l1`, `c2` inside `l2`, else zero.
    PiecewiseBox {
        /// Inner squared-distance cutoff.
        l1: f32,
        /// Outer squared-distance cutoff.
        l2: f32,
        /// Value inside the inner cutoff.
        c1: f32,
        /// Value inside the outer cutoff.
        c2: f32,
    },
    /// Distinguishes axis-aligned from diagonal displacements inside two
    /// Chebyshev radii.
    Cross {
        /// Inner Chebyshev radius.
        d1: f32,
        /// Outer Chebyshev radius.
        d2: f32,
        /// Axis-aligned value inside `d1`.
        a1: f32,
        /// Axis-aligned value inside `d2`.
        a2: f32,
        /// Diagonal value inside `d1`.
        b1: f32,
        /// Diagonal value inside `d2`.
        b2: f32,
    },
    /// Like [`InteractionFunction::Cross`] with an inner radius that drifts
    /// along the x axis.
    CrossHash {
        /// Width of each hashed x bucket.
        scale: u32,
        /// Minimum inner radius.
        base: f32,
        /// Maximum hashed addition to the inner radius.
        amplitude: f32,
        /// Distance between inner and outer radius.
        width: f32,
        /// Axis-aligned value inside the inner radius.
        a1: f32,
        /// Axis-aligned value inside the outer radius.
        a2: f32,
        /// Diagonal value inside the inner radius.
        b1: f32,
        /// Diagonal value inside the outer radius.
        b2: f32,
    },
}

/// Fixed-size view of an argument list, or an arity error.
fn take_args<const N: usize>(
    item: &str,
    function: &'static str,
    args: &[f32],
) -> Result<[f32; N], WorldError> {
    <[f32; N]>::try_from(args).map_err(|_mismatch| WorldError::FunctionArity {
        item: item.to_owned(),
        function,
        expected: N,
        actual: args.len(),
    })
}

/// Interpret a float argument as a positive integer scale.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn positive_scale(item: &str, function: &'static str, value: f32) -> Result<u32, WorldError> {
    if !value.is_finite() || value < 1.0 {
        return Err(WorldError::FunctionArgument {
            item: item.to_owned(),
            function,
            reason: "scale must be at least 1",
        });
    }
    Ok(value as u32)
}

impl IntensityFunction {
    /// Compile a configured intensity function for item type `item`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn compile(item: &str, spec: &IntensitySpec) -> Result<Self, WorldError> {
        match spec.kind {
            IntensityKind::Zero => {
                take_args::<0>(item, "zero", &spec.args)?;
                Ok(Self::Zero)
            }
            IntensityKind::Constant => {
                let [value] = take_args::<1>(item, "constant", &spec.args)?;
                Ok(Self::Constant { value })
            }
            IntensityKind::RadialHash => {
                let [shift, scale, bias, amplitude] =
                    take_args::<4>(item, "radial_hash", &spec.args)?;
                Ok(Self::RadialHash {
                    shift: shift.max(0.0) as u32,
                    scale: positive_scale(item, "radial_hash", scale)?,
                    bias,
                    amplitude,
                })
            }
        }
    }

    /// Evaluate the bias at `pos`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn evaluate(&self, pos: Position) -> f32 {
        match *self {
            Self::Zero => 0.0,
            Self::Constant { value } => value,
            Self::RadialHash {
                shift,
                scale,
                bias,
                amplitude,
            } => {
                let radius = (pos.squared_length() as f64).sqrt() as u32;
                let s = radius.wrapping_add(shift);
                amplitude.mul_add(-smooth_hash(s, shift, scale), bias)
            }
        }
    }
}

impl InteractionFunction {
    /// Compile a configured interaction function for item type `item`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn compile(item: &str, spec: &InteractionSpec) -> Result<Self, WorldError> {
        match spec.kind {
            InteractionKind::Zero => {
                take_args::<0>(item, "zero", &spec.args)?;
                Ok(Self::Zero)
            }
            InteractionKind::PiecewiseBox => {
                let [l1, l2, c1, c2] = take_args::<4>(item, "piecewise_box", &spec.args)?;
                Ok(Self::PiecewiseBox { l1, l2, c1, c2 })
            }
            InteractionKind::Cross => {
                let [d1, d2, a1, a2, b1, b2] = take_args::<6>(item, "cross", &spec.args)?;
                Ok(Self::Cross {
                    d1,
                    d2,
                    a1,
                    a2,
                    b1,
                    b2,
                })
            }
            InteractionKind::CrossHash => {
                let [scale, base, amplitude, width, a1, a2, b1, b2] =
                    take_args::<8>(item, "cross_hash", &spec.args)?;
                Ok(Self::CrossHash {
                    scale: positive_scale(item, "cross_hash", scale)?,
                    base,
                    amplitude,
                    width,
                    a1,
                    a2,
                    b1,
                    b2,
                })
            }
        }
    }

    /// Energy contributed by an item at `other` to a candidate at `pos`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn evaluate(&self, pos: Position, other: Position) -> f32 {
        let diff = pos - other;
        match *self {
            Self::Zero => 0.0,
            Self::PiecewiseBox { l1, l2, c1, c2 } => {
                let squared = diff.squared_length() as f32;
                if squared < l1 {
                    c1
                } else if squared < l2 {
                    c2
                } else {
                    0.0
                }
            }
            Self::Cross {
                d1,
                d2,
                a1,
                a2,
                b1,
                b2,
            } => cross_value(diff, d1, d2, [a1, a2, b1, b2]),
            Self::CrossHash {
                scale,
                base,
                amplitude,
                width,
                a1,
                a2,
                b1,
                b2,
            } => {
                let inner = amplitude.mul_add(smooth_hash(pos.x as u32, 0, scale), base);
                cross_value(diff, inner, inner + width, [a1, a2, b1, b2])
            }
        }
    }

    /// Largest Chebyshev distance at which this function can be non-zero.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn reach(&self) -> u64 {
        let cells = match *self {
            Self::Zero => 0.0,
            Self::PiecewiseBox { l1, l2, .. } => l1.max(l2).max(0.0).sqrt(),
            Self::Cross { d1, d2, .. } => d1.max(d2),
            Self::CrossHash {
                base,
                amplitude,
                width,
                ..
            } => base + amplitude.abs() + width.abs(),
        };
        if cells.is_finite() {
            cells.max(0.0).ceil() as u64
        } else {
            u64::MAX
        }
    }
}

/// Shared body of the cross family. `values` is `[a1, a2, b1, b2]`.
#[allow(clippy::cast_precision_loss)]
fn cross_value(diff: Position, inner: f32, outer: f32, values: [f32; 4]) -> f32 {
    let [a1, a2, b1, b2] = values;
    let dist = diff.chebyshev_length() as f32;
    let axis = diff.is_axis_aligned();
    if dist <= inner {
        if axis { a1 } else { b1 }
    } else if dist <= outer {
        if axis { a2 } else { b2 }
    } else {
        0.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn interaction(kind: InteractionKind, args: &[f32]) -> InteractionFunction {
        InteractionFunction::compile(
            "test",
            &InteractionSpec {
                kind,
                args: args.to_vec(),
            },
        )
        .unwrap()
    }

    #[test]
    fn piecewise_box_uses_squared_distance() {
        let f = interaction(InteractionKind::PiecewiseBox, &[40.0, 200.0, 0.0, -40.0]);
        let o = Position::ORIGIN;
        assert_eq!(f.evaluate(Position::new(6, 0), o), 0.0); // 36 < 40
        assert_eq!(f.evaluate(Position::new(6, 2), o), -40.0); // 40 is not < 40
        assert_eq!(f.evaluate(Position::new(10, 9), o), -40.0); // 181
        assert_eq!(f.evaluate(Position::new(10, 10), o), 0.0); // 200
        assert_eq!(f.reach(), 15);
    }

    #[test]
    fn cross_distinguishes_axis_from_diagonal() {
        let f = interaction(InteractionKind::Cross, &[1.0, 3.0, 10.0, 5.0, -10.0, -5.0]);
        let o = Position::ORIGIN;
        assert_eq!(f.evaluate(Position::new(1, 0), o), 10.0);
        assert_eq!(f.evaluate(Position::new(1, 1), o), -10.0);
        assert_eq!(f.evaluate(Position::new(0, -3), o), 5.0);
        assert_eq!(f.evaluate(Position::new(2, 3), o), -5.0);
        assert_eq!(f.evaluate(Position::new(4, 0), o), 0.0);
    }

    #[test]
    fn arity_is_checked() {
        let err = InteractionFunction::compile(
            "banana",
            &InteractionSpec {
                kind: InteractionKind::Cross,
                args: vec![1.0, 2.0],
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            WorldError::FunctionArity {
                expected: 6,
                actual: 2,
                ..
            }
        ));

        let err = IntensityFunction::compile(
            "banana",
            &IntensitySpec {
                kind: IntensityKind::Zero,
                args: vec![1.0],
            },
        )
        .unwrap_err();
        assert!(matches!(err, WorldError::FunctionArity { expected: 0, .. }));
    }

    #[test]
    fn radial_hash_is_bounded_by_bias_and_amplitude() {
        let f = IntensityFunction::compile(
            "rings",
            &IntensitySpec {
                kind: IntensityKind::RadialHash,
                args: vec![3.0, 4.0, -2.0, 6.0],
            },
        )
        .unwrap();
        for x in -20..20 {
            let v = f.evaluate(Position::new(x, 7));
            assert!((-8.001..=-1.999).contains(&v), "value {v} out of range");
        }
    }

    #[test]
    fn radial_hash_rejects_zero_scale() {
        let err = IntensityFunction::compile(
            "rings",
            &IntensitySpec {
                kind: IntensityKind::RadialHash,
                args: vec![0.0, 0.0, 1.0, 1.0],
            },
        )
        .unwrap_err();
        assert!(matches!(err, WorldError::FunctionArgument { .. }));
    }

    #[test]
    fn mix32_matches_reference_values() {
        assert_eq!(mix32(0), 0);
        assert_ne!(mix32(1), mix32(2));
    }
}
