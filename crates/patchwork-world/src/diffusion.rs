//! Discrete scent diffusion kernel.
//!
//! Scent is modeled as a unit source that emits once per step at its cell
//! while the whole field decays by `lambda` and spreads to the four
//! neighbors at rate `alpha`. The response of that process is precomputed
//! for every step up to the tombstone lifetime, so the scent an item
//! contributes to any nearby cell at any time is a table lookup.
//!
//! The kernel is stored as one triangle per step. It is symmetric under
//! reflection in both axes and the diagonal, so only cells with
//! `0 <= y <= x < radius` are kept, at index `x * (x + 1) / 2 + y`.

use patchwork_types::{Item, Position};

use crate::error::WorldError;

/// Precomputed diffusion response.
#[derive(Debug, Clone)]
pub struct ScentModel {
    radius: u32,
    lifetime: u32,
    /// `kernel[t]` is the response after `t` steps of emission.
    kernel: Vec<Vec<f32>>,
}

/// Index of `(x, y)` with `0 <= y <= x` in a triangle.
#[allow(clippy::arithmetic_side_effects)]
const fn triangle_index(x: u32, y: u32) -> usize {
    ((x as usize) * (x as usize + 1)) / 2 + y as usize
}

impl ScentModel {
    /// Build the kernel.
    ///
    /// `radius` is `patch_size / 2 + 1`; cells at Chebyshev distance
    /// `>= radius` from a source receive nothing. Fails when the process
    /// would diverge or when `lifetime` is zero.
    #[allow(clippy::arithmetic_side_effects)]
    pub fn new(decay: f32, diffusion: f32, patch_size: u32, lifetime: u32) -> Result<Self, WorldError> {
        let sum = decay.abs() + 4.0 * diffusion.abs();
        if !sum.is_finite() || sum >= 1.0 {
            return Err(WorldError::DivergentScent { sum });
        }
        if lifetime == 0 {
            return Err(WorldError::ZeroLifetime);
        }
        if patch_size == 0 {
            return Err(WorldError::ZeroPatchSize);
        }
        let radius = (patch_size / 2 + 1).max(1);
        let entries = triangle_index(radius, 0);

        let mut kernel: Vec<Vec<f32>> = Vec::with_capacity(lifetime as usize);
        let mut first = vec![0.0_f32; entries];
        if let Some(origin) = first.first_mut() {
            *origin = 1.0;
        }
        kernel.push(first);

        for _ in 1..lifetime {
            let Some(prev) = kernel.last() else { break };
            let mut next = Vec::with_capacity(entries);
            for x in 0..radius {
                for y in 0..=x {
                    let (xi, yi) = (i64::from(x), i64::from(y));
                    let neighbors = lookup(prev, radius, xi + 1, yi)
                        + lookup(prev, radius, xi - 1, yi)
                        + lookup(prev, radius, xi, yi + 1)
                        + lookup(prev, radius, xi, yi - 1);
                    let own = lookup(prev, radius, xi, yi);
                    let source = if x == 0 && y == 0 { 1.0 } else { 0.0 };
                    next.push(diffusion.mul_add(neighbors, decay.mul_add(own, source)));
                }
            }
            kernel.push(next);
        }

        Ok(Self {
            radius,
            lifetime,
            kernel,
        })
    }

    /// Cells at Chebyshev distance `>= radius` receive no scent.
    pub const fn radius(&self) -> u32 {
        self.radius
    }

    /// Number of precomputed steps; tombstones are purged after this long.
    pub const fn lifetime(&self) -> u32 {
        self.lifetime
    }

    /// Response at offset `(dx, dy)` after `t` steps, zero outside the table.
    pub fn value(&self, t: u64, dx: i64, dy: i64) -> f32 {
        usize::try_from(t)
            .ok()
            .and_then(|t| self.kernel.get(t))
            .map_or(0.0, |grid| lookup(grid, self.radius, dx, dy))
    }

    /// Steady-state response for items that have always existed.
    pub fn steady_value(&self, dx: i64, dy: i64) -> f32 {
        self.value(u64::from(self.lifetime.saturating_sub(1)), dx, dy)
    }

    /// Multiplier applied to `item`'s scent vector at `cell` and time `now`.
    ///
    /// Items created at time zero count as fully diffused. A collected item
    /// subtracts the response of an emitter that started at its deletion
    /// time, so its scent fades out the same way it built up.
    pub fn weight(&self, item: &Item, cell: Position, now: u64) -> f32 {
        let d = cell - item.position;
        let cap = u64::from(self.lifetime.saturating_sub(1));
        let age = if item.created_at == 0 {
            cap
        } else {
            now.saturating_sub(item.created_at).min(cap)
        };
        let mut w = self.value(age, d.x, d.y);
        if let Some(deleted) = item.deleted_at {
            w -= self.value(now.saturating_sub(deleted), d.x, d.y);
        }
        w
    }
}

/// Read a triangle at any signed offset, folding by symmetry.
fn lookup(grid: &[f32], radius: u32, x: i64, y: i64) -> f32 {
    let (mut x, mut y) = (x.unsigned_abs(), y.unsigned_abs());
    if y > x {
        core::mem::swap(&mut x, &mut y);
    }
    if x >= u64::from(radius) {
        return 0.0;
    }
    // x < radius fits in u32 here.
    let (Ok(x), Ok(y)) = (u32::try_from(x), u32::try_from(y)) else {
        return 0.0;
    };
    grid.get(triangle_index(x, y)).copied().unwrap_or(0.0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn rejects_divergent_parameters() {
        assert!(matches!(
            ScentModel::new(0.5, 0.2, 32, 100),
            Err(WorldError::DivergentScent { .. })
        ));
        assert!(matches!(ScentModel::new(0.4, 0.1, 32, 0), Err(WorldError::ZeroLifetime)));
    }

    #[test]
    fn first_step_is_a_unit_impulse() {
        let m = ScentModel::new(0.4, 0.14, 8, 10).unwrap();
        assert_eq!(m.radius(), 5);
        assert_eq!(m.value(0, 0, 0), 1.0);
        assert_eq!(m.value(0, 1, 0), 0.0);
    }

    #[test]
    fn second_step_decays_and_spreads() {
        let m = ScentModel::new(0.4, 0.14, 8, 10).unwrap();
        assert!((m.value(1, 0, 0) - 1.4).abs() < 1e-6);
        assert!((m.value(1, 1, 0) - 0.14).abs() < 1e-6);
        assert!((m.value(1, 0, -1) - 0.14).abs() < 1e-6);
        assert_eq!(m.value(1, 1, 1), 0.0);
    }

    #[test]
    fn kernel_is_symmetric_and_bounded_by_radius() {
        let m = ScentModel::new(0.4, 0.14, 8, 50).unwrap();
        assert_eq!(m.value(20, 2, 3), m.value(20, -3, 2));
        assert_eq!(m.value(20, 2, 3), m.value(20, 3, -2));
        assert_eq!(m.value(20, 5, 0), 0.0);
        assert!(m.value(20, 4, 4) > 0.0);
    }

    #[test]
    fn collected_item_fades_out() {
        let m = ScentModel::new(0.4, 0.14, 8, 30).unwrap();
        let mut item = Item::generated(0, Position::ORIGIN);
        let before = m.weight(&item, Position::ORIGIN, 10);
        item.deleted_at = Some(10);
        let at_deletion = m.weight(&item, Position::ORIGIN, 10);
        let later = m.weight(&item, Position::ORIGIN, 25);
        assert!(at_deletion < before);
        assert!(later < at_deletion);
        assert!(later >= 0.0);
    }
}
