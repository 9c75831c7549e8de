//! Gibbs sampler that materializes a patch.
//!
//! Every cell of the patch holds at most one item. One iteration picks a
//! cell uniformly at random, clears it, and redraws its content from the
//! conditional distribution over {empty, type 0, ..., type N-1}. The log
//! weight of type `t` is its intensity at the cell plus the symmetrized
//! interaction energy with every item within interaction reach, drawn from
//! this patch and from already fixed neighbors. Empty has log weight zero.
//!
//! All randomness comes from the caller's stream, so the output depends
//! only on the stream state and the neighbor context.

use patchwork_types::{Item, Position};
use rand::Rng;

use crate::item_table::ItemTable;

/// Samples patches for one item table and patch size.
#[derive(Debug, Clone, Copy)]
pub struct GibbsSampler<'a> {
    table: &'a ItemTable,
    patch_size: u32,
}

impl<'a> GibbsSampler<'a> {
    /// Build a sampler for square patches of `patch_size` cells.
    pub const fn new(table: &'a ItemTable, patch_size: u32) -> Self {
        Self { table, patch_size }
    }

    /// Sample the patch whose bottom-left cell is `origin`.
    ///
    /// `context` holds items of neighboring fixed patches. The returned
    /// items are ordered by cell (row-major, increasing `y` then `x`).
    #[allow(clippy::arithmetic_side_effects)]
    pub fn sample<R: Rng + ?Sized>(
        &self,
        origin: Position,
        context: &[Item],
        iterations: u32,
        rng: &mut R,
    ) -> Vec<Item> {
        let n = self.patch_size.max(1) as usize;
        let cell_count = n * n;
        let reach = self.table.interaction_reach();
        let mut cells: Vec<Option<usize>> = vec![None; cell_count];
        let mut log_weights = vec![0.0_f64; self.table.len()];

        for _ in 0..iterations {
            let index = rng.random_range(0..cell_count);
            let pos = cell_position(origin, n, index);
            if let Some(slot) = cells.get_mut(index) {
                *slot = None;
            }

            for (t, weight) in log_weights.iter_mut().enumerate() {
                let mut energy = self.table.intensity(t, pos);
                for other in context {
                    if (pos - other.position).chebyshev_length() <= reach {
                        energy += self.table.pair_energy(t, pos, other.item_type, other.position);
                    }
                }
                for j in window(index, n, reach) {
                    let Some(&Some(u)) = cells.get(j) else { continue };
                    let other = cell_position(origin, n, j);
                    energy += self.table.pair_energy(t, pos, u, other);
                }
                *weight = f64::from(energy);
            }

            let choice = draw(&log_weights, rng);
            if let Some(slot) = cells.get_mut(index) {
                *slot = choice;
            }
        }

        cells
            .iter()
            .enumerate()
            .filter_map(|(index, occupant)| {
                occupant.map(|t| Item::generated(t, cell_position(origin, n, index)))
            })
            .collect()
    }
}

/// Cell `index` (row-major) of the patch at `origin`.
#[allow(clippy::arithmetic_side_effects, clippy::cast_possible_wrap)]
fn cell_position(origin: Position, n: usize, index: usize) -> Position {
    let x = (index % n) as i64;
    let y = (index / n) as i64;
    origin + Position::new(x, y)
}

/// Row-major indices of cells within Chebyshev distance `reach` of cell
/// `index`, clipped to the patch.
#[allow(clippy::arithmetic_side_effects, clippy::cast_possible_truncation)]
fn window(index: usize, n: usize, reach: u64) -> impl Iterator<Item = usize> {
    let r = usize::try_from(reach).unwrap_or(usize::MAX).min(n);
    let (cx, cy) = (index % n, index / n);
    let (x0, x1) = (cx.saturating_sub(r), cx.saturating_add(r).min(n - 1));
    let (y0, y1) = (cy.saturating_sub(r), cy.saturating_add(r).min(n - 1));
    (y0..=y1).flat_map(move |y| (x0..=x1).map(move |x| y * n + x))
}

/// Draw from the softmax of `log_weights` with an implicit zero-weight
/// "empty" option. Returns the chosen type, or `None` for empty.
fn draw<R: Rng + ?Sized>(log_weights: &[f64], rng: &mut R) -> Option<usize> {
    let max = log_weights.iter().copied().fold(0.0_f64, f64::max);
    let empty = (-max).exp();
    let total: f64 = empty + log_weights.iter().map(|w| (w - max).exp()).sum::<f64>();
    let mut r = rng.random::<f64>() * total;
    if r < empty {
        return None;
    }
    r -= empty;
    for (t, w) in log_weights.iter().enumerate() {
        let p = (w - max).exp();
        if r < p {
            return Some(t);
        }
        r -= p;
    }
    // Rounding left a sliver past the last bucket.
    log_weights.len().checked_sub(1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::item_table::tests::banana;

    #[test]
    fn same_stream_gives_same_patch() {
        let table = ItemTable::new(vec![banana()], 3, 3).unwrap();
        let sampler = GibbsSampler::new(&table, 8);
        let a = sampler.sample(Position::ORIGIN, &[], 400, &mut ChaCha8Rng::seed_from_u64(9));
        let b = sampler.sample(Position::ORIGIN, &[], 400, &mut ChaCha8Rng::seed_from_u64(9));
        assert_eq!(a, b);
        assert!(a.iter().all(|i| i.position.patch_coordinate(8) == Position::ORIGIN));
    }

    #[test]
    fn mid_range_repulsion_clusters_items() {
        let mut dense = banana();
        dense.intensity.args = vec![1.0];
        let table = ItemTable::new(vec![dense], 3, 3).unwrap();
        let sampler = GibbsSampler::new(&table, 8);
        let items = sampler.sample(Position::ORIGIN, &[], 2_000, &mut ChaCha8Rng::seed_from_u64(3));
        assert!(!items.is_empty());
        // A pair at squared distance in [40, 200) costs 80 energy units, and
        // no pair in an 8x8 patch is farther apart than that, so survivors
        // sit in one tight cluster.
        for (i, a) in items.iter().enumerate() {
            for b in items.iter().skip(i + 1) {
                assert!((a.position - b.position).squared_length() < 40);
            }
        }
    }

    #[test]
    fn window_is_clipped_to_patch() {
        let cells: Vec<usize> = window(0, 4, 1).collect();
        assert_eq!(cells, vec![0, 1, 4, 5]);
        assert_eq!(window(5, 4, 10).count(), 16);
    }

    #[test]
    fn draw_prefers_large_weights() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let picks = (0..100).filter(|_| draw(&[50.0], &mut rng) == Some(0)).count();
        assert_eq!(picks, 100);
        let empties = (0..100).filter(|_| draw(&[-50.0], &mut rng).is_none()).count();
        assert_eq!(empties, 100);
    }
}
