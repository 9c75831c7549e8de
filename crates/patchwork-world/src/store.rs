//! The world store: every materialized patch, keyed by patch coordinate.
//!
//! Patches are generated lazily and exactly once. A patch only enters the
//! store after it has been sampled, so membership in the map is the same
//! thing as being fixed. Generation consumes the single seeded stream owned
//! by the store, which makes the world a pure function of the seed and the
//! order in which regions are first touched.
//!
//! Scent is maintained incrementally. Each patch whose eight neighbors are
//! all present can cache the steady-state scent of the static items around
//! it (items that have always existed and were never collected). Collecting
//! an item drops the affected caches so they are rebuilt from the remaining
//! static items; the fading remainder of collected items is added per query
//! from the diffusion kernel. A cache holds exactly the sum `scent_at` would
//! compute without it, so results never depend on which caches are warm.

use std::collections::BTreeMap;

use patchwork_types::{Direction, Item, PatchState, Position};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::diffusion::ScentModel;
use crate::error::WorldError;
use crate::gibbs::GibbsSampler;
use crate::item_table::ItemTable;
use crate::patch::Patch;

/// Positions and headings of every agent, used for rendering.
pub type AgentIndex = BTreeMap<Position, Direction>;

/// Parameters the store needs from the simulator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldSettings {
    /// Side length of a patch in cells.
    pub patch_size: u32,
    /// Gibbs iterations spent on each new patch.
    pub mcmc_iterations: u32,
    /// Per-step scent decay (lambda).
    pub decay: f32,
    /// Per-step scent diffusion rate (alpha).
    pub diffusion: f32,
    /// Steps a collected item lingers before it is purged.
    pub deleted_item_lifetime: u32,
    /// Seed of the world's random stream.
    pub seed: u64,
}

/// Serializable form of the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldSnapshot {
    /// Every fixed patch with its items, tombstones included.
    pub patches: Vec<(Position, Vec<Item>)>,
    /// Position of the random stream, in 32-bit words.
    pub rng_word_pos: u128,
}

/// Owner of all generated patches and of the world's random stream.
#[derive(Debug, Clone)]
pub struct WorldStore {
    table: ItemTable,
    settings: WorldSettings,
    scent: ScentModel,
    patches: BTreeMap<Position, Patch>,
    rng: ChaCha8Rng,
}

/// The eight neighbors of a patch coordinate plus itself.
fn ring(coord: Position) -> impl Iterator<Item = Position> {
    (-1..=1_i64).flat_map(move |dy| (-1..=1_i64).map(move |dx| coord + Position::new(dx, dy)))
}

const fn is_static(item: &Item) -> bool {
    item.created_at == 0 && item.deleted_at.is_none()
}

impl WorldStore {
    /// Create an empty world.
    pub fn new(table: ItemTable, settings: WorldSettings) -> Result<Self, WorldError> {
        if settings.patch_size == 0 {
            return Err(WorldError::ZeroPatchSize);
        }
        let scent = ScentModel::new(
            settings.decay,
            settings.diffusion,
            settings.patch_size,
            settings.deleted_item_lifetime,
        )?;
        Ok(Self {
            table,
            settings,
            scent,
            patches: BTreeMap::new(),
            rng: ChaCha8Rng::seed_from_u64(settings.seed),
        })
    }

    /// Rebuild a world from a snapshot taken with [`WorldStore::snapshot`].
    pub fn restore(
        table: ItemTable,
        settings: WorldSettings,
        snapshot: WorldSnapshot,
    ) -> Result<Self, WorldError> {
        let mut store = Self::new(table, settings)?;
        for (coord, items) in snapshot.patches {
            if let Some(bad) = items.iter().find(|i| i.item_type >= store.table.len()) {
                return Err(WorldError::UnknownItemType(bad.item_type));
            }
            store.patches.insert(coord, Patch::fixed(items));
        }
        store.rng.set_word_pos(snapshot.rng_word_pos);
        Ok(store)
    }

    /// Capture every patch and the random stream position.
    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            patches: self
                .patches
                .iter()
                .map(|(coord, patch)| (*coord, patch.items.clone()))
                .collect(),
            rng_word_pos: self.rng.get_word_pos(),
        }
    }

    /// The item catalog.
    pub const fn table(&self) -> &ItemTable {
        &self.table
    }

    /// The settings this world was built with.
    pub const fn settings(&self) -> &WorldSettings {
        &self.settings
    }

    /// The diffusion kernel.
    pub const fn scent_model(&self) -> &ScentModel {
        &self.scent
    }

    /// The world's random stream. Collision tie-breaking draws from it too.
    pub const fn rng_mut(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Number of fixed patches.
    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    /// The patch at `coord`, if it has been generated.
    pub fn patch(&self, coord: Position) -> Option<&Patch> {
        self.patches.get(&coord)
    }

    /// Whether the patch at `coord` has been generated and frozen.
    pub fn is_fixed(&self, coord: Position) -> bool {
        self.patches.get(&coord).is_some_and(|p| p.fixed)
    }

    /// Return the patch at `coord`, sampling it first if needed.
    pub fn get_or_generate(&mut self, coord: Position) -> &Patch {
        let iterations = self.settings.mcmc_iterations;
        self.generate_with(coord, iterations);
        self.patches.entry(coord).or_default()
    }

    /// Sample the patch at `coord` with `iterations` Gibbs steps unless it
    /// is already fixed.
    fn generate_with(&mut self, coord: Position, iterations: u32) {
        if self.is_fixed(coord) {
            return;
        }
        let context: Vec<Item> = ring(coord)
            .filter(|c| *c != coord)
            .filter_map(|c| self.patches.get(&c))
            .flat_map(Patch::live_items)
            .cloned()
            .collect();
        let origin = coord.patch_origin(self.settings.patch_size);
        let sampler = GibbsSampler::new(&self.table, self.settings.patch_size);
        let items = sampler.sample(origin, &context, iterations, &mut self.rng);
        debug!(
            patch_x = coord.x,
            patch_y = coord.y,
            items = items.len(),
            iterations,
            "Patch generated"
        );
        self.patches.insert(coord, Patch::fixed(items));
    }

    /// Fix every patch intersecting the cell box `[min, max]`, in row-major
    /// order of patch coordinates.
    pub fn ensure_fixed_box(&mut self, min: Position, max: Position, iterations: u32) {
        let n = self.settings.patch_size;
        let lo = min.patch_coordinate(n);
        let hi = max.patch_coordinate(n);
        for y in lo.y..=hi.y {
            for x in lo.x..=hi.x {
                self.generate_with(Position::new(x, y), iterations);
            }
        }
    }

    /// Fix every patch within `reach` cells of `center` using the configured
    /// iteration count scaled by `boost`.
    pub fn ensure_fixed_around(&mut self, center: Position, reach: u32, boost: u32) {
        let r = i64::from(reach);
        let iterations = self.settings.mcmc_iterations.saturating_mul(boost.max(1));
        self.ensure_fixed_box(
            center - Position::new(r, r),
            center + Position::new(r, r),
            iterations,
        );
    }

    /// Whether every patch intersecting `[min, max]` is already fixed.
    pub fn is_box_fixed(&self, min: Position, max: Position) -> bool {
        let n = self.settings.patch_size;
        let lo = min.patch_coordinate(n);
        let hi = max.patch_coordinate(n);
        (lo.y..=hi.y).all(|y| (lo.x..=hi.x).all(|x| self.is_fixed(Position::new(x, y))))
    }

    /// The live item at `pos`, if its patch exists and holds one.
    pub fn live_item_at(&self, pos: Position) -> Option<&Item> {
        self.patches
            .get(&pos.patch_coordinate(self.settings.patch_size))
            .and_then(|patch| patch.live_item_at(pos))
    }

    /// Whether a live movement-blocking item occupies `pos`.
    pub fn is_blocked(&self, pos: Position) -> bool {
        self.live_item_at(pos)
            .is_some_and(|item| self.table.blocks_movement(item.item_type))
    }

    /// Mark the live item at `pos` as collected at step `now`.
    ///
    /// Returns the collected item's type. Every cached scent grid the item
    /// reached is dropped.
    pub fn collect_at(&mut self, pos: Position, now: u64) -> Option<usize> {
        let coord = pos.patch_coordinate(self.settings.patch_size);
        let (item_type, was_static) = {
            let patch = self.patches.get_mut(&coord)?;
            let item = patch
                .items
                .iter_mut()
                .find(|item| item.position == pos && item.is_live())?;
            let was_static = is_static(item);
            item.deleted_at = Some(now);
            (item.item_type, was_static)
        };
        if was_static {
            for c in ring(coord) {
                if let Some(patch) = self.patches.get_mut(&c) {
                    patch.scent_cache = None;
                }
            }
        }
        Some(item_type)
    }

    /// Drop tombstones whose scent has fully faded. Returns how many were purged.
    pub fn purge_expired(&mut self, now: u64) -> usize {
        let lifetime = u64::from(self.settings.deleted_item_lifetime);
        let mut purged = 0_usize;
        for patch in self.patches.values_mut() {
            let before = patch.items.len();
            patch.items.retain(|item| {
                item.deleted_at
                    .is_none_or(|deleted| now < deleted.saturating_add(lifetime))
            });
            purged = purged.saturating_add(before.saturating_sub(patch.items.len()));
        }
        purged
    }

    /// Add the steady contribution of `item` to the cached grid of patch
    /// `coord`, if that patch has one.
    #[allow(clippy::arithmetic_side_effects)]
    fn add_to_cache(&mut self, coord: Position, item: &Item) {
        let n = self.settings.patch_size;
        let s = self.table.scent_dimension();
        let Ok(item_type) = self.table.get(item.item_type) else {
            return;
        };
        let scent_vec = item_type.scent.clone();
        let radius = i64::from(self.scent.radius());
        let origin = coord.patch_origin(n);
        let size = i64::from(n);
        let Some(cache) = self
            .patches
            .get_mut(&coord)
            .and_then(|p| p.scent_cache.as_mut())
        else {
            return;
        };
        let local = item.position - origin;
        for y in (local.y - radius + 1).max(0)..(local.y + radius).min(size) {
            for x in (local.x - radius + 1).max(0)..(local.x + radius).min(size) {
                let w = self.scent.steady_value(x - local.x, y - local.y);
                let Some(base) = cell_offset(x, y, size, s) else { continue };
                for (k, value) in scent_vec.iter().enumerate() {
                    if let Some(slot) = cache.get_mut(base.saturating_add(k)) {
                        *slot += w * value;
                    }
                }
            }
        }
    }

    /// Build the steady-state scent cache of patch `coord` once all of its
    /// neighbors exist. Does nothing if the cache exists or a neighbor is
    /// missing.
    pub fn warm_scent_cache(&mut self, coord: Position) {
        let ready = self
            .patches
            .get(&coord)
            .is_some_and(|p| p.scent_cache.is_none())
            && ring(coord).all(|c| self.patches.contains_key(&c));
        if !ready {
            return;
        }
        let n = usize::try_from(self.settings.patch_size).unwrap_or(0);
        let s = self.table.scent_dimension();
        let len = n.saturating_mul(n).saturating_mul(s);
        if let Some(patch) = self.patches.get_mut(&coord) {
            patch.scent_cache = Some(vec![0.0; len]);
        }
        let statics: Vec<Item> = ring(coord)
            .filter_map(|c| self.patches.get(&c))
            .flat_map(|p| p.items.iter().filter(|i| is_static(i)))
            .cloned()
            .collect();
        for item in &statics {
            self.add_to_cache(coord, item);
        }
    }

    /// Scent vector at `pos` at step `now`.
    ///
    /// Static items are summed first, then every collected or newer item, so
    /// the cached and uncached paths perform the same additions in the same
    /// order.
    pub fn scent_at(&self, pos: Position, now: u64) -> Vec<f32> {
        let n = self.settings.patch_size;
        let s = self.table.scent_dimension();
        let coord = pos.patch_coordinate(n);
        let mut out = vec![0.0_f32; s];

        let cache = self
            .patches
            .get(&coord)
            .and_then(|p| p.scent_cache.as_ref());
        if let Some(cache) = cache {
            let local = pos.offset_in_patch(n);
            if let Some(base) = cell_offset(local.x, local.y, i64::from(n), s) {
                for (k, slot) in out.iter_mut().enumerate() {
                    *slot = cache.get(base.saturating_add(k)).copied().unwrap_or(0.0);
                }
            }
        } else {
            for item in self.items_in_scent_range(pos).filter(|i| is_static(i)) {
                let d = pos - item.position;
                self.accumulate_scent(&mut out, item, self.scent.steady_value(d.x, d.y));
            }
        }

        for item in self.items_in_scent_range(pos).filter(|i| !is_static(i)) {
            self.accumulate_scent(&mut out, item, self.scent.weight(item, pos, now));
        }
        out
    }

    /// Items, tombstones included, close enough to `pos` to contribute scent.
    #[allow(clippy::arithmetic_side_effects)]
    fn items_in_scent_range(&self, pos: Position) -> impl Iterator<Item = &Item> + '_ {
        let radius = u64::from(self.scent.radius());
        ring(pos.patch_coordinate(self.settings.patch_size))
            .filter_map(move |c| self.patches.get(&c))
            .flat_map(|patch| patch.items.iter())
            .filter(move |item| (pos - item.position).chebyshev_length() < radius)
    }

    fn accumulate_scent(&self, out: &mut [f32], item: &Item, w: f32) {
        if let Ok(t) = self.table.get(item.item_type) {
            for (slot, v) in out.iter_mut().zip(&t.scent) {
                *slot += w * v;
            }
        }
    }

    /// Sum of the colors of live items at `pos`.
    pub fn item_color_at(&self, pos: Position) -> Vec<f32> {
        let mut out = vec![0.0_f32; self.table.color_dimension()];
        if let Some(item) = self.live_item_at(pos) {
            if let Ok(t) = self.table.get(item.item_type) {
                for (slot, v) in out.iter_mut().zip(&t.color) {
                    *slot += v;
                }
            }
        }
        out
    }

    /// Render the patch at `coord`, which must already be fixed.
    pub fn patch_state(
        &self,
        coord: Position,
        now: u64,
        agents: &AgentIndex,
        agent_color: &[f32],
        with_scent: bool,
        with_vision: bool,
    ) -> Option<PatchState> {
        let patch = self.patches.get(&coord)?;
        let n = self.settings.patch_size;
        let origin = coord.patch_origin(n);
        let size = i64::from(n);
        let cells = || (0..size).flat_map(move |y| (0..size).map(move |x| origin + Position::new(x, y)));

        let scent = with_scent.then(|| cells().flat_map(|c| self.scent_at(c, now)).collect());
        let vision = with_vision.then(|| {
            cells()
                .flat_map(|c| {
                    let mut color = self.item_color_at(c);
                    if agents.contains_key(&c) {
                        for (slot, v) in color.iter_mut().zip(agent_color) {
                            *slot += v;
                        }
                    }
                    color
                })
                .collect()
        });

        Some(PatchState {
            coordinate: coord,
            fixed: patch.fixed,
            items: patch.live_items().cloned().collect(),
            agents: agents
                .iter()
                .filter(|(p, _)| p.patch_coordinate(n) == coord)
                .map(|(p, d)| (*p, *d))
                .collect(),
            scent,
            vision,
        })
    }

    /// Render every patch intersecting the cell box `[bottom_left, top_right]`,
    /// generating any that are missing. Patches are ordered row-major by
    /// patch coordinate (increasing `y`, then `x`).
    #[allow(clippy::too_many_arguments)]
    pub fn map(
        &mut self,
        bottom_left: Position,
        top_right: Position,
        now: u64,
        agents: &AgentIndex,
        agent_color: &[f32],
        with_scent: bool,
        with_vision: bool,
    ) -> Vec<PatchState> {
        let iterations = self.settings.mcmc_iterations;
        self.ensure_fixed_box(bottom_left, top_right, iterations);
        self.map_fixed(bottom_left, top_right, now, agents, agent_color, with_scent, with_vision)
            .unwrap_or_default()
    }

    /// Like [`WorldStore::map`] but read-only: returns `None` if any patch in
    /// the box has not been generated yet.
    #[allow(clippy::too_many_arguments)]
    pub fn map_fixed(
        &self,
        bottom_left: Position,
        top_right: Position,
        now: u64,
        agents: &AgentIndex,
        agent_color: &[f32],
        with_scent: bool,
        with_vision: bool,
    ) -> Option<Vec<PatchState>> {
        let n = self.settings.patch_size;
        let lo = bottom_left.patch_coordinate(n);
        let hi = top_right.patch_coordinate(n);
        let mut out = Vec::new();
        for y in lo.y..=hi.y {
            for x in lo.x..=hi.x {
                out.push(self.patch_state(
                    Position::new(x, y),
                    now,
                    agents,
                    agent_color,
                    with_scent,
                    with_vision,
                )?);
            }
        }
        Some(out)
    }
}

/// Offset of cell `(x, y)` in a row-major `size x size x dim` grid.
fn cell_offset(x: i64, y: i64, size: i64, dim: usize) -> Option<usize> {
    let cell = usize::try_from(y.checked_mul(size)?.checked_add(x)?).ok()?;
    cell.checked_mul(dim)
}
