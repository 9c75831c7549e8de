//! Egocentric vision rendering.
//!
//! Every cell is treated as a disc of radius one half seen from the center
//! of the viewer's cell. Occlusion blends a pixel toward full intensity:
//! `c * (1 - o) + o`. Cells partly outside the field of view are occluded
//! by the fraction of their disc that lies outside it, and items with a
//! non-zero `visual_occlusion` shade the cells behind them by the fraction
//! of each cell's disc they cover.

use core::f32::consts::{PI, TAU};

use patchwork_types::{Direction, Position};

use crate::store::{AgentIndex, WorldStore};

/// Radius of the disc each cell presents to the viewer.
const CELL_RADIUS: f32 = 0.5;

/// What an agent can see and how agents appear to it.
#[derive(Debug, Clone, Copy)]
pub struct VisionParams<'a> {
    /// Cells visible in each direction; the window is `2R + 1` wide.
    pub range: u32,
    /// Angular width of the visual field in radians. `2π` or more sees all around.
    pub field_of_view: f32,
    /// Color added for every agent in view, the viewer included.
    pub agent_color: &'a [f32],
}

/// Left and right edges, counter-clockwise from the agent's right, of the
/// angle a cell at agent-frame offset `local` subtends.
#[allow(clippy::cast_precision_loss)]
fn tangent_angles(local: Position) -> (f32, f32) {
    let (x, y) = (local.x as f32, local.y as f32);
    let half = (CELL_RADIUS / x.hypot(y)).asin();
    let center = y.atan2(x);
    (center + half, center - half)
}

/// Length of the intersection of two arcs, each given counter-clockwise as
/// `(left, right)` with `left` reached from `right`.
fn angle_overlap(al: f32, ar: f32, bl: f32, br: f32) -> f32 {
    let wrap = |a: f32| if a < 0.0 { a + TAU } else { a };
    let (al, ar, bl, br) = (wrap(al), wrap(ar), wrap(bl), wrap(br));
    if al < ar {
        angle_overlap(al, 0.0, bl, br) + angle_overlap(TAU, ar, bl, br)
    } else if bl < br {
        angle_overlap(al, ar, bl, 0.0) + angle_overlap(al, ar, TAU, br)
    } else if al > bl {
        if ar > bl {
            0.0
        } else if ar > br {
            bl - ar
        } else {
            bl - br
        }
    } else if br > al {
        0.0
    } else if br > ar {
        al - br
    } else {
        al - ar
    }
}

fn occlude(pixel: &mut [f32], occlusion: f32) {
    for c in pixel {
        *c = (*c).mul_add(1.0 - occlusion, occlusion);
    }
}

fn add(pixel: &mut [f32], color: &[f32]) {
    for (slot, c) in pixel.iter_mut().zip(color) {
        *slot += c;
    }
}

/// Render the `(2R+1) x (2R+1) x V` window of an agent at `position` facing
/// `direction`.
///
/// Rows run from `R` cells behind to `R` cells ahead; columns from `R`
/// cells left to `R` cells right. Each cell holds the color of its item
/// plus `agent_color` if an agent stands there, so the center shows the
/// viewer itself. Occlusion is applied afterwards.
#[allow(clippy::arithmetic_side_effects, clippy::cast_precision_loss)]
pub fn render_vision(
    world: &WorldStore,
    position: Position,
    direction: Direction,
    agents: &AgentIndex,
    params: &VisionParams<'_>,
) -> Vec<f32> {
    let v = world.table().color_dimension();
    let r = i64::from(params.range);
    let cells: Vec<Position> = (-r..=r)
        .flat_map(|forward| (-r..=r).map(move |right| Position::new(right, forward)))
        .collect();
    let mut out = vec![0.0_f32; cells.len() * v];

    let mut occluders: Vec<(Position, f32)> = Vec::new();
    for (local, pixel) in cells.iter().zip(out.chunks_mut(v.max(1))) {
        let cell = position + direction.rotate(*local);
        if let Some(item) = world.live_item_at(cell) {
            if let Ok(item_type) = world.table().get(item.item_type) {
                add(pixel, &item_type.color);
                if item_type.visual_occlusion > 0.0 && *local != Position::ORIGIN {
                    occluders.push((*local, item_type.visual_occlusion));
                }
            }
        }
        if agents.contains_key(&cell) {
            add(pixel, params.agent_color);
        }
    }

    // Arc of the field of view, centered on straight ahead.
    let field = (params.field_of_view < TAU).then(|| {
        (
            (PI + params.field_of_view) / 2.0,
            (PI - params.field_of_view) / 2.0,
        )
    });
    let occluders: Vec<(f32, (f32, f32), f32)> = occluders
        .into_iter()
        .map(|(local, o)| (local.squared_length() as f32, tangent_angles(local), o))
        .collect();

    for (local, pixel) in cells.iter().zip(out.chunks_mut(v.max(1))) {
        if *local == Position::ORIGIN {
            continue;
        }
        let distance = local.squared_length() as f32;
        let (left, right) = tangent_angles(*local);
        let cell_angle = (left - right).abs();

        if let Some((fov_left, fov_right)) = field {
            let overlap = angle_overlap(fov_left, fov_right, left, right);
            let occlusion = 1.0 - (overlap / cell_angle).min(1.0);
            occlude(pixel, occlusion);
            if occlusion >= 1.0 {
                continue;
            }
        }

        for (item_distance, (item_left, item_right), visual_occlusion) in &occluders {
            if item_distance + 1.0 > distance {
                continue;
            }
            let overlap = angle_overlap(*item_left, *item_right, left, right);
            if overlap > 0.0 {
                let occlusion = visual_occlusion * (overlap / cell_angle).min(1.0);
                occlude(pixel, occlusion);
            }
        }
    }
    out
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::float_cmp,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
mod tests {
    use patchwork_types::Item;

    use super::*;
    use crate::item_table::ItemTable;
    use crate::item_table::tests::banana;
    use crate::store::{WorldSettings, WorldSnapshot};

    /// A world with nothing in it but `items`. Type 1 is an opaque wall.
    fn world_with(items: Vec<Item>) -> WorldStore {
        let mut b = banana();
        b.intensity.args = vec![-1000.0];
        b.interactions.push(b.interactions[0].clone());
        b.required_item_counts = vec![0, 0];
        b.required_item_costs = vec![0, 0];
        let mut wall = b.clone();
        wall.name = "wall".into();
        wall.color = vec![0.0, 0.0, 0.0];
        wall.visual_occlusion = 1.0;
        let settings = WorldSettings {
            patch_size: 8,
            mcmc_iterations: 10,
            decay: 0.4,
            diffusion: 0.14,
            deleted_item_lifetime: 10,
            seed: 1,
        };
        let snapshot = WorldSnapshot {
            patches: vec![(Position::ORIGIN, items)],
            rng_word_pos: 0,
        };
        let table = ItemTable::new(vec![b, wall], 3, 3).unwrap();
        let mut world = WorldStore::restore(table, settings, snapshot).unwrap();
        world.ensure_fixed_around(Position::ORIGIN, 8, 1);
        world
    }

    fn pixel(vision: &[f32], range: i64, forward: i64, right: i64) -> &[f32] {
        let width = 2 * range + 1;
        let idx = usize::try_from(((forward + range) * width + right + range) * 3).unwrap();
        &vision[idx..idx + 3]
    }

    fn all_around(agent_color: &[f32], range: u32) -> VisionParams<'_> {
        VisionParams {
            range,
            field_of_view: TAU,
            agent_color,
        }
    }

    #[test]
    fn agents_appear_in_agent_frame() {
        let world = world_with(Vec::new());
        let agents = AgentIndex::from([
            (Position::ORIGIN, Direction::Right),
            (Position::new(2, 0), Direction::Up),
        ]);
        let params = all_around(&[0.0, 0.0, 1.0], 2);
        let vision = render_vision(&world, Position::ORIGIN, Direction::Right, &agents, &params);
        assert_eq!(vision.len(), 5 * 5 * 3);
        // Facing right, the agent two cells to the east is two cells ahead.
        assert_eq!(pixel(&vision, 2, 2, 0), &[0.0, 0.0, 1.0]);
        // The viewer sees itself at the center.
        assert_eq!(pixel(&vision, 2, 0, 0), &[0.0, 0.0, 1.0]);
        assert_eq!(pixel(&vision, 2, 0, 1), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn narrow_field_of_view_hides_cells_behind() {
        let world = world_with(Vec::new());
        let agents = AgentIndex::from([
            (Position::ORIGIN, Direction::Up),
            (Position::new(0, -1), Direction::Up),
            (Position::new(0, 1), Direction::Up),
        ]);
        let params = VisionParams {
            range: 1,
            field_of_view: core::f32::consts::FRAC_PI_2,
            agent_color: &[1.0, 0.0, 0.0],
        };
        let vision = render_vision(&world, Position::ORIGIN, Direction::Up, &agents, &params);
        assert_eq!(pixel(&vision, 1, 1, 0), &[1.0, 0.0, 0.0]);
        // Fully outside the field of view saturates.
        assert_eq!(pixel(&vision, 1, -1, 0), &[1.0, 1.0, 1.0]);
        assert_eq!(pixel(&vision, 1, 0, 1), &[1.0, 1.0, 1.0]);
        assert_eq!(pixel(&vision, 1, 0, 0), &[1.0, 0.0, 0.0]);
    }

    #[test]
    fn cells_on_the_field_edge_are_partly_occluded() {
        let world = world_with(Vec::new());
        let agents = AgentIndex::from([(Position::new(1, 1), Direction::Up)]);
        let params = VisionParams {
            range: 1,
            field_of_view: core::f32::consts::FRAC_PI_2,
            agent_color: &[1.0, 0.0, 0.0],
        };
        let vision = render_vision(&world, Position::ORIGIN, Direction::Up, &agents, &params);
        // The edge of a 90 degree field splits the diagonal cell in half.
        let diagonal = pixel(&vision, 1, 1, 1);
        assert!((diagonal[0] - 1.0).abs() < 1e-4);
        assert!((diagonal[1] - 0.5).abs() < 1e-4);
        assert!((diagonal[2] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn opaque_items_shade_the_cells_behind_them() {
        // Facing up: a wall one cell ahead, a banana two ahead, another
        // banana off to the side.
        let world = world_with(vec![
            Item::generated(1, Position::new(0, 1)),
            Item::generated(0, Position::new(0, 2)),
            Item::generated(0, Position::new(2, 0)),
        ]);
        let agents = AgentIndex::new();
        let params = all_around(&[0.0, 0.0, 1.0], 2);
        let vision = render_vision(&world, Position::ORIGIN, Direction::Up, &agents, &params);
        // The wall itself keeps its own color.
        assert_eq!(pixel(&vision, 2, 1, 0), &[0.0, 0.0, 0.0]);
        // Directly behind the wall everything is occluded.
        assert_eq!(pixel(&vision, 2, 2, 0), &[1.0, 1.0, 1.0]);
        // Cells nowhere near the wall's shadow are untouched.
        assert_eq!(pixel(&vision, 2, 0, 2), &[1.0, 1.0, 0.0]);
        assert_eq!(pixel(&vision, 2, -2, 0), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn partial_occlusion_blends_toward_full_intensity() {
        let mut world = world_with(vec![Item::generated(1, Position::new(0, 1))]);
        let mut table = world.table().types().to_vec();
        table[1].visual_occlusion = 0.5;
        let snapshot = world.snapshot();
        world = WorldStore::restore(
            ItemTable::new(table, 3, 3).unwrap(),
            *world.settings(),
            snapshot,
        )
        .unwrap();
        let vision = render_vision(
            &world,
            Position::ORIGIN,
            Direction::Up,
            &AgentIndex::new(),
            &all_around(&[0.0, 0.0, 1.0], 3),
        );
        assert_eq!(pixel(&vision, 3, 2, 0), &[0.5, 0.5, 0.5]);
        assert_eq!(pixel(&vision, 3, 3, 0), &[0.5, 0.5, 0.5]);
    }

    #[test]
    fn overlap_of_arcs_handles_wraparound() {
        let eighth = PI / 4.0;
        assert!((angle_overlap(eighth, -eighth, eighth, -eighth) - PI / 2.0).abs() < 1e-5);
        assert!((angle_overlap(PI, 0.0, 0.0, -PI) - 0.0).abs() < 1e-5);
        assert!((angle_overlap(PI, 0.0, PI / 2.0, -PI / 2.0) - PI / 2.0).abs() < 1e-5);
    }
}
