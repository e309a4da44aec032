//! External disturbances: color splats and velocity strokes.

use crate::{
    floating_type_mod::FT,
    grid::{blend, Field, FieldMut},
    vec2i, V2, V2I,
};
use rand::Rng;

pub const SPLAT_AMOUNT: FT = 0.9;

pub const STROKE_AMOUNT: FT = 0.2;
pub const STROKE_INNER_RADIUS: i32 = 1;
pub const STROKE_OUTER_RADIUS: i32 = 7;
/// Lower bound for the time between two stroke samples, in seconds.
pub const STROKE_MIN_DT: FT = 0.01;

pub fn smoothstep(edge0: FT, edge1: FT, x: FT) -> FT {
    let t = ((x - edge0) / (edge1 - edge0)).max(0.).min(1.);
    t * t * (3. - 2. * t)
}

/// Blends `value` into every cell within `r1` of `center`, fully (times
/// `amount`) inside `r0` and with a smooth falloff between `r0` and `r1`.
pub fn draw_circle(field: &mut impl FieldMut, center: V2I, r0: i32, r1: i32, value: FT, amount: FT) {
    for j in -r1..=r1 {
        for i in -r1..=r1 {
            let d = ((i * i + j * j) as FT).sqrt();
            if d > r1 as FT {
                continue;
            }
            let (x, y) = (center.x + i, center.y + j);
            let a = 1. - smoothstep(r0 as FT, r1 as FT, d);
            let existing = field.get(x, y);
            field.set(x, y, blend(existing, value, a * amount));
        }
    }
}

/// A disc of random color.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Splat {
    pub center: V2I,
    pub r0: i32,
    pub r1: i32,
    pub color: [FT; 3],
}

impl Splat {
    /// Radius scales with the grid width, relative to a 256 wide reference grid.
    pub fn random(rng: &mut impl Rng, width: usize, height: usize) -> Splat {
        let center = vec2i(rng.gen_range(0..width as i32), rng.gen_range(0..height as i32));
        let scale = (width + 10) as FT / (256 + 10) as FT;
        let r0 = ((10. + rng.gen::<FT>() * 30.) * scale) as i32;
        let color = [rng.gen::<FT>(), rng.gen::<FT>(), rng.gen::<FT>()];
        Splat {
            center,
            r0,
            r1: r0 + 1,
            color,
        }
    }

    pub fn apply(&self, r: &mut impl FieldMut, g: &mut impl FieldMut, b: &mut impl FieldMut) {
        draw_circle(r, self.center, self.r0, self.r1, self.color[0], SPLAT_AMOUNT);
        draw_circle(g, self.center, self.r0, self.r1, self.color[1], SPLAT_AMOUNT);
        draw_circle(b, self.center, self.r0, self.r1, self.color[2], SPLAT_AMOUNT);
    }
}

/// Injects the velocity of a drag from `from` to `to` (grid cells) that took
/// `dt` seconds. `cell_size` converts cells per second into field units.
pub fn stroke(u: &mut impl FieldMut, v: &mut impl FieldMut, from: V2, to: V2, dt: FT, cell_size: FT) {
    let dt = dt.max(STROKE_MIN_DT);
    let delta = to - from;
    let velocity = delta / dt * cell_size;

    let steps = delta.x.abs().max(delta.y.abs()) * 2. + 1.;

    let mut i = 0.;
    while i < steps {
        let t = i / steps;
        let p = vec2i(blend(to.x, from.x, t).floor() as i32, blend(to.y, from.y, t).floor() as i32);
        draw_circle(u, p, STROKE_INNER_RADIUS, STROKE_OUTER_RADIUS, velocity.x, STROKE_AMOUNT);
        draw_circle(v, p, STROKE_INNER_RADIUS, STROKE_OUTER_RADIUS, velocity.y, STROKE_AMOUNT);
        i += 2.;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{grid::Grid, vec2f};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn smoothstep_is_clamped() {
        assert_eq!(smoothstep(1., 7., 0.), 0.);
        assert_eq!(smoothstep(1., 7., 1.), 0.);
        assert_eq!(smoothstep(1., 7., 4.), 0.5);
        assert_eq!(smoothstep(1., 7., 9.), 1.);
    }

    #[test]
    fn circle_blends_inside_and_leaves_outside() {
        let mut grid = Grid::new(32, 32);
        draw_circle(&mut grid, vec2i(16, 16), 2, 4, 1., 1.);
        assert_eq!(grid.get(16, 16), 1.);
        assert_eq!(grid.get(18, 16), 1.);
        assert_eq!(grid.get(20, 16), 0.);
        assert_eq!(grid.get(16, 21), 0.);
        let mid = grid.get(19, 16);
        assert!(mid > 0. && mid < 1.);
    }

    #[test]
    fn circle_wraps_around_the_edges() {
        let mut grid = Grid::new(16, 16);
        draw_circle(&mut grid, vec2i(0, 0), 1, 2, 1., 0.5);
        assert_eq!(grid.get(0, 0), 0.5);
        assert_eq!(grid.get(15, 0), 0.5);
        assert_eq!(grid.get(0, 15), 0.5);
    }

    #[test]
    fn random_splats_scale_with_width() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let splat = Splat::random(&mut rng, 256, 128);
            assert!((10..40).contains(&splat.r0), "r0={}", splat.r0);
            assert_eq!(splat.r1, splat.r0 + 1);
            assert!((0..256).contains(&splat.center.x));
            assert!((0..128).contains(&splat.center.y));
            assert!(splat.color.iter().all(|c| (0. ..1.).contains(c)));
        }
        let small = Splat::random(&mut rng, 32, 32);
        assert!((1..7).contains(&small.r0), "r0={}", small.r0);
    }

    #[test]
    fn stroke_pushes_along_the_drag() {
        let mut u = Grid::new(64, 64);
        let mut v = Grid::new(64, 64);
        stroke(&mut u, &mut v, vec2f(10., 20.), vec2f(20., 20.), 0.5, 1. / 256.);
        assert!(u.get(15, 20) > 0.);
        assert_eq!(v.get(15, 20), 0.);
        // far away from the segment
        assert_eq!(u.get(50, 50), 0.);
    }
}
