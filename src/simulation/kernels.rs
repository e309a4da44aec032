//! Numeric kernels of the stable-fluids solver.
//!
//! All kernels are deterministic and only write their output field. They are
//! generic over [`Field`]/[`FieldMut`] so the same code runs on owned grids,
//! shard scratch buffers and the shared-memory grids of the worker pool.

use crate::{
    error::{SolverError, SolverResult},
    floating_type_mod::FT,
    grid::{Field, FieldMut},
};

/// Cache blocking for advection.
const ADVECT_BLOCK: usize = 32;

/// Rectangle in (wrapping) grid coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: usize,
    pub h: usize,
}

impl Rect {
    pub fn new(x: i32, y: i32, w: usize, h: usize) -> Rect {
        Rect { x, y, w, h }
    }

    pub fn full(field: &impl Field) -> Rect {
        Rect::new(0, 0, field.width(), field.height())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JacobiParams {
    pub a: FT,
    pub inv_b: FT,
    pub iterations: u32,
}

impl JacobiParams {
    /// The iteration count must be even (the result lands in the caller's
    /// `out` only after an even number of buffer swaps) and at least 2.
    pub fn new(a: FT, inv_b: FT, iterations: u32) -> SolverResult<JacobiParams> {
        validate_iterations(iterations)?;
        Ok(JacobiParams { a, inv_b, iterations })
    }

    /// How far information travels in one solve after the first round.
    pub fn horizon(&self) -> usize {
        self.iterations as usize - 1
    }
}

pub fn validate_iterations(iterations: u32) -> SolverResult<()> {
    if iterations < 2 || iterations % 2 != 0 {
        return Err(SolverError::OddIterations { iterations });
    }
    Ok(())
}

fn advect_block(
    inp: &impl Field,
    out: &mut impl FieldMut,
    u: &impl Field,
    v: &impl Field,
    rect: Rect,
    scale: FT,
) {
    for j in rect.y..rect.y + rect.h as i32 {
        for i in rect.x..rect.x + rect.w as i32 {
            let value = inp.sample(i as FT - u.get(i, j) * scale, j as FT - v.get(i, j) * scale);
            out.set(i, j, value);
        }
    }
}

/// Semi-Lagrangian advection: traces every cell back along `-(u, v) * scale`.
pub fn advect(inp: &impl Field, out: &mut impl FieldMut, u: &impl Field, v: &impl Field, scale: FT) {
    let w = inp.width();
    let h = inp.height();
    for j in (0..h).step_by(ADVECT_BLOCK) {
        for i in (0..w).step_by(ADVECT_BLOCK) {
            let rect = Rect::new(
                i as i32,
                j as i32,
                ADVECT_BLOCK.min(w - i),
                ADVECT_BLOCK.min(h - j),
            );
            advect_block(inp, out, u, v, rect, scale);
        }
    }
}

/// Central-difference divergence of `(u, v)`.
pub fn calc_div(u: &impl Field, v: &impl Field, div: &mut impl FieldMut, scale: FT) {
    for j in 0..u.height() as i32 {
        for i in 0..u.width() as i32 {
            let value = scale * (u.get(i + 1, j) - u.get(i - 1, j) + v.get(i, j + 1) - v.get(i, j - 1));
            div.set(i, j, value);
        }
    }
}

/// Removes the pressure gradient from the velocity field in place.
pub fn subtract_pressure(p: &impl Field, u: &mut impl FieldMut, v: &mut impl FieldMut, scale: FT) {
    for j in 0..p.height() as i32 {
        for i in 0..p.width() as i32 {
            let udiff = scale * (p.get(i + 1, j) - p.get(i - 1, j));
            u.sub(i, j, udiff);

            let vdiff = scale * (p.get(i, j + 1) - p.get(i, j - 1));
            v.sub(i, j, vdiff);
        }
    }
}

pub fn zero(buf: &mut impl FieldMut) {
    for j in 0..buf.height() as i32 {
        for i in 0..buf.width() as i32 {
            buf.set(i, j, 0.);
        }
    }
}

/// One Jacobi round: `out = (a * inp + sum of the four fb neighbors) * inv_b`.
pub fn jacobi_iteration(inp: &impl Field, fb: &impl Field, out: &mut impl FieldMut, a: FT, inv_b: FT, rect: Rect) {
    for j in rect.y..rect.y + rect.h as i32 {
        for i in rect.x..rect.x + rect.w as i32 {
            let value =
                (a * inp.get(i, j) + fb.get(i - 1, j) + fb.get(i + 1, j) + fb.get(i, j - 1) + fb.get(i, j + 1)) * inv_b;
            out.set(i, j, value);
        }
    }
}

/// First Jacobi round with an all-zero feedback buffer.
pub fn first_jacobi_iteration(inp: &impl Field, out: &mut impl FieldMut, a: FT, inv_b: FT, rect: Rect) {
    for j in rect.y..rect.y + rect.h as i32 {
        for i in rect.x..rect.x + rect.w as i32 {
            out.set(i, j, a * inv_b * inp.get(i, j));
        }
    }
}

/// Runs `params.iterations` rounds over `rect`, ping-ponging `fb` and `out`.
///
/// `between_rounds` runs before every round except the first; the shared-memory
/// workers use it to meet at the barrier.
pub fn jacobi_region_with<G: FieldMut>(
    inp: &impl Field,
    fb: &mut G,
    out: &mut G,
    params: JacobiParams,
    rect: Rect,
    mut between_rounds: impl FnMut(),
) {
    let JacobiParams { a, inv_b, iterations } = params;

    let (mut fb, mut out) = (out, fb);
    first_jacobi_iteration(inp, &mut *out, a, inv_b, rect);

    for _ in 1..iterations {
        std::mem::swap(&mut fb, &mut out);
        between_rounds();
        jacobi_iteration(inp, &*fb, &mut *out, a, inv_b, rect);
    }
}

pub fn jacobi_region<G: FieldMut>(inp: &impl Field, fb: &mut G, out: &mut G, params: JacobiParams, rect: Rect) {
    jacobi_region_with(inp, fb, out, params, rect, || {});
}

/// Whole-grid Jacobi solve; the result ends up in `out` because the
/// iteration count is even.
pub fn jacobi<G: FieldMut>(inp: &impl Field, fb: &mut G, out: &mut G, params: JacobiParams) {
    let rect = Rect::full(inp);
    jacobi_region(inp, fb, out, params, rect);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;

    fn example_input() -> Grid {
        let mut inp = Grid::new(4, 4);
        inp.set(1, 1, 1.);
        inp.set(1, 3, -1.);
        inp
    }

    #[test]
    fn jacobi_matches_reference_values() {
        let inp = example_input();
        let mut fb = Grid::new(4, 4);
        let mut out = Grid::new(4, 4);

        jacobi(&inp, &mut fb, &mut out, JacobiParams::new(10., 0.1, 30).unwrap());

        let mut exp = Grid::new(4, 4);
        exp.set(0, 1, 0.1041666716337204);
        exp.set(1, 1, 1.0208333730697632);
        exp.set(2, 1, 0.1041666716337204);
        exp.set(3, 1, 0.02083333395421505);

        exp.set(0, 3, -0.1041666716337204);
        exp.set(1, 3, -1.0208333730697632);
        exp.set(2, 3, -0.1041666716337204);
        exp.set(3, 3, -0.02083333395421505);

        let max_err = out.max_abs_diff(&exp);
        assert!(max_err < 1e-6, "max error {}", max_err);
    }

    #[test]
    fn jacobi_is_symmetric_and_deterministic() {
        let inp = example_input();
        let params = JacobiParams::new(10., 0.1, 30).unwrap();

        let mut first = Grid::new(4, 4);
        jacobi(&inp, &mut Grid::new(4, 4), &mut first, params);
        let mut second = Grid::new(4, 4);
        jacobi(&inp, &mut Grid::new(4, 4), &mut second, params);

        assert_eq!(first, second);
        for x in 0..4 {
            assert_eq!(first.get(x, 1), -first.get(x, 3));
        }
    }

    #[test]
    fn jacobi_ignores_initial_output_guess() {
        let inp = example_input();
        let params = JacobiParams::new(10., 0.1, 4).unwrap();

        let mut clean = Grid::new(4, 4);
        jacobi(&inp, &mut Grid::new(4, 4), &mut clean, params);

        let mut dirty = Grid::new(4, 4);
        dirty.fill(42.);
        let mut dirty_fb = Grid::new(4, 4);
        dirty_fb.fill(-7.);
        jacobi(&inp, &mut dirty_fb, &mut dirty, params);

        assert_eq!(clean, dirty);
    }

    #[test]
    fn odd_iteration_counts_are_rejected() {
        assert!(matches!(
            JacobiParams::new(1., 0.25, 29),
            Err(SolverError::OddIterations { iterations: 29 })
        ));
        assert!(JacobiParams::new(1., 0.25, 0).is_err());
        assert_eq!(JacobiParams::new(1., 0.25, 30).unwrap().horizon(), 29);
    }

    #[test]
    fn divergence_of_uniform_flow_is_zero() {
        let mut u = Grid::new(8, 8);
        u.fill(2.);
        let v = Grid::new(8, 8);
        let mut div = Grid::new(8, 8);
        div.fill(1.);
        calc_div(&u, &v, &mut div, 0.5);
        assert!(div.data().iter().all(|d| *d == 0.));
    }

    #[test]
    fn divergence_uses_central_differences() {
        let mut u = Grid::new(4, 4);
        u.set(2, 1, 3.);
        let mut v = Grid::new(4, 4);
        v.set(1, 0, 1.);
        let mut div = Grid::new(4, 4);
        calc_div(&u, &v, &mut div, 0.5);
        assert_eq!(div.get(1, 1), 1.);
        assert_eq!(div.get(3, 1), -1.5);
    }

    #[test]
    fn subtract_pressure_removes_gradient() {
        let mut p = Grid::new(4, 4);
        p.set(2, 1, 4.);
        let mut u = Grid::new(4, 4);
        let mut v = Grid::new(4, 4);
        subtract_pressure(&p, &mut u, &mut v, 0.5);
        assert_eq!(u.get(1, 1), -2.);
        assert_eq!(u.get(3, 1), 2.);
        assert_eq!(v.get(2, 0), -2.);
        assert_eq!(v.get(2, 2), 2.);
    }

    #[test]
    fn advect_with_zero_velocity_is_identity() {
        let mut inp = Grid::new(64, 32);
        for (i, v) in inp.data_mut().iter_mut().enumerate() {
            *v = (i % 7) as FT;
        }
        let u = Grid::new(64, 32);
        let v = Grid::new(64, 32);
        let mut out = Grid::new(64, 32);
        advect(&inp, &mut out, &u, &v, 1.);
        assert_eq!(inp, out);
    }

    #[test]
    fn advect_shifts_by_whole_cells() {
        let mut inp = Grid::new(8, 8);
        inp.set(2, 3, 1.);
        let mut u = Grid::new(8, 8);
        u.fill(1.);
        let v = Grid::new(8, 8);
        let mut out = Grid::new(8, 8);
        advect(&inp, &mut out, &u, &v, 2.);
        assert_eq!(out.get(4, 3), 1.);
        assert_eq!(out.get(2, 3), 0.);
    }

    #[test]
    fn zero_clears_everything() {
        let mut grid = Grid::new(4, 8);
        grid.fill(3.);
        zero(&mut grid);
        assert!(grid.data().iter().all(|v| *v == 0.));
    }
}
