//! Domain decomposition of the torus into shards with halo padding.

use crate::{
    error::{ensure_power_of_two, SolverError, SolverResult},
    grid::{Field, Grid},
    kernels::Rect,
};

/// Splits a `width` x `height` torus into `shards` rectangles.
///
/// Starting from the full grid, the currently larger side is halved
/// `log2(shards)` times, which keeps shards as square as possible. Every axis
/// that actually got split is padded by `horizon` cells on both sides so a
/// shard can run `horizon + 1` Jacobi rounds without talking to its neighbors.
#[derive(Debug, Clone, PartialEq)]
pub struct TorusShardingPolicy {
    pub width: usize,
    pub height: usize,
    pub shards: usize,
    pub horizon: usize,

    pub grid_w: usize,
    pub grid_h: usize,
    pub shard_w: usize,
    pub shard_h: usize,
    pub pad_w: usize,
    pub pad_h: usize,
    pub buffer_w: usize,
    pub buffer_h: usize,

    /// buffer area / shard area, i.e. the overcompute caused by the halo
    pub compute_ratio: f64,
}

impl TorusShardingPolicy {
    pub fn new(width: usize, height: usize, horizon: usize, shards: usize) -> SolverResult<TorusShardingPolicy> {
        ensure_power_of_two("grid width", width)?;
        ensure_power_of_two("grid height", height)?;
        ensure_power_of_two("shard count", shards)?;
        if shards > width * height {
            return Err(SolverError::ShardsExceedGrid { shards, width, height });
        }

        let (mut grid_w, mut grid_h) = (1, 1);
        let (mut shard_w, mut shard_h) = (width, height);

        let mut remaining = shards;
        while remaining > 1 {
            if shard_w > shard_h {
                shard_w /= 2;
                grid_w *= 2;
            } else {
                shard_h /= 2;
                grid_h *= 2;
            }
            remaining /= 2;
        }

        let pad_w = if grid_w > 1 { horizon } else { 0 };
        let pad_h = if grid_h > 1 { horizon } else { 0 };

        let buffer_w = shard_w + 2 * pad_w;
        let buffer_h = shard_h + 2 * pad_h;

        let compute_ratio = (buffer_w * buffer_h) as f64 / (shard_w * shard_h) as f64;

        Ok(TorusShardingPolicy {
            width,
            height,
            shards,
            horizon,
            grid_w,
            grid_h,
            shard_w,
            shard_h,
            pad_w,
            pad_h,
            buffer_w,
            buffer_h,
            compute_ratio,
        })
    }

    pub fn shard_x(&self, i: usize) -> i32 {
        ((i % self.grid_w) * self.shard_w) as i32
    }

    pub fn shard_y(&self, i: usize) -> i32 {
        ((i / self.grid_w) * self.shard_h) as i32
    }

    pub fn buffer_x(&self, i: usize) -> i32 {
        self.shard_x(i) - self.pad_w as i32
    }

    pub fn buffer_y(&self, i: usize) -> i32 {
        self.shard_y(i) - self.pad_h as i32
    }

    pub fn shard_rect(&self, i: usize) -> Rect {
        Rect::new(self.shard_x(i), self.shard_y(i), self.shard_w, self.shard_h)
    }

    pub fn buffer_rect(&self, i: usize) -> Rect {
        Rect::new(self.buffer_x(i), self.buffer_y(i), self.buffer_w, self.buffer_h)
    }

    /// Scratch grid large enough to hold one padded shard. It is addressed with
    /// global coordinates and relies on wraparound.
    pub fn scratch_grid(&self) -> Grid {
        Grid::containing(self.buffer_w, self.buffer_h)
    }

    /// True if `grid` can be used as scratch for this policy without reallocation.
    pub fn fits_scratch(&self, grid: &Grid) -> bool {
        grid.width() == self.buffer_w.next_power_of_two() && grid.height() == self.buffer_h.next_power_of_two()
    }

    /// Copies the padded region of shard `i` out of the full-size `inp`.
    pub fn scatter_shard_input(&self, i: usize, inp: &impl Field, scratch: &mut Grid) {
        let r = self.buffer_rect(i);
        scratch.copy_subrect(inp, r.x, r.y, r.w, r.h, r.x, r.y);
    }

    /// Copies only the interior of shard `i` from its scratch buffer into `out`.
    /// Halo cells are never authoritative.
    pub fn gather_shard_output(&self, i: usize, buffer: &impl Field, out: &mut Grid) {
        let x = self.shard_x(i);
        let y = self.shard_y(i);
        out.copy_subrect(buffer, x, y, self.shard_w, self.shard_h, x, y);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        floating_type_mod::FT,
        grid::FieldMut,
        kernels::{jacobi, jacobi_region, JacobiParams},
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn single_shard_has_no_padding() {
        let policy = TorusShardingPolicy::new(256, 256, 30, 1).unwrap();
        assert_eq!(policy.grid_w, 1);
        assert_eq!(policy.grid_h, 1);
        assert_eq!(policy.shard_w, 256);
        assert_eq!(policy.shard_h, 256);
        assert_eq!(policy.buffer_w, 256);
        assert_eq!(policy.buffer_h, 256);
        assert_eq!(policy.compute_ratio, 1.);
    }

    #[test]
    fn four_shards() {
        let policy = TorusShardingPolicy::new(256, 256, 30, 4).unwrap();
        assert_eq!(policy.grid_w, 2);
        assert_eq!(policy.grid_h, 2);
        assert_eq!(policy.shard_w, 128);
        assert_eq!(policy.shard_h, 128);
        assert_eq!(policy.buffer_w, 188);
        assert_eq!(policy.buffer_h, 188);
        assert_eq!(policy.compute_ratio, 2.1572265625);

        assert_eq!((policy.shard_x(0), policy.shard_y(0)), (0, 0));
        assert_eq!((policy.shard_x(1), policy.shard_y(1)), (128, 0));
        assert_eq!((policy.shard_x(2), policy.shard_y(2)), (0, 128));
        assert_eq!((policy.shard_x(3), policy.shard_y(3)), (128, 128));
    }

    #[test]
    fn eight_shards() {
        let policy = TorusShardingPolicy::new(256, 256, 30, 8).unwrap();
        assert_eq!(policy.grid_w, 2);
        assert_eq!(policy.grid_h, 4);
        assert_eq!(policy.shard_w, 128);
        assert_eq!(policy.shard_h, 64);
        assert_eq!(policy.buffer_w, 188);
        assert_eq!(policy.buffer_h, 124);
        assert_eq!(policy.compute_ratio, 2.845703125);

        assert_eq!((policy.shard_x(3), policy.shard_y(3)), (128, 64));
        assert_eq!((policy.shard_x(4), policy.shard_y(4)), (0, 128));
        assert_eq!((policy.shard_x(5), policy.shard_y(5)), (128, 128));

        assert_eq!(policy.buffer_x(3), 128 - 30);
        assert_eq!(policy.buffer_y(3), 64 - 30);
    }

    #[test]
    fn unsplit_axis_is_not_padded() {
        let policy = TorusShardingPolicy::new(64, 256, 5, 2).unwrap();
        assert_eq!((policy.grid_w, policy.grid_h), (1, 2));
        assert_eq!((policy.pad_w, policy.pad_h), (0, 5));
        assert_eq!((policy.buffer_w, policy.buffer_h), (64, 138));
        assert_eq!(policy.shard_w * policy.grid_w, 64);
        assert_eq!(policy.shard_h * policy.grid_h, 256);
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        assert!(matches!(
            TorusShardingPolicy::new(256, 256, 30, 3),
            Err(SolverError::NotPowerOfTwo { .. })
        ));
        assert!(matches!(
            TorusShardingPolicy::new(100, 256, 30, 4),
            Err(SolverError::NotPowerOfTwo { .. })
        ));
        assert!(matches!(
            TorusShardingPolicy::new(4, 4, 3, 32),
            Err(SolverError::ShardsExceedGrid { .. })
        ));
    }

    fn sharded_jacobi(inp: &Grid, params: JacobiParams, shards: usize) -> Grid {
        let policy = TorusShardingPolicy::new(inp.width(), inp.height(), params.horizon(), shards).unwrap();
        let mut out = Grid::new(inp.width(), inp.height());
        for i in 0..policy.shards {
            let mut scratch_in = policy.scratch_grid();
            policy.scatter_shard_input(i, inp, &mut scratch_in);
            let mut fb = policy.scratch_grid();
            let mut buf = policy.scratch_grid();
            jacobi_region(&scratch_in, &mut fb, &mut buf, params, policy.buffer_rect(i));
            policy.gather_shard_output(i, &buf, &mut out);
        }
        out
    }

    #[test]
    fn sharded_jacobi_reassembles_single_region_result() {
        let mut inp = Grid::new(4, 4);
        inp.set(1, 1, 1.);
        inp.set(1, 3, -1.);

        let params = JacobiParams::new(10., 0.1, 4).unwrap();
        let mut out = Grid::new(4, 4);
        jacobi(&inp, &mut Grid::new(4, 4), &mut out, params);

        assert_eq!(sharded_jacobi(&inp, params, 16), out);
    }

    #[test]
    fn sharded_jacobi_on_random_field() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut inp = Grid::new(64, 32);
        for v in inp.data_mut() {
            *v = rng.gen_range(-1.0..1.0) as FT;
        }
        let params = JacobiParams::new(-1., 0.25, 6).unwrap();

        let mut out = Grid::new(64, 32);
        jacobi(&inp, &mut Grid::new(64, 32), &mut out, params);

        for shards in [1, 2, 4, 8, 16] {
            assert_eq!(sharded_jacobi(&inp, params, shards), out, "shards={}", shards);
        }
    }
}
