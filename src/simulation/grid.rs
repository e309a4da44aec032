use crate::floating_type_mod::FT;

/// Read access to a toroidal scalar field.
///
/// Coordinates are signed and wrap around in both directions, so `get(-1, 0)`
/// reads the last column. Implementors only have to provide `get`; bilinear
/// sampling is derived from it.
pub trait Field {
    fn width(&self) -> usize;
    fn height(&self) -> usize;
    fn get(&self, x: i32, y: i32) -> FT;

    /// Bilinear interpolation of the four wrapped neighbors around `(x, y)`.
    fn sample(&self, x: FT, y: FT) -> FT {
        let lx = x.floor();
        let bx = x - lx;
        let ly = y.floor();
        let by = y - ly;

        let lx = lx as i32;
        let ly = ly as i32;

        let s00 = self.get(lx, ly);
        let s10 = self.get(lx + 1, ly);
        let s01 = self.get(lx, ly + 1);
        let s11 = self.get(lx + 1, ly + 1);

        let s0 = blend(s00, s10, bx);
        let s1 = blend(s01, s11, bx);
        blend(s0, s1, by)
    }
}

/// Write access to a toroidal scalar field.
pub trait FieldMut: Field {
    fn set(&mut self, x: i32, y: i32, value: FT);

    fn sub(&mut self, x: i32, y: i32, value: FT) {
        let current = self.get(x, y);
        self.set(x, y, current - value);
    }
}

pub fn blend(x: FT, y: FT, amount: FT) -> FT {
    x * (1. - amount) + y * amount
}

/// Wraparound addressing for power-of-two fields: `x & (w-1)`, `y & (h-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TorusIndex {
    wshift: u32,
    wmask: i32,
    hmask: i32,
}

impl TorusIndex {
    pub fn new(width: usize, height: usize) -> TorusIndex {
        assert!(
            width.is_power_of_two() && height.is_power_of_two(),
            "grid dimensions must be powers of two, got {}x{}",
            width,
            height
        );
        TorusIndex {
            wshift: width.trailing_zeros(),
            wmask: (width - 1) as i32,
            hmask: (height - 1) as i32,
        }
    }

    #[inline(always)]
    pub fn index(&self, x: i32, y: i32) -> usize {
        (((y & self.hmask) as usize) << self.wshift) | (x & self.wmask) as usize
    }
}

/// Owned toroidal grid. Width and height are powers of two and never change.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    width: usize,
    height: usize,
    index: TorusIndex,
    data: Vec<FT>,
}

impl Grid {
    pub fn new(width: usize, height: usize) -> Grid {
        Grid::from_data(width, height, vec![0.; width * height])
    }

    pub fn from_data(width: usize, height: usize, data: Vec<FT>) -> Grid {
        let index = TorusIndex::new(width, height);
        assert_eq!(data.len(), width * height, "grid data does not match its dimensions");
        Grid {
            width,
            height,
            index,
            data,
        }
    }

    /// Smallest power-of-two grid that can hold a `width` x `height` region.
    pub fn containing(width: usize, height: usize) -> Grid {
        Grid::new(width.next_power_of_two(), height.next_power_of_two())
    }

    pub fn data(&self) -> &[FT] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [FT] {
        &mut self.data
    }

    pub fn fill(&mut self, value: FT) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    /// Copies a `w` x `h` rectangle from `other` at `(src_x, src_y)` to `(dst_x, dst_y)`.
    /// Both sides wrap, so the grids may have different sizes.
    pub fn copy_subrect(
        &mut self,
        other: &impl Field,
        src_x: i32,
        src_y: i32,
        w: usize,
        h: usize,
        dst_x: i32,
        dst_y: i32,
    ) {
        for j in 0..h as i32 {
            for i in 0..w as i32 {
                self.set(dst_x + i, dst_y + j, other.get(src_x + i, src_y + j));
            }
        }
    }

    pub fn max_abs_diff(&self, other: &Grid) -> FT {
        self.data
            .iter()
            .zip(other.data.iter())
            .fold(0., |acc: FT, (a, b)| acc.max((a - b).abs()))
    }
}

impl Field for Grid {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    #[inline(always)]
    fn get(&self, x: i32, y: i32) -> FT {
        self.data[self.index.index(x, y)]
    }
}

impl FieldMut for Grid {
    #[inline(always)]
    fn set(&mut self, x: i32, y: i32, value: FT) {
        let i = self.index.index(x, y);
        self.data[i] = value;
    }

    #[inline(always)]
    fn sub(&mut self, x: i32, y: i32, value: FT) {
        let i = self.index.index(x, y);
        self.data[i] -= value;
    }
}
