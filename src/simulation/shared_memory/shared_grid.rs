use crate::{
    floating_type_mod::FT,
    grid::{Field, FieldMut, Grid, TorusIndex},
};
use std::cell::UnsafeCell;

/// Toroidal grid that is read and written by several threads at once.
///
/// The grid itself hands out no safe access. Callers obtain a
/// [`SharedGridView`] and promise that no cell is written while another
/// thread accesses it, which the shared backend guarantees by giving every
/// worker a disjoint write rectangle and a barrier between rounds.
pub struct SharedGrid {
    width: usize,
    height: usize,
    index: TorusIndex,
    cells: Box<[UnsafeCell<FT>]>,
}

unsafe impl Sync for SharedGrid {}

impl SharedGrid {
    pub fn new(width: usize, height: usize) -> SharedGrid {
        SharedGrid {
            width,
            height,
            index: TorusIndex::new(width, height),
            cells: (0..width * height).map(|_| UnsafeCell::new(0.)).collect(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// # Safety
    ///
    /// For as long as the view is used, no cell it writes may be accessed by
    /// another thread and no cell it reads may be written by another thread.
    pub unsafe fn view(&self) -> SharedGridView<'_> {
        SharedGridView { grid: self }
    }

    /// # Safety
    ///
    /// No other thread may access the grid during the copy.
    pub unsafe fn load_from(&self, src: &Grid) {
        assert_eq!((self.width, self.height), (src.width(), src.height()));
        for (cell, value) in self.cells.iter().zip(src.data()) {
            *cell.get() = *value;
        }
    }

    /// # Safety
    ///
    /// No other thread may write the grid during the copy.
    pub unsafe fn store_into(&self, dst: &mut Grid) {
        assert_eq!((self.width, self.height), (dst.width(), dst.height()));
        for (value, cell) in dst.data_mut().iter_mut().zip(self.cells.iter()) {
            *value = *cell.get();
        }
    }
}

#[derive(Clone, Copy)]
pub struct SharedGridView<'a> {
    grid: &'a SharedGrid,
}

impl Field for SharedGridView<'_> {
    fn width(&self) -> usize {
        self.grid.width
    }

    fn height(&self) -> usize {
        self.grid.height
    }

    #[inline(always)]
    fn get(&self, x: i32, y: i32) -> FT {
        // SAFETY: upheld by the creator of the view
        unsafe { *self.grid.cells[self.grid.index.index(x, y)].get() }
    }
}

impl FieldMut for SharedGridView<'_> {
    #[inline(always)]
    fn set(&mut self, x: i32, y: i32, value: FT) {
        // SAFETY: upheld by the creator of the view
        unsafe { *self.grid.cells[self.grid.index.index(x, y)].get() = value }
    }
}
