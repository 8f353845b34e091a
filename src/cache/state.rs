//! Per-block bookkeeping for the cache: the state grid and the merging of
//! dirty blocks into fetch tiles.

use crate::roi::{self, Coord, Roi};
use crate::util::ArenaIndex;

/// Identifier of an in-flight fetch, pointing into the fetch arena.
///
/// Generational: once the fetch retires, cells still carrying its id are
/// recognized as stale and treated as dirty.
pub(crate) type FetchId = ArenaIndex;

/// Lifecycle of a single block, as stored in the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CellState {
    /// Contents unknown; a read must fetch.
    Dirty,
    /// A fetch covering this block is in flight.
    InProcess(FetchId),
    /// Contents valid in the buffer.
    Clean,
    /// Invalidated while frozen; served stale until thaw.
    FixedDirty,
}

/// Public view of a block's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Contents unknown; the next unfrozen read fetches this block.
    Dirty,
    /// A fetch covering this block is in flight.
    InProcess,
    /// Contents valid.
    Clean,
    /// Invalidated while frozen; stale contents are served until thaw.
    FixedDirty,
}

impl From<CellState> for BlockState {
    fn from(cell: CellState) -> Self {
        match cell {
            CellState::Dirty => BlockState::Dirty,
            CellState::InProcess(_) => BlockState::InProcess,
            CellState::Clean => BlockState::Clean,
            CellState::FixedDirty => BlockState::FixedDirty,
        }
    }
}

/// Dense grid of block states covering the full array shape.
#[derive(Debug)]
pub(crate) struct BlockGrid {
    grid_shape: Coord,
    cells: Vec<CellState>,
}

impl BlockGrid {
    /// Builds an all-dirty grid for `full_shape` partitioned by
    /// `block_shape`.
    pub(crate) fn new(full_shape: &[usize], block_shape: &[usize]) -> Self {
        let grid_shape = roi::grid_shape(full_shape, block_shape);
        let num_cells = grid_shape.iter().product();
        Self {
            grid_shape,
            cells: vec![CellState::Dirty; num_cells],
        }
    }

    pub(crate) fn grid_shape(&self) -> &[usize] {
        &self.grid_shape
    }

    pub(crate) fn get(&self, cell: &[usize]) -> CellState {
        self.cells[roi::linear_index(cell, &self.grid_shape)]
    }

    pub(crate) fn set(&mut self, cell: &[usize], state: CellState) {
        self.cells[roi::linear_index(cell, &self.grid_shape)] = state;
    }

    /// True if any cell in the whole grid matches `predicate`.
    pub(crate) fn any(&self, predicate: impl Fn(CellState) -> bool) -> bool {
        self.cells.iter().copied().any(predicate)
    }

    /// Resets every cell to dirty.
    pub(crate) fn reset(&mut self) {
        self.cells.fill(CellState::Dirty);
    }

    /// Cell coordinates of every cell matching `predicate`, row-major.
    pub(crate) fn cells_where(
        &self,
        predicate: impl Fn(CellState) -> bool,
    ) -> Vec<Coord> {
        let lo: Coord = self.grid_shape.iter().map(|_| 0).collect();
        roi::cells(&lo, &self.grid_shape)
            .filter(|cell| predicate(self.get(cell)))
            .collect()
    }
}

/// Merges a row-major list of dirty cells into maximal axis-aligned
/// rectangles of cells, greedily.
///
/// One fetch request is issued per returned rectangle, so fewer, larger
/// rectangles mean fewer round trips to the producer. The greedy grow is
/// not globally optimal but never splits a contiguous run along the
/// innermost axis.
pub(crate) fn merge_tiles(cells: &[Coord], grid_shape: &[usize]) -> Vec<(Coord, Coord)> {
    if cells.is_empty() {
        return Vec::new();
    }
    let ndim = grid_shape.len();
    let mut unclaimed: std::collections::HashSet<&[usize]> =
        cells.iter().map(smallvec::SmallVec::as_slice).collect();
    let mut tiles = Vec::new();

    for cell in cells {
        if !unclaimed.contains(cell.as_slice()) {
            continue;
        }
        let lo: Coord = cell.clone();
        let mut hi: Coord = cell.iter().map(|&c| c + 1).collect();

        // Grow innermost axis first, then outward, taking a whole slab at
        // a time so the tile stays rectangular.
        for axis in (0..ndim).rev() {
            'grow: while hi[axis] < grid_shape[axis] {
                let mut slab_lo = lo.clone();
                let mut slab_hi = hi.clone();
                slab_lo[axis] = hi[axis];
                slab_hi[axis] = hi[axis] + 1;
                for probe in roi::cells(&slab_lo, &slab_hi) {
                    if !unclaimed.contains(probe.as_slice()) {
                        break 'grow;
                    }
                }
                hi[axis] += 1;
            }
        }

        for claimed in roi::cells(&lo, &hi) {
            unclaimed.remove(claimed.as_slice());
        }
        tiles.push((lo, hi));
    }
    tiles
}

/// Converts a rectangle of cells into the array-space ROI it covers,
/// clipped to the full shape.
pub(crate) fn tile_roi(
    lo: &[usize],
    hi: &[usize],
    block_shape: &[usize],
    full_shape: &[usize],
) -> Roi {
    let start: Coord = lo
        .iter()
        .zip(block_shape)
        .map(|(&c, &b)| c * b)
        .collect();
    let stop: Coord = hi
        .iter()
        .zip(block_shape)
        .zip(full_shape)
        .map(|((&c, &b), &s)| (c * b).min(s))
        .collect();
    Roi::new(start, stop)
}
