//! N-dimensional regions of interest and block-grid arithmetic.
//!
//! A [`Roi`] is the half-open axis-aligned box `[start, stop)`. All cache
//! addressing is done in two coordinate systems: element coordinates
//! (positions in the full array) and cell coordinates (positions in the
//! block grid). The helpers here convert between them.
//!
//! Dimensionality is a runtime property; shapes are small (image pipelines
//! use at most 5-6 axes), so coordinates live in a [`SmallVec`] and never
//! touch the heap in practice.

use core::fmt;
use smallvec::SmallVec;

/// A per-axis coordinate or extent vector.
pub type Coord = SmallVec<[usize; 6]>;

/// A half-open axis-aligned region `[start, stop)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Roi {
    start: Coord,
    stop: Coord,
}

impl Roi {
    /// Builds a region from per-axis bounds.
    ///
    /// # Panics
    ///
    /// Panics if the bounds disagree on dimensionality or `start > stop`
    /// on any axis.
    #[must_use]
    pub fn new(start: impl AsRef<[usize]>, stop: impl AsRef<[usize]>) -> Self {
        let (start, stop) = (
            Coord::from_slice(start.as_ref()),
            Coord::from_slice(stop.as_ref()),
        );
        assert_eq!(start.len(), stop.len(), "roi bounds must share ndim");
        assert!(
            start.iter().zip(&stop).all(|(a, b)| a <= b),
            "roi start must not exceed stop"
        );
        Self { start, stop }
    }

    /// The full region of an array with the given shape.
    #[must_use]
    pub fn from_shape(shape: &[usize]) -> Self {
        Self {
            start: Coord::from_iter(std::iter::repeat(0).take(shape.len())),
            stop: Coord::from_slice(shape),
        }
    }

    /// Number of axes.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.start.len()
    }

    /// Lower bound, inclusive.
    #[must_use]
    pub fn start(&self) -> &[usize] {
        &self.start
    }

    /// Upper bound, exclusive.
    #[must_use]
    pub fn stop(&self) -> &[usize] {
        &self.stop
    }

    /// Per-axis extents.
    #[must_use]
    pub fn shape(&self) -> Coord {
        self.start
            .iter()
            .zip(&self.stop)
            .map(|(a, b)| b - a)
            .collect()
    }

    /// Total number of elements covered.
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.shape().iter().product()
    }

    /// True if any axis has zero extent.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start.iter().zip(&self.stop).any(|(a, b)| a == b)
    }

    /// True if `self` lies entirely within `[0, shape)`.
    #[must_use]
    pub fn fits_in(&self, shape: &[usize]) -> bool {
        self.ndim() == shape.len() && self.stop.iter().zip(shape).all(|(s, dim)| s <= dim)
    }

    /// True if `other` lies entirely within `self`.
    #[must_use]
    pub fn contains_roi(&self, other: &Roi) -> bool {
        self.start.iter().zip(&other.start).all(|(a, b)| a <= b)
            && self.stop.iter().zip(&other.stop).all(|(a, b)| a >= b)
    }

    /// The overlap of two regions, or `None` when they are disjoint.
    #[must_use]
    pub fn intersection(&self, other: &Roi) -> Option<Roi> {
        let start: Coord = self
            .start
            .iter()
            .zip(&other.start)
            .map(|(a, b)| *a.max(b))
            .collect();
        let stop: Coord = self
            .stop
            .iter()
            .zip(&other.stop)
            .map(|(a, b)| *a.min(b))
            .collect();
        if start.iter().zip(&stop).all(|(a, b)| a < b) {
            Some(Roi { start, stop })
        } else {
            None
        }
    }

    /// The smallest region containing both inputs.
    #[must_use]
    pub fn bounding_union(&self, other: &Roi) -> Roi {
        Roi {
            start: self
                .start
                .iter()
                .zip(&other.start)
                .map(|(a, b)| *a.min(b))
                .collect(),
            stop: self
                .stop
                .iter()
                .zip(&other.stop)
                .map(|(a, b)| *a.max(b))
                .collect(),
        }
    }

    /// Translates the region by `-offset` (element to tile-local
    /// coordinates).
    ///
    /// # Panics
    ///
    /// Panics if the region does not lie at or above `offset`.
    #[must_use]
    pub fn relative_to(&self, offset: &[usize]) -> Roi {
        Roi {
            start: self.start.iter().zip(offset).map(|(a, o)| a - o).collect(),
            stop: self.stop.iter().zip(offset).map(|(a, o)| a - o).collect(),
        }
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}..{:?})", &self.start[..], &self.stop[..])
    }
}

/// Cell-coordinate bounds of the grid cells a region overlaps:
/// `floor(start / block)` to `ceil(stop / block)`.
#[must_use]
pub fn block_range(roi: &Roi, block_shape: &[usize]) -> (Coord, Coord) {
    let lo: Coord = roi
        .start()
        .iter()
        .zip(block_shape)
        .map(|(s, b)| s / b)
        .collect();
    let hi: Coord = roi
        .stop()
        .iter()
        .zip(block_shape)
        .map(|(s, b)| s.div_ceil(*b))
        .collect();
    (lo, hi)
}

/// The element-space region of one grid cell, clipped to the array shape.
#[must_use]
pub fn block_roi(cell: &[usize], block_shape: &[usize], full_shape: &[usize]) -> Roi {
    let start: Coord = cell
        .iter()
        .zip(block_shape)
        .map(|(c, b)| c * b)
        .collect();
    let stop: Coord = start
        .iter()
        .zip(block_shape)
        .zip(full_shape)
        .map(|((s, b), dim)| (s + b).min(*dim))
        .collect();
    Roi { start, stop }
}

/// Iterates every cell coordinate in `[lo, hi)` in row-major order.
pub fn cells(lo: &[usize], hi: &[usize]) -> CellIter {
    let exhausted = lo.iter().zip(hi).any(|(a, b)| a >= b);
    CellIter {
        lo: Coord::from_slice(lo),
        hi: Coord::from_slice(hi),
        next: Coord::from_slice(lo),
        exhausted,
    }
}

/// Row-major odometer over a cell-coordinate box.
#[derive(Debug)]
pub struct CellIter {
    lo: Coord,
    hi: Coord,
    next: Coord,
    exhausted: bool,
}

impl Iterator for CellIter {
    type Item = Coord;

    fn next(&mut self) -> Option<Coord> {
        if self.exhausted {
            return None;
        }
        let current = self.next.clone();
        // Increment the innermost axis, carrying outward.
        for axis in (0..self.next.len()).rev() {
            self.next[axis] += 1;
            if self.next[axis] < self.hi[axis] {
                return Some(current);
            }
            self.next[axis] = self.lo[axis];
        }
        self.exhausted = true;
        Some(current)
    }
}

/// Row-major linear index of a cell in a grid of the given shape.
#[must_use]
pub fn linear_index(cell: &[usize], grid_shape: &[usize]) -> usize {
    debug_assert_eq!(cell.len(), grid_shape.len());
    cell.iter()
        .zip(grid_shape)
        .fold(0, |acc, (c, dim)| acc * dim + c)
}

/// Per-axis cell counts for an array of `shape` under `block_shape`.
#[must_use]
pub fn grid_shape(shape: &[usize], block_shape: &[usize]) -> Coord {
    shape
        .iter()
        .zip(block_shape)
        .map(|(s, b)| s.div_ceil(*b))
        .collect()
}
