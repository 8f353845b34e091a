//! Dense row-major N-dimensional buffers.
//!
//! [`NdBuffer`] is the only array representation the core needs: the cache
//! backing store, fetched tiles, and read results are all dense row-major
//! buffers. Region copies move whole innermost-axis runs with
//! `copy_from_slice`, so block transfers do not pay a per-element cost.
//!
//! Ownership is strict: the cache never hands out references into its
//! backing buffer; reads copy out.

use crate::roi::{cells, Coord, Roi};

/// A dense row-major N-dimensional array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdBuffer<T> {
    shape: Coord,
    strides: Coord,
    data: Vec<T>,
}

fn row_major_strides(shape: &[usize]) -> Coord {
    let mut strides = Coord::from_slice(shape);
    let mut acc = 1;
    for axis in (0..shape.len()).rev() {
        strides[axis] = acc;
        acc *= shape[axis];
    }
    strides
}

impl<T: Copy> NdBuffer<T> {
    /// Allocates a buffer of the given shape filled with `value`.
    #[must_use]
    pub fn filled(shape: &[usize], value: T) -> Self {
        Self {
            shape: Coord::from_slice(shape),
            strides: row_major_strides(shape),
            data: vec![value; shape.iter().product()],
        }
    }

    /// Wraps an existing row-major element vector.
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` disagrees with `shape`.
    #[must_use]
    pub fn from_vec(shape: &[usize], data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "element count must match shape"
        );
        Self {
            shape: Coord::from_slice(shape),
            strides: row_major_strides(shape),
            data,
        }
    }

    /// Copies `src` into `self` so that `src[0..]` lands at `at.start()`.
    ///
    /// # Panics
    ///
    /// Panics if `at` does not fit in `self` or its shape differs from
    /// `src`'s.
    pub fn copy_in(&mut self, at: &Roi, src: &NdBuffer<T>) {
        assert_eq!(&at.shape()[..], src.shape(), "region/tile shape mismatch");
        self.copy_in_from(at, src, &vec![0; src.ndim()]);
    }

    /// Copies the region of `at`'s shape starting at `src_start` in `src`
    /// into `self` at `at.start()`.
    pub fn copy_in_from(&mut self, at: &Roi, src: &NdBuffer<T>, src_start: &[usize]) {
        assert!(at.fits_in(&self.shape), "destination region out of bounds");
        let extents = at.shape();
        let ndim = extents.len();
        let row_len = extents[ndim - 1];
        if row_len == 0 {
            return;
        }
        let outer_lo = vec![0; ndim - 1];
        let outer_hi = &extents[..ndim - 1];
        for outer in cells(&outer_lo, outer_hi) {
            let dst_at: Coord = at
                .start()
                .iter()
                .zip(outer.iter().chain(std::iter::repeat(&0)))
                .map(|(base, off)| base + off)
                .collect();
            let src_at: Coord = src_start
                .iter()
                .zip(outer.iter().chain(std::iter::repeat(&0)))
                .map(|(base, off)| base + off)
                .collect();
            let dst_off = self.offset_of(&dst_at);
            let src_off = src.offset_of(&src_at);
            self.data[dst_off..dst_off + row_len]
                .copy_from_slice(&src.data[src_off..src_off + row_len]);
        }
    }

    /// Copies the given region out into a fresh buffer.
    ///
    /// # Panics
    ///
    /// Panics if the region does not fit in `self`.
    #[must_use]
    pub fn copy_out(&self, roi: &Roi) -> NdBuffer<T> {
        assert!(roi.fits_in(&self.shape), "source region out of bounds");
        let extents = roi.shape();
        let ndim = extents.len();
        let row_len = extents[ndim - 1];
        let mut data = Vec::with_capacity(roi.num_elements());
        if row_len > 0 {
            let outer_lo = vec![0; ndim - 1];
            for outer in cells(&outer_lo, &extents[..ndim - 1]) {
                let src_at: Coord = roi
                    .start()
                    .iter()
                    .zip(outer.iter().chain(std::iter::repeat(&0)))
                    .map(|(base, off)| base + off)
                    .collect();
                let src_off = self.offset_of(&src_at);
                data.extend_from_slice(&self.data[src_off..src_off + row_len]);
            }
        }
        NdBuffer::from_vec(&extents, data)
    }
}

impl<T> NdBuffer<T> {
    /// Per-axis extents.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of axes.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for zero-element buffers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the element storage in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.data.len() * core::mem::size_of::<T>()
    }

    /// The flat row-major element slice.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// The element at the given coordinate.
    #[must_use]
    pub fn get(&self, coord: &[usize]) -> &T {
        &self.data[self.offset_of(coord)]
    }

    fn offset_of(&self, coord: &[usize]) -> usize {
        debug_assert_eq!(coord.len(), self.shape.len());
        coord
            .iter()
            .zip(&self.strides)
            .map(|(c, s)| c * s)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: &[usize]) -> NdBuffer<u32> {
        let n: usize = shape.iter().product();
        NdBuffer::from_vec(shape, (0..n as u32).collect())
    }

    #[test]
    fn strides_are_row_major() {
        let buf = ramp(&[2, 3, 4]);
        assert_eq!(*buf.get(&[0, 0, 1]), 1);
        assert_eq!(*buf.get(&[0, 1, 0]), 4);
        assert_eq!(*buf.get(&[1, 0, 0]), 12);
    }

    #[test]
    fn copy_out_extracts_subregion() {
        let buf = ramp(&[4, 4]);
        let sub = buf.copy_out(&Roi::new([1, 1], [3, 3]));
        assert_eq!(sub.shape(), &[2, 2]);
        assert_eq!(sub.as_slice(), &[5, 6, 9, 10]);
    }

    #[test]
    fn copy_in_roundtrip() {
        let mut buf = NdBuffer::filled(&[4, 4], 0u32);
        let tile = ramp(&[2, 3]);
        let at = Roi::new([2, 1], [4, 4]);
        buf.copy_in(&at, &tile);
        assert_eq!(buf.copy_out(&at), tile);
        // Untouched elements stay zero.
        assert_eq!(*buf.get(&[0, 0]), 0);
        assert_eq!(*buf.get(&[1, 3]), 0);
    }

    #[test]
    fn copy_in_from_offsets_into_source() {
        let mut buf = NdBuffer::filled(&[3, 3], 0u32);
        let src = ramp(&[4, 4]);
        // Take src[2.., 2..] and land it at [0,0].
        buf.copy_in_from(&Roi::new([0, 0], [2, 2]), &src, &[2, 2]);
        assert_eq!(*buf.get(&[0, 0]), 10);
        assert_eq!(*buf.get(&[1, 1]), 15);
    }

    #[test]
    fn one_dimensional_copies() {
        let mut buf = NdBuffer::filled(&[10], 0u32);
        buf.copy_in(&Roi::new([4], [7]), &ramp(&[3]));
        assert_eq!(buf.as_slice(), &[0, 0, 0, 0, 0, 1, 2, 0, 0, 0]);
    }
}
