//! Grid algebra (§4.2): strided axis-aligned sub-regions of a volume.
//!
//! A [`Grid`] is the triple `(From, Dims, Spacing)`. Grids compose
//! (crop/split/merge) without copying the underlying data — they only ever
//! describe offsets and strides into a backing buffer.

use std::ops::{Add, Mul, Sub};

pub const MAX_DIMS: usize = 3;

/// A 3-component integer vector. Axes beyond the volume's actual
/// dimensionality carry the neutral value for their role (1 for Dims, 0 for
/// From/Spacing), so 1D/2D volumes are just 3D volumes with trivial axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct V3 {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl V3 {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub const fn splat(v: i32) -> Self {
        Self { x: v, y: v, z: v }
    }

    pub const ONES: V3 = V3::splat(1);
    pub const ZEROS: V3 = V3::splat(0);

    #[inline]
    pub fn get(&self, axis: usize) -> i32 {
        match axis {
            0 => self.x,
            1 => self.y,
            2 => self.z,
            _ => panic!("axis out of range: {axis}"),
        }
    }

    #[inline]
    pub fn set(&mut self, axis: usize, v: i32) {
        match axis {
            0 => self.x = v,
            1 => self.y = v,
            2 => self.z = v,
            _ => panic!("axis out of range: {axis}"),
        }
    }

    #[inline]
    pub fn product(&self) -> i64 {
        self.x as i64 * self.y as i64 * self.z as i64
    }

    #[inline]
    pub fn max_component(&self) -> i32 {
        self.x.max(self.y).max(self.z)
    }

    #[inline]
    pub fn is_pow2(&self) -> bool {
        [self.x, self.y, self.z].iter().all(|v| *v > 0 && (*v & (*v - 1)) == 0)
    }
}

impl Add for V3 {
    type Output = V3;
    fn add(self, rhs: V3) -> V3 {
        V3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}
impl Sub for V3 {
    type Output = V3;
    fn sub(self, rhs: V3) -> V3 {
        V3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}
impl Mul for V3 {
    type Output = V3;
    fn mul(self, rhs: V3) -> V3 {
        V3::new(self.x * rhs.x, self.y * rhs.y, self.z * rhs.z)
    }
}

/// A regular sub-lattice: `From + Spacing * i` for `i` in `0..Dims` on each
/// axis. Invariant: `From + Spacing*(Dims-1)` lies within the enclosing
/// volume/brick the grid was cropped against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    pub from: V3,
    pub dims: V3,
    pub spacing: V3,
}

impl Grid {
    pub fn new(from: V3, dims: V3, spacing: V3) -> Self {
        Self { from, dims, spacing }
    }

    /// The enclosing volume/brick this grid is defined over must have this
    /// minimum size for `from + spacing*(dims-1)` to be in-bounds.
    pub fn last(&self) -> V3 {
        self.from + self.spacing * (self.dims - V3::ONES)
    }

    /// True when `self`'s last sample lies strictly inside `bound` (the
    /// dimensions of the enclosing volume/brick).
    pub fn contained_in(&self, bound: V3) -> bool {
        let last = self.last();
        last.x < bound.x && last.y < bound.y && last.z < bound.z
            && self.from.x >= 0 && self.from.y >= 0 && self.from.z >= 0
    }

    /// Number of samples this grid describes.
    pub fn num_samples(&self) -> i64 {
        self.dims.product()
    }

    /// Linear offset of the sample at local grid index `idx` (each
    /// component in `0..dims`) into a backing volume of dimensions `n`.
    #[inline]
    pub fn linear_offset(&self, idx: V3, n: V3) -> i64 {
        let p = self.from + self.spacing * idx;
        p.z as i64 * n.y as i64 * n.x as i64 + p.y as i64 * n.x as i64 + p.x as i64
    }

    /// Iterate every grid-local index in `0..dims` in row-major (z slowest,
    /// x fastest) order, yielding the linear offset into a volume of
    /// dimensions `n`.
    pub fn iter_offsets(&self, n: V3) -> impl Iterator<Item = i64> + '_ {
        let g = *self;
        (0..g.dims.z).flat_map(move |z| {
            (0..g.dims.y).flat_map(move |y| {
                (0..g.dims.x).map(move |x| g.linear_offset(V3::new(x, y, z), n))
            })
        })
    }

    /// Largest sub-grid of `self` contained within `extent` (also a grid
    /// sharing `self`'s spacing), clipped to non-negative local indices.
    pub fn crop(&self, extent: &Grid) -> Grid {
        debug_assert_eq!(self.spacing, extent.spacing, "crop requires matching spacing");
        let mut new_from = self.from;
        let mut new_dims = self.dims;
        for axis in 0..MAX_DIMS {
            let s = self.spacing.get(axis);
            let self_from = self.from.get(axis);
            let self_last = self_from + s * (self.dims.get(axis) - 1);
            let ext_from = extent.from.get(axis);
            let ext_last = extent.from.get(axis) + s * (extent.dims.get(axis) - 1);

            let lo = self_from.max(ext_from);
            let hi = self_last.min(ext_last);
            if hi < lo {
                new_from.set(axis, self_from);
                new_dims.set(axis, 0);
                continue;
            }
            // Snap lo up to the next point on self's lattice.
            let rem = (lo - self_from).rem_euclid(s.max(1));
            let snapped_lo = if rem == 0 { lo } else { lo + (s - rem) };
            let count = if snapped_lo > hi { 0 } else { (hi - snapped_lo) / s + 1 };
            new_from.set(axis, snapped_lo);
            new_dims.set(axis, count);
        }
        Grid::new(new_from, new_dims, self.spacing)
    }

    /// Split `self` along `axis` into even-indexed (scaling) and
    /// odd-indexed (wavelet) sub-lattices, as one level of lifting would.
    pub fn split_alternate(&self, axis: usize) -> (Grid, Grid) {
        let s = self.spacing.get(axis);
        let d = self.dims.get(axis);
        let from = self.from.get(axis);

        let even_count = (d + 1) / 2;
        let odd_count = d / 2;

        let mut even = *self;
        even.dims.set(axis, even_count);
        even.spacing.set(axis, s * 2);

        let mut odd = *self;
        odd.from.set(axis, from + s);
        odd.dims.set(axis, odd_count);
        odd.spacing.set(axis, s * 2);

        (even, odd)
    }

    /// Enclosing grid of two subbands produced by one lifting split along
    /// `axis`: the union of `g1` and `g2`'s lattices, assumed compatible
    /// (same spacing on every other axis, interleaved on `axis`).
    pub fn merge_subbands(g1: &Grid, g2: &Grid, axis: usize) -> Grid {
        let s1 = g1.spacing.get(axis);
        let merged_spacing = s1 / 2;
        debug_assert_eq!(merged_spacing, g2.spacing.get(axis) / 2);

        let from = g1.from.get(axis).min(g2.from.get(axis));
        let last1 = g1.from.get(axis) + g1.spacing.get(axis) * (g1.dims.get(axis) - 1).max(0);
        let last2 = g2.from.get(axis) + g2.spacing.get(axis) * (g2.dims.get(axis) - 1).max(0);
        let last = last1.max(last2);
        let dims = if merged_spacing > 0 { (last - from) / merged_spacing + 1 } else { g1.dims.get(axis) + g2.dims.get(axis) };

        let mut out = *g1;
        out.from.set(axis, from);
        out.dims.set(axis, dims);
        out.spacing.set(axis, merged_spacing);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_alternate_conserves_samples() {
        let g = Grid::new(V3::ZEROS, V3::new(8, 1, 1), V3::ONES);
        let (even, odd) = g.split_alternate(0);
        assert_eq!(even.dims.x + odd.dims.x, g.dims.x);
    }

    #[test]
    fn crop_contained() {
        let vol = Grid::new(V3::ZEROS, V3::new(64, 64, 64), V3::ONES);
        let sub = Grid::new(V3::new(4, 4, 4), V3::new(8, 8, 8), V3::ONES);
        let cropped = vol.crop(&sub);
        assert_eq!(cropped.dims, sub.dims);
        assert_eq!(cropped.from, sub.from);
    }

    #[test]
    fn grid_contained_invariant() {
        let g = Grid::new(V3::ZEROS, V3::new(4, 4, 4), V3::ONES);
        // last index is 3 on every axis: strictly less than bound 4.
        assert!(g.contained_in(V3::new(4, 4, 4)));
        assert!(!g.contained_in(V3::new(3, 4, 4)));
    }

    #[test]
    fn linear_offset_row_major() {
        let n = V3::new(4, 4, 4);
        let g = Grid::new(V3::ZEROS, n, V3::ONES);
        let offsets: Vec<i64> = g.iter_offsets(n).collect();
        assert_eq!(offsets[0], 0);
        assert_eq!(offsets[1], 1);
        assert_eq!(offsets[4], 4);
        assert_eq!(offsets[16], 16);
    }
}
