//! CDF 5/3 lifting wavelet transform (§4.3), parametrized on axis index
//! instead of the teacher-language's per-axis macro expansion: the predict/
//! update loop is written once and monomorphized by passing the row-stride
//! triple for whichever axis is active.

use crate::grid::{Grid, V3};

/// Update-step variant (§4.3). `PartialUpdateLast`'s inverse is undefined in
/// the reference implementation this crate is grounded on — see
/// [`ILiftCdf53`]'s doc comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiftOption {
    Normal,
    PartialUpdateLast,
    NoUpdateLast,
    NoUpdate,
}

#[inline]
fn row_index(p: V3, n: V3) -> i64 {
    p.z as i64 * n.y as i64 * n.x as i64 + p.y as i64 * n.x as i64 + p.x as i64
}

/// Forward CDF 5/3 lift along `axis`, operating in place on `data` (a dense
/// buffer of dimensions `n`). `grid` supplies `(From, Dims, Spacing)` for the
/// axis being lifted (the other two axes are iterated in full per `grid`'s
/// extent on those axes); `m` is the logical end per axis beyond which
/// samples are clamped (used for extrapolation bookkeeping).
///
/// Preconditions (debug-asserted): `spacing` is a power of two on every
/// axis, `dims >= 2` on `axis`, `from` is even on `axis`, and
/// `from + spacing*(dims-2) < m` on `axis`.
pub fn flift_cdf53(data: &mut [f64], n: V3, axis: usize, grid: &Grid, m: V3) {
    flift_cdf53_opt(data, n, axis, grid, m, LiftOption::Normal)
}

pub fn flift_cdf53_opt(data: &mut [f64], n: V3, axis: usize, grid: &Grid, m: V3, opt: LiftOption) {
    let p = grid.from;
    let d = grid.dims;
    let s = grid.spacing;
    let da = d.get(axis);
    if da == 1 {
        return;
    }
    debug_assert!(grid.spacing.is_pow2());
    debug_assert!(da >= 2);
    debug_assert!(p.get(axis) % 2 == 0);
    debug_assert!(p.get(axis) + s.get(axis) * (da - 2) < m.get(axis));

    let pa = p.get(axis);
    let sa = s.get(axis);
    let ma = m.get(axis);

    let x0 = (pa + sa * da).min(ma); // extrapolated position
    let x1 = (pa + sa * (da - 1)).min(ma); // last position
    let x2 = pa + sa * (da - 2); // second last
    let x3 = pa + sa * (da - 3); // third last
    let ext = da % 2 == 0;

    let (other1, other2) = other_axes(axis);
    let from1 = p.get(other1);
    let to1 = p.get(other1) + s.get(other1) * d.get(other1);
    let step1 = s.get(other1).max(1);
    let from2 = p.get(other2);
    let to2 = p.get(other2) + s.get(other2) * d.get(other2);
    let step2 = s.get(other2).max(1);

    let mut o1 = from1;
    while o1 < to1 {
        let oo1 = o1.min(m.get(other1));
        let mut o2 = from2;
        while o2 < to2 {
            let oo2 = o2.min(m.get(other2));

            let mut at = |pos: i32| -> i64 {
                let mut v = V3::ZEROS;
                v.set(axis, pos);
                v.set(other1, oo1);
                v.set(other2, oo2);
                row_index(v, n)
            };

            if ext {
                debug_assert!(ma < n.get(axis));
                let a = data[at(x2) as usize];
                let b = data[at(x1) as usize];
                let idx = at(x0) as usize;
                data[idx] = 2.0 * b - a;
            }

            // Predict, excluding the last odd position.
            let mut x = pa + sa;
            while x < pa + sa * (da - 2) {
                let xm = at(x - sa) as usize;
                let xc = at(x) as usize;
                let xp = at(x + sa) as usize;
                data[xc] -= (data[xm] + data[xp]) / 2.0;
                x += 2 * sa;
            }

            if !ext {
                let i2 = at(x2) as usize;
                let i1 = at(x1) as usize;
                let i3 = at(x3) as usize;
                data[i2] -= (data[i1] + data[i3]) / 2.0;
            } else if x1 < ma {
                let i1 = at(x1) as usize;
                data[i1] = 0.0;
            }

            if opt != LiftOption::NoUpdate {
                let mut x = pa + sa;
                while x < pa + sa * (da - 2) {
                    let xm = at(x - sa) as usize;
                    let xc = at(x) as usize;
                    let xp = at(x + sa) as usize;
                    let val = data[xc];
                    data[xm] += val / 4.0;
                    data[xp] += val / 4.0;
                    x += 2 * sa;
                }
                if !ext {
                    let i2 = at(x2) as usize;
                    let i3 = at(x3) as usize;
                    let i1 = at(x1) as usize;
                    let val = data[i2];
                    data[i3] += val / 4.0;
                    match opt {
                        LiftOption::Normal => data[i1] += val / 4.0,
                        LiftOption::PartialUpdateLast => data[i1] = val / 4.0,
                        _ => {}
                    }
                }
            }

            o2 += step2;
        }
        o1 += step1;
    }
}

/// Inverse CDF 5/3 lift along `axis`. Reverses update, then predict, then
/// (if the forward pass extrapolated) reconstructs the boundary sample.
///
/// `PartialUpdateLast` has no defined inverse in the reference this crate
/// is grounded on (`Wavelet.h`'s `ILiftCdf53` macro is annotated "does not
/// make use of PartialUpdateLast"); calling this with that option panics
/// rather than silently producing a wrong reconstruction.
pub fn ilift_cdf53_opt(data: &mut [f64], n: V3, axis: usize, grid: &Grid, m: V3, opt: LiftOption) {
    assert_ne!(opt, LiftOption::PartialUpdateLast, "PartialUpdateLast has no defined inverse");

    let p = grid.from;
    let d = grid.dims;
    let s = grid.spacing;
    let da = d.get(axis);
    if da == 1 {
        return;
    }

    let pa = p.get(axis);
    let sa = s.get(axis);
    let ma = m.get(axis);

    let x0 = (pa + sa * da).min(ma);
    let x1 = (pa + sa * (da - 1)).min(ma);
    let x2 = pa + sa * (da - 2);
    let x3 = pa + sa * (da - 3);
    let ext = da % 2 == 0;

    let (other1, other2) = other_axes(axis);
    let from1 = p.get(other1);
    let to1 = p.get(other1) + s.get(other1) * d.get(other1);
    let step1 = s.get(other1).max(1);
    let from2 = p.get(other2);
    let to2 = p.get(other2) + s.get(other2) * d.get(other2);
    let step2 = s.get(other2).max(1);

    let mut o1 = from1;
    while o1 < to1 {
        let oo1 = o1.min(m.get(other1));
        let mut o2 = from2;
        while o2 < to2 {
            let oo2 = o2.min(m.get(other2));

            let mut at = |pos: i32| -> i64 {
                let mut v = V3::ZEROS;
                v.set(axis, pos);
                v.set(other1, oo1);
                v.set(other2, oo2);
                row_index(v, n)
            };

            // Undo update.
            if opt != LiftOption::NoUpdate {
                let mut x = pa + sa;
                while x < pa + sa * (da - 2) {
                    let xm = at(x - sa) as usize;
                    let xc = at(x) as usize;
                    let xp = at(x + sa) as usize;
                    let val = data[xc];
                    data[xm] -= val / 4.0;
                    data[xp] -= val / 4.0;
                    x += 2 * sa;
                }
                if !ext && opt == LiftOption::Normal {
                    let i2 = at(x2) as usize;
                    let i3 = at(x3) as usize;
                    let i1 = at(x1) as usize;
                    let val = data[i2];
                    data[i3] -= val / 4.0;
                    data[i1] -= val / 4.0;
                } else if !ext {
                    let i2 = at(x2) as usize;
                    let i3 = at(x3) as usize;
                    let val = data[i2];
                    data[i3] -= val / 4.0;
                }
            }

            // Undo predict.
            let mut x = pa + sa;
            while x < pa + sa * (da - 2) {
                let xm = at(x - sa) as usize;
                let xc = at(x) as usize;
                let xp = at(x + sa) as usize;
                data[xc] += (data[xm] + data[xp]) / 2.0;
                x += 2 * sa;
            }
            if !ext {
                let i2 = at(x2) as usize;
                let i1 = at(x1) as usize;
                let i3 = at(x3) as usize;
                data[i2] += (data[i1] + data[i3]) / 2.0;
            } else if ext && x1 < ma {
                // Forward set F[x0] = 2*F[x1] - F[x2] from the original
                // values; F[x2] is untouched by predict/update in the
                // extrapolated case, so solving for the zeroed F[x1] gives:
                let i0 = at(x0) as usize;
                let i1 = at(x1) as usize;
                let i2 = at(x2) as usize;
                data[i1] = (data[i0] + data[i2]) / 2.0;
            }

            o2 += step2;
        }
        o1 += step1;
    }
}

pub fn ilift_cdf53(data: &mut [f64], n: V3, axis: usize, grid: &Grid, m: V3) {
    ilift_cdf53_opt(data, n, axis, grid, m, LiftOption::Normal)
}

#[inline]
fn other_axes(axis: usize) -> (usize, usize) {
    match axis {
        0 => (1, 2),
        1 => (0, 2),
        2 => (0, 1),
        _ => panic!("axis out of range: {axis}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_grid(dims: V3) -> Grid {
        Grid::new(V3::ZEROS, dims, V3::ONES)
    }

    #[test]
    fn invertible_1d_even() {
        // Even extent: the forward pass extrapolates one sample beyond M,
        // so the backing buffer must have room for it (BrickDimsExt).
        let m = V3::new(8, 1, 1);
        let n = V3::new(9, 1, 1);
        let mut data: Vec<f64> = (0..8).map(|i| i as f64).collect();
        data.push(0.0);
        let original = data.clone();
        let g = Grid::new(V3::ZEROS, V3::new(8, 1, 1), V3::ONES);
        flift_cdf53(&mut data, n, 0, &g, m);
        ilift_cdf53(&mut data, n, 0, &g, m);
        for (a, b) in data.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-9, "{a} != {b}");
        }
    }

    #[test]
    fn invertible_1d_odd() {
        let n = V3::new(9, 1, 1);
        let mut data: Vec<f64> = (0..9).map(|i| (i * i) as f64).collect();
        let original = data.clone();
        let g = Grid::new(V3::ZEROS, V3::new(9, 1, 1), V3::ONES);
        flift_cdf53(&mut data, n, 0, &g, n);
        ilift_cdf53(&mut data, n, 0, &g, n);
        for (a, b) in data.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-9, "{a} != {b}");
        }
    }

    #[test]
    fn invertible_3d() {
        // Odd extent on every axis: no extrapolation needed.
        let n = V3::new(9, 9, 9);
        let mut data: Vec<f64> = (0..729).map(|i| (i % 17) as f64 * 0.37).collect();
        let original = data.clone();
        let g = make_grid(n);
        for axis in [0, 1, 2] {
            flift_cdf53(&mut data, n, axis, &g, n);
        }
        for axis in [2, 1, 0] {
            ilift_cdf53(&mut data, n, axis, &g, n);
        }
        for (a, b) in data.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-6, "{a} != {b}");
        }
    }

    #[test]
    fn boundary_zero_on_even_extent() {
        let n = V3::new(8, 1, 1);
        let mut data: Vec<f64> = (0..8).map(|i| i as f64).collect();
        let g = make_grid(n);
        flift_cdf53(&mut data, n, 0, &g, n);
        // Last odd position (index 7) must be exactly zero per §4.3 step 2.
        assert_eq!(data[7], 0.0);
    }

    #[test]
    #[should_panic]
    fn partial_update_last_inverse_panics() {
        let n = V3::new(8, 1, 1);
        let mut data: Vec<f64> = (0..8).map(|i| i as f64).collect();
        let g = make_grid(n);
        ilift_cdf53_opt(&mut data, n, 0, &g, n, LiftOption::PartialUpdateLast);
    }
}
