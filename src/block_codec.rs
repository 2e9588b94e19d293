//! ZFP-style block codec (§4.5): per-block quantize, decorrelating
//! transform, negabinary-ish shuffle, and embedded bit-plane coding.
//!
//! Block dimensions are powers of two, at most 4 on each axis (`d <= 3` ⇒
//! up to 64 samples). `total_bits` is the integer width used to hold a
//! quantized coefficient (64, matching the `f64` work buffers bricks use
//! during encoding).

use crate::bitstream::{BitReader, BitWriter};
use crate::grid::V3;

pub const TOTAL_BITS: u32 = 64;

/// Everything the embedded coder produced for one block, split by the
/// *real* bit-plane (`b + EMax`) it belongs to — the unit a [`Channel`]
/// (see `channel.rs`) accumulates.
pub struct EncodedBlock {
    pub emax: i32,
    /// (real_bit_plane, bits for that plane, descending order).
    pub planes: Vec<(i32, BitWriter)>,
}

/// Number of samples in a block of the given dims (<= 64 for d <= 3, edge
/// <= 4).
pub fn block_len(dims: V3) -> usize {
    dims.product().max(1) as usize
}

/// EMax: the exponent of the largest-magnitude sample, or `i32::MIN` if
/// every sample is exactly zero (an all-zero block needs no payload).
pub fn compute_emax(samples: &[f64]) -> i32 {
    let max_abs = samples.iter().fold(0.0f64, |acc, &v| acc.max(v.abs()));
    if max_abs == 0.0 {
        i32::MIN
    } else {
        max_abs.log2().floor() as i32
    }
}

/// Precision bits available for a `d`-dimensional block per §4.5 step 1.
pub fn precision_bits(d: usize) -> u32 {
    TOTAL_BITS - 1 - d as u32
}

/// Quantize to signed integers using one shared exponent. Samples whose
/// magnitude falls below `2^(emax - precision)` round to zero.
pub fn quantize(samples: &[f64], emax: i32, precision: u32) -> Vec<i64> {
    if emax == i32::MIN {
        return vec![0i64; samples.len()];
    }
    let scale = 2f64.powi(precision as i32 - 1 - emax);
    samples.iter().map(|&v| (v * scale).round() as i64).collect()
}

pub fn dequantize(coeffs: &[i64], emax: i32, precision: u32) -> Vec<f64> {
    if emax == i32::MIN {
        return vec![0.0; coeffs.len()];
    }
    let scale = 2f64.powi(precision as i32 - 1 - emax);
    coeffs.iter().map(|&c| c as f64 / scale).collect()
}

/// A single reversible two-tap integer lift (the same predict/update pair
/// CDF 5/3 and the classic integer Haar transform both reduce to): exactly
/// invertible in integer arithmetic regardless of rounding direction,
/// because `d` is stored directly rather than reconstructed from `s`.
#[inline]
fn lift_pair(a: i64, b: i64) -> (i64, i64) {
    let d = a - b;
    let s = b + (d >> 1);
    (s, d)
}

#[inline]
fn unlift_pair(s: i64, d: i64) -> (i64, i64) {
    let b = s - (d >> 1);
    let a = d + b;
    (a, b)
}

/// Four-point decorrelating transform built from two butterfly stages of
/// [`lift_pair`] — a reversible integer lift in the spirit of ZFP's 4-tap
/// block transform, applied along one axis at a time (separable).
fn fwd_lift_4(p: &mut [i64], base: usize, s: usize) {
    let i = |k: usize| base + k * s;
    let (a0, a1, a2, a3) = (p[i(0)], p[i(1)], p[i(2)], p[i(3)]);
    let (s0, d0) = lift_pair(a0, a1);
    let (s1, d1) = lift_pair(a2, a3);
    let (s2, d2) = lift_pair(s0, s1);
    let (s3, d3) = lift_pair(d0, d1);
    p[i(0)] = s2;
    p[i(1)] = d2;
    p[i(2)] = d3;
    p[i(3)] = s3;
}

fn inv_lift_4(p: &mut [i64], base: usize, s: usize) {
    let i = |k: usize| base + k * s;
    let (s2, d2, d3, s3) = (p[i(0)], p[i(1)], p[i(2)], p[i(3)]);
    let (s0, s1) = unlift_pair(s2, d2);
    let (d0, d1) = unlift_pair(s3, d3);
    let (a0, a1) = unlift_pair(s0, d0);
    let (a2, a3) = unlift_pair(s1, d1);
    p[i(0)] = a0;
    p[i(1)] = a1;
    p[i(2)] = a2;
    p[i(3)] = a3;
}

/// Separable decorrelating transform over a `4^d` block (`d <= 3`).
pub fn decorrelate_forward(coeffs: &mut [i64], dims: V3) {
    let (nx, ny, nz) = (dims.x.max(1) as usize, dims.y.max(1) as usize, dims.z.max(1) as usize);
    if nx >= 4 {
        for z in 0..nz {
            for y in 0..ny {
                let base = z * ny * nx + y * nx;
                fwd_lift_4(coeffs, base, 1);
            }
        }
    }
    if ny >= 4 {
        for z in 0..nz {
            for x in 0..nx {
                let base = z * ny * nx + x;
                fwd_lift_4(coeffs, base, nx);
            }
        }
    }
    if nz >= 4 {
        for y in 0..ny {
            for x in 0..nx {
                let base = y * nx + x;
                fwd_lift_4(coeffs, base, ny * nx);
            }
        }
    }
}

pub fn decorrelate_inverse(coeffs: &mut [i64], dims: V3) {
    let (nx, ny, nz) = (dims.x.max(1) as usize, dims.y.max(1) as usize, dims.z.max(1) as usize);
    if nz >= 4 {
        for y in 0..ny {
            for x in 0..nx {
                let base = y * nx + x;
                inv_lift_4(coeffs, base, ny * nx);
            }
        }
    }
    if ny >= 4 {
        for z in 0..nz {
            for x in 0..nx {
                let base = z * ny * nx + x;
                inv_lift_4(coeffs, base, nx);
            }
        }
    }
    if nx >= 4 {
        for z in 0..nz {
            for y in 0..ny {
                let base = z * ny * nx + y * nx;
                inv_lift_4(coeffs, base, 1);
            }
        }
    }
}

/// Shuffle order: sample indices sorted by expected decreasing magnitude.
/// After a separable lifting transform, low-frequency (small index sum)
/// coefficients carry the most energy, so this orders by ascending index
/// sum — the same heuristic ZFP's fixed per-dimension permutation tables
/// encode, computed generically here instead of hard-coded per `d`.
pub fn shuffle_order(dims: V3) -> Vec<usize> {
    let (nx, ny, nz) = (dims.x.max(1) as usize, dims.y.max(1) as usize, dims.z.max(1) as usize);
    let mut idx: Vec<usize> = (0..nx * ny * nz).collect();
    idx.sort_by_key(|&lin| {
        let x = lin % nx;
        let y = (lin / nx) % ny;
        let z = lin / (nx * ny);
        x + y + z
    });
    idx
}

/// Encode one block's worth of samples down to (at most) the accuracy
/// cutoff. Returns the shared exponent and, per real bit-plane touched,
/// the embedded code for this block at that plane.
pub fn encode_block(samples: &[f64], dims: V3, accuracy: f64) -> EncodedBlock {
    let d = [dims.x > 1, dims.y > 1, dims.z > 1].iter().filter(|&&b| b).count().max(1);
    let precision = precision_bits(d);
    let emax = compute_emax(samples);

    if emax == i32::MIN {
        return EncodedBlock { emax, planes: Vec::new() };
    }

    let mut coeffs = quantize(samples, emax, precision);
    decorrelate_forward(&mut coeffs, dims);
    let order = shuffle_order(dims);

    let n = order.len();
    let sign = |v: i64| v < 0;
    let magnitude: Vec<u64> = order.iter().map(|&i| coeffs[i].unsigned_abs()).collect();
    let signs: Vec<bool> = order.iter().map(|&i| sign(coeffs[i])).collect();

    let mut significant = vec![false; n];
    let mut planes = Vec::new();

    for bit in (0..precision).rev() {
        let real_bp = emax - (precision as i32 - 1 - bit as i32);
        // Stop once precision exceeds the requested accuracy (§4.5).
        if (TOTAL_BITS as f64 - 6.0) > (real_bp as f64 - accuracy.log2() + 1.0) {
            break;
        }

        let mut w = BitWriter::new();
        let mut any_bits = false;
        for k in 0..n {
            let b = (magnitude[k] >> bit) & 1 == 1;
            if significant[k] {
                w.write_bits(1, b as u64);
                any_bits = true;
            } else if b {
                w.write_bits(1, 1);
                w.write_bits(1, signs[k] as u64);
                significant[k] = true;
                any_bits = true;
            } else {
                w.write_bits(1, 0);
                any_bits = true;
            }
        }
        if any_bits {
            planes.push((real_bp, w));
        }
    }

    EncodedBlock { emax, planes }
}

/// Decode a block back to floating-point samples given the planes actually
/// available (possibly a prefix of what was encoded, per progressive
/// decode). `dims` must match the dims used at encode time.
pub fn decode_block(
    emax: i32,
    dims: V3,
    plane_bits: &[(i32, &[u8], usize)], // (real_bp, bytes, bit_len), descending real_bp
) -> Vec<f64> {
    let n = block_len(dims);
    if emax == i32::MIN || plane_bits.is_empty() {
        return vec![0.0; n];
    }
    let d = [dims.x > 1, dims.y > 1, dims.z > 1].iter().filter(|&&b| b).count().max(1);
    let precision = precision_bits(d);

    let mut magnitude = vec![0u64; n];
    let mut signs = vec![false; n];
    let mut significant = vec![false; n];

    for &(real_bp, bytes, bit_len) in plane_bits {
        let bit = (real_bp - emax) + precision as i32 - 1;
        if bit < 0 || bit as u32 >= precision {
            continue;
        }
        let mut r = BitReader::new(bytes);
        let mut consumed = 0usize;
        for k in 0..n {
            if consumed >= bit_len {
                break;
            }
            if significant[k] {
                let b = r.read_bits(1).unwrap_or(0);
                consumed += 1;
                if b == 1 {
                    magnitude[k] |= 1u64 << bit;
                }
            } else {
                let b = r.read_bits(1).unwrap_or(0);
                consumed += 1;
                if b == 1 {
                    magnitude[k] |= 1u64 << bit;
                    significant[k] = true;
                    if consumed < bit_len {
                        let s = r.read_bits(1).unwrap_or(0);
                        consumed += 1;
                        signs[k] = s == 1;
                    }
                }
            }
        }
    }

    let order = shuffle_order(dims);
    let mut coeffs = vec![0i64; n];
    for (k, &lin) in order.iter().enumerate() {
        let mag = magnitude[k] as i64;
        coeffs[lin] = if signs[k] { -mag } else { mag };
    }

    decorrelate_inverse(&mut coeffs, dims);
    dequantize(&coeffs, emax, precision)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lift_round_trip() {
        let mut data = vec![3i64, -5, 100, -2];
        let orig = data.clone();
        fwd_lift_4(&mut data, 0, 1);
        inv_lift_4(&mut data, 0, 1);
        assert_eq!(data, orig);
    }

    #[test]
    fn decorrelate_round_trip_3d() {
        let dims = V3::new(4, 4, 4);
        let mut coeffs: Vec<i64> = (0..64).map(|i| (i * 7 - 31) as i64).collect();
        let orig = coeffs.clone();
        decorrelate_forward(&mut coeffs, dims);
        decorrelate_inverse(&mut coeffs, dims);
        assert_eq!(coeffs, orig);
    }

    #[test]
    fn all_zero_block_has_no_planes() {
        let samples = vec![0.0f64; 64];
        let enc = encode_block(&samples, V3::new(4, 4, 4), 1e-6);
        assert_eq!(enc.emax, i32::MIN);
        assert!(enc.planes.is_empty());
    }

    #[test]
    fn constant_block_decodes_near_exact() {
        let samples = vec![3.14f64; 64];
        let dims = V3::new(4, 4, 4);
        let enc = encode_block(&samples, dims, 1e-6);
        let plane_refs: Vec<(i32, &[u8], usize)> = enc
            .planes
            .iter()
            .map(|(bp, w)| (*bp, w.as_bytes(), w.size_bits()))
            .collect();
        let decoded = decode_block(enc.emax, dims, &plane_refs);
        for v in decoded {
            assert!((v - 3.14).abs() < 1e-3, "{v}");
        }
    }

    #[test]
    fn bitplane_monotonicity() {
        let mut samples = vec![0.0f64; 64];
        samples[5] = 12.5;
        samples[40] = -3.25;
        let dims = V3::new(4, 4, 4);
        let enc = encode_block(&samples, dims, 1e-9);
        let mut prev_err = f64::INFINITY;
        for take in 1..=enc.planes.len() {
            let plane_refs: Vec<(i32, &[u8], usize)> = enc.planes[..take]
                .iter()
                .map(|(bp, w)| (*bp, w.as_bytes(), w.size_bits()))
                .collect();
            let decoded = decode_block(enc.emax, dims, &plane_refs);
            let err = decoded
                .iter()
                .zip(samples.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max);
            assert!(err <= prev_err + 1e-12, "plane {take}: err {err} > prev {prev_err}");
            prev_err = err;
        }
    }
}
