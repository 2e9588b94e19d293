//! Brick pipeline (§4.6): extrapolate a brick's raw samples into an
//! extended work buffer, run the level's wavelet steps, route the
//! low-pass subband into the next coarser level's brick, and hand every
//! other subband to [`crate::block_codec`] and on into the per-(level,
//! sub-level, bit-plane) [`Channel`]s.

use std::collections::HashMap;

use crate::address::channel_key;
use crate::block_codec::encode_block;
use crate::channel::{Channel, SubChannel};
use crate::grid::{Grid, V3};
use crate::subband::{build_level_subbands, Cdf53Norms, TransformTemplate};
use crate::wavelet::flift_cdf53;

/// One brick's extended work buffer: `dims` is `BrickDims` plus one sample
/// of headroom on every axis with extent > 1, matching what
/// [`crate::wavelet::flift_cdf53`] needs to write its extrapolated sample.
#[derive(Debug, Clone)]
pub struct Brick {
    pub dims: V3,
    pub data: Vec<f64>,
}

impl Brick {
    pub fn new(dims_ext: V3) -> Self {
        Self { dims: dims_ext, data: vec![0.0; dims_ext.product() as usize] }
    }
}

/// `BrickDimsExt`: brick dimensions widened by one sample on every axis
/// wider than 1, so the forward lift has room to write its extrapolated
/// boundary sample (§4.3).
pub fn brick_dims_ext(brick_dims: V3) -> V3 {
    V3::new(
        if brick_dims.x > 1 { brick_dims.x + 1 } else { brick_dims.x },
        if brick_dims.y > 1 { brick_dims.y + 1 } else { brick_dims.y },
        if brick_dims.z > 1 { brick_dims.z + 1 } else { brick_dims.z },
    )
}

/// Lazily-created, per-(level, brick index) pool. A brick is created the
/// first time a finer level's low-pass subband is routed into it, and
/// removed once it has itself been fully transformed and emitted.
#[derive(Debug, Default)]
pub struct BrickPool {
    bricks: HashMap<(i8, u64), Brick>,
}

impl BrickPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, level: i8, brick_index: u64, dims_ext: V3) -> &mut Brick {
        self.bricks.entry((level, brick_index)).or_insert_with(|| Brick::new(dims_ext))
    }

    pub fn take(&mut self, level: i8, brick_index: u64) -> Option<Brick> {
        self.bricks.remove(&(level, brick_index))
    }

    /// Peek without removing — lets a driver decide whether a coarser
    /// level's brick received any contribution before bothering to encode it.
    pub fn contains(&self, level: i8, brick_index: u64) -> bool {
        self.bricks.contains_key(&(level, brick_index))
    }

    pub fn len(&self) -> usize {
        self.bricks.len()
    }
}

/// Tile a grid into sub-blocks no wider than `max_edge` on any axis —
/// the unit [`crate::block_codec`] operates on.
pub(crate) fn iter_blocks(grid: &Grid, max_edge: i32) -> Vec<Grid> {
    let mut out = vec![*grid];
    for axis in 0..3 {
        let mut next = Vec::new();
        for g in out {
            let d = g.dims.get(axis);
            if d <= max_edge {
                next.push(g);
                continue;
            }
            let mut offset = 0;
            while offset < d {
                let len = (d - offset).min(max_edge);
                let mut piece = g;
                piece.from.set(axis, g.from.get(axis) + g.spacing.get(axis) * offset);
                piece.dims.set(axis, len);
                next.push(piece);
                offset += len;
            }
        }
        out = next;
    }
    out
}

/// Gather a block's samples out of a brick's extended buffer. Shared with
/// `decode.rs`, which gathers a coarser level's reconstructed data to seed
/// a finer level's low-pass subband slot.
pub(crate) fn gather(buf: &[f64], n: V3, grid: &Grid) -> Vec<f64> {
    grid.iter_offsets(n).map(|off| buf[off as usize]).collect()
}

pub(crate) fn scatter(buf: &mut [f64], n: V3, grid: &Grid, values: &[f64]) {
    for (off, &v) in grid.iter_offsets(n).zip(values.iter()) {
        buf[off as usize] = v;
    }
}

/// Accumulated outputs of one `encode_brick` call: bit-plane channels and
/// per-subband exponent sub-channels, keyed the same way a [`crate::decode`]
/// pass will look them up.
pub struct EncodeSinks<'a> {
    pub channels: &'a mut HashMap<u32, Channel>,
    pub subchannels: &'a mut HashMap<u32, SubChannel>,
}

/// Encode one brick at `level`, given its raw (non-extended) samples.
/// Recurses into coarser levels once every sibling brick feeding a given
/// parent has contributed its low-pass subband.
///
/// Simplification (recorded in the design ledger): each level's brick grid
/// has the same brick-count as the next, so the low-pass subband maps
/// directly onto one parent brick rather than accumulating several
/// children — the general child-counting merge a non-uniform brick grid
/// would need is not implemented.
#[allow(clippy::too_many_arguments)]
pub fn encode_brick(
    brick_index: u64,
    level: i8,
    brick_dims: V3,
    samples: &[f64],
    template: &TransformTemplate,
    norms: &Cdf53Norms,
    num_levels: usize,
    accuracy: f64,
    pool: &mut BrickPool,
    sinks: &mut EncodeSinks,
) {
    let dims_ext = brick_dims_ext(brick_dims);
    let mut brick = pool.take(level, brick_index).unwrap_or_else(|| Brick::new(dims_ext));
    debug_assert_eq!(brick.dims, dims_ext);

    if level == 1 {
        let raw_grid = Grid::new(V3::ZEROS, brick_dims, V3::ONES);
        scatter(&mut brick.data, dims_ext, &raw_grid, samples);
    }
    // At coarser levels the buffer already holds the accumulated low-pass
    // contribution from `take` above; `samples` is ignored.

    let tlevel = level as usize;
    let grid_full = Grid::new(V3::ZEROS, brick_dims, V3::ONES);
    let bound = brick_dims;

    for step in template.steps_for_level(tlevel) {
        flift_cdf53(&mut brick.data, dims_ext, step.axis as usize, &grid_full, bound);
    }

    let subbands = build_level_subbands(brick_dims, V3::ONES, template, tlevel, norms);

    for (sub_level, sb) in subbands.iter().enumerate() {
        if sb.is_lowpass() && (level as usize) < num_levels {
            let parent_dims_ext = brick_dims_ext(sb.local_grid.dims);
            let parent = pool.get_or_create(level + 1, brick_index, parent_dims_ext);
            let local = gather(&brick.data, dims_ext, &sb.local_grid);
            let dest_grid = Grid::new(V3::ZEROS, sb.local_grid.dims, V3::ONES);
            scatter(&mut parent.data, parent_dims_ext, &dest_grid, &local);
            continue;
        }

        // The coarsest level's own low-pass subband (subband 0) is the DC
        // term of the whole field and has no parent to route into —
        // block-code and persist it like any other subband instead of
        // discarding it, so a decode can stop at the coarsest level.
        for block_grid in iter_blocks(&sb.local_grid, 4) {
            if block_grid.num_samples() == 0 {
                continue;
            }
            let block_samples = gather(&brick.data, dims_ext, &block_grid);
            let enc = encode_block(&block_samples, block_grid.dims, accuracy);

            let sc_key = channel_key(level, sub_level as i8, 0);
            sinks.subchannels.entry(sc_key).or_insert_with(SubChannel::new).add_exponent(brick_index, enc.emax);

            for (real_bp, writer) in &enc.planes {
                let key = channel_key(level, sub_level as i8, *real_bp as i16);
                sinks.channels.entry(key).or_insert_with(Channel::new).add_block(brick_index, writer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brick_dims_ext_widens_non_unit_axes() {
        assert_eq!(brick_dims_ext(V3::new(8, 8, 8)), V3::new(9, 9, 9));
        assert_eq!(brick_dims_ext(V3::new(8, 8, 1)), V3::new(9, 9, 1));
    }

    #[test]
    fn single_level_brick_produces_channel_output() {
        let template = TransformTemplate::parse(":210").unwrap();
        let norms = Cdf53Norms::compute();
        let dims = V3::new(8, 8, 8);
        let samples: Vec<f64> = (0..dims.product()).map(|i| (i % 13) as f64 - 6.0).collect();

        let mut pool = BrickPool::new();
        let mut channels = HashMap::new();
        let mut subchannels = HashMap::new();
        {
            let mut sinks = EncodeSinks { channels: &mut channels, subchannels: &mut subchannels };
            encode_brick(0, 1, dims, &samples, &template, &norms, 1, 1e-3, &mut pool, &mut sinks);
        }

        assert!(!channels.is_empty(), "expected at least one bit-plane channel to receive data");
        assert!(!subchannels.is_empty());
    }

    #[test]
    fn lowpass_subband_feeds_next_level_pool() {
        let template = TransformTemplate::parse(":210:210").unwrap();
        let norms = Cdf53Norms::compute();
        let dims = V3::new(8, 8, 8);
        let samples: Vec<f64> = vec![1.0; dims.product() as usize];

        let mut pool = BrickPool::new();
        let mut channels = HashMap::new();
        let mut subchannels = HashMap::new();
        {
            let mut sinks = EncodeSinks { channels: &mut channels, subchannels: &mut subchannels };
            encode_brick(0, 1, dims, &samples, &template, &norms, 2, 1e-3, &mut pool, &mut sinks);
        }
        assert_eq!(pool.len(), 1, "level-1 lowpass subband should seed a level-2 brick");
    }

    #[test]
    fn coarsest_level_lowpass_is_block_coded_not_discarded() {
        let template = TransformTemplate::parse(":210").unwrap();
        let norms = Cdf53Norms::compute();
        let dims = V3::new(8, 8, 8);
        let samples: Vec<f64> = (0..dims.product()).map(|i| (i % 13) as f64 - 6.0).collect();

        let mut pool = BrickPool::new();
        let mut channels = HashMap::new();
        let mut subchannels = HashMap::new();
        {
            let mut sinks = EncodeSinks { channels: &mut channels, subchannels: &mut subchannels };
            // num_levels == level, so subband 0 has no parent to route into.
            encode_brick(0, 1, dims, &samples, &template, &norms, 1, 1e-3, &mut pool, &mut sinks);
        }
        let lowpass_key = channel_key(1, 0, 0);
        assert!(
            subchannels.contains_key(&lowpass_key),
            "coarsest level's lowpass subband should have its own exponent sub-channel"
        );
        assert!(pool.len() == 0, "no parent brick should be created at the coarsest level");
    }
}
