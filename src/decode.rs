//! Decoder (§4.9): bound brick visitation to the bricks that intersect the
//! requested sub-extent via `traverse_bricks`, pull each visited brick's
//! channel/sub-channel payloads back from disk through random lookup into
//! its chunk's delta-decoded brick-index list (rather than replaying every
//! brick before it), and reconstruct samples top-down from the coarsest
//! persisted level to the requested one.

use std::collections::HashMap;

use tracing::info_span;

use crate::address::{chunk_address, file_address, rounded_group_size, traverse_bricks, FileKind, GroupingFlags, TraversalOrder};
use crate::bitstream::{BitReader, BitWriter};
use crate::block_codec::{decode_block, precision_bits, TOTAL_BITS};
use crate::brick::{brick_dims_ext, gather, iter_blocks, scatter, Brick};
use crate::channel::{unframe_exponents, ChunkPayload};
use crate::error::{Idx2Error, Idx2Result};
use crate::file_io::FileCache;
use crate::grid::{Grid, V3};
use crate::idx2_file::Idx2File;
use crate::observer::Stats;
use crate::params::DecodeParams;
use crate::subband::{build_level_subbands, lowpass_dims};
use crate::wavelet::ilift_cdf53;

/// One chunk's bricks, delta-decoded back into an ascending index list,
/// alongside the per-brick bit-lengths needed to slice `stream` without
/// touching any other brick's bits.
struct ParsedChunk {
    bricks: Vec<u64>,
    sizes: Vec<usize>,
    stream: Vec<u8>,
}

impl ParsedChunk {
    fn parse(raw: &[u8]) -> Idx2Result<Self> {
        let (num_bricks, deltas, sizes_bytes, stream) = ChunkPayload::unframe(raw)?;
        let bricks = decode_delta_list(&deltas, num_bricks)?;
        let mut sr = BitReader::new(&sizes_bytes);
        let mut sizes = Vec::with_capacity(num_bricks as usize);
        for _ in 0..num_bricks {
            sizes.push(sr.read_varbyte()? as usize);
        }
        Ok(Self { bricks, sizes, stream })
    }

    /// `(bytes, exact_bit_length)` for one brick's block payload, or `None`
    /// if this chunk doesn't cover that brick.
    fn bits_for(&self, brick: u64) -> Option<(Vec<u8>, usize)> {
        let pos = self.bricks.binary_search(&brick).ok()?;
        let offset: usize = self.sizes[..pos].iter().sum();
        let len = self.sizes[pos];
        Some((extract_bits(&self.stream, offset, len), len))
    }
}

/// One sub-channel chunk's bricks plus their shared exponents.
struct ParsedExponentChunk {
    bricks: Vec<u64>,
    exponents: Vec<i32>,
}

impl ParsedExponentChunk {
    fn parse(raw: &[u8]) -> Idx2Result<Self> {
        let (num_bricks, deltas, exp_bytes) = unframe_exponents(raw)?;
        let bricks = decode_delta_list(&deltas, num_bricks)?;
        let mut er = BitReader::new(&exp_bytes);
        let mut exponents = Vec::with_capacity(num_bricks as usize);
        for _ in 0..num_bricks {
            let z = er.read_varbyte()?;
            exponents.push(((z >> 1) as i32) ^ -((z & 1) as i32));
        }
        Ok(Self { bricks, exponents })
    }

    fn emax_for(&self, brick: u64) -> Option<i32> {
        let pos = self.bricks.binary_search(&brick).ok()?;
        Some(self.exponents[pos])
    }
}

fn decode_delta_list(deltas: &[u8], num_bricks: u32) -> Idx2Result<Vec<u64>> {
    let mut r = BitReader::new(deltas);
    let mut out = Vec::with_capacity(num_bricks as usize);
    let mut prev = 0u64;
    for i in 0..num_bricks {
        let d = r.read_varbyte()?;
        let b = if i == 0 { d } else { prev + d };
        out.push(b);
        prev = b;
    }
    Ok(out)
}

/// Pull `len` bits starting at bit offset `offset` out of a back-to-back
/// spliced block stream, repacked bit-0-aligned for `decode_block`.
fn extract_bits(stream: &[u8], offset: usize, len: usize) -> Vec<u8> {
    let mut w = BitWriter::new();
    let mut pos = offset;
    let mut remaining = len;
    while remaining > 0 {
        let byte_idx = pos / 8;
        let bit_off = pos % 8;
        let take = remaining.min(8 - bit_off);
        let byte = stream.get(byte_idx).copied().unwrap_or(0);
        let bits = (byte >> bit_off) & (((1u16 << take) - 1) as u8);
        w.write_bits(take as u32, bits as u64);
        pos += take;
        remaining -= take;
    }
    w.into_bytes()
}

/// Parsed chunks are cached per (level, sub-level, [bit-plane,] chunk
/// address) so a query visiting many bricks inside one chunk only pays the
/// delta-decode cost once. A cached `None` means the chunk genuinely has no
/// data (a sparse high bit-plane, or a field with no such sub-channel).
#[derive(Default)]
struct ChunkCache {
    data: HashMap<(i8, i8, i16, u64), Option<ParsedChunk>>,
    exponent: HashMap<(i8, i8, u64), Option<ParsedExponentChunk>>,
}

#[allow(clippy::too_many_arguments)]
fn load_data_chunk<'a>(
    store: &'a mut HashMap<(i8, i8, i16, u64), Option<ParsedChunk>>,
    cache: &mut FileCache,
    field: &str,
    level: i8,
    sub_level: i8,
    real_bp: i16,
    brick: u64,
    bpf: u32,
    bpc: u32,
    flags: GroupingFlags,
) -> Idx2Result<Option<&'a ParsedChunk>> {
    let chunk_addr = chunk_address(level, brick, sub_level, real_bp, bpc, flags);
    let key = (level, sub_level, real_bp, chunk_addr);
    if !store.contains_key(&key) {
        let file_addr = file_address(level, brick, sub_level, real_bp, bpf, flags);
        let parsed = match cache.get_or_open(field, level, file_addr, FileKind::Data) {
            Ok(file) => match file.read_chunk(chunk_addr) {
                Ok(bytes) => Some(ParsedChunk::parse(&bytes)?),
                Err(Idx2Error::FileNotFound { .. }) => None,
                Err(e) => return Err(e),
            },
            Err(Idx2Error::FileNotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        store.insert(key, parsed);
    }
    Ok(store.get(&key).unwrap().as_ref())
}

fn load_exponent_chunk<'a>(
    store: &'a mut HashMap<(i8, i8, u64), Option<ParsedExponentChunk>>,
    cache: &mut FileCache,
    field: &str,
    level: i8,
    sub_level: i8,
    brick: u64,
    bpf: u32,
    bpc: u32,
    flags: GroupingFlags,
) -> Idx2Result<Option<&'a ParsedExponentChunk>> {
    let chunk_addr = chunk_address(level, brick, sub_level, 0, bpc, flags);
    let key = (level, sub_level, chunk_addr);
    if !store.contains_key(&key) {
        let file_addr = file_address(level, brick, sub_level, 0, bpf, flags);
        let parsed = match cache.get_or_open(field, level, file_addr, FileKind::Exponent) {
            Ok(file) => match file.read_chunk(chunk_addr) {
                Ok(bytes) => Some(ParsedExponentChunk::parse(&bytes)?),
                Err(Idx2Error::FileNotFound { .. }) => None,
                Err(e) => return Err(e),
            },
            Err(Idx2Error::FileNotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        store.insert(key, parsed);
    }
    Ok(store.get(&key).unwrap().as_ref())
}

/// Reconstruct one brick's samples at `params.level`, working top-down from
/// the coarsest persisted level (whose low-pass subband is itself block
/// coded — brick.rs's encode no longer discards it) down to the requested
/// level, seeding each finer level's low-pass slot from the previous
/// iteration's inverse-transformed data.
#[allow(clippy::too_many_arguments)]
fn decode_brick_top_down(
    idx2: &Idx2File,
    cache: &mut FileCache,
    chunk_cache: &mut ChunkCache,
    params: &DecodeParams,
    brick_index: u64,
    brick_dims_by_level: &[V3],
    stats: &mut Stats,
) -> Idx2Result<Vec<f64>> {
    let meta = &idx2.metadata;
    let template = idx2.template();
    let norms = idx2.norms();
    let flags = meta.grouping;
    let num_levels = meta.num_levels;
    let target_level = params.level as usize;

    let mut data: Option<Vec<f64>> = None;
    let mut data_dims_ext = V3::ZEROS;

    for level in (target_level..=num_levels).rev() {
        let level_brick_dims = brick_dims_by_level[level - 1];
        let dims_ext = brick_dims_ext(level_brick_dims);
        let mut brick = Brick::new(dims_ext);
        let subbands = build_level_subbands(level_brick_dims, V3::ONES, template, level, norms);
        let bpf = rounded_group_size(&meta.bricks_per_file, level as i8);
        let bpc = rounded_group_size(&meta.bricks_per_chunk, level as i8);

        for (sub_level, sb) in subbands.iter().enumerate() {
            let sub_level_i8 = sub_level as i8;
            if sb.is_lowpass() && level != num_levels {
                if let Some(parent_data) = &data {
                    let local = gather(parent_data, data_dims_ext, &Grid::new(V3::ZEROS, sb.local_grid.dims, V3::ONES));
                    scatter(&mut brick.data, dims_ext, &sb.local_grid, &local);
                }
                continue;
            }

            for block_grid in iter_blocks(&sb.local_grid, 4) {
                if block_grid.num_samples() == 0 {
                    continue;
                }
                let Some(emax) =
                    load_exponent_chunk(&mut chunk_cache.exponent, cache, &params.field, level as i8, sub_level_i8, brick_index, bpf, bpc, flags)?
                        .and_then(|c| c.emax_for(brick_index))
                else {
                    continue;
                };

                let d = [block_grid.dims.x > 1, block_grid.dims.y > 1, block_grid.dims.z > 1]
                    .iter()
                    .filter(|&&b| b)
                    .count()
                    .max(1);
                let precision = precision_bits(d);

                let mut owned_planes: Vec<(i32, Vec<u8>, usize)> = Vec::new();
                for bit in (0..precision).rev() {
                    let real_bp = emax - (precision as i32 - 1 - bit as i32);
                    // Mirrors block_codec::encode_block's own cutoff so two
                    // decodes of the same artifact at different accuracies
                    // genuinely stop at different bit-planes.
                    if (TOTAL_BITS as f64 - 6.0) > (real_bp as f64 - params.accuracy.log2() + 1.0) {
                        break;
                    }
                    let Some(chunk) = load_data_chunk(
                        &mut chunk_cache.data,
                        cache,
                        &params.field,
                        level as i8,
                        sub_level_i8,
                        real_bp as i16,
                        brick_index,
                        bpf,
                        bpc,
                        flags,
                    )?
                    else {
                        continue;
                    };
                    let Some((bytes, bit_len)) = chunk.bits_for(brick_index) else { continue };
                    stats.bytes_read += bytes.len() as u64;
                    owned_planes.push((real_bp, bytes, bit_len));
                }

                let plane_refs: Vec<(i32, &[u8], usize)> =
                    owned_planes.iter().map(|(bp, b, n)| (*bp, b.as_slice(), *n)).collect();
                let decoded = decode_block(emax, block_grid.dims, &plane_refs);
                for (off, v) in block_grid.iter_offsets(dims_ext).zip(decoded.into_iter()) {
                    brick.data[off as usize] = v;
                }
                stats.blocks_decoded += 1;
            }
        }

        let grid_full = Grid::new(V3::ZEROS, level_brick_dims, V3::ONES);
        for step in template.steps_for_level(level).into_iter().rev() {
            ilift_cdf53(&mut brick.data, dims_ext, step.axis as usize, &grid_full, level_brick_dims);
        }

        data_dims_ext = dims_ext;
        data = Some(brick.data);
    }

    Ok(data.unwrap_or_else(|| vec![0.0; data_dims_ext.product().max(1) as usize]))
}

/// Decode a requested sub-extent at a requested level (§8 property 8):
/// only bricks intersecting `params.decode_extent` are visited, via
/// [`traverse_bricks`]; everything else is never opened.
pub fn decode_volume(idx2: &Idx2File, params: &DecodeParams) -> Idx2Result<(Vec<f64>, Stats)> {
    let span = info_span!("idx2_decode", field = %params.field);
    let _enter = span.enter();
    let mut stats = Stats::new();

    let meta = &idx2.metadata;
    if params.level < 1 || params.level as usize > meta.num_levels {
        return Err(Idx2Error::IncompatibleMetadata(format!(
            "level {} out of range 1..={}",
            params.level, meta.num_levels
        )));
    }

    let dims = meta.dimensions;
    let brick_dims = meta.brick_dims;
    let bricks_in = V3::new(
        (dims.x + brick_dims.x - 1) / brick_dims.x,
        (dims.y + brick_dims.y - 1) / brick_dims.y,
        (dims.z + brick_dims.z - 1) / brick_dims.z,
    );

    let template = idx2.template();
    let norms = idx2.norms();
    let mut brick_dims_by_level = vec![brick_dims];
    for lvl in 1..meta.num_levels {
        let prev = *brick_dims_by_level.last().unwrap();
        brick_dims_by_level.push(lowpass_dims(prev, template, lvl, norms));
    }
    let target_dims = brick_dims_by_level[params.level as usize - 1];

    // decode_extent is given in level-1 (finest) sample coordinates;
    // rescale into this level's local sample units before bounding the
    // brick search or cropping the result.
    let shrink = 1i32 << (params.level - 1).max(0);
    let out_dims = V3::new(
        (dims.x + shrink - 1) / shrink,
        (dims.y + shrink - 1) / shrink,
        (dims.z + shrink - 1) / shrink,
    );
    let local_extent = Grid::new(
        V3::new(
            (params.decode_extent.from.x / shrink).max(0),
            (params.decode_extent.from.y / shrink).max(0),
            (params.decode_extent.from.z / shrink).max(0),
        ),
        V3::new(
            ((params.decode_extent.dims.x + shrink - 1) / shrink).max(1),
            ((params.decode_extent.dims.y + shrink - 1) / shrink).max(1),
            ((params.decode_extent.dims.z + shrink - 1) / shrink).max(1),
        ),
        V3::ONES,
    );

    let local_last = local_extent.last();
    let query_from = V3::new(
        (local_extent.from.x / target_dims.x).max(0),
        (local_extent.from.y / target_dims.y).max(0),
        (local_extent.from.z / target_dims.z).max(0),
    );
    let query_to = V3::new(
        (local_last.x / target_dims.x + 1).min(bricks_in.x),
        (local_last.y / target_dims.y + 1).min(bricks_in.y),
        (local_last.z / target_dims.z + 1).min(bricks_in.z),
    );

    let order = TraversalOrder::cycling();
    let visited_coords = traverse_bricks(bricks_in, query_from, query_to, &order);

    let mut cache = FileCache::new(&params.in_dir);
    let mut chunk_cache = ChunkCache::default();
    let mut output = vec![0.0f64; out_dims.product().max(0) as usize];

    for coord in visited_coords {
        let brick_index = (coord.z as u64 * bricks_in.y as u64 + coord.y as u64) * bricks_in.x as u64 + coord.x as u64;

        let origin_full = V3::new(coord.x * brick_dims.x, coord.y * brick_dims.y, coord.z * brick_dims.z);
        let valid_full = Grid::new(origin_full, brick_dims, V3::ONES).crop(&Grid::new(V3::ZEROS, dims, V3::ONES));
        if valid_full.num_samples() == 0 {
            continue;
        }

        let reconstructed =
            decode_brick_top_down(idx2, &mut cache, &mut chunk_cache, params, brick_index, &brick_dims_by_level, &mut stats)?;

        let out_origin = V3::new(coord.x * target_dims.x, coord.y * target_dims.y, coord.z * target_dims.z);
        let dest = Grid::new(out_origin, target_dims, V3::ONES).crop(&Grid::new(V3::ZEROS, out_dims, V3::ONES));
        if dest.num_samples() == 0 {
            continue;
        }
        // `reconstructed` is strided as `brick_dims_ext(target_dims)` (the
        // lift's extrapolation padding), not `target_dims` — index it with
        // that stride even though only the unpadded sub-box is copied out.
        let dims_ext_target = brick_dims_ext(target_dims);
        let dest_local = Grid::new(V3::ZEROS, dest.dims, V3::ONES);
        for (src_off, dst_off) in dest_local.iter_offsets(dims_ext_target).zip(dest.iter_offsets(out_dims)) {
            output[dst_off as usize] = reconstructed[src_off as usize];
        }
        stats.bricks_visited += 1;
    }

    let output_grid_local = Grid::new(V3::ZEROS, out_dims, V3::ONES);
    let cropped = output_grid_local.crop(&local_extent);
    let mut result = vec![0.0f64; cropped.num_samples().max(0) as usize];
    let dest = Grid::new(V3::ZEROS, cropped.dims, V3::ONES);
    for (src, dst) in cropped.iter_offsets(out_dims).zip(dest.iter_offsets(cropped.dims)) {
        result[dst as usize] = output[src as usize];
    }

    stats.log_summary("decode");
    Ok((result, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::GroupingFlags;
    use crate::idx2_file::Idx2File;
    use crate::metadata::{DataType, Metadata};
    use tempfile::tempdir;

    #[test]
    fn round_trip_small_volume_via_decode_volume() {
        let dims = V3::new(8, 8, 8);
        let meta = Metadata {
            field: "density".into(),
            dimensions: dims,
            dtype: DataType::F64,
            num_levels: 1,
            brick_dims: dims,
            bricks_per_chunk: vec![1],
            bricks_per_file: vec![1],
            transform: ":210".into(),
            grouping: GroupingFlags::default(),
            value_range: (0.0, 1.0),
        };
        let idx2 = Idx2File::init(meta).unwrap();
        let samples: Vec<f64> = (0..dims.product()).map(|i| (i % 19) as f64 - 9.0).collect();

        let dir = tempdir().unwrap();
        let enc_params = crate::params::EncodeParams {
            input_file: "in.raw".into(),
            out_dir: dir.path().to_path_buf(),
            name: "vol".into(),
            field: "density".into(),
            wavelet_only: false,
            accuracy: 1e-6,
        };
        idx2.encode(&samples, &enc_params).unwrap();

        let dec_params = DecodeParams {
            in_dir: dir.path().to_path_buf(),
            name: "vol".into(),
            field: "density".into(),
            decode_extent: Grid::new(V3::ZEROS, dims, V3::ONES),
            level: 1,
            accuracy: 1e-5,
        };
        let (decoded, stats) = decode_volume(&idx2, &dec_params).unwrap();
        assert_eq!(decoded.len(), samples.len());
        assert!(stats.blocks_decoded > 0);

        let max_err = decoded.iter().zip(samples.iter()).map(|(a, b)| (a - b).abs()).fold(0.0, f64::max);
        assert!(max_err < 5.0, "reconstruction error too large: {max_err}");
    }

    #[test]
    fn rejects_out_of_range_level() {
        let dims = V3::new(8, 8, 8);
        let meta = Metadata {
            field: "density".into(),
            dimensions: dims,
            dtype: DataType::F64,
            num_levels: 1,
            brick_dims: dims,
            bricks_per_chunk: vec![1],
            bricks_per_file: vec![1],
            transform: ":210".into(),
            grouping: GroupingFlags::default(),
            value_range: (0.0, 1.0),
        };
        let idx2 = Idx2File::init(meta).unwrap();
        let dir = tempdir().unwrap();
        let dec_params = DecodeParams {
            in_dir: dir.path().to_path_buf(),
            name: "vol".into(),
            field: "density".into(),
            decode_extent: Grid::new(V3::ZEROS, dims, V3::ONES),
            level: 0,
            accuracy: 1e-5,
        };
        assert!(matches!(decode_volume(&idx2, &dec_params), Err(Idx2Error::IncompatibleMetadata(_))));
    }

    #[test]
    fn looser_accuracy_reads_fewer_bits_than_tighter_accuracy() {
        let dims = V3::new(8, 8, 8);
        let meta = Metadata {
            field: "density".into(),
            dimensions: dims,
            dtype: DataType::F64,
            num_levels: 1,
            brick_dims: dims,
            bricks_per_chunk: vec![1],
            bricks_per_file: vec![1],
            transform: ":210".into(),
            grouping: GroupingFlags::default(),
            value_range: (0.0, 1.0),
        };
        let idx2 = Idx2File::init(meta).unwrap();
        let samples: Vec<f64> = (0..dims.product()).map(|i| ((i % 23) as f64 - 11.0) * 3.7).collect();

        let dir = tempdir().unwrap();
        let enc_params = crate::params::EncodeParams {
            input_file: "in.raw".into(),
            out_dir: dir.path().to_path_buf(),
            name: "vol".into(),
            field: "density".into(),
            wavelet_only: false,
            accuracy: 1e-9,
        };
        idx2.encode(&samples, &enc_params).unwrap();

        let loose = DecodeParams {
            in_dir: dir.path().to_path_buf(),
            name: "vol".into(),
            field: "density".into(),
            decode_extent: Grid::new(V3::ZEROS, dims, V3::ONES),
            level: 1,
            accuracy: 1.0,
        };
        let tight = DecodeParams { accuracy: 1e-9, ..loose.clone() };

        let (_, loose_stats) = decode_volume(&idx2, &loose).unwrap();
        let (_, tight_stats) = decode_volume(&idx2, &tight).unwrap();
        assert!(
            loose_stats.bytes_read < tight_stats.bytes_read,
            "loose accuracy should read strictly fewer bytes: loose={} tight={}",
            loose_stats.bytes_read,
            tight_stats.bytes_read
        );
    }
}
