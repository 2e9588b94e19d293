//! Library surface (§6): [`Idx2File`] ties metadata, params, the brick
//! pipeline, channel accumulation, and file I/O together behind `encode`/
//! `decode` entry points.

use std::collections::HashMap;

use tracing::info_span;

use crate::address::{chunk_address, file_address, file_relative_path, rounded_group_size, FileKind, GroupingFlags};
use crate::brick::{encode_brick, BrickPool, EncodeSinks};
use crate::channel::{Channel, SubChannel};
use crate::error::{Idx2Error, Idx2Result};
use crate::file_io::DataFile;
use crate::grid::{Grid, V3};
use crate::metadata::Metadata;
use crate::observer::Stats;
use crate::params::{DecodeParams, EncodeParams};
use crate::subband::{lowpass_dims, Cdf53Norms, TransformTemplate};

/// A field's full configuration: its on-disk descriptor plus the derived
/// transform template and norms used by every encode/decode pass.
pub struct Idx2File {
    pub metadata: Metadata,
    template: TransformTemplate,
    norms: Cdf53Norms,
}

impl Idx2File {
    pub fn init(metadata: Metadata) -> Idx2Result<Self> {
        let template = TransformTemplate::parse(&metadata.transform)?;
        if template.num_levels < metadata.num_levels {
            return Err(Idx2Error::IncompatibleMetadata(format!(
                "transform template covers {} levels, metadata declares {}",
                template.num_levels, metadata.num_levels
            )));
        }
        let norms = Cdf53Norms::compute();
        Ok(Self { metadata, template, norms })
    }

    /// The grid of samples a decode at `level` would produce for the whole
    /// volume, before cropping to a caller's requested sub-extent. `level`
    /// here is the shrink exponent (0 == finest), one less than
    /// [`DecodeParams::level`].
    pub fn output_grid(&self, level: i8) -> Grid {
        let shrink = 1i32 << level.max(0);
        let dims = V3::new(
            (self.metadata.dimensions.x + shrink - 1) / shrink,
            (self.metadata.dimensions.y + shrink - 1) / shrink,
            (self.metadata.dimensions.z + shrink - 1) / shrink,
        );
        Grid::new(V3::ZEROS, dims, V3::splat(shrink))
    }

    /// Encode an entire in-memory volume (row-major, matching
    /// `metadata.dimensions`) into bricks at every level, flushing each
    /// channel/sub-channel into a chunk as soon as it accumulates
    /// `bricks_per_chunk` bricks (rounded to the same power of two
    /// `file_address`/`chunk_address` group by), rather than once at the
    /// very end of the whole pass.
    pub fn encode(&self, samples: &[f64], params: &EncodeParams) -> Idx2Result<Stats> {
        let span = info_span!("idx2_encode", field = %params.field);
        let _enter = span.enter();
        let mut stats = Stats::new();

        let dims = self.metadata.dimensions;
        let bricks_in = V3::new(
            (dims.x + self.metadata.brick_dims.x - 1) / self.metadata.brick_dims.x,
            (dims.y + self.metadata.brick_dims.y - 1) / self.metadata.brick_dims.y,
            (dims.z + self.metadata.brick_dims.z - 1) / self.metadata.brick_dims.z,
        );

        let mut pool = BrickPool::new();
        let mut channels: HashMap<u32, Channel> = HashMap::new();
        let mut subchannels: HashMap<u32, SubChannel> = HashMap::new();
        let mut open_files: HashMap<(u64, FileKind), DataFile> = HashMap::new();
        let flags = self.metadata.grouping;

        let mut level_brick_dims = self.metadata.brick_dims;
        for level in 1..=self.metadata.num_levels {
            let level = level as i8;
            let bpc = rounded_group_size(&self.metadata.bricks_per_chunk, level);
            let bpf = rounded_group_size(&self.metadata.bricks_per_file, level);

            let mut brick_index = 0u64;
            for bz in 0..bricks_in.z {
                for by in 0..bricks_in.y {
                    for bx in 0..bricks_in.x {
                        if level == 1 {
                            let origin = V3::new(bx * level_brick_dims.x, by * level_brick_dims.y, bz * level_brick_dims.z);
                            let block =
                                Grid::new(origin, level_brick_dims, V3::ONES).crop(&Grid::new(V3::ZEROS, dims, V3::ONES));
                            if block.num_samples() > 0 {
                                let mut brick_samples = vec![0.0f64; level_brick_dims.product() as usize];
                                let dest = Grid::new(V3::ZEROS, block.dims, V3::ONES);
                                for (src_off, dst_off) in block.iter_offsets(dims).zip(dest.iter_offsets(level_brick_dims)) {
                                    brick_samples[dst_off as usize] = samples[src_off as usize];
                                }
                                let mut sinks = EncodeSinks { channels: &mut channels, subchannels: &mut subchannels };
                                encode_brick(
                                    brick_index,
                                    1,
                                    level_brick_dims,
                                    &brick_samples,
                                    &self.template,
                                    &self.norms,
                                    self.metadata.num_levels,
                                    params.accuracy,
                                    &mut pool,
                                    &mut sinks,
                                );
                                stats.bricks_visited += 1;
                            }
                        } else if pool.contains(level, brick_index) {
                            let mut sinks = EncodeSinks { channels: &mut channels, subchannels: &mut subchannels };
                            encode_brick(
                                brick_index,
                                level,
                                level_brick_dims,
                                &[],
                                &self.template,
                                &self.norms,
                                self.metadata.num_levels,
                                params.accuracy,
                                &mut pool,
                                &mut sinks,
                            );
                            stats.bricks_visited += 1;
                        }

                        if !params.wavelet_only {
                            flush_due_channels(
                                level,
                                bpc,
                                bpf,
                                brick_index,
                                &mut channels,
                                &mut subchannels,
                                &mut open_files,
                                params,
                                flags,
                                &mut stats,
                            )?;
                        }
                        brick_index += 1;
                    }
                }
            }

            if !params.wavelet_only {
                flush_remaining_channels(
                    level,
                    brick_index.saturating_sub(1),
                    &mut channels,
                    &mut subchannels,
                    &mut open_files,
                    params,
                    bpf,
                    bpc,
                    flags,
                    &mut stats,
                )?;
            }

            if (level as usize) < self.metadata.num_levels {
                level_brick_dims = lowpass_dims(level_brick_dims, &self.template, level as usize, &self.norms);
            }
        }

        if params.wavelet_only {
            // Debug mode: exercise the transform only, skip entropy coding
            // and file output entirely.
            stats.log_summary("encode (wavelet-only)");
            return Ok(stats);
        }

        for (_, file) in open_files {
            file.finish()?;
        }

        stats.log_summary("encode");
        Ok(stats)
    }

    /// Decode (§4.9): delegates to [`crate::decode`].
    pub fn decode(&self, params: &DecodeParams) -> Idx2Result<(Vec<f64>, Stats)> {
        crate::decode::decode_volume(self, params)
    }

    pub fn template(&self) -> &TransformTemplate {
        &self.template
    }

    pub fn norms(&self) -> &Cdf53Norms {
        &self.norms
    }
}

fn unpack_channel_key(key: u32) -> (i8, i8, i16) {
    let bit_plane = (key >> 16) as i16;
    let level = ((key >> 4) & 0xF) as i8;
    let sub_level = (key & 0xF) as i8;
    (level, sub_level, bit_plane)
}

/// Flush every channel/sub-channel belonging to `level` whose accumulated
/// brick count has reached its rounded chunk size, using `brick_index`
/// (the brick that was just processed) as the representative address for
/// the chunk/file group it belongs to.
#[allow(clippy::too_many_arguments)]
fn flush_due_channels(
    level: i8,
    bpc: u32,
    bpf: u32,
    brick_index: u64,
    channels: &mut HashMap<u32, Channel>,
    subchannels: &mut HashMap<u32, SubChannel>,
    open_files: &mut HashMap<(u64, FileKind), DataFile>,
    params: &EncodeParams,
    flags: GroupingFlags,
    stats: &mut Stats,
) -> Idx2Result<()> {
    let due: Vec<u32> = channels
        .iter()
        .filter(|(k, ch)| unpack_channel_key(**k).0 == level && ch.should_flush(bpc))
        .map(|(k, _)| *k)
        .collect();
    for key in due {
        let (lvl, sub_level, bit_plane) = unpack_channel_key(key);
        let payload = channels.get_mut(&key).unwrap().flush_chunk();
        let framed = payload.frame();
        write_chunk(open_files, params, lvl, sub_level, bit_plane, brick_index, bpf, bpc, flags, FileKind::Data, &framed, stats)?;
    }

    let due_sc: Vec<u32> = subchannels
        .iter()
        .filter(|(k, sc)| unpack_channel_key(**k).0 == level && sc.should_flush(bpc))
        .map(|(k, _)| *k)
        .collect();
    for key in due_sc {
        let (lvl, sub_level, _) = unpack_channel_key(key);
        let bytes = subchannels.get_mut(&key).unwrap().flush_chunk();
        write_chunk(open_files, params, lvl, sub_level, 0, brick_index, bpf, bpc, flags, FileKind::Exponent, &bytes, stats)?;
    }
    Ok(())
}

/// Flush whatever is left in `level`'s channels/sub-channels after its
/// brick loop finishes — the final, possibly partial, chunk.
#[allow(clippy::too_many_arguments)]
fn flush_remaining_channels(
    level: i8,
    last_brick_index: u64,
    channels: &mut HashMap<u32, Channel>,
    subchannels: &mut HashMap<u32, SubChannel>,
    open_files: &mut HashMap<(u64, FileKind), DataFile>,
    params: &EncodeParams,
    bpf: u32,
    bpc: u32,
    flags: GroupingFlags,
    stats: &mut Stats,
) -> Idx2Result<()> {
    let pending: Vec<u32> = channels
        .iter()
        .filter(|(k, ch)| unpack_channel_key(**k).0 == level && !ch.is_empty())
        .map(|(k, _)| *k)
        .collect();
    for key in pending {
        let (lvl, sub_level, bit_plane) = unpack_channel_key(key);
        let payload = channels.get_mut(&key).unwrap().flush_chunk();
        let framed = payload.frame();
        write_chunk(
            open_files,
            params,
            lvl,
            sub_level,
            bit_plane,
            last_brick_index,
            bpf,
            bpc,
            flags,
            FileKind::Data,
            &framed,
            stats,
        )?;
    }

    let pending_sc: Vec<u32> = subchannels
        .iter()
        .filter(|(k, sc)| unpack_channel_key(**k).0 == level && !sc.is_empty())
        .map(|(k, _)| *k)
        .collect();
    for key in pending_sc {
        let (lvl, sub_level, _) = unpack_channel_key(key);
        let bytes = subchannels.get_mut(&key).unwrap().flush_chunk();
        write_chunk(
            open_files,
            params,
            lvl,
            sub_level,
            0,
            last_brick_index,
            bpf,
            bpc,
            flags,
            FileKind::Exponent,
            &bytes,
            stats,
        )?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_chunk(
    open_files: &mut HashMap<(u64, FileKind), DataFile>,
    params: &EncodeParams,
    level: i8,
    sub_level: i8,
    bit_plane: i16,
    brick_index: u64,
    bpf: u32,
    bpc: u32,
    flags: GroupingFlags,
    kind: FileKind,
    bytes: &[u8],
    stats: &mut Stats,
) -> Idx2Result<()> {
    let file_addr = file_address(level, brick_index, sub_level, bit_plane, bpf, flags);
    let chunk_addr = chunk_address(level, brick_index, sub_level, bit_plane, bpc, flags);
    let key = (file_addr, kind);
    if !open_files.contains_key(&key) {
        let path = params.out_dir.join(file_relative_path(&params.field, level, file_addr, kind));
        open_files.insert(key, DataFile::create(path));
    }
    open_files.get_mut(&key).unwrap().append_chunk(chunk_addr, bytes)?;
    stats.chunks_flushed += 1;
    stats.bytes_written += bytes.len() as u64;
    if kind == FileKind::Exponent {
        stats.files_touched += 1;
    }
    Ok(())
}

pub fn default_grouping() -> GroupingFlags {
    GroupingFlags::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::DataType;
    use tempfile::tempdir;

    fn sample_metadata() -> Metadata {
        Metadata {
            field: "density".into(),
            dimensions: V3::new(8, 8, 8),
            dtype: DataType::F64,
            num_levels: 1,
            brick_dims: V3::new(8, 8, 8),
            bricks_per_chunk: vec![1],
            bricks_per_file: vec![1],
            transform: ":210".into(),
            grouping: GroupingFlags::default(),
            value_range: (0.0, 1.0),
        }
    }

    #[test]
    fn encode_writes_at_least_one_file() {
        let meta = sample_metadata();
        let idx2 = Idx2File::init(meta).unwrap();
        let samples: Vec<f64> = (0..512).map(|i| (i % 17) as f64 - 8.0).collect();
        let dir = tempdir().unwrap();
        let params = EncodeParams {
            input_file: "in.raw".into(),
            out_dir: dir.path().to_path_buf(),
            name: "vol".into(),
            field: "density".into(),
            wavelet_only: false,
            accuracy: 1e-6,
        };
        let stats = idx2.encode(&samples, &params).unwrap();
        assert!(stats.chunks_flushed > 0);
        assert!(stats.bytes_written > 0);
    }

    #[test]
    fn output_grid_halves_per_level() {
        let meta = sample_metadata();
        let idx2 = Idx2File::init(meta).unwrap();
        let g0 = idx2.output_grid(0);
        assert_eq!(g0.dims, V3::new(8, 8, 8));
        let g1 = idx2.output_grid(1);
        assert_eq!(g1.dims, V3::new(4, 4, 4));
    }

    #[test]
    fn multi_level_encode_persists_every_level() {
        let dims = V3::new(8, 8, 8);
        let meta = Metadata {
            field: "density".into(),
            dimensions: dims,
            dtype: DataType::F64,
            num_levels: 2,
            brick_dims: dims,
            bricks_per_chunk: vec![1],
            bricks_per_file: vec![1],
            transform: ":210:210".into(),
            grouping: GroupingFlags::default(),
            value_range: (0.0, 1.0),
        };
        let idx2 = Idx2File::init(meta).unwrap();
        let samples: Vec<f64> = (0..dims.product()).map(|i| (i % 17) as f64 - 8.0).collect();
        let dir = tempdir().unwrap();
        let params = EncodeParams {
            input_file: "in.raw".into(),
            out_dir: dir.path().to_path_buf(),
            name: "vol".into(),
            field: "density".into(),
            wavelet_only: false,
            accuracy: 1e-6,
        };
        let stats = idx2.encode(&samples, &params).unwrap();
        // One brick at level 1 plus one at level 2 (the routed low-pass brick).
        assert_eq!(stats.bricks_visited, 2);
        assert!(stats.chunks_flushed > 0);
    }
}
