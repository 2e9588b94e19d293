//! Channel / sub-channel accumulators (§4.7): per-(level, sub-level,
//! bit-plane) accumulation of encoded block payloads into chunks, and the
//! parallel per-(level, sub-level) accumulation of block exponents.

use crate::bitstream::BitWriter;
use crate::error::{Idx2Error, Idx2Result};

/// One flushed chunk's worth of accumulated bytes, ready for [`crate::file_io`]
/// to append to the appropriate data or exponent file.
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub brick_deltas: Vec<u8>,
    pub brick_sizes: Vec<u8>,
    pub block_stream: Vec<u8>,
    pub num_bricks: u32,
}

impl ChunkPayload {
    /// Serialize every section a random-access reader needs: a
    /// `num_bricks` header, then length-prefixed `brick_deltas` and
    /// `brick_sizes` sections, then the raw `block_stream`. Persisting
    /// `brick_deltas` lets a reader reconstruct the ascending brick-index
    /// list for this chunk and binary-search it, instead of only being
    /// able to replay entries in encode order.
    pub fn frame(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.brick_deltas.len() + self.brick_sizes.len() + self.block_stream.len());
        out.extend_from_slice(&self.num_bricks.to_le_bytes());
        out.extend_from_slice(&(self.brick_deltas.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.brick_deltas);
        out.extend_from_slice(&(self.brick_sizes.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.brick_sizes);
        out.extend_from_slice(&self.block_stream);
        out
    }

    /// Split a frame produced by [`Self::frame`] back into its sections:
    /// `(num_bricks, brick_deltas, brick_sizes, block_stream)`.
    pub fn unframe(bytes: &[u8]) -> Idx2Result<(u32, Vec<u8>, Vec<u8>, Vec<u8>)> {
        let (num_bricks, mut sections) = read_framed_sections(bytes, 2)?;
        let block_stream = sections.pop().unwrap();
        let brick_sizes = sections.pop().unwrap();
        let brick_deltas = sections.pop().unwrap();
        Ok((num_bricks, brick_deltas, brick_sizes, block_stream))
    }
}

/// Shared framing logic for [`ChunkPayload`] and [`SubChannel`]'s exponent
/// chunks: a `num_bricks` header followed by `n_sections` length-prefixed
/// byte sections, followed by one final unprefixed section running to the
/// end of the buffer.
fn read_framed_sections(bytes: &[u8], n_sections: usize) -> Idx2Result<(u32, Vec<Vec<u8>>)> {
    if bytes.len() < 4 {
        return Err(Idx2Error::TruncatedStream { expected: 4, actual: bytes.len() });
    }
    let num_bricks = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let mut pos = 4;
    let mut sections = Vec::with_capacity(n_sections + 1);
    for _ in 0..n_sections {
        if bytes.len() < pos + 4 {
            return Err(Idx2Error::TruncatedStream { expected: pos + 4, actual: bytes.len() });
        }
        let len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if bytes.len() < pos + len {
            return Err(Idx2Error::TruncatedStream { expected: pos + len, actual: bytes.len() });
        }
        sections.push(bytes[pos..pos + len].to_vec());
        pos += len;
    }
    sections.push(bytes[pos..].to_vec());
    Ok((num_bricks, sections))
}

/// Accumulates encoded block bit-streams for one (level, sub-level,
/// bit-plane) channel as bricks are visited in traversal order, flushing a
/// [`ChunkPayload`] once `bricks_per_chunk` bricks have been accumulated.
#[derive(Debug, Default)]
pub struct Channel {
    block_stream: BitWriter,
    brick_sizes: BitWriter,
    brick_deltas: BitWriter,
    last_brick_written: Option<u64>,
    last_chunk_flushed: u64,
    bricks_in_current_chunk: u32,
}

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_chunk_flushed(&self) -> u64 {
        self.last_chunk_flushed
    }

    /// Record one brick's worth of encoded block bits for this channel.
    /// `brick` must be strictly increasing across calls (traversal order).
    pub fn add_block(&mut self, brick: u64, block: &BitWriter) {
        let delta = match self.last_brick_written {
            Some(prev) => {
                debug_assert!(brick > prev, "bricks must be added in increasing order");
                brick - prev
            }
            None => brick,
        };
        self.brick_deltas.write_varbyte(delta);
        self.brick_sizes.write_varbyte(block.size_bits() as u64);
        self.block_stream.splice(block);
        self.last_brick_written = Some(brick);
        self.bricks_in_current_chunk += 1;
    }

    pub fn should_flush(&self, bricks_per_chunk: u32) -> bool {
        self.bricks_in_current_chunk >= bricks_per_chunk
    }

    /// Flush whatever has accumulated into a [`ChunkPayload`], resetting the
    /// per-chunk counters but preserving `last_brick_written` so future
    /// deltas continue from where this chunk left off.
    pub fn flush_chunk(&mut self) -> ChunkPayload {
        self.brick_deltas.flush_byte();
        self.brick_sizes.flush_byte();
        self.block_stream.flush_byte();
        let payload = ChunkPayload {
            brick_deltas: std::mem::take(&mut self.brick_deltas).into_bytes(),
            brick_sizes: std::mem::take(&mut self.brick_sizes).into_bytes(),
            block_stream: std::mem::take(&mut self.block_stream).into_bytes(),
            num_bricks: self.bricks_in_current_chunk,
        };
        self.last_chunk_flushed += 1;
        self.bricks_in_current_chunk = 0;
        payload
    }

    pub fn is_empty(&self) -> bool {
        self.bricks_in_current_chunk == 0
    }
}

/// Accumulates per-brick shared exponents for one (level, sub-level),
/// independent of bit-plane — exponents are written once per brick
/// regardless of how many bit-planes that brick's blocks touch.
#[derive(Debug, Default)]
pub struct SubChannel {
    brick_exponents: BitWriter,
    brick_deltas: BitWriter,
    last_brick_written: Option<u64>,
    bricks_in_current_chunk: u32,
    last_chunk_flushed: u64,
}

impl SubChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_chunk_flushed(&self) -> u64 {
        self.last_chunk_flushed
    }

    /// Zig-zag encode so small negative exponents (the common case for
    /// near-zero blocks) stay compact under var-byte coding.
    fn zigzag(v: i32) -> u64 {
        ((v << 1) ^ (v >> 31)) as u32 as u64
    }

    pub fn add_exponent(&mut self, brick: u64, emax: i32) {
        let delta = match self.last_brick_written {
            Some(prev) => {
                debug_assert!(brick > prev, "bricks must be added in increasing order");
                brick - prev
            }
            None => brick,
        };
        self.brick_deltas.write_varbyte(delta);
        self.brick_exponents.write_varbyte(Self::zigzag(emax));
        self.bricks_in_current_chunk += 1;
        self.last_brick_written = Some(brick);
    }

    pub fn should_flush(&self, bricks_per_chunk: u32) -> bool {
        self.bricks_in_current_chunk >= bricks_per_chunk
    }

    /// Frame this chunk's deltas and exponents together (see
    /// [`frame_exponents`]), resetting the per-chunk counters.
    pub fn flush_chunk(&mut self) -> Vec<u8> {
        self.brick_deltas.flush_byte();
        self.brick_exponents.flush_byte();
        let num_bricks = self.bricks_in_current_chunk;
        let deltas = std::mem::take(&mut self.brick_deltas).into_bytes();
        let exponents = std::mem::take(&mut self.brick_exponents).into_bytes();
        self.last_chunk_flushed += 1;
        self.bricks_in_current_chunk = 0;
        frame_exponents(num_bricks, &deltas, &exponents)
    }

    pub fn is_empty(&self) -> bool {
        self.bricks_in_current_chunk == 0
    }
}

/// Frame a [`SubChannel`] chunk: `num_bricks` header, length-prefixed
/// `brick_deltas`, then the raw exponent stream.
pub fn frame_exponents(num_bricks: u32, brick_deltas: &[u8], exponents: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + brick_deltas.len() + exponents.len());
    out.extend_from_slice(&num_bricks.to_le_bytes());
    out.extend_from_slice(&(brick_deltas.len() as u32).to_le_bytes());
    out.extend_from_slice(brick_deltas);
    out.extend_from_slice(exponents);
    out
}

/// Split a frame produced by [`frame_exponents`] back into
/// `(num_bricks, brick_deltas, exponents)`.
pub fn unframe_exponents(bytes: &[u8]) -> Idx2Result<(u32, Vec<u8>, Vec<u8>)> {
    let (num_bricks, mut sections) = read_framed_sections(bytes, 1)?;
    let exponents = sections.pop().unwrap();
    let brick_deltas = sections.pop().unwrap();
    Ok((num_bricks, brick_deltas, exponents))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_accumulates_and_flushes() {
        let mut ch = Channel::new();
        let mut w = BitWriter::new();
        w.write_bits(8, 0xAB);
        ch.add_block(0, &w);
        ch.add_block(3, &w);
        assert!(!ch.should_flush(3));
        ch.add_block(9, &w);
        assert!(ch.should_flush(3));

        let payload = ch.flush_chunk();
        assert_eq!(payload.num_bricks, 3);
        assert!(!payload.block_stream.is_empty());
        assert!(ch.is_empty());
        assert_eq!(ch.last_chunk_flushed(), 1);
    }

    #[test]
    fn subchannel_zigzag_round_trips_via_varbyte() {
        let mut sc = SubChannel::new();
        sc.add_exponent(0, -5);
        sc.add_exponent(1, 12);
        let framed = sc.flush_chunk();
        let (num_bricks, deltas, exponents) = unframe_exponents(&framed).unwrap();
        assert_eq!(num_bricks, 2);

        let mut dr = crate::bitstream::BitReader::new(&deltas);
        assert_eq!(dr.read_varbyte().unwrap(), 0);
        assert_eq!(dr.read_varbyte().unwrap(), 1);

        let mut r = crate::bitstream::BitReader::new(&exponents);
        let z1 = r.read_varbyte().unwrap();
        let v1 = ((z1 >> 1) as i32) ^ -((z1 & 1) as i32);
        assert_eq!(v1, -5);
    }

    #[test]
    fn chunk_payload_frame_round_trips_brick_deltas() {
        let mut ch = Channel::new();
        let mut w = BitWriter::new();
        w.write_bits(8, 0xAB);
        ch.add_block(2, &w);
        ch.add_block(7, &w);
        let payload = ch.flush_chunk();
        let framed = payload.frame();
        let (num_bricks, deltas, sizes, stream) = ChunkPayload::unframe(&framed).unwrap();
        assert_eq!(num_bricks, 2);
        assert_eq!(stream, payload.block_stream);
        assert_eq!(sizes, payload.brick_sizes);

        let mut r = crate::bitstream::BitReader::new(&deltas);
        assert_eq!(r.read_varbyte().unwrap(), 2);
        assert_eq!(r.read_varbyte().unwrap(), 5);
    }
}
