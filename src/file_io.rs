//! Bulk file I/O (§6): one data or exponent file per (field, level, address
//! shard), each a flat append of chunk payloads followed by a trailer —
//! a zstd-compressed index of chunk offsets/sizes keyed by chunk address,
//! so opening a file for random access costs one trailer read plus one
//! seek per chunk actually touched.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use crc32fast::Hasher;

use crate::address::{file_relative_path, FileKind};
use crate::bitstream::{BitReader, BitWriter};
use crate::error::{Idx2Error, Idx2Result};

/// One chunk's location within a data/exponent file.
#[derive(Debug, Clone, Copy)]
pub struct ChunkEntry {
    pub address: u64,
    pub offset: u64,
    pub size: u64,
}

/// A single data or exponent file: chunk payloads appended in write order,
/// followed by a trailer (`[zstd(index)] [index_len: u32 LE] [crc32: u32 LE]
/// [magic: u32 LE]`) written once on close.
pub struct DataFile {
    path: PathBuf,
    entries: Vec<ChunkEntry>,
}

const TRAILER_MAGIC: u32 = 0x4958_3200; // "IX2\0"

impl DataFile {
    pub fn create(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf(), entries: Vec::new() }
    }

    /// Append one chunk's bytes, recording its offset for the trailer.
    pub fn append_chunk(&mut self, address: u64, bytes: &[u8]) -> Idx2Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|_| Idx2Error::FileWriteFailed { path: self.path.clone() })?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|_| Idx2Error::FileOpenFailed { path: self.path.clone() })?;
        let offset = f.metadata().map(|m| m.len()).unwrap_or(0);
        f.write_all(bytes).map_err(|_| Idx2Error::FileWriteFailed { path: self.path.clone() })?;
        self.entries.push(ChunkEntry { address, offset, size: bytes.len() as u64 });
        Ok(())
    }

    /// Serialize and append the chunk index trailer. After this call no
    /// more chunks may be appended (a fresh [`DataFile`] must be created to
    /// append more, which would also require rewriting the trailer).
    pub fn finish(self) -> Idx2Result<()> {
        let mut index = BitWriter::new();
        index.write_varbyte(self.entries.len() as u64);
        let mut prev_addr = 0u64;
        for e in &self.entries {
            let delta = e.address.wrapping_sub(prev_addr);
            index.write_varbyte(delta);
            index.write_varbyte(e.offset);
            index.write_varbyte(e.size);
            prev_addr = e.address;
        }
        let raw = index.into_bytes();
        let compressed = zstd::encode_all(raw.as_slice(), 0)
            .map_err(|_| Idx2Error::AllocationFailed("zstd index compression failed".into()))?;

        let mut hasher = Hasher::new();
        hasher.update(&compressed);
        let crc = hasher.finalize();

        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|_| Idx2Error::FileOpenFailed { path: self.path.clone() })?;
        f.write_all(&compressed).map_err(|_| Idx2Error::FileWriteFailed { path: self.path.clone() })?;
        f.write_u32::<LE>(compressed.len() as u32)
            .map_err(|_| Idx2Error::FileWriteFailed { path: self.path.clone() })?;
        f.write_u32::<LE>(crc).map_err(|_| Idx2Error::FileWriteFailed { path: self.path.clone() })?;
        f.write_u32::<LE>(TRAILER_MAGIC).map_err(|_| Idx2Error::FileWriteFailed { path: self.path.clone() })?;
        Ok(())
    }
}

/// A read-only handle with its trailer already parsed, so repeated reads
/// against the same file don't re-read or re-decompress the index.
pub struct OpenDataFile {
    path: PathBuf,
    file: File,
    index: HashMap<u64, ChunkEntry>,
}

impl OpenDataFile {
    pub fn open(path: impl AsRef<Path>) -> Idx2Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|_| Idx2Error::FileNotFound { path: path.clone() })?;
        let len = file.metadata().map_err(|_| Idx2Error::FileReadFailed { path: path.clone() })?.len();
        if len < 12 {
            return Err(Idx2Error::TruncatedStream { expected: 12, actual: len as usize });
        }

        file.seek(SeekFrom::End(-12)).map_err(|_| Idx2Error::FileReadFailed { path: path.clone() })?;
        let index_len = file.read_u32::<LE>().map_err(|_| Idx2Error::FileReadFailed { path: path.clone() })? as u64;
        let stored_crc = file.read_u32::<LE>().map_err(|_| Idx2Error::FileReadFailed { path: path.clone() })?;
        let magic = file.read_u32::<LE>().map_err(|_| Idx2Error::FileReadFailed { path: path.clone() })?;
        if magic != TRAILER_MAGIC {
            return Err(Idx2Error::IncompatibleMetadata(format!("{path:?}: bad trailer magic")));
        }

        let index_start = len.checked_sub(12 + index_len)
            .ok_or_else(|| Idx2Error::TruncatedStream { expected: (12 + index_len) as usize, actual: len as usize })?;
        file.seek(SeekFrom::Start(index_start)).map_err(|_| Idx2Error::FileReadFailed { path: path.clone() })?;
        let mut compressed = vec![0u8; index_len as usize];
        file.read_exact(&mut compressed).map_err(|_| Idx2Error::FileReadFailed { path: path.clone() })?;

        let mut hasher = Hasher::new();
        hasher.update(&compressed);
        if hasher.finalize() != stored_crc {
            return Err(Idx2Error::ChecksumMismatch { what: format!("{path:?} chunk index") });
        }

        let raw = zstd::decode_all(compressed.as_slice())
            .map_err(|_| Idx2Error::IncompatibleMetadata(format!("{path:?}: corrupt chunk index")))?;
        let mut r = BitReader::new(&raw);
        let count = r.read_varbyte()?;
        let mut index = HashMap::with_capacity(count as usize);
        let mut addr = 0u64;
        for _ in 0..count {
            let delta = r.read_varbyte()?;
            addr = addr.wrapping_add(delta);
            let offset = r.read_varbyte()?;
            let size = r.read_varbyte()?;
            index.insert(addr, ChunkEntry { address: addr, offset, size });
        }

        Ok(Self { path, file, index })
    }

    pub fn read_chunk(&mut self, address: u64) -> Idx2Result<Vec<u8>> {
        let entry = *self
            .index
            .get(&address)
            .ok_or_else(|| Idx2Error::FileNotFound { path: self.path.clone() })?;
        self.file
            .seek(SeekFrom::Start(entry.offset))
            .map_err(|_| Idx2Error::FileReadFailed { path: self.path.clone() })?;
        let mut buf = vec![0u8; entry.size as usize];
        self.file.read_exact(&mut buf).map_err(|_| Idx2Error::FileReadFailed { path: self.path.clone() })?;
        Ok(buf)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.index.contains_key(&address)
    }
}

/// Cache of open file handles keyed by relative path, so a decode session
/// visiting many chunks in the same file only pays the trailer-parse cost
/// once.
#[derive(Default)]
pub struct FileCache {
    root: PathBuf,
    open: HashMap<PathBuf, OpenDataFile>,
}

impl FileCache {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf(), open: HashMap::new() }
    }

    pub fn get_or_open(&mut self, field: &str, level: i8, addr: u64, kind: FileKind) -> Idx2Result<&mut OpenDataFile> {
        let rel = PathBuf::from(file_relative_path(field, level, addr, kind));
        let full = self.root.join(&rel);
        if !self.open.contains_key(&rel) {
            let handle = OpenDataFile::open(&full)?;
            self.open.insert(rel.clone(), handle);
        }
        Ok(self.open.get_mut(&rel).unwrap())
    }
}
