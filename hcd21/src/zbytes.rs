//!
//! # Compressed Byte Store
//!
//! Variable-length blocks in a non-volatile [ByteArena], each led by a one-byte tag:
//!
//! * `SMALL`: varint length, then data. Blocks below the compression threshold.
//! * `PLAIN`: four-byte little-endian length, then data. Candidates for compression once sealed.
//! * `DEFLATE`: four-byte compressed length, four-byte original length, then raw-DEFLATE data.
//!
//! Compression happens in place when a block is sealed, so tickets never change.
//!

// Std-Lib
use std::borrow::Cow;
use std::io::{Read, Write};

// Crates.io
use byteorder::{ByteOrder, LittleEndian};
use derive_more::{Add, AddAssign};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

// Local imports
use crate::arena::{ByteArena, Discipline, Ticket};
use crate::bio::{varint_len, ReadHcdExt, WriteHcdExt};
use crate::error::{HcdError, HcdResult, ZError};

/// Thresholds below this disable compression
pub const MIN_COMPRESS_THRESHOLD: usize = 16;

const TAG_SMALL: u8 = 0;
const TAG_PLAIN: u8 = 1;
const TAG_DEFLATE: u8 = 2;

/// # Byte-Store Statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Add, AddAssign, Serialize, Deserialize)]
pub struct ZStoreStats {
    /// Blocks stored
    pub blocks: u64,
    /// Blocks replaced by their compressed form
    pub compressed: u64,
    /// Payload bytes stored
    pub raw_bytes: u64,
    /// Bytes saved by compression
    pub saved_bytes: u64,
}

/// Decoded block header
#[derive(Debug, Clone, Copy)]
struct BlockHeader {
    tag: u8,
    /// Header length, including the tag byte
    hdrlen: usize,
    /// Stored data length
    len: usize,
    /// Original length, for compressed blocks
    rawlen: usize,
}

///
/// # Compressed Byte Store
///
#[derive(Debug)]
pub struct ZByteStore {
    /// Underlying storage
    arena: ByteArena,
    /// Blocks at or above this size are compressible
    threshold: usize,
    /// Statistics
    stats: ZStoreStats,
}
impl ZByteStore {
    /// Create a new store. Byte-arena tickets are spaced `1 << bits` apart,
    /// which also bounds the largest block.
    pub fn new(name: &'static str, bits: u32, threshold: usize) -> Self {
        Self {
            arena: ByteArena::new(name, Discipline::NonVolatile, bits, 1 << bits),
            threshold,
            stats: ZStoreStats::default(),
        }
    }
    /// Boolean indication of whether compression is enabled
    pub fn compression_enabled(&self) -> bool {
        self.threshold >= MIN_COMPRESS_THRESHOLD
    }
    /// Reserve space for a `size`-byte block, returning its [Ticket].
    /// Contents are zero until written via [ZByteStore::payload_mut] or [ZByteStore::patch].
    pub fn allocate(&mut self, size: usize) -> HcdResult<Ticket> {
        let mut hdr = Vec::with_capacity(5);
        if self.compression_enabled() && size >= self.threshold {
            hdr.push(TAG_PLAIN);
            hdr.extend_from_slice(&(u32::try_from(size)?).to_le_bytes());
        } else {
            hdr.push(TAG_SMALL);
            hdr.write_u64v(size as u64)?;
        }
        let t = self.arena.allocate(hdr.len() + size)?;
        match self.arena.get_mut(t, hdr.len()) {
            Some(dest) => dest.copy_from_slice(&hdr),
            None => return Err(HcdError::msg("Byte store allocation unexpectedly invalid")),
        }
        self.stats.blocks += 1;
        self.stats.raw_bytes += size as u64;
        Ok(t)
    }
    /// Allocate and copy in `bytes`. The block is left unsealed.
    pub fn store(&mut self, bytes: &[u8]) -> HcdResult<Ticket> {
        let t = self.allocate(bytes.len())?;
        self.payload_mut(t)?.copy_from_slice(bytes);
        Ok(t)
    }
    /// Allocate, copy in `bytes`, and seal
    pub fn store_sealed(&mut self, bytes: &[u8]) -> HcdResult<Ticket> {
        let t = self.store(bytes)?;
        self.seal(t)?;
        Ok(t)
    }
    /// Decode the header of the block at `t`
    fn header(&self, t: Ticket) -> HcdResult<BlockHeader> {
        let bytes = self
            .arena
            .tail(t)
            .ok_or_else(|| HcdError::format(format!("Invalid byte-store ticket {}", t.raw())))?;
        let short = || HcdError::format("Truncated byte-store block header");
        let hdr = match bytes.first() {
            Some(&TAG_SMALL) => {
                let len = (&bytes[1..]).read_u64v()? as usize;
                BlockHeader {
                    tag: TAG_SMALL,
                    hdrlen: 1 + varint_len(len as u64),
                    len,
                    rawlen: len,
                }
            }
            Some(&TAG_PLAIN) => {
                let len = LittleEndian::read_u32(bytes.get(1..5).ok_or_else(short)?) as usize;
                BlockHeader {
                    tag: TAG_PLAIN,
                    hdrlen: 5,
                    len,
                    rawlen: len,
                }
            }
            Some(&TAG_DEFLATE) => {
                let b = bytes.get(1..9).ok_or_else(short)?;
                BlockHeader {
                    tag: TAG_DEFLATE,
                    hdrlen: 9,
                    len: LittleEndian::read_u32(&b[0..4]) as usize,
                    rawlen: LittleEndian::read_u32(&b[4..8]) as usize,
                }
            }
            Some(tag) => return Err(HcdError::format(format!("Invalid byte-store tag {}", tag))),
            None => return Err(short()),
        };
        if hdr.hdrlen + hdr.len > bytes.len() {
            return Err(HcdError::format("Byte-store block overruns its arena block"));
        }
        Ok(hdr)
    }
    /// Get the mutable payload of an unsealed (or incompressible) block
    pub fn payload_mut(&mut self, t: Ticket) -> HcdResult<&mut [u8]> {
        let hdr = self.header(t)?;
        if hdr.tag == TAG_DEFLATE {
            return Err(HcdError::msg("Cannot modify a compressed byte-store block"));
        }
        let bytes = self
            .arena
            .get_mut(t, hdr.hdrlen + hdr.len)
            .ok_or_else(|| HcdError::format("Invalid byte-store ticket"))?;
        Ok(&mut bytes[hdr.hdrlen..])
    }
    /// Overwrite payload bytes of block `t`, starting at `offset`
    pub fn patch(&mut self, t: Ticket, offset: usize, bytes: &[u8]) -> HcdResult<()> {
        let payload = self.payload_mut(t)?;
        let dest = payload
            .get_mut(offset..offset + bytes.len())
            .ok_or_else(|| HcdError::msg("Byte-store patch out of range"))?;
        dest.copy_from_slice(bytes);
        Ok(())
    }
    /// Seal block `t`, compressing it in place if that makes it smaller.
    /// Returns whether the block ends up compressed.
    pub fn seal(&mut self, t: Ticket) -> HcdResult<bool> {
        let hdr = self.header(t)?;
        match hdr.tag {
            TAG_DEFLATE => return Ok(true),
            TAG_SMALL => return Ok(false),
            _ => (),
        }
        let packed = {
            let bytes = self
                .arena
                .get(t, hdr.hdrlen + hdr.len)
                .ok_or_else(|| HcdError::format("Invalid byte-store ticket"))?;
            let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
            enc.write_all(&bytes[hdr.hdrlen..])
                .map_err(|e| ZError::Block(e.to_string()))?;
            enc.finish().map_err(|e| ZError::Block(e.to_string()))?
        };
        // Compressed blocks carry four more header bytes
        if packed.len() + 4 >= hdr.len {
            return Ok(false);
        }
        let dest = self
            .arena
            .get_mut(t, 9 + packed.len())
            .ok_or_else(|| HcdError::format("Invalid byte-store ticket"))?;
        dest[0] = TAG_DEFLATE;
        LittleEndian::write_u32(&mut dest[1..5], packed.len() as u32);
        LittleEndian::write_u32(&mut dest[5..9], hdr.len as u32);
        dest[9..].copy_from_slice(&packed);
        self.stats.compressed += 1;
        self.stats.saved_bytes += (hdr.len - packed.len() - 4) as u64;
        Ok(true)
    }
    /// Get the contents of block `t`.
    /// Uncompressed blocks are borrowed in place, compressed blocks are inflated into a new buffer.
    pub fn resolve(&self, t: Ticket) -> HcdResult<Cow<[u8]>> {
        let hdr = self.header(t)?;
        let bytes = self
            .arena
            .get(t, hdr.hdrlen + hdr.len)
            .ok_or_else(|| HcdError::format("Invalid byte-store ticket"))?;
        let data = &bytes[hdr.hdrlen..];
        if hdr.tag != TAG_DEFLATE {
            return Ok(Cow::Borrowed(data));
        }
        let mut rv = Vec::with_capacity(hdr.rawlen);
        DeflateDecoder::new(data)
            .read_to_end(&mut rv)
            .map_err(|e| ZError::Block(e.to_string()))?;
        if rv.len() != hdr.rawlen {
            return Err(ZError::Block(format!(
                "Inflated {} bytes, expected {}",
                rv.len(),
                hdr.rawlen
            ))
            .into());
        }
        Ok(Cow::Owned(rv))
    }
    /// Boolean indication of whether block `t` is stored compressed
    pub fn is_compressed(&self, t: Ticket) -> HcdResult<bool> {
        Ok(self.header(t)?.tag == TAG_DEFLATE)
    }
    /// Get our statistics
    pub fn stats(&self) -> ZStoreStats {
        self.stats
    }
    /// Bytes of memory held
    pub fn memory(&self) -> usize {
        self.arena.memory()
    }
    /// Drop everything
    pub fn clear(&mut self) {
        self.arena.clear();
        self.stats = ZStoreStats::default();
    }
}
