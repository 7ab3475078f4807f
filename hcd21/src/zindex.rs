//!
//! # Random-Access Gzip Index
//!
//! Checkpoints into a gzip archive's DEFLATE stream, each enough to resume decompression mid-stream.
//! Indices are keyed by the CRC-32 of the whole compressed archive,
//! and shared between readers through an [IndexRegistry].
//!
//! On-disk layout, little-endian:
//!
//! * Magic `HCDZIDX1`
//! * Archive CRC-32 (u32)
//! * Repeated checkpoints: output offset (u64), input byte offset (u64), bit offset (u32), 32 KiB window
//!

// Std-Lib
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

// Crates.io
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

// Local imports
use crate::error::{HcdError, HcdResult, ZError};
use crate::inflate::{Inflater, WINDOW_SIZE};

const MAGIC: &[u8; 8] = b"HCDZIDX1";

///
/// # Index Checkpoint
///
/// Resumption state at a DEFLATE block boundary.
///
#[derive(Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Decompressed offset
    pub out: u64,
    /// Compressed byte offset, from the start of the archive file
    pub input: u64,
    /// Bits of the byte at `input` already consumed, 0..=7
    pub bits: u8,
    /// The [WINDOW_SIZE] bytes of output preceding `out`, oldest first.
    /// Zero-padded at the start of the stream.
    pub window: Vec<u8>,
}
impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Checkpoint")
            .field("out", &self.out)
            .field("input", &self.input)
            .field("bits", &self.bits)
            .finish()
    }
}

///
/// # Gzip Index
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZIndex {
    /// CRC-32 of the compressed archive this index was built from
    pub crc: u32,
    /// Checkpoints, in increasing `out` order. The first is always the stream start.
    pub points: Vec<Checkpoint>,
}
impl ZIndex {
    /// Find the last checkpoint at or before decompressed offset `target`
    pub fn locate(&self, target: u64) -> Option<&Checkpoint> {
        let idx = self.points.partition_point(|p| p.out <= target);
        idx.checked_sub(1).map(|k| &self.points[k])
    }
    /// Check that we were built from an archive with checksum `crc`
    pub fn check(&self, crc: u32) -> HcdResult<()> {
        if self.crc != crc {
            return Err(ZError::StaleIndex {
                index_crc: self.crc,
                archive_crc: crc,
            }
            .into());
        }
        Ok(())
    }
    /// Write to `dest`
    pub fn write(&self, dest: &mut impl Write) -> HcdResult<()> {
        dest.write_all(MAGIC)?;
        dest.write_u32::<LittleEndian>(self.crc)?;
        for p in self.points.iter() {
            dest.write_u64::<LittleEndian>(p.out)?;
            dest.write_u64::<LittleEndian>(p.input)?;
            dest.write_u32::<LittleEndian>(p.bits as u32)?;
            dest.write_all(&p.window)?;
        }
        Ok(())
    }
    /// Read from `src`
    pub fn read(src: &mut impl Read) -> HcdResult<Self> {
        let mut magic = [0u8; 8];
        src.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(HcdError::format("Not a gzip index"));
        }
        let crc = src.read_u32::<LittleEndian>()?;
        let mut points: Vec<Checkpoint> = Vec::new();
        loop {
            // A clean end-of-file is only legal between records
            let mut first = [0u8; 8];
            let n = read_some(src, &mut first)?;
            if n == 0 {
                break;
            }
            if n < first.len() {
                return Err(HcdError::format("Truncated gzip index"));
            }
            let out = u64::from_le_bytes(first);
            let input = src.read_u64::<LittleEndian>()?;
            let bits = src.read_u32::<LittleEndian>()?;
            if bits > 7 {
                return Err(HcdError::format(format!("Invalid checkpoint bit offset {}", bits)));
            }
            if let Some(prev) = points.last() {
                if out <= prev.out || input < prev.input {
                    return Err(HcdError::format("Gzip index checkpoints out of order"));
                }
            }
            let mut window = vec![0u8; WINDOW_SIZE];
            src.read_exact(&mut window)?;
            points.push(Checkpoint {
                out,
                input,
                bits: bits as u8,
                window,
            });
        }
        if points.first().map_or(true, |p| p.out != 0) {
            return Err(HcdError::format("Gzip index lacks a stream-start checkpoint"));
        }
        Ok(Self { crc, points })
    }
    /// Save to file `fname`
    pub fn save(&self, fname: impl AsRef<Path>) -> HcdResult<()> {
        let mut file = BufWriter::new(std::fs::File::create(fname)?);
        self.write(&mut file)?;
        file.flush()?;
        Ok(())
    }
    /// Open from file `fname`, checking it against archive checksum `crc` if provided
    pub fn open(fname: impl AsRef<Path>, crc: Option<u32>) -> HcdResult<Self> {
        let mut file = BufReader::new(std::fs::File::open(fname)?);
        let index = Self::read(&mut file)?;
        if let Some(crc) = crc {
            index.check(crc)?;
        }
        Ok(index)
    }
}

/// Read up to `buf.len()` bytes, stopping early only at end-of-file
fn read_some(src: &mut impl Read, buf: &mut [u8]) -> HcdResult<usize> {
    let mut n = 0;
    while n < buf.len() {
        match src.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(k) => n += k,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(n)
}

///
/// # Index Builder
///
/// Records a checkpoint at the first block boundary past each `span` bytes of output.
///
#[derive(Debug)]
pub struct IndexBuilder {
    crc: u32,
    span: u64,
    points: Vec<Checkpoint>,
}
impl IndexBuilder {
    /// Create a builder for the archive with checksum `crc`, whose DEFLATE stream starts at byte `start`
    pub fn new(crc: u32, span: u64, start: u64) -> Self {
        let first = Checkpoint {
            out: 0,
            input: start,
            bits: 0,
            window: vec![0; WINDOW_SIZE],
        };
        Self {
            crc,
            span: span.max(1),
            points: vec![first],
        }
    }
    /// Notify us of a block boundary reached by `inflater`
    pub fn boundary(&mut self, inflater: &Inflater) {
        let out = inflater.total_out();
        let last = self.points.last().map_or(0, |p| p.out);
        if out >= last + self.span {
            let (input, bits) = inflater.bit_position();
            self.points.push(Checkpoint {
                out,
                input,
                bits,
                window: inflater.window_snapshot(),
            });
        }
    }
    /// Number of checkpoints so far
    pub fn len(&self) -> usize {
        self.points.len()
    }
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
    /// Complete the index
    pub fn finish(self) -> ZIndex {
        ZIndex {
            crc: self.crc,
            points: self.points,
        }
    }
}

///
/// # Index Registry
///
/// Process-wide sharing of live [ZIndex]es, keyed by archive checksum.
/// The registry holds only weak references: an index is freed when its last reader drops it.
///
#[derive(Debug, Default)]
pub struct IndexRegistry {
    entries: Mutex<HashMap<u32, Weak<ZIndex>>>,
}
impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Weak<ZIndex>>> {
        // A panic elsewhere cannot leave the map itself inconsistent
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
    /// Register `index`. If a live index for the same archive already exists, it is returned instead.
    pub fn register(&self, index: impl Into<Arc<ZIndex>>) -> Arc<ZIndex> {
        let index = index.into();
        let mut entries = self.entries();
        if let Some(existing) = entries.get(&index.crc).and_then(Weak::upgrade) {
            return existing;
        }
        entries.insert(index.crc, Arc::downgrade(&index));
        index
    }
    /// Find the live index for archive checksum `crc`
    pub fn lookup(&self, crc: u32) -> Option<Arc<ZIndex>> {
        let mut entries = self.entries();
        let found = entries.get(&crc).and_then(Weak::upgrade);
        if found.is_none() {
            entries.remove(&crc);
        }
        found
    }
    /// Remove the entry for `crc`. Returns whether a live index was removed.
    pub fn unregister(&self, crc: u32) -> bool {
        self.entries()
            .remove(&crc)
            .map_or(false, |w| w.strong_count() > 0)
    }
    /// Number of live indices, pruning dead entries
    pub fn live(&self) -> usize {
        let mut entries = self.entries();
        entries.retain(|_, w| w.strong_count() > 0);
        entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index(crc: u32) -> ZIndex {
        let mut window = vec![0u8; WINDOW_SIZE];
        window[WINDOW_SIZE - 1] = 0xAB;
        ZIndex {
            crc,
            points: vec![
                Checkpoint {
                    out: 0,
                    input: 10,
                    bits: 0,
                    window: vec![0; WINDOW_SIZE],
                },
                Checkpoint {
                    out: 70_000,
                    input: 20_011,
                    bits: 5,
                    window,
                },
            ],
        }
    }
    #[test]
    fn locate_checkpoints() {
        let index = sample_index(1);
        assert_eq!(index.locate(0).map(|p| p.out), Some(0));
        assert_eq!(index.locate(69_999).map(|p| p.out), Some(0));
        assert_eq!(index.locate(70_000).map(|p| p.out), Some(70_000));
        assert_eq!(index.locate(u64::MAX).map(|p| p.out), Some(70_000));
    }
    #[test]
    fn save_and_open() -> HcdResult<()> {
        let index = sample_index(0xDEAD_BEEF);
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.gz.hzx");
        index.save(&path)?;
        assert_eq!(ZIndex::open(&path, Some(0xDEAD_BEEF))?, index);
        let stale = ZIndex::open(&path, Some(1)).unwrap_err();
        assert!(matches!(
            stale,
            HcdError::Compression(ZError::StaleIndex { .. })
        ));
        // Truncation within a record is a format error
        let mut bytes = Vec::new();
        index.write(&mut bytes)?;
        bytes.truncate(bytes.len() - 100);
        assert!(ZIndex::read(&mut &bytes[..]).unwrap_err().is_format());
        Ok(())
    }
    #[test]
    fn registry_holds_weak_references() {
        let reg = IndexRegistry::new();
        let a = reg.register(sample_index(7));
        let b = reg.register(sample_index(7));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.live(), 1);
        assert!(reg.lookup(7).is_some());
        drop(a);
        assert_eq!(reg.live(), 1);
        drop(b);
        assert_eq!(reg.live(), 0);
        assert!(reg.lookup(7).is_none());
        let c = reg.register(sample_index(8));
        assert!(reg.unregister(8));
        assert!(reg.lookup(8).is_none());
        drop(c);
    }
}
