//!
//! # Archive Streams
//!
//! Uniform [Read] + [Seek] access to source archives, whether plain or gzip-compressed.
//! Gzip archives are decoded by [ZioReader], which seeks backwards or far forwards
//! by resuming from [ZIndex] checkpoints, and can record such an index on its first linear pass.
//!

// Std-Lib
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

// Crates.io
use enum_dispatch::enum_dispatch;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

// Local imports
use crate::error::{HcdError, HcdResult, ZError};
use crate::inflate::{Inflater, Progress};
use crate::zindex::{IndexBuilder, ZIndex};

/// Forward seeks of up to this many bytes decompress through, rather than resuming from a checkpoint
pub const SKIP_THRESHOLD: u64 = 1 << 16;
/// Decompression chunk size
const CHUNK: usize = 1 << 15;

///
/// # Shared Immutable Bytes
///
/// Reference-counted view of an archive's content, whether memory-mapped or owned.
///
#[derive(Clone)]
pub struct SharedBytes(Arc<dyn AsRef<[u8]> + Send + Sync>);
impl SharedBytes {
    /// Memory-map file `fname`
    pub fn map(fname: impl AsRef<Path>) -> HcdResult<Self> {
        let file = std::fs::File::open(fname)?;
        if file.metadata()?.len() == 0 {
            // Zero-length maps are rejected on some platforms
            return Ok(Self::from(Vec::new()));
        }
        // Safety: the file is opened read-only; concurrent truncation by another process is not supported.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self(Arc::new(map)))
    }
    pub fn len(&self) -> usize {
        self.as_ref().len()
    }
    pub fn is_empty(&self) -> bool {
        self.as_ref().is_empty()
    }
}
impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        (*self.0).as_ref()
    }
}
impl From<Vec<u8>> for SharedBytes {
    fn from(v: Vec<u8>) -> Self {
        Self(Arc::new(v))
    }
}
impl std::fmt::Debug for SharedBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "SharedBytes({} bytes)", self.len())
    }
}

/// Boolean indication of whether `bytes` start with the gzip magic number
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

// Gzip header flags
const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;

/// Parse a gzip member header, returning the offset of its DEFLATE data
pub fn gzip_header_len(bytes: &[u8]) -> HcdResult<usize> {
    let short = || HcdError::format("Truncated gzip header");
    if !is_gzip(bytes) {
        return Err(HcdError::format("Not a gzip stream"));
    }
    if bytes.len() < 10 {
        return Err(short());
    }
    if bytes[2] != 8 {
        return Err(HcdError::format(format!(
            "Unsupported gzip compression method {}",
            bytes[2]
        )));
    }
    let flags = bytes[3];
    let mut pos = 10;
    if flags & FEXTRA != 0 {
        let xlen = bytes.get(pos..pos + 2).ok_or_else(short)?;
        pos += 2 + u16::from_le_bytes([xlen[0], xlen[1]]) as usize;
    }
    for flag in [FNAME, FCOMMENT] {
        if flags & flag != 0 {
            let rest = bytes.get(pos..).ok_or_else(short)?;
            let nul = rest.iter().position(|b| *b == 0).ok_or_else(short)?;
            pos += nul + 1;
        }
    }
    if flags & FHCRC != 0 {
        pos += 2;
    }
    if pos > bytes.len() {
        return Err(short());
    }
    Ok(pos)
}

/// # Gzip Reader Statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZioStats {
    /// Seeks resolved by resuming from a checkpoint
    pub resumes: u64,
    /// Seeks which restarted decompression from the stream start
    pub restarts: u64,
    /// Bytes decompressed and discarded while seeking forward
    pub skipped: u64,
}

///
/// # Seekable Gzip Reader
///
/// Reads a single-member gzip archive.
/// The trailer's CRC-32 and length are verified whenever the stream is read linearly from its start through its end.
///
pub struct ZioReader {
    data: SharedBytes,
    /// Offset of the DEFLATE stream
    start: usize,
    /// CRC-32 of the entire compressed archive
    crc: u32,
    inflater: Inflater,
    /// Decompressed bytes not yet returned
    buf: Vec<u8>,
    bufpos: usize,
    /// Decompressed offset of `buf[bufpos]`
    pos: u64,
    /// Running checksum of the output, while reading linearly from the start
    verify: Option<crc32fast::Hasher>,
    index: Option<Arc<ZIndex>>,
    builder: Option<IndexBuilder>,
    built: Option<ZIndex>,
    stats: ZioStats,
}
impl ZioReader {
    /// Create a reader over gzip archive `data`
    pub fn new(data: SharedBytes) -> HcdResult<Self> {
        let start = gzip_header_len(data.as_ref())?;
        let crc = crc32fast::hash(data.as_ref());
        let inflater = Inflater::new(data.clone(), start);
        Ok(Self {
            data,
            start,
            crc,
            inflater,
            buf: Vec::with_capacity(CHUNK),
            bufpos: 0,
            pos: 0,
            verify: Some(crc32fast::Hasher::new()),
            index: None,
            builder: None,
            built: None,
            stats: ZioStats::default(),
        })
    }
    /// CRC-32 of the compressed archive
    pub fn crc(&self) -> u32 {
        self.crc
    }
    /// Attach a previously built index. Fails if it was built from other content.
    pub fn set_index(&mut self, index: Arc<ZIndex>) -> HcdResult<()> {
        index.check(self.crc)?;
        self.index = Some(index);
        Ok(())
    }
    /// Our attached index, if any
    pub fn index(&self) -> Option<&Arc<ZIndex>> {
        self.index.as_ref()
    }
    /// Detach and return our index
    pub fn clear_index(&mut self) -> Option<Arc<ZIndex>> {
        self.index.take()
    }
    /// Begin recording an index with checkpoint spacing `span`.
    /// Recording continues as long as we are read linearly, and completes at end-of-stream.
    pub fn record_index(&mut self, span: u64) -> HcdResult<()> {
        if self.pos != 0 || self.inflater.total_out() != 0 {
            return Err(HcdError::msg("Index recording must start at the stream start"));
        }
        self.builder = Some(IndexBuilder::new(self.crc, span, self.start as u64));
        Ok(())
    }
    /// Take the index completed by [ZioReader::record_index], if any
    pub fn take_index(&mut self) -> Option<ZIndex> {
        self.built.take()
    }
    /// Seek statistics
    pub fn stats(&self) -> ZioStats {
        self.stats
    }
    /// Current decompressed position
    pub fn position(&self) -> u64 {
        self.pos
    }
    /// Decompressed length, as recorded in the gzip trailer (modulo 2^32)
    pub fn trailer_len(&self) -> HcdResult<u64> {
        let bytes = self.data.as_ref();
        if bytes.len() < self.start + 8 {
            return Err(ZError::Truncated.into());
        }
        let t = &bytes[bytes.len() - 4..];
        Ok(u32::from_le_bytes([t[0], t[1], t[2], t[3]]) as u64)
    }
    /// Decompress the next chunk into `buf`
    fn fill(&mut self) -> HcdResult<()> {
        self.buf.clear();
        self.bufpos = 0;
        loop {
            match self.inflater.decode_into(&mut self.buf, CHUNK)? {
                Progress::More => break,
                Progress::Boundary => {
                    if let Some(b) = self.builder.as_mut() {
                        b.boundary(&self.inflater);
                    }
                    if !self.buf.is_empty() {
                        break;
                    }
                }
                Progress::End => {
                    if let Some(h) = self.verify.as_mut() {
                        h.update(&self.buf);
                    }
                    return self.finish();
                }
            }
        }
        if let Some(h) = self.verify.as_mut() {
            h.update(&self.buf);
        }
        Ok(())
    }
    /// Handle end-of-stream: verify the trailer, complete any index being recorded
    fn finish(&mut self) -> HcdResult<()> {
        let Some(hasher) = self.verify.take() else {
            return Ok(());
        };
        let at = self.inflater.end_offset() as usize;
        let trailer = self
            .data
            .as_ref()
            .get(at..at + 8)
            .ok_or(ZError::Truncated)?;
        let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let found = hasher.finalize();
        if expected != found {
            return Err(ZError::Checksum { expected, found }.into());
        }
        let isize = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
        let found = self.inflater.total_out() as u32;
        if isize != found {
            return Err(ZError::Checksum {
                expected: isize,
                found,
            }
            .into());
        }
        if let Some(b) = self.builder.take() {
            let index = b.finish();
            log::debug!(
                "Recorded gzip index with {} checkpoints over {} bytes",
                index.points.len(),
                self.inflater.total_out()
            );
            self.built = Some(index);
        }
        Ok(())
    }
    /// Restart decompression from the stream start
    fn restart(&mut self) {
        self.inflater = Inflater::new(self.data.clone(), self.start);
        self.buf.clear();
        self.bufpos = 0;
        self.pos = 0;
        self.verify = Some(crc32fast::Hasher::new());
        self.stats.restarts += 1;
    }
    /// Resume decompression from checkpoint `out` of our index
    fn resume(&mut self, target: u64) -> HcdResult<bool> {
        let Some(index) = self.index.clone() else {
            return Ok(false);
        };
        let Some(cp) = index.locate(target) else {
            return Ok(false);
        };
        // Reading on from here is no worse
        if cp.out <= self.pos && self.pos <= target {
            return Ok(true);
        }
        if cp.out == 0 {
            self.restart();
            return Ok(true);
        }
        self.inflater =
            Inflater::resume(self.data.clone(), cp.input, cp.bits, cp.out, &cp.window)?;
        self.buf.clear();
        self.bufpos = 0;
        self.pos = cp.out;
        self.verify = None;
        if self.builder.take().is_some() {
            log::debug!("Abandoned gzip index recording on a non-linear read");
        }
        self.stats.resumes += 1;
        Ok(true)
    }
    /// Move to decompressed offset `target`
    pub fn seek_to(&mut self, target: u64) -> HcdResult<u64> {
        if target == self.pos {
            return Ok(target);
        }
        // Within the current chunk
        if target > self.pos && target - self.pos <= (self.buf.len() - self.bufpos) as u64 {
            self.bufpos += (target - self.pos) as usize;
            self.pos = target;
            return Ok(target);
        }
        let near = target > self.pos && target - self.pos <= SKIP_THRESHOLD;
        if !near && !self.resume(target)? && target < self.pos {
            self.restart();
        }
        self.skip_to(target)?;
        Ok(self.pos)
    }
    /// Decompress and discard up to `target`, or end-of-stream
    fn skip_to(&mut self, target: u64) -> HcdResult<()> {
        while self.pos < target {
            if self.bufpos >= self.buf.len() {
                if self.inflater.is_done() {
                    break;
                }
                self.fill()?;
                continue;
            }
            let n = ((self.buf.len() - self.bufpos) as u64).min(target - self.pos);
            self.bufpos += n as usize;
            self.pos += n;
            self.stats.skipped += n;
        }
        Ok(())
    }
    /// Read into `out`, returning the number of bytes read
    fn read_into(&mut self, out: &mut [u8]) -> HcdResult<usize> {
        while self.bufpos >= self.buf.len() {
            if self.inflater.is_done() {
                return Ok(0);
            }
            self.fill()?;
        }
        let n = out.len().min(self.buf.len() - self.bufpos);
        out[..n].copy_from_slice(&self.buf[self.bufpos..self.bufpos + n]);
        self.bufpos += n;
        self.pos += n as u64;
        Ok(n)
    }
}
impl std::fmt::Debug for ZioReader {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ZioReader")
            .field("crc", &self.crc)
            .field("pos", &self.pos)
            .field("indexed", &self.index.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}
impl Read for ZioReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        Ok(self.read_into(out)?)
    }
}
impl Seek for ZioReader {
    fn seek(&mut self, from: SeekFrom) -> std::io::Result<u64> {
        let target = match from {
            SeekFrom::Start(t) => Some(t),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => self.trailer_len()?.checked_add_signed(d),
        };
        let target = target.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "Seek before stream start")
        })?;
        Ok(self.seek_to(target)?)
    }
}

///
/// # Plain Archive
///
#[derive(Debug)]
pub struct PlainArchive {
    cursor: std::io::Cursor<SharedBytes>,
}
impl PlainArchive {
    pub fn new(data: SharedBytes) -> Self {
        Self {
            cursor: std::io::Cursor::new(data),
        }
    }
}
impl Read for PlainArchive {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(out)
    }
}
impl Seek for PlainArchive {
    fn seek(&mut self, from: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(from)
    }
}

///
/// # Archive Stream Trait
///
/// Queries common to every archive flavor.
///
#[enum_dispatch]
pub trait ArchiveStream {
    /// Current (decompressed) position
    fn offset(&self) -> u64;
    /// Checksum of the stored (compressed) content, for compressed archives
    fn checksum(&self) -> Option<u32>;
}
impl ArchiveStream for PlainArchive {
    fn offset(&self) -> u64 {
        self.cursor.position()
    }
    fn checksum(&self) -> Option<u32> {
        None
    }
}
impl ArchiveStream for ZioReader {
    fn offset(&self) -> u64 {
        self.pos
    }
    fn checksum(&self) -> Option<u32> {
        Some(self.crc)
    }
}

///
/// # Source Archive
///
/// Either flavor, chosen by content: gzip if the data starts with its magic number.
///
#[enum_dispatch(ArchiveStream)]
#[derive(Debug)]
pub enum Archive {
    Plain(PlainArchive),
    Gzip(ZioReader),
}
impl Archive {
    /// Open file `fname`
    pub fn open(fname: impl AsRef<Path>) -> HcdResult<Self> {
        Self::from_shared(SharedBytes::map(fname)?)
    }
    /// Create from in-memory content
    pub fn from_bytes(bytes: Vec<u8>) -> HcdResult<Self> {
        Self::from_shared(SharedBytes::from(bytes))
    }
    /// Create from shared content
    pub fn from_shared(data: SharedBytes) -> HcdResult<Self> {
        if is_gzip(data.as_ref()) {
            Ok(Self::Gzip(ZioReader::new(data)?))
        } else {
            Ok(Self::Plain(PlainArchive::new(data)))
        }
    }
    /// Boolean indication of whether we are gzip-compressed
    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Gzip(_))
    }
    /// Mutable access to the gzip reader, if compressed
    pub fn gzip_mut(&mut self) -> Option<&mut ZioReader> {
        match self {
            Self::Gzip(z) => Some(z),
            Self::Plain(_) => None,
        }
    }
}
impl Read for Archive {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(p) => p.read(out),
            Self::Gzip(z) => z.read(out),
        }
    }
}
impl Seek for Archive {
    fn seek(&mut self, from: SeekFrom) -> std::io::Result<u64> {
        match self {
            Self::Plain(p) => p.seek(from),
            Self::Gzip(z) => z.seek(from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn content(n: usize) -> Vec<u8> {
        (0..n).map(|k| ((k * 7 + k / 1000) % 251) as u8).collect()
    }
    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        for piece in data.chunks(20_000) {
            enc.write_all(piece).unwrap();
            enc.flush().unwrap();
        }
        enc.finish().unwrap()
    }

    #[test]
    fn header_fields() -> HcdResult<()> {
        let mut hdr = vec![0x1f, 0x8b, 8, FNAME | FEXTRA, 0, 0, 0, 0, 0, 3];
        hdr.extend_from_slice(&[2, 0, 0xAA, 0xBB]);
        hdr.extend_from_slice(b"lib.gds\0");
        assert_eq!(gzip_header_len(&hdr)?, hdr.len());
        assert!(gzip_header_len(&hdr[..12]).unwrap_err().is_format());
        assert!(gzip_header_len(b"HEADER").unwrap_err().is_format());
        Ok(())
    }
    #[test]
    fn linear_read_verifies_trailer() -> HcdResult<()> {
        let data = content(150_000);
        let mut arch = Archive::from_bytes(gzip(&data))?;
        assert!(arch.is_compressed());
        let mut out = Vec::new();
        arch.read_to_end(&mut out)?;
        assert_eq!(out, data);
        // Corrupt the stored CRC
        let mut bytes = gzip(&data);
        let n = bytes.len();
        bytes[n - 8] ^= 0xFF;
        let mut arch = Archive::from_bytes(bytes)?;
        let err: HcdError = arch.read_to_end(&mut Vec::new()).unwrap_err().into();
        assert!(matches!(err, HcdError::Compression(ZError::Checksum { .. })));
        Ok(())
    }
    #[test]
    fn seeks_match_plain_reads() -> HcdResult<()> {
        let data = content(400_000);
        let gz = gzip(&data);
        // First pass records the index
        let mut rdr = ZioReader::new(SharedBytes::from(gz.clone()))?;
        rdr.record_index(50_000)?;
        std::io::copy(&mut rdr, &mut std::io::sink())?;
        let index = Arc::new(rdr.take_index().unwrap());
        assert!(index.points.len() > 4);

        let mut plain = Archive::from_bytes(data.clone())?;
        let mut indexed = ZioReader::new(SharedBytes::from(gz.clone()))?;
        indexed.set_index(index)?;
        let mut bare = ZioReader::new(SharedBytes::from(gz))?;
        for at in [300_000u64, 10, 399_990, 123_456, 123_400, 0, 200_001] {
            let mut expect = [0u8; 10];
            plain.seek(SeekFrom::Start(at))?;
            plain.read_exact(&mut expect)?;
            for rdr in [&mut indexed, &mut bare] {
                let mut got = [0u8; 10];
                rdr.seek(SeekFrom::Start(at))?;
                rdr.read_exact(&mut got)?;
                assert_eq!(got, expect, "at {}", at);
            }
        }
        assert!(indexed.stats().resumes > 0);
        assert_eq!(bare.stats().resumes, 0);
        assert!(bare.stats().restarts > 0);
        Ok(())
    }
    #[test]
    fn stale_index_is_rejected() -> HcdResult<()> {
        let gz = gzip(&content(1000));
        let mut rdr = ZioReader::new(SharedBytes::from(gz))?;
        let index = Arc::new(ZIndex {
            crc: rdr.crc() ^ 1,
            points: Vec::new(),
        });
        assert!(rdr.set_index(index).unwrap_err().is_compression());
        Ok(())
    }
}
