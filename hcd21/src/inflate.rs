//!
//! # Resumable Raw-DEFLATE Decoder
//!
//! Decodes a raw DEFLATE stream held in memory, with three abilities general-purpose bindings lack:
//!
//! * Stopping at every block boundary, reporting [Progress::Boundary].
//! * Reporting its exact compressed position, down to the bit.
//! * Resuming mid-stream from a bit position plus a snapshot of the preceding 32 KiB of output.
//!
//! Together these let [crate::zindex] record checkpoints in one pass, and [crate::zio] seek by them.
//!

// Local imports
use crate::error::{HcdResult, ZError};
use crate::zio::SharedBytes;

/// Size of the DEFLATE history window
pub const WINDOW_SIZE: usize = 32768;
const WINDOW_MASK: usize = WINDOW_SIZE - 1;

/// Bits resolved by a single lookup in the fast Huffman tables
const FAST_BITS: u32 = 9;
/// Longest code length
const MAX_BITS: usize = 15;

/// Code-length code order
const CLEN_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];
/// Length bases and extra bits, for symbols 257..=285
const LBASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131,
    163, 195, 227, 258,
];
const LEXT: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];
/// Distance bases and extra bits
const DBASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];
const DEXT: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];

///
/// # Canonical Huffman Decoding Table
///
/// Codes of up to [FAST_BITS] bits resolve in one lookup of `fast`,
/// indexed by the next (bit-reversed) input bits. Longer codes fall back to a canonical walk.
///
#[derive(Debug, Clone)]
struct Huffman {
    /// Number of codes of each length
    counts: [u16; MAX_BITS + 1],
    /// Symbols, ordered by code
    symbols: Vec<u16>,
    /// Fast table. Entries are `(length << 9) | symbol`, zero where no short code applies.
    fast: Vec<u16>,
}
impl Huffman {
    /// Build from per-symbol code lengths. Over-subscribed codes are rejected, incomplete ones allowed.
    fn new(lengths: &[u8]) -> Result<Self, &'static str> {
        let mut counts = [0u16; MAX_BITS + 1];
        for len in lengths.iter() {
            counts[*len as usize] += 1;
        }
        counts[0] = 0;
        let mut left: i32 = 1;
        for len in 1..=MAX_BITS {
            left <<= 1;
            left -= counts[len] as i32;
            if left < 0 {
                return Err("Over-subscribed Huffman code");
            }
        }
        // Symbols in canonical order
        let mut offs = [0usize; MAX_BITS + 2];
        for len in 1..=MAX_BITS {
            offs[len + 1] = offs[len] + counts[len] as usize;
        }
        let mut symbols = vec![0u16; offs[MAX_BITS + 1]];
        for (sym, len) in lengths.iter().enumerate() {
            if *len != 0 {
                symbols[offs[*len as usize]] = sym as u16;
                offs[*len as usize] += 1;
            }
        }
        // Fast table
        let mut fast = vec![0u16; 1 << FAST_BITS];
        let mut next_code = [0u32; MAX_BITS + 1];
        let mut code = 0u32;
        for len in 1..=MAX_BITS {
            code = (code + counts[len - 1] as u32) << 1;
            next_code[len] = code;
        }
        for (sym, len) in lengths.iter().enumerate() {
            let len = *len as u32;
            if len == 0 {
                continue;
            }
            let code = next_code[len as usize];
            next_code[len as usize] += 1;
            if len > FAST_BITS {
                continue;
            }
            let rev = code.reverse_bits() >> (32 - len);
            let entry = ((len << 9) | sym as u32) as u16;
            for k in 0..(1u32 << (FAST_BITS - len)) {
                fast[(rev | (k << len)) as usize] = entry;
            }
        }
        Ok(Self {
            counts,
            symbols,
            fast,
        })
    }
    /// The fixed literal/length and distance tables
    fn fixed() -> (Self, Self) {
        let mut lens = [0u8; 288];
        for (k, len) in lens.iter_mut().enumerate() {
            *len = match k {
                0..=143 => 8,
                144..=255 => 9,
                256..=279 => 7,
                _ => 8,
            };
        }
        // Neither table is over-subscribed
        let lit = Self::new(&lens).unwrap_or_else(|_| Self::empty());
        let dist = Self::new(&[5u8; 30]).unwrap_or_else(|_| Self::empty());
        (lit, dist)
    }
    fn empty() -> Self {
        Self {
            counts: [0; MAX_BITS + 1],
            symbols: Vec::new(),
            fast: vec![0; 1 << FAST_BITS],
        }
    }
}

/// Literal/length and distance tables of the current block
#[derive(Debug, Clone)]
struct Tables {
    lit: Huffman,
    dist: Huffman,
}

#[derive(Debug, Clone)]
enum State {
    /// At a block boundary, next reading a block header
    Header,
    /// Inside a stored block, with this many bytes remaining
    Stored(usize),
    /// Inside a Huffman-coded block
    Codes(Box<Tables>),
    /// Past the final block
    Done,
}

/// # Decoding Progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Output limit reached, mid-block
    More,
    /// A (non-final) block just ended
    Boundary,
    /// The final block ended
    End,
}

///
/// # Inflater
///
#[derive(Debug, Clone)]
pub struct Inflater {
    /// Compressed data. Positions are relative to its start.
    data: SharedBytes,
    /// Next byte to load into `bitbuf`
    pos: usize,
    /// Bit buffer, least-significant bits first
    bitbuf: u64,
    /// Valid bits in `bitbuf`
    bitcnt: u32,
    /// History ring
    window: Vec<u8>,
    /// Next write position in `window`
    wpos: usize,
    /// Valid history bytes
    have: usize,
    /// Bytes produced since the stream start
    total_out: u64,
    state: State,
    /// Whether the current block is the final one
    last_block: bool,
}
impl Inflater {
    /// Create an inflater starting at byte `start` of `data`, at the beginning of a DEFLATE stream
    pub fn new(data: SharedBytes, start: usize) -> Self {
        Self {
            data,
            pos: start,
            bitbuf: 0,
            bitcnt: 0,
            window: vec![0; WINDOW_SIZE],
            wpos: 0,
            have: 0,
            total_out: 0,
            state: State::Header,
            last_block: false,
        }
    }
    /// Create an inflater resuming at a block boundary:
    /// compressed bit position `input * 8 + bits`, having produced `out` bytes, the last of which are `window`.
    pub fn resume(data: SharedBytes, input: u64, bits: u8, out: u64, window: &[u8]) -> HcdResult<Self> {
        if window.len() != WINDOW_SIZE || bits > 7 {
            return Err(ZError::Corrupt {
                msg: "Invalid checkpoint".into(),
                bitpos: input * 8 + bits as u64,
            }
            .into());
        }
        let mut me = Self::new(data, input as usize);
        me.window.copy_from_slice(window);
        me.have = (out as usize).min(WINDOW_SIZE);
        me.total_out = out;
        me.bits(bits as u32)?;
        Ok(me)
    }
    /// Bytes produced since the stream start
    pub fn total_out(&self) -> u64 {
        self.total_out
    }
    /// Compressed position, as (byte offset, bit offset within that byte)
    pub fn bit_position(&self) -> (u64, u8) {
        let consumed = self.pos as u64 * 8 - self.bitcnt as u64;
        (consumed / 8, (consumed % 8) as u8)
    }
    /// Byte offset just past the final block. Meaningful once [Progress::End] is reported.
    pub fn end_offset(&self) -> u64 {
        let (byte, bits) = self.bit_position();
        byte + if bits > 0 { 1 } else { 0 }
    }
    /// Boolean indication of whether the final block has ended
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }
    /// Copy of the last [WINDOW_SIZE] bytes of output, oldest first
    pub fn window_snapshot(&self) -> Vec<u8> {
        let mut rv = Vec::with_capacity(WINDOW_SIZE);
        rv.extend_from_slice(&self.window[self.wpos..]);
        rv.extend_from_slice(&self.window[..self.wpos]);
        rv
    }
    /// Decode up to (about) `limit` bytes onto `out`, stopping early at any block boundary
    pub fn decode_into(&mut self, out: &mut Vec<u8>, limit: usize) -> HcdResult<Progress> {
        let stop = out.len() + limit;
        loop {
            match std::mem::replace(&mut self.state, State::Header) {
                State::Done => {
                    self.state = State::Done;
                    return Ok(Progress::End);
                }
                State::Header => self.block_header()?,
                State::Stored(mut remaining) => {
                    while remaining > 0 && out.len() < stop {
                        let b = self.bits(8)? as u8;
                        self.put(out, b);
                        remaining -= 1;
                    }
                    if remaining > 0 {
                        self.state = State::Stored(remaining);
                        return Ok(Progress::More);
                    }
                    return Ok(self.block_done());
                }
                State::Codes(tables) => {
                    if self.codes(&tables, out, stop)? {
                        return Ok(self.block_done());
                    }
                    self.state = State::Codes(tables);
                    return Ok(Progress::More);
                }
            }
        }
    }
    /// Read a block header, setting our state
    fn block_header(&mut self) -> HcdResult<()> {
        self.last_block = self.bits(1)? == 1;
        self.state = match self.bits(2)? {
            0 => {
                // Stored. Discard to a byte boundary, then LEN and NLEN.
                let drop = self.bitcnt % 8;
                self.bits(drop)?;
                let len = self.bits(16)?;
                let nlen = self.bits(16)?;
                if len != !nlen & 0xFFFF {
                    return Err(self.corrupt("Stored block length check failed"));
                }
                State::Stored(len as usize)
            }
            1 => {
                let (lit, dist) = Huffman::fixed();
                State::Codes(Box::new(Tables { lit, dist }))
            }
            2 => State::Codes(Box::new(self.dynamic_tables()?)),
            _ => return Err(self.corrupt("Invalid block type")),
        };
        Ok(())
    }
    /// Transition out of a finished block
    fn block_done(&mut self) -> Progress {
        if self.last_block {
            self.state = State::Done;
            Progress::End
        } else {
            self.state = State::Header;
            Progress::Boundary
        }
    }
    /// Read the code-length preamble of a dynamic block
    fn dynamic_tables(&mut self) -> HcdResult<Tables> {
        let nlen = self.bits(5)? as usize + 257;
        let ndist = self.bits(5)? as usize + 1;
        let ncode = self.bits(4)? as usize + 4;
        if nlen > 286 || ndist > 30 {
            return Err(self.corrupt("Too many length or distance codes"));
        }
        let mut clens = [0u8; 19];
        for k in CLEN_ORDER.iter().take(ncode) {
            clens[*k] = self.bits(3)? as u8;
        }
        let lencode = Huffman::new(&clens).map_err(|e| self.corrupt(e))?;
        let mut lens = vec![0u8; nlen + ndist];
        let mut idx = 0;
        while idx < nlen + ndist {
            let sym = self.decode(&lencode)?;
            let (val, rep) = match sym {
                0..=15 => (sym as u8, 1),
                16 => {
                    if idx == 0 {
                        return Err(self.corrupt("Repeat with no previous length"));
                    }
                    (lens[idx - 1], 3 + self.bits(2)? as usize)
                }
                17 => (0, 3 + self.bits(3)? as usize),
                18 => (0, 11 + self.bits(7)? as usize),
                _ => return Err(self.corrupt("Invalid code-length symbol")),
            };
            if idx + rep > nlen + ndist {
                return Err(self.corrupt("Code lengths overrun"));
            }
            lens[idx..idx + rep].iter_mut().for_each(|l| *l = val);
            idx += rep;
        }
        if lens[256] == 0 {
            return Err(self.corrupt("Missing end-of-block code"));
        }
        let lit = Huffman::new(&lens[..nlen]).map_err(|e| self.corrupt(e))?;
        let dist = Huffman::new(&lens[nlen..]).map_err(|e| self.corrupt(e))?;
        Ok(Tables { lit, dist })
    }
    /// Decode symbols of a Huffman-coded block until `out` reaches `stop` bytes.
    /// Returns `true` if the block ended.
    fn codes(&mut self, tables: &Tables, out: &mut Vec<u8>, stop: usize) -> HcdResult<bool> {
        while out.len() < stop {
            let sym = self.decode(&tables.lit)? as usize;
            if sym < 256 {
                self.put(out, sym as u8);
                continue;
            }
            if sym == 256 {
                return Ok(true);
            }
            let li = sym - 257;
            if li >= LBASE.len() {
                return Err(self.corrupt("Invalid length symbol"));
            }
            let len = LBASE[li] as usize + self.bits(LEXT[li] as u32)? as usize;
            let di = self.decode(&tables.dist)? as usize;
            if di >= DBASE.len() {
                return Err(self.corrupt("Invalid distance symbol"));
            }
            let dist = DBASE[di] as usize + self.bits(DEXT[di] as u32)? as usize;
            if dist > self.have {
                return Err(self.corrupt("Distance too far back"));
            }
            for _ in 0..len {
                let b = self.window[(self.wpos + WINDOW_SIZE - dist) & WINDOW_MASK];
                self.put(out, b);
            }
        }
        Ok(false)
    }
    /// Emit one output byte
    #[inline]
    fn put(&mut self, out: &mut Vec<u8>, b: u8) {
        out.push(b);
        self.window[self.wpos] = b;
        self.wpos = (self.wpos + 1) & WINDOW_MASK;
        if self.have < WINDOW_SIZE {
            self.have += 1;
        }
        self.total_out += 1;
    }
    /// Decode one symbol with table `h`
    fn decode(&mut self, h: &Huffman) -> HcdResult<u16> {
        self.refill();
        if self.bitcnt >= FAST_BITS {
            let entry = h.fast[(self.bitbuf & ((1 << FAST_BITS) - 1)) as usize];
            if entry != 0 {
                let len = (entry >> 9) as u32;
                self.bitbuf >>= len;
                self.bitcnt -= len;
                return Ok(entry & 0x1FF);
            }
        }
        // Canonical walk, one bit at a time
        let (mut code, mut first, mut index) = (0i32, 0i32, 0i32);
        for len in 1..=MAX_BITS {
            code |= self.bits(1)? as i32;
            let count = h.counts[len] as i32;
            if code - count < first {
                return Ok(h.symbols[(index + (code - first)) as usize]);
            }
            index += count;
            first += count;
            first <<= 1;
            code <<= 1;
        }
        Err(self.corrupt("Invalid Huffman code"))
    }
    /// Top up the bit buffer from the input
    #[inline]
    fn refill(&mut self) {
        let data = self.data.as_ref();
        while self.bitcnt <= 56 && self.pos < data.len() {
            self.bitbuf |= (data[self.pos] as u64) << self.bitcnt;
            self.pos += 1;
            self.bitcnt += 8;
        }
    }
    /// Read `n` (up to 16) bits
    #[inline]
    fn bits(&mut self, n: u32) -> HcdResult<u32> {
        if n == 0 {
            return Ok(0);
        }
        if self.bitcnt < n {
            self.refill();
            if self.bitcnt < n {
                return Err(ZError::Truncated.into());
            }
        }
        let v = (self.bitbuf & ((1u64 << n) - 1)) as u32;
        self.bitbuf >>= n;
        self.bitcnt -= n;
        Ok(v)
    }
    fn corrupt(&self, msg: &str) -> crate::error::HcdError {
        let (byte, bits) = self.bit_position();
        ZError::Corrupt {
            msg: msg.into(),
            bitpos: byte * 8 + bits as u64,
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    /// Compress `data` to raw DEFLATE, flushing a block every `chunk` bytes
    fn deflate(data: &[u8], level: u32, chunk: usize) -> Vec<u8> {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::new(level));
        for piece in data.chunks(chunk) {
            enc.write_all(piece).unwrap();
            enc.flush().unwrap();
        }
        enc.finish().unwrap()
    }
    /// Something compressible, but not trivially so
    fn sample(n: usize) -> Vec<u8> {
        let mut x: u32 = 12345;
        (0..n)
            .map(|k| {
                x = x.wrapping_mul(1103515245).wrapping_add(12345);
                if k % 3 == 0 {
                    (x >> 24) as u8
                } else {
                    b"cell_hierarchy_digest"[k % 21]
                }
            })
            .collect()
    }
    fn inflate_all(inf: &mut Inflater) -> HcdResult<(Vec<u8>, usize)> {
        let mut out = Vec::new();
        let mut boundaries = 0;
        loop {
            match inf.decode_into(&mut out, 1000)? {
                Progress::More => (),
                Progress::Boundary => boundaries += 1,
                Progress::End => return Ok((out, boundaries)),
            }
        }
    }

    #[test]
    fn inflates_all_block_types() -> HcdResult<()> {
        let data = sample(200_000);
        // Level zero produces stored blocks, level one mostly fixed or dynamic ones
        for level in [0, 1, 6, 9] {
            let packed = deflate(&data, level, 50_000);
            let mut inf = Inflater::new(SharedBytes::from(packed), 0);
            let (out, boundaries) = inflate_all(&mut inf)?;
            assert_eq!(out, data, "level {}", level);
            assert!(boundaries >= 3);
            assert!(inf.is_done());
        }
        // Tiny inputs get fixed-code blocks
        let packed = deflate(b"abcabcabcabc", 6, 100);
        let (out, _) = inflate_all(&mut Inflater::new(SharedBytes::from(packed), 0))?;
        assert_eq!(out, b"abcabcabcabc");
        Ok(())
    }
    #[test]
    fn resumes_from_a_boundary() -> HcdResult<()> {
        let data = sample(300_000);
        let packed = SharedBytes::from(deflate(&data, 6, 40_000));
        let mut inf = Inflater::new(packed.clone(), 0);
        let mut out = Vec::new();
        // Run to the third boundary, and snapshot
        let mut seen = 0;
        while seen < 3 {
            if inf.decode_into(&mut out, 4096)? == Progress::Boundary {
                seen += 1;
            }
        }
        let (input, bits) = inf.bit_position();
        let snap = inf.window_snapshot();
        let at = inf.total_out();
        assert_eq!(at as usize, out.len());
        let mut resumed = Inflater::resume(packed, input, bits, at, &snap)?;
        let (rest, _) = inflate_all(&mut resumed)?;
        assert_eq!(&rest[..], &data[at as usize..]);
        Ok(())
    }
    #[test]
    fn truncated_and_corrupt_streams() {
        let data = sample(50_000);
        let packed = deflate(&data, 6, 50_000);
        let short = SharedBytes::from(packed[..packed.len() / 2].to_vec());
        let err = inflate_all(&mut Inflater::new(short, 0)).unwrap_err();
        assert!(err.is_compression());
        // Block type three is reserved
        let bad = SharedBytes::from(vec![0x07u8, 0, 0, 0]);
        let err = inflate_all(&mut Inflater::new(bad, 0)).unwrap_err();
        assert!(err.is_compression());
    }
}
