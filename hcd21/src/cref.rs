//!
//! # Instance-Reference Lists
//!
//! Each cell's child placements form an append-only list, in one of two representations:
//!
//! * Plain: consecutive fixed [CrefRecord]s in a [RecordArena], the final one flagged [CREF_LAST].
//! * Compressed: one or more byte-store segments, chained by ticket.
//!
//! ## Segment Encoding
//!
//! A segment opens with its value table: a varint count, then that many signed varints.
//! Then one record per placement: a header byte, then the payloads its bits call for.
//!
//! | Bit    | Meaning                                               |
//! | ------ | ----------------------------------------------------- |
//! | `0x01` | Child id follows                                      |
//! | `0x02` | Attribute ticket follows                              |
//! | `0x04` | X delta follows                                       |
//! | `0x08` | Y delta follows                                       |
//! | `0x10` | X delta is a value-table index                        |
//! | `0x20` | Y delta is a value-table index                        |
//! | `0x40` | User flag                                             |
//! | `0x80` | Last record of the list                               |
//!
//! Absent fields repeat their predecessor's value (deltas repeat the previous *delta*).
//! Every segment starts from zeroed state, so each can be decoded (and compressed) on its own.
//! The table bits never appear without their delta bits, which frees two header values:
//! [HDR_CHAIN] (followed by a four-byte little-endian segment ticket) and [HDR_END] (end, no record).
//!

// Std-Lib
use std::borrow::Cow;
use std::collections::HashMap;

// Local imports
use crate::arena::{RecordArena, Ticket};
use crate::attrs::AttrTicket;
use crate::bio::{ReadHcdExt, WriteHcdExt};
use crate::error::{HcdError, HcdResult};
use crate::symtab::ListState;
use crate::zbytes::ZByteStore;

/// [CrefRecord] flag: user flag
pub const CREF_FLAG: u8 = 0x01;
/// [CrefRecord] flag: last record of its list
pub const CREF_LAST: u8 = 0x02;

const HDR_CHILD: u8 = 0x01;
const HDR_ATTR: u8 = 0x02;
const HDR_DX: u8 = 0x04;
const HDR_DY: u8 = 0x08;
const HDR_DX_TAB: u8 = 0x10;
const HDR_DY_TAB: u8 = 0x20;
const HDR_FLAG: u8 = 0x40;
const HDR_LAST: u8 = 0x80;
/// Header: chain to the segment whose ticket follows
pub const HDR_CHAIN: u8 = HDR_DX_TAB | HDR_DY_TAB;
/// Header: end of list, carrying no record
pub const HDR_END: u8 = HDR_LAST | HDR_DX_TAB | HDR_DY_TAB;

/// Deltas of at least this magnitude are value-table candidates
const LARGE_DELTA: u32 = 64;
/// Value-table capacity, keeping indices to two varint bytes
const MAX_TABLE: usize = 16384;

///
/// # Fixed Instance Record
///
/// Arena-resident form of a placement.
///
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrefRecord {
    /// Raw child-symbol ticket
    pub child: u32,
    /// Attribute ticket
    pub attr: AttrTicket,
    pub x: i32,
    pub y: i32,
    /// `CREF_*` flags
    pub flags: u8,
}
/// In-memory size of a [CrefRecord]
pub const CREF_RECORD_SIZE: usize = std::mem::size_of::<CrefRecord>();

///
/// # Instance Reference
///
/// Decoded placement, as produced by a [CrefStream].
///
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CRef {
    /// Child cell. A raw symbol ticket in memory, a name id in digest files.
    pub child: u32,
    /// Attribute ticket
    pub attr: AttrTicket,
    pub x: i32,
    pub y: i32,
    /// User flag
    pub flag: bool,
}
impl CRef {
    /// Ticket of our child symbol
    pub fn child_ticket(&self) -> HcdResult<Ticket> {
        Ticket::from_raw(self.child).ok_or_else(|| HcdError::format("Instance of null child"))
    }
    /// Convert to a fixed record
    pub fn record(&self, last: bool) -> CrefRecord {
        let mut flags = 0;
        if self.flag {
            flags |= CREF_FLAG;
        }
        if last {
            flags |= CREF_LAST;
        }
        CrefRecord {
            child: self.child,
            attr: self.attr,
            x: self.x,
            y: self.y,
            flags,
        }
    }
}
impl From<&CrefRecord> for CRef {
    fn from(r: &CrefRecord) -> Self {
        Self {
            child: r.child,
            attr: r.attr,
            x: r.x,
            y: r.y,
            flag: r.flags & CREF_FLAG != 0,
        }
    }
}

/// # Segment Termination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEnd {
    /// Final segment. Its last record carries the last-bit.
    Last,
    /// Chain to segment ticket. Zero is a placeholder, patched once the next segment exists.
    Chain(u32),
}

/// Encode `crefs` into a single segment
pub fn encode_segment(crefs: &[CRef], end: SegmentEnd) -> HcdResult<Vec<u8>> {
    // Compute deltas, and the table of repeated large ones
    let mut deltas = Vec::with_capacity(crefs.len());
    let (mut px, mut py) = (0i32, 0i32);
    for c in crefs {
        deltas.push((c.x.wrapping_sub(px), c.y.wrapping_sub(py)));
        px = c.x;
        py = c.y;
    }
    let mut sightings: HashMap<i32, u32> = HashMap::new();
    let mut table: Vec<i32> = Vec::new();
    let mut index: HashMap<i32, u32> = HashMap::new();
    for (dx, dy) in deltas.iter() {
        for d in [*dx, *dy] {
            if d.unsigned_abs() < LARGE_DELTA {
                continue;
            }
            let seen = sightings.entry(d).or_insert(0);
            *seen += 1;
            if *seen == 2 && table.len() < MAX_TABLE {
                index.insert(d, table.len() as u32);
                table.push(d);
            }
        }
    }
    let mut buf = Vec::with_capacity(crefs.len() * 4 + 16);
    buf.write_u32v(table.len() as u32)?;
    for v in table.iter() {
        buf.write_i32v(*v)?;
    }
    // Write the records
    let (mut pchild, mut pattr, mut pdx, mut pdy) = (0u32, 0u32, 0i32, 0i32);
    let mut payload = Vec::with_capacity(24);
    for (k, (c, (dx, dy))) in crefs.iter().zip(deltas.iter()).enumerate() {
        payload.clear();
        let mut hdr = 0u8;
        if c.child != pchild {
            hdr |= HDR_CHILD;
            payload.write_u32v(c.child)?;
        }
        if c.attr != pattr {
            hdr |= HDR_ATTR;
            payload.write_u32v(c.attr)?;
        }
        if *dx != pdx {
            hdr |= HDR_DX;
            match index.get(dx) {
                Some(ix) => {
                    hdr |= HDR_DX_TAB;
                    payload.write_u32v(*ix)?;
                }
                None => payload.write_i32v(*dx)?,
            }
        }
        if *dy != pdy {
            hdr |= HDR_DY;
            match index.get(dy) {
                Some(ix) => {
                    hdr |= HDR_DY_TAB;
                    payload.write_u32v(*ix)?;
                }
                None => payload.write_i32v(*dy)?,
            }
        }
        if c.flag {
            hdr |= HDR_FLAG;
        }
        if end == SegmentEnd::Last && k + 1 == crefs.len() {
            hdr |= HDR_LAST;
        }
        buf.push(hdr);
        buf.extend_from_slice(&payload);
        pchild = c.child;
        pattr = c.attr;
        pdx = *dx;
        pdy = *dy;
    }
    match end {
        SegmentEnd::Last if crefs.is_empty() => buf.push(HDR_END),
        SegmentEnd::Last => (),
        SegmentEnd::Chain(t) => {
            buf.push(HDR_CHAIN);
            buf.extend_from_slice(&t.to_le_bytes());
        }
    }
    Ok(buf)
}

/// One decoding step within a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStep {
    /// A record, and whether it is the list's last
    Record(CRef, bool),
    /// Chain to another segment
    Chain(u32),
    /// End of list, with no further record
    End,
}

///
/// # Segment Decoder
///
/// Decoding state for a single segment.
/// Reads from any byte slice, tracking its own position.
///
#[derive(Debug, Default)]
pub struct SegmentDecoder {
    table: Vec<i32>,
    pos: usize,
    prev: CRef,
    dx: i32,
    dy: i32,
}
impl SegmentDecoder {
    /// Start decoding segment `data`, reading its value table
    pub fn start(data: &[u8]) -> HcdResult<Self> {
        let mut rdr = data;
        let count = rdr.read_u32v()? as usize;
        if count > MAX_TABLE {
            return Err(HcdError::format(format!("Invalid value-table size {}", count)));
        }
        let mut table = Vec::with_capacity(count);
        for _ in 0..count {
            table.push(rdr.read_i32v()?);
        }
        Ok(Self {
            table,
            pos: data.len() - rdr.len(),
            ..Default::default()
        })
    }
    /// Decode the next step of segment `data`
    pub fn step(&mut self, data: &[u8]) -> HcdResult<SegmentStep> {
        let mut rdr = data
            .get(self.pos..)
            .ok_or_else(|| HcdError::format("Instance segment overrun"))?;
        let hdr = rdr.read_byte()?;
        let rv = match hdr {
            HDR_CHAIN => SegmentStep::Chain(rdr.read_u32le()?),
            HDR_END => SegmentStep::End,
            _ => {
                if (hdr & HDR_DX_TAB != 0 && hdr & HDR_DX == 0)
                    || (hdr & HDR_DY_TAB != 0 && hdr & HDR_DY == 0)
                {
                    return Err(HcdError::format(format!(
                        "Invalid instance header {:#04x}",
                        hdr
                    )));
                }
                let mut c = self.prev;
                if hdr & HDR_CHILD != 0 {
                    c.child = rdr.read_u32v()?;
                }
                if hdr & HDR_ATTR != 0 {
                    c.attr = rdr.read_u32v()?;
                }
                if hdr & HDR_DX != 0 {
                    self.dx = self.delta(&mut rdr, hdr & HDR_DX_TAB != 0)?;
                }
                if hdr & HDR_DY != 0 {
                    self.dy = self.delta(&mut rdr, hdr & HDR_DY_TAB != 0)?;
                }
                if c.child == 0 {
                    return Err(HcdError::format("Instance record without a child"));
                }
                c.x = c.x.wrapping_add(self.dx);
                c.y = c.y.wrapping_add(self.dy);
                c.flag = hdr & HDR_FLAG != 0;
                self.prev = c;
                SegmentStep::Record(c, hdr & HDR_LAST != 0)
            }
        };
        self.pos = data.len() - rdr.len();
        Ok(rv)
    }
    fn delta(&self, rdr: &mut &[u8], indexed: bool) -> HcdResult<i32> {
        if !indexed {
            return rdr.read_i32v();
        }
        let ix = rdr.read_u32v()? as usize;
        self.table
            .get(ix)
            .copied()
            .ok_or_else(|| HcdError::format(format!("Invalid value-table index {}", ix)))
    }
}

/// Decode a complete, stand-alone segment.
/// Returns its records, and its chain target if it ends in one.
pub fn decode_segment(data: &[u8]) -> HcdResult<(Vec<CRef>, Option<u32>)> {
    let mut dec = SegmentDecoder::start(data)?;
    let mut rv = Vec::new();
    loop {
        match dec.step(data)? {
            SegmentStep::Record(c, last) => {
                rv.push(c);
                if last {
                    return Ok((rv, None));
                }
            }
            SegmentStep::Chain(t) => return Ok((rv, Some(t))),
            SegmentStep::End => return Ok((rv, None)),
        }
    }
}

///
/// # Compressed-List Iterator
///
/// Forward-only and non-restartable. Follows chain records across segments.
///
pub struct PackedCrefs<'a> {
    store: &'a ZByteStore,
    seg: Cow<'a, [u8]>,
    dec: SegmentDecoder,
    done: bool,
    /// Segments visited
    segments: usize,
    /// Encoded bytes visited
    encoded: usize,
}
impl<'a> PackedCrefs<'a> {
    /// Start iterating at segment `head`
    pub fn new(store: &'a ZByteStore, head: Ticket) -> HcdResult<Self> {
        let seg = store.resolve(head)?;
        let dec = SegmentDecoder::start(&seg)?;
        let encoded = seg.len();
        Ok(Self {
            store,
            seg,
            dec,
            done: false,
            segments: 1,
            encoded,
        })
    }
    /// Number of segments visited so far
    pub fn segments(&self) -> usize {
        self.segments
    }
    /// Encoded bytes visited so far
    pub fn encoded_len(&self) -> usize {
        self.encoded
    }
    fn advance(&mut self) -> HcdResult<Option<CRef>> {
        loop {
            match self.dec.step(&self.seg)? {
                SegmentStep::Record(c, last) => {
                    self.done = last;
                    return Ok(Some(c));
                }
                SegmentStep::End => {
                    self.done = true;
                    return Ok(None);
                }
                SegmentStep::Chain(raw) => {
                    let t = Ticket::from_raw(raw)
                        .ok_or_else(|| HcdError::format("Unresolved instance-segment chain"))?;
                    self.seg = self.store.resolve(t)?;
                    self.dec = SegmentDecoder::start(&self.seg)?;
                    self.segments += 1;
                    self.encoded += self.seg.len();
                }
            }
        }
    }
}
impl<'a> Iterator for PackedCrefs<'a> {
    type Item = HcdResult<CRef>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(c)) => Some(Ok(c)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

///
/// # Plain-List Iterator
///
pub struct PlainCrefs<'a> {
    arena: &'a RecordArena<CrefRecord>,
    cur: Option<Ticket>,
}
impl<'a> PlainCrefs<'a> {
    pub fn new(arena: &'a RecordArena<CrefRecord>, head: Ticket) -> Self {
        Self {
            arena,
            cur: Some(head),
        }
    }
}
impl<'a> Iterator for PlainCrefs<'a> {
    type Item = HcdResult<CRef>;
    fn next(&mut self) -> Option<Self::Item> {
        let t = self.cur.take()?;
        let rec = match self.arena.get(t) {
            Some(rec) => rec,
            None => return Some(Err(HcdError::format("Invalid instance-record ticket"))),
        };
        if rec.flags & CREF_LAST == 0 {
            match self.arena.next(t) {
                Some(nxt) => self.cur = Some(nxt),
                None => return Some(Err(HcdError::format("Unterminated instance list"))),
            }
        }
        Some(Ok(CRef::from(rec)))
    }
}

///
/// # Instance Stream
///
/// Lazily-decoded placements of one cell, whichever their representation.
///
pub enum CrefStream<'a> {
    Empty,
    Plain(PlainCrefs<'a>),
    Packed(PackedCrefs<'a>),
}
impl<'a> CrefStream<'a> {
    /// Create a stream over the list in state `list`
    pub fn new(
        list: &ListState,
        arena: &'a RecordArena<CrefRecord>,
        store: &'a ZByteStore,
    ) -> HcdResult<Self> {
        match *list {
            ListState::Empty => Ok(Self::Empty),
            ListState::Plain { head } => Ok(Self::Plain(PlainCrefs::new(arena, ticket(head)?))),
            ListState::Sealed { head } => Ok(Self::Packed(PackedCrefs::new(store, ticket(head)?)?)),
            ListState::Open { .. } => Err(HcdError::msg("Instance list is still being built")),
        }
    }
    /// Decode everything remaining
    pub fn collect_all(self) -> HcdResult<Vec<CRef>> {
        self.collect()
    }
}
impl<'a> Iterator for CrefStream<'a> {
    type Item = HcdResult<CRef>;
    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Empty => None,
            Self::Plain(p) => p.next(),
            Self::Packed(p) => p.next(),
        }
    }
}
fn ticket(raw: u32) -> HcdResult<Ticket> {
    Ticket::from_raw(raw).ok_or_else(|| HcdError::format("Null instance-list head"))
}

/// Store `crefs` as a complete compressed list of segments of at most `per_segment` records.
/// Segments are written back to front, so each knows its successor's ticket up front.
pub fn store_packed(
    store: &mut ZByteStore,
    crefs: &[CRef],
    per_segment: usize,
) -> HcdResult<ListState> {
    if crefs.is_empty() {
        return Ok(ListState::Empty);
    }
    let chunks: Vec<&[CRef]> = crefs.chunks(per_segment.max(1)).collect();
    let mut next: Option<Ticket> = None;
    for chunk in chunks.iter().rev() {
        let end = match next {
            None => SegmentEnd::Last,
            Some(t) => SegmentEnd::Chain(t.raw()),
        };
        let bytes = encode_segment(chunk, end)?;
        next = Some(store.store_sealed(&bytes)?);
    }
    Ok(ListState::Sealed {
        head: Ticket::raw_or_zero(next),
    })
}

/// Store `crefs` as a plain chain of consecutive records
pub fn store_plain(arena: &mut RecordArena<CrefRecord>, crefs: &[CRef]) -> HcdResult<ListState> {
    let mut head = None;
    for (k, c) in crefs.iter().enumerate() {
        let t = arena.push(c.record(k + 1 == crefs.len()))?;
        head.get_or_insert(t);
    }
    Ok(match head {
        None => ListState::Empty,
        Some(t) => ListState::Plain { head: t.raw() },
    })
}

///
/// # Live List Writer
///
/// Appends placements to the one list currently being built.
/// Records are staged in the record arena. In compressed mode, each time the arena's current block fills,
/// the staged records are flushed as an open segment and the blocks behind them released.
///
#[derive(Debug, Default)]
pub struct CrefWriter {
    /// First staged record
    first: Option<Ticket>,
    /// Last staged record
    last: Option<Ticket>,
    /// Number of staged records
    staged: usize,
    /// Earliest staged record not yet released. Everything from here to the arena's end has been flushed
    /// whenever no records are staged.
    watermark: Option<Ticket>,
}
impl CrefWriter {
    /// Append `cref` to the list in state `list`
    pub fn add(
        &mut self,
        arena: &mut RecordArena<CrefRecord>,
        store: &mut ZByteStore,
        list: &mut ListState,
        compress: bool,
        cref: &CRef,
    ) -> HcdResult<()> {
        let t = arena.push(cref.record(false))?;
        self.first.get_or_insert(t);
        if compress {
            self.watermark.get_or_insert(t);
        }
        self.last = Some(t);
        self.staged += 1;
        match (*list, compress) {
            (ListState::Empty, false) => *list = ListState::Plain { head: t.raw() },
            (ListState::Empty, true) => *list = ListState::Open { head: 0, tail: 0 },
            _ => (),
        }
        if compress {
            if let Some(next) = arena.peek_next() {
                if arena.is_block_start(next) {
                    self.flush(arena, store, list, SegmentEnd::Chain(0))?;
                    self.reclaim(arena);
                }
            }
        }
        Ok(())
    }
    /// Close the list in state `list`
    pub fn close(
        &mut self,
        arena: &mut RecordArena<CrefRecord>,
        store: &mut ZByteStore,
        list: &mut ListState,
    ) -> HcdResult<()> {
        match *list {
            ListState::Empty | ListState::Sealed { .. } => (),
            ListState::Plain { .. } => {
                if let Some(last) = self.last {
                    let rec = arena
                        .get_mut(last)
                        .ok_or_else(|| HcdError::msg("Staged instance record missing"))?;
                    rec.flags |= CREF_LAST;
                }
            }
            ListState::Open { head, tail } => {
                if self.staged > 0 {
                    self.flush(arena, store, list, SegmentEnd::Last)?;
                } else if let Some(tail) = Ticket::from_raw(tail) {
                    // Final segment turned out empty. Rewrite the tail's chain record as end-of-list.
                    let len = store.payload_mut(tail)?.len();
                    store.patch(tail, len - 5, &[HDR_END])?;
                    store.seal(tail)?;
                    *list = ListState::Sealed { head };
                } else {
                    *list = ListState::Empty;
                }
                self.reclaim(arena);
            }
        }
        self.first = None;
        self.last = None;
        self.staged = 0;
        Ok(())
    }
    /// Release arena blocks holding only flushed records
    fn reclaim(&mut self, arena: &mut RecordArena<CrefRecord>) {
        if let (Some(lo), Some(hi)) = (self.watermark, arena.peek_next()) {
            let n = arena.clear_range(lo, hi);
            if n > 0 {
                log::debug!("Released {} instance-arena blocks", n);
            }
        }
    }
    /// Encode and store the staged records as a segment
    fn flush(
        &mut self,
        arena: &RecordArena<CrefRecord>,
        store: &mut ZByteStore,
        list: &mut ListState,
        end: SegmentEnd,
    ) -> HcdResult<()> {
        let mut crefs = Vec::with_capacity(self.staged);
        let mut cur = self.first;
        while let Some(t) = cur {
            let rec = arena
                .get(t)
                .ok_or_else(|| HcdError::msg("Staged instance record missing"))?;
            crefs.push(CRef::from(rec));
            cur = if Some(t) == self.last {
                None
            } else {
                arena.next(t)
            };
        }
        let bytes = encode_segment(&crefs, end)?;
        let seg = store.store(&bytes)?;
        let (head, prev) = match *list {
            ListState::Open { head, tail } => (head, Ticket::from_raw(tail)),
            _ => return Err(HcdError::msg("Flushing a list which is not open")),
        };
        if let Some(prev) = prev {
            // Point the previous segment's chain record here, and seal it
            let len = store.payload_mut(prev)?.len();
            store.patch(prev, len - 4, &seg.raw().to_le_bytes())?;
            store.seal(prev)?;
        }
        let head = if head == 0 { seg.raw() } else { head };
        *list = match end {
            SegmentEnd::Last => {
                store.seal(seg)?;
                ListState::Sealed { head }
            }
            SegmentEnd::Chain(_) => ListState::Open {
                head,
                tail: seg.raw(),
            },
        };
        log::debug!("Flushed instance segment of {} records", crefs.len());
        self.first = None;
        self.last = None;
        self.staged = 0;
        Ok(())
    }
}
