//!
//! # Ticket Arenas
//!
//! Storage for millions of small records, addressed by integer [Ticket]s rather than pointers.
//! Each arena holds a growable vector of blocks.
//! A ticket packs a block index into its high bits and a position within the block into its low bits,
//! so tickets survive any reallocation of the block vector (or of a block itself),
//! and are never re-issued until the arena is cleared.
//!
//! Two arena flavors:
//!
//! * [ByteArena] - variable-length byte allocations,
//!   in either the [Discipline::Volatile] or [Discipline::NonVolatile] discipline.
//! * [RecordArena] - fixed-size records of a single `Copy` type.
//!

// Std-Lib
use std::num::NonZeroU32;

// Local imports
use crate::error::{HcdError, HcdResult};

///
/// # Ticket
///
/// Opaque, non-zero handle to a record inside a single arena.
/// The raw value zero is reserved for "none", and is represented as `Option<Ticket>::None`.
/// Tickets from different arenas are not comparable.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(NonZeroU32);
impl Ticket {
    /// Create from a raw value. Zero produces `None`.
    pub fn from_raw(raw: u32) -> Option<Ticket> {
        NonZeroU32::new(raw).map(Ticket)
    }
    /// Get our raw integer value
    #[inline]
    pub fn raw(self) -> u32 {
        self.0.get()
    }
    /// Raw value of an optional ticket, zero for `None`
    #[inline]
    pub fn raw_or_zero(t: Option<Ticket>) -> u32 {
        t.map(Ticket::raw).unwrap_or(0)
    }
}

///
/// # Allocation Discipline
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// Partially-filled blocks may be reallocated (grown) by later allocations.
    /// Data borrowed from a ticket is only valid until the next allocation,
    /// a constraint Rust's borrow rules enforce for us.
    Volatile,
    /// Blocks are never reallocated. Allocations which do not fit the current block start a new one,
    /// leaving its tail unused. Addresses of allocated data are stable for the arena's lifetime.
    NonVolatile,
}

/// Byte-arena block
#[derive(Debug, Default)]
struct ByteBlock {
    /// Storage. Length is the block's current capacity.
    data: Vec<u8>,
    /// Bytes in use
    fill: usize,
    /// Set once the block is dropped by [ByteArena::clear_range]
    freed: bool,
}

///
/// # Byte Arena
///
/// Variable-length allocations of raw bytes.
/// Tickets advance by one per byte within a block,
/// and blocks are spaced `1 << bits` apart in ticket-space,
/// which also bounds the largest single allocation.
///
#[derive(Debug)]
pub struct ByteArena {
    /// Arena name, for error reporting
    name: &'static str,
    /// Allocation discipline
    discipline: Discipline,
    /// Log2 of the ticket-space stride between blocks
    bits: u32,
    /// Nominal capacity of new blocks
    block_size: usize,
    /// Maximum number of blocks
    max_blocks: usize,
    /// Blocks
    blocks: Vec<ByteBlock>,
    /// Number of allocations
    count: u64,
}
impl ByteArena {
    /// Create a new and empty [ByteArena].
    /// Blocks are spaced `1 << bits` tickets apart, and are nominally `block_size` bytes.
    pub fn new(name: &'static str, discipline: Discipline, bits: u32, block_size: usize) -> Self {
        let bits = bits.clamp(4, 30);
        Self {
            name,
            discipline,
            bits,
            block_size: block_size.clamp(16, 1 << bits),
            max_blocks: 1usize << (32 - bits),
            blocks: Vec::new(),
            count: 0,
        }
    }
    /// Limit the number of blocks below the ticket-space maximum
    pub fn with_max_blocks(mut self, max_blocks: usize) -> Self {
        self.max_blocks = max_blocks.clamp(1, 1usize << (32 - self.bits));
        self
    }
    /// Get our allocation discipline
    pub fn discipline(&self) -> Discipline {
        self.discipline
    }
    /// Largest single allocation we can serve
    pub fn max_alloc(&self) -> usize {
        (1usize << self.bits) - 1
    }
    /// Allocate `size` zero-filled bytes, returning their [Ticket]
    pub fn allocate(&mut self, size: usize) -> HcdResult<Ticket> {
        let size = size.max(1);
        if size > self.max_alloc() {
            return Err(self.exhausted());
        }
        let stride = 1usize << self.bits;
        let nblocks = self.blocks.len();
        let fits = match self.blocks.last_mut() {
            None => false,
            Some(blk) if blk.fill + size <= blk.data.len() => true,
            Some(blk) => match self.discipline {
                Discipline::NonVolatile => false,
                Discipline::Volatile => {
                    // Grow the current block in place, if its ticket-space allows
                    if blk.fill + size <= stride {
                        let newlen = (blk.fill + size).max(2 * blk.data.len()).min(stride);
                        blk.data.resize(newlen, 0);
                        true
                    } else {
                        false
                    }
                }
            },
        };
        if !fits {
            if nblocks >= self.max_blocks {
                return Err(self.exhausted());
            }
            // Block zero starts at offset one, reserving the all-zero ticket
            let start = if nblocks == 0 { 1 } else { 0 };
            let cap = self.block_size.max(size + start).min(stride);
            self.blocks.push(ByteBlock {
                data: vec![0; cap],
                fill: start,
                freed: false,
            });
        }
        let bidx = self.blocks.len() - 1;
        let blk = &mut self.blocks[bidx];
        let offset = blk.fill;
        blk.fill += size;
        self.count += 1;
        let raw = ((bidx as u32) << self.bits) | offset as u32;
        Ticket::from_raw(raw).ok_or_else(|| self.exhausted())
    }
    /// Allocate and copy in `bytes`
    pub fn store(&mut self, bytes: &[u8]) -> HcdResult<Ticket> {
        let t = self.allocate(bytes.len())?;
        if let Some(dest) = self.get_mut(t, bytes.len()) {
            dest.copy_from_slice(bytes);
        }
        Ok(t)
    }
    /// Split a ticket into (block index, offset)
    #[inline]
    fn split(&self, t: Ticket) -> (usize, usize) {
        let raw = t.raw() as usize;
        (raw >> self.bits, raw & ((1 << self.bits) - 1))
    }
    /// Get `len` bytes starting at ticket `t`.
    /// Returns `None` for tickets out of range, or in blocks dropped by [ByteArena::clear_range].
    pub fn get(&self, t: Ticket, len: usize) -> Option<&[u8]> {
        let (b, off) = self.split(t);
        let blk = self.blocks.get(b)?;
        if blk.freed || off + len > blk.fill {
            return None;
        }
        Some(&blk.data[off..off + len])
    }
    /// Get `len` mutable bytes starting at ticket `t`
    pub fn get_mut(&mut self, t: Ticket, len: usize) -> Option<&mut [u8]> {
        let (b, off) = self.split(t);
        let blk = self.blocks.get_mut(b)?;
        if blk.freed || off + len > blk.fill {
            return None;
        }
        Some(&mut blk.data[off..off + len])
    }
    /// Get all in-use bytes from ticket `t` to the end of its block.
    /// For self-delimiting data whose length the caller does not know up front.
    pub fn tail(&self, t: Ticket) -> Option<&[u8]> {
        let (b, off) = self.split(t);
        let blk = self.blocks.get(b)?;
        if blk.freed || off >= blk.fill {
            return None;
        }
        Some(&blk.data[off..blk.fill])
    }
    /// Drop everything. Previously-issued tickets become invalid, and may be re-issued.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.count = 0;
    }
    /// Drop the storage of every block which lies entirely within tickets `[lo, hi)`.
    /// The block currently being filled is always retained.
    /// Returns the number of blocks dropped.
    pub fn clear_range(&mut self, lo: Ticket, hi: Ticket) -> usize {
        let (lo, hi) = (lo.raw() as usize, hi.raw() as usize);
        let last = self.blocks.len().saturating_sub(1);
        let bits = self.bits;
        let mut dropped = 0;
        for (b, blk) in self.blocks.iter_mut().enumerate().take(last) {
            let start = (b << bits) + if b == 0 { 1 } else { 0 };
            let end = (b << bits) + blk.fill;
            if !blk.freed && lo <= start && end <= hi {
                blk.data = Vec::new();
                blk.freed = true;
                dropped += 1;
            }
        }
        dropped
    }
    /// Number of allocations served
    pub fn allocations(&self) -> u64 {
        self.count
    }
    /// Number of blocks, including dropped ones
    pub fn blocks(&self) -> usize {
        self.blocks.len()
    }
    /// Bytes of memory currently held
    pub fn memory(&self) -> usize {
        self.blocks.iter().map(|b| b.data.len()).sum()
    }
    fn exhausted(&self) -> HcdError {
        HcdError::Exhausted {
            table: self.name,
            tickets: self.count,
        }
    }
}

///
/// # Record Arena
///
/// Fixed-size records of type `T`, blocks of `1 << bits` records each.
/// Records allocated consecutively (with no intervening allocations) are visited in order by [RecordArena::next],
/// which is how plain instance lists chain from one record to the next.
///
#[derive(Debug)]
pub struct RecordArena<T> {
    /// Arena name, for error reporting
    name: &'static str,
    /// Log2 of records per block
    bits: u32,
    /// Maximum number of blocks
    max_blocks: usize,
    /// Blocks. `None` once dropped by [RecordArena::clear_range].
    blocks: Vec<Option<Vec<T>>>,
    /// Number of allocations
    count: u64,
}
impl<T: Copy + Default> RecordArena<T> {
    /// Create a new and empty arena, with `1 << bits` records per block
    pub fn new(name: &'static str, bits: u32) -> Self {
        let bits = bits.clamp(2, 20);
        Self {
            name,
            bits,
            max_blocks: 1usize << (32 - bits),
            blocks: Vec::new(),
            count: 0,
        }
    }
    /// Create with at least `per_block` records per block
    pub fn with_block_records(name: &'static str, per_block: usize) -> Self {
        Self::new(name, per_block.max(4).next_power_of_two().trailing_zeros())
    }
    /// Limit the number of blocks below the ticket-space maximum
    pub fn with_max_blocks(mut self, max_blocks: usize) -> Self {
        self.max_blocks = max_blocks.clamp(1, 1usize << (32 - self.bits));
        self
    }
    /// Records per block
    pub fn per_block(&self) -> usize {
        1 << self.bits
    }
    /// Allocate a new default-valued (zero-filled) record
    pub fn new_item(&mut self) -> HcdResult<Ticket> {
        let per_block = self.per_block();
        let full = match self.blocks.last() {
            Some(Some(blk)) => blk.len() >= per_block,
            _ => true,
        };
        if full {
            if self.blocks.len() >= self.max_blocks {
                return Err(HcdError::Exhausted {
                    table: self.name,
                    tickets: self.count,
                });
            }
            let mut blk = Vec::with_capacity(per_block);
            if self.blocks.is_empty() {
                // Reserve the all-zero ticket
                blk.push(T::default());
            }
            self.blocks.push(Some(blk));
        }
        let bidx = self.blocks.len() - 1;
        let blk = match self.blocks[bidx].as_mut() {
            Some(blk) => blk,
            None => return Err(HcdError::msg("Record arena block unexpectedly dropped")),
        };
        blk.push(T::default());
        let idx = blk.len() - 1;
        self.count += 1;
        let raw = ((bidx as u32) << self.bits) | idx as u32;
        Ticket::from_raw(raw).ok_or(HcdError::Exhausted {
            table: self.name,
            tickets: self.count,
        })
    }
    /// Allocate a record with value `val`
    pub fn push(&mut self, val: T) -> HcdResult<Ticket> {
        let t = self.new_item()?;
        if let Some(rec) = self.get_mut(t) {
            *rec = val;
        }
        Ok(t)
    }
    #[inline]
    fn split(&self, t: Ticket) -> (usize, usize) {
        let raw = t.raw() as usize;
        (raw >> self.bits, raw & ((1 << self.bits) - 1))
    }
    /// Get a reference to the record at ticket `t`
    pub fn get(&self, t: Ticket) -> Option<&T> {
        let (b, i) = self.split(t);
        self.blocks.get(b)?.as_ref()?.get(i)
    }
    /// Get a mutable reference to the record at ticket `t`
    pub fn get_mut(&mut self, t: Ticket) -> Option<&mut T> {
        let (b, i) = self.split(t);
        self.blocks.get_mut(b)?.as_mut()?.get_mut(i)
    }
    /// Boolean indication of whether `t` is the first record of its block
    pub fn is_block_start(&self, t: Ticket) -> bool {
        let (b, i) = self.split(t);
        i == if b == 0 { 1 } else { 0 }
    }
    /// Get the record allocated immediately after `t`, if any
    pub fn next(&self, t: Ticket) -> Option<Ticket> {
        let (b, i) = self.split(t);
        let blk = self.blocks.get(b)?.as_ref()?;
        if i + 1 < blk.len() {
            return Ticket::from_raw(((b as u32) << self.bits) | (i + 1) as u32);
        }
        match self.blocks.get(b + 1) {
            Some(Some(nxt)) if !nxt.is_empty() => Ticket::from_raw(((b + 1) as u32) << self.bits),
            _ => None,
        }
    }
    /// Get the ticket the next call to [RecordArena::new_item] will return, if it succeeds
    pub fn peek_next(&self) -> Option<Ticket> {
        match self.blocks.last() {
            Some(Some(blk)) if blk.len() < self.per_block() => {
                let b = self.blocks.len() - 1;
                Ticket::from_raw(((b as u32) << self.bits) | blk.len() as u32)
            }
            _ => Ticket::from_raw((self.blocks.len() as u32) << self.bits)
                .or_else(|| Ticket::from_raw(1)),
        }
    }
    /// Drop everything
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.count = 0;
    }
    /// Drop every block which lies entirely within tickets `[lo, hi)`.
    /// The block currently being filled is always retained.
    /// Returns the number of blocks dropped.
    pub fn clear_range(&mut self, lo: Ticket, hi: Ticket) -> usize {
        let (lo, hi) = (lo.raw() as usize, hi.raw() as usize);
        let last = self.blocks.len().saturating_sub(1);
        let bits = self.bits;
        let mut dropped = 0;
        for (b, slot) in self.blocks.iter_mut().enumerate().take(last) {
            let len = match slot {
                Some(blk) => blk.len(),
                None => continue,
            };
            let start = (b << bits) + if b == 0 { 1 } else { 0 };
            let end = (b << bits) + len;
            if lo <= start && end <= hi {
                *slot = None;
                dropped += 1;
            }
        }
        dropped
    }
    /// Number of records allocated
    pub fn len(&self) -> u64 {
        self.count
    }
    /// Boolean indication of whether we have allocated anything
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_arena_tickets() -> HcdResult<()> {
        let mut arena = ByteArena::new("test", Discipline::NonVolatile, 8, 64);
        let t0 = arena.store(b"hello")?;
        let t1 = arena.store(b"world")?;
        assert_ne!(t0, t1);
        assert_ne!(t0.raw(), 0);
        assert_eq!(arena.get(t0, 5), Some(&b"hello"[..]));
        assert_eq!(arena.get(t1, 5), Some(&b"world"[..]));
        // Out-of-range reads fail cleanly
        assert_eq!(arena.get(t1, 500), None);
        assert_eq!(arena.get(Ticket::from_raw(0xFFFF_0000).unwrap(), 1), None);
        Ok(())
    }
    #[test]
    fn nonvolatile_addresses_are_stable() -> HcdResult<()> {
        let mut arena = ByteArena::new("stable", Discipline::NonVolatile, 10, 256);
        let t = arena.store(&[1, 2, 3, 4])?;
        let addr = arena.get(t, 4).unwrap().as_ptr();
        for k in 0..10_000 {
            arena.store(&[(k % 251) as u8; 13])?;
        }
        assert_eq!(arena.get(t, 4).unwrap().as_ptr(), addr);
        assert_eq!(arena.get(t, 4).unwrap(), &[1, 2, 3, 4]);
        Ok(())
    }
    #[test]
    fn volatile_blocks_grow() -> HcdResult<()> {
        let mut arena = ByteArena::new("grow", Discipline::Volatile, 12, 16);
        let t = arena.store(&[7; 10])?;
        // Forces the first block to grow, rather than starting a second
        let u = arena.store(&[9; 40])?;
        assert_eq!(arena.blocks(), 1);
        assert_eq!(arena.get(t, 10).unwrap(), &[7; 10]);
        assert_eq!(arena.get(u, 40).unwrap(), &[9; 40]);
        Ok(())
    }
    #[test]
    fn byte_arena_exhaustion() -> HcdResult<()> {
        let mut arena = ByteArena::new("tiny", Discipline::NonVolatile, 8, 256).with_max_blocks(3);
        let mut issued = std::collections::HashSet::new();
        let err = loop {
            match arena.allocate(100) {
                Ok(t) => assert!(issued.insert(t), "ticket re-issued"),
                Err(e) => break e,
            }
        };
        assert!(err.is_exhausted());
        assert_eq!(issued.len(), 6);
        assert_eq!(arena.blocks(), 3);
        // Oversized allocations fail rather than truncate
        assert!(arena.allocate(1000).unwrap_err().is_exhausted());
        Ok(())
    }
    #[test]
    fn byte_arena_clear_range() -> HcdResult<()> {
        let mut arena = ByteArena::new("cr", Discipline::NonVolatile, 6, 64);
        let first = arena.allocate(60)?;
        let second = arena.allocate(60)?;
        let third = arena.allocate(60)?;
        assert_eq!(arena.blocks(), 3);
        // Both earlier blocks are enclosed, the current one is retained
        assert_eq!(arena.clear_range(first, third), 2);
        assert_eq!(arena.get(first, 1), None);
        assert_eq!(arena.get(second, 1), None);
        assert!(arena.get(third, 60).is_some());
        Ok(())
    }
    #[test]
    fn record_arena_chain() -> HcdResult<()> {
        let mut arena: RecordArena<u64> = RecordArena::new("recs", 2);
        let mut tickets = Vec::new();
        for k in 0..10u64 {
            let t = arena.push(k * 10)?;
            tickets.push(t);
        }
        // Block zero holds three records (one reserved), later blocks four
        assert!(arena.is_block_start(tickets[0]));
        assert!(arena.is_block_start(tickets[3]));
        assert!(!arena.is_block_start(tickets[4]));
        assert!(arena.is_block_start(tickets[7]));
        // Walk the chain
        let mut t = Some(tickets[0]);
        let mut vals = Vec::new();
        while let Some(tk) = t {
            vals.push(*arena.get(tk).unwrap());
            t = arena.next(tk);
        }
        assert_eq!(vals, (0..10).map(|k| k * 10).collect::<Vec<_>>());
        assert_eq!(arena.len(), 10);
        Ok(())
    }
    #[test]
    fn record_arena_exhaustion() {
        let mut arena: RecordArena<u32> = RecordArena::new("recs", 2).with_max_blocks(2);
        for _ in 0..7 {
            arena.new_item().unwrap();
        }
        let err = arena.new_item().unwrap_err();
        assert!(err.is_exhausted());
    }
    #[test]
    fn record_arena_clear_range() -> HcdResult<()> {
        let mut arena: RecordArena<u32> = RecordArena::new("recs", 2);
        let head = arena.push(1)?;
        let mut last = head;
        for k in 0..8 {
            last = arena.push(k)?;
        }
        assert_eq!(arena.clear_range(head, last), 2);
        assert_eq!(arena.get(head), None);
        assert_eq!(arena.get(last), Some(&7));
        Ok(())
    }
}
