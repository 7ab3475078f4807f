//!
//! # Name and Symbol Tables
//!
//! Interned cell names, and one [SymRef] descriptor per cell per [Mode],
//! stored as fixed records in a [RecordArena] and addressed by [Ticket].
//!

// Std-Lib
use std::collections::HashMap;
use std::sync::Arc;

// Crates.io
use serde::{Deserialize, Serialize};

// Local imports
use crate::arena::{RecordArena, Ticket};
use crate::error::{HcdError, HcdResult};
use crate::geom::BoundBox;

/// # Cell View Mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Physical,
    Electrical,
}
impl Mode {
    /// All modes, in table order
    pub const ALL: [Mode; 2] = [Mode::Physical, Mode::Electrical];
    /// Table index
    pub fn index(&self) -> usize {
        match self {
            Self::Physical => 0,
            Self::Electrical => 1,
        }
    }
}
impl Default for Mode {
    fn default() -> Self {
        Self::Physical
    }
}

/// Index into a [StringTable]. Zero is never issued.
pub type NameRef = u32;

///
/// # String Table
///
/// Interned names, numbered from one in order of first appearance.
///
#[derive(Debug, Default)]
pub struct StringTable {
    names: Vec<Arc<str>>,
    ids: HashMap<Arc<str>, NameRef>,
}
impl StringTable {
    /// Intern `name`, returning its id
    pub fn intern(&mut self, name: &str) -> NameRef {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let s: Arc<str> = Arc::from(name);
        self.names.push(s.clone());
        let id = self.names.len() as NameRef;
        self.ids.insert(s, id);
        id
    }
    /// Get the name with id `id`
    pub fn get(&self, id: NameRef) -> Option<&str> {
        let idx = (id as usize).checked_sub(1)?;
        self.names.get(idx).map(|s| &**s)
    }
    /// Find the id of `name`, if interned
    pub fn find(&self, name: &str) -> Option<NameRef> {
        self.ids.get(name).copied()
    }
    /// Iterate over (id, name) pairs, in id order
    pub fn iter(&self) -> impl Iterator<Item = (NameRef, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(k, s)| (k as NameRef + 1, &**s))
    }
    pub fn len(&self) -> usize {
        self.names.len()
    }
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// [SymRef] flag: defined in the source, rather than only referenced
pub const SYM_DEFINED: u16 = 0x01;
/// [SymRef] flag: `bbox` includes all descendants
pub const SYM_BB_OK: u16 = 0x02;
/// [SymRef] flag: instantiated by at least one other cell
pub const SYM_REFERENCED: u16 = 0x04;

/// Source feature: the cell has geometric elements
pub const FEAT_GEOMETRY: u16 = 0x01;
/// Source feature: the cell has text elements
pub const FEAT_TEXT: u16 = 0x02;
/// Source feature: the cell has array references
pub const FEAT_ARRAYS: u16 = 0x04;
/// Source feature: the cell has element properties
pub const FEAT_PROPERTIES: u16 = 0x08;

///
/// # Instance-List State
///
/// Raw tickets are into the instance-record arena for [ListState::Plain],
/// and into the byte store for the compressed states.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    /// No instances
    Empty,
    /// Chain of fixed records starting at `head`
    Plain { head: u32 },
    /// Compressed segments still being appended.
    /// `tail` is the last flushed segment, which ends in a chain record awaiting its target.
    /// Both are zero until the first segment is flushed.
    Open { head: u32, tail: u32 },
    /// Complete compressed list, starting at segment `head`
    Sealed { head: u32 },
}
impl Default for ListState {
    fn default() -> Self {
        Self::Empty
    }
}

///
/// # Symbol Reference
///
/// Per-cell descriptor.
///
#[derive(Debug, Clone, Copy, Default)]
pub struct SymRef {
    /// Interned name
    pub name: NameRef,
    /// `SYM_*` flags
    pub flags: u16,
    /// `FEAT_*` flags, from the source archive
    pub features: u16,
    /// Numeric cell id, as used by CIF-like sources. Zero if none.
    pub num: u32,
    /// Bounding box. Own geometry only, until [SYM_BB_OK] is set.
    pub bbox: BoundBox,
    /// Byte offset of the cell's definition in its source
    pub offset: u64,
    /// Number of instance records
    pub ninst: u32,
    /// Instance list
    pub list: ListState,
}
impl SymRef {
    /// Boolean indication of whether the cell is defined
    pub fn is_defined(&self) -> bool {
        self.flags & SYM_DEFINED != 0
    }
    /// Boolean indication of whether our `bbox` is complete
    pub fn bb_ok(&self) -> bool {
        self.flags & SYM_BB_OK != 0
    }
    /// Boolean indication of whether another cell instantiates us
    pub fn is_referenced(&self) -> bool {
        self.flags & SYM_REFERENCED != 0
    }
    /// Boolean indication of whether our instance list is compressed
    pub fn is_compressed(&self) -> bool {
        matches!(self.list, ListState::Open { .. } | ListState::Sealed { .. })
    }
}

///
/// # Name Table
///
/// One [SymRef] per cell name, for a single [Mode].
///
#[derive(Debug)]
pub struct NameTable {
    mode: Mode,
    syms: RecordArena<SymRef>,
    by_name: HashMap<NameRef, Ticket>,
    by_num: HashMap<u32, Ticket>,
    /// Tickets in creation order
    order: Vec<Ticket>,
}
impl NameTable {
    /// Create a new and empty table
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            syms: RecordArena::new("symbols", 10),
            by_name: HashMap::new(),
            by_num: HashMap::new(),
            order: Vec::new(),
        }
    }
    pub fn mode(&self) -> Mode {
        self.mode
    }
    /// Get the [SymRef] for `name`, creating it if necessary.
    /// Returns its ticket, and whether it was newly created.
    pub fn get_or_create(&mut self, name: NameRef) -> HcdResult<(Ticket, bool)> {
        if let Some(t) = self.by_name.get(&name) {
            return Ok((*t, false));
        }
        let t = self.syms.push(SymRef {
            name,
            ..Default::default()
        })?;
        self.by_name.insert(name, t);
        self.order.push(t);
        Ok((t, true))
    }
    /// Find the [SymRef] ticket for `name`
    pub fn find(&self, name: NameRef) -> Option<Ticket> {
        self.by_name.get(&name).copied()
    }
    /// Find the [SymRef] ticket with numeric id `num`
    pub fn find_num(&self, num: u32) -> Option<Ticket> {
        self.by_num.get(&num).copied()
    }
    /// Set the numeric id of symbol `t`
    pub fn set_num(&mut self, t: Ticket, num: u32) -> HcdResult<()> {
        if num == 0 {
            return Err(HcdError::msg("Numeric cell ids must be non-zero"));
        }
        if let Some(other) = self.by_num.get(&num) {
            if *other != t {
                return Err(HcdError::msg(format!("Duplicate numeric cell id {}", num)));
            }
        }
        self.sym_mut(t)?.num = num;
        self.by_num.insert(num, t);
        Ok(())
    }
    /// Get the [SymRef] at ticket `t`
    pub fn get(&self, t: Ticket) -> Option<&SymRef> {
        self.syms.get(t)
    }
    /// Get the [SymRef] at ticket `t`, failing for invalid tickets
    pub fn sym(&self, t: Ticket) -> HcdResult<&SymRef> {
        self.syms
            .get(t)
            .ok_or_else(|| HcdError::format(format!("Invalid symbol ticket {}", t.raw())))
    }
    /// Get the mutable [SymRef] at ticket `t`, failing for invalid tickets
    pub fn sym_mut(&mut self, t: Ticket) -> HcdResult<&mut SymRef> {
        self.syms
            .get_mut(t)
            .ok_or_else(|| HcdError::format(format!("Invalid symbol ticket {}", t.raw())))
    }
    /// Tickets of every [SymRef], in creation order
    pub fn tickets(&self) -> &[Ticket] {
        &self.order
    }
    /// Iterate over (ticket, [SymRef]) pairs, in creation order
    pub fn iter(&self) -> impl Iterator<Item = (Ticket, &SymRef)> {
        self.order
            .iter()
            .filter_map(move |t| self.syms.get(*t).map(|s| (*t, s)))
    }
    pub fn len(&self) -> usize {
        self.order.len()
    }
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
