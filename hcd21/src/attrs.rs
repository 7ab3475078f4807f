//!
//! # Placement Attribute Database
//!
//! Deduplicated storage of instance transforms.
//! An attribute ticket carries the placement's [Orient] code in its low four bits.
//! Simple placements (no array, unit magnification, a multiple-of-45 rotation) are *only* that code,
//! and allocate nothing. Everything else is encoded into a small self-delimiting payload,
//! stored once per distinct payload, and its byte-arena ticket shifted into the upper 28 bits.
//!

// Std-Lib
use std::collections::HashMap;

// Crates.io
use serde::{Deserialize, Serialize};

// Local imports
use crate::arena::{ByteArena, Discipline, Ticket};
use crate::bio::{ReadHcdExt, WriteHcdExt};
use crate::error::{HcdError, HcdResult};
use crate::geom::{Orient, Point, Transform};

/// Attribute ticket. Values below 16 are bare [Orient] codes.
pub type AttrTicket = u32;

// Payload flag bits
const HAS_ARRAY: u8 = 0x01;
const HAS_MAG: u8 = 0x02;
const HAS_ANGLE: u8 = 0x04;

/// # Array Parameters
/// Element `(c, r)` is placed at `origin + c * col + r * row`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayParams {
    /// Number of columns
    pub cols: u32,
    /// Number of rows
    pub rows: u32,
    /// Per-column displacement
    pub col: Point,
    /// Per-row displacement
    pub row: Point,
}

///
/// # Placement Attributes
///
/// Everything about an instance placement other than its location and target cell.
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attrs {
    /// Reflection and nearest 45-degree rotation
    pub orient: Orient,
    /// Exact rotation in degrees, for angles which are not multiples of 45
    pub angle: Option<f64>,
    /// Magnification
    pub mag: f64,
    /// Array parameters, if arrayed
    pub array: Option<ArrayParams>,
}
impl Default for Attrs {
    fn default() -> Self {
        Self {
            orient: Orient::R0,
            angle: None,
            mag: 1.0,
            array: None,
        }
    }
}
impl Attrs {
    /// Create from GDSII-style transform fields
    pub fn new(reflect: bool, angle: f64, mag: f64) -> Self {
        let (orient, exact) = Orient::from_angle(reflect, angle);
        Self {
            orient,
            angle: if exact { None } else { Some(angle) },
            mag,
            array: None,
        }
    }
    /// Builder-style setter of array parameters. One-by-one arrays are no array at all.
    pub fn arrayed(mut self, cols: u32, rows: u32, col: Point, row: Point) -> Self {
        self.array = if cols.max(1) as u64 * rows.max(1) as u64 > 1 {
            Some(ArrayParams {
                cols: cols.max(1),
                rows: rows.max(1),
                col,
                row,
            })
        } else {
            None
        };
        self
    }
    /// Rotation angle in degrees
    pub fn angle(&self) -> f64 {
        self.angle.unwrap_or_else(|| self.orient.angle())
    }
    /// Boolean indication of whether we are representable by our orientation code alone
    pub fn is_simple(&self) -> bool {
        self.array.is_none() && self.mag == 1.0 && self.angle.is_none()
    }
    /// Number of placements, i.e. array elements
    pub fn count(&self) -> u64 {
        match self.array {
            Some(a) => a.cols as u64 * a.rows as u64,
            None => 1,
        }
    }
    /// Transform of a single placement at `origin`
    pub fn transform(&self, origin: &Point) -> Transform {
        Transform::from_placement(origin, self.orient.reflected(), self.angle(), self.mag)
    }
    /// Origins of every placement, rows in order, columns within each row
    pub fn origins(&self, origin: Point) -> impl Iterator<Item = Point> {
        let (cols, rows, col, row) = match self.array {
            Some(a) => (a.cols as i32, a.rows as i32, a.col, a.row),
            None => (1, 1, Point::default(), Point::default()),
        };
        (0..rows).flat_map(move |r| {
            (0..cols).map(move |c| origin.shift(&col.scale(c)).shift(&row.scale(r)))
        })
    }
    /// Origins of the (up to four) corner placements of an array.
    /// Enough to bound the whole array, as placement is linear in (c, r).
    pub fn corner_origins(&self, origin: Point) -> Vec<Point> {
        match self.array {
            None => vec![origin],
            Some(a) => {
                let (c, r) = (a.cols as i32 - 1, a.rows as i32 - 1);
                let cshift = a.col.scale(c);
                let rshift = a.row.scale(r);
                vec![
                    origin,
                    origin.shift(&cshift),
                    origin.shift(&rshift),
                    origin.shift(&cshift).shift(&rshift),
                ]
            }
        }
    }
    /// Encode our non-code fields into a payload
    pub fn encode_payload(&self) -> HcdResult<Vec<u8>> {
        let mut flags = 0;
        if self.array.is_some() {
            flags |= HAS_ARRAY;
        }
        if self.mag != 1.0 {
            flags |= HAS_MAG;
        }
        if self.angle.is_some() {
            flags |= HAS_ANGLE;
        }
        let mut buf = vec![flags];
        if let Some(a) = &self.array {
            buf.write_u32v(a.cols)?;
            buf.write_u32v(a.rows)?;
            for v in [a.col.x, a.col.y, a.row.x, a.row.y] {
                buf.write_i32v(v)?;
            }
        }
        if self.mag != 1.0 {
            buf.write_real(self.mag)?;
        }
        if let Some(angle) = self.angle {
            buf.write_real(angle)?;
        }
        Ok(buf)
    }
    /// Decode a payload written by [Attrs::encode_payload], with orientation code `code`
    pub fn decode_payload(code: u32, rdr: &mut &[u8]) -> HcdResult<Self> {
        let flags = rdr.read_byte()?;
        if flags & !(HAS_ARRAY | HAS_MAG | HAS_ANGLE) != 0 {
            return Err(HcdError::format(format!("Invalid attribute flags {:#x}", flags)));
        }
        let mut attrs = Attrs {
            orient: Orient::from_code(code),
            ..Default::default()
        };
        if flags & HAS_ARRAY != 0 {
            let cols = rdr.read_u32v()?;
            let rows = rdr.read_u32v()?;
            let col = Point::new(rdr.read_i32v()?, rdr.read_i32v()?);
            let row = Point::new(rdr.read_i32v()?, rdr.read_i32v()?);
            attrs = attrs.arrayed(cols, rows, col, row);
        }
        if flags & HAS_MAG != 0 {
            attrs.mag = rdr.read_real()?;
        }
        if flags & HAS_ANGLE != 0 {
            attrs.angle = Some(rdr.read_real()?);
        }
        Ok(attrs)
    }
}

///
/// # Attribute Database
///
#[derive(Debug)]
pub struct AttrDb {
    /// Payload storage
    arena: ByteArena,
    /// Payload bytes to raw arena ticket
    table: HashMap<Vec<u8>, u32>,
}
impl Default for AttrDb {
    fn default() -> Self {
        Self::new()
    }
}
impl AttrDb {
    /// Create a new and empty database
    pub fn new() -> Self {
        // Arena tickets must fit in 28 bits
        let arena = ByteArena::new("attributes", Discipline::NonVolatile, 16, 1 << 16)
            .with_max_blocks(1 << 12);
        Self {
            arena,
            table: HashMap::new(),
        }
    }
    /// Record `attrs`, returning its ticket
    pub fn record(&mut self, attrs: &Attrs) -> HcdResult<AttrTicket> {
        let code = attrs.orient.code();
        if attrs.is_simple() {
            return Ok(code);
        }
        let payload = attrs.encode_payload()?;
        if let Some(raw) = self.table.get(&payload) {
            return Ok((raw << 4) | code);
        }
        let t = self.arena.store(&payload)?;
        let raw = t.raw();
        if raw >= 1 << 28 {
            return Err(HcdError::Exhausted {
                table: "attributes",
                tickets: self.arena.allocations(),
            });
        }
        self.table.insert(payload, raw);
        Ok((raw << 4) | code)
    }
    /// Resolve ticket `t` back into its [Attrs]
    pub fn resolve(&self, t: AttrTicket) -> HcdResult<Attrs> {
        let code = t & 0x0F;
        let raw = t >> 4;
        let ticket = match Ticket::from_raw(raw) {
            None => {
                return Ok(Attrs {
                    orient: Orient::from_code(code),
                    ..Default::default()
                })
            }
            Some(tk) => tk,
        };
        let mut bytes = self
            .arena
            .tail(ticket)
            .ok_or_else(|| HcdError::format(format!("Undefined attribute ticket {}", t)))?;
        Attrs::decode_payload(code, &mut bytes)
    }
    /// Every stored payload with its raw arena ticket, in ticket order
    pub fn entries(&self) -> Vec<(u32, &[u8])> {
        let mut rv: Vec<(u32, &[u8])> = self
            .table
            .iter()
            .map(|(payload, raw)| (*raw, payload.as_slice()))
            .collect();
        rv.sort_unstable_by_key(|e| e.0);
        rv
    }
    /// Number of distinct payloads stored
    pub fn len(&self) -> usize {
        self.table.len()
    }
    /// Boolean indication of whether we hold no payloads
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
    /// Number of arena allocations made
    pub fn allocations(&self) -> u64 {
        self.arena.allocations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_placements_allocate_nothing() -> HcdResult<()> {
        let mut db = AttrDb::new();
        for (reflect, angle) in [(false, 0.0), (true, 90.0), (false, 315.0)] {
            let t = db.record(&Attrs::new(reflect, angle, 1.0))?;
            assert!(t < 16);
            let back = db.resolve(t)?;
            assert_eq!(back.orient.reflected(), reflect);
            assert_eq!(back.angle(), angle);
        }
        assert_eq!(db.allocations(), 0);
        assert!(db.is_empty());
        Ok(())
    }
    #[test]
    fn payloads_are_deduplicated() -> HcdResult<()> {
        let mut db = AttrDb::new();
        let arr = Attrs::new(false, 90.0, 1.0).arrayed(10, 5, Point::new(100, 0), Point::new(0, 100));
        let t1 = db.record(&arr)?;
        let again = Attrs::new(false, 90.0, 1.0).arrayed(10, 5, Point::new(100, 0), Point::new(0, 100));
        let t2 = db.record(&again)?;
        assert_eq!(t1, t2);
        assert!(t1 >= 16);
        assert_eq!(db.allocations(), 1);
        // Same payload, different orientation: new ticket, same storage
        let mut flipped = arr;
        flipped.orient = Orient::new(true, 0);
        let t3 = db.record(&flipped)?;
        assert_ne!(t3, t1);
        assert_eq!(t3 >> 4, t1 >> 4);
        assert_eq!(db.allocations(), 1);
        assert_eq!(db.resolve(t1)?, arr);
        assert_eq!(db.resolve(t3)?, flipped);
        Ok(())
    }
    #[test]
    fn magnified_and_skewed() -> HcdResult<()> {
        let mut db = AttrDb::new();
        let attrs = Attrs::new(false, 30.0, 2.5);
        assert_eq!(attrs.angle, Some(30.0));
        let t = db.record(&attrs)?;
        let back = db.resolve(t)?;
        assert_eq!(back.mag, 2.5);
        assert_eq!(back.angle(), 30.0);
        // Unknown tickets fail cleanly
        assert!(db.resolve(0xFFFF_FFF0).unwrap_err().is_format());
        Ok(())
    }
    #[test]
    fn array_origins() {
        let arr = Attrs::default().arrayed(3, 2, Point::new(10, 0), Point::new(0, 20));
        let pts: Vec<_> = arr.origins(Point::new(1, 1)).collect();
        assert_eq!(pts.len(), 6);
        assert_eq!(pts[0], Point::new(1, 1));
        assert_eq!(pts[2], Point::new(21, 1));
        assert_eq!(pts[3], Point::new(1, 21));
        assert_eq!(arr.corner_origins(Point::new(0, 0))[3], Point::new(20, 20));
        assert_eq!(arr.count(), 6);
    }
}
