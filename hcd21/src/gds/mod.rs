//!
//! # GDSII Record Layer
//!
//! Just enough GDSII to digest an archive and to stream one back out.
//! Records stay close to their binary form: a [GdsRecord] is a type-tagged byte payload,
//! and a [GdsElement] the records of one element. Nothing here materializes a library.
//!

// Std-Lib
use std::io::Write;

// Crates.io
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

// Local imports
use crate::attrs::Attrs;
use crate::error::{HcdError, HcdResult};
use crate::geom::{BoundBox, BoundBoxTrait, Point, Transform};

pub mod read;
pub mod write;
pub use read::*;
pub use write::*;

/// Largest payload a single record can carry
pub const MAX_RECORD_DATA: usize = 0xFFFF - 4;

///
/// # GDSII Record Types
///
/// In order as decoded from the record-type byte.
///
#[derive(FromPrimitive, Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum GdsRecordType {
    Header = 0x00,
    BgnLib,
    LibName,
    Units,
    EndLib,
    BgnStruct,
    StructName,
    EndStruct,
    Boundary,
    Path,
    StructRef,
    ArrayRef,
    Text,
    Layer,
    DataType,
    Width,
    Xy,
    EndElement,
    StructRefName,
    ColRow,
    TextNode,
    Node,
    TextType,
    Presentation,
    Spacing,
    String,
    Strans,
    Mag,
    Angle,
    Uinteger,
    Ustring,
    RefLibs,
    Fonts,
    PathType,
    Generations,
    AttrTable,
    StypTable,
    StrType,
    ElemFlags,
    ElemKey,
    LinkType,
    LinkKeys,
    Nodetype,
    PropAttr,
    PropValue,
    Box,
    BoxType,
    Plex,
    BeginExtn,
    EndExtn,
    TapeNum,
    TapeCode,
    StrClass,
    Reserved,
    Format,
    Mask,
    EndMasks,
    LibDirSize,
    SrfName,
    LibSecur,
}
impl GdsRecordType {
    /// Boolean indication of valid record types.
    /// Discontinued, unreleased and reserved types are invalid.
    pub fn valid(&self) -> bool {
        !matches!(
            self,
            Self::TextNode
                | Self::Spacing
                | Self::Uinteger
                | Self::Ustring
                | Self::StypTable
                | Self::StrType
                | Self::ElemKey
                | Self::LinkType
                | Self::LinkKeys
                | Self::StrClass
                | Self::Reserved
        )
    }
}

/// # GDSII Data Types
#[derive(FromPrimitive, Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum GdsDataType {
    NoData = 0,
    BitArray = 1,
    I16 = 2,
    I32 = 3,
    F32 = 4,
    F64 = 5,
    Str = 6,
}
impl GdsDataType {
    /// Size of each payload item, in bytes
    pub fn item_size(&self) -> usize {
        match self {
            Self::NoData | Self::Str => 1,
            Self::BitArray | Self::I16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// # Record Header
/// Decoded record-type, data-type, and payload length in bytes (excluding the four header bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GdsRecordHeader {
    pub rtype: GdsRecordType,
    pub dtype: GdsDataType,
    pub len: u16,
}

///
/// # GDSII Eight-Byte Real
///
/// Namespace for conversion between GDSII's excess-64, base-16 reals and IEEE doubles.
///
pub struct GdsFloat64;
impl GdsFloat64 {
    /// Decode GDSII's eight-byte representation, stored as a `u64`
    pub fn decode(val: u64) -> f64 {
        let neg = val & 0x8000_0000_0000_0000 != 0;
        let exp = ((val >> 56) & 0x7F) as i32 - 64;
        let mantissa = (val & 0x00FF_FFFF_FFFF_FFFF) as f64 / 2f64.powi(56);
        let mag = mantissa * 16f64.powi(exp);
        if neg {
            -mag
        } else {
            mag
        }
    }
    /// Encode `val` into GDSII's eight bytes, stored as `u64`
    pub fn encode(val: f64) -> u64 {
        if val == 0.0 || !val.is_finite() {
            return 0;
        }
        let sign: u64 = if val < 0.0 { 0x8000_0000_0000_0000 } else { 0 };
        let mut mag = val.abs();
        // Normalize the mantissa into [1/16, 1)
        let mut exp: i32 = 0;
        while mag >= 1.0 {
            mag /= 16.0;
            exp += 1;
        }
        while mag < 1.0 / 16.0 {
            mag *= 16.0;
            exp -= 1;
        }
        let mut mantissa = (mag * 2f64.powi(56)).round() as u64;
        if mantissa >= 1 << 56 {
            // Rounded up into the next exponent
            mantissa >>= 4;
            exp += 1;
        }
        let exp = (exp + 64).clamp(0, 127) as u64;
        sign | (exp << 56) | (mantissa & 0x00FF_FFFF_FFFF_FFFF)
    }
}

///
/// # GDSII Record
///
/// Record-type, data-type, and raw big-endian payload.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GdsRecord {
    pub rtype: GdsRecordType,
    pub dtype: GdsDataType,
    pub data: Vec<u8>,
}
impl GdsRecord {
    /// Create a payload-free record
    pub fn no_data(rtype: GdsRecordType) -> Self {
        Self {
            rtype,
            dtype: GdsDataType::NoData,
            data: Vec::new(),
        }
    }
    /// Create a record of 16-bit integers
    pub fn from_i16s(rtype: GdsRecordType, vals: &[i16]) -> Self {
        let mut data = vec![0; 2 * vals.len()];
        BigEndian::write_i16_into(vals, &mut data);
        Self {
            rtype,
            dtype: GdsDataType::I16,
            data,
        }
    }
    /// Create a record of 32-bit integers
    pub fn from_i32s(rtype: GdsRecordType, vals: &[i32]) -> Self {
        let mut data = vec![0; 4 * vals.len()];
        BigEndian::write_i32_into(vals, &mut data);
        Self {
            rtype,
            dtype: GdsDataType::I32,
            data,
        }
    }
    /// Create a record of eight-byte reals
    pub fn from_f64s(rtype: GdsRecordType, vals: &[f64]) -> Self {
        let mut data = Vec::with_capacity(8 * vals.len());
        for v in vals {
            data.extend_from_slice(&GdsFloat64::encode(*v).to_be_bytes());
        }
        Self {
            rtype,
            dtype: GdsDataType::F64,
            data,
        }
    }
    /// Create a string record, padded to even length
    pub fn from_str(rtype: GdsRecordType, s: &str) -> Self {
        let mut data = s.as_bytes().to_vec();
        if data.len() % 2 != 0 {
            data.push(0);
        }
        Self {
            rtype,
            dtype: GdsDataType::Str,
            data,
        }
    }
    /// Create a two-byte bit-array record
    pub fn from_bits(rtype: GdsRecordType, bits: u16) -> Self {
        Self {
            rtype,
            dtype: GdsDataType::BitArray,
            data: bits.to_be_bytes().to_vec(),
        }
    }
    /// Payload as 16-bit integers
    pub fn i16s(&self) -> Vec<i16> {
        self.data
            .chunks_exact(2)
            .map(BigEndian::read_i16)
            .collect()
    }
    /// Payload as 32-bit integers
    pub fn i32s(&self) -> Vec<i32> {
        self.data
            .chunks_exact(4)
            .map(BigEndian::read_i32)
            .collect()
    }
    /// Payload as reals
    pub fn f64s(&self) -> Vec<f64> {
        self.data
            .chunks_exact(8)
            .map(|c| GdsFloat64::decode(BigEndian::read_u64(c)))
            .collect()
    }
    /// Payload as a bit-array
    pub fn bits(&self) -> u16 {
        match self.data.as_slice() {
            [a, b, ..] => u16::from_be_bytes([*a, *b]),
            _ => 0,
        }
    }
    /// Payload as a string, stripping any trailing NUL padding
    pub fn string(&self) -> HcdResult<String> {
        let end = self
            .data
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |k| k + 1);
        Ok(std::str::from_utf8(&self.data[..end])?.to_string())
    }
    /// First 16-bit integer, if any
    pub fn i16(&self) -> Option<i16> {
        self.i16s().first().copied()
    }
    /// First real, if any
    pub fn f64(&self) -> Option<f64> {
        self.f64s().first().copied()
    }
    /// Encoded length, including the header
    pub fn encoded_len(&self) -> usize {
        4 + self.data.len()
    }
    /// Write the binary encoding to `dest`
    pub fn encode(&self, dest: &mut impl Write) -> HcdResult<()> {
        if self.data.len() > MAX_RECORD_DATA || self.data.len() % 2 != 0 {
            return Err(HcdError::Unsupported(format!(
                "{:?} record payload of {} bytes",
                self.rtype,
                self.data.len()
            )));
        }
        dest.write_u16::<BigEndian>(self.encoded_len() as u16)?;
        dest.write_u8(self.rtype as u8)?;
        dest.write_u8(self.dtype as u8)?;
        dest.write_all(&self.data)?;
        Ok(())
    }
}

/// # Element Kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElemKind {
    Boundary,
    Path,
    Sref,
    Aref,
    Text,
    Node,
    Box,
}
impl ElemKind {
    /// Kind begun by record-type `rtype`, if any
    pub fn from_record(rtype: GdsRecordType) -> Option<Self> {
        match rtype {
            GdsRecordType::Boundary => Some(Self::Boundary),
            GdsRecordType::Path => Some(Self::Path),
            GdsRecordType::StructRef => Some(Self::Sref),
            GdsRecordType::ArrayRef => Some(Self::Aref),
            GdsRecordType::Text => Some(Self::Text),
            GdsRecordType::Node => Some(Self::Node),
            GdsRecordType::Box => Some(Self::Box),
            _ => None,
        }
    }
    /// Record-type beginning this kind
    pub fn record_type(&self) -> GdsRecordType {
        match self {
            Self::Boundary => GdsRecordType::Boundary,
            Self::Path => GdsRecordType::Path,
            Self::Sref => GdsRecordType::StructRef,
            Self::Aref => GdsRecordType::ArrayRef,
            Self::Text => GdsRecordType::Text,
            Self::Node => GdsRecordType::Node,
            Self::Box => GdsRecordType::Box,
        }
    }
    /// Boolean indication of cell-reference kinds
    pub fn is_ref(&self) -> bool {
        matches!(self, Self::Sref | Self::Aref)
    }
}

/// STRANS reflection bit
const STRANS_REFLECT: u16 = 0x8000;

///
/// # GDSII Element
///
/// An element's kind, and every record between its opening record and its `ENDEL`.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GdsElement {
    pub kind: ElemKind,
    pub records: Vec<GdsRecord>,
}
impl GdsElement {
    /// First record of type `rtype`
    pub fn find(&self, rtype: GdsRecordType) -> Option<&GdsRecord> {
        self.records.iter().find(|r| r.rtype == rtype)
    }
    /// Layer number
    pub fn layer(&self) -> Option<i16> {
        self.find(GdsRecordType::Layer).and_then(GdsRecord::i16)
    }
    /// Data-type, or its text/box/node-type equivalent
    pub fn datatype(&self) -> Option<i16> {
        self.records
            .iter()
            .find(|r| {
                matches!(
                    r.rtype,
                    GdsRecordType::DataType
                        | GdsRecordType::TextType
                        | GdsRecordType::BoxType
                        | GdsRecordType::Nodetype
                )
            })
            .and_then(GdsRecord::i16)
    }
    /// Coordinates
    pub fn xy(&self) -> Vec<Point> {
        self.find(GdsRecordType::Xy)
            .map(|r| {
                r.i32s()
                    .chunks_exact(2)
                    .map(|c| Point::new(c[0], c[1]))
                    .collect()
            })
            .unwrap_or_default()
    }
    /// Path width, if specified
    pub fn width(&self) -> Option<i32> {
        self.find(GdsRecordType::Width)
            .and_then(|r| r.i32s().first().copied())
    }
    /// Referenced struct name
    pub fn sname(&self) -> HcdResult<Option<String>> {
        self.find(GdsRecordType::StructRefName)
            .map(GdsRecord::string)
            .transpose()
    }
    /// Boolean indication of attached properties
    pub fn has_properties(&self) -> bool {
        self.find(GdsRecordType::PropAttr).is_some()
    }
    /// Bounding box of a geometric element. Empty for references, texts and nodes.
    pub fn bbox(&self) -> BoundBox {
        match self.kind {
            ElemKind::Boundary | ElemKind::Box => self.xy().bbox(),
            ElemKind::Path => {
                let mut bb = self.xy().bbox();
                if !bb.is_empty() {
                    bb.expand(self.width().unwrap_or(0).saturating_abs() / 2);
                }
                bb
            }
            _ => BoundBox::empty(),
        }
    }
    /// Placement attributes and origin of a reference element
    pub fn placement(&self) -> HcdResult<(Attrs, Point)> {
        let reflect = self
            .find(GdsRecordType::Strans)
            .map_or(false, |r| r.bits() & STRANS_REFLECT != 0);
        let mag = self
            .find(GdsRecordType::Mag)
            .and_then(GdsRecord::f64)
            .unwrap_or(1.0);
        let angle = self
            .find(GdsRecordType::Angle)
            .and_then(GdsRecord::f64)
            .unwrap_or(0.0);
        let attrs = Attrs::new(reflect, angle, mag);
        let pts = self.xy();
        match self.kind {
            ElemKind::Sref => {
                let origin = pts
                    .first()
                    .copied()
                    .ok_or_else(|| HcdError::format("SREF without coordinates"))?;
                Ok((attrs, origin))
            }
            ElemKind::Aref => {
                let colrow = self
                    .find(GdsRecordType::ColRow)
                    .map(GdsRecord::i16s)
                    .ok_or_else(|| HcdError::format("AREF without COLROW"))?;
                if colrow.len() < 2 || pts.len() < 3 || colrow[0] < 1 || colrow[1] < 1 {
                    return Err(HcdError::format("Invalid AREF dimensions"));
                }
                let (cols, rows) = (colrow[0] as i32, colrow[1] as i32);
                let (p0, pc, pr) = (pts[0], pts[1], pts[2]);
                let col = Point::new(pitch(p0.x, pc.x, cols)?, pitch(p0.y, pc.y, cols)?);
                let row = Point::new(pitch(p0.x, pr.x, rows)?, pitch(p0.y, pr.y, rows)?);
                Ok((attrs.arrayed(cols as u32, rows as u32, col, row), p0))
            }
            _ => Err(HcdError::msg("Not a reference element")),
        }
    }
    /// Create a reference element placing `name` with `attrs` at `origin`
    pub fn reference(name: &str, attrs: &Attrs, origin: Point) -> HcdResult<Self> {
        let mut records = vec![GdsRecord::from_str(GdsRecordType::StructRefName, name)];
        let angle = attrs.angle();
        if attrs.orient.reflected() || attrs.mag != 1.0 || angle != 0.0 {
            let bits = if attrs.orient.reflected() {
                STRANS_REFLECT
            } else {
                0
            };
            records.push(GdsRecord::from_bits(GdsRecordType::Strans, bits));
            if attrs.mag != 1.0 {
                records.push(GdsRecord::from_f64s(GdsRecordType::Mag, &[attrs.mag]));
            }
            if angle != 0.0 {
                records.push(GdsRecord::from_f64s(GdsRecordType::Angle, &[angle]));
            }
        }
        let kind = match &attrs.array {
            None => {
                records.push(GdsRecord::from_i32s(GdsRecordType::Xy, &[origin.x, origin.y]));
                ElemKind::Sref
            }
            Some(a) => {
                let too_big = |n: u32| n > i16::MAX as u32;
                if too_big(a.cols) || too_big(a.rows) {
                    return Err(HcdError::Unsupported(format!(
                        "{} x {} array exceeds GDSII limits",
                        a.cols, a.rows
                    )));
                }
                records.push(GdsRecord::from_i16s(
                    GdsRecordType::ColRow,
                    &[a.cols as i16, a.rows as i16],
                ));
                let pc = corner(origin, a.col, a.cols)?;
                let pr = corner(origin, a.row, a.rows)?;
                records.push(GdsRecord::from_i32s(
                    GdsRecordType::Xy,
                    &[origin.x, origin.y, pc.x, pc.y, pr.x, pr.y],
                ));
                ElemKind::Aref
            }
        };
        Ok(Self { kind, records })
    }
    /// Create a copy with every coordinate transformed by `trans`.
    /// Path widths scale with the transform's magnification.
    pub fn transformed(&self, trans: &Transform) -> Self {
        let scale = trans.scale();
        let records = self
            .records
            .iter()
            .map(|r| match r.rtype {
                GdsRecordType::Xy => {
                    let pts: Vec<i32> = r
                        .i32s()
                        .chunks_exact(2)
                        .flat_map(|c| {
                            let p = Point::new(c[0], c[1]).transform(trans);
                            [p.x, p.y]
                        })
                        .collect();
                    GdsRecord::from_i32s(GdsRecordType::Xy, &pts)
                }
                GdsRecordType::Width if scale != 1.0 => {
                    let w = r.i32s().first().copied().unwrap_or(0);
                    let w = (w as f64 * scale).round() as i32;
                    GdsRecord::from_i32s(GdsRecordType::Width, &[w])
                }
                _ => r.clone(),
            })
            .collect();
        Self {
            kind: self.kind,
            records,
        }
    }
    /// Write to `dest`, from opening record through `ENDEL`
    pub fn encode(&self, dest: &mut impl Write) -> HcdResult<()> {
        GdsRecord::no_data(self.kind.record_type()).encode(dest)?;
        for r in self.records.iter() {
            r.encode(dest)?;
        }
        GdsRecord::no_data(GdsRecordType::EndElement).encode(dest)
    }
}

/// AREF corner `n` steps of `step` from `origin`
fn corner(origin: Point, step: Point, n: u32) -> HcdResult<Point> {
    let at = |o: i32, d: i32| {
        i32::try_from(o as i64 + d as i64 * n as i64)
            .map_err(|_| HcdError::Unsupported("AREF corner exceeds GDSII coordinates".into()))
    };
    Ok(Point::new(at(origin.x, step.x)?, at(origin.y, step.y)?))
}
/// Per-step AREF pitch from `p0` to corner coordinate `p1` over `n` steps
fn pitch(p0: i32, p1: i32, n: i32) -> HcdResult<i32> {
    let d = (p1 as i64 - p0 as i64) / n as i64;
    i32::try_from(d).map_err(|_| HcdError::format("AREF pitch out of range"))
}

/// Encode a sequence of elements into raw record bytes
pub fn encode_elements(elems: &[GdsElement]) -> HcdResult<Vec<u8>> {
    let mut buf = Vec::new();
    for e in elems {
        e.encode(&mut buf)?;
    }
    Ok(buf)
}
