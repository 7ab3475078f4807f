//!
//! # GDSII Reading & Scanning
//!

// Std-Lib
use std::io::{Read, Seek, SeekFrom};
use std::mem;

// Crates.io
use byteorder::{BigEndian, ReadBytesExt};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

// Local imports
use super::*;
use crate::error::ErrorHelper;

/// # GdsReader
/// Decodes records from any [Read]er, tracking the byte position of each.
pub struct GdsReader<R: Read> {
    /// Source being read
    src: R,
    /// Byte position within the source
    pos: u64,
}
impl<R: Read> GdsReader<R> {
    /// Create a [GdsReader] over `src`, whose current byte position is `pos`
    pub fn new(src: R, pos: u64) -> Self {
        Self { src, pos }
    }
    /// Get the current byte position
    pub fn pos(&self) -> u64 {
        self.pos
    }
    /// Consume us, returning our source
    pub fn into_inner(self) -> R {
        self.src
    }
    /// Read the next record header
    fn read_header(&mut self) -> HcdResult<GdsRecordHeader> {
        // 16-bit record size, including the four header bytes
        let len = match self.src.read_u16::<BigEndian>()? {
            num if num < 4 || num % 2 != 0 => {
                return self.fail(format!("Invalid record length {}", num))
            }
            num => num - 4,
        };
        let rtype = self.src.read_u8()?;
        let rtype: GdsRecordType = self.unwrap(
            FromPrimitive::from_u8(rtype),
            format!("Invalid record type {:#04x}", rtype),
        )?;
        if !rtype.valid() {
            return self.fail(format!("Unsupported record type {:?}", rtype));
        }
        let dtype = self.src.read_u8()?;
        let dtype: GdsDataType = self.unwrap(
            FromPrimitive::from_u8(dtype),
            format!("Invalid data type {:#04x}", dtype),
        )?;
        if len as usize % dtype.item_size() != 0 {
            return self.fail(format!(
                "{:?} record of {} bytes is not a whole number of {:?}s",
                rtype, len, dtype
            ));
        }
        Ok(GdsRecordHeader { rtype, dtype, len })
    }
    /// Read the next record
    pub fn read_record(&mut self) -> HcdResult<GdsRecord> {
        let GdsRecordHeader { rtype, dtype, len } = self.read_header()?;
        let mut data = vec![0; len as usize];
        self.src.read_exact(&mut data)?;
        self.pos += 4 + len as u64;
        Ok(GdsRecord { rtype, dtype, data })
    }
}
impl<R: Read> ErrorHelper for GdsReader<R> {
    fn err(&self, msg: impl Into<String>) -> HcdError {
        HcdError::format_at(msg, self.pos)
    }
}

/// # Library Header
/// Library-level content preceding the first struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GdsLibHeader {
    /// Stream version
    pub version: i16,
    /// Library name
    pub name: String,
    /// Database units: (user units, meters) per database unit
    pub units: (f64, f64),
}
impl Default for GdsLibHeader {
    fn default() -> Self {
        Self {
            version: 600,
            name: "hcd21".into(),
            units: (1e-3, 1e-9),
        }
    }
}

/// # Struct Header
/// Name and source position of a struct definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GdsStructHeader {
    pub name: String,
    /// Byte offset of its `BGNSTR` record
    pub offset: u64,
}

///
/// # GdsScanner
///
/// A peekable, forward-only walk over library, struct and element records.
///
pub struct GdsScanner<R: Read> {
    /// Reader-helper
    rdr: GdsReader<R>,
    /// Next record, stored for peeking
    nxt: GdsRecord,
    /// Byte position of `nxt`
    nxt_pos: u64,
}
impl<R: Read> GdsScanner<R> {
    /// Create a new [GdsScanner], loading its first record
    pub fn new(mut rdr: GdsReader<R>) -> HcdResult<Self> {
        let nxt_pos = rdr.pos();
        let nxt = rdr.read_record()?;
        Ok(Self { rdr, nxt, nxt_pos })
    }
    /// Consume us, returning our source.
    /// Note the source is positioned past our peeked record.
    pub fn into_inner(self) -> R {
        self.rdr.into_inner()
    }
    /// Peek at our next record, without advancing
    #[inline(always)]
    pub fn peek(&self) -> &GdsRecord {
        &self.nxt
    }
    /// Advance and return the next record
    pub fn next(&mut self) -> HcdResult<GdsRecord> {
        if self.nxt.rtype == GdsRecordType::EndLib {
            // Once we reach [EndLib], keep returning it forever
            return Ok(self.nxt.clone());
        }
        let pos = self.rdr.pos();
        let mut rv = self.rdr.read_record()?;
        mem::swap(&mut rv, &mut self.nxt);
        self.nxt_pos = pos;
        Ok(rv)
    }
    /// Require the next record to be of type `rtype`, and return it
    pub fn expect(&mut self, rtype: GdsRecordType) -> HcdResult<GdsRecord> {
        if self.nxt.rtype != rtype {
            return self.fail(format!("Expected {:?}, found {:?}", rtype, self.nxt.rtype));
        }
        self.next()
    }
    /// Read the library header, through its `UNITS` record.
    /// Optional library-level records are skipped.
    pub fn read_library(&mut self) -> HcdResult<GdsLibHeader> {
        let version = self.expect(GdsRecordType::Header)?.i16().unwrap_or(0);
        self.expect(GdsRecordType::BgnLib)?;
        let mut name = None;
        loop {
            let record = self.next()?;
            match record.rtype {
                GdsRecordType::LibName => name = Some(record.string()?),
                GdsRecordType::Units => {
                    let units = record.f64s();
                    if units.len() != 2 {
                        return self.fail("Invalid UNITS record");
                    }
                    let name = self.unwrap(name, "Missing LIBNAME")?;
                    return Ok(GdsLibHeader {
                        version,
                        name,
                        units: (units[0], units[1]),
                    });
                }
                GdsRecordType::RefLibs
                | GdsRecordType::Fonts
                | GdsRecordType::AttrTable
                | GdsRecordType::Generations
                | GdsRecordType::Format
                | GdsRecordType::Mask
                | GdsRecordType::EndMasks
                | GdsRecordType::LibDirSize
                | GdsRecordType::SrfName
                | GdsRecordType::LibSecur => (),
                other => return self.fail(format!("Unexpected {:?} in library header", other)),
            }
        }
    }
    /// Advance to the next struct definition, reading its name.
    /// Returns `None` at the end of the library.
    pub fn next_struct(&mut self) -> HcdResult<Option<GdsStructHeader>> {
        match self.nxt.rtype {
            GdsRecordType::EndLib => Ok(None),
            GdsRecordType::BgnStruct => {
                let offset = self.nxt_pos;
                self.next()?;
                let name = self.expect(GdsRecordType::StructName)?.string()?;
                Ok(Some(GdsStructHeader { name, offset }))
            }
            other => self.fail(format!("Expected BGNSTR, found {:?}", other)),
        }
    }
    /// Read the next element of the current struct.
    /// Returns `None`, having consumed the `ENDSTR`, at the end of the struct.
    pub fn next_element(&mut self) -> HcdResult<Option<GdsElement>> {
        let rtype = self.nxt.rtype;
        if rtype == GdsRecordType::EndStruct {
            self.next()?;
            return Ok(None);
        }
        let kind = match ElemKind::from_record(rtype) {
            Some(kind) => kind,
            None => return self.fail(format!("Unexpected {:?} in struct", rtype)),
        };
        self.next()?;
        let mut records = Vec::new();
        loop {
            match self.nxt.rtype {
                GdsRecordType::EndElement => {
                    self.next()?;
                    return Ok(Some(GdsElement { kind, records }));
                }
                GdsRecordType::EndStruct | GdsRecordType::EndLib => {
                    return self.fail("Element missing its ENDEL")
                }
                _ => records.push(self.next()?),
            }
        }
    }
}
impl<R: Read> ErrorHelper for GdsScanner<R> {
    fn err(&self, msg: impl Into<String>) -> HcdError {
        HcdError::format_at(msg, self.nxt_pos)
    }
}

/// Read the struct whose `BGNSTR` record is at byte `offset` of `src`
pub fn read_struct_at<R: Read + Seek>(
    mut src: R,
    offset: u64,
) -> HcdResult<(String, Vec<GdsElement>)> {
    src.seek(SeekFrom::Start(offset))?;
    let mut scanner = GdsScanner::new(GdsReader::new(src, offset))?;
    let hdr = match scanner.next_struct()? {
        Some(hdr) => hdr,
        None => return Err(HcdError::format_at("No struct at offset", offset)),
    };
    let mut elems = Vec::new();
    while let Some(elem) = scanner.next_element()? {
        elems.push(elem);
    }
    Ok((hdr.name, elems))
}

/// Parse a sequence of complete elements from raw record bytes, as produced by [encode_elements]
pub fn read_elements(bytes: &[u8]) -> HcdResult<Vec<GdsElement>> {
    let mut rdr = GdsReader::new(bytes, 0);
    let mut elems = Vec::new();
    let mut current: Option<GdsElement> = None;
    while (rdr.pos() as usize) < bytes.len() {
        let record = rdr.read_record()?;
        match current.take() {
            None => match ElemKind::from_record(record.rtype) {
                Some(kind) => {
                    current = Some(GdsElement {
                        kind,
                        records: Vec::new(),
                    })
                }
                None => return rdr.fail(format!("Expected an element, found {:?}", record.rtype)),
            },
            Some(elem) if record.rtype == GdsRecordType::EndElement => elems.push(elem),
            Some(mut elem) => {
                elem.records.push(record);
                current = Some(elem);
            }
        }
    }
    if current.is_some() {
        return rdr.fail("Element missing its ENDEL");
    }
    Ok(elems)
}
