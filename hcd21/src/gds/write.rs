//!
//! # GDSII Writing
//!

// Std-Lib
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

// Crates.io
use chrono::{Datelike, NaiveDateTime, Timelike, Utc};

// Local imports
use super::*;

/// Encode `t` as GDSII's six-entry date-time
pub fn gds_date(t: &NaiveDateTime) -> [i16; 6] {
    [
        t.year() as i16,
        t.month() as i16,
        t.day() as i16,
        t.hour() as i16,
        t.minute() as i16,
        t.second() as i16,
    ]
}

/// # GdsWriter
/// Writes records to any [Write] destination, counting bytes as it goes.
pub struct GdsWriter<'wr> {
    /// Write Destination
    dest: Box<dyn Write + 'wr>,
    /// Modification and access dates, written with each library and struct
    dates: [i16; 12],
    /// Bytes written
    written: u64,
}
impl<'wr> GdsWriter<'wr> {
    /// Create new [GdsWriter] with destination file `fname`
    pub fn open(fname: impl AsRef<Path>) -> HcdResult<Self> {
        let file = BufWriter::new(File::create(fname)?);
        Ok(Self::new(file))
    }
    /// Create a new [GdsWriter] to destination `dest`, dated now
    pub fn new(dest: impl Write + 'wr) -> Self {
        let now = gds_date(&Utc::now().naive_utc());
        let mut dates = [0; 12];
        dates[..6].copy_from_slice(&now);
        dates[6..].copy_from_slice(&now);
        Self {
            dest: Box::new(dest),
            dates,
            written: 0,
        }
    }
    /// Set the date-time written to library and struct headers
    pub fn with_date(mut self, t: &NaiveDateTime) -> Self {
        let d = gds_date(t);
        self.dates[..6].copy_from_slice(&d);
        self.dates[6..].copy_from_slice(&d);
        self
    }
    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }
    /// Encode and write `record`
    pub fn write_record(&mut self, record: &GdsRecord) -> HcdResult<()> {
        record.encode(&mut self.dest)?;
        self.written += record.encoded_len() as u64;
        Ok(())
    }
    /// Write an element
    pub fn write_element(&mut self, elem: &GdsElement) -> HcdResult<()> {
        self.write_record(&GdsRecord::no_data(elem.kind.record_type()))?;
        for r in elem.records.iter() {
            self.write_record(r)?;
        }
        self.write_record(&GdsRecord::no_data(GdsRecordType::EndElement))
    }
    /// Write already-encoded element records
    pub fn write_raw(&mut self, bytes: &[u8]) -> HcdResult<()> {
        self.dest.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }
    /// Write the library header
    pub fn begin_lib(&mut self, lib: &GdsLibHeader) -> HcdResult<()> {
        self.write_record(&GdsRecord::from_i16s(GdsRecordType::Header, &[lib.version]))?;
        self.write_record(&GdsRecord::from_i16s(GdsRecordType::BgnLib, &self.dates))?;
        self.write_record(&GdsRecord::from_str(GdsRecordType::LibName, &lib.name))?;
        self.write_record(&GdsRecord::from_f64s(
            GdsRecordType::Units,
            &[lib.units.0, lib.units.1],
        ))
    }
    /// Write a struct header
    pub fn begin_struct(&mut self, name: &str) -> HcdResult<()> {
        self.write_record(&GdsRecord::from_i16s(GdsRecordType::BgnStruct, &self.dates))?;
        self.write_record(&GdsRecord::from_str(GdsRecordType::StructName, name))
    }
    /// Write a struct terminator
    pub fn end_struct(&mut self) -> HcdResult<()> {
        self.write_record(&GdsRecord::no_data(GdsRecordType::EndStruct))
    }
    /// Write the library terminator, and flush
    pub fn end_lib(&mut self) -> HcdResult<()> {
        self.write_record(&GdsRecord::no_data(GdsRecordType::EndLib))?;
        self.dest.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::Attrs;
    use crate::error::HcdResult;

    #[test]
    fn write_then_scan() -> HcdResult<()> {
        let mut buf = Vec::new();
        let written = {
            let mut wr = GdsWriter::new(&mut buf);
            wr.begin_lib(&GdsLibHeader::default())?;
            wr.begin_struct("leaf")?;
            wr.write_element(&GdsElement {
                kind: ElemKind::Boundary,
                records: vec![
                    GdsRecord::from_i16s(GdsRecordType::Layer, &[1]),
                    GdsRecord::from_i16s(GdsRecordType::DataType, &[0]),
                    GdsRecord::from_i32s(GdsRecordType::Xy, &[0, 0, 10, 0, 10, 10, 0, 0]),
                ],
            })?;
            wr.end_struct()?;
            wr.begin_struct("top")?;
            wr.write_element(&GdsElement::reference("leaf", &Attrs::default(), Point::new(3, 4))?)?;
            wr.end_struct()?;
            wr.end_lib()?;
            wr.written()
        };
        assert_eq!(written as usize, buf.len());
        let mut scanner = GdsScanner::new(GdsReader::new(&buf[..], 0))?;
        let lib = scanner.read_library()?;
        assert_eq!(lib, GdsLibHeader::default());
        let leaf = scanner.next_struct()?.unwrap();
        assert_eq!(leaf.name, "leaf");
        let elem = scanner.next_element()?.unwrap();
        assert_eq!(elem.kind, ElemKind::Boundary);
        assert_eq!(elem.layer(), Some(1));
        assert!(scanner.next_element()?.is_none());
        let top = scanner.next_struct()?.unwrap();
        assert_eq!(top.name, "top");
        assert!(top.offset > leaf.offset);
        let sref = scanner.next_element()?.unwrap();
        assert_eq!(sref.placement()?.1, Point::new(3, 4));
        assert!(scanner.next_element()?.is_none());
        assert!(scanner.next_struct()?.is_none());

        // Random access by offset
        let (name, elems) = read_struct_at(std::io::Cursor::new(&buf), top.offset)?;
        assert_eq!(name, "top");
        assert_eq!(elems, vec![sref]);
        Ok(())
    }
    #[test]
    fn raw_element_bytes() -> HcdResult<()> {
        let elems = vec![
            GdsElement {
                kind: ElemKind::Path,
                records: vec![
                    GdsRecord::from_i16s(GdsRecordType::Layer, &[5]),
                    GdsRecord::from_i16s(GdsRecordType::DataType, &[1]),
                    GdsRecord::from_i32s(GdsRecordType::Width, &[20]),
                    GdsRecord::from_i32s(GdsRecordType::Xy, &[0, 0, 100, 0]),
                ],
            },
            GdsElement {
                kind: ElemKind::Text,
                records: vec![
                    GdsRecord::from_i16s(GdsRecordType::Layer, &[5]),
                    GdsRecord::from_i16s(GdsRecordType::TextType, &[0]),
                    GdsRecord::from_i32s(GdsRecordType::Xy, &[50, 0]),
                    GdsRecord::from_str(GdsRecordType::String, "vdd"),
                ],
            },
        ];
        let bytes = encode_elements(&elems)?;
        assert_eq!(read_elements(&bytes)?, elems);
        // Cut inside the second element
        assert!(read_elements(&bytes[..bytes.len() - 4]).unwrap_err().is_format());
        Ok(())
    }
    #[test]
    fn malformed_records() {
        // Odd length
        let bad = [0x00u8, 0x05, 0x00, 0x02, 0x00];
        let err = GdsScanner::new(GdsReader::new(&bad[..], 0)).err().unwrap();
        assert!(err.is_format());
        // Unknown record type
        let bad = [0x00u8, 0x04, 0x77, 0x00];
        assert!(GdsScanner::new(GdsReader::new(&bad[..], 0)).err().unwrap().is_format());
        // Short data
        let bad = [0x00u8, 0x06, 0x00, 0x02, 0x02];
        assert!(GdsScanner::new(GdsReader::new(&bad[..], 0)).err().unwrap().is_format());
    }
}
