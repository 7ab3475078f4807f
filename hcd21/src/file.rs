//!
//! # Digest Files
//!
//! Binary serialization of whole [Digest]s.
//!
//! Files open with an ASCII header line, `HCD21 v<version>`,
//! suffixed `+1` when cell geometry is embedded. Then, in order:
//!
//! * Source filename, file-type tag, and (for gzip sources, from version 4) the archive CRC
//! * Scale, always 1.0
//! * Per-mode summary information
//! * Alias metadata (version 4)
//! * String table, terminated by an empty string
//! * Attribute remap table, terminated by `0xFF`
//! * Per-mode cell records, each body terminated by name id 0
//!
//! Embedded geometry follows its cell record: the raw length, then the raw-DEFLATE bytes as a blob.
//! Readers inflate no more than the recorded length.
//!
//! Format versions gate optional content:
//!
//! | Version | Adds                                        |
//! | ------- | ------------------------------------------- |
//! | 1       | Base format                                 |
//! | 2       | Bounding boxes, embedded geometry           |
//! | 3       | Compressed instance-list segments           |
//! | 4       | 64-bit offsets, alias metadata, archive CRC |
//!

// Std-Lib
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

// Crates.io
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use log::{debug, info};

// Local imports
use crate::arena::Ticket;
use crate::attrs::Attrs;
use crate::bio::{ReadHcdExt, WriteHcdExt, MAX_BLOB_LEN};
use crate::config::{AliasConfig, CaseFold, HcdConfig};
use crate::cref::{decode_segment, encode_segment, store_packed, store_plain, CRef, SegmentEnd};
use crate::digest::{Digest, DigestInfo, ElemCounts, LayerSpec, SourceKind};
use crate::error::{HcdError, HcdResult, ZError};
use crate::geom::{BoundBox, Point};
use crate::geometry::MemGeometry;
use crate::symtab::{ListState, Mode, SymRef};

/// Latest digest-file format version
pub const CURRENT_VERSION: u32 = 4;

const MAGIC: &str = "HCD21 v";
/// Longest accepted header line
const MAX_HEADER: u64 = 32;
/// Geometry-format suffix for files with embedded geometry
const GEOMETRY_FORMAT: u32 = 1;

/// Attribute-table entry marker
const ATTR_ENTRY: u8 = 0x01;
/// Attribute-table terminator
const ATTR_END: u8 = 0xFF;

// Cell-record flags, above the [SymRef] flags
const REC_NUM: u32 = 0x100;
const REC_PLAIN: u32 = 0x200;
const REC_PACKED: u32 = 0x400;
const REC_GEOMETRY: u32 = 0x800;
const REC_SYM_FLAGS: u32 = 0xFF;

/// Digest-file header line content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileHeader {
    version: u32,
    geometry: bool,
}
impl FileHeader {
    fn write(&self, dest: &mut impl Write) -> HcdResult<()> {
        let suffix = if self.geometry {
            format!("+{}", GEOMETRY_FORMAT)
        } else {
            String::new()
        };
        writeln!(dest, "{}{}{}", MAGIC, self.version, suffix)?;
        Ok(())
    }
    fn read(src: &mut impl BufRead) -> HcdResult<Self> {
        let mut line = Vec::new();
        src.take(MAX_HEADER).read_until(b'\n', &mut line)?;
        if line.last() != Some(&b'\n') {
            return Err(HcdError::format("Not a digest file"));
        }
        let line = std::str::from_utf8(&line[..line.len() - 1])?;
        let rest = line
            .strip_prefix(MAGIC)
            .ok_or_else(|| HcdError::format("Not a digest file"))?;
        let (version, suffix) = match rest.split_once('+') {
            Some((v, s)) => (v, Some(s)),
            None => (rest, None),
        };
        let version: u32 = version
            .parse()
            .map_err(|_| HcdError::format(format!("Invalid digest-file version {:?}", version)))?;
        if version == 0 || version > CURRENT_VERSION {
            return Err(HcdError::format(format!(
                "Unsupported digest-file version {}",
                version
            )));
        }
        let geometry = match suffix {
            None => false,
            Some(s) if s == GEOMETRY_FORMAT.to_string() && version >= 2 => true,
            Some(s) => {
                return Err(HcdError::format(format!(
                    "Unsupported geometry format +{} in version {}",
                    s, version
                )))
            }
        };
        Ok(Self { version, geometry })
    }
}

impl Digest {
    /// Open a digest file
    pub fn open(fname: impl AsRef<Path>) -> HcdResult<Self> {
        Self::open_with(fname, HcdConfig::default())
    }
    /// Open a digest file, with configuration `cfg`
    pub fn open_with(fname: impl AsRef<Path>, cfg: HcdConfig) -> HcdResult<Self> {
        let file = File::open(&fname)?;
        let digest = Self::read_with(&mut BufReader::new(file), cfg)?;
        info!(
            "Read digest {} with {} cells",
            fname.as_ref().display(),
            digest.tables.iter().map(|t| t.len()).sum::<usize>()
        );
        Ok(digest)
    }
    /// Read a digest from `src`
    pub fn read(src: &mut impl BufRead) -> HcdResult<Self> {
        Self::read_with(src, HcdConfig::default())
    }
    /// Read a digest from `src`, with configuration `cfg`.
    /// Any failure discards everything read so far.
    pub fn read_with(src: &mut impl BufRead, cfg: HcdConfig) -> HcdResult<Self> {
        let hdr = FileHeader::read(src)?;
        DigestReader {
            src,
            version: hdr.version,
            geometry: hdr.geometry,
            digest: Digest::new(cfg)?,
            attr_map: HashMap::new(),
            embedded: MemGeometry::new(),
        }
        .read()
    }
    /// Write to file `fname`, in our configured format version
    pub fn write(&mut self, fname: impl AsRef<Path>) -> HcdResult<()> {
        let version = self.config.version;
        self.save(fname, version, false)
    }
    /// Write to file `fname` in format `version`, optionally embedding each cell's geometry
    pub fn save(&mut self, fname: impl AsRef<Path>, version: u32, geometry: bool) -> HcdResult<()> {
        let mut file = BufWriter::new(File::create(&fname)?);
        self.write_to(&mut file, version, geometry)?;
        file.flush()?;
        info!("Wrote digest {} (v{})", fname.as_ref().display(), version);
        Ok(())
    }
    /// Write to `dest` in format `version`, optionally embedding each cell's geometry
    pub fn write_to(&mut self, dest: &mut impl Write, version: u32, geometry: bool) -> HcdResult<()> {
        if version == 0 || version > CURRENT_VERSION {
            return Err(HcdError::Unsupported(format!(
                "Digest-file version {}",
                version
            )));
        }
        if geometry && version < 2 {
            return Err(HcdError::Unsupported(
                "Embedded geometry requires version 2".into(),
            ));
        }
        FileHeader { version, geometry }.write(dest)?;
        DigestWriter {
            dest,
            version,
            geometry,
        }
        .write(self)
    }
}

/// Digest-file writer
struct DigestWriter<'w, W: Write> {
    dest: &'w mut W,
    version: u32,
    geometry: bool,
}
impl<'w, W: Write> DigestWriter<'w, W> {
    fn write(&mut self, digest: &mut Digest) -> HcdResult<()> {
        self.dest.write_blob(digest.filename.as_bytes())?;
        self.dest.write_byte(digest.kind as u8)?;
        if digest.kind == SourceKind::GdsGzip && self.version >= 4 {
            self.dest.write_u32le(digest.crc.unwrap_or(0))?;
        }
        self.dest.write_real(1.0)?;
        for mode in Mode::ALL {
            self.write_info(&digest.info[mode.index()])?;
        }
        self.write_alias(digest.alias.as_ref())?;
        for (_, name) in digest.strings.iter() {
            self.dest.write_string(name)?;
        }
        self.dest.write_end()?;
        for (raw, payload) in digest.attrs.entries() {
            self.dest.write_byte(ATTR_ENTRY)?;
            self.dest.write_u32v(raw)?;
            self.dest.write_blob(payload)?;
        }
        self.dest.write_byte(ATTR_END)?;
        for mode in Mode::ALL {
            self.write_body(digest, mode)?;
        }
        Ok(())
    }
    fn write_info(&mut self, info: &DigestInfo) -> HcdResult<()> {
        let dest = &mut *self.dest;
        dest.write_blob(info.lib.name.as_bytes())?;
        dest.write_i32v(info.lib.version as i32)?;
        dest.write_real(info.lib.units.0)?;
        dest.write_real(info.lib.units.1)?;
        for count in info.counts.to_array() {
            dest.write_u64v(count)?;
        }
        dest.write_u64v(info.cells)?;
        dest.write_u64v(info.undefined)?;
        dest.write_u32v(info.layers.len() as u32)?;
        for spec in info.layers.iter() {
            dest.write_i32v(spec.layer as i32)?;
            dest.write_i32v(spec.datatype as i32)?;
        }
        Ok(())
    }
    fn write_alias(&mut self, alias: Option<&AliasConfig>) -> HcdResult<()> {
        let alias = alias.filter(|a| !a.is_identity());
        if self.version < 4 {
            return match alias {
                None => Ok(()),
                Some(_) => Err(HcdError::Unsupported(
                    "Alias metadata requires version 4".into(),
                )),
            };
        }
        match alias {
            None => self.dest.write_byte(0),
            Some(a) => {
                self.dest.write_byte(1)?;
                self.dest.write_blob(a.prefix.as_bytes())?;
                self.dest.write_blob(a.suffix.as_bytes())?;
                self.dest.write_byte(a.case as u8)
            }
        }
    }
    fn write_body(&mut self, digest: &mut Digest, mode: Mode) -> HcdResult<()> {
        let tickets = digest.tables[mode.index()].tickets().to_vec();
        for t in tickets {
            let sym = *digest.cell(mode, t)?;
            let crefs = digest.instances(mode, t)?.collect_all()?;
            let geometry = if self.geometry && sym.is_defined() {
                digest.cell_geometry(mode, t)?
            } else {
                None
            };
            self.write_cell(digest, mode, &sym, &crefs, geometry)?;
        }
        self.dest.write_u32v(0)
    }
    fn write_cell(
        &mut self,
        digest: &Digest,
        mode: Mode,
        sym: &SymRef,
        crefs: &[CRef],
        geometry: Option<Vec<u8>>,
    ) -> HcdResult<()> {
        let packed = !crefs.is_empty() && sym.is_compressed() && self.version >= 3;
        let mut flags = sym.flags as u32 & REC_SYM_FLAGS;
        if sym.num != 0 {
            flags |= REC_NUM;
        }
        if !crefs.is_empty() {
            flags |= if packed { REC_PACKED } else { REC_PLAIN };
        }
        if geometry.is_some() {
            flags |= REC_GEOMETRY;
        }
        let dest = &mut *self.dest;
        dest.write_u32v(sym.name)?;
        if self.version >= 4 {
            dest.write_u64v(sym.offset)?;
        } else {
            let offset = u32::try_from(sym.offset).map_err(|_| {
                HcdError::Unsupported(format!(
                    "Offset {} requires digest-file version 4",
                    sym.offset
                ))
            })?;
            dest.write_u32v(offset)?;
        }
        dest.write_u32v(flags)?;
        dest.write_u32v(sym.features as u32)?;
        if sym.num != 0 {
            dest.write_u32v(sym.num)?;
        }
        if self.version >= 2 {
            if sym.bbox.is_empty() {
                dest.write_byte(0)?;
            } else {
                dest.write_byte(1)?;
                dest.write_i32v(sym.bbox.p0.x)?;
                dest.write_i32v(sym.bbox.p0.y)?;
                dest.write_i32v(sym.bbox.p1.x)?;
                dest.write_i32v(sym.bbox.p1.y)?;
            }
        } else if !sym.bbox.is_empty() {
            return Err(HcdError::Unsupported(
                "Bounding boxes require digest-file version 2".into(),
            ));
        }
        dest.write_u32v(sym.ninst)?;

        // Instance lists refer to children by name id
        let tbl = &digest.tables[mode.index()];
        let mut renamed = Vec::with_capacity(crefs.len());
        for c in crefs {
            let child = tbl.sym(c.child_ticket()?)?.name;
            renamed.push(CRef { child, ..*c });
        }
        if packed {
            let chunks: Vec<&[CRef]> = renamed
                .chunks(digest.config.cref_block_records.max(1))
                .collect();
            dest.write_u32v(chunks.len() as u32)?;
            for (k, chunk) in chunks.iter().enumerate() {
                let end = if k + 1 == chunks.len() {
                    SegmentEnd::Last
                } else {
                    SegmentEnd::Chain(0)
                };
                dest.write_blob(&encode_segment(chunk, end)?)?;
            }
        } else {
            for c in renamed.iter() {
                dest.write_u32v(c.child)?;
                dest.write_u32v(c.attr)?;
                dest.write_i32v(c.x)?;
                dest.write_i32v(c.y)?;
                dest.write_byte(c.flag as u8)?;
            }
        }
        if let Some(bytes) = geometry {
            let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
            enc.write_all(&bytes)?;
            dest.write_u64v(bytes.len() as u64)?;
            dest.write_blob(&enc.finish()?)?;
        }
        Ok(())
    }
}

/// Digest-file reader
struct DigestReader<'r, R: BufRead> {
    src: &'r mut R,
    version: u32,
    /// Whether the file may carry embedded geometry
    geometry: bool,
    digest: Digest,
    /// Attribute tickets, file numbering to ours
    attr_map: HashMap<u32, u32>,
    embedded: MemGeometry,
}
impl<'r, R: BufRead> DigestReader<'r, R> {
    fn read(mut self) -> HcdResult<Digest> {
        self.digest.filename = String::from_utf8(self.src.read_blob()?)?;
        let tag = self.src.read_byte()?;
        self.digest.kind = SourceKind::from_tag(tag)
            .ok_or_else(|| HcdError::format(format!("Invalid file-type tag {}", tag)))?;
        if self.digest.kind == SourceKind::GdsGzip && self.version >= 4 {
            self.digest.crc = Some(self.src.read_u32le()?);
        }
        let scale = self.src.read_real()?;
        if scale != 1.0 {
            return Err(HcdError::format(format!("Unsupported scale {}", scale)));
        }
        for mode in Mode::ALL {
            let info = self.read_info()?;
            self.digest.info[mode.index()] = info;
        }
        if self.version >= 4 {
            self.read_alias()?;
        }
        self.read_strings()?;
        self.read_attrs()?;
        for mode in Mode::ALL {
            self.read_body(mode)?;
        }
        let Self {
            mut digest,
            embedded,
            ..
        } = self;
        if !embedded.is_empty() {
            debug!("Attaching embedded geometry of {} cells", embedded.len());
            digest.attach_geometry(Box::new(embedded));
        }
        digest.summarize();
        Ok(digest)
    }
    fn read_info(&mut self) -> HcdResult<DigestInfo> {
        let src = &mut *self.src;
        let mut info = DigestInfo::default();
        info.lib.name = String::from_utf8(src.read_blob()?)?;
        info.lib.version = i16::try_from(src.read_i32v()?)
            .map_err(|_| HcdError::format("Invalid stream version"))?;
        info.lib.units = (src.read_real()?, src.read_real()?);
        let mut counts = [0u64; 7];
        for c in counts.iter_mut() {
            *c = src.read_u64v()?;
        }
        info.counts = ElemCounts::from_array(counts);
        info.cells = src.read_u64v()?;
        info.undefined = src.read_u64v()?;
        let nlayers = src.read_u32v()?;
        for _ in 0..nlayers {
            let layer = src.read_i32v()?;
            let datatype = src.read_i32v()?;
            let spec = match (i16::try_from(layer), i16::try_from(datatype)) {
                (Ok(layer), Ok(datatype)) => LayerSpec { layer, datatype },
                _ => return Err(HcdError::format("Invalid layer number")),
            };
            info.layers.insert(spec);
        }
        Ok(info)
    }
    fn read_alias(&mut self) -> HcdResult<()> {
        match self.src.read_byte()? {
            0 => Ok(()),
            1 => {
                let prefix = String::from_utf8(self.src.read_blob()?)?;
                let suffix = String::from_utf8(self.src.read_blob()?)?;
                let case = match self.src.read_byte()? {
                    0 => CaseFold::Keep,
                    1 => CaseFold::Upper,
                    2 => CaseFold::Lower,
                    other => {
                        return Err(HcdError::format(format!("Invalid case folding {}", other)))
                    }
                };
                let alias = AliasConfig {
                    prefix,
                    suffix,
                    case,
                };
                self.digest.config.alias = Some(alias.clone());
                self.digest.alias = Some(alias);
                Ok(())
            }
            other => Err(HcdError::format(format!("Invalid alias marker {}", other))),
        }
    }
    fn read_strings(&mut self) -> HcdResult<()> {
        while let Some(name) = self.src.read_string()? {
            let expected = self.digest.strings.len() as u32 + 1;
            if self.digest.strings.intern(&name) != expected {
                return Err(HcdError::format(format!("Duplicate name {}", name)));
            }
        }
        Ok(())
    }
    fn read_attrs(&mut self) -> HcdResult<()> {
        loop {
            match self.src.read_byte()? {
                ATTR_END => return Ok(()),
                ATTR_ENTRY => {
                    let raw = self.src.read_u32v()?;
                    let payload = self.src.read_blob()?;
                    let attrs = Attrs::decode_payload(0, &mut payload.as_slice())?;
                    let local = self.digest.attrs.record(&attrs)? >> 4;
                    if raw == 0 || local == 0 {
                        return Err(HcdError::format("Invalid attribute-table entry"));
                    }
                    self.attr_map.insert(raw, local);
                }
                other => {
                    return Err(HcdError::format(format!(
                        "Invalid attribute-table marker {:#x}",
                        other
                    )))
                }
            }
        }
    }
    /// Map attribute ticket `attr` from file to local numbering
    fn attr(&self, attr: u32) -> HcdResult<u32> {
        let raw = attr >> 4;
        if raw == 0 {
            return Ok(attr);
        }
        match self.attr_map.get(&raw) {
            Some(local) => Ok((local << 4) | (attr & 0x0F)),
            None => Err(HcdError::format(format!("Undefined attribute ticket {}", attr))),
        }
    }
    /// Get or create the symbol named by file name-id `id`
    fn symbol(&mut self, mode: Mode, id: u32) -> HcdResult<Ticket> {
        if id == 0 || id as usize > self.digest.strings.len() {
            return Err(HcdError::format(format!("Undefined name id {}", id)));
        }
        let (t, _) = self.digest.tables[mode.index()].get_or_create(id)?;
        Ok(t)
    }
    fn read_body(&mut self, mode: Mode) -> HcdResult<()> {
        let mut done: HashSet<Ticket> = HashSet::new();
        loop {
            let id = self.src.read_u32v()?;
            if id == 0 {
                return Ok(());
            }
            let t = self.symbol(mode, id)?;
            if !done.insert(t) {
                let name = self.digest.strings.get(id).unwrap_or_default();
                return Err(HcdError::format(format!("Duplicate record for cell {}", name)));
            }
            self.read_cell(mode, t)?;
        }
    }
    fn read_cell(&mut self, mode: Mode, t: Ticket) -> HcdResult<()> {
        let offset = if self.version >= 4 {
            self.src.read_u64v()?
        } else {
            self.src.read_u32v()? as u64
        };
        let flags = self.src.read_u32v()?;
        if flags & !(REC_SYM_FLAGS | REC_NUM | REC_PLAIN | REC_PACKED | REC_GEOMETRY) != 0
            || flags & (REC_PLAIN | REC_PACKED) == (REC_PLAIN | REC_PACKED)
        {
            return Err(HcdError::format(format!("Invalid cell-record flags {:#x}", flags)));
        }
        let features = u16::try_from(self.src.read_u32v()?)
            .map_err(|_| HcdError::format("Invalid cell features"))?;
        if flags & REC_NUM != 0 {
            let num = self.src.read_u32v()?;
            self.digest.tables[mode.index()].set_num(t, num)?;
        }
        let mut bbox = BoundBox::empty();
        if self.version >= 2 && self.src.read_byte()? != 0 {
            let p0 = Point::new(self.src.read_i32v()?, self.src.read_i32v()?);
            let p1 = Point::new(self.src.read_i32v()?, self.src.read_i32v()?);
            bbox = BoundBox { p0, p1 };
        }
        let ninst = self.src.read_u32v()?;

        let list = if flags & REC_PACKED != 0 {
            if self.version < 3 {
                return Err(HcdError::format("Compressed instance list before version 3"));
            }
            let crefs = self.read_packed(mode)?;
            self.check_count(&crefs, ninst)?;
            let per_segment = self.digest.config.cref_block_records;
            store_packed(&mut self.digest.store, &crefs, per_segment)?
        } else if flags & REC_PLAIN != 0 {
            let mut crefs = Vec::with_capacity(ninst.min(1 << 16) as usize);
            for _ in 0..ninst {
                crefs.push(self.read_plain(mode)?);
            }
            store_plain(&mut self.digest.crefs, &crefs)?
        } else {
            ListState::Empty
        };
        if list == ListState::Empty && ninst != 0 {
            return Err(HcdError::format("Instance count without instances"));
        }
        if flags & REC_GEOMETRY != 0 {
            if !self.geometry {
                return Err(HcdError::format("Embedded geometry in a geometry-free file"));
            }
            let rawlen = self.src.read_u64v()?;
            if rawlen > MAX_BLOB_LEN {
                return Err(HcdError::format(format!("Invalid geometry length {}", rawlen)));
            }
            let packed = self.src.read_blob()?;
            let mut bytes = Vec::with_capacity(rawlen as usize);
            DeflateDecoder::new(packed.as_slice())
                .take(rawlen + 1)
                .read_to_end(&mut bytes)
                .map_err(|e| ZError::Block(e.to_string()))?;
            if bytes.len() as u64 != rawlen {
                return Err(HcdError::format(format!(
                    "Geometry inflated to {} bytes, expected {}",
                    bytes.len(),
                    rawlen
                )));
            }
            let name = self.digest.cell_name(mode, t)?.to_string();
            self.embedded.insert(name, bytes);
        }

        let sym = self.digest.tables[mode.index()].sym_mut(t)?;
        sym.offset = offset;
        sym.flags = (flags & REC_SYM_FLAGS) as u16;
        sym.features = features;
        sym.bbox = bbox;
        sym.ninst = ninst;
        sym.list = list;
        Ok(())
    }
    fn read_plain(&mut self, mode: Mode) -> HcdResult<CRef> {
        let id = self.src.read_u32v()?;
        let attr = self.src.read_u32v()?;
        let x = self.src.read_i32v()?;
        let y = self.src.read_i32v()?;
        let flag = match self.src.read_byte()? {
            0 => false,
            1 => true,
            other => return Err(HcdError::format(format!("Invalid instance flag {}", other))),
        };
        let child = self.symbol(mode, id)?.raw();
        let attr = self.attr(attr)?;
        Ok(CRef {
            child,
            attr,
            x,
            y,
            flag,
        })
    }
    fn read_packed(&mut self, mode: Mode) -> HcdResult<Vec<CRef>> {
        let nseg = self.src.read_u32v()?;
        if nseg == 0 {
            return Err(HcdError::format("Compressed instance list without segments"));
        }
        let mut rv = Vec::new();
        for k in 0..nseg {
            let seg = self.src.read_blob()?;
            let (crefs, chain) = decode_segment(&seg)?;
            if chain.is_some() != (k + 1 < nseg) {
                return Err(HcdError::format("Invalid instance-list segment chain"));
            }
            for c in crefs {
                let child = self.symbol(mode, c.child)?.raw();
                let attr = self.attr(c.attr)?;
                rv.push(CRef { child, attr, ..c });
            }
        }
        Ok(rv)
    }
    fn check_count(&self, crefs: &[CRef], ninst: u32) -> HcdResult<()> {
        if crefs.len() as u64 != ninst as u64 {
            return Err(HcdError::format(format!(
                "Instance count {} does not match {} decoded instances",
                ninst,
                crefs.len()
            )));
        }
        Ok(())
    }
}
