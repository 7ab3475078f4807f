//!
//! # Digest Building
//!
//! Digests are built one cell at a time, either through the explicit
//! [DigestBuilder::begin_cell] / [DigestBuilder::add_instance] / [DigestBuilder::end_cell] API,
//! or by scanning a GDSII archive in a single forward pass.
//!

// Std-Lib
use std::borrow::Cow;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// Crates.io
use log::{debug, info, warn};

// Local imports
use crate::arena::Ticket;
use crate::attrs::Attrs;
use crate::config::HcdConfig;
use crate::cref::{CRef, CrefWriter};
use crate::digest::{Digest, LayerSpec, SourceKind};
use crate::error::{HcdError, HcdResult};
use crate::gds::{ElemKind, GdsElement, GdsReader, GdsScanner, GdsStructHeader};
use crate::geom::{BoundBox, BoundBoxTrait, Point};
use crate::symtab::{
    ListState, Mode, FEAT_ARRAYS, FEAT_GEOMETRY, FEAT_PROPERTIES, FEAT_TEXT, SYM_BB_OK,
    SYM_DEFINED, SYM_REFERENCED,
};
use crate::zindex::{IndexRegistry, ZIndex};
use crate::zio::{Archive, ArchiveStream};

/// # Build Status
/// Result of a (possibly interrupted) scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    /// Every cell scanned
    Complete,
    /// Cancellation requested. Scanning can be resumed.
    Interrupted,
}

/// State of the cell currently being built
#[derive(Debug)]
struct OpenCell {
    sym: Ticket,
    list: ListState,
    bbox: BoundBox,
    ninst: u32,
    features: u16,
}

///
/// # Digest Builder
///
pub struct DigestBuilder {
    digest: Digest,
    /// Mode of the cells being built
    mode: Mode,
    writer: CrefWriter,
    current: Option<OpenCell>,
    /// Sequence number, standing in for source offsets of API-built cells
    seq: u64,
    /// Archive scanner, between [DigestBuilder::start_archive] and the end of the scan
    scanner: Option<GdsScanner<BufReader<Archive>>>,
}
impl DigestBuilder {
    /// Create a new builder
    pub fn new(config: HcdConfig) -> HcdResult<Self> {
        Ok(Self {
            digest: Digest::new(config)?,
            mode: Mode::Physical,
            writer: CrefWriter::default(),
            current: None,
            seq: 0,
            scanner: None,
        })
    }
    /// Build a digest by scanning archive file `fname`, sharing indices through `registry`
    pub fn build(
        fname: impl AsRef<Path>,
        config: HcdConfig,
        registry: Option<&IndexRegistry>,
    ) -> HcdResult<Digest> {
        let archive = Archive::open(&fname)?;
        let mut b = Self::new(config)?;
        b.digest.filename = fname.as_ref().to_string_lossy().to_string();
        if let (Some(reg), Some(crc)) = (registry, archive.checksum()) {
            if let Some(index) = reg.lookup(crc) {
                debug!("Reusing gzip index for {}", b.digest.filename);
                b.use_index(index);
            }
        }
        b.start_archive(archive)?;
        if b.scan(&AtomicBool::new(false))? != BuildStatus::Complete {
            return Err(HcdError::Interrupted);
        }
        let mut digest = b.finish()?;
        if let Some(reg) = registry {
            digest.register_index(reg)?;
        }
        Ok(digest)
    }
    /// Set the [Mode] of subsequently built cells
    pub fn set_mode(&mut self, mode: Mode) -> HcdResult<()> {
        if let Some(cur) = &self.current {
            return Err(self.still_open(cur.sym));
        }
        self.mode = mode;
        Ok(())
    }
    /// Apply any name aliasing
    fn alias<'n>(&self, name: &'n str) -> Cow<'n, str> {
        match &self.digest.alias {
            Some(alias) if !alias.is_identity() => Cow::Owned(alias.apply(name)),
            _ => Cow::Borrowed(name),
        }
    }
    /// Get or create the symbol for `name`
    fn symbol(&mut self, name: &str) -> HcdResult<Ticket> {
        if name.is_empty() {
            return Err(HcdError::format("Empty cell name"));
        }
        let name = self.alias(name);
        let id = self.digest.strings.intern(&name);
        let (t, _) = self.digest.tables[self.mode.index()].get_or_create(id)?;
        Ok(t)
    }
    fn still_open(&self, t: Ticket) -> HcdError {
        let name = self
            .digest
            .cell_name(self.mode, t)
            .unwrap_or("<unknown>");
        HcdError::msg(format!("Cell {} is still open", name))
    }
    /// Begin defining cell `name`
    pub fn begin_cell(&mut self, name: &str) -> HcdResult<Ticket> {
        let offset = self.seq;
        self.begin_cell_at(name, offset)
    }
    /// Begin defining cell `name`, whose definition starts at byte `offset` of the source
    pub fn begin_cell_at(&mut self, name: &str, offset: u64) -> HcdResult<Ticket> {
        if let Some(cur) = &self.current {
            return Err(self.still_open(cur.sym));
        }
        let t = self.symbol(name)?;
        let sym = self.digest.tables[self.mode.index()].sym_mut(t)?;
        if sym.is_defined() {
            return Err(HcdError::format(format!("Duplicate definition of cell {}", name)));
        }
        sym.offset = offset;
        self.seq = self.seq.max(offset) + 1;
        self.current = Some(OpenCell {
            sym: t,
            list: ListState::Empty,
            bbox: BoundBox::empty(),
            ninst: 0,
            features: 0,
        });
        Ok(t)
    }
    fn current(&mut self) -> HcdResult<&mut OpenCell> {
        self.current
            .as_mut()
            .ok_or_else(|| HcdError::msg("No cell is open"))
    }
    /// Add geometry with bounding box `bbox` to the open cell
    pub fn add_geometry(&mut self, bbox: &BoundBox) -> HcdResult<()> {
        let cur = self.current()?;
        cur.bbox = bbox.union(&cur.bbox);
        cur.features |= FEAT_GEOMETRY;
        Ok(())
    }
    /// Add source-format features (`FEAT_*`) to the open cell
    pub fn add_features(&mut self, features: u16) -> HcdResult<()> {
        self.current()?.features |= features;
        Ok(())
    }
    /// Add a placement of cell `child` to the open cell
    pub fn add_instance(
        &mut self,
        child: &str,
        attrs: &Attrs,
        loc: Point,
        flag: bool,
    ) -> HcdResult<()> {
        if self.current.is_none() {
            return Err(HcdError::msg("No cell is open"));
        }
        let child = self.symbol(child)?;
        let mode = self.mode.index();
        self.digest.tables[mode].sym_mut(child)?.flags |= SYM_REFERENCED;
        let attr = self.digest.attrs.record(attrs)?;
        let cref = CRef {
            child: child.raw(),
            attr,
            x: loc.x,
            y: loc.y,
            flag,
        };
        let Self {
            digest,
            writer,
            current,
            ..
        } = self;
        let cur = current
            .as_mut()
            .ok_or_else(|| HcdError::msg("No cell is open"))?;
        let compress = digest.config.compress_lists;
        writer.add(
            &mut digest.crefs,
            &mut digest.store,
            &mut cur.list,
            compress,
            &cref,
        )?;
        cur.ninst = cur.ninst.checked_add(1).ok_or(HcdError::Exhausted {
            table: "instances",
            tickets: u32::MAX as u64,
        })?;
        if attrs.array.is_some() {
            cur.features |= FEAT_ARRAYS;
        }
        Ok(())
    }
    /// Complete the open cell
    pub fn end_cell(&mut self) -> HcdResult<Ticket> {
        let mut cur = self
            .current
            .take()
            .ok_or_else(|| HcdError::msg("No cell is open"))?;
        self.writer
            .close(&mut self.digest.crefs, &mut self.digest.store, &mut cur.list)?;
        let sym = self.digest.tables[self.mode.index()].sym_mut(cur.sym)?;
        sym.list = cur.list;
        sym.bbox = cur.bbox;
        sym.ninst = cur.ninst;
        sym.features |= cur.features;
        sym.flags |= SYM_DEFINED;
        if cur.ninst == 0 {
            sym.flags |= SYM_BB_OK;
        }
        Ok(cur.sym)
    }

    /// Use `index` for the archive about to be scanned
    pub fn use_index(&mut self, index: Arc<ZIndex>) {
        self.digest.index = Some(index);
    }
    /// Load a persisted index for the archive about to be scanned
    pub fn load_index_file(&mut self, fname: impl AsRef<Path>) -> HcdResult<()> {
        let index = ZIndex::open(fname, None)?;
        self.use_index(Arc::new(index));
        Ok(())
    }
    /// Open archive file `fname` for scanning
    pub fn open_archive(&mut self, fname: impl AsRef<Path>) -> HcdResult<()> {
        let archive = Archive::open(&fname)?;
        self.digest.filename = fname.as_ref().to_string_lossy().to_string();
        self.start_archive(archive)
    }
    /// Start scanning `archive`, reading its library header
    pub fn start_archive(&mut self, mut archive: Archive) -> HcdResult<()> {
        if self.scanner.is_some() {
            return Err(HcdError::msg("An archive is already being scanned"));
        }
        self.digest.kind = SourceKind::Gds;
        if let Some(z) = archive.gzip_mut() {
            self.digest.kind = SourceKind::GdsGzip;
            self.digest.crc = Some(z.crc());
            let span = self.digest.config.zindex_span;
            match self.digest.index.clone() {
                None => z.record_index(span)?,
                Some(index) => match z.set_index(index) {
                    Ok(()) => (),
                    Err(e) if e.is_compression() => {
                        warn!("Ignoring gzip index: {}", e);
                        self.digest.index = None;
                        z.record_index(span)?;
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        let mut scanner = GdsScanner::new(GdsReader::new(BufReader::new(archive), 0))?;
        let lib = scanner.read_library()?;
        debug!("Scanning library {}", lib.name);
        self.digest.info[self.mode.index()].lib = lib;
        self.scanner = Some(scanner);
        Ok(())
    }
    /// Scan the archive, checking `cancel` between cells.
    /// An interrupted scan leaves every completed cell in place, and continues on the next call.
    pub fn scan(&mut self, cancel: &AtomicBool) -> HcdResult<BuildStatus> {
        let mut scanner = self
            .scanner
            .take()
            .ok_or_else(|| HcdError::msg("No archive to scan"))?;
        loop {
            if cancel.load(Ordering::Relaxed) {
                self.scanner = Some(scanner);
                info!("Scan interrupted");
                return Ok(BuildStatus::Interrupted);
            }
            match scanner.next_struct()? {
                Some(hdr) => self.scan_struct(&mut scanner, &hdr)?,
                None => break,
            }
        }
        // Read the remainder, verifying the gzip trailer and completing any index
        let mut archive = scanner.into_inner().into_inner();
        if let Some(z) = archive.gzip_mut() {
            std::io::copy(z, &mut std::io::sink())?;
            if let Some(index) = z.take_index() {
                let index = Arc::new(index);
                z.set_index(index.clone())?;
                self.digest.index = Some(index);
            }
        }
        self.digest.source = Some(archive);
        Ok(BuildStatus::Complete)
    }
    fn scan_struct(
        &mut self,
        scanner: &mut GdsScanner<BufReader<Archive>>,
        hdr: &GdsStructHeader,
    ) -> HcdResult<()> {
        self.begin_cell_at(&hdr.name, hdr.offset)?;
        while let Some(elem) = scanner.next_element()? {
            self.scan_element(&elem)?;
        }
        self.end_cell()?;
        Ok(())
    }
    fn scan_element(&mut self, elem: &GdsElement) -> HcdResult<()> {
        let info = &mut self.digest.info[self.mode.index()];
        info.counts.count(elem.kind);
        if let Some(layer) = elem.layer() {
            info.layers.insert(LayerSpec {
                layer,
                datatype: elem.datatype().unwrap_or(0),
            });
        }
        if elem.has_properties() {
            self.add_features(FEAT_PROPERTIES)?;
        }
        match elem.kind {
            ElemKind::Sref | ElemKind::Aref => {
                let name = elem
                    .sname()?
                    .ok_or_else(|| HcdError::format("Reference without SNAME"))?;
                let (attrs, loc) = elem.placement()?;
                self.add_instance(&name, &attrs, loc, false)
            }
            ElemKind::Text => self.add_features(FEAT_TEXT),
            ElemKind::Node => Ok(()),
            ElemKind::Boundary | ElemKind::Path | ElemKind::Box => {
                self.add_geometry(&elem.bbox())
            }
        }
    }
    /// Complete the build, returning the [Digest]
    pub fn finish(mut self) -> HcdResult<Digest> {
        if let Some(cur) = &self.current {
            return Err(self.still_open(cur.sym));
        }
        if self.scanner.is_some() {
            warn!("Finishing an incomplete archive scan");
        }
        self.digest.summarize();
        for mode in Mode::ALL {
            let info = self.digest.info(mode);
            if info.undefined > 0 {
                warn!("{} cells referenced but never defined", info.undefined);
            }
        }
        let info = self.digest.info(self.mode);
        info!(
            "Built digest of {} cells, {} instances",
            info.cells,
            self.digest.stats().instances
        );
        Ok(self.digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AliasConfig, CaseFold, HcdConfigBuilder};

    #[test]
    fn api_errors() -> HcdResult<()> {
        let mut b = DigestBuilder::new(HcdConfig::default())?;
        assert!(b.add_geometry(&BoundBox::empty()).is_err());
        assert!(b.end_cell().is_err());
        b.begin_cell("a")?;
        assert!(b.begin_cell("b").is_err());
        assert!(b.begin_cell_at("", 0).is_err());
        b.end_cell()?;
        assert!(b.begin_cell("a").unwrap_err().is_format());
        b.begin_cell("b")?;
        assert!(b.add_instance("", &Attrs::default(), Point::default(), false).is_err());
        assert!(b.set_mode(Mode::Electrical).is_err());
        b.end_cell()?;
        b.set_mode(Mode::Electrical)?;
        // Electrical views have their own name table
        b.begin_cell("a")?;
        b.end_cell()?;
        let d = b.finish()?;
        assert_eq!(d.info(Mode::Physical).cells, 2);
        assert_eq!(d.info(Mode::Electrical).cells, 1);
        Ok(())
    }
    #[test]
    fn exhausted_instance_arena() -> HcdResult<()> {
        let cfg = HcdConfigBuilder::default().compress_lists(false).build()?;
        let mut b = DigestBuilder::new(cfg)?;
        // One sixteen-record block, less the reserved null ticket
        b.digest.crefs =
            crate::arena::RecordArena::with_block_records("instances", 16).with_max_blocks(1);
        b.begin_cell("leaf")?;
        b.end_cell()?;
        b.begin_cell("top")?;
        let mut added = 0;
        let err = loop {
            let loc = Point::new(10 * added, 0);
            match b.add_instance("leaf", &Attrs::default(), loc, false) {
                Ok(()) => added += 1,
                Err(e) => break e,
            }
            assert!(added < 100, "Instance arena never filled");
        };
        assert_eq!(added, 15);
        assert!(err.is_exhausted());
        assert!(matches!(err, HcdError::Exhausted { table: "instances", tickets: 15 }));

        // The failed placement left nothing behind
        b.end_cell()?;
        let d = b.finish()?;
        let top = d.find_cell(Mode::Physical, "top").unwrap();
        assert_eq!(d.cell(Mode::Physical, top)?.ninst, 15);
        assert_eq!(d.instances(Mode::Physical, top)?.collect_all()?.len(), 15);
        Ok(())
    }
    #[test]
    fn undefined_children() -> HcdResult<()> {
        let mut b = DigestBuilder::new(HcdConfig::default())?;
        b.begin_cell("top")?;
        b.add_instance("ghost", &Attrs::default(), Point::new(1, 2), false)?;
        b.end_cell()?;
        let d = b.finish()?;
        let info = d.info(Mode::Physical);
        assert_eq!((info.cells, info.undefined), (1, 1));
        let ghost = d.find_cell(Mode::Physical, "ghost").unwrap();
        assert!(!d.cell(Mode::Physical, ghost)?.is_defined());
        assert!(d.cell(Mode::Physical, ghost)?.is_referenced());
        Ok(())
    }
    #[test]
    fn aliased_names() -> HcdResult<()> {
        let cfg = HcdConfigBuilder::default()
            .alias(Some(AliasConfig {
                prefix: "lib_".into(),
                suffix: String::new(),
                case: CaseFold::Upper,
            }))
            .build()?;
        let mut b = DigestBuilder::new(cfg)?;
        b.begin_cell("inv")?;
        b.end_cell()?;
        let d = b.finish()?;
        let t = d.find_cell(Mode::Physical, "LIB_INV").unwrap();
        assert_eq!(d.find_cell(Mode::Physical, "inv"), Some(t));
        Ok(())
    }
    #[test]
    fn plain_lists_when_not_compressing() -> HcdResult<()> {
        let cfg = HcdConfigBuilder::default().compress_lists(false).build()?;
        let mut b = DigestBuilder::new(cfg)?;
        b.begin_cell("top")?;
        for k in 0..10 {
            b.add_instance("leaf", &Attrs::default(), Point::new(k, 0), k == 3)?;
        }
        b.end_cell()?;
        let d = b.finish()?;
        let top = d.find_cell(Mode::Physical, "top").unwrap();
        assert!(!d.cell(Mode::Physical, top)?.is_compressed());
        let insts = d.instances(Mode::Physical, top)?.collect_all()?;
        assert_eq!(insts.len(), 10);
        assert!(insts[3].flag);
        assert_eq!(d.stats().plain_lists, 1);
        Ok(())
    }
}
