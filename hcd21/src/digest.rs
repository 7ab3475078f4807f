//!
//! # Hierarchical Cell Digest
//!
//! The in-memory digest of a layout archive's cell hierarchy:
//! per-mode name tables, deduplicated placement attributes, and per-cell instance lists,
//! plus the summary information and source-archive handles needed to re-read cell contents.
//!
//! Digests are created by scanning an archive ([crate::DigestBuilder]),
//! or by reading a digest file ([Digest::open]).
//!

// Std-Lib
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// Crates.io
use derive_more::{Add, AddAssign};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

// Local imports
use crate::arena::{RecordArena, Ticket};
use crate::attrs::{AttrDb, Attrs};
use crate::config::{AliasConfig, HcdConfig};
use crate::cref::{
    store_packed, store_plain, CRef, CrefRecord, CrefStream, PackedCrefs, CREF_FLAG, CREF_LAST,
};
use crate::error::{HcdError, HcdResult, ZError};
use crate::gds::{
    encode_elements, read_elements, read_struct_at, ElemKind, GdsElement, GdsLibHeader, GdsWriter,
};
use crate::geom::{BoundBox, BoundBoxTrait, Point, Transform};
use crate::geometry::Geometry;
use crate::order::{CellOrder, DepOrder};
use crate::symtab::{ListState, Mode, NameTable, StringTable, SymRef, SYM_BB_OK};
use crate::zbytes::{ZByteStore, ZStoreStats};
use crate::zindex::{IndexRegistry, ZIndex};
use crate::zio::Archive;

/// # Source Archive Kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    /// No source, e.g. built through the [crate::DigestBuilder] API
    None = 0,
    /// Plain GDSII
    Gds = 1,
    /// Gzip-compressed GDSII
    GdsGzip = 2,
}
impl SourceKind {
    /// Decode from a digest-file tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::Gds),
            2 => Some(Self::GdsGzip),
            _ => None,
        }
    }
}
impl Default for SourceKind {
    fn default() -> Self {
        Self::None
    }
}

/// # Per-Kind Element Counts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Add, AddAssign, Serialize, Deserialize)]
pub struct ElemCounts {
    pub boundaries: u64,
    pub paths: u64,
    pub boxes: u64,
    pub texts: u64,
    pub nodes: u64,
    pub srefs: u64,
    pub arefs: u64,
}
impl ElemCounts {
    /// Count one element of kind `kind`
    pub fn count(&mut self, kind: ElemKind) {
        let field = match kind {
            ElemKind::Boundary => &mut self.boundaries,
            ElemKind::Path => &mut self.paths,
            ElemKind::Box => &mut self.boxes,
            ElemKind::Text => &mut self.texts,
            ElemKind::Node => &mut self.nodes,
            ElemKind::Sref => &mut self.srefs,
            ElemKind::Aref => &mut self.arefs,
        };
        *field += 1;
    }
    /// Counts in fixed order, as stored in digest files
    pub fn to_array(&self) -> [u64; 7] {
        [
            self.boundaries,
            self.paths,
            self.boxes,
            self.texts,
            self.nodes,
            self.srefs,
            self.arefs,
        ]
    }
    /// Inverse of [ElemCounts::to_array]
    pub fn from_array(a: [u64; 7]) -> Self {
        Self {
            boundaries: a[0],
            paths: a[1],
            boxes: a[2],
            texts: a[3],
            nodes: a[4],
            srefs: a[5],
            arefs: a[6],
        }
    }
}

/// # Layer / Data-Type Pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayerSpec {
    pub layer: i16,
    pub datatype: i16,
}

///
/// # Per-Mode Summary Information
///
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestInfo {
    /// Number of defined cells
    pub cells: u64,
    /// Number of cells referenced but never defined
    pub undefined: u64,
    /// Source library header
    pub lib: GdsLibHeader,
    /// Element counts over the whole archive
    pub counts: ElemCounts,
    /// Every layer and data-type used
    pub layers: BTreeSet<LayerSpec>,
}

/// # Cell Summary
/// Serializable description of one cell, as produced by [Digest::list_cells]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSummary {
    pub name: String,
    pub defined: bool,
    pub referenced: bool,
    /// Byte offset of the definition in the source archive
    pub offset: u64,
    pub instances: u32,
    pub compressed: bool,
    pub features: u16,
    /// Bounding box, if computed
    pub bbox: Option<BoundBox>,
}

/// # Digest Statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestStats {
    /// Cells, over all modes
    pub cells: u64,
    /// Instance records, over all modes
    pub instances: u64,
    /// Instance lists stored plain
    pub plain_lists: u64,
    /// Instance lists stored compressed
    pub packed_lists: u64,
    /// Distinct attribute payloads
    pub attributes: u64,
    /// Fixed instance records allocated
    pub cref_records: u64,
    /// Bytes held by the compressed store
    pub store_memory: u64,
    /// Encoded bytes of compressed lists since replaced, still held by the store
    pub stranded: u64,
    /// Compressed-store statistics
    pub store: ZStoreStats,
}

/// # GDSII Output Options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GdsOutput {
    pub mode: Mode,
    /// Top cell name. Defaults to [Digest::top_cell] when flattening,
    /// and to every cell when writing hierarchically.
    pub top: Option<String>,
    /// Flatten everything into the top cell
    pub flatten: bool,
}

/// # Output Stream Format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    Gds,
    GdsGzip,
}
impl StreamFormat {
    /// Infer from the extension of `fname`: gzip for `.gz`, plain otherwise
    pub fn from_path(fname: impl AsRef<Path>) -> Self {
        match fname.as_ref().extension().and_then(|e| e.to_str()) {
            Some("gz") => Self::GdsGzip,
            _ => Self::Gds,
        }
    }
}

/// Geometry and resolved placements of a cell, cached while flattening
struct FlatCell {
    elems: Vec<GdsElement>,
    insts: Vec<(Ticket, Attrs, Point)>,
}

///
/// # Digest
///
pub struct Digest {
    pub(crate) config: HcdConfig,
    /// Source archive path
    pub(crate) filename: String,
    pub(crate) kind: SourceKind,
    pub(crate) strings: StringTable,
    pub(crate) tables: [NameTable; 2],
    pub(crate) info: [DigestInfo; 2],
    pub(crate) attrs: AttrDb,
    pub(crate) crefs: RecordArena<CrefRecord>,
    pub(crate) store: ZByteStore,
    /// Renaming applied while building
    pub(crate) alias: Option<AliasConfig>,
    /// Checksum of a compressed source archive
    pub(crate) crc: Option<u32>,
    pub(crate) index: Option<Arc<ZIndex>>,
    pub(crate) source: Option<Archive>,
    pub(crate) geometry: Option<Box<dyn Geometry>>,
    pub(crate) top: [Option<Ticket>; 2],
    /// Encoded bytes of replaced compressed lists
    pub(crate) stranded: u64,
}
impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Digest")
            .field("filename", &self.filename)
            .field("kind", &self.kind)
            .field("cells", &[self.tables[0].len(), self.tables[1].len()])
            .field("crc", &self.crc)
            .field("indexed", &self.index.is_some())
            .field("geometry", &self.geometry.is_some())
            .finish()
    }
}
impl Digest {
    /// Create a new and empty digest
    pub fn new(config: HcdConfig) -> HcdResult<Self> {
        config.validate()?;
        let crefs = RecordArena::with_block_records("instances", config.cref_block_records);
        let store = ZByteStore::new(
            "instance segments",
            config.arena_block_bits,
            config.compress_threshold,
        );
        Ok(Self {
            alias: config.alias.clone(),
            config,
            filename: String::new(),
            kind: SourceKind::None,
            strings: StringTable::default(),
            tables: [NameTable::new(Mode::Physical), NameTable::new(Mode::Electrical)],
            info: Default::default(),
            attrs: AttrDb::new(),
            crefs,
            store,
            crc: None,
            index: None,
            source: None,
            geometry: None,
            top: [None, None],
            stranded: 0,
        })
    }
    /// Build a digest by scanning archive file `fname`.
    /// With a `registry`, random-access indices are shared with other digests of identical archives.
    pub fn from_archive(
        fname: impl AsRef<Path>,
        config: HcdConfig,
        registry: Option<&IndexRegistry>,
    ) -> HcdResult<Self> {
        crate::build::DigestBuilder::build(fname, config, registry)
    }
    pub fn config(&self) -> &HcdConfig {
        &self.config
    }
    /// Source archive path
    pub fn filename(&self) -> &str {
        &self.filename
    }
    pub fn kind(&self) -> SourceKind {
        self.kind
    }
    /// Checksum of the compressed source archive, if any
    pub fn crc(&self) -> Option<u32> {
        self.crc
    }
    /// Name aliasing applied while building
    pub fn alias(&self) -> Option<&AliasConfig> {
        self.alias.as_ref()
    }
    /// Summary information for `mode`
    pub fn info(&self, mode: Mode) -> &DigestInfo {
        &self.info[mode.index()]
    }
    /// Name table for `mode`
    pub fn table(&self, mode: Mode) -> &NameTable {
        &self.tables[mode.index()]
    }
    /// Get the [SymRef] of cell `t`
    pub fn cell(&self, mode: Mode, t: Ticket) -> HcdResult<&SymRef> {
        self.tables[mode.index()].sym(t)
    }
    /// Get the name of cell `t`
    pub fn cell_name(&self, mode: Mode, t: Ticket) -> HcdResult<&str> {
        let id = self.cell(mode, t)?.name;
        self.strings
            .get(id)
            .ok_or_else(|| HcdError::format(format!("Invalid name id {}", id)))
    }
    /// Find cell `name`. Names are tried as given, then as aliased.
    pub fn find_cell(&self, mode: Mode, name: &str) -> Option<Ticket> {
        let tbl = &self.tables[mode.index()];
        if let Some(t) = self.strings.find(name).and_then(|id| tbl.find(id)) {
            return Some(t);
        }
        let alias = self.alias.as_ref()?;
        let aliased = alias.apply(name);
        self.strings.find(&aliased).and_then(|id| tbl.find(id))
    }
    /// Iterate over every cell of `mode`, in creation order
    pub fn cells(&self, mode: Mode) -> impl Iterator<Item = (Ticket, &SymRef)> {
        self.tables[mode.index()].iter()
    }
    /// Summarize every cell of `mode`
    pub fn list_cells(&self, mode: Mode) -> HcdResult<Vec<CellSummary>> {
        let mut rv = Vec::with_capacity(self.tables[mode.index()].len());
        for (t, sym) in self.cells(mode) {
            rv.push(CellSummary {
                name: self.cell_name(mode, t)?.to_string(),
                defined: sym.is_defined(),
                referenced: sym.is_referenced(),
                offset: sym.offset,
                bbox: if sym.bb_ok() { Some(sym.bbox) } else { None },
                instances: sym.ninst,
                compressed: sym.is_compressed(),
                features: sym.features,
            });
        }
        Ok(rv)
    }
    /// Iterate over the placements of cell `t`
    pub fn instances(&self, mode: Mode, t: Ticket) -> HcdResult<CrefStream<'_>> {
        let sym = self.cell(mode, t)?;
        CrefStream::new(&sym.list, &self.crefs, &self.store)
    }
    /// Resolve attribute ticket `t`
    pub fn attrs(&self, t: u32) -> HcdResult<Attrs> {
        self.attrs.resolve(t)
    }
    /// The top cell: the defined cell nobody instantiates.
    /// With several such cells, the one defined last in the source.
    pub fn top_cell(&self, mode: Mode) -> Option<Ticket> {
        self.top[mode.index()]
    }
    /// Bounding box of cell `t`, including all descendants.
    /// Computed on first request, and cached.
    pub fn bbox(&mut self, mode: Mode, t: Ticket) -> HcdResult<BoundBox> {
        let mut visiting = HashSet::new();
        self.bbox_inner(mode, t, &mut visiting)
    }
    fn bbox_inner(
        &mut self,
        mode: Mode,
        t: Ticket,
        visiting: &mut HashSet<Ticket>,
    ) -> HcdResult<BoundBox> {
        let sym = *self.cell(mode, t)?;
        if sym.bb_ok() {
            return Ok(sym.bbox);
        }
        if !visiting.insert(t) {
            return Err(HcdError::format(format!(
                "Cell hierarchy cycle through {}",
                self.cell_name(mode, t)?
            )));
        }
        let crefs = self.instances(mode, t)?.collect_all()?;
        let mut bbox = sym.bbox;
        for c in crefs.iter() {
            let child = self.bbox_inner(mode, c.child_ticket()?, visiting)?;
            if child.is_empty() {
                continue;
            }
            let attrs = self.attrs.resolve(c.attr)?;
            for origin in attrs.corner_origins(Point::new(c.x, c.y)) {
                bbox = child.transform(&attrs.transform(&origin)).union(&bbox);
            }
        }
        visiting.remove(&t);
        let sym = self.tables[mode.index()].sym_mut(t)?;
        sym.bbox = bbox;
        sym.flags |= SYM_BB_OK;
        Ok(bbox)
    }
    /// Storage statistics
    pub fn stats(&self) -> DigestStats {
        let mut stats = DigestStats {
            attributes: self.attrs.len() as u64,
            cref_records: self.crefs.len(),
            store: self.store.stats(),
            store_memory: self.store.memory() as u64,
            stranded: self.stranded,
            ..Default::default()
        };
        for tbl in self.tables.iter() {
            for (_, sym) in tbl.iter() {
                stats.cells += 1;
                stats.instances += sym.ninst as u64;
                match sym.list {
                    ListState::Plain { .. } => stats.plain_lists += 1,
                    ListState::Sealed { .. } | ListState::Open { .. } => stats.packed_lists += 1,
                    ListState::Empty => (),
                }
            }
        }
        stats
    }
    /// Set the user flag of the `index`th placement of cell `t`.
    ///
    /// Compressed lists are decoded, modified, and re-encoded into fresh segments.
    /// The store never frees the old ones: each change strands the list's previous encoding,
    /// counted in [DigestStats::stranded]. [Digest::decompress_all] releases them.
    pub fn set_instance_flag(
        &mut self,
        mode: Mode,
        t: Ticket,
        index: usize,
        flag: bool,
    ) -> HcdResult<()> {
        let sym = *self.cell(mode, t)?;
        if index >= sym.ninst as usize {
            return Err(HcdError::msg(format!(
                "Instance {} out of range for a cell with {}",
                index, sym.ninst
            )));
        }
        match sym.list {
            ListState::Empty => Err(HcdError::msg("Cell has no instances")),
            ListState::Open { .. } => Err(HcdError::msg("Instance list is still being built")),
            ListState::Plain { head } => {
                let mut cur = Ticket::from_raw(head)
                    .ok_or_else(|| HcdError::format("Null instance-list head"))?;
                for _ in 0..index {
                    let rec = self
                        .crefs
                        .get(cur)
                        .ok_or_else(|| HcdError::format("Invalid instance-record ticket"))?;
                    if rec.flags & CREF_LAST != 0 {
                        return Err(HcdError::format("Instance list shorter than its count"));
                    }
                    cur = self
                        .crefs
                        .next(cur)
                        .ok_or_else(|| HcdError::format("Unterminated instance list"))?;
                }
                let rec = self
                    .crefs
                    .get_mut(cur)
                    .ok_or_else(|| HcdError::format("Invalid instance-record ticket"))?;
                if flag {
                    rec.flags |= CREF_FLAG;
                } else {
                    rec.flags &= !CREF_FLAG;
                }
                Ok(())
            }
            ListState::Sealed { head } => {
                let head = Ticket::from_raw(head)
                    .ok_or_else(|| HcdError::format("Null instance-list head"))?;
                let mut old = PackedCrefs::new(&self.store, head)?;
                let mut crefs = (&mut old).collect::<HcdResult<Vec<CRef>>>()?;
                let encoded = old.encoded_len() as u64;
                let c = crefs
                    .get_mut(index)
                    .ok_or_else(|| HcdError::format("Instance list shorter than its count"))?;
                if c.flag == flag {
                    return Ok(());
                }
                c.flag = flag;
                let list = store_packed(&mut self.store, &crefs, self.config.cref_block_records)?;
                self.tables[mode.index()].sym_mut(t)?.list = list;
                self.stranded += encoded;
                Ok(())
            }
        }
    }
    /// Compress every plain instance list.
    /// Checks `cancel` between cells; lists converted before cancellation stay converted.
    /// Returns the number of lists converted.
    pub fn compress_all(&mut self, cancel: Option<&AtomicBool>) -> HcdResult<usize> {
        let mut converted = 0;
        for mode in Mode::ALL {
            let tickets = self.tables[mode.index()].tickets().to_vec();
            for t in tickets {
                if cancel.map_or(false, |c| c.load(Ordering::Relaxed)) {
                    return Err(HcdError::Interrupted);
                }
                if !matches!(self.cell(mode, t)?.list, ListState::Plain { .. }) {
                    continue;
                }
                let crefs = self.instances(mode, t)?.collect_all()?;
                let list = store_packed(&mut self.store, &crefs, self.config.cref_block_records)?;
                self.tables[mode.index()].sym_mut(t)?.list = list;
                converted += 1;
            }
        }
        // Every list now lives in the store
        self.crefs.clear();
        debug!("Compressed {} instance lists", converted);
        Ok(converted)
    }
    /// Decompress every compressed instance list into plain records.
    /// Checks `cancel` between cells. Returns the number of lists converted.
    pub fn decompress_all(&mut self, cancel: Option<&AtomicBool>) -> HcdResult<usize> {
        let mut converted = 0;
        for mode in Mode::ALL {
            let tickets = self.tables[mode.index()].tickets().to_vec();
            for t in tickets {
                if cancel.map_or(false, |c| c.load(Ordering::Relaxed)) {
                    return Err(HcdError::Interrupted);
                }
                if !matches!(self.cell(mode, t)?.list, ListState::Sealed { .. }) {
                    continue;
                }
                let crefs = self.instances(mode, t)?.collect_all()?;
                let list = store_plain(&mut self.crefs, &crefs)?;
                self.tables[mode.index()].sym_mut(t)?.list = list;
                converted += 1;
            }
        }
        self.store.clear();
        self.stranded = 0;
        debug!("Decompressed {} instance lists", converted);
        Ok(converted)
    }

    /// Attach external geometry handle `geometry`, returning any previously attached
    pub fn attach_geometry(&mut self, geometry: Box<dyn Geometry>) -> Option<Box<dyn Geometry>> {
        self.geometry.replace(geometry)
    }
    /// Boolean indication of whether a geometry handle is attached
    pub fn has_geometry(&self) -> bool {
        self.geometry.is_some()
    }
    /// Detach and return our geometry handle
    pub fn detach_geometry(&mut self) -> Option<Box<dyn Geometry>> {
        self.geometry.take()
    }
    /// Get the non-reference elements of cell `t`, as raw element records.
    /// Served by an attached [Geometry] handle if there is one, and otherwise re-read from the source archive.
    pub fn cell_geometry(&mut self, mode: Mode, t: Ticket) -> HcdResult<Option<Vec<u8>>> {
        let name = self.cell_name(mode, t)?.to_string();
        if let Some(g) = self.geometry.as_mut() {
            return g.cell_geometry(&name);
        }
        let sym = *self.cell(mode, t)?;
        if !sym.is_defined() {
            return Ok(None);
        }
        let src = match self.source.as_mut() {
            Some(src) => src,
            None => return Ok(None),
        };
        let (_, elems) = read_struct_at(BufReader::new(src), sym.offset)?;
        let elems: Vec<GdsElement> = elems.into_iter().filter(|e| !e.kind.is_ref()).collect();
        Ok(Some(encode_elements(&elems)?))
    }
    /// Re-open our source archive, for reading cell geometry.
    /// Compressed archives use our random-access index, or one found in `registry`.
    pub fn attach_source(&mut self, registry: Option<&IndexRegistry>) -> HcdResult<()> {
        if self.filename.is_empty() {
            return Err(HcdError::msg("Digest has no source archive"));
        }
        let mut archive = Archive::open(&self.filename)?;
        if let Some(z) = archive.gzip_mut() {
            if let Some(crc) = self.crc {
                if crc != z.crc() {
                    return Err(ZError::StaleIndex {
                        index_crc: crc,
                        archive_crc: z.crc(),
                    }
                    .into());
                }
            }
            self.crc = Some(z.crc());
            let index = match self.index.clone() {
                Some(index) => Some(index),
                None => registry.and_then(|r| r.lookup(z.crc())),
            };
            if let Some(index) = index {
                z.set_index(index.clone())?;
                self.index = Some(index);
            }
        }
        self.source = Some(archive);
        Ok(())
    }
    /// Close our source archive
    pub fn detach_source(&mut self) -> Option<Archive> {
        self.source.take()
    }
    /// Our random-access index, if any
    pub fn index(&self) -> Option<&Arc<ZIndex>> {
        self.index.as_ref()
    }
    /// Attach random-access index `index`. Fails if built from another archive.
    pub fn attach_index(&mut self, index: Arc<ZIndex>) -> HcdResult<()> {
        if let Some(crc) = self.crc {
            index.check(crc)?;
        }
        if let Some(z) = self.source.as_mut().and_then(Archive::gzip_mut) {
            z.set_index(index.clone())?;
        }
        self.index = Some(index);
        Ok(())
    }
    /// Share our index through `registry`. If the registry already holds a live index of the same archive,
    /// we adopt it in place of our own.
    pub fn register_index(&mut self, registry: &IndexRegistry) -> HcdResult<Option<Arc<ZIndex>>> {
        let index = match self.index.take() {
            Some(index) => index,
            None => return Ok(None),
        };
        let shared = registry.register(index);
        self.attach_index(shared.clone())?;
        Ok(Some(shared))
    }
    /// Release our index, and remove it from `registry` if nobody else holds it.
    /// Returns whether the registry entry was removed.
    pub fn unregister_index(&mut self, registry: &IndexRegistry) -> bool {
        let index = match self.index.take() {
            Some(index) => index,
            None => return false,
        };
        if let Some(z) = self.source.as_mut().and_then(Archive::gzip_mut) {
            z.clear_index();
        }
        // Other digests still share it
        if Arc::strong_count(&index) > 1 {
            return false;
        }
        registry.unregister(index.crc)
    }

    /// Dependency-order the cells of `mode` reachable from `roots`, children first
    pub fn order_cells(&self, mode: Mode, roots: &[Ticket]) -> HcdResult<Vec<Ticket>> {
        CellOrder { digest: self, mode }.order(roots)
    }
    /// Write GDSII to `dest`. Returns the number of bytes written.
    pub fn write_gds(&mut self, dest: impl Write, opts: &GdsOutput) -> HcdResult<u64> {
        let mode = opts.mode;
        let top = match &opts.top {
            Some(name) => Some(
                self.find_cell(mode, name)
                    .ok_or_else(|| HcdError::msg(format!("Cell {} not found", name)))?,
            ),
            None => self.top_cell(mode),
        };
        let lib = self.info[mode.index()].lib.clone();
        let mut wr = GdsWriter::new(dest);
        wr.begin_lib(&lib)?;
        if opts.flatten {
            let top = top.ok_or_else(|| HcdError::msg("Flattening requires a top cell"))?;
            self.write_flat(&mut wr, mode, top)?;
        } else {
            let roots = match top {
                Some(t) => vec![t],
                None => self.tables[mode.index()].tickets().to_vec(),
            };
            self.write_hier(&mut wr, mode, &roots)?;
        }
        wr.end_lib()?;
        info!(
            "Wrote {} bytes of {} GDSII",
            wr.written(),
            if opts.flatten { "flattened" } else { "hierarchical" }
        );
        Ok(wr.written())
    }
    /// Write GDSII to file `fname`, gzip-compressed if it ends in `.gz`
    pub fn write_gds_file(&mut self, fname: impl AsRef<Path>, opts: &GdsOutput) -> HcdResult<u64> {
        let file = BufWriter::new(File::create(&fname)?);
        match StreamFormat::from_path(&fname) {
            StreamFormat::Gds => self.write_gds(file, opts),
            StreamFormat::GdsGzip => {
                let mut enc = GzEncoder::new(file, Compression::default());
                let n = self.write_gds(&mut enc, opts)?;
                enc.finish()?.flush()?;
                Ok(n)
            }
        }
    }
    /// Write each cell reachable from `roots`, children first
    fn write_hier(&mut self, wr: &mut GdsWriter<'_>, mode: Mode, roots: &[Ticket]) -> HcdResult<()> {
        for t in self.order_cells(mode, roots)? {
            let sym = *self.cell(mode, t)?;
            let name = self.cell_name(mode, t)?.to_string();
            if !sym.is_defined() {
                warn!("Skipping undefined cell {}", name);
                continue;
            }
            wr.begin_struct(&name)?;
            match self.cell_geometry(mode, t)? {
                Some(bytes) => wr.write_raw(&bytes)?,
                None if sym.features != 0 => warn!("No geometry available for cell {}", name),
                None => (),
            }
            let crefs = self.instances(mode, t)?.collect_all()?;
            for c in crefs.iter() {
                let child = self.cell_name(mode, c.child_ticket()?)?;
                let attrs = self.attrs.resolve(c.attr)?;
                wr.write_element(&GdsElement::reference(child, &attrs, Point::new(c.x, c.y))?)?;
            }
            wr.end_struct()?;
        }
        Ok(())
    }
    /// Write a single cell holding all geometry below `top`
    fn write_flat(&mut self, wr: &mut GdsWriter<'_>, mode: Mode, top: Ticket) -> HcdResult<()> {
        let name = self.cell_name(mode, top)?.to_string();
        wr.begin_struct(&name)?;
        let mut cache = HashMap::new();
        let mut visiting = HashSet::new();
        self.flatten_into(wr, mode, top, &Transform::identity(), &mut cache, &mut visiting)?;
        wr.end_struct()
    }
    fn flatten_into(
        &mut self,
        wr: &mut GdsWriter<'_>,
        mode: Mode,
        t: Ticket,
        trans: &Transform,
        cache: &mut HashMap<Ticket, Rc<FlatCell>>,
        visiting: &mut HashSet<Ticket>,
    ) -> HcdResult<()> {
        let cell = match cache.get(&t) {
            Some(cell) => cell.clone(),
            None => {
                let cell = Rc::new(self.flat_cell(mode, t)?);
                cache.insert(t, cell.clone());
                cell
            }
        };
        if !visiting.insert(t) {
            return Err(HcdError::format(format!(
                "Cell hierarchy cycle through {}",
                self.cell_name(mode, t)?
            )));
        }
        for e in cell.elems.iter() {
            wr.write_element(&e.transformed(trans))?;
        }
        for (child, attrs, loc) in cell.insts.iter() {
            for origin in attrs.origins(*loc) {
                let inner = Transform::cascade(trans, &attrs.transform(&origin));
                self.flatten_into(wr, mode, *child, &inner, cache, visiting)?;
            }
        }
        visiting.remove(&t);
        Ok(())
    }
    fn flat_cell(&mut self, mode: Mode, t: Ticket) -> HcdResult<FlatCell> {
        let elems = match self.cell_geometry(mode, t)? {
            Some(bytes) => read_elements(&bytes)?,
            None => Vec::new(),
        };
        let mut insts = Vec::new();
        for c in self.instances(mode, t)? {
            let c = c?;
            insts.push((c.child_ticket()?, self.attrs.resolve(c.attr)?, Point::new(c.x, c.y)));
        }
        Ok(FlatCell { elems, insts })
    }

    /// Update the summary cell counts, and find each mode's top cell
    pub(crate) fn summarize(&mut self) {
        for mode in Mode::ALL {
            let tbl = &self.tables[mode.index()];
            let defined = tbl.iter().filter(|(_, s)| s.is_defined()).count() as u64;
            let info = &mut self.info[mode.index()];
            info.cells = defined;
            info.undefined = tbl.len() as u64 - defined;
            self.top[mode.index()] = tbl
                .iter()
                .filter(|(_, s)| s.is_defined() && !s.is_referenced())
                .max_by_key(|(_, s)| s.offset)
                .map(|(t, _)| t);
        }
    }
}
