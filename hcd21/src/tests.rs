//!
//! # Hcd21 Integration Tests
//!

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::attrs::Attrs;
use crate::cref::{PackedCrefs, CREF_RECORD_SIZE};
use crate::gds::*;
use crate::geom::{BoundBox, Point};
use crate::symtab::ListState;
use crate::*;

/// Boundary on `layer` covering `(x0, y0)` to `(x1, y1)`
fn rect(layer: i16, x0: i32, y0: i32, x1: i32, y1: i32) -> GdsElement {
    GdsElement {
        kind: ElemKind::Boundary,
        records: vec![
            GdsRecord::from_i16s(GdsRecordType::Layer, &[layer]),
            GdsRecord::from_i16s(GdsRecordType::DataType, &[0]),
            GdsRecord::from_i32s(
                GdsRecordType::Xy,
                &[x0, y0, x1, y0, x1, y1, x0, y1, x0, y0],
            ),
        ],
    }
}

/// Sample library:
/// * `leaf`, a 10x10 square
/// * `mid`, a 10 x 5 array of `leaf` at pitch (100, 100), plus a path
/// * `top`, two placements of `mid` (one rotated), plus a label
fn sample_gds() -> HcdResult<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut wr = GdsWriter::new(&mut buf);
        wr.begin_lib(&GdsLibHeader {
            version: 600,
            name: "sample".into(),
            units: (1e-3, 1e-9),
        })?;
        wr.begin_struct("leaf")?;
        wr.write_element(&rect(1, 0, 0, 10, 10))?;
        wr.end_struct()?;

        wr.begin_struct("mid")?;
        let arr = Attrs::default().arrayed(10, 5, Point::new(100, 0), Point::new(0, 100));
        wr.write_element(&GdsElement::reference("leaf", &arr, Point::new(0, 0))?)?;
        wr.write_element(&GdsElement {
            kind: ElemKind::Path,
            records: vec![
                GdsRecord::from_i16s(GdsRecordType::Layer, &[2]),
                GdsRecord::from_i16s(GdsRecordType::DataType, &[0]),
                GdsRecord::from_i32s(GdsRecordType::Width, &[4]),
                GdsRecord::from_i32s(GdsRecordType::Xy, &[0, -10, 900, -10]),
            ],
        })?;
        wr.end_struct()?;

        wr.begin_struct("top")?;
        wr.write_element(&GdsElement::reference("mid", &Attrs::default(), Point::new(0, 0))?)?;
        let rot = Attrs::new(false, 90.0, 1.0);
        wr.write_element(&GdsElement::reference("mid", &rot, Point::new(5000, 0))?)?;
        wr.write_element(&GdsElement {
            kind: ElemKind::Text,
            records: vec![
                GdsRecord::from_i16s(GdsRecordType::Layer, &[3]),
                GdsRecord::from_i16s(GdsRecordType::TextType, &[0]),
                GdsRecord::from_i32s(GdsRecordType::Xy, &[50, 50]),
                GdsRecord::from_str(GdsRecordType::String, "label"),
            ],
        })?;
        wr.end_struct()?;
        wr.end_lib()?;
    }
    Ok(buf)
}

fn gzip(bytes: &[u8]) -> HcdResult<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(bytes)?;
    Ok(enc.finish()?)
}

fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> HcdResult<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, bytes)?;
    Ok(path)
}

/// Build a digest from in-memory archive content
fn scan_bytes(bytes: Vec<u8>) -> HcdResult<Digest> {
    let mut b = DigestBuilder::new(HcdConfig::default())?;
    b.start_archive(Archive::from_bytes(bytes)?)?;
    assert_eq!(b.scan(&AtomicBool::new(false))?, BuildStatus::Complete);
    b.finish()
}

/// Placement as (child name, attributes, x, y, flag)
type Placement = (String, Attrs, i32, i32, bool);
/// Cell as (name, flags, bounding box, instance count, placements)
type CellSnapshot = (String, u16, BoundBox, u32, Vec<Placement>);

/// Representation-independent content of every cell of `mode`
fn snapshot(d: &Digest, mode: Mode) -> HcdResult<Vec<CellSnapshot>> {
    let mut rv = Vec::new();
    for (t, sym) in d.cells(mode) {
        let mut placements = Vec::new();
        for c in d.instances(mode, t)? {
            let c = c?;
            let child = d.cell_name(mode, c.child_ticket()?)?.to_string();
            placements.push((child, d.attrs(c.attr)?, c.x, c.y, c.flag));
        }
        rv.push((
            d.cell_name(mode, t)?.to_string(),
            sym.flags,
            sym.bbox,
            sym.ninst,
            placements,
        ));
    }
    Ok(rv)
}

#[test]
fn array_of_leaves() -> HcdResult<()> {
    let mut b = DigestBuilder::new(HcdConfig::default())?;
    b.begin_cell("leaf")?;
    b.add_geometry(&BoundBox::from_points(Point::new(0, 0), Point::new(10, 10)))?;
    b.end_cell()?;
    b.begin_cell("top")?;
    for row in 0..5 {
        for col in 0..10 {
            b.add_instance("leaf", &Attrs::default(), Point::new(100 * col, 100 * row), false)?;
        }
    }
    b.end_cell()?;
    let d = b.finish()?;

    let top = d.find_cell(Mode::Physical, "top").unwrap();
    let head = match d.cell(Mode::Physical, top)?.list {
        ListState::Sealed { head } => head,
        other => panic!("Expected a compressed list, found {:?}", other),
    };
    let mut packed = PackedCrefs::new(&d.store, crate::arena::Ticket::from_raw(head).unwrap())?;
    let crefs: Vec<_> = (&mut packed).collect::<HcdResult<_>>()?;
    assert_eq!(crefs.len(), 50);
    for (k, c) in crefs.iter().enumerate() {
        assert_eq!((c.x, c.y), (100 * (k as i32 % 10), 100 * (k as i32 / 10)));
    }
    assert!(packed.encoded_len() < 50 * CREF_RECORD_SIZE);
    Ok(())
}

#[test]
fn compression_preserves_order() -> HcdResult<()> {
    let cfg = HcdConfigBuilder::default().compress_lists(false).build()?;
    let mut b = DigestBuilder::new(cfg)?;
    b.begin_cell("top")?;
    let arr = Attrs::new(true, 270.0, 2.0).arrayed(3, 2, Point::new(70, 0), Point::new(0, 90));
    for k in 0..500 {
        let attrs = if k % 7 == 0 { arr } else { Attrs::default() };
        let loc = Point::new((k * 13) % 1000 - 500, k / 10 * 250);
        b.add_instance(if k % 3 == 0 { "a" } else { "b" }, &attrs, loc, k % 11 == 0)?;
    }
    b.end_cell()?;
    let mut d = b.finish()?;
    let before = snapshot(&d, Mode::Physical)?;
    assert_eq!(d.compress_all(None)?, 1);
    let top = d.find_cell(Mode::Physical, "top").unwrap();
    assert!(d.cell(Mode::Physical, top)?.is_compressed());
    assert_eq!(snapshot(&d, Mode::Physical)?, before);
    assert_eq!(d.decompress_all(None)?, 1);
    assert_eq!(snapshot(&d, Mode::Physical)?, before);
    Ok(())
}

/// A hierarchy exercising every feature of the digest file, but for those `version` cannot carry
fn file_sample(version: u32) -> HcdResult<Digest> {
    let mut b = if version >= 4 {
        let cfg = HcdConfigBuilder::default()
            .alias(Some(AliasConfig {
                prefix: "x_".into(),
                suffix: String::new(),
                case: CaseFold::Lower,
            }))
            .build()?;
        DigestBuilder::new(cfg)?
    } else {
        DigestBuilder::new(HcdConfig::default())?
    };
    b.begin_cell_at("Leaf", 100)?;
    if version >= 2 {
        b.add_geometry(&BoundBox::from_points(Point::new(0, 0), Point::new(8, 8)))?;
    }
    b.end_cell()?;
    b.begin_cell_at("Top", 2000)?;
    let arr = Attrs::default().arrayed(4, 4, Point::new(20, 0), Point::new(0, 20));
    b.add_instance("Leaf", &arr, Point::new(0, 0), false)?;
    b.add_instance("Leaf", &Attrs::new(false, 30.0, 1.0), Point::new(-50, 0), true)?;
    b.add_instance("Leaf", &Attrs::new(true, 0.0, 0.5), Point::new(0, -50), false)?;
    b.add_instance("Missing", &Attrs::default(), Point::new(7, 7), false)?;
    b.end_cell()?;
    b.set_mode(Mode::Electrical)?;
    b.begin_cell("Amp")?;
    b.add_instance("Leaf", &Attrs::new(false, 180.0, 1.0), Point::new(1, 2), false)?;
    b.end_cell()?;
    let mut d = b.finish()?;
    let top = d.find_cell(Mode::Physical, "Top").unwrap();
    d.tables[Mode::Physical.index()].set_num(top, 42)?;
    if version >= 2 {
        d.bbox(Mode::Physical, top)?;
    }
    Ok(d)
}

#[test]
fn file_round_trips() -> HcdResult<()> {
    for version in 1..=CURRENT_VERSION {
        let mut d = file_sample(version)?;
        let mut buf = Vec::new();
        d.write_to(&mut buf, version, false)?;
        let back = Digest::read(&mut buf.as_slice())?;
        for mode in Mode::ALL {
            assert_eq!(snapshot(&back, mode)?, snapshot(&d, mode)?);
            assert_eq!(back.info(mode), d.info(mode));
        }
        let top = back.find_cell(Mode::Physical, "Top").unwrap();
        assert_eq!(back.top_cell(Mode::Physical), Some(top));
        assert_eq!(back.cell(Mode::Physical, top)?.num, 42);
        assert_eq!(back.cell(Mode::Physical, top)?.offset, 2000);
        if version >= 3 {
            assert!(back.cell(Mode::Physical, top)?.is_compressed());
        }
        if version >= 4 {
            assert_eq!(back.alias(), d.alias());
            assert_eq!(back.cell_name(Mode::Physical, top)?, "x_top");
        }
    }
    Ok(())
}

#[test]
fn file_version_limits() -> HcdResult<()> {
    // Alias metadata needs version 4
    let mut d = file_sample(4)?;
    let err = d.write_to(&mut Vec::<u8>::new(), 3, false).unwrap_err();
    assert!(matches!(err, HcdError::Unsupported(_)));
    // Bounding boxes need version 2
    let mut d = file_sample(2)?;
    let err = d.write_to(&mut Vec::<u8>::new(), 1, false).unwrap_err();
    assert!(matches!(err, HcdError::Unsupported(_)));
    // Large offsets need version 4
    let mut b = DigestBuilder::new(HcdConfig::default())?;
    b.begin_cell_at("far", 1 << 33)?;
    b.end_cell()?;
    let mut d = b.finish()?;
    let err = d.write_to(&mut Vec::<u8>::new(), 3, false).unwrap_err();
    assert!(matches!(err, HcdError::Unsupported(_)));
    let mut buf = Vec::new();
    d.write_to(&mut buf, 4, false)?;
    let back = Digest::read(&mut buf.as_slice())?;
    let far = back.find_cell(Mode::Physical, "far").unwrap();
    assert_eq!(back.cell(Mode::Physical, far)?.offset, 1 << 33);
    Ok(())
}

#[test]
fn truncated_files_fail() -> HcdResult<()> {
    let mut d = file_sample(CURRENT_VERSION)?;
    let mut buf = Vec::new();
    d.write_to(&mut buf, CURRENT_VERSION, false)?;
    for len in 0..buf.len() {
        let err = Digest::read(&mut &buf[..len]).unwrap_err();
        assert!(err.is_format(), "Cut at {}: {:?}", len, err);
    }
    Ok(())
}

#[test]
fn corrupt_references_fail() -> HcdResult<()> {
    let mut b = DigestBuilder::new(HcdConfig::default())?;
    b.begin_cell("a")?;
    b.end_cell()?;
    let mut d = b.finish()?;
    let mut buf = Vec::new();
    d.write_to(&mut buf, CURRENT_VERSION, false)?;
    // The file ends with the single six-byte cell record, and the two body terminators.
    // Point the record's name id past the string table.
    let id = buf.len() - 8;
    assert_eq!(buf[id], 1);
    buf[id] = 9;
    assert!(Digest::read(&mut buf.as_slice()).unwrap_err().is_format());

    // Embedded geometry must inflate to exactly its recorded length
    let mut b = DigestBuilder::new(HcdConfig::default())?;
    b.begin_cell("a")?;
    b.end_cell()?;
    let mut d = b.finish()?;
    let mut geometry = MemGeometry::new();
    geometry.insert("a", vec![0u8; 200]);
    d.attach_geometry(Box::new(geometry));
    let mut buf = Vec::new();
    d.write_to(&mut buf, CURRENT_VERSION, true)?;
    assert!(Digest::read(&mut buf.as_slice())?.has_geometry());

    let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&[0u8; 200])?;
    let blob = enc.finish()?;
    assert!(blob.len() < 128);
    // Tail: raw length (two varint bytes), blob length, blob, two body terminators
    let raw = buf.len() - 2 - blob.len() - 1 - 2;
    assert_eq!(&buf[raw..raw + 2], &[0xC8, 0x01]);
    for claimed in [0xC7, 0xC9] {
        let mut bad = buf.clone();
        bad[raw] = claimed;
        assert!(Digest::read(&mut bad.as_slice()).unwrap_err().is_format());
    }
    // A claimed length beyond any blob is rejected before inflating
    let mut bad = buf[..raw].to_vec();
    bad.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
    bad.extend_from_slice(&buf[raw + 2..]);
    assert!(Digest::read(&mut bad.as_slice()).unwrap_err().is_format());
    Ok(())
}

#[test]
fn scan_plain_archive() -> HcdResult<()> {
    let dir = tempfile::tempdir()?;
    let path = write_file(dir.path(), "sample.gds", &sample_gds()?)?;
    let mut d = Digest::from_archive(&path, HcdConfig::default(), None)?;
    assert_eq!(d.kind(), SourceKind::Gds);
    assert_eq!(d.crc(), None);
    assert!(d.index().is_none());

    let info = d.info(Mode::Physical).clone();
    assert_eq!(info.cells, 3);
    assert_eq!(info.lib.name, "sample");
    assert_eq!(info.counts.boundaries, 1);
    assert_eq!(info.counts.paths, 1);
    assert_eq!(info.counts.texts, 1);
    assert_eq!(info.counts.srefs, 2);
    assert_eq!(info.counts.arefs, 1);
    assert_eq!(info.layers.len(), 3);

    let top = d.top_cell(Mode::Physical).unwrap();
    assert_eq!(d.cell_name(Mode::Physical, top)?, "top");
    let mid = d.find_cell(Mode::Physical, "mid").unwrap();
    let insts = d.instances(Mode::Physical, mid)?.collect_all()?;
    assert_eq!(insts.len(), 1);
    let arr = d.attrs(insts[0].attr)?;
    assert_eq!(arr.count(), 50);
    // Path (0,-10)-(900,-10) of width 4, plus the array
    assert_eq!(
        d.bbox(Mode::Physical, mid)?,
        BoundBox::from_points(Point::new(-2, -12), Point::new(910, 410))
    );

    // Geometry re-read from the source, references excluded
    let leaf = d.find_cell(Mode::Physical, "leaf").unwrap();
    let bytes = d.cell_geometry(Mode::Physical, leaf)?.unwrap();
    assert_eq!(read_elements(&bytes)?, vec![rect(1, 0, 0, 10, 10)]);
    let bytes = d.cell_geometry(Mode::Physical, mid)?.unwrap();
    let elems = read_elements(&bytes)?;
    assert_eq!(elems.len(), 1);
    assert_eq!(elems[0].kind, ElemKind::Path);
    Ok(())
}

#[test]
fn scan_gzip_archive() -> HcdResult<()> {
    let plain = sample_gds()?;
    let dir = tempfile::tempdir()?;
    let path = write_file(dir.path(), "sample.gds.gz", &gzip(&plain)?)?;
    let cfg = HcdConfigBuilder::default().zindex_span(64u64).build()?;
    let mut d = Digest::from_archive(&path, cfg, None)?;
    assert_eq!(d.kind(), SourceKind::GdsGzip);
    let crc = d.crc().unwrap();
    assert_eq!(d.index().unwrap().crc, crc);

    let reference = scan_bytes(plain)?;
    for mode in Mode::ALL {
        assert_eq!(snapshot(&d, mode)?, snapshot(&reference, mode)?);
    }
    // Geometry by seeking back into the compressed source
    let leaf = d.find_cell(Mode::Physical, "leaf").unwrap();
    let bytes = d.cell_geometry(Mode::Physical, leaf)?.unwrap();
    assert_eq!(read_elements(&bytes)?, vec![rect(1, 0, 0, 10, 10)]);

    // Persisted indices are checked against the archive
    let index_path = dir.path().join("sample.gds.gz.hzx");
    d.index().unwrap().save(&index_path)?;
    assert_eq!(ZIndex::open(&index_path, Some(crc))?, **d.index().unwrap());
    let mut b = DigestBuilder::new(HcdConfig::default())?;
    b.load_index_file(&index_path)?;
    b.open_archive(&path)?;
    assert_eq!(b.scan(&AtomicBool::new(false))?, BuildStatus::Complete);
    let again = b.finish()?;
    assert_eq!(snapshot(&again, Mode::Physical)?, snapshot(&d, Mode::Physical)?);

    let stale = Arc::new(ZIndex {
        crc: crc ^ 1,
        points: d.index().unwrap().points.clone(),
    });
    assert!(d.attach_index(stale).unwrap_err().is_compression());
    Ok(())
}

#[test]
fn shared_indices() -> HcdResult<()> {
    let gz = gzip(&sample_gds()?)?;
    let dir = tempfile::tempdir()?;
    let a = write_file(dir.path(), "a.gds.gz", &gz)?;
    let b = write_file(dir.path(), "b.gds.gz", &gz)?;
    let registry = IndexRegistry::new();

    let da = Digest::from_archive(&a, HcdConfig::default(), Some(&registry))?;
    let db = Digest::from_archive(&b, HcdConfig::default(), Some(&registry))?;
    let (ia, ib) = (da.index().unwrap(), db.index().unwrap());
    assert!(Arc::ptr_eq(ia, ib));
    assert_eq!(ia.crc, ib.crc);
    assert_eq!(ia.points.len(), ib.points.len());
    assert_eq!(registry.live(), 1);

    drop(da);
    assert_eq!(registry.live(), 1);
    assert!(registry.lookup(db.crc().unwrap()).is_some());
    drop(db);
    assert_eq!(registry.live(), 0);
    Ok(())
}

#[test]
fn unregistering_indices() -> HcdResult<()> {
    let gz = gzip(&sample_gds()?)?;
    let dir = tempfile::tempdir()?;
    let a = write_file(dir.path(), "a.gds.gz", &gz)?;
    let b = write_file(dir.path(), "b.gds.gz", &gz)?;
    let registry = IndexRegistry::new();
    let mut da = Digest::from_archive(&a, HcdConfig::default(), Some(&registry))?;
    let mut db = Digest::from_archive(&b, HcdConfig::default(), Some(&registry))?;

    // Still shared with `db`
    assert!(!da.unregister_index(&registry));
    assert!(da.index().is_none());
    assert_eq!(registry.live(), 1);
    assert!(db.unregister_index(&registry));
    assert_eq!(registry.live(), 0);

    // Geometry remains readable without an index
    let leaf = db.find_cell(Mode::Physical, "leaf").unwrap();
    assert!(db.cell_geometry(Mode::Physical, leaf)?.is_some());
    Ok(())
}

#[test]
fn reopened_digests_reattach_sources() -> HcdResult<()> {
    let dir = tempfile::tempdir()?;
    let path = write_file(dir.path(), "sample.gds.gz", &gzip(&sample_gds()?)?)?;
    let mut d = Digest::from_archive(&path, HcdConfig::default(), None)?;
    let hcd = dir.path().join("sample.hcd");
    d.write(&hcd)?;

    let mut back = Digest::open(&hcd)?;
    assert_eq!(back.kind(), SourceKind::GdsGzip);
    assert_eq!(back.crc(), d.crc());
    let leaf = back.find_cell(Mode::Physical, "leaf").unwrap();
    assert_eq!(back.cell_geometry(Mode::Physical, leaf)?, None);
    back.attach_source(None)?;
    let bytes = back.cell_geometry(Mode::Physical, leaf)?.unwrap();
    assert_eq!(read_elements(&bytes)?, vec![rect(1, 0, 0, 10, 10)]);

    // A changed archive is detected
    let mut other = sample_gds()?;
    other.extend_from_slice(&[0, 0]);
    std::fs::write(&path, gzip(&other)?)?;
    let mut back = Digest::open(&hcd)?;
    assert!(back.attach_source(None).unwrap_err().is_compression());
    Ok(())
}

#[test]
fn hierarchical_output() -> HcdResult<()> {
    let dir = tempfile::tempdir()?;
    let path = write_file(dir.path(), "sample.gds", &sample_gds()?)?;
    let mut d = Digest::from_archive(&path, HcdConfig::default(), None)?;
    let mut out = Vec::new();
    d.write_gds(&mut out, &GdsOutput::default())?;

    let back = scan_bytes(out)?;
    assert_eq!(back.info(Mode::Physical).counts, d.info(Mode::Physical).counts);
    assert_eq!(back.info(Mode::Physical).lib, d.info(Mode::Physical).lib);
    let names = |d: &Digest| -> HcdResult<Vec<(String, u32)>> {
        let mut v: Vec<(String, u32)> = d
            .list_cells(Mode::Physical)?
            .into_iter()
            .map(|c| (c.name, c.instances))
            .collect();
        v.sort();
        Ok(v)
    };
    assert_eq!(names(&back)?, names(&d)?);
    Ok(())
}

#[test]
fn flattened_output() -> HcdResult<()> {
    let dir = tempfile::tempdir()?;
    let path = write_file(dir.path(), "sample.gds.gz", &gzip(&sample_gds()?)?)?;
    let mut d = Digest::from_archive(&path, HcdConfig::default(), None)?;
    let gz = dir.path().join("flat.gds.gz");
    let opts = GdsOutput {
        flatten: true,
        ..Default::default()
    };
    d.write_gds_file(&gz, &opts)?;

    let flat = Digest::from_archive(&gz, HcdConfig::default(), None)?;
    let info = flat.info(Mode::Physical);
    assert_eq!(info.cells, 1);
    assert_eq!(info.counts.boundaries, 100);
    assert_eq!(info.counts.paths, 2);
    assert_eq!(info.counts.texts, 1);
    assert_eq!(info.counts.srefs + info.counts.arefs, 0);

    // The rotated copy of `mid` lands left of x=5000
    let mut flat = flat;
    let top = flat.top_cell(Mode::Physical).unwrap();
    assert_eq!(flat.cell_name(Mode::Physical, top)?, "top");
    assert_eq!(
        flat.bbox(Mode::Physical, top)?,
        BoundBox::from_points(Point::new(-2, -12), Point::new(5012, 910))
    );
    Ok(())
}

#[test]
fn cancelled_scans_resume() -> HcdResult<()> {
    let mut b = DigestBuilder::new(HcdConfig::default())?;
    b.start_archive(Archive::from_bytes(gzip(&sample_gds()?)?)?)?;
    let cancel = AtomicBool::new(true);
    assert_eq!(b.scan(&cancel)?, BuildStatus::Interrupted);
    cancel.store(false, std::sync::atomic::Ordering::Relaxed);
    assert_eq!(b.scan(&cancel)?, BuildStatus::Complete);
    let d = b.finish()?;
    assert_eq!(d.info(Mode::Physical).cells, 3);
    assert!(d.index().is_some());
    Ok(())
}

#[test]
fn embedded_geometry() -> HcdResult<()> {
    let dir = tempfile::tempdir()?;
    let path = write_file(dir.path(), "sample.gds", &sample_gds()?)?;
    let mut d = Digest::from_archive(&path, HcdConfig::default(), None)?;
    let hcd = dir.path().join("sample.hcd");
    d.save(&hcd, CURRENT_VERSION, true)?;
    // The source is no longer needed
    std::fs::remove_file(&path)?;

    let mut back = Digest::open(&hcd)?;
    for name in ["leaf", "mid", "top"] {
        let t = back.find_cell(Mode::Physical, name).unwrap();
        let orig = d.find_cell(Mode::Physical, name).unwrap();
        assert_eq!(
            back.cell_geometry(Mode::Physical, t)?,
            d.cell_geometry(Mode::Physical, orig)?
        );
    }
    let mut out = Vec::new();
    back.write_gds(
        &mut out,
        &GdsOutput {
            flatten: true,
            ..Default::default()
        },
    )?;
    assert_eq!(scan_bytes(out)?.info(Mode::Physical).counts.boundaries, 100);
    Ok(())
}
