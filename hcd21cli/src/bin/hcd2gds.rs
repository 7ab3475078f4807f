//!
//! # hcd2gds
//!
//! Streams a hierarchy digest back out as GDSII,
//! either hierarchically or flattened into its top cell.
//! Cell geometry is taken from the digest where embedded, or re-read from its source archive.
//!

use clap::Parser;
use log::info;
use std::error::Error;

use hcd21::{Digest, GdsOutput, Mode};

/// Hierarchical Cell Digest to GDSII Converter
#[derive(Parser)]
struct ProgramOptions {
    /// Input Digest File
    #[clap(short = 'i', long, default_value = "")]
    hcd: String,
    /// GDSII Output File. Gzip-compressed if ending in `.gz`.
    #[clap(short = 'o', long, default_value = "")]
    gds: String,
    /// Top Cell Name
    #[clap(short = 't', long, default_value = "")]
    top: String,
    /// Flatten into the top cell
    #[clap(long)]
    flatten: bool,
    /// Write the electrical view
    #[clap(long)]
    electrical: bool,
    /// Verbose Output Mode
    #[clap(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let options = ProgramOptions::parse();
    let level = if options.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    _main(&options)
}

fn _main(options: &ProgramOptions) -> Result<(), Box<dyn Error>> {
    let mut digest = Digest::open(&options.hcd)?;
    if !digest.has_geometry() && !digest.filename().is_empty() {
        digest.attach_source(None)?;
    }
    let opts = GdsOutput {
        mode: if options.electrical {
            Mode::Electrical
        } else {
            Mode::Physical
        },
        top: if options.top.is_empty() {
            None
        } else {
            Some(options.top.clone())
        },
        flatten: options.flatten,
    };
    let n = digest.write_gds_file(&options.gds, &opts)?;
    info!("Wrote {} bytes to {}", n, options.gds);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hcd21::attrs::Attrs;
    use hcd21::gds::{ElemKind, GdsElement, GdsLibHeader, GdsRecord, GdsRecordType, GdsWriter};
    use hcd21::geom::Point;
    use hcd21::HcdConfig;
    use std::path::Path;

    fn sample_gds(path: &Path) -> Result<(), Box<dyn Error>> {
        let mut wr = GdsWriter::open(path)?;
        wr.begin_lib(&GdsLibHeader::default())?;
        wr.begin_struct("cap")?;
        wr.write_element(&GdsElement {
            kind: ElemKind::Boundary,
            records: vec![
                GdsRecord::from_i16s(GdsRecordType::Layer, &[9]),
                GdsRecord::from_i16s(GdsRecordType::DataType, &[0]),
                GdsRecord::from_i32s(GdsRecordType::Xy, &[0, 0, 8, 0, 8, 8, 0, 8, 0, 0]),
            ],
        })?;
        wr.end_struct()?;
        wr.begin_struct("bank")?;
        for k in 0..3 {
            let loc = Point::new(0, 20 * k);
            wr.write_element(&GdsElement::reference("cap", &Attrs::default(), loc)?)?;
        }
        wr.end_struct()?;
        wr.end_lib()?;
        Ok(())
    }

    /// Digest `bank.gds` in `dir`, returning the digest path
    fn digest(dir: &Path, geometry: bool) -> Result<String, Box<dyn Error>> {
        let gds = dir.join("bank.gds");
        sample_gds(&gds)?;
        let hcd = dir.join("bank.hcd");
        let mut d = Digest::from_archive(&gds, HcdConfig::default(), None)?;
        d.save(&hcd, hcd21::CURRENT_VERSION, geometry)?;
        Ok(hcd.to_string_lossy().to_string())
    }

    #[test]
    fn streams_from_source() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let options = ProgramOptions {
            hcd: digest(dir.path(), false)?,
            gds: dir.path().join("out.gds").to_string_lossy().to_string(),
            top: String::new(),
            flatten: false,
            electrical: false,
            verbose: false,
        };
        _main(&options)?;

        let redone = Digest::from_archive(&options.gds, HcdConfig::default(), None)?;
        let bank = redone.find_cell(Mode::Physical, "bank").unwrap();
        assert_eq!(redone.cell(Mode::Physical, bank)?.ninst, 3);
        assert_eq!(redone.info(Mode::Physical).counts.boundaries, 1);
        Ok(())
    }

    #[test]
    fn flattens_embedded_geometry() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let hcd = digest(dir.path(), true)?;
        // The digest no longer needs its source
        std::fs::remove_file(dir.path().join("bank.gds"))?;
        let options = ProgramOptions {
            hcd,
            gds: dir.path().join("flat.gds.gz").to_string_lossy().to_string(),
            top: "bank".into(),
            flatten: true,
            electrical: false,
            verbose: false,
        };
        _main(&options)?;

        let flat = Digest::from_archive(&options.gds, HcdConfig::default(), None)?;
        assert_eq!(flat.info(Mode::Physical).cells, 1);
        assert_eq!(flat.info(Mode::Physical).counts.boundaries, 3);
        assert_eq!(flat.info(Mode::Physical).counts.srefs, 0);
        Ok(())
    }
}
