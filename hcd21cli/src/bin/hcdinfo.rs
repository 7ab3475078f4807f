//!
//! # hcdinfo
//!
//! Summarizes a hierarchy digest, or the archive it would be built from,
//! in JSON, YAML, or TOML.
//!

use clap::Parser;
use serde::Serialize;
use std::error::Error;

use hcd21::digest::CellSummary;
use hcd21::ser::SerializationFormat;
use hcd21::{Digest, DigestInfo, DigestStats, HcdConfig, Mode, SourceKind};

/// Hierarchical Cell Digest Summarizer
#[derive(Parser)]
struct ProgramOptions {
    /// Input Digest File
    #[clap(short = 'i', long, default_value = "")]
    input: String,
    /// Treat the input as a GDSII archive, and digest it first
    #[clap(short = 'a', long)]
    archive: bool,
    /// Output Format (json, yaml, or toml)
    #[clap(short = 'f', long, default_value = "yaml")]
    fmt: String,
    /// Output File. Writes to stdout if not specified.
    #[clap(short = 'o', long, default_value = "")]
    out: String,
    /// Include per-cell summaries, with bounding boxes
    #[clap(long)]
    cells: bool,
    /// Verbose Output Mode
    #[clap(short, long)]
    verbose: bool,
}

/// Summary report, in output order
#[derive(Debug, Serialize)]
struct Report {
    filename: String,
    kind: SourceKind,
    crc: Option<u32>,
    stats: DigestStats,
    physical: DigestInfo,
    electrical: DigestInfo,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cells: Vec<CellSummary>,
}

fn main() -> Result<(), Box<dyn Error>> {
    let options = ProgramOptions::parse();
    let level = if options.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    let text = _main(&options)?;
    if options.out.is_empty() {
        println!("{}", text);
    } else {
        std::fs::write(&options.out, text)?;
    }
    Ok(())
}

/// Produce the serialized report
fn _main(options: &ProgramOptions) -> Result<String, Box<dyn Error>> {
    let fmt = SerializationFormat::from_name(&options.fmt)
        .ok_or_else(|| format!("Unknown output format {}", options.fmt))?;
    let mut digest = if options.archive {
        Digest::from_archive(&options.input, HcdConfig::default(), None)?
    } else {
        Digest::open(&options.input)?
    };
    let report = report(&mut digest, options.cells)?;
    Ok(fmt.to_string(&report)?)
}

fn report(digest: &mut Digest, cells: bool) -> Result<Report, Box<dyn Error>> {
    let mut summaries = Vec::new();
    if cells {
        for mode in Mode::ALL {
            let defined: Vec<_> = digest
                .cells(mode)
                .filter(|(_, sym)| sym.is_defined())
                .map(|(t, _)| t)
                .collect();
            for t in defined {
                digest.bbox(mode, t)?;
            }
            summaries.extend(digest.list_cells(mode)?);
        }
    }
    Ok(Report {
        filename: digest.filename().to_string(),
        kind: digest.kind(),
        crc: digest.crc(),
        stats: digest.stats(),
        physical: digest.info(Mode::Physical).clone(),
        electrical: digest.info(Mode::Electrical).clone(),
        cells: summaries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hcd21::attrs::Attrs;
    use hcd21::gds::{ElemKind, GdsElement, GdsLibHeader, GdsRecord, GdsRecordType, GdsWriter};
    use hcd21::geom::Point;

    fn sample_gds(path: &std::path::Path) -> Result<(), Box<dyn Error>> {
        let mut wr = GdsWriter::open(path)?;
        wr.begin_lib(&GdsLibHeader::default())?;
        wr.begin_struct("via")?;
        wr.write_element(&GdsElement {
            kind: ElemKind::Boundary,
            records: vec![
                GdsRecord::from_i16s(GdsRecordType::Layer, &[5]),
                GdsRecord::from_i16s(GdsRecordType::DataType, &[1]),
                GdsRecord::from_i32s(GdsRecordType::Xy, &[0, 0, 2, 0, 2, 2, 0, 2, 0, 0]),
            ],
        })?;
        wr.end_struct()?;
        wr.begin_struct("stack")?;
        let arr = Attrs::default().arrayed(4, 4, Point::new(10, 0), Point::new(0, 10));
        wr.write_element(&GdsElement::reference("via", &arr, Point::new(0, 0))?)?;
        wr.end_struct()?;
        wr.end_lib()?;
        Ok(())
    }

    #[test]
    fn summarizes_archive() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let gds = dir.path().join("stack.gds");
        sample_gds(&gds)?;
        let options = ProgramOptions {
            input: gds.to_string_lossy().to_string(),
            archive: true,
            fmt: "json".into(),
            out: String::new(),
            cells: true,
            verbose: false,
        };
        let text = _main(&options)?;
        let v: serde_json::Value = serde_json::from_str(&text)?;
        assert_eq!(v["kind"], "Gds");
        assert_eq!(v["physical"]["cells"], 2);
        assert_eq!(v["physical"]["counts"]["arefs"], 1);
        assert_eq!(v["physical"]["layers"][0]["layer"], 5);

        let cells = v["cells"].as_array().unwrap();
        let stack = cells.iter().find(|c| c["name"] == "stack").unwrap();
        assert_eq!(stack["instances"], 1);
        assert_eq!(stack["bbox"]["p1"]["x"], 32);
        Ok(())
    }

    #[test]
    fn summarizes_digest() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let gds = dir.path().join("stack.gds");
        sample_gds(&gds)?;
        let hcd = dir.path().join("stack.hcd");
        Digest::from_archive(&gds, HcdConfig::default(), None)?.write(&hcd)?;

        let options = ProgramOptions {
            input: hcd.to_string_lossy().to_string(),
            archive: false,
            fmt: "yaml".into(),
            out: String::new(),
            cells: false,
            verbose: false,
        };
        let text = _main(&options)?;
        assert!(text.contains("filename:"));
        assert!(!text.contains("cells:\n  -"));

        let bad = ProgramOptions {
            fmt: "xml".into(),
            ..options
        };
        assert!(_main(&bad).is_err());
        Ok(())
    }
}
