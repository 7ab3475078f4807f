//!
//! # gds2hcd
//!
//! Scans a plain or gzip-compressed GDSII archive, and writes its hierarchy digest.
//!

use clap::Parser;
use log::info;
use std::error::Error;

use hcd21::{Digest, DigestBuilder, HcdConfig, BuildStatus, CURRENT_VERSION};
use std::sync::atomic::AtomicBool;

// => The doc-comment on `ProgramOptions` here is displayed by the `clap`-generated help docs =>

/// GDSII to Hierarchical Cell Digest Converter
#[derive(Parser)]
struct ProgramOptions {
    /// GDSII Input File, optionally gzip-compressed
    #[clap(short = 'i', long, default_value = "")]
    gds: String,
    /// Digest Output File
    #[clap(short = 'o', long, default_value = "")]
    out: String,
    /// Configuration File (JSON, YAML, or TOML)
    #[clap(short = 'c', long, default_value = "")]
    config: String,
    /// Digest-File Format Version. Defaults to the configured version.
    #[clap(long, default_value_t = 0)]
    format: u32,
    /// Embed each cell's geometry in the digest
    #[clap(short = 'g', long)]
    geometry: bool,
    /// Previously saved random-access index of a compressed input
    #[clap(long, default_value = "")]
    zindex: String,
    /// Save the input's random-access index to this file
    #[clap(long, default_value = "")]
    save_zindex: String,
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
    let cfg = if options.config.is_empty() {
        HcdConfig::default()
    } else {
        HcdConfig::open(&options.config)?
    };
    let version = if options.format == 0 {
        cfg.version
    } else {
        options.format
    };
    if version > CURRENT_VERSION {
        return Err(format!("Unsupported digest-file version {}", version).into());
    }

    let mut digest = if options.zindex.is_empty() {
        Digest::from_archive(&options.gds, cfg, None)?
    } else {
        let mut b = DigestBuilder::new(cfg)?;
        b.load_index_file(&options.zindex)?;
        b.open_archive(&options.gds)?;
        match b.scan(&AtomicBool::new(false))? {
            BuildStatus::Complete => b.finish()?,
            BuildStatus::Interrupted => return Err("Scan interrupted".into()),
        }
    };
    if options.verbose {
        println!("{:?}", digest.stats());
    }
    digest.save(&options.out, version, options.geometry)?;
    info!("Wrote {}", options.out);

    if !options.save_zindex.is_empty() {
        match digest.index() {
            Some(index) => index.save(&options.save_zindex)?,
            None => return Err(format!("{} is not gzip-compressed", options.gds).into()),
        }
    }
    Ok(())
}
