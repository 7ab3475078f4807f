//!
//! # gzindex
//!
//! Builds, or checks, the random-access index of a gzip-compressed archive.
//!

use clap::Parser;
use log::info;
use std::error::Error;
use std::io::{self, Read};

use hcd21::{Archive, ZIndex};

/// Gzip Random-Access Indexer
#[derive(Parser)]
struct ProgramOptions {
    /// Gzip-Compressed Input File
    #[clap(short = 'i', long, default_value = "")]
    input: String,
    /// Index Output File. Defaults to the input path plus `.hzx`.
    #[clap(short = 'o', long, default_value = "")]
    out: String,
    /// Decompressed bytes between checkpoints
    #[clap(short = 's', long, default_value_t = 1 << 20)]
    span: u64,
    /// Check an existing index against the input, rather than building one
    #[clap(long)]
    check: bool,
    /// Verbose Output Mode
    #[clap(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let options = ProgramOptions::parse();
    let level = if options.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    let n = _main(&options)?;
    println!("{}: {} checkpoints", index_path(&options), n);
    Ok(())
}

fn index_path(options: &ProgramOptions) -> String {
    if options.out.is_empty() {
        format!("{}.hzx", options.input)
    } else {
        options.out.clone()
    }
}

/// Build or check the index. Returns its number of checkpoints.
fn _main(options: &ProgramOptions) -> Result<usize, Box<dyn Error>> {
    let mut archive = Archive::open(&options.input)?;
    let z = archive
        .gzip_mut()
        .ok_or_else(|| format!("{} is not gzip-compressed", options.input))?;
    let path = index_path(options);

    if options.check {
        let index = ZIndex::open(&path, Some(z.crc()))?;
        let n = index.points.len();
        let targets: Vec<u64> = index.points.iter().map(|p| p.out).collect();
        z.set_index(index.into())?;
        // Resume from each checkpoint, back to front
        let mut buf = [0u8; 64];
        for out in targets.into_iter().rev() {
            z.seek_to(out)?;
            let _ = z.read(&mut buf)?;
        }
        info!("{} matches {}", path, options.input);
        return Ok(n);
    }

    z.record_index(options.span)?;
    io::copy(&mut archive, &mut io::sink())?;
    let index = archive
        .gzip_mut()
        .and_then(|z| z.take_index())
        .ok_or("Index recording was abandoned")?;
    index.save(&path)?;
    info!("Wrote {}", path);
    Ok(index.points.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    /// Gzip ~1MB of loosely repetitive text into `path`
    fn sample_gz(path: &std::path::Path) -> Result<(), Box<dyn Error>> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        for k in 0..40_000u32 {
            writeln!(enc, "line {} {}", k, k.wrapping_mul(2_654_435_761))?;
        }
        std::fs::write(path, enc.finish()?)?;
        Ok(())
    }

    #[test]
    fn builds_and_checks() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let gz = dir.path().join("lines.txt.gz");
        sample_gz(&gz)?;
        let options = ProgramOptions {
            input: gz.to_string_lossy().to_string(),
            out: String::new(),
            span: 64 * 1024,
            check: false,
            verbose: false,
        };
        let n = _main(&options)?;
        assert!(n > 1);
        assert!(dir.path().join("lines.txt.gz.hzx").exists());

        let check = ProgramOptions {
            check: true,
            ..options
        };
        assert_eq!(_main(&check)?, n);
        Ok(())
    }

    #[test]
    fn rejects_stale_index() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let gz = dir.path().join("a.gz");
        sample_gz(&gz)?;
        let hzx = dir.path().join("a.hzx").to_string_lossy().to_string();
        let options = ProgramOptions {
            input: gz.to_string_lossy().to_string(),
            out: hzx.clone(),
            span: 64 * 1024,
            check: false,
            verbose: false,
        };
        _main(&options)?;

        // Re-compress different content in place
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"something else entirely")?;
        std::fs::write(&gz, enc.finish()?)?;
        let check = ProgramOptions {
            check: true,
            ..options
        };
        assert!(_main(&check).is_err());

        let plain = dir.path().join("plain.txt");
        std::fs::write(&plain, b"not compressed")?;
        let options = ProgramOptions {
            input: plain.to_string_lossy().to_string(),
            out: hzx,
            span: 64 * 1024,
            check: false,
            verbose: false,
        };
        assert!(_main(&options).is_err());
        Ok(())
    }
}
