//!
//! # Digest Build & Storage Configuration
//!

// Crates.io
use derive_builder::Builder;
use serde::{Deserialize, Serialize};

// Local imports
use crate::error::{HcdError, HcdResult};
use crate::file::CURRENT_VERSION;
use crate::ser::SerdeFile;
use crate::zbytes::MIN_COMPRESS_THRESHOLD;

/// # Case-Folding applied to aliased cell names
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CaseFold {
    Keep,
    Upper,
    Lower,
}
impl Default for CaseFold {
    fn default() -> Self {
        Self::Keep
    }
}

///
/// # Cell-Name Aliasing
///
/// Renaming applied to every cell name as an archive is scanned.
/// Recorded in written digests, so that readers can map names back.
///
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AliasConfig {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    #[serde(default)]
    pub case: CaseFold,
}
impl AliasConfig {
    /// Apply our renaming to `name`
    pub fn apply(&self, name: &str) -> String {
        let name = match self.case {
            CaseFold::Keep => name.to_string(),
            CaseFold::Upper => name.to_ascii_uppercase(),
            CaseFold::Lower => name.to_ascii_lowercase(),
        };
        format!("{}{}{}", self.prefix, name, self.suffix)
    }
    /// Boolean indication of whether we change anything
    pub fn is_identity(&self) -> bool {
        self.prefix.is_empty() && self.suffix.is_empty() && self.case == CaseFold::Keep
    }
}

///
/// # Hcd21 Configuration
///
/// Created with defaults, through [HcdConfigBuilder], or from a JSON/YAML/TOML file:
///
/// ```
/// use hcd21::{HcdConfig, HcdConfigBuilder};
/// let cfg = HcdConfigBuilder::default()
///     .compress_threshold(128usize)
///     .build()
///     .unwrap();
/// assert_eq!(cfg.compress_threshold, 128);
/// assert!(cfg.compress_lists);
/// ```
///
#[derive(Debug, Clone, Builder, Serialize, Deserialize, PartialEq)]
#[builder(pattern = "owned", setter(into), default)]
#[serde(default)]
pub struct HcdConfig {
    /// Compress instance lists while building
    pub compress_lists: bool,
    /// Byte-store blocks smaller than this are stored without a length prefix or compression.
    /// Values below [MIN_COMPRESS_THRESHOLD] disable compression entirely.
    pub compress_threshold: usize,
    /// Records per instance-arena block. Also bounds the size of each compressed list segment.
    pub cref_block_records: usize,
    /// Log2 of the byte-arena ticket stride, i.e. the largest single allocation
    pub arena_block_bits: u32,
    /// Target decompressed bytes between random-access checkpoints
    pub zindex_span: u64,
    /// Digest-file format version to write
    pub version: u32,
    /// Optional cell-name aliasing
    pub alias: Option<AliasConfig>,
}
impl Default for HcdConfig {
    fn default() -> Self {
        Self {
            compress_lists: true,
            compress_threshold: 64,
            cref_block_records: 4096,
            arena_block_bits: 20,
            zindex_span: 1 << 20,
            version: CURRENT_VERSION,
            alias: None,
        }
    }
}
impl HcdConfig {
    /// Load from a JSON, YAML, or TOML file, inferring the format from its extension
    pub fn open(fname: impl AsRef<std::path::Path>) -> HcdResult<Self> {
        let cfg = Self::open_any(fname)?;
        cfg.validate()?;
        Ok(cfg)
    }
    /// Check our values are in their supported ranges
    pub fn validate(&self) -> HcdResult<()> {
        if !(16..=24).contains(&self.arena_block_bits) {
            return Err(HcdError::msg(format!(
                "arena_block_bits must be within [16, 24], not {}",
                self.arena_block_bits
            )));
        }
        if !(16..=1 << 16).contains(&self.cref_block_records) {
            return Err(HcdError::msg(format!(
                "cref_block_records must be within [16, 65536], not {}",
                self.cref_block_records
            )));
        }
        if self.zindex_span < 1024 {
            return Err(HcdError::msg("zindex_span must be at least 1024 bytes"));
        }
        if self.version == 0 || self.version > CURRENT_VERSION {
            return Err(HcdError::Unsupported(format!(
                "digest format version {}",
                self.version
            )));
        }
        Ok(())
    }
    /// Boolean indication of whether byte-store compression is enabled
    pub fn compression_enabled(&self) -> bool {
        self.compress_threshold >= MIN_COMPRESS_THRESHOLD
    }
}
impl SerdeFile for HcdConfig {}
impl From<HcdConfigBuilderError> for HcdError {
    fn from(e: HcdConfigBuilderError) -> Self {
        Self::Boxed(Box::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ser::SerializationFormat;

    #[test]
    fn config_defaults_validate() -> HcdResult<()> {
        HcdConfig::default().validate()?;
        let cfg = HcdConfigBuilder::default().arena_block_bits(4u32).build()?;
        assert!(cfg.validate().is_err());
        Ok(())
    }
    #[test]
    fn config_files() -> HcdResult<()> {
        let cfg = HcdConfigBuilder::default()
            .compress_threshold(200usize)
            .alias(Some(AliasConfig {
                prefix: "x_".into(),
                suffix: String::new(),
                case: CaseFold::Upper,
            }))
            .build()?;
        let dir = tempfile::tempdir()?;
        for (fmt, name) in [
            (SerializationFormat::Json, "cfg.json"),
            (SerializationFormat::Yaml, "cfg.yaml"),
            (SerializationFormat::Toml, "cfg.toml"),
        ] {
            let path = dir.path().join(name);
            cfg.save_as(fmt, &path)?;
            assert_eq!(HcdConfig::open(&path)?, cfg);
        }
        Ok(())
    }
    #[test]
    fn partial_config_file() -> HcdResult<()> {
        let cfg: HcdConfig = SerializationFormat::Toml.from_str("zindex_span = 65536\n")?;
        assert_eq!(cfg.zindex_span, 65536);
        assert_eq!(cfg.cref_block_records, 4096);
        Ok(())
    }
    #[test]
    fn aliasing() {
        let alias = AliasConfig {
            prefix: "p_".into(),
            suffix: "_s".into(),
            case: CaseFold::Lower,
        };
        assert_eq!(alias.apply("INV"), "p_inv_s");
        assert!(AliasConfig::default().is_identity());
    }
}
