//!
//! # Text Serialization of Configurations and Summaries
//!
//! Digests themselves are always stored in their binary format (see [crate::file]).
//! Their configuration and summary data are ordinary [serde] types,
//! which can be written to and read from JSON, YAML, or TOML.
//!

// Std-Lib
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

// Crates.io
use serde::de::DeserializeOwned;
use serde::Serialize;

/// # Enumerated Supported Text Formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationFormat {
    Json,
    Yaml,
    Toml,
}
impl SerializationFormat {
    /// Infer the format from the extension of `fname`.
    /// Returns `None` for anything other than `json`, `yaml`/`yml`, or `toml`.
    pub fn from_path(fname: impl AsRef<Path>) -> Option<Self> {
        let ext = fname.as_ref().extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
    /// Parse a format name, as given on command lines
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "json" => Some(Self::Json),
            "yaml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
    /// Convert any [serde::Serialize] data to a serialized string
    pub fn to_string(&self, data: &impl Serialize) -> Result<String, Error> {
        match *self {
            Self::Json => Ok(serde_json::to_string_pretty(data)?),
            Self::Yaml => Ok(serde_yaml::to_string(data)?),
            Self::Toml => Ok(toml::to_string(data)?),
        }
    }
    /// Parse string `s`
    pub fn from_str<T: DeserializeOwned>(&self, s: &str) -> Result<T, Error> {
        match *self {
            Self::Json => Ok(serde_json::from_str(s)?),
            Self::Yaml => Ok(serde_yaml::from_str(s)?),
            Self::Toml => Ok(toml::from_str(s)?),
        }
    }
    /// Save `data` to file `fname`
    pub fn save(&self, data: &impl Serialize, fname: impl AsRef<Path>) -> Result<(), Error> {
        let mut file = BufWriter::new(std::fs::File::create(fname)?);
        let s = self.to_string(data)?;
        file.write_all(s.as_bytes())?;
        file.flush()?;
        Ok(())
    }
    /// Load from file at path `fname`
    pub fn open<T: DeserializeOwned>(&self, fname: impl AsRef<Path>) -> Result<T, Error> {
        let mut file = BufReader::new(std::fs::File::open(&fname)?);
        let mut s = String::new();
        file.read_to_string(&mut s)?;
        self.from_str(&s)
    }
}

/// Serialization to & from file trait
///
/// Fully default-implemented, allowing empty implementations
/// for types that implement [serde] serialization and deserialization.
///
pub trait SerdeFile: Serialize + DeserializeOwned {
    /// Save in `fmt`-format to file `fname`
    fn save_as(&self, fmt: SerializationFormat, fname: impl AsRef<Path>) -> Result<(), Error> {
        fmt.save(self, fname)
    }
    /// Open from `fmt`-format file `fname`
    fn open_as(fname: impl AsRef<Path>, fmt: SerializationFormat) -> Result<Self, Error> {
        fmt.open(fname)
    }
    /// Open from file `fname`, inferring its format from its extension
    fn open_any(fname: impl AsRef<Path>) -> Result<Self, Error> {
        let fmt = SerializationFormat::from_path(&fname).ok_or_else(|| {
            Error::from(format!(
                "Cannot infer serialization format of {:?}",
                fname.as_ref()
            ))
        })?;
        fmt.open(fname)
    }
}

/// Wrapper over other errors
#[derive(Debug)]
pub struct Error(Box<dyn std::error::Error + Send + Sync>);
impl std::fmt::Display for Error {
    /// Delegate [std::fmt::Display] to the (derived) [std::fmt::Debug] implementation.
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
impl std::error::Error for Error {}
impl From<String> for Error {
    fn from(e: String) -> Self {
        Self(e.into())
    }
}
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self(Box::new(e))
    }
}
impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self(Box::new(e))
    }
}
impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Self(Box::new(e))
    }
}
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self(Box::new(e))
    }
}
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self(Box::new(e))
    }
}
