//!
//! # Hcd21 Result and Error Types
//!
//! Errors fall in three families, each handled differently by callers:
//!
//! * [HcdError::Format] - the bytes being read are not a valid digest, archive, or index.
//!   Always fatal to the current read.
//! * [HcdError::Exhausted] - an arena ran out of ticket space.
//!   Fatal to the current build; callers may retry with a different [crate::HcdConfig].
//! * [HcdError::Compression] - the DEFLATE layer failed.
//!   May indicate an archive changed since its random-access index was built,
//!   in which case rebuilding the index is a reasonable recovery.
//!

/// # [HcdError] Result Type
pub type HcdResult<T> = Result<T, HcdError>;

///
/// # Compression-Layer Errors
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZError {
    /// Invalid DEFLATE data, at compressed bit-position `bitpos`
    Corrupt { msg: String, bitpos: u64 },
    /// Compressed stream ended before its final block
    Truncated,
    /// Gzip trailer checksum or length did not match the decompressed data
    Checksum { expected: u32, found: u32 },
    /// A random-access index was built from different archive content
    StaleIndex { index_crc: u32, archive_crc: u32 },
    /// Failure reported by the block (de)compressor of the byte store
    Block(String),
}

///
/// # Hcd21 Error Enumeration
///
pub enum HcdError {
    /// Invalid or truncated input data, optionally with the byte offset of the failure
    Format { msg: String, offset: Option<u64> },
    /// Arena or ticket space exhausted
    Exhausted { table: &'static str, tickets: u64 },
    /// Compression-layer failure
    Compression(ZError),
    /// Valid request which the target format-version cannot represent
    Unsupported(String),
    /// Cancellation requested by the caller
    Interrupted,
    /// Boxed External Errors
    Boxed(Box<dyn std::error::Error + Send + Sync>),
    /// Uncategorized Error, with String Message
    Str(String),
}
impl HcdError {
    /// Create a [HcdError::Format] from anything String-convertible
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format {
            msg: msg.into(),
            offset: None,
        }
    }
    /// Create a [HcdError::Format] located at byte-offset `offset`
    pub fn format_at(msg: impl Into<String>, offset: u64) -> Self {
        Self::Format {
            msg: msg.into(),
            offset: Some(offset),
        }
    }
    /// Create a [HcdError::Str] from anything String-convertible
    pub fn msg(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }
    /// Create an error-variant [Result] of our [HcdError::Str] variant
    pub fn fail<T>(s: impl Into<String>) -> Result<T, Self> {
        Err(Self::msg(s))
    }
    /// Boolean indication of a format error
    pub fn is_format(&self) -> bool {
        matches!(self, Self::Format { .. })
    }
    /// Boolean indication of a compression-layer error
    pub fn is_compression(&self) -> bool {
        matches!(self, Self::Compression(_))
    }
    /// Boolean indication of ticket-space exhaustion
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}
impl std::fmt::Debug for HcdError {
    /// Display a [HcdError]
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            HcdError::Format {
                msg,
                offset: Some(offset),
            } => write!(f, "Format Error: {} (at byte {})", msg, offset),
            HcdError::Format { msg, offset: None } => write!(f, "Format Error: {}", msg),
            HcdError::Exhausted { table, tickets } => write!(
                f,
                "Arena Exhausted: {} ran out of ticket space after {} tickets",
                table, tickets
            ),
            HcdError::Compression(e) => write!(f, "Compression Error: {:?}", e),
            HcdError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
            HcdError::Interrupted => write!(f, "Interrupted"),
            HcdError::Boxed(err) => err.fmt(f),
            HcdError::Str(err) => err.fmt(f),
        }
    }
}
impl std::fmt::Display for HcdError {
    /// Display a [HcdError]
    /// Delegates to the [Debug] implementation
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}
impl std::error::Error for HcdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Boxed(e) => Some(&**e),
            _ => None,
        }
    }
}
impl From<ZError> for HcdError {
    fn from(e: ZError) -> Self {
        Self::Compression(e)
    }
}
impl From<std::io::Error> for HcdError {
    /// Short reads are format errors.
    /// Our own errors, tunneled through an [std::io::Read] implementation, are unwrapped.
    /// Everything else is forwarded.
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Self::format("Unexpected end of data");
        }
        if e.get_ref().map_or(false, |inner| inner.is::<HcdError>()) {
            return match e.into_inner().map(|inner| inner.downcast::<HcdError>()) {
                Some(Ok(inner)) => *inner,
                _ => Self::msg("Unrecoverable I/O error"),
            };
        }
        Self::Boxed(Box::new(e))
    }
}
impl From<HcdError> for std::io::Error {
    fn from(e: HcdError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    }
}
impl From<std::str::Utf8Error> for HcdError {
    fn from(e: std::str::Utf8Error) -> Self {
        Self::Format {
            msg: format!("Invalid string data: {}", e),
            offset: None,
        }
    }
}
impl From<std::string::FromUtf8Error> for HcdError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Self::Format {
            msg: format!("Invalid string data: {}", e),
            offset: None,
        }
    }
}
impl From<std::num::TryFromIntError> for HcdError {
    fn from(e: std::num::TryFromIntError) -> Self {
        Self::Boxed(Box::new(e))
    }
}
impl From<crate::ser::Error> for HcdError {
    fn from(e: crate::ser::Error) -> Self {
        Self::Boxed(Box::new(e))
    }
}
impl From<String> for HcdError {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}
impl From<&str> for HcdError {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

///
/// # ErrorHelper
///
/// Helper trait for re-use among the many readers and tree-walkers.
/// Each implementer will generally have some internal state to report upon failure,
/// typically a byte position, which it can inject in the implementation-required `err` method.
///
pub trait ErrorHelper {
    /// Create and return a [HcdError]
    fn err(&self, msg: impl Into<String>) -> HcdError;
    /// Return failure
    fn fail<T>(&self, msg: impl Into<String>) -> HcdResult<T> {
        Err(self.err(msg))
    }
    /// Unwrap the [Option] `opt` if it is [Some], and return our error if not.
    fn unwrap<T>(&self, opt: Option<T>, msg: impl Into<String>) -> HcdResult<T> {
        match opt {
            Some(val) => Ok(val),
            None => self.fail(msg),
        }
    }
    /// Assert a boolean condition. Returns through `self.fail` if it is not satisfied.
    fn assert(&self, b: bool, msg: impl Into<String>) -> HcdResult<()> {
        match b {
            true => Ok(()),
            false => self.fail(msg),
        }
    }
}
