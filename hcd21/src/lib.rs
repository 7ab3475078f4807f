//!
//! # Hcd21 Hierarchical Cell Digests
//!
//! Integrated circuit layouts commonly comprise millions of placements of thousands of cells.
//! Hcd21 stores the *hierarchy* of such a layout, i.e. which cells place which others, where, and how,
//! compactly enough that tools can query, stream, and re-write it without ever expanding the whole layout in memory.
//! Cell geometry itself stays in the source archive (or an attached [Geometry] handle),
//! located by byte offset and re-read only on demand.
//!
//! Hcd21 is organized in layers:
//!
//! * Ticket arenas ([arena]) hold millions of small records, addressed by integer handles rather than pointers.
//!   A byte store ([zbytes]) built atop them DEFLATE-compresses larger blocks.
//! * Per-cell descriptors ([symtab]) and deduplicated placement attributes ([attrs]).
//! * Instance lists ([cref]), stored either as fixed records or as delta- and table-compressed segments.
//! * The [Digest] itself, built by scanning a GDSII archive ([DigestBuilder]),
//!   and saved to and loaded from its binary file format ([file]).
//! * Random access into gzip-compressed archives ([zio], [zindex]),
//!   through checkpoints shared between digests of identical archives via an [IndexRegistry].
//!
//! ## Usage
//!
//! Building a digest from an archive, and saving it:
//!
//! ```skip
//! let mut digest = Digest::from_archive("chip.gds.gz", HcdConfig::default(), None)?;
//! digest.write("chip.hcd")?;
//! ```
//!
//! Building a digest cell by cell:
//!
//! ```
//! use hcd21::{DigestBuilder, HcdConfig, Mode};
//! use hcd21::attrs::Attrs;
//! use hcd21::geom::Point;
//!
//! let mut b = DigestBuilder::new(HcdConfig::default()).unwrap();
//! b.begin_cell("leaf").unwrap();
//! b.end_cell().unwrap();
//! b.begin_cell("top").unwrap();
//! b.add_instance("leaf", &Attrs::default(), Point::new(10, 10), false).unwrap();
//! b.end_cell().unwrap();
//! let digest = b.finish().unwrap();
//!
//! let top = digest.top_cell(Mode::Physical).unwrap();
//! assert_eq!(digest.cell_name(Mode::Physical, top).unwrap(), "top");
//! ```
//!

pub mod arena;
pub mod attrs;
pub mod bio;
pub mod build;
pub mod config;
pub mod cref;
pub mod digest;
pub mod error;
pub mod file;
pub mod gds;
pub mod geom;
pub mod geometry;
pub mod inflate;
pub mod order;
pub mod ser;
pub mod symtab;
pub mod zbytes;
pub mod zindex;
pub mod zio;

pub use build::{BuildStatus, DigestBuilder};
pub use config::{AliasConfig, CaseFold, HcdConfig, HcdConfigBuilder};
pub use digest::{Digest, DigestInfo, DigestStats, GdsOutput, SourceKind, StreamFormat};
pub use error::{HcdError, HcdResult, ZError};
pub use file::CURRENT_VERSION;
pub use geometry::{Geometry, MemGeometry};
pub use symtab::Mode;
pub use zindex::{IndexRegistry, ZIndex};
pub use zio::Archive;

#[cfg(test)]
mod tests;
