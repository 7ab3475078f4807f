//!
//! # External Geometry Handles
//!
//! A digest stores only hierarchy. Cell geometry lives elsewhere,
//! and is fetched through a [Geometry] handle when output requires it.
//!

// Std-Lib
use std::collections::HashMap;

// Local imports
use crate::error::HcdResult;

///
/// # Geometry Trait
///
/// Source of each cell's non-reference elements, as raw GDSII element records
/// (each element from its opening record through its `ENDEL`).
///
pub trait Geometry: Send {
    /// Get the geometry of cell `name`, or `None` if we know nothing of it
    fn cell_geometry(&mut self, name: &str) -> HcdResult<Option<Vec<u8>>>;
}

///
/// # In-Memory Geometry
///
/// Attached automatically to digests read from files with embedded geometry.
///
#[derive(Debug, Default, Clone)]
pub struct MemGeometry {
    cells: HashMap<String, Vec<u8>>,
}
impl MemGeometry {
    pub fn new() -> Self {
        Self::default()
    }
    /// Set the geometry of cell `name`
    pub fn insert(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.cells.insert(name.into(), bytes);
    }
    /// Get the geometry of cell `name`
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.cells.get(name).map(|v| v.as_slice())
    }
    pub fn len(&self) -> usize {
        self.cells.len()
    }
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
impl Geometry for MemGeometry {
    fn cell_geometry(&mut self, name: &str) -> HcdResult<Option<Vec<u8>>> {
        Ok(self.cells.get(name).cloned())
    }
}
