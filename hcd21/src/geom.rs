//!
//! # Geometric Primitives
//!
//! Points, bounding boxes, placement orientations and transforms.
//! Digests store no shapes; these are enough to place child-cell boxes and to flatten element coordinates.
//!

// Crates.io
use serde::{Deserialize, Serialize};

/// Integer coordinate type, matching GDSII's 32-bit database units
pub type Int = i32;

/// # Point in two-dimensional layout-space
#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: Int,
    pub y: Int,
}
impl Point {
    /// Create a new [Point] from (x,y) coordinates
    pub fn new(x: Int, y: Int) -> Self {
        Self { x, y }
    }
    /// Create a new [Point], offset from ours by `other`. Saturates at the coordinate limits.
    pub fn shift(&self, other: &Point) -> Point {
        Point::new(self.x.saturating_add(other.x), self.y.saturating_add(other.y))
    }
    /// Scale by integer `k`. Saturates at the coordinate limits.
    pub fn scale(&self, k: Int) -> Point {
        Point::new(self.x.saturating_mul(k), self.y.saturating_mul(k))
    }
    /// Apply matrix-vector [Transform] `trans`, rounding to the nearest integer
    pub fn transform(&self, trans: &Transform) -> Point {
        let (x, y) = trans.apply(self.x as f64, self.y as f64);
        Point::new(to_int(x), to_int(y))
    }
}
/// Round and saturate a real coordinate
fn to_int(v: f64) -> Int {
    v.round().clamp(Int::MIN as f64, Int::MAX as f64) as Int
}

/// # Rectangular Bounding Box
///
/// Points `p0` and `p1` represent opposite corners of a bounding rectangle.
/// `p0` is always closest to negative-infinity, in both x and y,
/// and `p1` is always closest to positive-infinity.
///
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct BoundBox {
    pub p0: Point,
    pub p1: Point,
}
impl Default for BoundBox {
    fn default() -> Self {
        Self::empty()
    }
}
impl BoundBox {
    /// Create a new [BoundBox] from two points
    pub fn from_points(p0: Point, p1: Point) -> Self {
        Self {
            p0: Point::new(p0.x.min(p1.x), p0.y.min(p1.y)),
            p1: Point::new(p0.x.max(p1.x), p0.y.max(p1.y)),
        }
    }
    /// Create a new [BoundBox] from a single [Point]
    pub fn from_point(pt: Point) -> Self {
        Self { p0: pt, p1: pt }
    }
    /// Create an empty, otherwise invalid [BoundBox]
    pub fn empty() -> Self {
        Self {
            p0: Point::new(Int::MAX, Int::MAX),
            p1: Point::new(Int::MIN, Int::MIN),
        }
    }
    /// Boolean indication of whether a box is empty
    pub fn is_empty(&self) -> bool {
        self.p0.x > self.p1.x || self.p0.y > self.p1.y
    }
    /// Boolean indication of whether [Point] `pt` lies inside out box.
    pub fn contains(&self, pt: &Point) -> bool {
        self.p0.x <= pt.x && self.p1.x >= pt.x && self.p0.y <= pt.y && self.p1.y >= pt.y
    }
    /// Expand an existing (non-empty) [BoundBox] in all directions by `delta`
    pub fn expand(&mut self, delta: Int) {
        if self.is_empty() {
            return;
        }
        self.p0.x = self.p0.x.saturating_sub(delta);
        self.p0.y = self.p0.y.saturating_sub(delta);
        self.p1.x = self.p1.x.saturating_add(delta);
        self.p1.y = self.p1.y.saturating_add(delta);
    }
    /// Get the box's size as an (x,y) tuple
    pub fn size(&self) -> (i64, i64) {
        if self.is_empty() {
            return (0, 0);
        }
        (
            self.p1.x as i64 - self.p0.x as i64,
            self.p1.y as i64 - self.p0.y as i64,
        )
    }
    /// Transform all four corners by `trans`, returning the box around them
    pub fn transform(&self, trans: &Transform) -> BoundBox {
        if self.is_empty() {
            return *self;
        }
        let corners = [
            self.p0,
            self.p1,
            Point::new(self.p0.x, self.p1.y),
            Point::new(self.p1.x, self.p0.y),
        ];
        corners
            .iter()
            .fold(BoundBox::empty(), |bb, pt| pt.transform(trans).union(&bb))
    }
    /// Translate by `delta`
    pub fn translate(&self, delta: &Point) -> BoundBox {
        if self.is_empty() {
            return *self;
        }
        BoundBox {
            p0: self.p0.shift(delta),
            p1: self.p1.shift(delta),
        }
    }
}

///
/// # Bounding Box Trait
///
pub trait BoundBoxTrait {
    /// Compute the union with rectangular bounding box `bbox`.
    /// Creates and returns a new [BoundBox].
    fn union(&self, bbox: &BoundBox) -> BoundBox;
    /// Compute a rectangular bounding box around the implementing type.
    fn bbox(&self) -> BoundBox;
}
impl BoundBoxTrait for BoundBox {
    fn union(&self, bbox: &BoundBox) -> BoundBox {
        if self.is_empty() {
            return *bbox;
        }
        if bbox.is_empty() {
            return *self;
        }
        BoundBox {
            p0: Point::new(self.p0.x.min(bbox.p0.x), self.p0.y.min(bbox.p0.y)),
            p1: Point::new(self.p1.x.max(bbox.p1.x), self.p1.y.max(bbox.p1.y)),
        }
    }
    fn bbox(&self) -> BoundBox {
        *self
    }
}
impl BoundBoxTrait for Point {
    fn union(&self, bbox: &BoundBox) -> BoundBox {
        BoundBox::from_point(*self).union(bbox)
    }
    fn bbox(&self) -> BoundBox {
        BoundBox::from_point(*self)
    }
}
impl BoundBoxTrait for [Point] {
    fn union(&self, bbox: &BoundBox) -> BoundBox {
        self.bbox().union(bbox)
    }
    fn bbox(&self) -> BoundBox {
        self.iter().fold(BoundBox::empty(), |bb, pt| pt.union(&bb))
    }
}

///
/// # Orientation Code
///
/// Reflection about the x-axis (applied first) in bit 3,
/// then counter-clockwise rotation in multiples of 45 degrees in bits 0-2.
/// Always less than 16, so it fits the low bits of an attribute ticket.
///
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Orient(u8);
impl Orient {
    /// The identity orientation
    pub const R0: Orient = Orient(0);
    /// Create from reflection and a number of 45-degree rotation steps
    pub fn new(reflect: bool, rot45: u8) -> Self {
        Self(((reflect as u8) << 3) | (rot45 & 0x07))
    }
    /// Create from the low four bits of `code`
    pub fn from_code(code: u32) -> Self {
        Self((code & 0x0F) as u8)
    }
    /// Create from reflection and an angle in degrees.
    /// Returns the nearest orientation and whether it represents `angle` exactly.
    pub fn from_angle(reflect: bool, angle: f64) -> (Self, bool) {
        let steps = angle / 45.0;
        let nearest = steps.round();
        let exact = (steps - nearest).abs() < 1e-9;
        let rot45 = (nearest as i64).rem_euclid(8) as u8;
        (Self::new(reflect, rot45), exact)
    }
    /// Get our four-bit code
    pub fn code(&self) -> u32 {
        self.0 as u32
    }
    /// Boolean indication of reflection
    pub fn reflected(&self) -> bool {
        self.0 & 0x08 != 0
    }
    /// Number of 45-degree rotation steps
    pub fn rot45(&self) -> u8 {
        self.0 & 0x07
    }
    /// Rotation angle in degrees
    pub fn angle(&self) -> f64 {
        45.0 * self.rot45() as f64
    }
}

///
/// # Transformation Matrix
///
/// 2x2 rotation-matrix and two-entry translation vector,
/// used for relative movement of [Point]s and [BoundBox]es.
///
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Transform {
    /// Rotation / Transformation Matrix
    /// Represented in row-major order
    pub a: [[f64; 2]; 2],
    /// X-Y Translation
    pub b: [f64; 2],
}
impl Transform {
    /// The identity transform, leaving any transformed object unmodified
    pub fn identity() -> Self {
        Self {
            a: [[1., 0.], [0., 1.]],
            b: [0., 0.],
        }
    }
    /// Translation by (x,y)
    pub fn translate(x: f64, y: f64) -> Self {
        Self {
            a: [[1., 0.], [0., 1.]],
            b: [x, y],
        }
    }
    /// Create a transform from placement fields: location, reflection, rotation angle in degrees, and magnification.
    /// Reflection is applied first, then magnification and rotation, then translation.
    pub fn from_placement(loc: &Point, reflect_vert: bool, angle: f64, mag: f64) -> Self {
        let b = [loc.x as f64, loc.y as f64];
        let (sin, cos) = exact_sincos(angle);
        let (sin, cos) = (sin * mag, cos * mag);
        let refl = if reflect_vert { -1. } else { 1. };
        let a = [[cos, -sin * refl], [sin, cos * refl]];
        Self { a, b }
    }
    /// Create a new [Transform] that is the cascade of `parent` and `child`.
    /// Note this operation *is not* commutative.
    pub fn cascade(parent: &Transform, child: &Transform) -> Transform {
        // The result-transform's origin is the parent's origin,
        // plus the parent-transformed child's origin
        let mut b = matvec(&parent.a, &child.b);
        b[0] += parent.b[0];
        b[1] += parent.b[1];
        // And the cascade-matrix is the product of the parent's and child's
        let a = matmul(&parent.a, &child.a);
        Self { a, b }
    }
    /// Apply to real coordinates (x, y)
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let v = matvec(&self.a, &[x, y]);
        (v[0] + self.b[0], v[1] + self.b[1])
    }
    /// Overall scaling factor, i.e. the magnification
    pub fn scale(&self) -> f64 {
        (self.a[0][0] * self.a[1][1] - self.a[0][1] * self.a[1][0])
            .abs()
            .sqrt()
    }
}
/// Sine and cosine of `angle` degrees, exact at multiples of 90
fn exact_sincos(angle: f64) -> (f64, f64) {
    let quarter = angle / 90.0;
    if (quarter - quarter.round()).abs() < 1e-12 {
        return match (quarter.round() as i64).rem_euclid(4) {
            0 => (0., 1.),
            1 => (1., 0.),
            2 => (0., -1.),
            _ => (-1., 0.),
        };
    }
    let rad = angle.to_radians();
    (rad.sin(), rad.cos())
}
/// Multiply 2x2 matrices, returning a new 2x2 matrix
fn matmul(a: &[[f64; 2]; 2], b: &[[f64; 2]; 2]) -> [[f64; 2]; 2] {
    [
        [
            a[0][0] * b[0][0] + a[0][1] * b[1][0],
            a[0][0] * b[0][1] + a[0][1] * b[1][1],
        ],
        [
            a[1][0] * b[0][0] + a[1][1] * b[1][0],
            a[1][0] * b[0][1] + a[1][1] * b[1][1],
        ],
    ]
}
/// Multiply a 2x2 matrix by a 2-entry vector, returning a new 2-entry vector
fn matvec(a: &[[f64; 2]; 2], b: &[f64; 2]) -> [f64; 2] {
    [
        a[0][0] * b[0] + a[0][1] * b[1],
        a[1][0] * b[0] + a[1][1] * b[1],
    ]
}
