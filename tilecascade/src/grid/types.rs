//! Core types for the tile pyramid grid.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;

/// Maximum supported zoom level.
///
/// Tile indices stay well inside `u32` at this depth for both grid kinds.
pub const MAX_ZOOM: u8 = 30;

/// Maximum supported metatiling factor.
pub const MAX_METATILING: u8 = 16;

/// Half circumference of the web mercator world in meters.
pub const MERCATOR_HALF_WORLD: f64 = 20_037_508.342_789_244;

/// Errors raised by grid arithmetic.
#[derive(Debug, Error)]
pub enum GridError {
    /// Zoom level exceeds [`MAX_ZOOM`].
    #[error("invalid zoom level: {0} (max: {max})", max = MAX_ZOOM)]
    InvalidZoom(u8),

    /// Tile index lies outside the grid at its zoom level.
    #[error("tile {zoom}/{row}/{col} out of bounds ({rows}x{cols} grid)")]
    TileOutOfBounds {
        zoom: u8,
        row: u32,
        col: u32,
        rows: u64,
        cols: u64,
    },

    /// Metatiling factor is not a power of two within 1..=16.
    #[error("invalid metatiling factor: {0} (must be a power of two, 1-{max})", max = MAX_METATILING)]
    InvalidMetatiling(u8),

    /// Tile size must be non-zero.
    #[error("invalid tile size: {0}")]
    InvalidTileSize(u32),
}

/// Axis-aligned rectangle in pyramid coordinates.
///
/// `left`/`right` are x coordinates, `bottom`/`top` are y coordinates. A
/// bounds value is degenerate (empty) when it has no positive extent on
/// either axis.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

impl Bounds {
    /// Creates new bounds from the four edge coordinates.
    pub fn new(left: f64, bottom: f64, right: f64, top: f64) -> Self {
        Self {
            left,
            bottom,
            right,
            top,
        }
    }

    /// Horizontal extent.
    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    /// Vertical extent.
    pub fn height(&self) -> f64 {
        self.top - self.bottom
    }

    /// Returns true if the bounds cover no area.
    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.top <= self.bottom
    }

    /// Returns true if the two rectangles share any interior area.
    ///
    /// Touching edges do not count as an intersection; this keeps tile
    /// iteration from picking up tiles that merely border an area.
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.left < other.right
            && other.left < self.right
            && self.bottom < other.top
            && other.bottom < self.top
    }

    /// Intersection of two rectangles, or `None` if they do not overlap.
    pub fn intersection(&self, other: &Bounds) -> Option<Bounds> {
        let out = Bounds::new(
            self.left.max(other.left),
            self.bottom.max(other.bottom),
            self.right.min(other.right),
            self.top.min(other.top),
        );
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Returns true if a point lies inside (or on the edge of) the bounds.
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.left && x <= self.right && y >= self.bottom && y <= self.top
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.left, self.bottom, self.right, self.top
        )
    }
}

/// Pixel shape of a tile buffer as (height, width).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub height: usize,
    pub width: usize,
}

impl Shape {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    /// Number of pixels covered by this shape.
    pub fn len(&self) -> usize {
        self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// The two supported world grids.
///
/// Both wrap cylindrically in x (the antimeridian), neither wraps in y.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridKind {
    /// Plate carrée lat/lon grid: 2x1 tiles at zoom 0 over (-180,-90,180,90).
    Geodetic,
    /// Square web-mercator-like grid: 1x1 tiles at zoom 0.
    Mercator,
}

impl GridKind {
    /// World extent of the grid in pyramid coordinates.
    pub fn extent(&self) -> Bounds {
        match self {
            GridKind::Geodetic => Bounds::new(-180.0, -90.0, 180.0, 90.0),
            GridKind::Mercator => Bounds::new(
                -MERCATOR_HALF_WORLD,
                -MERCATOR_HALF_WORLD,
                MERCATOR_HALF_WORLD,
                MERCATOR_HALF_WORLD,
            ),
        }
    }

    /// Number of tile columns at zoom 0.
    pub fn zoom0_cols(&self) -> u64 {
        match self {
            GridKind::Geodetic => 2,
            GridKind::Mercator => 1,
        }
    }

    /// Number of tile rows at zoom 0.
    pub fn zoom0_rows(&self) -> u64 {
        1
    }
}

impl fmt::Display for GridKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridKind::Geodetic => write!(f, "geodetic"),
            GridKind::Mercator => write!(f, "mercator"),
        }
    }
}

impl std::str::FromStr for GridKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "geodetic" => Ok(GridKind::Geodetic),
            "mercator" => Ok(GridKind::Mercator),
            other => Err(format!("unknown grid kind: {other}")),
        }
    }
}

/// One tile of the pyramid.
///
/// Identified by its `(zoom, row, col)` triple; bounding boxes and pixel
/// shapes are computed analytically at construction time and carried along
/// as plain values. Equality and hashing consider the identity triple only.
///
/// Tiles are immutable value objects. They are only constructed by
/// [`TilePyramid::tile`](super::TilePyramid::tile) and its derivatives so
/// their geometry is always consistent with the owning pyramid.
#[derive(Clone, Debug)]
pub struct Tile {
    pub(super) zoom: u8,
    pub(super) row: u32,
    pub(super) col: u32,
    pub(super) bounds: Bounds,
    pub(super) buffered_bounds: Bounds,
    pub(super) shape: Shape,
    pub(super) output_shape: Shape,
    pub(super) pixelbuffer: u16,
}

impl Tile {
    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    pub fn row(&self) -> u32 {
        self.row
    }

    pub fn col(&self) -> u32 {
        self.col
    }

    /// Identity triple `(zoom, row, col)`.
    pub fn id(&self) -> (u8, u32, u32) {
        (self.zoom, self.row, self.col)
    }

    /// Bounding box without the pixel buffer applied.
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Bounding box grown by the pixel buffer.
    ///
    /// May extend past the antimeridian horizontally; clamped vertically to
    /// the grid extent.
    pub fn buffered_bounds(&self) -> Bounds {
        self.buffered_bounds
    }

    /// Pixel shape of the processing buffer (pixel buffer included).
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Pixel shape of the written output (pixel buffer stripped).
    pub fn output_shape(&self) -> Shape {
        self.output_shape
    }

    /// Pixel buffer applied on each edge of the processing buffer.
    pub fn pixelbuffer(&self) -> u16 {
        self.pixelbuffer
    }
}

impl PartialEq for Tile {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Tile {}

impl Hash for Tile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.row, self.col)
    }
}
