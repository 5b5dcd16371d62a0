//! Tile pyramid grid model.
//!
//! Defines the hierarchical world grid: tile indexing per zoom level,
//! metatiling, pixel buffers and the parent/child arithmetic that overview
//! aggregation is built on. All geometry is computed analytically from
//! `(zoom, row, col)` indices; no lookups, no I/O.
//!
//! # Example
//!
//! ```
//! use tilecascade::grid::{GridKind, TilePyramid};
//!
//! let pyramid = TilePyramid::new(GridKind::Geodetic);
//! let tile = pyramid.tile(1, 0, 0).unwrap();
//!
//! assert_eq!(pyramid.parent(&tile).unwrap().zoom(), 0);
//! assert_eq!(pyramid.children(&tile).len(), 4);
//! ```

mod types;

pub use types::{
    Bounds, GridError, GridKind, Shape, Tile, MAX_METATILING, MAX_ZOOM, MERCATOR_HALF_WORLD,
};

use crate::area::Area;

/// Default edge length of a single grid cell in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// A tile pyramid over one of the supported world grids.
///
/// The pyramid is a cheap value type; clone it freely. It is read-only after
/// construction and safe to share across workers.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TilePyramid {
    grid: GridKind,
    #[serde(default = "default_metatiling")]
    metatiling: u8,
    #[serde(default)]
    pixelbuffer: u16,
    #[serde(default = "default_tile_size")]
    tile_size: u32,
}

fn default_metatiling() -> u8 {
    1
}

fn default_tile_size() -> u32 {
    DEFAULT_TILE_SIZE
}

impl TilePyramid {
    /// Creates a pyramid with metatiling 1, no pixel buffer and the default
    /// tile size.
    pub fn new(grid: GridKind) -> Self {
        Self {
            grid,
            metatiling: 1,
            pixelbuffer: 0,
            tile_size: DEFAULT_TILE_SIZE,
        }
    }

    /// Sets the metatiling factor (power of two, 1-16).
    pub fn with_metatiling(mut self, metatiling: u8) -> Result<Self, GridError> {
        if metatiling == 0 || metatiling > MAX_METATILING || !metatiling.is_power_of_two() {
            return Err(GridError::InvalidMetatiling(metatiling));
        }
        self.metatiling = metatiling;
        Ok(self)
    }

    /// Sets the pixel buffer applied around each processing tile.
    pub fn with_pixelbuffer(mut self, pixelbuffer: u16) -> Self {
        self.pixelbuffer = pixelbuffer;
        self
    }

    /// Sets the edge length of a single grid cell in pixels.
    pub fn with_tile_size(mut self, tile_size: u32) -> Result<Self, GridError> {
        if tile_size == 0 {
            return Err(GridError::InvalidTileSize(tile_size));
        }
        self.tile_size = tile_size;
        Ok(self)
    }

    pub fn grid(&self) -> GridKind {
        self.grid
    }

    pub fn metatiling(&self) -> u8 {
        self.metatiling
    }

    pub fn pixelbuffer(&self) -> u16 {
        self.pixelbuffer
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// World extent of the pyramid in its native coordinates.
    pub fn extent(&self) -> Bounds {
        self.grid.extent()
    }

    /// Nominal aggregation fan-in: every interior tile has four children.
    ///
    /// Near the zoom-0 boundary metatile clamping can reduce the actual
    /// child count to 2 or 1; [`TilePyramid::children`] reports the real set.
    pub fn fan_in(&self) -> usize {
        4
    }

    fn check_zoom(&self, zoom: u8) -> Result<(), GridError> {
        if zoom > MAX_ZOOM {
            Err(GridError::InvalidZoom(zoom))
        } else {
            Ok(())
        }
    }

    /// Number of base grid cells along the x axis at a zoom level.
    pub fn base_columns(&self, zoom: u8) -> u64 {
        self.grid.zoom0_cols() << zoom
    }

    /// Number of base grid cells along the y axis at a zoom level.
    pub fn base_rows(&self, zoom: u8) -> u64 {
        self.grid.zoom0_rows() << zoom
    }

    /// Number of (meta)tile columns at a zoom level.
    pub fn columns(&self, zoom: u8) -> u64 {
        self.base_columns(zoom).div_ceil(self.metatiling as u64)
    }

    /// Number of (meta)tile rows at a zoom level.
    pub fn rows(&self, zoom: u8) -> u64 {
        self.base_rows(zoom).div_ceil(self.metatiling as u64)
    }

    /// Width of one base grid cell in pyramid coordinates.
    pub fn cell_width(&self, zoom: u8) -> f64 {
        self.extent().width() / self.base_columns(zoom) as f64
    }

    /// Height of one base grid cell in pyramid coordinates.
    pub fn cell_height(&self, zoom: u8) -> f64 {
        self.extent().height() / self.base_rows(zoom) as f64
    }

    /// Size of one pixel in pyramid coordinates at a zoom level.
    pub fn pixel_size(&self, zoom: u8) -> f64 {
        self.cell_width(zoom) / self.tile_size as f64
    }

    /// Constructs the tile at `(zoom, row, col)`.
    ///
    /// Bounds and pixel shapes are derived analytically. Metatiles at the
    /// grid edge cover fewer base cells and get a proportionally smaller
    /// shape.
    pub fn tile(&self, zoom: u8, row: u32, col: u32) -> Result<Tile, GridError> {
        self.check_zoom(zoom)?;
        let rows = self.rows(zoom);
        let cols = self.columns(zoom);
        if row as u64 >= rows || col as u64 >= cols {
            return Err(GridError::TileOutOfBounds {
                zoom,
                row,
                col,
                rows,
                cols,
            });
        }

        let meta = self.metatiling as u64;
        let cell_w = self.cell_width(zoom);
        let cell_h = self.cell_height(zoom);
        let extent = self.extent();

        let col_start = col as u64 * meta;
        let row_start = row as u64 * meta;
        let span_cols = meta.min(self.base_columns(zoom) - col_start);
        let span_rows = meta.min(self.base_rows(zoom) - row_start);

        let left = extent.left + col_start as f64 * cell_w;
        let right = extent.left + (col_start + span_cols) as f64 * cell_w;
        let top = extent.top - row_start as f64 * cell_h;
        let bottom = extent.top - (row_start + span_rows) as f64 * cell_h;
        let bounds = Bounds::new(left, bottom, right, top);

        // The pixel buffer may reach past the antimeridian in x but is
        // clamped to the grid extent in y.
        let buffer_units = self.pixelbuffer as f64 * self.pixel_size(zoom);
        let buffered_bounds = Bounds::new(
            left - buffer_units,
            (bottom - buffer_units).max(extent.bottom),
            right + buffer_units,
            (top + buffer_units).min(extent.top),
        );

        let output_shape = Shape::new(
            (span_rows * self.tile_size as u64) as usize,
            (span_cols * self.tile_size as u64) as usize,
        );
        let shape = Shape::new(
            output_shape.height + 2 * self.pixelbuffer as usize,
            output_shape.width + 2 * self.pixelbuffer as usize,
        );

        Ok(Tile {
            zoom,
            row,
            col,
            bounds,
            buffered_bounds,
            shape,
            output_shape,
            pixelbuffer: self.pixelbuffer,
        })
    }

    /// Parent of a tile at the next coarser zoom, `None` at zoom 0.
    pub fn parent(&self, tile: &Tile) -> Option<Tile> {
        if tile.zoom == 0 {
            return None;
        }
        // Always in range: the parent grid is at least half the child grid.
        Some(
            self.tile(tile.zoom - 1, tile.row / 2, tile.col / 2)
                .expect("parent index is always valid"),
        )
    }

    /// Children of a tile at the next finer zoom, in row-major order.
    ///
    /// Yields four tiles for interior tiles; one or two near the zoom-0
    /// boundary where metatile clamping shrinks the child grid. Empty above
    /// [`MAX_ZOOM`].
    pub fn children(&self, tile: &Tile) -> Vec<Tile> {
        let child_zoom = match tile.zoom.checked_add(1) {
            Some(z) if z <= MAX_ZOOM => z,
            _ => return Vec::new(),
        };
        let rows = self.rows(child_zoom);
        let cols = self.columns(child_zoom);
        let row_end = ((tile.row as u64 * 2) + 1).min(rows - 1);
        let col_end = ((tile.col as u64 * 2) + 1).min(cols - 1);

        let mut children = Vec::with_capacity(4);
        for row in (tile.row as u64 * 2)..=row_end {
            for col in (tile.col as u64 * 2)..=col_end {
                children.push(
                    self.tile(child_zoom, row as u32, col as u32)
                        .expect("child index is always valid"),
                );
            }
        }
        children
    }

    /// Number of child rows and columns a tile spans at the next finer zoom.
    pub fn child_span(&self, tile: &Tile) -> (usize, usize) {
        let child_zoom = match tile.zoom.checked_add(1) {
            Some(z) if z <= MAX_ZOOM => z,
            _ => return (0, 0),
        };
        let rows = self.rows(child_zoom);
        let cols = self.columns(child_zoom);
        let span_rows = (rows - tile.row as u64 * 2).min(2) as usize;
        let span_cols = (cols - tile.col as u64 * 2).min(2) as usize;
        (span_rows, span_cols)
    }

    /// Lazily iterates over all tiles at a zoom level intersecting an area.
    ///
    /// The iterator is finite and restartable (create it again to restart).
    pub fn tiles_over<'a>(
        &'a self,
        zoom: u8,
        area: &'a Area,
    ) -> Result<TileIterator<'a>, GridError> {
        self.check_zoom(zoom)?;
        Ok(TileIterator::new(self, zoom, area))
    }

    /// Counts the tiles at a zoom level intersecting an area.
    pub fn count_tiles(&self, zoom: u8, area: &Area) -> Result<usize, GridError> {
        Ok(self.tiles_over(zoom, area)?.count())
    }
}

/// Lazy iterator over the tiles of one zoom level intersecting an area.
///
/// Candidate rows/columns are derived from the area's bounding box; each
/// candidate is then checked against the area itself, so disjoint unions of
/// rectangles do not produce tiles in the gaps between them.
pub struct TileIterator<'a> {
    pyramid: &'a TilePyramid,
    area: &'a Area,
    zoom: u8,
    row: u64,
    col: u64,
    row_end: u64,
    col_start: u64,
    col_end: u64,
    exhausted: bool,
}

impl<'a> TileIterator<'a> {
    fn new(pyramid: &'a TilePyramid, zoom: u8, area: &'a Area) -> Self {
        let clipped = area.clip(&pyramid.extent());
        let bbox = clipped.bbox();

        let (row, row_end, col_start, col_end, exhausted) = match bbox {
            None => (0, 0, 0, 0, true),
            Some(bbox) => {
                let extent = pyramid.extent();
                let tile_w = pyramid.cell_width(zoom) * pyramid.metatiling as f64;
                let tile_h = pyramid.cell_height(zoom) * pyramid.metatiling as f64;
                let max_row = pyramid.rows(zoom) - 1;
                let max_col = pyramid.columns(zoom) - 1;

                let col_start =
                    (((bbox.left - extent.left) / tile_w).floor().max(0.0) as u64).min(max_col);
                let col_end =
                    (((bbox.right - extent.left) / tile_w).floor().max(0.0) as u64).min(max_col);
                let row_start =
                    (((extent.top - bbox.top) / tile_h).floor().max(0.0) as u64).min(max_row);
                let row_end =
                    (((extent.top - bbox.bottom) / tile_h).floor().max(0.0) as u64).min(max_row);

                (row_start, row_end, col_start, col_end, false)
            }
        };

        Self {
            pyramid,
            area,
            zoom,
            row,
            col: col_start,
            row_end,
            col_start,
            col_end,
            exhausted,
        }
    }

    fn advance(&mut self) {
        if self.col == self.col_end {
            self.col = self.col_start;
            if self.row == self.row_end {
                self.exhausted = true;
            } else {
                self.row += 1;
            }
        } else {
            self.col += 1;
        }
    }
}

impl Iterator for TileIterator<'_> {
    type Item = Tile;

    fn next(&mut self) -> Option<Tile> {
        while !self.exhausted {
            let tile = self
                .pyramid
                .tile(self.zoom, self.row as u32, self.col as u32)
                .expect("candidate index is always in range");
            self.advance();
            if self.area.intersects(&tile.bounds()) {
                return Some(tile);
            }
        }
        None
    }
}
