//! Mosaic assembly and overview aggregation.
//!
//! Child tiles are condensed into their parent by placing each child's
//! pixels into a mosaic buffer and resampling the whole buffer down to the
//! parent's shape.
//!
//! Placement is strictly index-based: a child is matched to its slot using
//! tile-column adjacency under modular arithmetic (column index modulo the
//! zoom's column count). Comparing raw bounding-box coordinates would
//! silently break for tiles straddling the antimeridian, where the
//! rightmost and leftmost columns of the grid are geographically adjacent;
//! modular column arithmetic is correct everywhere, including there.

use std::collections::HashMap;

use thiserror::Error;

use tracing::trace;

use crate::grid::{Bounds, Shape, Tile, TilePyramid};
use crate::raster::{RasterError, ResamplingMethod, TileData};

/// Errors raised while assembling mosaics.
#[derive(Debug, Error)]
pub enum MosaicError {
    #[error("no tiles to mosaic")]
    Empty,

    #[error("mixed zoom levels in mosaic input")]
    MixedZooms,

    #[error("tile {zoom}/{row}/{col} is not a child of the requested parent")]
    NotAChild { zoom: u8, row: u32, col: u32 },

    #[error("tile {zoom}/{row}/{col} carries shape {got}, expected {expected}")]
    UnexpectedShape {
        zoom: u8,
        row: u32,
        col: u32,
        expected: Shape,
        got: Shape,
    },

    #[error(transparent)]
    Raster(#[from] RasterError),
}

/// A contiguous pixel buffer assembled from same-zoom tiles.
#[derive(Debug)]
pub struct Mosaic {
    /// The assembled pixels; slots without a contributing tile are nodata.
    pub data: TileData,
    /// Bounds of the buffer in pyramid coordinates.
    ///
    /// For mosaics crossing the antimeridian the right edge extends past
    /// the grid extent; coordinates stay continuous across the wrap.
    pub bounds: Bounds,
    /// `(row, col)` of the tile occupying the top-left slot.
    pub anchor: (u32, u32),
}

/// Assembles same-zoom, same-shape tiles into one continuous buffer.
///
/// The anchor column is chosen by finding the largest circular gap in the
/// occupied columns, so a set of tiles hugging the antimeridian (e.g.
/// columns `W-1` and `0`) comes out as one two-tile-wide buffer rather
/// than a world-wide one.
pub fn create_mosaic(pyramid: &TilePyramid, tiles: &[(Tile, TileData)]) -> Result<Mosaic, MosaicError> {
    let (first_tile, first_data) = tiles.first().ok_or(MosaicError::Empty)?;
    let zoom = first_tile.zoom();
    let tile_shape = first_data.shape();

    for (tile, data) in tiles {
        if tile.zoom() != zoom {
            return Err(MosaicError::MixedZooms);
        }
        if data.shape() != tile.output_shape() || data.shape() != tile_shape {
            return Err(MosaicError::UnexpectedShape {
                zoom: tile.zoom(),
                row: tile.row(),
                col: tile.col(),
                expected: tile.output_shape(),
                got: data.shape(),
            });
        }
    }

    let columns = pyramid.columns(zoom);
    let anchor_col = anchor_column(tiles.iter().map(|(t, _)| t.col() as u64), columns);

    let row_min = tiles.iter().map(|(t, _)| t.row()).min().expect("non-empty");
    let row_max = tiles.iter().map(|(t, _)| t.row()).max().expect("non-empty");
    let span_rows = (row_max - row_min) as usize + 1;
    let span_cols = tiles
        .iter()
        .map(|(t, _)| col_offset(t.col() as u64, anchor_col, columns))
        .max()
        .expect("non-empty")
        + 1;

    let mut data = TileData::nodata_filled(
        Shape::new(span_rows * tile_shape.height, span_cols * tile_shape.width),
        first_data.nodata(),
    );
    for (tile, tile_data) in tiles {
        let row_off = (tile.row() - row_min) as usize;
        let col_off = col_offset(tile.col() as u64, anchor_col, columns);
        data.blit(
            tile_data,
            row_off * tile_shape.height,
            col_off * tile_shape.width,
        )?;
    }

    let anchor_tile = pyramid
        .tile(zoom, row_min, anchor_col as u32)
        .expect("anchor index is in range");
    let anchor_bounds = anchor_tile.bounds();
    let bounds = Bounds::new(
        anchor_bounds.left,
        anchor_bounds.top - span_rows as f64 * anchor_bounds.height(),
        anchor_bounds.left + span_cols as f64 * anchor_bounds.width(),
        anchor_bounds.top,
    );

    Ok(Mosaic {
        data,
        bounds,
        anchor: (row_min, anchor_col as u32),
    })
}

/// Aggregates child tile data into one parent tile.
///
/// Children missing from `children` (or carrying `None`) contribute nodata;
/// that is the normal fate of empty tiles, not an error. Returns `Ok(None)`
/// when every child is empty, in which case the parent must not be written
/// and is itself skipped by further upward aggregation.
pub fn aggregate(
    pyramid: &TilePyramid,
    parent: &Tile,
    children: &[(Tile, Option<TileData>)],
    method: ResamplingMethod,
) -> Result<Option<TileData>, MosaicError> {
    let canonical = pyramid.children(parent);
    if canonical.is_empty() {
        return Ok(None);
    }

    let child_zoom = canonical[0].zoom();
    let columns = pyramid.columns(child_zoom);
    let base_row = canonical[0].row() as u64;
    let base_col = canonical[0].col() as u64 % columns;
    let (span_rows, span_cols) = pyramid.child_span(parent);

    // Match provided children to window slots by modular column adjacency.
    let mut slots: HashMap<(usize, usize), &TileData> = HashMap::new();
    for (tile, data) in children {
        let Some(data) = data else { continue };
        if tile.zoom() != child_zoom {
            return Err(MosaicError::MixedZooms);
        }
        let not_a_child = MosaicError::NotAChild {
            zoom: tile.zoom(),
            row: tile.row(),
            col: tile.col(),
        };
        if (tile.row() as u64) < base_row {
            return Err(not_a_child);
        }
        let row_off = (tile.row() as u64 - base_row) as usize;
        let col_off = col_offset(tile.col() as u64, base_col, columns);
        if row_off >= span_rows || col_off >= span_cols {
            return Err(not_a_child);
        }
        let expected = canonical[row_off * span_cols + col_off].output_shape();
        if data.shape() != expected {
            return Err(MosaicError::UnexpectedShape {
                zoom: tile.zoom(),
                row: tile.row(),
                col: tile.col(),
                expected,
                got: data.shape(),
            });
        }
        slots.insert((row_off, col_off), data);
    }

    if slots.is_empty() {
        trace!(parent = %parent, "all children empty");
        return Ok(None);
    }

    // Window geometry follows the canonical children, so clamped edge
    // metatiles keep their true sizes.
    let col_widths: Vec<usize> = (0..span_cols)
        .map(|j| canonical[j].output_shape().width)
        .collect();
    let row_heights: Vec<usize> = (0..span_rows)
        .map(|i| canonical[i * span_cols].output_shape().height)
        .collect();
    let mosaic_shape = Shape::new(row_heights.iter().sum(), col_widths.iter().sum());

    let nodata = slots.values().next().expect("non-empty").nodata();
    let mut mosaic = TileData::nodata_filled(mosaic_shape, nodata);
    for ((row_off, col_off), data) in &slots {
        let y: usize = row_heights[..*row_off].iter().sum();
        let x: usize = col_widths[..*col_off].iter().sum();
        mosaic.blit(data, y, x)?;
    }

    Ok(Some(mosaic.resampled(parent.output_shape(), method)))
}

/// Offset of `col` from `anchor` under modular column arithmetic.
fn col_offset(col: u64, anchor: u64, columns: u64) -> usize {
    ((col + columns - anchor) % columns) as usize
}

/// Picks the column after the largest circular gap between occupied
/// columns, so the mosaic window is as narrow as possible.
fn anchor_column(cols: impl Iterator<Item = u64>, columns: u64) -> u64 {
    let mut unique: Vec<u64> = cols.collect();
    unique.sort_unstable();
    unique.dedup();

    if unique.len() as u64 >= columns {
        return 0;
    }

    let mut anchor = unique[0];
    let mut largest_gap = 0;
    for i in 0..unique.len() {
        let current = unique[i];
        let next = unique[(i + 1) % unique.len()];
        let gap = (next + columns - current) % columns;
        let gap = if gap == 0 { columns } else { gap };
        if gap > largest_gap {
            largest_gap = gap;
            anchor = next;
        }
    }
    anchor
}
