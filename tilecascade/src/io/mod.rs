//! Input/output collaborator interfaces.
//!
//! The engine never touches concrete data formats. It talks to inputs and
//! outputs through the narrow capability traits defined here; actual codecs
//! (rasters, features, object stores) live behind driver implementations
//! registered in the [`DriverRegistry`].
//!
//! Two reference drivers ship with the crate: a fully in-memory pair used by
//! tests and demos, and a tile-directory output that persists raw tile
//! buffers under `zoom/row/col` paths next to a `metadata.json` descriptor.

mod directory;
mod memory;
mod registry;
pub mod retry;

pub use directory::DirectoryOutput;
pub use memory::{MemoryInput, MemoryOutput};
pub use registry::{DriverRegistry, InputFactory, OutputFactory};
pub use retry::with_retry;

use thiserror::Error;

use crate::grid::{Bounds, Shape, Tile};
use crate::raster::{RasterError, TileData};
use crate::task::PreprocessingTask;

/// Errors raised by input and output collaborators.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Underlying I/O failed; considered transient and retried.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The source cannot currently serve the request; transient.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be decoded; permanent.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Pixel buffer bookkeeping failed; permanent.
    #[error(transparent)]
    Raster(#[from] RasterError),

    /// Any other permanent driver failure.
    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// Returns true if the error is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Io(_) | SourceError::Unavailable(_))
    }
}

/// A declared input data source.
///
/// One instance exists per declared input for the whole batch; it must be
/// shareable across workers (`Send + Sync`). Per-tile state lives in the
/// scoped [`InputTile`] handles returned by [`InputSource::open`].
pub trait InputSource: Send + Sync {
    /// Identifier used in configuration and error messages.
    fn name(&self) -> &str;

    /// Bounding box of the available data in pyramid coordinates.
    ///
    /// `None` means unknown coverage; the resolver then assumes the whole
    /// pyramid extent.
    fn coverage(&self) -> Option<Bounds>;

    /// Opens a scoped read handle for one tile.
    fn open(&self, tile: &Tile) -> Result<Box<dyn InputTile>, SourceError>;

    /// Heavy precomputation to run once before any tile task starts.
    ///
    /// Results are memoized process-wide and retrievable by key from every
    /// tile task.
    fn preprocessing_tasks(&self) -> Vec<PreprocessingTask> {
        Vec::new()
    }

    /// Called exactly once when the batch ends, on every exit path.
    fn cleanup(&self) {}
}

/// Scoped per-tile read handle.
pub trait InputTile: Send {
    /// Bounding box of the data readable through this handle.
    fn bbox(&self) -> Bounds;

    /// Reads the data for the tile.
    ///
    /// `Ok(None)` is the empty signal: the source holds no data here. It is
    /// not an error and never aborts the batch.
    fn read(&self) -> Result<Option<TileData>, SourceError>;
}

/// The output collaborator tiles are written to.
pub trait OutputStore: Send + Sync {
    /// Returns true if output for the tile already exists.
    ///
    /// Drives the skip-if-exists policy and restart safety.
    fn tiles_exist(&self, tile: &Tile) -> Result<bool, SourceError>;

    /// Reads previously written output, `Ok(None)` if absent.
    ///
    /// Overview aggregation uses this to consume children regardless of
    /// whether they were written by this run or an earlier one.
    fn read(&self, tile: &Tile) -> Result<Option<TileData>, SourceError>;

    /// Persists output for a tile.
    fn write(&self, tile: &Tile, data: &TileData) -> Result<(), SourceError>;

    /// Pre-write sanity check.
    fn output_valid(&self, data: &TileData) -> bool {
        !data.shape().is_empty()
    }

    /// Extracts the portion of `data` (belonging to `tile`) covered by
    /// `subtile`, used when output tiling differs from process tiling.
    ///
    /// The default implementation slices by pixel window; drivers with
    /// richer data models may override.
    fn extract_subset(
        &self,
        data: &TileData,
        tile: &Tile,
        subtile: &Tile,
    ) -> Result<TileData, SourceError> {
        let bounds = tile.bounds();
        let sub = subtile.bounds();
        let shape = data.shape();

        let px_x = bounds.width() / shape.width as f64;
        let px_y = bounds.height() / shape.height as f64;
        let col = ((sub.left - bounds.left) / px_x).round().max(0.0) as usize;
        let row = ((bounds.top - sub.top) / px_y).round().max(0.0) as usize;
        let width = (sub.width() / px_x).round() as usize;
        let height = (sub.height() / px_y).round() as usize;

        Ok(data.window(row, col, Shape::new(height, width))?)
    }

    /// Releases held handles; called exactly once when the batch ends,
    /// guaranteed even on abort.
    fn close(&self) {}
}
