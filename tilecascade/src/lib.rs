//! Tilecascade - tile pyramid batch processing.
//!
//! Subdivides the world into a hierarchical grid of tiles and runs a
//! user-supplied computation independently per tile at multiple zoom
//! levels, cascading finished fine-grained tiles upward into coarser
//! overview tiles.
//!
//! The crate is the scheduling and aggregation core only: concrete data
//! formats, geometry libraries and the numerical content of the user
//! computation are external collaborators reached through the traits in
//! [`io`] and [`process`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tilecascade::batch::BatchScheduler;
//! use tilecascade::config::{BatchConfig, ZoomLevels};
//! use tilecascade::grid::{GridKind, TilePyramid};
//! use tilecascade::io::MemoryOutput;
//! use tilecascade::process::{ProcessContext, ProcessError, ProcessOutput, TileProcessor};
//! use tilecascade::raster::TileData;
//!
//! struct Constant;
//!
//! impl TileProcessor for Constant {
//!     fn name(&self) -> &str {
//!         "constant"
//!     }
//!
//!     fn execute(&self, ctx: &ProcessContext<'_>) -> Result<ProcessOutput, ProcessError> {
//!         Ok(ProcessOutput::Data(TileData::filled(
//!             ctx.tile().output_shape(),
//!             1.0,
//!             -1.0,
//!         )))
//!     }
//! }
//!
//! let config = BatchConfig::builder(
//!     TilePyramid::new(GridKind::Geodetic),
//!     ZoomLevels::new(0, 1).unwrap(),
//! )
//! .sequential()
//! .build()
//! .unwrap();
//!
//! let output = Arc::new(MemoryOutput::new());
//! let mut scheduler =
//!     BatchScheduler::new(config, vec![], output.clone(), Arc::new(Constant)).unwrap();
//! let summary = scheduler.run().unwrap();
//! assert_eq!(summary.written, 10);
//! ```

pub mod area;
pub mod batch;
pub mod config;
pub mod executor;
pub mod grid;
pub mod io;
pub mod mosaic;
pub mod process;
pub mod raster;
pub mod task;
pub mod telemetry;

pub use batch::{BatchError, BatchScheduler, BatchState, BatchSummary};
pub use config::{BatchConfig, Concurrency, OverviewOptions, ProcessMode, RetrySettings, ZoomLevels};
pub use grid::{Bounds, GridKind, Tile, TilePyramid};
pub use process::{ProcessContext, ProcessError, ProcessOutput, TileProcessor};
pub use raster::{ResamplingMethod, TileData};
pub use task::{TaskErrorKind, TaskOutcome, TaskResult};
