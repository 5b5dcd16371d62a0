//! End-to-end batch pipeline tests.
//!
//! Drives whole batches through the public API against the in-memory
//! reference drivers: incremental restarts, retry bounds, abort semantics,
//! preprocessing memoization and overview cascades.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tilecascade::batch::{BatchError, BatchScheduler, BatchState};
use tilecascade::config::{BatchConfig, OverviewOptions, RetrySettings, ZoomLevels};
use tilecascade::grid::{Bounds, GridKind, Tile, TilePyramid};
use tilecascade::io::{
    DirectoryOutput, InputSource, InputTile, MemoryInput, MemoryOutput, OutputStore, SourceError,
};
use tilecascade::process::{ProcessContext, ProcessError, ProcessOutput, TileProcessor};
use tilecascade::raster::{ResamplingMethod, TileData};
use tilecascade::task::{PreprocessingTask, TaskErrorKind, TaskOutcome};

const NODATA: f32 = -1.0;

fn pyramid() -> TilePyramid {
    TilePyramid::new(GridKind::Geodetic)
}

/// Writes `value(tile)` into every pixel; `None` means the empty signal.
struct ValueProcessor {
    value: fn(&Tile) -> Option<f32>,
    started: AtomicUsize,
}

impl ValueProcessor {
    fn new(value: fn(&Tile) -> Option<f32>) -> Self {
        Self {
            value,
            started: AtomicUsize::new(0),
        }
    }
}

impl TileProcessor for ValueProcessor {
    fn name(&self) -> &str {
        "value"
    }

    fn execute(&self, ctx: &ProcessContext<'_>) -> Result<ProcessOutput, ProcessError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        match (self.value)(ctx.tile()) {
            Some(value) => Ok(ProcessOutput::Data(TileData::filled(
                ctx.tile().output_shape(),
                value,
                NODATA,
            ))),
            None => Ok(ProcessOutput::Empty),
        }
    }
}

fn constant(_tile: &Tile) -> Option<f32> {
    Some(1.0)
}

#[test]
fn idempotent_restart_performs_zero_writes() {
    let output = Arc::new(MemoryOutput::new());
    let config = || {
        BatchConfig::builder(pyramid(), ZoomLevels::new(1, 2).unwrap())
            .sequential()
            .build()
            .unwrap()
    };

    let first = BatchScheduler::new(
        config(),
        vec![],
        output.clone(),
        Arc::new(ValueProcessor::new(constant)),
    )
    .unwrap()
    .run()
    .unwrap();
    assert_eq!(first.written, 8 + 32);
    assert_eq!(first.skipped_existing, 0);
    let tiles_after_first = output.tile_count();
    let writes_after_first = output.write_count();

    // Second run with unchanged configuration: identical final state, not
    // one write performed.
    let second = BatchScheduler::new(
        config(),
        vec![],
        output.clone(),
        Arc::new(ValueProcessor::new(constant)),
    )
    .unwrap()
    .run()
    .unwrap();

    assert_eq!(second.written, 0);
    assert_eq!(second.skipped_existing, 8 + 32);
    assert_eq!(output.write_count(), writes_after_first);
    assert_eq!(output.tile_count(), tiles_after_first);
}

#[test]
fn overwrite_mode_recomputes_everything() {
    let output = Arc::new(MemoryOutput::new());
    let make = |overwrite: bool| {
        BatchConfig::builder(pyramid(), ZoomLevels::single(1).unwrap())
            .overwrite(overwrite)
            .sequential()
            .build()
            .unwrap()
    };

    BatchScheduler::new(
        make(false),
        vec![],
        output.clone(),
        Arc::new(ValueProcessor::new(constant)),
    )
    .unwrap()
    .run()
    .unwrap();
    assert_eq!(output.write_count(), 8);

    let summary = BatchScheduler::new(
        make(true),
        vec![],
        output.clone(),
        Arc::new(ValueProcessor::new(constant)),
    )
    .unwrap()
    .run()
    .unwrap();
    assert_eq!(summary.written, 8);
    assert_eq!(output.write_count(), 16);
}

/// Input whose `open` fails transiently a fixed number of times.
struct FlakyInput {
    remaining_failures: AtomicU32,
    attempts: AtomicU32,
}

impl FlakyInput {
    fn failing(times: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(times),
            attempts: AtomicU32::new(0),
        }
    }
}

struct StaticTile {
    bbox: Bounds,
}

impl InputTile for StaticTile {
    fn bbox(&self) -> Bounds {
        self.bbox
    }

    fn read(&self) -> Result<Option<TileData>, SourceError> {
        Ok(None)
    }
}

impl InputSource for FlakyInput {
    fn name(&self) -> &str {
        "flaky"
    }

    fn coverage(&self) -> Option<Bounds> {
        None
    }

    fn open(&self, tile: &Tile) -> Result<Box<dyn InputTile>, SourceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SourceError::Unavailable("still syncing".into()));
        }
        Ok(Box::new(StaticTile {
            bbox: tile.buffered_bounds(),
        }))
    }
}

/// Bounds selecting exactly one zoom-0 tile (the western hemisphere).
fn single_tile_bounds() -> Bounds {
    Bounds::new(-170.0, -80.0, -10.0, 80.0)
}

fn retry_config() -> BatchConfig {
    BatchConfig::builder(pyramid(), ZoomLevels::single(0).unwrap())
        .bounds(single_tile_bounds())
        .retry(RetrySettings {
            tries: 3,
            delay: Duration::from_millis(1),
            backoff: 1.0,
        })
        .sequential()
        .build()
        .unwrap()
}

#[test]
fn transient_input_failure_recovers_within_retry_limit() {
    // Fails exactly twice, succeeds on the third attempt.
    let input = Arc::new(FlakyInput::failing(2));
    let output = Arc::new(MemoryOutput::new());
    let mut scheduler = BatchScheduler::new(
        retry_config(),
        vec![input.clone() as Arc<dyn InputSource>],
        output,
        Arc::new(ValueProcessor::new(constant)),
    )
    .unwrap();

    let summary = scheduler.run().unwrap();
    assert_eq!(summary.written, 1);
    assert_eq!(input.attempts.load(Ordering::SeqCst), 3);
}

#[test]
fn exhausted_retries_abort_with_io_error_after_exactly_three_attempts() {
    let input = Arc::new(FlakyInput::failing(u32::MAX));
    let output = Arc::new(MemoryOutput::new());
    let mut scheduler = BatchScheduler::new(
        retry_config(),
        vec![input.clone() as Arc<dyn InputSource>],
        output,
        Arc::new(ValueProcessor::new(constant)),
    )
    .unwrap();

    let err = scheduler.run().unwrap_err();
    match err {
        BatchError::TileFailed { source, .. } => {
            assert_eq!(source.kind(), TaskErrorKind::Io);
        }
        other => panic!("expected TileFailed, got {other:?}"),
    }
    assert_eq!(input.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(scheduler.state(), BatchState::Aborted);
}

#[test]
fn fatal_failure_aborts_and_pending_tasks_never_start() {
    // Ten tiles at zoom 1 plus zoom 2 never reached; the third executed
    // task fails.
    static STARTED: AtomicUsize = AtomicUsize::new(0);

    struct FailThird;
    impl TileProcessor for FailThird {
        fn name(&self) -> &str {
            "fail-third"
        }
        fn execute(&self, ctx: &ProcessContext<'_>) -> Result<ProcessOutput, ProcessError> {
            let n = STARTED.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 3 {
                return Err(ProcessError::new("third task fails"));
            }
            Ok(ProcessOutput::Data(TileData::filled(
                ctx.tile().output_shape(),
                1.0,
                NODATA,
            )))
        }
    }

    let config = BatchConfig::builder(pyramid(), ZoomLevels::new(1, 2).unwrap())
        .sequential()
        .build()
        .unwrap();
    let output = Arc::new(MemoryOutput::new());
    let mut scheduler =
        BatchScheduler::new(config, vec![], output.clone(), Arc::new(FailThird)).unwrap();

    let err = scheduler.run().unwrap_err();
    let BatchError::TileFailed { source, .. } = &err else {
        panic!("expected TileFailed, got {err:?}");
    };
    assert_eq!(source.kind(), TaskErrorKind::Computation);

    // Zoom 2 runs first (32 tiles); the failure on the third task ends the
    // batch before anything else begins.
    assert_eq!(STARTED.load(Ordering::SeqCst), 3);
    assert_eq!(output.write_count(), 2);
    assert_eq!(scheduler.state(), BatchState::Aborted);
}

/// Input declaring one preprocessing task and counting its computations.
struct PreprocessingInput {
    computations: Arc<AtomicUsize>,
}

impl InputSource for PreprocessingInput {
    fn name(&self) -> &str {
        "preprocessed"
    }

    fn coverage(&self) -> Option<Bounds> {
        None
    }

    fn open(&self, tile: &Tile) -> Result<Box<dyn InputTile>, SourceError> {
        Ok(Box::new(StaticTile {
            bbox: tile.buffered_bounds(),
        }))
    }

    fn preprocessing_tasks(&self) -> Vec<PreprocessingTask> {
        let computations = self.computations.clone();
        vec![PreprocessingTask::new::<u64, _>("global-stats", move || {
            computations.fetch_add(1, Ordering::SeqCst);
            Ok(42u64)
        })]
    }
}

#[test]
fn preprocessing_computed_once_and_visible_to_every_task() {
    struct NeedsStats;
    impl TileProcessor for NeedsStats {
        fn name(&self) -> &str {
            "needs-stats"
        }
        fn execute(&self, ctx: &ProcessContext<'_>) -> Result<ProcessOutput, ProcessError> {
            let stats = ctx
                .preprocessing_result::<u64>("global-stats")
                .ok_or_else(|| ProcessError::new("preprocessing result missing"))?;
            if *stats != 42 {
                return Err(ProcessError::new("wrong preprocessing value"));
            }
            Ok(ProcessOutput::Data(TileData::filled(
                ctx.tile().output_shape(),
                *stats as f32,
                NODATA,
            )))
        }
    }

    let computations = Arc::new(AtomicUsize::new(0));
    // Zoom 3 holds 128 tiles, comfortably above the 100 tasks the property
    // calls for.
    let config = BatchConfig::builder(pyramid(), ZoomLevels::single(3).unwrap())
        .workers(4)
        .build()
        .unwrap();
    let output = Arc::new(MemoryOutput::new());
    let mut scheduler = BatchScheduler::new(
        config,
        vec![Arc::new(PreprocessingInput {
            computations: computations.clone(),
        }) as Arc<dyn InputSource>],
        output,
        Arc::new(NeedsStats),
    )
    .unwrap();

    let summary = scheduler.run().unwrap();
    assert_eq!(summary.written, 128);
    // Referenced by 128 tasks, computed exactly once.
    assert_eq!(computations.load(Ordering::SeqCst), 1);
}

fn quadrant_value(tile: &Tile) -> Option<f32> {
    // Distinct value per tile; southern-hemisphere tiles are empty.
    let rows = 1u32 << tile.zoom();
    if tile.row() >= rows / 2 {
        return None;
    }
    Some((tile.row() * 1000 + tile.col()) as f32)
}

#[test]
fn overview_cascade_places_children_in_correct_quadrants() {
    let config = BatchConfig::builder(pyramid(), ZoomLevels::new(1, 2).unwrap())
        .overviews(OverviewOptions {
            resampling: ResamplingMethod::Nearest,
        })
        .sequential()
        .build()
        .unwrap();
    let output = Arc::new(MemoryOutput::new());
    let mut scheduler = BatchScheduler::new(
        config,
        vec![],
        output.clone(),
        Arc::new(ValueProcessor::new(quadrant_value)),
    )
    .unwrap();

    scheduler.run().unwrap();

    // Parent 1/0/0 aggregates children 2/0/0, 2/0/1, 2/1/0, 2/1/1.
    let parent = pyramid().tile(1, 0, 0).unwrap();
    let data = output.read(&parent).unwrap().unwrap();
    let h = data.shape().height;
    let w = data.shape().width;

    assert_eq!(data.get(h / 4, w / 4), Some(0.0)); // child 2/0/0
    assert_eq!(data.get(h / 4, 3 * w / 4), Some(1.0)); // child 2/0/1
    assert_eq!(data.get(3 * h / 4, w / 4), Some(1000.0)); // child 2/1/0
    assert_eq!(data.get(3 * h / 4, 3 * w / 4), Some(1001.0)); // child 2/1/1
}

#[test]
fn all_empty_children_produce_empty_unwritten_parent() {
    let config = BatchConfig::builder(pyramid(), ZoomLevels::new(1, 2).unwrap())
        .overviews(OverviewOptions::default())
        .sequential()
        .build()
        .unwrap();
    let output = Arc::new(MemoryOutput::new());
    let mut scheduler = BatchScheduler::new(
        config,
        vec![],
        output.clone(),
        Arc::new(ValueProcessor::new(quadrant_value)),
    )
    .unwrap();

    let mut empties = Vec::new();
    scheduler
        .run_with(|result| {
            if result.outcome() == TaskOutcome::Empty {
                empties.push(result.tile().id());
            }
        })
        .unwrap();

    // The whole southern half of zoom 2 is empty, so southern parents at
    // zoom 1 must report empty and never be written.
    let southern_parent = pyramid().tile(1, 1, 1).unwrap();
    assert!(empties.contains(&southern_parent.id()));
    assert!(!output.tiles_exist(&southern_parent).unwrap());
}

#[test]
fn skipped_existing_children_feed_overview_aggregation() {
    // First run writes only the baselevel.
    let output = Arc::new(MemoryOutput::new());
    let base_only = BatchConfig::builder(pyramid(), ZoomLevels::single(2).unwrap())
        .sequential()
        .build()
        .unwrap();
    BatchScheduler::new(
        base_only,
        vec![],
        output.clone(),
        Arc::new(ValueProcessor::new(constant)),
    )
    .unwrap()
    .run()
    .unwrap();

    // Second run covers zooms 1-2 with overviews: every baselevel tile is
    // skipped as existing, yet the overview level still aggregates from
    // them.
    let with_overviews = BatchConfig::builder(pyramid(), ZoomLevels::new(1, 2).unwrap())
        .overviews(OverviewOptions::default())
        .sequential()
        .build()
        .unwrap();
    let summary = BatchScheduler::new(
        with_overviews,
        vec![],
        output.clone(),
        Arc::new(ValueProcessor::new(constant)),
    )
    .unwrap()
    .run()
    .unwrap();

    assert_eq!(summary.skipped_existing, 32);
    assert_eq!(summary.written, 8);

    let parent = pyramid().tile(1, 0, 0).unwrap();
    let data = output.read(&parent).unwrap().unwrap();
    assert_eq!(data.get(0, 0), Some(1.0));
}

#[test]
fn antimeridian_overview_has_no_seam() {
    // Metatiling 2 makes zoom 1 a two-column grid whose columns 0 and W-1
    // are wrap-adjacent children of the single zoom-0 tile.
    let pyramid = TilePyramid::new(GridKind::Geodetic)
        .with_metatiling(2)
        .unwrap();
    let config = BatchConfig::builder(pyramid.clone(), ZoomLevels::new(0, 1).unwrap())
        .overviews(OverviewOptions {
            resampling: ResamplingMethod::Nearest,
        })
        .sequential()
        .build()
        .unwrap();
    let output = Arc::new(MemoryOutput::new());
    let mut scheduler = BatchScheduler::new(
        config,
        vec![],
        output.clone(),
        Arc::new(ValueProcessor::new(|tile| Some(tile.col() as f32 + 1.0))),
    )
    .unwrap();
    scheduler.run().unwrap();

    let root = pyramid.tile(0, 0, 0).unwrap();
    let data = output.read(&root).unwrap().unwrap();
    let w = data.shape().width;
    let row = data.shape().height / 2;
    for col in 0..w {
        let value = data.get(row, col).unwrap();
        let expected = if col < w / 2 { 1.0 } else { 2.0 };
        assert_eq!(value, expected, "gap or overlap at column {col}");
    }
}

#[test]
fn worker_pool_batch_matches_sequential_results() {
    let sequential_output = Arc::new(MemoryOutput::new());
    let pool_output = Arc::new(MemoryOutput::new());

    let build = |workers: Option<usize>| {
        let builder = BatchConfig::builder(pyramid(), ZoomLevels::new(1, 2).unwrap());
        match workers {
            Some(n) => builder.workers(n),
            None => builder.sequential(),
        }
        .build()
        .unwrap()
    };

    BatchScheduler::new(
        build(None),
        vec![],
        sequential_output.clone(),
        Arc::new(ValueProcessor::new(quadrant_value)),
    )
    .unwrap()
    .run()
    .unwrap();

    BatchScheduler::new(
        build(Some(4)),
        vec![],
        pool_output.clone(),
        Arc::new(ValueProcessor::new(quadrant_value)),
    )
    .unwrap()
    .run()
    .unwrap();

    // Same tiles, same bytes, whatever the backend.
    assert_eq!(sequential_output.tile_count(), pool_output.tile_count());
    for zoom in 1..=2u8 {
        let p = pyramid();
        for row in 0..p.rows(zoom) {
            for col in 0..p.columns(zoom) {
                let tile = p.tile(zoom, row as u32, col as u32).unwrap();
                assert_eq!(
                    sequential_output.read(&tile).unwrap(),
                    pool_output.read(&tile).unwrap(),
                    "mismatch on tile {tile}"
                );
            }
        }
    }
}

#[test]
fn directory_output_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let make_scheduler = || {
        let output = Arc::new(DirectoryOutput::open(dir.path(), pyramid()).unwrap());
        let config = BatchConfig::builder(pyramid(), ZoomLevels::single(1).unwrap())
            .sequential()
            .build()
            .unwrap();
        BatchScheduler::new(
            config,
            vec![],
            output,
            Arc::new(ValueProcessor::new(constant)),
        )
        .unwrap()
    };

    let first = make_scheduler().run().unwrap();
    assert_eq!(first.written, 8);

    let second = make_scheduler().run().unwrap();
    assert_eq!(second.written, 0);
    assert_eq!(second.skipped_existing, 8);
}

#[test]
fn inputs_with_declared_coverage_restrict_the_work_set() {
    // Input covering only the western zoom-0 tile; no explicit bounds.
    let input: Arc<dyn InputSource> = Arc::new(
        MemoryInput::new("west").with_coverage(Bounds::new(-180.0, -90.0, -20.0, 90.0)),
    );
    let config = BatchConfig::builder(pyramid(), ZoomLevels::single(0).unwrap())
        .sequential()
        .build()
        .unwrap();
    let output = Arc::new(MemoryOutput::new());
    let mut scheduler = BatchScheduler::new(
        config,
        vec![input],
        output,
        Arc::new(ValueProcessor::new(constant)),
    )
    .unwrap();

    let summary = scheduler.run().unwrap();
    assert_eq!(summary.written, 1);
}
