//! User computation interface.
//!
//! A process is a function of (tile, opened inputs, parameters) producing
//! tile data or the empty signal. The engine invokes it exactly once per
//! tile task and never interprets what the data means.
//!
//! Processes are looked up by name through the [`ProcessRegistry`], an
//! explicit table populated at startup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::executor::RetryPolicy;
use crate::grid::{Bounds, Tile};
use crate::io::{with_retry, InputTile};
use crate::raster::TileData;
use crate::task::{PreprocessingCache, TaskErrorKind};

/// Output of one process invocation.
#[derive(Debug)]
pub enum ProcessOutput {
    /// Data to be written for the tile.
    Data(TileData),
    /// The tile holds no data; nothing is written and the batch continues.
    Empty,
}

/// Error raised by a user computation.
///
/// Carries a [`TaskErrorKind`] so failures that are really exhausted input
/// retries keep their I/O identity instead of being blamed on the process
/// logic.
#[derive(Debug)]
pub struct ProcessError {
    kind: TaskErrorKind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ProcessError {
    /// A failure of the computation itself.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Computation,
            message: message.into(),
            source: None,
        }
    }

    /// A failure reading a declared input.
    pub fn input(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Io,
            message: message.into(),
            source: None,
        }
    }

    /// Attaches the underlying error.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> TaskErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        TaskErrorKind,
        String,
        Option<Box<dyn std::error::Error + Send + Sync>>,
    ) {
        (self.kind, self.message, self.source)
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &_)
    }
}

/// A scoped input handle opened for the tile being processed.
///
/// Reads go through the batch retry policy; transient source failures are
/// retried before the error surfaces to the computation.
pub struct OpenedInput {
    name: String,
    handle: Box<dyn InputTile>,
    retry: RetryPolicy,
}

impl OpenedInput {
    pub(crate) fn new(name: String, handle: Box<dyn InputTile>, retry: RetryPolicy) -> Self {
        Self {
            name,
            handle,
            retry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bbox(&self) -> Bounds {
        self.handle.bbox()
    }

    /// Reads the input for this tile, `Ok(None)` meaning no data.
    pub fn read(&self) -> Result<Option<TileData>, ProcessError> {
        with_retry(&self.retry, &self.name, || self.handle.read()).map_err(|err| {
            ProcessError::input(format!(
                "input '{}' unavailable after {} attempt(s)",
                self.name,
                self.retry.max_attempts()
            ))
            .with_source(err)
        })
    }
}

/// Everything a process invocation gets to see.
pub struct ProcessContext<'a> {
    tile: &'a Tile,
    inputs: &'a [OpenedInput],
    params: &'a Map<String, Value>,
    preprocessed: &'a PreprocessingCache,
}

impl<'a> ProcessContext<'a> {
    pub(crate) fn new(
        tile: &'a Tile,
        inputs: &'a [OpenedInput],
        params: &'a Map<String, Value>,
        preprocessed: &'a PreprocessingCache,
    ) -> Self {
        Self {
            tile,
            inputs,
            params,
            preprocessed,
        }
    }

    /// The tile being computed (pixel buffer included in its shape).
    pub fn tile(&self) -> &Tile {
        self.tile
    }

    /// All opened inputs, in declaration order.
    pub fn inputs(&self) -> &[OpenedInput] {
        self.inputs
    }

    /// Looks up an opened input by name.
    pub fn input(&self, name: &str) -> Option<&OpenedInput> {
        self.inputs.iter().find(|input| input.name() == name)
    }

    /// The first declared input, if any.
    pub fn first_input(&self) -> Option<&OpenedInput> {
        self.inputs.first()
    }

    /// Free-form process parameter.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Memoized preprocessing result by key.
    pub fn preprocessing_result<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.preprocessed.get(key)
    }
}

/// A user computation invoked once per tile task.
pub trait TileProcessor: Send + Sync {
    /// Name the process is registered under.
    fn name(&self) -> &str;

    /// Computes one tile.
    fn execute(&self, ctx: &ProcessContext<'_>) -> Result<ProcessOutput, ProcessError>;
}

/// Explicit name → process table populated at startup.
pub struct ProcessRegistry {
    processes: HashMap<String, Arc<dyn TileProcessor>>,
}

impl ProcessRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            processes: HashMap::new(),
        }
    }

    /// A registry with the built-in processes registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PassthroughProcessor));
        registry
    }

    pub fn register(&mut self, process: Arc<dyn TileProcessor>) {
        self.processes.insert(process.name().to_string(), process);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TileProcessor>> {
        self.processes.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.processes.keys().map(String::as_str).collect()
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Built-in process copying the first input through to the output.
///
/// The workhorse for converting and re-tiling existing tile directories.
pub struct PassthroughProcessor;

impl TileProcessor for PassthroughProcessor {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn execute(&self, ctx: &ProcessContext<'_>) -> Result<ProcessOutput, ProcessError> {
        let input = ctx
            .first_input()
            .ok_or_else(|| ProcessError::new("passthrough requires one input"))?;
        match input.read()? {
            Some(data) if !data.is_empty() => Ok(ProcessOutput::Data(data)),
            _ => Ok(ProcessOutput::Empty),
        }
    }
}
