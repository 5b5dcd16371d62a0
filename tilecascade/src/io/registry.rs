//! Driver registry.
//!
//! An explicit name-to-factory table populated at process start. There is
//! no runtime plugin scanning: applications register the drivers they ship
//! with and the configuration refers to them by name.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use super::{DirectoryOutput, InputSource, MemoryInput, MemoryOutput, OutputStore, SourceError};
use crate::grid::TilePyramid;

/// Factory producing an input source from driver parameters.
pub type InputFactory =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn InputSource>, SourceError> + Send + Sync>;

/// Factory producing an output store from driver parameters and the batch
/// pyramid.
pub type OutputFactory =
    Arc<dyn Fn(&Value, &TilePyramid) -> Result<Arc<dyn OutputStore>, SourceError> + Send + Sync>;

/// Name → factory table for input and output drivers.
pub struct DriverRegistry {
    inputs: HashMap<String, InputFactory>,
    outputs: HashMap<String, OutputFactory>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            inputs: HashMap::new(),
            outputs: HashMap::new(),
        }
    }

    /// A registry pre-populated with the reference drivers
    /// (`memory` input/output, `directory` output).
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register_input("memory", |params| {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("memory");
            Ok(Arc::new(MemoryInput::new(name)))
        });

        registry.register_output("memory", |_params, _pyramid| Ok(Arc::new(MemoryOutput::new())));

        registry.register_output("directory", |params, pyramid| {
            let path = params
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| SourceError::Other("directory driver requires 'path'".into()))?;
            Ok(Arc::new(DirectoryOutput::open(
                PathBuf::from(path),
                pyramid.clone(),
            )?))
        });

        registry
    }

    /// Registers an input driver factory under a name.
    pub fn register_input<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn InputSource>, SourceError> + Send + Sync + 'static,
    {
        self.inputs.insert(name.into(), Arc::new(factory));
    }

    /// Registers an output driver factory under a name.
    pub fn register_output<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value, &TilePyramid) -> Result<Arc<dyn OutputStore>, SourceError>
            + Send
            + Sync
            + 'static,
    {
        self.outputs.insert(name.into(), Arc::new(factory));
    }

    /// Instantiates an input source by driver name.
    pub fn create_input(
        &self,
        name: &str,
        params: &Value,
    ) -> Result<Arc<dyn InputSource>, SourceError> {
        let factory = self
            .inputs
            .get(name)
            .ok_or_else(|| SourceError::Other(format!("unknown input driver: {name}")))?;
        factory(params)
    }

    /// Instantiates an output store by driver name.
    pub fn create_output(
        &self,
        name: &str,
        params: &Value,
        pyramid: &TilePyramid,
    ) -> Result<Arc<dyn OutputStore>, SourceError> {
        let factory = self
            .outputs
            .get(name)
            .ok_or_else(|| SourceError::Other(format!("unknown output driver: {name}")))?;
        factory(params, pyramid)
    }

    /// Registered input driver names.
    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.keys().map(String::as_str).collect()
    }

    /// Registered output driver names.
    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.keys().map(String::as_str).collect()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
