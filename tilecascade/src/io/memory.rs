//! In-memory reference drivers.
//!
//! Used by the test suite and by demos that do not want to touch disk. The
//! output driver additionally counts writes, which is what the idempotency
//! tests key off.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;

use super::{InputSource, InputTile, OutputStore, SourceError};
use crate::grid::{Bounds, Tile};
use crate::raster::TileData;

/// Input source backed by a concurrent map of pre-seeded tiles.
///
/// Tiles not present in the map read as the empty signal.
pub struct MemoryInput {
    name: String,
    coverage: Option<Bounds>,
    tiles: DashMap<(u8, u32, u32), TileData>,
}

impl MemoryInput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            coverage: None,
            tiles: DashMap::new(),
        }
    }

    /// Declares the coverage reported to the process area resolver.
    pub fn with_coverage(mut self, coverage: Bounds) -> Self {
        self.coverage = Some(coverage);
        self
    }

    /// Seeds data for one tile.
    pub fn insert(&self, tile: &Tile, data: TileData) {
        self.tiles.insert(tile.id(), data);
    }
}

impl InputSource for MemoryInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn coverage(&self) -> Option<Bounds> {
        self.coverage
    }

    fn open(&self, tile: &Tile) -> Result<Box<dyn InputTile>, SourceError> {
        Ok(Box::new(MemoryInputTile {
            bbox: tile.buffered_bounds(),
            data: self.tiles.get(&tile.id()).map(|entry| entry.value().clone()),
        }))
    }
}

struct MemoryInputTile {
    bbox: Bounds,
    data: Option<TileData>,
}

impl InputTile for MemoryInputTile {
    fn bbox(&self) -> Bounds {
        self.bbox
    }

    fn read(&self) -> Result<Option<TileData>, SourceError> {
        Ok(self.data.clone())
    }
}

/// Output store backed by a concurrent map.
pub struct MemoryOutput {
    tiles: DashMap<(u8, u32, u32), TileData>,
    writes: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self {
            tiles: DashMap::new(),
            writes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of write calls performed so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of tiles currently stored.
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Whether [`OutputStore::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for MemoryOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputStore for MemoryOutput {
    fn tiles_exist(&self, tile: &Tile) -> Result<bool, SourceError> {
        Ok(self.tiles.contains_key(&tile.id()))
    }

    fn read(&self, tile: &Tile) -> Result<Option<TileData>, SourceError> {
        Ok(self.tiles.get(&tile.id()).map(|entry| entry.value().clone()))
    }

    fn write(&self, tile: &Tile, data: &TileData) -> Result<(), SourceError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.tiles.insert(tile.id(), data.clone());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GridKind, TilePyramid};

    fn tile() -> Tile {
        TilePyramid::new(GridKind::Geodetic).tile(3, 2, 5).unwrap()
    }

    #[test]
    fn test_memory_input_empty_signal() {
        let input = MemoryInput::new("test");
        let handle = input.open(&tile()).unwrap();
        assert!(handle.read().unwrap().is_none());
    }

    #[test]
    fn test_memory_input_roundtrip() {
        let input = MemoryInput::new("test");
        let t = tile();
        let data = TileData::filled(t.output_shape(), 4.0, 0.0);
        input.insert(&t, data.clone());

        let handle = input.open(&t).unwrap();
        assert_eq!(handle.read().unwrap(), Some(data));
        assert_eq!(handle.bbox(), t.buffered_bounds());
    }

    #[test]
    fn test_memory_output_existence_and_writes() {
        let output = MemoryOutput::new();
        let t = tile();
        let data = TileData::filled(t.output_shape(), 1.0, 0.0);

        assert!(!output.tiles_exist(&t).unwrap());
        output.write(&t, &data).unwrap();
        assert!(output.tiles_exist(&t).unwrap());
        assert_eq!(output.read(&t).unwrap(), Some(data));
        assert_eq!(output.write_count(), 1);
    }

    #[test]
    fn test_memory_output_close_flag() {
        let output = MemoryOutput::new();
        assert!(!output.is_closed());
        output.close();
        assert!(output.is_closed());
    }
}
