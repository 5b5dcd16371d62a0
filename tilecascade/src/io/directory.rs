//! Tile directory output driver.
//!
//! Persists tiles as raw buffer dumps under `<root>/<zoom>/<row>/<col>.tile`
//! with a `metadata.json` descriptor at the root recording the pyramid the
//! directory was written with. A later batch (or a different tool) can
//! verify it is writing into a compatible directory by reading the
//! descriptor back.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{OutputStore, SourceError};
use crate::grid::{Tile, TilePyramid};
use crate::raster::TileData;

/// File name of the directory descriptor.
pub const METADATA_FILE: &str = "metadata.json";

/// Extension used for tile files.
pub const TILE_EXTENSION: &str = "tile";

/// Descriptor stored as `metadata.json` at the directory root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirectoryMetadata {
    pub pyramid: TilePyramid,
    pub driver: String,
}

/// Output store writing one file per tile under `zoom/row/col` paths.
pub struct DirectoryOutput {
    root: PathBuf,
    pyramid: TilePyramid,
}

impl DirectoryOutput {
    /// Opens (or initializes) a tile directory.
    ///
    /// Creates the root and writes `metadata.json` if missing. If a
    /// descriptor already exists it must match the requested pyramid.
    pub fn open(root: impl Into<PathBuf>, pyramid: TilePyramid) -> Result<Self, SourceError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let metadata_path = root.join(METADATA_FILE);
        match fs::read(&metadata_path) {
            Ok(bytes) => {
                let existing: DirectoryMetadata = serde_json::from_slice(&bytes)
                    .map_err(|e| SourceError::InvalidData(format!("bad {METADATA_FILE}: {e}")))?;
                if existing.pyramid != pyramid {
                    return Err(SourceError::Other(format!(
                        "tile directory {} was written with a different pyramid",
                        root.display()
                    )));
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let metadata = DirectoryMetadata {
                    pyramid: pyramid.clone(),
                    driver: "directory".to_string(),
                };
                let json = serde_json::to_vec_pretty(&metadata)
                    .map_err(|e| SourceError::Other(format!("encoding {METADATA_FILE}: {e}")))?;
                fs::write(&metadata_path, json)?;
                debug!(root = %root.display(), "initialized tile directory");
            }
            Err(err) => return Err(err.into()),
        }

        Ok(Self { root, pyramid })
    }

    /// Reads the descriptor of an existing tile directory.
    pub fn read_metadata(root: &Path) -> Result<DirectoryMetadata, SourceError> {
        let bytes = fs::read(root.join(METADATA_FILE))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| SourceError::InvalidData(format!("bad {METADATA_FILE}: {e}")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pyramid(&self) -> &TilePyramid {
        &self.pyramid
    }

    fn tile_path(&self, tile: &Tile) -> PathBuf {
        self.root
            .join(tile.zoom().to_string())
            .join(tile.row().to_string())
            .join(format!("{}.{}", tile.col(), TILE_EXTENSION))
    }
}

impl OutputStore for DirectoryOutput {
    fn tiles_exist(&self, tile: &Tile) -> Result<bool, SourceError> {
        Ok(self.tile_path(tile).exists())
    }

    fn read(&self, tile: &Tile) -> Result<Option<TileData>, SourceError> {
        match fs::read(self.tile_path(tile)) {
            Ok(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(|e| {
                SourceError::InvalidData(format!("tile {tile}: {e}"))
            })?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, tile: &Tile, data: &TileData) -> Result<(), SourceError> {
        let path = self.tile_path(tile);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = bincode::serialize(data)
            .map_err(|e| SourceError::Other(format!("encoding tile {tile}: {e}")))?;
        fs::write(&path, bytes)?;
        debug!(tile = %tile, path = %path.display(), "wrote tile");
        Ok(())
    }
}
