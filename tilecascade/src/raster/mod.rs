//! Minimal pixel buffer used as the engine's merge contract.
//!
//! The scheduling core does not own real raster semantics; it only needs a
//! buffer type it can classify as empty, resample for overviews and slice
//! into windows. Anything richer (band math, masking, format encoding) is
//! the business of external collaborators.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grid::Shape;

/// Errors raised by pixel buffer operations.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("pixel count {got} does not match shape {expected}")]
    LengthMismatch { expected: Shape, got: usize },

    #[error("shape {got} does not match expected {expected}")]
    ShapeMismatch { expected: Shape, got: Shape },

    #[error("window {shape} at ({row}, {col}) exceeds buffer {buffer}")]
    WindowOutOfBounds {
        row: usize,
        col: usize,
        shape: Shape,
        buffer: Shape,
    },

    #[error("buffer of {buffer} pixels cannot be stripped from shape {shape}")]
    BufferTooLarge { buffer: u16, shape: Shape },
}

/// How child pixels are condensed into parent pixels during aggregation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResamplingMethod {
    /// Pick the source pixel nearest to each target pixel.
    Nearest,
    /// Mean of the source pixels covered by each target pixel, ignoring
    /// nodata.
    Average,
}

impl std::str::FromStr for ResamplingMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(ResamplingMethod::Nearest),
            "average" => Ok(ResamplingMethod::Average),
            other => Err(format!("unknown resampling method: {other}")),
        }
    }
}

/// A single-band pixel buffer with a nodata sentinel.
///
/// Pixels are stored row-major. A buffer where every pixel equals the
/// nodata value is classified as empty, which is what drives the
/// "all children empty" rule of overview aggregation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileData {
    height: usize,
    width: usize,
    nodata: f32,
    pixels: Vec<f32>,
}

impl TileData {
    /// Buffer filled with a constant value.
    pub fn filled(shape: Shape, value: f32, nodata: f32) -> Self {
        Self {
            height: shape.height,
            width: shape.width,
            nodata,
            pixels: vec![value; shape.len()],
        }
    }

    /// Buffer filled entirely with nodata.
    pub fn nodata_filled(shape: Shape, nodata: f32) -> Self {
        Self::filled(shape, nodata, nodata)
    }

    /// Buffer from raw row-major pixels.
    pub fn from_pixels(shape: Shape, pixels: Vec<f32>, nodata: f32) -> Result<Self, RasterError> {
        if pixels.len() != shape.len() {
            return Err(RasterError::LengthMismatch {
                expected: shape,
                got: pixels.len(),
            });
        }
        Ok(Self {
            height: shape.height,
            width: shape.width,
            nodata,
            pixels,
        })
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.height, self.width)
    }

    pub fn nodata(&self) -> f32 {
        self.nodata
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    /// Returns true if a value counts as nodata (NaN sentinels included).
    pub fn is_nodata(&self, value: f32) -> bool {
        value == self.nodata || (self.nodata.is_nan() && value.is_nan())
    }

    /// Returns true if every pixel is nodata (or the buffer has no pixels).
    pub fn is_empty(&self) -> bool {
        self.pixels.iter().all(|v| self.is_nodata(*v))
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if row < self.height && col < self.width {
            Some(self.pixels[row * self.width + col])
        } else {
            None
        }
    }

    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        assert!(row < self.height && col < self.width, "pixel out of bounds");
        self.pixels[row * self.width + col] = value;
    }

    /// Copies another buffer into this one at the given pixel offset.
    pub fn blit(&mut self, other: &TileData, at_row: usize, at_col: usize) -> Result<(), RasterError> {
        if at_row + other.height > self.height || at_col + other.width > self.width {
            return Err(RasterError::WindowOutOfBounds {
                row: at_row,
                col: at_col,
                shape: other.shape(),
                buffer: self.shape(),
            });
        }
        for row in 0..other.height {
            let src = &other.pixels[row * other.width..(row + 1) * other.width];
            let dst_start = (at_row + row) * self.width + at_col;
            self.pixels[dst_start..dst_start + other.width].copy_from_slice(src);
        }
        Ok(())
    }

    /// Extracts a rectangular window.
    pub fn window(&self, row: usize, col: usize, shape: Shape) -> Result<TileData, RasterError> {
        if row + shape.height > self.height || col + shape.width > self.width {
            return Err(RasterError::WindowOutOfBounds {
                row,
                col,
                shape,
                buffer: self.shape(),
            });
        }
        let mut pixels = Vec::with_capacity(shape.len());
        for r in row..row + shape.height {
            pixels.extend_from_slice(&self.pixels[r * self.width + col..r * self.width + col + shape.width]);
        }
        Ok(TileData {
            height: shape.height,
            width: shape.width,
            nodata: self.nodata,
            pixels,
        })
    }

    /// Strips a uniform border of `buffer` pixels from each edge.
    pub fn without_buffer(&self, buffer: u16) -> Result<TileData, RasterError> {
        let buffer = buffer as usize;
        if 2 * buffer >= self.height || 2 * buffer >= self.width {
            return Err(RasterError::BufferTooLarge {
                buffer: buffer as u16,
                shape: self.shape(),
            });
        }
        self.window(
            buffer,
            buffer,
            Shape::new(self.height - 2 * buffer, self.width - 2 * buffer),
        )
    }

    /// Resamples the buffer to a new shape.
    ///
    /// Handles arbitrary (including non-uniform) scale ratios; overview
    /// aggregation typically halves each axis.
    pub fn resampled(&self, target: Shape, method: ResamplingMethod) -> TileData {
        let mut out = TileData::nodata_filled(target, self.nodata);
        if target.is_empty() || self.shape().is_empty() {
            return out;
        }
        for tr in 0..target.height {
            for tc in 0..target.width {
                let value = match method {
                    ResamplingMethod::Nearest => {
                        let sr = tr * self.height / target.height;
                        let sc = tc * self.width / target.width;
                        self.pixels[sr * self.width + sc]
                    }
                    ResamplingMethod::Average => {
                        let r0 = tr * self.height / target.height;
                        let r1 = (((tr + 1) * self.height).div_ceil(target.height)).max(r0 + 1);
                        let c0 = tc * self.width / target.width;
                        let c1 = (((tc + 1) * self.width).div_ceil(target.width)).max(c0 + 1);

                        let mut sum = 0.0f64;
                        let mut count = 0usize;
                        for sr in r0..r1.min(self.height) {
                            for sc in c0..c1.min(self.width) {
                                let v = self.pixels[sr * self.width + sc];
                                if !self.is_nodata(v) {
                                    sum += v as f64;
                                    count += 1;
                                }
                            }
                        }
                        if count == 0 {
                            self.nodata
                        } else {
                            (sum / count as f64) as f32
                        }
                    }
                };
                out.pixels[tr * target.width + tc] = value;
            }
        }
        out
    }
}
