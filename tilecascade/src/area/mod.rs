//! Process area resolution.
//!
//! The process area is the region of the world actually eligible for
//! computation at a given zoom level. It is the intersection of the
//! pyramid's own extent with either the user-declared bounds or, when no
//! bounds were declared, the union of the input collaborators' coverages.
//!
//! Input coverage is supplied lazily through a closure so runs that never
//! need inputs (overview-only, read-only) never initialize them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::grid::{Bounds, TilePyramid};

/// A region in pyramid coordinates, kept as a union of rectangles.
///
/// This deliberately stays far away from full polygon algebra: the core only
/// needs intersection with axis-aligned boxes and emptiness checks; anything
/// richer belongs to an external geometry library.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Area {
    boxes: Vec<Bounds>,
}

impl Area {
    /// The empty area.
    pub fn empty() -> Self {
        Self { boxes: Vec::new() }
    }

    /// Area covering a single rectangle; empty if the rectangle is
    /// degenerate.
    pub fn from_bounds(bounds: Bounds) -> Self {
        Self::from_boxes(vec![bounds])
    }

    /// Area covering the union of the given rectangles.
    pub fn from_boxes(boxes: Vec<Bounds>) -> Self {
        Self {
            boxes: boxes.into_iter().filter(|b| !b.is_empty()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// The rectangles making up this area.
    pub fn boxes(&self) -> &[Bounds] {
        &self.boxes
    }

    /// Bounding box of the whole area, `None` when empty.
    pub fn bbox(&self) -> Option<Bounds> {
        let mut iter = self.boxes.iter();
        let first = *iter.next()?;
        Some(iter.fold(first, |acc, b| {
            Bounds::new(
                acc.left.min(b.left),
                acc.bottom.min(b.bottom),
                acc.right.max(b.right),
                acc.top.max(b.top),
            )
        }))
    }

    /// Returns true if any part of the area overlaps the rectangle.
    pub fn intersects(&self, bounds: &Bounds) -> bool {
        self.boxes.iter().any(|b| b.intersects(bounds))
    }

    /// Clips the area to a rectangle.
    pub fn clip(&self, bounds: &Bounds) -> Area {
        Area {
            boxes: self
                .boxes
                .iter()
                .filter_map(|b| b.intersection(bounds))
                .collect(),
        }
    }
}

/// Callback producing the coverage rectangles of all declared inputs.
///
/// Only invoked when declared bounds are absent, and at most once per batch.
pub type CoverageFn = Box<dyn Fn() -> Vec<Bounds> + Send + Sync>;

/// Resolves and caches the effective process area per zoom level.
///
/// Read-only after the batch starts: resolution happens on first access per
/// zoom and the result is cached for the batch's lifetime.
pub struct ProcessArea {
    pyramid: TilePyramid,
    declared: Option<Bounds>,
    coverage: CoverageFn,
    has_inputs: bool,
    coverage_cache: Mutex<Option<Area>>,
    zoom_cache: RwLock<HashMap<u8, Arc<Area>>>,
}

impl ProcessArea {
    /// Creates a resolver.
    ///
    /// * `declared` - explicit user-declared bounds, if any
    /// * `coverage` - lazy union of input coverages (consulted only when no
    ///   bounds were declared and inputs exist)
    /// * `has_inputs` - whether any inputs are declared at all
    pub fn new(
        pyramid: TilePyramid,
        declared: Option<Bounds>,
        coverage: CoverageFn,
        has_inputs: bool,
    ) -> Self {
        Self {
            pyramid,
            declared,
            coverage,
            has_inputs,
            coverage_cache: Mutex::new(None),
            zoom_cache: RwLock::new(HashMap::new()),
        }
    }

    /// The effective area at a zoom level.
    pub fn at_zoom(&self, zoom: u8) -> Arc<Area> {
        if let Some(area) = self.zoom_cache.read().get(&zoom) {
            return Arc::clone(area);
        }

        let extent = self.pyramid.extent();
        let area = match self.declared {
            Some(bounds) => Area::from_bounds(bounds).clip(&extent),
            None if self.has_inputs => self.coverage_area().clip(&extent),
            None => Area::from_bounds(extent),
        };
        debug!(zoom, empty = area.is_empty(), "resolved process area");

        let area = Arc::new(area);
        self.zoom_cache
            .write()
            .insert(zoom, Arc::clone(&area));
        area
    }

    fn coverage_area(&self) -> Area {
        let mut cache = self.coverage_cache.lock();
        if cache.is_none() {
            debug!("resolving input coverage");
            *cache = Some(Area::from_boxes((self.coverage)()));
        }
        cache.clone().expect("coverage was just resolved")
    }
}
