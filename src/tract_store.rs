//! Tract Store - per-state census tracts with a spatial index
//!
//! Tracts are keyed by GEOID in an FxHashMap; footprints live in the state's
//! equal-area projection and are indexed by an R-tree over their bounding
//! boxes, so a buffer query only clips the handful of tracts near it.
//!
//! A tract's footprint is its TIGER/Line boundary when one was loaded.
//! Otherwise it is a disc of the tract's land area around the projected
//! centroid, which keeps the area-weighting exact for fully covered tracts
//! and proportional for partially covered ones.

use crate::spatial::buffer::{equal_area_circle, radius_for_area};
use crate::spatial::AlbersEqualArea;
use crate::states::State;
use geo::{
    Area, BooleanOps, BoundingRect, Centroid, Contains, Coord, EuclideanDistance, MapCoords,
    MultiPolygon, Polygon, Rect,
};
use rstar::{Envelope, RTree, RTreeObject, SelectionFunction, AABB};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// WGS84 coordinate in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

/// ACS attributes of a tract. `None` means unknown, never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Demographics {
    pub total_population: Option<f64>,
    pub median_age: Option<f64>,
    pub median_household_income: Option<f64>,
    pub per_capita_income: Option<f64>,
    pub total_pop_25_plus: Option<f64>,
    pub bachelors_degree: Option<f64>,
    pub masters_degree: Option<f64>,
    pub professional_degree: Option<f64>,
    pub doctorate_degree: Option<f64>,
}

impl Demographics {
    /// Every attribute known
    pub fn is_complete(&self) -> bool {
        self.fields().iter().all(|(_, v)| v.is_some())
    }

    /// Known and strictly positive population
    pub fn is_populated(&self) -> bool {
        matches!(self.total_population, Some(p) if p > 0.0)
    }

    /// Attribute name/value pairs, in output order
    pub fn fields(&self) -> [(&'static str, Option<f64>); 9] {
        [
            ("median_age", self.median_age),
            ("median_household_income", self.median_household_income),
            ("per_capita_income", self.per_capita_income),
            ("total_population", self.total_population),
            ("total_pop_25_plus", self.total_pop_25_plus),
            ("bachelors_degree", self.bachelors_degree),
            ("masters_degree", self.masters_degree),
            ("professional_degree", self.professional_degree),
            ("doctorate_degree", self.doctorate_degree),
        ]
    }
}

/// One census tract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tract {
    pub geoid: String,
    pub state: State,
    pub centroid: Option<LatLon>,
    /// Land area in square meters
    pub area_sqm: Option<f64>,
    pub demographics: Demographics,
    pub data_complete: bool,
    pub fetched_on_demand: bool,
}

impl Tract {
    /// True when the tract can take part in radius queries
    pub fn is_locatable(&self) -> bool {
        self.centroid.is_some() && matches!(self.area_sqm, Some(a) if a > 0.0)
    }
}

/// A tract touched by a buffer, with the share of its area inside it
#[derive(Debug, Clone, Copy)]
pub struct TractOverlap<'a> {
    pub tract: &'a Tract,
    /// Intersection area / footprint area, in [0, 1]
    pub fraction: f64,
    /// Intersection area in square meters
    pub intersection_area: f64,
}

// ============================================================================
// Spatial index
// ============================================================================

#[derive(Debug, Clone)]
struct IndexedFootprint {
    geoid: String,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedFootprint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Selects footprints whose bounding box meets a query box
struct EnvelopeIntersects(AABB<[f64; 2]>);

impl SelectionFunction<IndexedFootprint> for EnvelopeIntersects {
    fn should_unpack_parent(&self, envelope: &AABB<[f64; 2]>) -> bool {
        self.0.intersects(envelope)
    }

    fn should_unpack_leaf(&self, leaf: &IndexedFootprint) -> bool {
        self.0.intersects(&leaf.envelope)
    }
}

struct Footprint {
    shape: MultiPolygon<f64>,
    area: f64,
    /// Loaded boundary rather than a synthesised disc
    is_boundary: bool,
}

fn rect_envelope(rect: Option<Rect<f64>>) -> Option<AABB<[f64; 2]>> {
    rect.map(|r| AABB::from_corners([r.min().x, r.min().y], [r.max().x, r.max().y]))
}

// ============================================================================
// Store
// ============================================================================

/// All known tracts of one state
pub struct TractStore {
    state: State,
    projection: AlbersEqualArea,
    footprint_segments: usize,
    tracts: FxHashMap<String, Tract>,
    footprints: FxHashMap<String, Footprint>,
    /// Projected boundaries of tracts not inserted yet
    boundaries: FxHashMap<String, MultiPolygon<f64>>,
    index: RTree<IndexedFootprint>,
}

impl TractStore {
    pub fn new(state: State, projection: AlbersEqualArea, footprint_segments: usize) -> Self {
        Self {
            state,
            projection,
            footprint_segments,
            tracts: FxHashMap::default(),
            footprints: FxHashMap::default(),
            boundaries: FxHashMap::default(),
            index: RTree::new(),
        }
    }

    /// Build a store from bulk-loaded tracts, bulk-loading the R-tree
    ///
    /// Duplicate GEOIDs keep the first occurrence.
    pub fn from_tracts(
        state: State,
        projection: AlbersEqualArea,
        footprint_segments: usize,
        tracts: impl IntoIterator<Item = Tract>,
    ) -> Self {
        Self::from_tracts_with_boundaries(
            state,
            projection,
            footprint_segments,
            FxHashMap::default(),
            tracts,
        )
    }

    /// Like `from_tracts`, with WGS84 boundary polygons (x = lon, y = lat)
    /// keyed by GEOID
    ///
    /// Boundaries are projected once. A tract with a boundary is indexed by
    /// it even without a centroid; boundaries of tracts that are not in
    /// `tracts` are kept for tracts added later.
    pub fn from_tracts_with_boundaries(
        state: State,
        projection: AlbersEqualArea,
        footprint_segments: usize,
        boundaries: FxHashMap<String, MultiPolygon<f64>>,
        tracts: impl IntoIterator<Item = Tract>,
    ) -> Self {
        let mut store = Self::new(state, projection, footprint_segments);
        let projected: FxHashMap<String, MultiPolygon<f64>> = boundaries
            .into_iter()
            .map(|(geoid, shape)| {
                let shape = store.project_boundary(&shape);
                (geoid, shape)
            })
            .collect();
        store.boundaries = projected;
        let mut entries = Vec::new();

        for tract in tracts {
            if store.tracts.contains_key(&tract.geoid) {
                continue;
            }
            if let Some(footprint) = store.take_footprint(&tract) {
                if let Some(envelope) = rect_envelope(footprint.shape.bounding_rect()) {
                    entries.push(IndexedFootprint { geoid: tract.geoid.clone(), envelope });
                    store.footprints.insert(tract.geoid.clone(), footprint);
                }
            }
            store.tracts.insert(tract.geoid.clone(), tract);
        }

        store.index = RTree::bulk_load(entries);
        store
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn projection(&self) -> &AlbersEqualArea {
        &self.projection
    }

    pub fn len(&self) -> usize {
        self.tracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracts.is_empty()
    }

    /// Number of tracts with a footprint in the spatial index
    pub fn indexed_len(&self) -> usize {
        self.index.size()
    }

    pub fn contains(&self, geoid: &str) -> bool {
        self.tracts.contains_key(geoid)
    }

    pub fn get(&self, geoid: &str) -> Option<&Tract> {
        self.tracts.get(geoid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tract> {
        self.tracts.values()
    }

    /// Insert a tract
    ///
    /// A GEOID already present is left alone, except that a previously
    /// unknown centroid or area is filled in (and the tract indexed).
    /// Returns true when the store changed.
    pub fn add(&mut self, tract: Tract) -> bool {
        if let Some(existing) = self.tracts.get_mut(&tract.geoid) {
            let mut filled = false;
            if existing.centroid.is_none() && tract.centroid.is_some() {
                existing.centroid = tract.centroid;
                filled = true;
            }
            if !matches!(existing.area_sqm, Some(a) if a > 0.0)
                && matches!(tract.area_sqm, Some(a) if a > 0.0)
            {
                existing.area_sqm = tract.area_sqm;
                filled = true;
            }
            if filled && !self.footprints.contains_key(&tract.geoid) {
                let existing = existing.clone();
                if let Some(footprint) = self.take_footprint(&existing) {
                    self.index_footprint(&existing.geoid, footprint);
                }
            }
            return filled;
        }

        if let Some(footprint) = self.take_footprint(&tract) {
            self.index_footprint(&tract.geoid, footprint);
        }
        debug!(geoid = %tract.geoid, state = %self.state, "Tract added to store");
        self.tracts.insert(tract.geoid.clone(), tract);
        true
    }

    /// Number of tracts whose footprint is a loaded boundary
    pub fn boundary_len(&self) -> usize {
        self.footprints.values().filter(|f| f.is_boundary).count()
    }

    /// Insert a tract with explicit boundary geometry (projected meters)
    ///
    /// No-op when the GEOID is already present.
    pub fn insert_with_footprint(&mut self, tract: Tract, shape: impl Into<MultiPolygon<f64>>) -> bool {
        if self.tracts.contains_key(&tract.geoid) {
            return false;
        }
        let shape = shape.into();
        let area = shape.unsigned_area();
        if area > 0.0 {
            self.index_footprint(
                &tract.geoid,
                Footprint { shape, area, is_boundary: true },
            );
        }
        self.tracts.insert(tract.geoid.clone(), tract);
        true
    }

    /// Every indexed tract whose footprint overlaps `buffer` (projected
    /// meters), with its overlap fraction
    ///
    /// Candidates come from the R-tree; only those are clipped. Footprints
    /// entirely inside the buffer's inscribed circle skip the clip.
    pub fn tracts_intersecting(&self, buffer: &Polygon<f64>) -> Vec<TractOverlap<'_>> {
        let Some(query) = rect_envelope(buffer.bounding_rect()) else {
            return Vec::new();
        };
        let buffer_shape = MultiPolygon::new(vec![buffer.clone()]);

        // Largest disc around the buffer centroid that lies inside the buffer
        let inner = buffer
            .centroid()
            .filter(|c| buffer.contains(c))
            .map(|c| (c, c.euclidean_distance(buffer.exterior())));

        let mut overlaps = Vec::new();
        for entry in self.index.locate_with_selection_function(EnvelopeIntersects(query)) {
            let (Some(tract), Some(footprint)) =
                (self.tracts.get(&entry.geoid), self.footprints.get(&entry.geoid))
            else {
                continue;
            };

            let fully_inside = inner.map_or(false, |(center, radius)| {
                footprint
                    .shape
                    .iter()
                    .flat_map(|part| part.exterior().points())
                    .all(|p| p.euclidean_distance(&center) <= radius)
            });

            let intersection_area = if fully_inside {
                footprint.area
            } else {
                buffer_shape.intersection(&footprint.shape).unsigned_area()
            };

            if intersection_area <= 0.0 {
                continue;
            }

            overlaps.push(TractOverlap {
                tract,
                fraction: (intersection_area / footprint.area).clamp(0.0, 1.0),
                intersection_area,
            });
        }

        overlaps
    }

    /// WGS84 (x = lon, y = lat) shape into this store's projection
    fn project_boundary(&self, shape: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        let projection = &self.projection;
        shape.map_coords(|c| projection.project(c.y, c.x))
    }

    /// The tract's pending boundary if one was loaded, else its disc
    fn take_footprint(&mut self, tract: &Tract) -> Option<Footprint> {
        if let Some(shape) = self.boundaries.remove(&tract.geoid) {
            let area = shape.unsigned_area();
            if area > 0.0 {
                return Some(Footprint { shape, area, is_boundary: true });
            }
        }
        self.disc_footprint(tract)
    }

    fn disc_footprint(&self, tract: &Tract) -> Option<Footprint> {
        let centroid = tract.centroid?;
        let area = tract.area_sqm.filter(|a| *a > 0.0)?;
        let center: Coord<f64> = self.projection.project(centroid.lat, centroid.lon);
        let disc = equal_area_circle(center, radius_for_area(area), self.footprint_segments);
        let area = disc.unsigned_area();
        Some(Footprint {
            shape: MultiPolygon::new(vec![disc]),
            area,
            is_boundary: false,
        })
    }

    fn index_footprint(&mut self, geoid: &str, footprint: Footprint) {
        if let Some(envelope) = rect_envelope(footprint.shape.bounding_rect()) {
            self.index.insert(IndexedFootprint { geoid: geoid.to_string(), envelope });
            self.footprints.insert(geoid.to_string(), footprint);
        }
    }
}
