//! Finding the assets near a change polygon.
//!
//! Assets are held in an R-tree keyed by their WGS84 position. A query
//! expands the polygon's bounding box by the search radius, then measures
//! the geodesic distance from each candidate to the closest point of the
//! polygon (zero when the asset lies inside it).

use geo::{
    Bearing, BoundingRect, Centroid, Closest, ClosestPoint, Contains, Distance, Haversine, Point,
    Polygon, Rect, coord,
};
use georisk_risk_models::{AssetCriticality, AssetType};
use rstar::{AABB, RTree, RTreeObject};

use crate::engine::ScoringContext;

// Slightly under one haversine degree (~111.2 km) so search boxes over-cover.
const METERS_PER_DEGREE_LAT: f64 = 111_000.0;

/// An asset positioned for proximity analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetPoint {
    pub id: String,
    pub name: String,
    pub asset_type: AssetType,
    pub criticality: AssetCriticality,
    /// `(longitude, latitude)` in WGS84 degrees.
    pub location: Point<f64>,
    pub elevation_m: Option<f64>,
}

impl AssetPoint {
    /// Whether the coordinates are plausible WGS84 degrees.
    #[must_use]
    pub fn is_wgs84(&self) -> bool {
        let (lon, lat) = (self.location.x(), self.location.y());
        lon.is_finite()
            && lat.is_finite()
            && (-180.0..=180.0).contains(&lon)
            && (-90.0..=90.0).contains(&lat)
    }
}

struct AssetEntry {
    asset: AssetPoint,
}

impl RTreeObject for AssetEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.asset.location.x(), self.asset.location.y()])
    }
}

/// An asset within range of a change polygon.
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyAsset<'a> {
    pub asset: &'a AssetPoint,
    pub distance_m: f64,
    /// Bearing from the polygon centroid to the asset, `[0, 360)`.
    pub bearing_deg: Option<f64>,
}

/// Spatial index over the assets of a monitored area.
pub struct AssetIndex {
    tree: RTree<AssetEntry>,
}

impl AssetIndex {
    /// Builds the index. Overhead assets and assets whose coordinates are
    /// not WGS84 are left out.
    #[must_use]
    pub fn new(assets: impl IntoIterator<Item = AssetPoint>) -> Self {
        let entries: Vec<AssetEntry> = assets
            .into_iter()
            .filter(|asset| {
                if asset.asset_type.is_overhead() {
                    log::debug!("Skipping overhead asset {} for proximity", asset.id);
                    return false;
                }
                if !asset.is_wgs84() {
                    log::warn!(
                        "Skipping asset {} with non-WGS84 coordinates ({}, {})",
                        asset.id,
                        asset.location.x(),
                        asset.location.y()
                    );
                    return false;
                }
                true
            })
            .map(|asset| AssetEntry { asset })
            .collect();

        Self {
            tree: RTree::bulk_load(entries),
        }
    }

    /// Number of indexed assets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Assets within `radius_m` of the polygon, nearest first.
    #[must_use]
    pub fn within(&self, polygon: &Polygon<f64>, radius_m: f64) -> Vec<NearbyAsset<'_>> {
        let Some(rect) = polygon.bounding_rect() else {
            return Vec::new();
        };

        let bounds = search_bounds(rect, radius_m);
        let query = AABB::from_corners(
            [bounds.min().x, bounds.min().y],
            [bounds.max().x, bounds.max().y],
        );

        let centroid = polygon.centroid();

        let mut nearby: Vec<NearbyAsset<'_>> = self
            .tree
            .locate_in_envelope_intersecting(&query)
            .filter_map(|entry| {
                let distance_m = distance_to_polygon(polygon, entry.asset.location);
                (distance_m <= radius_m).then(|| NearbyAsset {
                    asset: &entry.asset,
                    distance_m,
                    bearing_deg: centroid.map(|c| Haversine.bearing(c, entry.asset.location)),
                })
            })
            .collect();

        nearby.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
        nearby
    }
}

/// Expands a WGS84 rectangle by `radius_m` on every side. The longitude
/// margin is sized for the rectangle's highest latitude, so the result
/// never under-covers.
#[must_use]
pub fn search_bounds(rect: Rect<f64>, radius_m: f64) -> Rect<f64> {
    let max_abs_lat = rect.min().y.abs().max(rect.max().y.abs()).min(89.0);
    let dlat = radius_m / METERS_PER_DEGREE_LAT;
    let dlon = radius_m / (METERS_PER_DEGREE_LAT * max_abs_lat.to_radians().cos());
    Rect::new(
        coord! { x: rect.min().x - dlon, y: rect.min().y - dlat },
        coord! { x: rect.max().x + dlon, y: rect.max().y + dlat },
    )
}

/// Geodesic distance in meters from a point to the closest point of a
/// polygon. Zero when the point is inside.
#[must_use]
pub fn distance_to_polygon(polygon: &Polygon<f64>, point: Point<f64>) -> f64 {
    if polygon.contains(&point) {
        return 0.0;
    }
    match polygon.closest_point(&point) {
        Closest::Intersection(_) => 0.0,
        Closest::SinglePoint(closest) => Haversine.distance(closest, point),
        Closest::Indeterminate => polygon
            .centroid()
            .map_or(f64::INFINITY, |c| Haversine.distance(c, point)),
    }
}

/// Builds the scoring context for one change/asset pair.
#[must_use]
pub fn scoring_context(
    polygon: &Polygon<f64>,
    change_elevation_m: Option<f64>,
    nearby: &NearbyAsset<'_>,
) -> ScoringContext {
    let latitude = polygon
        .centroid()
        .map_or_else(|| nearby.asset.location.y(), |c| c.y());

    ScoringContext {
        elevation_diff_m: change_elevation_m
            .zip(nearby.asset.elevation_m)
            .map(|(change, asset)| change - asset),
        bearing_to_asset_deg: nearby.bearing_deg,
        latitude,
    }
}
