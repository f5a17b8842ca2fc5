//! Tunable thresholds, caps and multipliers for the scoring engine.
//!
//! Every field has a default, so a `[scoring]` table only needs to name
//! the values it overrides.

use std::collections::BTreeMap;

use georisk_risk_models::{AssetCriticality, LandCoverClass};
use serde::{Deserialize, Serialize};

/// Errors from validating a [`ScoringConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ScoringConfigError {
    /// A value is outside the range the engine can work with.
    #[error("Invalid scoring config: {0}")]
    Invalid(String),
}

/// Distance factor: full points near the asset, linear decay to zero at
/// the search radius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistanceConfig {
    pub max_points: u32,
    pub full_points_within_m: f64,
    pub max_radius_m: f64,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        Self {
            max_points: 28,
            full_points_within_m: 100.0,
            max_radius_m: 2_500.0,
        }
    }
}

/// One NDVI severity band. A delta at or below `max_delta` earns `points`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdviBand {
    pub max_delta: f64,
    pub points: u32,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NdviConfig {
    pub max_points: u32,
    /// Ordered from most to least severe.
    pub bands: Vec<NdviBand>,
}

impl Default for NdviConfig {
    fn default() -> Self {
        let band = |max_delta, points, label: &str| NdviBand {
            max_delta,
            points,
            label: label.to_string(),
        };
        Self {
            max_points: 25,
            bands: vec![
                band(-0.5, 25, "SEVERE"),
                band(-0.4, 20, "STRONG"),
                band(-0.3, 15, "MODERATE"),
                band(-0.2, 10, "MILD"),
            ],
        }
    }
}

/// Area factor: logarithmic growth that reaches `max_points` at
/// `full_points_area_m2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AreaConfig {
    pub max_points: u32,
    pub min_area_m2: f64,
    pub scale_m2: f64,
    pub full_points_area_m2: f64,
}

impl Default for AreaConfig {
    fn default() -> Self {
        Self {
            max_points: 15,
            min_area_m2: 500.0,
            scale_m2: 5_000.0,
            full_points_area_m2: 50_000.0,
        }
    }
}

/// A slope tier. Slopes at or above `min_degrees` earn `points` before the
/// direction modifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlopeTier {
    pub min_degrees: f64,
    pub points: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlopeConfig {
    pub max_points: u32,
    /// Ordered from steepest to shallowest.
    pub tiers: Vec<SlopeTier>,
    /// Elevation difference (change minus asset) beyond which the change
    /// counts as up- or downslope.
    pub level_tolerance_m: f64,
    /// Angular tolerance of the bearing-versus-aspect test.
    pub upslope_bearing_tolerance_deg: f64,
    pub downslope_bearing_min_deg: f64,
    pub upslope_min_modifier: f64,
    pub upslope_max_modifier: f64,
    pub downslope_max_modifier: f64,
    pub downslope_min_modifier: f64,
    /// Elevation difference over which the modifiers reach their extremes.
    pub modifier_ramp_m: f64,
}

impl Default for SlopeConfig {
    fn default() -> Self {
        let tier = |min_degrees, points| SlopeTier {
            min_degrees,
            points,
        };
        Self {
            max_points: 20,
            tiers: vec![tier(30.0, 10), tier(20.0, 7), tier(15.0, 5), tier(10.0, 3)],
            level_tolerance_m: 5.0,
            upslope_bearing_tolerance_deg: 45.0,
            downslope_bearing_min_deg: 135.0,
            upslope_min_modifier: 1.5,
            upslope_max_modifier: 2.5,
            downslope_max_modifier: 0.9,
            downslope_min_modifier: 0.7,
            modifier_ramp_m: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AspectConfig {
    pub max_points: u32,
    /// `(max angular distance from equator-facing, points)`, ascending.
    pub bands: Vec<(f64, u32)>,
}

impl Default for AspectConfig {
    fn default() -> Self {
        Self {
            max_points: 5,
            bands: vec![(22.5, 5), (45.0, 4), (67.5, 2), (112.5, 1)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LandslideConfig {
    pub base_multiplier: f64,
    pub upslope_bonus: f64,
    pub max_multiplier: f64,
    /// Landslide multiplier only applies to changes steeper than this.
    pub min_slope_degrees: f64,
}

impl Default for LandslideConfig {
    fn default() -> Self {
        Self {
            base_multiplier: 1.8,
            upslope_bonus: 0.5,
            max_multiplier: 2.5,
            min_slope_degrees: 10.0,
        }
    }
}

/// Full scoring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub distance: DistanceConfig,
    pub ndvi: NdviConfig,
    pub area: AreaConfig,
    pub slope: SlopeConfig,
    pub aspect: AspectConfig,
    pub landslide: LandslideConfig,
    pub land_cover_multipliers: BTreeMap<LandCoverClass, f64>,
    pub criticality_multipliers: BTreeMap<AssetCriticality, f64>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            distance: DistanceConfig::default(),
            ndvi: NdviConfig::default(),
            area: AreaConfig::default(),
            slope: SlopeConfig::default(),
            aspect: AspectConfig::default(),
            landslide: LandslideConfig::default(),
            land_cover_multipliers: default_land_cover_multipliers(),
            criticality_multipliers: default_criticality_multipliers(),
        }
    }
}

fn default_land_cover_multipliers() -> BTreeMap<LandCoverClass, f64> {
    BTreeMap::from([
        (LandCoverClass::Forest, 1.0),
        (LandCoverClass::Residential, 0.9),
        (LandCoverClass::HerbaceousVegetation, 0.85),
        (LandCoverClass::River, 0.8),
        (LandCoverClass::PermanentCrop, 0.75),
        (LandCoverClass::Pasture, 0.7),
        (LandCoverClass::Industrial, 0.5),
        (LandCoverClass::SeaLake, 0.4),
        (LandCoverClass::AnnualCrop, 0.3),
        (LandCoverClass::Highway, 0.25),
    ])
}

fn default_criticality_multipliers() -> BTreeMap<AssetCriticality, f64> {
    BTreeMap::from([
        (AssetCriticality::Low, 1.0),
        (AssetCriticality::Medium, 1.25),
        (AssetCriticality::High, 1.5),
        (AssetCriticality::Critical, 2.0),
    ])
}

impl ScoringConfig {
    /// Multiplier for a land-cover class. Classes missing from the table
    /// are neutral.
    #[must_use]
    pub fn land_cover_multiplier(&self, class: LandCoverClass) -> f64 {
        self.land_cover_multipliers
            .get(&class)
            .copied()
            .unwrap_or(1.0)
    }

    /// Multiplier for an asset criticality. Missing entries are neutral.
    #[must_use]
    pub fn criticality_multiplier(&self, criticality: AssetCriticality) -> f64 {
        self.criticality_multipliers
            .get(&criticality)
            .copied()
            .unwrap_or(1.0)
    }

    /// Checks that the configuration describes a usable scoring model.
    ///
    /// # Errors
    ///
    /// Returns [`ScoringConfigError::Invalid`] if a radius or scale is not
    /// positive, a band table is out of order, or a tier awards more than
    /// its factor budget.
    pub fn validate(&self) -> Result<(), ScoringConfigError> {
        let invalid = |msg: String| Err(ScoringConfigError::Invalid(msg));

        if self.distance.max_radius_m <= self.distance.full_points_within_m {
            return invalid(format!(
                "distance.max_radius_m ({}) must exceed distance.full_points_within_m ({})",
                self.distance.max_radius_m, self.distance.full_points_within_m
            ));
        }
        if self.area.scale_m2 <= 0.0 || self.area.full_points_area_m2 <= 0.0 {
            return invalid("area.scale_m2 and area.full_points_area_m2 must be positive".into());
        }
        if self.slope.modifier_ramp_m <= 0.0 {
            return invalid("slope.modifier_ramp_m must be positive".into());
        }
        if self.slope.upslope_min_modifier > self.slope.upslope_max_modifier {
            return invalid("slope upslope modifiers are inverted".into());
        }
        if self.slope.downslope_min_modifier > self.slope.downslope_max_modifier {
            return invalid("slope downslope modifiers are inverted".into());
        }

        if !self
            .ndvi
            .bands
            .windows(2)
            .all(|w| w[0].max_delta < w[1].max_delta && w[0].points >= w[1].points)
        {
            return invalid("ndvi.bands must be ordered from most to least severe".into());
        }
        if let Some(band) = self.ndvi.bands.iter().find(|b| b.points > self.ndvi.max_points) {
            return invalid(format!(
                "ndvi band {} awards {} points, over the {} point budget",
                band.label, band.points, self.ndvi.max_points
            ));
        }

        if !self
            .slope
            .tiers
            .windows(2)
            .all(|w| w[0].min_degrees > w[1].min_degrees)
        {
            return invalid("slope.tiers must be ordered from steepest to shallowest".into());
        }
        if !self.aspect.bands.windows(2).all(|w| w[0].0 < w[1].0) {
            return invalid("aspect.bands must be in ascending order".into());
        }
        if self
            .aspect
            .bands
            .iter()
            .any(|(_, points)| *points > self.aspect.max_points)
        {
            return invalid("aspect band over its point budget".into());
        }

        if self.landslide.base_multiplier > self.landslide.max_multiplier {
            return invalid("landslide.base_multiplier exceeds landslide.max_multiplier".into());
        }

        let negative = self
            .land_cover_multipliers
            .values()
            .chain(self.criticality_multipliers.values())
            .any(|m| *m < 0.0);
        if negative {
            return invalid("multipliers must not be negative".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ScoringConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: ScoringConfig = toml::from_str(
            r"
            [distance]
            max_radius_m = 5000.0

            [criticality_multipliers]
            CRITICAL = 3.0
            ",
        )
        .unwrap();

        assert!((config.distance.max_radius_m - 5_000.0).abs() < f64::EPSILON);
        assert_eq!(config.distance.max_points, 28);
        assert!((config.criticality_multiplier(AssetCriticality::Critical) - 3.0).abs() < 1e-12);
        // A replaced table only holds what was written.
        assert!((config.criticality_multiplier(AssetCriticality::High) - 1.0).abs() < 1e-12);
        assert_eq!(config.ndvi.bands.len(), 4);
    }

    #[test]
    fn rejects_radius_inside_full_points_zone() {
        let mut config = ScoringConfig::default();
        config.distance.max_radius_m = 50.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unordered_ndvi_bands() {
        let mut config = ScoringConfig::default();
        config.ndvi.bands.reverse();
        assert!(config.validate().is_err());
    }
}
