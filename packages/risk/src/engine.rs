//! The scoring function.
//!
//! Five additive factors (distance, NDVI drop, area, slope with direction,
//! aspect) are summed and clamped to `[0, 100]`, then land-cover,
//! criticality and landslide multipliers are applied in that order. The
//! returned breakdown is sufficient to recompute the score.

use georisk_risk_models::{
    AssetCriticality, ChangeType, Contribution, LandCoverClass, RiskLevel, RiskScore,
    ScoringFactor, combine,
};

use crate::config::ScoringConfig;

/// Scoring-relevant attributes of a detected change polygon.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFeatures {
    /// Mean NDVI delta (after minus before). Negative means vegetation loss.
    pub mean_ndvi_delta: f64,
    pub area_m2: f64,
    pub change_type: ChangeType,
    pub mean_slope_degrees: Option<f64>,
    /// Downhill-facing azimuth of the terrain, degrees clockwise from north.
    pub aspect_degrees: Option<f64>,
    pub land_cover: Option<LandCoverClass>,
    pub ml_confidence: Option<f64>,
}

/// Spatial relation between the change and the asset being scored.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScoringContext {
    /// Change elevation minus asset elevation, when both are known.
    pub elevation_diff_m: Option<f64>,
    /// Bearing from the change centroid to the asset.
    pub bearing_to_asset_deg: Option<f64>,
    /// Latitude of the change, used to pick the equator-facing azimuth.
    pub latitude: f64,
}

/// Whether the change sits above or below the asset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TerrainRelation {
    /// Above the asset. `elevation_diff_m` is `None` when only the bearing
    /// test was available.
    Upslope { elevation_diff_m: Option<f64> },
    Downslope { elevation_diff_m: Option<f64> },
    Level,
    Unknown,
}

impl TerrainRelation {
    #[must_use]
    pub const fn is_upslope(self) -> bool {
        matches!(self, Self::Upslope { .. })
    }

    const fn suffix(self) -> &'static str {
        match self {
            Self::Upslope { .. } => "UPSLOPE",
            Self::Downslope { .. } => "DOWNSLOPE",
            Self::Level => "LEVEL",
            Self::Unknown => "UNKNOWN_DIRECTION",
        }
    }
}

/// Smallest angle between two azimuths, in `[0, 180]`.
#[must_use]
pub fn angular_distance(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(360.0);
    if diff > 180.0 { 360.0 - diff } else { diff }
}

fn round_points(value: f64) -> u32 {
    let rounded = value.round().max(0.0);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let points = rounded as u32;
    points
}

/// Stateless risk scorer. Cheap to clone and safe to share across threads.
#[derive(Debug, Clone, Default)]
pub struct RiskScorer {
    config: ScoringConfig,
}

impl RiskScorer {
    #[must_use]
    pub const fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Scores one change against one asset.
    ///
    /// Missing optional inputs omit their factor instead of scoring zero.
    /// The land-cover multiplier is omitted when the change is
    /// unclassified; the landslide multiplier only appears for landslide
    /// debris on slopes steeper than the configured threshold.
    #[must_use]
    pub fn score(
        &self,
        change: &ChangeFeatures,
        criticality: AssetCriticality,
        distance_m: f64,
        context: &ScoringContext,
    ) -> RiskScore {
        let relation = self.terrain_relation(change, context);

        let mut factors = Vec::with_capacity(8);
        factors.push(self.distance_factor(distance_m));
        factors.push(self.ndvi_factor(change.mean_ndvi_delta));
        factors.push(self.area_factor(change.area_m2));
        if let Some(slope) = change.mean_slope_degrees {
            factors.push(self.slope_factor(slope, relation));
        }
        if let Some(aspect) = change.aspect_degrees {
            factors.push(self.aspect_factor(aspect, context.latitude));
        }

        let additive: u32 = factors
            .iter()
            .map(|f| match f.contribution {
                Contribution::Additive { points, .. } => points,
                Contribution::Multiplier { .. } => 0,
            })
            .sum();

        let mut product = 1.0;
        let mut push_multiplier = |name: &str, value: f64, reason: String, details: String| {
            let before = i32::from(combine(additive, product));
            product *= value;
            let after = i32::from(combine(additive, product));
            factors.push(ScoringFactor::multiplier(
                name,
                value,
                after - before,
                reason,
                details,
            ));
        };

        if let Some(class) = change.land_cover {
            let value = self.config.land_cover_multiplier(class);
            push_multiplier(
                "Land Cover",
                value,
                format!("LANDCOVER_{}", class.as_ref()),
                format!("Land cover {class}: x{value:.2}"),
            );
        }

        let value = self.config.criticality_multiplier(criticality);
        push_multiplier(
            "Asset Criticality",
            value,
            format!("CRITICALITY_{}", criticality.as_ref()),
            format!("{criticality} criticality asset: x{value:.2}"),
        );

        if let Some(multiplier) = self.landslide_multiplier(change, relation) {
            let confidence = change
                .ml_confidence
                .map_or_else(String::new, |c| format!(" (confidence {:.0}%)", c * 100.0));
            let (reason, details) = if relation.is_upslope() {
                (
                    "LANDSLIDE_UPSLOPE",
                    format!("Landslide debris upslope of asset{confidence}: x{multiplier:.2}"),
                )
            } else {
                (
                    "LANDSLIDE_DETECTED",
                    format!("Landslide debris detected{confidence}: x{multiplier:.2}"),
                )
            };
            push_multiplier("Landslide", multiplier, reason.to_string(), details);
        }

        let score = combine(additive, product);
        RiskScore {
            score,
            level: RiskLevel::from_score(score),
            factors,
        }
    }

    /// Classifies the change as up-, down- or level with the asset.
    ///
    /// Elevation difference wins when present. Otherwise the bearing from
    /// the change to the asset is compared with the downhill aspect: an
    /// asset lying downhill of the change means the change is upslope.
    #[must_use]
    pub fn terrain_relation(
        &self,
        change: &ChangeFeatures,
        context: &ScoringContext,
    ) -> TerrainRelation {
        let slope = &self.config.slope;

        if let Some(diff) = context.elevation_diff_m {
            return if diff > slope.level_tolerance_m {
                TerrainRelation::Upslope {
                    elevation_diff_m: Some(diff),
                }
            } else if diff < -slope.level_tolerance_m {
                TerrainRelation::Downslope {
                    elevation_diff_m: Some(diff),
                }
            } else {
                TerrainRelation::Level
            };
        }

        match (context.bearing_to_asset_deg, change.aspect_degrees) {
            (Some(bearing), Some(aspect)) => {
                let delta = angular_distance(bearing, aspect);
                if delta <= slope.upslope_bearing_tolerance_deg {
                    TerrainRelation::Upslope {
                        elevation_diff_m: None,
                    }
                } else if delta >= slope.downslope_bearing_min_deg {
                    TerrainRelation::Downslope {
                        elevation_diff_m: None,
                    }
                } else {
                    TerrainRelation::Level
                }
            }
            _ => TerrainRelation::Unknown,
        }
    }

    fn distance_factor(&self, distance_m: f64) -> ScoringFactor {
        let cfg = &self.config.distance;
        let max = f64::from(cfg.max_points);
        if !distance_m.is_finite() {
            return ScoringFactor::additive(
                "Distance",
                0,
                cfg.max_points,
                "DISTANCE_FAR",
                "Distance unavailable",
            );
        }
        let distance_m = distance_m.max(0.0);

        let points = if distance_m <= cfg.full_points_within_m {
            cfg.max_points
        } else if distance_m >= cfg.max_radius_m {
            0
        } else {
            let remaining = (cfg.max_radius_m - distance_m)
                / (cfg.max_radius_m - cfg.full_points_within_m);
            round_points(max * remaining).min(cfg.max_points)
        };

        let reason = if distance_m <= 100.0 {
            "DISTANCE_LE_100M"
        } else if distance_m < 500.0 {
            "DISTANCE_LT_500M"
        } else if distance_m < 1_000.0 {
            "DISTANCE_LT_1KM"
        } else if distance_m < 2_500.0 {
            "DISTANCE_LT_2_5KM"
        } else if distance_m < cfg.max_radius_m {
            "DISTANCE_WITHIN_RADIUS"
        } else {
            "DISTANCE_FAR"
        };

        ScoringFactor::additive(
            "Distance",
            points,
            cfg.max_points,
            reason,
            format!("{distance_m:.0}m from asset"),
        )
    }

    fn ndvi_factor(&self, mean_ndvi_delta: f64) -> ScoringFactor {
        let cfg = &self.config.ndvi;
        let band = cfg.bands.iter().find(|b| mean_ndvi_delta <= b.max_delta);

        let (points, label) = band.map_or((0, "MINIMAL"), |b| (b.points, b.label.as_str()));

        ScoringFactor::additive(
            "NDVI Drop",
            points.min(cfg.max_points),
            cfg.max_points,
            format!("NDVI_DROP_{label}"),
            format!("Mean NDVI change {mean_ndvi_delta:+.2}"),
        )
    }

    fn area_factor(&self, area_m2: f64) -> ScoringFactor {
        let cfg = &self.config.area;
        let points = if area_m2 < cfg.min_area_m2 {
            0
        } else {
            let full = (1.0 + cfg.full_points_area_m2 / cfg.scale_m2).ln();
            let raw = f64::from(cfg.max_points) * (1.0 + area_m2 / cfg.scale_m2).ln() / full;
            round_points(raw).min(cfg.max_points)
        };

        let reason = if area_m2 >= 50_000.0 {
            "AREA_GE_50000M2"
        } else if area_m2 >= 10_000.0 {
            "AREA_GE_10000M2"
        } else if area_m2 >= 5_000.0 {
            "AREA_GE_5000M2"
        } else if area_m2 >= cfg.min_area_m2 {
            "AREA_GE_MIN"
        } else {
            "AREA_SMALL"
        };

        ScoringFactor::additive(
            "Area",
            points,
            cfg.max_points,
            reason,
            format!("Area {area_m2:.0} m²"),
        )
    }

    /// Direction modifier for the slope sub-score.
    #[must_use]
    pub fn slope_modifier(&self, relation: TerrainRelation) -> f64 {
        let cfg = &self.config.slope;
        match relation {
            TerrainRelation::Upslope { elevation_diff_m } => {
                let span = cfg.upslope_max_modifier - cfg.upslope_min_modifier;
                let ramp = elevation_diff_m.map_or(0.0, |d| (d.abs() / cfg.modifier_ramp_m).min(1.0));
                cfg.upslope_min_modifier + span * ramp
            }
            TerrainRelation::Downslope { elevation_diff_m } => {
                let span = cfg.downslope_max_modifier - cfg.downslope_min_modifier;
                let ramp = elevation_diff_m.map_or(0.0, |d| (d.abs() / cfg.modifier_ramp_m).min(1.0));
                cfg.downslope_max_modifier - span * ramp
            }
            TerrainRelation::Level | TerrainRelation::Unknown => 1.0,
        }
    }

    fn slope_factor(&self, slope_degrees: f64, relation: TerrainRelation) -> ScoringFactor {
        let cfg = &self.config.slope;
        let tier = cfg.tiers.iter().find(|t| slope_degrees >= t.min_degrees);

        let base = tier.map_or(0, |t| t.points);
        let modifier = self.slope_modifier(relation);
        let points = round_points(f64::from(base) * modifier).min(cfg.max_points);

        let tier_code = tier.map_or_else(
            || "SLOPE_FLAT".to_string(),
            |t| format!("SLOPE_GE_{:.0}", t.min_degrees),
        );

        ScoringFactor::additive(
            "Slope",
            points,
            cfg.max_points,
            format!("{tier_code}_{}", relation.suffix()),
            format!(
                "{slope_degrees:.1}° slope, {} of asset: {base} pts x{modifier:.2}",
                relation.suffix().to_lowercase().replace('_', " ")
            ),
        )
    }

    fn aspect_factor(&self, aspect_degrees: f64, latitude: f64) -> ScoringFactor {
        let cfg = &self.config.aspect;
        let equator_facing = if latitude >= 0.0 { 180.0 } else { 0.0 };
        let delta = angular_distance(aspect_degrees, equator_facing);

        let points = cfg
            .bands
            .iter()
            .find(|(max_delta, _)| delta <= *max_delta)
            .map_or(0, |(_, points)| *points)
            .min(cfg.max_points);

        let reason = match points {
            p if p >= cfg.max_points => "ASPECT_EQUATOR_FACING",
            0 => "ASPECT_POLE_FACING",
            _ => "ASPECT_PARTIAL",
        };

        ScoringFactor::additive(
            "Aspect",
            points,
            cfg.max_points,
            reason,
            format!("Aspect {aspect_degrees:.0}°, {delta:.0}° from equator-facing"),
        )
    }

    fn landslide_multiplier(&self, change: &ChangeFeatures, relation: TerrainRelation) -> Option<f64> {
        let cfg = &self.config.landslide;
        if change.change_type != ChangeType::LandslideDebris {
            return None;
        }
        let slope = change.mean_slope_degrees?;
        if slope <= cfg.min_slope_degrees {
            return None;
        }

        let bonus = if relation.is_upslope() {
            cfg.upslope_bonus
        } else {
            0.0
        };
        Some((cfg.base_multiplier + bonus).min(cfg.max_multiplier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn severe_change() -> ChangeFeatures {
        ChangeFeatures {
            mean_ndvi_delta: -0.6,
            area_m2: 20_000.0,
            change_type: ChangeType::VegetationLoss,
            mean_slope_degrees: Some(35.0),
            aspect_degrees: None,
            land_cover: None,
            ml_confidence: None,
        }
    }

    fn points(score: &RiskScore, name: &str) -> Option<u32> {
        score.factors.iter().find(|f| f.name == name).and_then(|f| match f.contribution {
            Contribution::Additive { points, .. } => Some(points),
            Contribution::Multiplier { .. } => None,
        })
    }

    #[test]
    fn severe_upslope_change_without_ml_data() {
        let scorer = RiskScorer::default();
        let context = ScoringContext {
            elevation_diff_m: Some(60.0),
            bearing_to_asset_deg: None,
            latitude: 45.0,
        };

        let score = scorer.score(&severe_change(), AssetCriticality::Low, 50.0, &context);

        assert_eq!(points(&score, "Distance"), Some(28));
        assert_eq!(points(&score, "NDVI Drop"), Some(25));
        assert_eq!(points(&score, "Area"), Some(10));
        // 10 base points x2.1 modifier, capped at the 20 point budget
        assert_eq!(points(&score, "Slope"), Some(20));
        assert_eq!(points(&score, "Aspect"), None);

        assert!(score.factor("LANDCOVER_").is_none());
        assert!(score.factor("LANDSLIDE_").is_none());
        assert_eq!(score.additive_total(), 83);
        assert_eq!(score.score, 83);
        assert_eq!(score.level, RiskLevel::Critical);
        assert_eq!(score.recompute(), score.score);
    }

    #[test]
    fn bearing_only_upslope_uses_minimum_modifier() {
        let scorer = RiskScorer::default();
        let mut change = severe_change();
        change.aspect_degrees = Some(90.0);
        let context = ScoringContext {
            elevation_diff_m: None,
            bearing_to_asset_deg: Some(100.0),
            latitude: 45.0,
        };

        assert_eq!(
            scorer.terrain_relation(&change, &context),
            TerrainRelation::Upslope {
                elevation_diff_m: None
            }
        );
        let score = scorer.score(&change, AssetCriticality::Low, 50.0, &context);
        assert_eq!(points(&score, "Slope"), Some(15));
        assert_eq!(score.factor("SLOPE_").unwrap().reason_code, "SLOPE_GE_30_UPSLOPE");
    }

    #[test]
    fn downslope_dampens_slope_points() {
        let scorer = RiskScorer::default();
        let context = ScoringContext {
            elevation_diff_m: Some(-100.0),
            bearing_to_asset_deg: None,
            latitude: 45.0,
        };
        let score = scorer.score(&severe_change(), AssetCriticality::Low, 50.0, &context);
        assert_eq!(points(&score, "Slope"), Some(7));
    }

    #[test]
    fn missing_slope_omits_slope_factor() {
        let scorer = RiskScorer::default();
        let mut change = severe_change();
        change.mean_slope_degrees = None;
        let score = scorer.score(&change, AssetCriticality::Medium, 50.0, &ScoringContext::default());
        assert!(score.factor("SLOPE_").is_none());
        assert_eq!(score.recompute(), score.score);
    }

    #[test]
    fn multipliers_apply_in_fixed_order() {
        let scorer = RiskScorer::default();
        let mut change = severe_change();
        change.change_type = ChangeType::LandslideDebris;
        change.land_cover = Some(LandCoverClass::AnnualCrop);
        change.ml_confidence = Some(0.92);
        let context = ScoringContext {
            elevation_diff_m: Some(20.0),
            bearing_to_asset_deg: None,
            latitude: 45.0,
        };

        let score = scorer.score(&change, AssetCriticality::High, 400.0, &context);
        let multipliers: Vec<_> = score
            .factors
            .iter()
            .filter(|f| matches!(f.contribution, Contribution::Multiplier { .. }))
            .map(|f| f.reason_code.as_str())
            .collect();

        assert_eq!(
            multipliers,
            ["LANDCOVER_ANNUAL_CROP", "CRITICALITY_HIGH", "LANDSLIDE_UPSLOPE"]
        );
        let landslide = score.factor("LANDSLIDE_").unwrap();
        assert!(
            matches!(landslide.contribution, Contribution::Multiplier { value, .. } if (value - 2.3).abs() < 1e-12)
        );
        assert_eq!(score.recompute(), score.score);
    }

    #[test]
    fn landslide_requires_steep_slope() {
        let scorer = RiskScorer::default();
        let mut change = severe_change();
        change.change_type = ChangeType::LandslideDebris;
        change.mean_slope_degrees = Some(8.0);
        let score = scorer.score(&change, AssetCriticality::Low, 50.0, &ScoringContext::default());
        assert!(score.factor("LANDSLIDE_").is_none());
    }

    #[test]
    fn aspect_prefers_equator_facing_slopes_per_hemisphere() {
        let scorer = RiskScorer::default();
        let mut change = severe_change();
        change.aspect_degrees = Some(180.0);

        let north = ScoringContext {
            latitude: 45.0,
            ..ScoringContext::default()
        };
        let south = ScoringContext {
            latitude: -33.0,
            ..ScoringContext::default()
        };

        let score = scorer.score(&change, AssetCriticality::Low, 1_000.0, &north);
        assert_eq!(points(&score, "Aspect"), Some(5));
        let score = scorer.score(&change, AssetCriticality::Low, 1_000.0, &south);
        assert_eq!(points(&score, "Aspect"), Some(0));
    }

    #[test]
    fn distance_decays_to_zero_at_radius() {
        let scorer = RiskScorer::default();
        let change = severe_change();
        let ctx = ScoringContext::default();

        assert_eq!(points(&scorer.score(&change, AssetCriticality::Low, 100.0, &ctx), "Distance"), Some(28));
        assert_eq!(points(&scorer.score(&change, AssetCriticality::Low, 1_300.0, &ctx), "Distance"), Some(14));
        let far = scorer.score(&change, AssetCriticality::Low, 2_500.0, &ctx);
        assert_eq!(points(&far, "Distance"), Some(0));
        assert_eq!(far.factor("DISTANCE_").unwrap().reason_code, "DISTANCE_FAR");
    }

    #[test]
    fn non_finite_distance_scores_nothing() {
        let scorer = RiskScorer::default();
        let change = severe_change();
        let ctx = ScoringContext::default();

        for distance in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let score = scorer.score(&change, AssetCriticality::Low, distance, &ctx);
            assert_eq!(points(&score, "Distance"), Some(0), "{distance}");
            assert_eq!(score.factor("DISTANCE_").unwrap().reason_code, "DISTANCE_FAR");
        }
    }

    #[test]
    fn angular_distance_wraps() {
        assert!((angular_distance(350.0, 10.0) - 20.0).abs() < 1e-9);
        assert!((angular_distance(0.0, 180.0) - 180.0).abs() < 1e-9);
        assert!((angular_distance(-90.0, 90.0) - 180.0).abs() < 1e-9);
    }
}
