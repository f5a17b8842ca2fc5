#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Change, land-cover and asset taxonomies plus the risk score breakdown.
//!
//! Every classification consumed by the scoring engine is a closed enum.
//! Numeric codes only exist at the edges (legacy API payloads, older
//! exports) and are decoded through [`ChangeType::from_code`] with an
//! explicit [`TaxonomyVersion`], never by ad hoc remapping.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Version of the numeric change-type code table.
///
/// `V1` predates landslide detection. `V2` inserted `LandslideDebris` at
/// code 6 and shifted the two codes after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaxonomyVersion {
    /// Original eight-entry table.
    V1,
    /// Current table with `LandslideDebris = 6`.
    V2,
}

impl TaxonomyVersion {
    /// The version new payloads are written with.
    pub const CURRENT: Self = Self::V2;
}

/// Error returned when a numeric taxonomy code has no mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownCodeError {
    /// The code that was provided.
    pub code: u8,
    /// The table it was looked up in.
    pub version: TaxonomyVersion,
}

impl std::fmt::Display for UnknownCodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown code {} in {:?} table", self.code, self.version)
    }
}

impl std::error::Error for UnknownCodeError {}

/// Classified type of a detected land-surface change.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    /// Change could not be classified.
    Unknown,
    /// Loss of vegetation cover (clearing, die-off).
    VegetationLoss,
    /// Growth of vegetation cover.
    VegetationGain,
    /// New built surfaces.
    UrbanExpansion,
    /// Flooding, drainage or shoreline change.
    WaterChange,
    /// Burned area.
    FireBurnScar,
    /// Landslide or debris flow, confirmed by the segmentation model.
    LandslideDebris,
    /// Vegetation stressed by drought.
    DroughtStress,
    /// Harvest, tillage or other agricultural cycle.
    AgriculturalChange,
}

impl ChangeType {
    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Unknown,
            Self::VegetationLoss,
            Self::VegetationGain,
            Self::UrbanExpansion,
            Self::WaterChange,
            Self::FireBurnScar,
            Self::LandslideDebris,
            Self::DroughtStress,
            Self::AgriculturalChange,
        ]
    }

    /// Numeric code of this variant in the current table.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::VegetationLoss => 1,
            Self::VegetationGain => 2,
            Self::UrbanExpansion => 3,
            Self::WaterChange => 4,
            Self::FireBurnScar => 5,
            Self::LandslideDebris => 6,
            Self::DroughtStress => 7,
            Self::AgriculturalChange => 8,
        }
    }

    /// Decodes a numeric change-type code written with the given table
    /// version.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownCodeError`] if the code is not part of that table.
    pub const fn from_code(code: u8, version: TaxonomyVersion) -> Result<Self, UnknownCodeError> {
        let decoded = match (version, code) {
            (_, 0) => Some(Self::Unknown),
            (_, 1) => Some(Self::VegetationLoss),
            (_, 2) => Some(Self::VegetationGain),
            (_, 3) => Some(Self::UrbanExpansion),
            (_, 4) => Some(Self::WaterChange),
            (_, 5) => Some(Self::FireBurnScar),
            (TaxonomyVersion::V1, 6) | (TaxonomyVersion::V2, 7) => Some(Self::DroughtStress),
            (TaxonomyVersion::V1, 7) | (TaxonomyVersion::V2, 8) => Some(Self::AgriculturalChange),
            (TaxonomyVersion::V2, 6) => Some(Self::LandslideDebris),
            _ => None,
        };

        match decoded {
            Some(change_type) => Ok(change_type),
            None => Err(UnknownCodeError { code, version }),
        }
    }

    /// Re-encodes a code from an older table into the current one.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownCodeError`] if the code is not part of `from`.
    pub const fn migrate_code(code: u8, from: TaxonomyVersion) -> Result<u8, UnknownCodeError> {
        match Self::from_code(code, from) {
            Ok(change_type) => Ok(change_type.code()),
            Err(e) => Err(e),
        }
    }

    /// Classifies a change from its mean NDVI delta alone, before any
    /// land-cover or landslide refinement.
    #[must_use]
    pub fn from_ndvi_delta(mean_ndvi_delta: f64) -> Self {
        if mean_ndvi_delta < -0.2 {
            Self::VegetationLoss
        } else if mean_ndvi_delta > 0.2 {
            Self::VegetationGain
        } else {
            Self::Unknown
        }
    }
}

/// `EuroSAT` land-cover classes produced by the land-cover classifier.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LandCoverClass {
    /// Seasonal cropland.
    AnnualCrop,
    /// Closed or open forest.
    Forest,
    /// Grass, shrub and other herbaceous cover.
    HerbaceousVegetation,
    /// Highways and other paved corridors.
    Highway,
    /// Industrial sites.
    Industrial,
    /// Grazing land.
    Pasture,
    /// Orchards and vineyards.
    PermanentCrop,
    /// Residential areas.
    Residential,
    /// Rivers and streams.
    River,
    /// Lakes and open sea.
    SeaLake,
}

impl LandCoverClass {
    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::AnnualCrop,
            Self::Forest,
            Self::HerbaceousVegetation,
            Self::Highway,
            Self::Industrial,
            Self::Pasture,
            Self::PermanentCrop,
            Self::Residential,
            Self::River,
            Self::SeaLake,
        ]
    }
}

/// How critical an asset is to the operator.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetCriticality {
    /// Loss is tolerable.
    Low,
    /// Default criticality.
    Medium,
    /// Loss disrupts service.
    High,
    /// Loss is unacceptable (substations, hospitals, dams).
    Critical,
}

impl AssetCriticality {
    /// Decodes the legacy numeric criticality (0 = Low … 3 = Critical).
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Low),
            1 => Some(Self::Medium),
            2 => Some(Self::High),
            3 => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Asset categories relevant to proximity analysis.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetType {
    /// Overhead transmission line (conductor geometry).
    TransmissionLine,
    /// Pole or tower supporting a line.
    SupportStructure,
    /// Substation or switching yard.
    Substation,
    /// Road, rail or bridge.
    Transport,
    /// Pipeline.
    Pipeline,
    /// Building or other structure.
    Building,
    /// Anything else.
    Other,
}

impl AssetType {
    /// Whether the asset is suspended above ground, so that ground-level
    /// change does not threaten it directly.
    #[must_use]
    pub const fn is_overhead(self) -> bool {
        matches!(self, Self::TransmissionLine)
    }
}

/// Risk level derived from a score by fixed bands.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    /// Score 0-24.
    Low,
    /// Score 25-49.
    Medium,
    /// Score 50-74.
    High,
    /// Score 75-100.
    Critical,
}

impl RiskLevel {
    /// Maps a score to its band. A score on a band boundary belongs to the
    /// higher band.
    #[must_use]
    pub const fn from_score(score: u8) -> Self {
        match score {
            0..=24 => Self::Low,
            25..=49 => Self::Medium,
            50..=74 => Self::High,
            _ => Self::Critical,
        }
    }

    /// Lowest score in this band.
    #[must_use]
    pub const fn min_score(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 25,
            Self::High => 50,
            Self::Critical => 75,
        }
    }

    /// Legacy numeric code (0 = Low … 3 = Critical).
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

/// What a single factor did to the score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Contribution {
    /// Points added to the base sum.
    Additive {
        /// Points awarded.
        points: u32,
        /// Budget for this factor.
        max_points: u32,
    },
    /// Multiplier applied to the base sum.
    Multiplier {
        /// The multiplier.
        value: f64,
        /// Score change attributed to this multiplier at the point it was
        /// applied. Informational only; the score is recomputed from
        /// `value`.
        delta_points: i32,
    },
}

/// One entry of a risk score breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringFactor {
    /// Display name (e.g. "Distance").
    pub name: String,
    /// Stable machine-readable code (e.g. `DISTANCE_LE_100M`).
    pub reason_code: String,
    /// Human-readable explanation.
    pub details: String,
    /// Points or multiplier.
    #[serde(flatten)]
    pub contribution: Contribution,
}

impl ScoringFactor {
    /// Creates an additive factor.
    #[must_use]
    pub fn additive(
        name: &str,
        points: u32,
        max_points: u32,
        reason_code: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            reason_code: reason_code.into(),
            details: details.into(),
            contribution: Contribution::Additive { points, max_points },
        }
    }

    /// Creates a multiplicative factor.
    #[must_use]
    pub fn multiplier(
        name: &str,
        value: f64,
        delta_points: i32,
        reason_code: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            reason_code: reason_code.into(),
            details: details.into(),
            contribution: Contribution::Multiplier {
                value,
                delta_points,
            },
        }
    }
}

/// Calculated risk score for one change polygon and one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    /// Final score, 0-100.
    pub score: u8,
    /// Band of `score`.
    pub level: RiskLevel,
    /// Ordered breakdown: additive factors first, then multipliers in the
    /// order they were applied.
    pub factors: Vec<ScoringFactor>,
}

impl RiskScore {
    /// Sum of all additive points in the breakdown.
    #[must_use]
    pub fn additive_total(&self) -> u32 {
        self.factors
            .iter()
            .map(|f| match f.contribution {
                Contribution::Additive { points, .. } => points,
                Contribution::Multiplier { .. } => 0,
            })
            .sum()
    }

    /// Product of all multipliers in the breakdown, in breakdown order.
    #[must_use]
    pub fn multiplier_product(&self) -> f64 {
        self.factors
            .iter()
            .fold(1.0, |product, f| match f.contribution {
                Contribution::Multiplier { value, .. } => product * value,
                Contribution::Additive { .. } => product,
            })
    }

    /// Recomputes the score from the breakdown alone.
    #[must_use]
    pub fn recompute(&self) -> u8 {
        combine(self.additive_total(), self.multiplier_product())
    }

    /// Looks up a factor by reason code prefix (e.g. `"LANDCOVER_"`).
    #[must_use]
    pub fn factor(&self, reason_prefix: &str) -> Option<&ScoringFactor> {
        self.factors
            .iter()
            .find(|f| f.reason_code.starts_with(reason_prefix))
    }
}

/// Final score arithmetic: the additive sum clamped to `[0, 100]`, times
/// the multiplier product, rounded and clamped to `[0, 100]`.
#[must_use]
pub fn combine(additive_total: u32, multiplier_product: f64) -> u8 {
    let base = f64::from(additive_total.min(100));
    let scaled = (base * multiplier_product).round().clamp(0.0, 100.0);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let score = scaled as u8;
    score
}
