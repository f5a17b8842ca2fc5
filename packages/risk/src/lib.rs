#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Risk scoring of detected land-surface changes.
//!
//! [`RiskScorer::score`] is a pure function of a change polygon's
//! features, the asset's criticality, the distance between them and their
//! terrain relation. [`AssetIndex`] finds the assets a polygon should be
//! scored against.

pub mod config;
pub mod engine;
pub mod proximity;

pub use config::{ScoringConfig, ScoringConfigError};
pub use engine::{ChangeFeatures, RiskScorer, ScoringContext, TerrainRelation, angular_distance};
pub use proximity::{
    AssetIndex, AssetPoint, NearbyAsset, distance_to_polygon, scoring_context, search_bounds,
};
