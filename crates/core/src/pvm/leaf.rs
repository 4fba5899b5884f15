//! Leaf decomposition.
//!
//! For one leaf between baseline `(p0, v0)` and current `(p1, v1)`:
//!
//! - `cross  = (p1 - p0) * (v1 - v0)`
//! - `price  = (p1 - p0) * v0` plus the cross term under [`CrossTermPolicy::Price`]
//! - `volume = (v1 - v0) * p0` plus the cross term under [`CrossTermPolicy::Volume`]
//!
//! `price + volume == p1 * v1 - p0 * v0` holds exactly for every leaf.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::metric::{EntityId, LeafObservation, ObservationStore};
use crate::domain::period::PeriodPair;
use crate::domain::result::DiagnosticFlag;
use crate::errors::{DecimalOverflow, LeafIssue, MetricError};

/// Where the price/volume interaction term is attributed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossTermPolicy {
    #[default]
    Price,
    Volume,
}

impl FromStr for CrossTermPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "price" => Ok(Self::Price),
            "volume" => Ok(Self::Volume),
            other => Err(format!("unsupported cross term policy `{other}` (expected price|volume)")),
        }
    }
}

impl CrossTermPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Volume => "volume",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafEffects {
    pub price_effect: Decimal,
    pub volume_effect: Decimal,
    pub flags: BTreeSet<DiagnosticFlag>,
}

pub trait LeafDecomposer: Send + Sync {
    /// Fails only when an intermediate product leaves the decimal range.
    fn decompose(&self, observation: &LeafObservation) -> Result<LeafEffects, DecimalOverflow>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StandardLeafDecomposer {
    policy: CrossTermPolicy,
}

impl StandardLeafDecomposer {
    pub fn new(policy: CrossTermPolicy) -> Self {
        Self { policy }
    }
}

impl LeafDecomposer for StandardLeafDecomposer {
    fn decompose(&self, observation: &LeafObservation) -> Result<LeafEffects, DecimalOverflow> {
        decompose_leaf(observation, self.policy)
    }
}

pub fn decompose_leaf(
    observation: &LeafObservation,
    policy: CrossTermPolicy,
) -> Result<LeafEffects, DecimalOverflow> {
    let LeafObservation { price_baseline, volume_baseline, price_current, volume_current, .. } =
        *observation;

    let entering = volume_baseline.is_zero() && !volume_current.is_zero();
    let exiting = volume_current.is_zero() && !volume_baseline.is_zero();

    if entering || exiting {
        let flag =
            if entering { DiagnosticFlag::NewEntity } else { DiagnosticFlag::DiscontinuedEntity };
        return Ok(LeafEffects {
            price_effect: Decimal::ZERO,
            volume_effect: checked(
                observation.revenue_current().checked_sub(observation.revenue_baseline()),
            )?,
            flags: BTreeSet::from([flag]),
        });
    }

    // Both inputs of each delta are non-negative, so the deltas cannot overflow.
    // `delta_p * v0 + cross` is taken as the single product `delta_p * v1` (and
    // likewise on the volume side), which overflows only when the effect itself does.
    let price_delta = price_current - price_baseline;
    let volume_delta = volume_current - volume_baseline;
    let (price_effect, volume_effect) = match policy {
        CrossTermPolicy::Price => (
            checked(price_delta.checked_mul(volume_current))?,
            checked(volume_delta.checked_mul(price_baseline))?,
        ),
        CrossTermPolicy::Volume => (
            checked(price_delta.checked_mul(volume_baseline))?,
            checked(volume_delta.checked_mul(price_current))?,
        ),
    };

    Ok(LeafEffects { price_effect, volume_effect, flags: BTreeSet::new() })
}

fn checked(value: Option<Decimal>) -> Result<Decimal, DecimalOverflow> {
    value.ok_or(DecimalOverflow)
}

/// A decomposed leaf together with the observation it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafComputation {
    pub observation: LeafObservation,
    pub effects: LeafEffects,
}

/// Per-entity outcome of the leaf pass, shared by every view.
pub type LeafTable = BTreeMap<EntityId, Result<LeafComputation, LeafIssue>>;

/// Decomposes each entity once. Entities are independent, so the pass fans out
/// across the rayon pool when `parallel` is set; the table is ordered either way.
pub fn decompose_leaves<D>(
    decomposer: &D,
    store: &ObservationStore,
    periods: &PeriodPair,
    entities: &BTreeSet<EntityId>,
    parallel: bool,
) -> LeafTable
where
    D: LeafDecomposer + ?Sized,
{
    let compute = |entity: &EntityId| {
        let outcome = store.observation(entity, periods).and_then(|observation| {
            let effects = decomposer.decompose(&observation).map_err(|DecimalOverflow| {
                LeafIssue::InvalidMetric(MetricError::Overflow {
                    entity: entity.clone(),
                    quantity: "price/volume effects".to_string(),
                })
            })?;
            Ok(LeafComputation { observation, effects })
        });
        (entity.clone(), outcome)
    };

    if parallel {
        entities.par_iter().map(compute).collect()
    } else {
        entities.iter().map(compute).collect()
    }
}
