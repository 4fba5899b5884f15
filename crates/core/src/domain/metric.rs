use std::collections::BTreeMap;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::period::{PeriodId, PeriodPair};
use crate::errors::{DecimalOverflow, LeafIssue, MetricError};

/// Finest-grained measured unit, e.g. one SKU sold in one geography.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One price/volume observation. Revenue is always derived, never supplied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafMetric {
    pub entity_id: EntityId,
    pub period_id: PeriodId,
    pub price: Decimal,
    pub volume: Decimal,
}

impl LeafMetric {
    pub fn new(
        entity_id: impl Into<String>,
        period_id: impl Into<String>,
        price: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            entity_id: EntityId(entity_id.into()),
            period_id: PeriodId(period_id.into()),
            price,
            volume,
        }
    }
}

/// Validated baseline/current pair for a single leaf. Revenue for both periods
/// is computed once on construction, so a built observation always fits the
/// decimal range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeafObservation {
    pub price_baseline: Decimal,
    pub volume_baseline: Decimal,
    pub price_current: Decimal,
    pub volume_current: Decimal,
    revenue_baseline: Decimal,
    revenue_current: Decimal,
}

impl LeafObservation {
    pub fn new(
        price_baseline: Decimal,
        volume_baseline: Decimal,
        price_current: Decimal,
        volume_current: Decimal,
    ) -> Result<Self, DecimalOverflow> {
        let revenue_baseline = price_baseline.checked_mul(volume_baseline).ok_or(DecimalOverflow)?;
        let revenue_current = price_current.checked_mul(volume_current).ok_or(DecimalOverflow)?;
        Ok(Self {
            price_baseline,
            volume_baseline,
            price_current,
            volume_current,
            revenue_baseline,
            revenue_current,
        })
    }

    pub fn revenue_baseline(&self) -> Decimal {
        self.revenue_baseline
    }

    pub fn revenue_current(&self) -> Decimal {
        self.revenue_current
    }
}

/// Immutable lookup over caller-supplied metrics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObservationStore {
    by_entity: BTreeMap<EntityId, BTreeMap<PeriodId, Vec<LeafMetric>>>,
}

impl ObservationStore {
    pub fn from_metrics(metrics: impl IntoIterator<Item = LeafMetric>) -> Self {
        let mut by_entity: BTreeMap<EntityId, BTreeMap<PeriodId, Vec<LeafMetric>>> =
            BTreeMap::new();
        for metric in metrics {
            by_entity
                .entry(metric.entity_id.clone())
                .or_default()
                .entry(metric.period_id.clone())
                .or_default()
                .push(metric);
        }
        Self { by_entity }
    }

    pub fn len(&self) -> usize {
        self.by_entity.values().flat_map(|periods| periods.values()).map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_entity.is_empty()
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityId> {
        self.by_entity.keys()
    }

    /// Resolves the baseline and current observation for `entity`.
    ///
    /// Invalid metrics take precedence over missing periods: a leaf with a
    /// negative price in one period and no row in the other reports the
    /// invalid metric.
    pub fn observation(
        &self,
        entity: &EntityId,
        periods: &PeriodPair,
    ) -> Result<LeafObservation, LeafIssue> {
        let baseline = self.single_metric(entity, &periods.baseline)?;
        let current = self.single_metric(entity, &periods.current)?;

        for metric in baseline.iter().chain(current.iter()) {
            check_non_negative(metric)?;
        }

        match (baseline, current) {
            (Some(baseline), Some(current)) => {
                LeafObservation::new(baseline.price, baseline.volume, current.price, current.volume)
                    .map_err(|DecimalOverflow| {
                        LeafIssue::InvalidMetric(MetricError::Overflow {
                            entity: entity.clone(),
                            quantity: "revenue".to_string(),
                        })
                    })
            }
            (baseline, current) => {
                let mut missing = Vec::new();
                if baseline.is_none() {
                    missing.push(periods.baseline.clone());
                }
                if current.is_none() {
                    missing.push(periods.current.clone());
                }
                Err(LeafIssue::IncompleteObservation { entity: entity.clone(), missing })
            }
        }
    }

    fn single_metric(
        &self,
        entity: &EntityId,
        period: &PeriodId,
    ) -> Result<Option<&LeafMetric>, LeafIssue> {
        let rows = match self.by_entity.get(entity).and_then(|periods| periods.get(period)) {
            Some(rows) => rows,
            None => return Ok(None),
        };

        match rows.as_slice() {
            [] => Ok(None),
            [metric] => Ok(Some(metric)),
            _ => Err(LeafIssue::InvalidMetric(MetricError::DuplicateObservation {
                entity: entity.clone(),
                period: period.clone(),
                count: rows.len(),
            })),
        }
    }
}

fn check_non_negative(metric: &LeafMetric) -> Result<(), LeafIssue> {
    if metric.price < Decimal::ZERO {
        return Err(LeafIssue::InvalidMetric(MetricError::NegativePrice {
            entity: metric.entity_id.clone(),
            period: metric.period_id.clone(),
            price: metric.price,
        }));
    }
    if metric.volume < Decimal::ZERO {
        return Err(LeafIssue::InvalidMetric(MetricError::NegativeVolume {
            entity: metric.entity_id.clone(),
            period: metric.period_id.clone(),
            volume: metric.volume,
        }));
    }
    Ok(())
}
