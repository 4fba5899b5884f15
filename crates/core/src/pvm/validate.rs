//! Consistency checks run after aggregation.
//!
//! Group rows are re-derived straight from the observation store through a
//! separate code path rather than from the aggregator's own child rows, so a
//! rollup defect cannot validate itself.

use std::collections::BTreeSet;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::domain::hierarchy::{NodeId, NodeKind, ViewName};
use crate::domain::metric::{EntityId, LeafObservation, ObservationStore};
use crate::domain::period::PeriodPair;
use crate::domain::result::{DecompositionResult, ResultKey, ResultSet};
use crate::errors::{IntegrityError, ValidationWarning};
use crate::pvm::leaf::CrossTermPolicy;
use crate::pvm::structure::ViewTree;

pub const DEFAULT_RELATIVE_TOLERANCE: Decimal = dec!(0.000001);
pub const DEFAULT_ABSOLUTE_TOLERANCE: Decimal = dec!(0.0001);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tolerance {
    pub relative: Decimal,
    pub absolute: Decimal,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self { relative: DEFAULT_RELATIVE_TOLERANCE, absolute: DEFAULT_ABSOLUTE_TOLERANCE }
    }
}

impl Tolerance {
    /// A difference too large to represent never matches.
    pub fn matches(&self, expected: Decimal, actual: Decimal) -> bool {
        let Some(difference) = expected.checked_sub(actual).map(|value| value.abs()) else {
            return false;
        };
        if difference <= self.absolute {
            return true;
        }
        let scale = expected.abs().max(actual.abs());
        self.relative.checked_mul(scale).map_or(true, |bound| difference <= bound)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CrossViewOutcome {
    pub violations: Vec<IntegrityError>,
    pub warnings: Vec<ValidationWarning>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ConsistencyValidator {
    tolerance: Tolerance,
    policy: CrossTermPolicy,
}

// Figures for a node rebuilt from raw observations.
#[derive(Default)]
struct DirectFigures {
    price_effect: Decimal,
    revenue_baseline: Decimal,
    revenue_current: Decimal,
    volume_baseline: Decimal,
    volume_current: Decimal,
    leaf_count: usize,
    excluded: BTreeSet<EntityId>,
}

impl ConsistencyValidator {
    pub fn new(tolerance: Tolerance, policy: CrossTermPolicy) -> Self {
        Self { tolerance, policy }
    }

    /// Checks every node under `start`: additivity, zero mix on leaves, and
    /// agreement with a direct recomputation from the observation store.
    pub fn check_view(
        &self,
        tree: &ViewTree,
        start: &NodeId,
        results: &ResultSet,
        store: &ObservationStore,
        periods: &PeriodPair,
    ) -> Vec<IntegrityError> {
        let mut violations = Vec::new();
        let view = tree.name();

        for id in tree.post_order(start) {
            let Some(node) = tree.node(&id) else {
                continue;
            };
            let direct = match self.direct_figures(tree, &id, store, periods) {
                Ok(direct) => direct,
                Err(field) => {
                    violations.push(IntegrityError::ArithmeticOverflow {
                        view: view.clone(),
                        node: id,
                        field: field.to_string(),
                    });
                    continue;
                }
            };
            let key = ResultKey {
                view: view.clone(),
                node: id.clone(),
                baseline: periods.baseline.clone(),
                current: periods.current.clone(),
            };

            let Some(result) = results.get(&key) else {
                let excluded_leaf = node.kind == NodeKind::Leaf && direct.leaf_count == 0;
                if !excluded_leaf {
                    violations.push(IntegrityError::MissingResult { view: view.clone(), node: id });
                }
                continue;
            };

            if node.kind == NodeKind::Leaf && direct.leaf_count == 0 {
                violations.push(IntegrityError::UnexpectedResult { view: view.clone(), node: id });
                continue;
            }

            match additivity_terms(result) {
                Some((change, effects)) if !self.tolerance.matches(change, effects) => {
                    let violation = match effects.checked_sub(change) {
                        Some(residual) => IntegrityError::AdditivityViolation {
                            view: view.clone(),
                            node: id.clone(),
                            residual,
                        },
                        None => IntegrityError::ArithmeticOverflow {
                            view: view.clone(),
                            node: id.clone(),
                            field: "residual".to_string(),
                        },
                    };
                    violations.push(violation);
                }
                Some(_) => {}
                None => violations.push(IntegrityError::ArithmeticOverflow {
                    view: view.clone(),
                    node: id.clone(),
                    field: "total_effect".to_string(),
                }),
            }

            if node.kind == NodeKind::Leaf && !result.mix_effect.is_zero() {
                violations.push(IntegrityError::LeafMixEffect {
                    view: view.clone(),
                    node: id.clone(),
                    mix_effect: result.mix_effect,
                });
            }

            self.compare_rollup(view, &id, node.kind, result, &direct, &mut violations);
        }

        violations
    }

    fn compare_rollup(
        &self,
        view: &ViewName,
        id: &NodeId,
        kind: NodeKind,
        result: &DecompositionResult,
        direct: &DirectFigures,
        violations: &mut Vec<IntegrityError>,
    ) {
        let mut expected = vec![
            ("price_effect", direct.price_effect, result.price_effect),
            ("revenue_baseline", direct.revenue_baseline, result.revenue_baseline),
            ("revenue_current", direct.revenue_current, result.revenue_current),
            ("volume_baseline", direct.volume_baseline, result.volume_baseline),
            ("volume_current", direct.volume_current, result.volume_current),
            ("leaf_count", Decimal::from(direct.leaf_count), Decimal::from(result.leaf_count)),
            (
                "excluded_leaves",
                Decimal::from(direct.excluded.len()),
                Decimal::from(result.excluded_leaves.len()),
            ),
        ];

        let volume_side = direct
            .revenue_current
            .checked_sub(direct.revenue_baseline)
            .and_then(|change| change.checked_sub(direct.price_effect));
        let Some(volume_side) = volume_side else {
            violations.push(IntegrityError::ArithmeticOverflow {
                view: view.clone(),
                node: id.clone(),
                field: "volume_effect".to_string(),
            });
            return;
        };
        if kind == NodeKind::Leaf {
            expected.push(("volume_effect", volume_side, result.volume_effect));
        } else {
            // Growth rate first, then scale by baseline revenue.
            let pure_volume = if direct.volume_baseline.is_zero() {
                Some(Decimal::ZERO)
            } else {
                (direct.volume_current - direct.volume_baseline)
                    .checked_div(direct.volume_baseline)
                    .and_then(|rate| rate.checked_mul(direct.revenue_baseline))
            };
            let Some(pure_volume) = pure_volume else {
                violations.push(IntegrityError::ArithmeticOverflow {
                    view: view.clone(),
                    node: id.clone(),
                    field: "volume_effect".to_string(),
                });
                return;
            };
            expected.push(("volume_effect", pure_volume, result.volume_effect));
            match volume_side.checked_sub(pure_volume) {
                Some(mix) => expected.push(("mix_effect", mix, result.mix_effect)),
                None => violations.push(IntegrityError::ArithmeticOverflow {
                    view: view.clone(),
                    node: id.clone(),
                    field: "mix_effect".to_string(),
                }),
            }
        }

        for (field, expected, actual) in expected {
            if !self.tolerance.matches(expected, actual) {
                violations.push(IntegrityError::RollupMismatch {
                    view: view.clone(),
                    node: id.clone(),
                    field: field.to_string(),
                    expected,
                    actual,
                });
            }
        }
    }

    /// Sums a node's leaves straight from the store. A leaf whose observation
    /// is invalid, or whose direct effects leave the decimal range, counts as
    /// excluded. `Err` names the first sum that overflowed.
    fn direct_figures(
        &self,
        tree: &ViewTree,
        id: &NodeId,
        store: &ObservationStore,
        periods: &PeriodPair,
    ) -> Result<DirectFigures, &'static str> {
        let mut figures = DirectFigures::default();
        for leaf in tree.leaves_under(id) {
            let entity = leaf.as_entity();
            let direct = store
                .observation(&entity, periods)
                .ok()
                .and_then(|observation| direct_leaf(&observation, self.policy));
            let Some((observation, price_effect)) = direct else {
                figures.excluded.insert(entity);
                continue;
            };
            figures.price_effect = sum(figures.price_effect, price_effect, "price_effect")?;
            figures.revenue_baseline =
                sum(figures.revenue_baseline, observation.revenue_baseline(), "revenue_baseline")?;
            figures.revenue_current =
                sum(figures.revenue_current, observation.revenue_current(), "revenue_current")?;
            figures.volume_baseline =
                sum(figures.volume_baseline, observation.volume_baseline, "volume_baseline")?;
            figures.volume_current =
                sum(figures.volume_current, observation.volume_current, "volume_current")?;
            figures.leaf_count += 1;
        }
        Ok(figures)
    }

    /// Compares `Total` rows of views that cover the same included leaves.
    /// Price and volume-plus-mix must agree exactly; the volume/mix split may
    /// differ between views.
    pub fn check_cross_view(
        &self,
        trees: &[&ViewTree],
        results: &ResultSet,
        periods: &PeriodPair,
    ) -> CrossViewOutcome {
        let mut outcome = CrossViewOutcome::default();

        let totals = trees
            .iter()
            .filter_map(|tree| {
                let key = ResultKey {
                    view: tree.name().clone(),
                    node: tree.root().clone(),
                    baseline: periods.baseline.clone(),
                    current: periods.current.clone(),
                };
                let total = results.get(&key)?;
                let included = tree
                    .leaves_under(tree.root())
                    .into_iter()
                    .map(|leaf| leaf.as_entity())
                    .filter(|entity| !total.excluded_leaves.contains(entity))
                    .collect::<BTreeSet<_>>();
                Some((tree.name(), total, included))
            })
            .collect::<Vec<_>>();

        let Some((anchor_view, anchor, anchor_leaves)) = totals.first() else {
            return outcome;
        };

        for (view, total, leaves) in totals.iter().skip(1) {
            if leaves != anchor_leaves {
                outcome.warnings.push(ValidationWarning::LeafSetMismatch {
                    left: (*anchor_view).clone(),
                    right: (*view).clone(),
                });
                continue;
            }

            let volume_sides = (
                anchor.volume_effect.checked_add(anchor.mix_effect),
                total.volume_effect.checked_add(total.mix_effect),
            );
            let (Some(anchor_volume_side), Some(volume_side)) = volume_sides else {
                outcome.violations.push(IntegrityError::ArithmeticOverflow {
                    view: (*view).clone(),
                    node: total.node_id.clone(),
                    field: "volume_and_mix".to_string(),
                });
                continue;
            };
            let comparisons = [
                ("price_effect", anchor.price_effect, total.price_effect),
                ("volume_and_mix", anchor_volume_side, volume_side),
            ];
            for (field, left_value, right_value) in comparisons {
                if left_value != right_value {
                    outcome.violations.push(IntegrityError::CrossViewMismatch {
                        field: field.to_string(),
                        left: (*anchor_view).clone(),
                        left_value,
                        right: (*view).clone(),
                        right_value,
                    });
                }
            }
        }

        outcome
    }
}

/// The observation and its price effect, both sides of the change computed
/// as single products. `None` when the price or volume side overflows.
fn direct_leaf(
    observation: &LeafObservation,
    policy: CrossTermPolicy,
) -> Option<(LeafObservation, Decimal)> {
    let change = observation.revenue_current().checked_sub(observation.revenue_baseline())?;
    if observation.volume_baseline.is_zero() || observation.volume_current.is_zero() {
        return Some((*observation, Decimal::ZERO));
    }
    let price_delta = observation.price_current - observation.price_baseline;
    let price_effect = match policy {
        CrossTermPolicy::Price => price_delta.checked_mul(observation.volume_current)?,
        CrossTermPolicy::Volume => price_delta.checked_mul(observation.volume_baseline)?,
    };
    change.checked_sub(price_effect)?;
    Some((*observation, price_effect))
}

// Additivity terms of a row: revenue change and the sum of its three effects.
fn additivity_terms(result: &DecompositionResult) -> Option<(Decimal, Decimal)> {
    let change = result.revenue_current.checked_sub(result.revenue_baseline)?;
    let volume_side = result.volume_effect.checked_add(result.mix_effect)?;
    let effects = result.price_effect.checked_add(volume_side)?;
    Some((change, effects))
}

fn sum(total: Decimal, value: Decimal, field: &'static str) -> Result<Decimal, &'static str> {
    total.checked_add(value).ok_or(field)
}
