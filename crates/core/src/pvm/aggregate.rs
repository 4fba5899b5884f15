//! Bottom-up rollup of leaf effects for one view.
//!
//! Price is summed. The volume side `Σ (volume + mix)` of the children is
//! split again at every group: pure volume is what the group's revenue would
//! have done had every child grown at the group's own unit growth rate, and
//! mix is the remainder. Mix is therefore always recomputed per level and
//! never carried up as a finished number.

use std::collections::BTreeSet;

use rayon::prelude::*;
use rust_decimal::Decimal;

use crate::domain::hierarchy::{NodeId, NodeKind};
use crate::domain::metric::EntityId;
use crate::domain::period::PeriodPair;
use crate::domain::result::{DecompositionResult, DiagnosticFlag};
use crate::errors::{DecimalOverflow, EngineError, LeafExclusion, LeafIssue};
use crate::pvm::leaf::LeafTable;
use crate::pvm::structure::ViewTree;

/// Rows and exclusions produced for one view (or one subtree of it).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViewAggregation {
    pub results: Vec<DecompositionResult>,
    pub exclusions: Vec<LeafExclusion>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HierarchyAggregator {
    parallel: bool,
}

struct SubtreeOutcome {
    // `None` when the node is a leaf that was excluded.
    result: Option<DecompositionResult>,
    rows: Vec<DecompositionResult>,
    issues: Vec<LeafIssue>,
}

impl HierarchyAggregator {
    pub fn new(parallel: bool) -> Self {
        Self { parallel }
    }

    /// Aggregates the subtree rooted at `start`. Siblings are independent and
    /// fork across the rayon pool; a parent joins on all of its children.
    ///
    /// Fails with [`EngineError::Overflow`] when a group total leaves the
    /// decimal range.
    pub fn aggregate(
        &self,
        tree: &ViewTree,
        start: &NodeId,
        leaves: &LeafTable,
        periods: &PeriodPair,
    ) -> Result<ViewAggregation, EngineError> {
        if !tree.contains(start) {
            return Ok(ViewAggregation::default());
        }

        let outcome = self.aggregate_node(tree, start, leaves, periods)?;
        let mut results = outcome.rows;
        if let Some(result) = outcome.result {
            results.push(result);
        }

        Ok(ViewAggregation {
            results,
            exclusions: outcome
                .issues
                .into_iter()
                .map(|issue| LeafExclusion { view: tree.name().clone(), issue })
                .collect(),
        })
    }

    fn aggregate_node(
        &self,
        tree: &ViewTree,
        id: &NodeId,
        leaves: &LeafTable,
        periods: &PeriodPair,
    ) -> Result<SubtreeOutcome, EngineError> {
        let Some(node) = tree.node(id) else {
            return Ok(SubtreeOutcome { result: None, rows: Vec::new(), issues: Vec::new() });
        };

        if node.kind == NodeKind::Leaf {
            return Ok(leaf_outcome(tree, id, leaves, periods));
        }

        let children = if self.parallel {
            node.children
                .par_iter()
                .map(|child| self.aggregate_node(tree, child, leaves, periods))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            node.children
                .iter()
                .map(|child| self.aggregate_node(tree, child, leaves, periods))
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut rows = Vec::new();
        let mut issues = Vec::new();
        let mut included = Vec::new();
        let mut direct_issues = Vec::new();
        for child in children {
            rows.extend(child.rows);
            match child.result {
                Some(result) => included.push(result),
                None => direct_issues.extend(child.issues.iter().cloned()),
            }
            issues.extend(child.issues);
        }

        let result = combine_children(tree, id, node.kind, &included, &direct_issues, periods)?;
        rows.extend(included);

        Ok(SubtreeOutcome { result: Some(result), rows, issues })
    }
}
fn leaf_outcome(
    tree: &ViewTree,
    id: &NodeId,
    leaves: &LeafTable,
    periods: &PeriodPair,
) -> SubtreeOutcome {
    let entity = id.as_entity();
    let computed = match leaves.get(&entity) {
        Some(outcome) => outcome.clone(),
        // Entities are collected from every view before the leaf pass, so this
        // only happens for a table built by a different caller.
        None => Err(LeafIssue::IncompleteObservation {
            entity: entity.clone(),
            missing: vec![periods.baseline.clone(), periods.current.clone()],
        }),
    };

    match computed {
        Ok(leaf) => {
            let observation = leaf.observation;
            SubtreeOutcome {
                result: Some(DecompositionResult {
                    view: tree.name().clone(),
                    node_id: id.clone(),
                    kind: NodeKind::Leaf,
                    baseline: periods.baseline.clone(),
                    current: periods.current.clone(),
                    price_effect: leaf.effects.price_effect,
                    volume_effect: leaf.effects.volume_effect,
                    mix_effect: Decimal::ZERO,
                    revenue_baseline: observation.revenue_baseline(),
                    revenue_current: observation.revenue_current(),
                    volume_baseline: observation.volume_baseline,
                    volume_current: observation.volume_current,
                    leaf_count: 1,
                    flags: leaf.effects.flags,
                    excluded_leaves: BTreeSet::new(),
                }),
                rows: Vec::new(),
                issues: Vec::new(),
            }
        }
        Err(issue) => SubtreeOutcome { result: None, rows: Vec::new(), issues: vec![issue] },
    }
}

fn combine_children(
    tree: &ViewTree,
    id: &NodeId,
    kind: NodeKind,
    children: &[DecompositionResult],
    excluded_children: &[LeafIssue],
    periods: &PeriodPair,
) -> Result<DecompositionResult, EngineError> {
    let overflow = |quantity: &str| EngineError::Overflow {
        view: tree.name().clone(),
        node: id.clone(),
        quantity: quantity.to_string(),
    };
    let add = |total: Decimal, value: Decimal, quantity: &str| {
        total.checked_add(value).ok_or_else(|| overflow(quantity))
    };

    let mut price_effect = Decimal::ZERO;
    let mut volume_and_mix = Decimal::ZERO;
    let mut revenue_baseline = Decimal::ZERO;
    let mut revenue_current = Decimal::ZERO;
    let mut volume_baseline = Decimal::ZERO;
    let mut volume_current = Decimal::ZERO;
    let mut leaf_count = 0;
    let mut excluded_leaves: BTreeSet<EntityId> = BTreeSet::new();
    let mut incomplete = false;

    for child in children {
        price_effect = add(price_effect, child.price_effect, "price_effect")?;
        volume_and_mix = add(volume_and_mix, child.volume_and_mix(), "volume_effect")?;
        revenue_baseline = add(revenue_baseline, child.revenue_baseline, "revenue_baseline")?;
        revenue_current = add(revenue_current, child.revenue_current, "revenue_current")?;
        volume_baseline = add(volume_baseline, child.volume_baseline, "volume_baseline")?;
        volume_current = add(volume_current, child.volume_current, "volume_current")?;
        leaf_count += child.leaf_count;
        excluded_leaves.extend(child.excluded_leaves.iter().cloned());
        incomplete |= child.has_flag(DiagnosticFlag::IncompleteObservation);
    }
    for issue in excluded_children {
        excluded_leaves.insert(issue.entity().clone());
        incomplete |= issue.is_incomplete();
    }

    let mut flags = BTreeSet::new();
    let volume_effect = pure_volume_effect(volume_baseline, volume_current, revenue_baseline)
        .map_err(|DecimalOverflow| overflow("volume_effect"))?
        .unwrap_or_else(|| {
            flags.insert(DiagnosticFlag::UndefinedGrowthRate);
            Decimal::ZERO
        });
    let mix_effect =
        volume_and_mix.checked_sub(volume_effect).ok_or_else(|| overflow("mix_effect"))?;
    if !excluded_leaves.is_empty() {
        flags.insert(DiagnosticFlag::Degraded);
    }
    if incomplete {
        flags.insert(DiagnosticFlag::IncompleteObservation);
    }

    Ok(DecompositionResult {
        view: tree.name().clone(),
        node_id: id.clone(),
        kind,
        baseline: periods.baseline.clone(),
        current: periods.current.clone(),
        price_effect,
        volume_effect,
        mix_effect,
        revenue_baseline,
        revenue_current,
        volume_baseline,
        volume_current,
        leaf_count,
        flags,
        excluded_leaves,
    })
}

/// Decimal places kept on the pure volume effect. Keeping it bounded lets
/// `volume + mix` reproduce the children's volume side without rounding.
pub const PURE_VOLUME_SCALE: u32 = 12;

/// `r * R0` with `r = V1 / V0 - 1`; `Ok(None)` when the baseline volume is zero.
pub(crate) fn pure_volume_effect(
    volume_baseline: Decimal,
    volume_current: Decimal,
    revenue_baseline: Decimal,
) -> Result<Option<Decimal>, DecimalOverflow> {
    if volume_baseline.is_zero() {
        return Ok(None);
    }
    let growth_rate = (volume_current - volume_baseline)
        .checked_div(volume_baseline)
        .ok_or(DecimalOverflow)?;
    let effect = growth_rate.checked_mul(revenue_baseline).ok_or(DecimalOverflow)?;
    Ok(Some(effect.round_dp(PURE_VOLUME_SCALE)))
}
