pub mod aggregate;
pub mod bridge;
pub mod leaf;
pub mod structure;
pub mod validate;

use std::collections::BTreeSet;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::domain::hierarchy::{HierarchyDefinition, NodeId, ViewName};
use crate::domain::metric::{EntityId, LeafMetric, ObservationStore};
use crate::domain::period::PeriodPair;
use crate::domain::result::ResultSet;
use crate::errors::{EngineError, LeafExclusion, ValidationWarning, ViewFailure};

use self::{
    aggregate::HierarchyAggregator,
    leaf::{decompose_leaves, CrossTermPolicy, LeafDecomposer, StandardLeafDecomposer},
    structure::ViewTree,
    validate::{ConsistencyValidator, Tolerance},
};

/// Restricts a run to one subtree of one view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreeFilter {
    pub view: ViewName,
    pub node: NodeId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionRequest {
    #[serde(flatten)]
    pub periods: PeriodPair,
    pub metrics: Vec<LeafMetric>,
    pub views: HierarchyDefinition,
    #[serde(default)]
    pub filter: Option<SubtreeFilter>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionReport {
    pub periods: PeriodPair,
    pub results: ResultSet,
    pub exclusions: Vec<LeafExclusion>,
    pub view_failures: Vec<ViewFailure>,
    pub warnings: Vec<ValidationWarning>,
    pub fingerprint: String,
}

pub trait AttributionRuntime: Send + Sync {
    fn attribute(&self, request: &AttributionRequest) -> Result<AttributionReport, EngineError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    pub cross_term_policy: CrossTermPolicy,
    pub tolerance: Tolerance,
    pub parallel: bool,
    pub verify_consistency: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cross_term_policy: CrossTermPolicy::Price,
            tolerance: Tolerance::default(),
            parallel: true,
            verify_consistency: true,
        }
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            cross_term_policy: config.cross_term_policy,
            tolerance: Tolerance {
                relative: config.relative_tolerance,
                absolute: config.absolute_tolerance,
            },
            parallel: config.parallel,
            verify_consistency: config.verify_consistency,
        }
    }
}

pub struct DeterministicAttributionEngine<D> {
    decomposer: D,
    settings: EngineSettings,
}

impl<D> DeterministicAttributionEngine<D> {
    pub fn new(decomposer: D, settings: EngineSettings) -> Self {
        Self { decomposer, settings }
    }
}

impl DeterministicAttributionEngine<StandardLeafDecomposer> {
    pub fn with_settings(settings: EngineSettings) -> Self {
        Self::new(StandardLeafDecomposer::new(settings.cross_term_policy), settings)
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::with_settings(EngineSettings::from(config))
    }
}

impl Default for DeterministicAttributionEngine<StandardLeafDecomposer> {
    fn default() -> Self {
        Self::with_settings(EngineSettings::default())
    }
}

impl<D> AttributionRuntime for DeterministicAttributionEngine<D>
where
    D: LeafDecomposer,
{
    fn attribute(&self, request: &AttributionRequest) -> Result<AttributionReport, EngineError> {
        let periods = &request.periods;
        if periods.is_degenerate() {
            return Err(EngineError::SamePeriod { period: periods.baseline.clone() });
        }
        check_view_names(&request.views)?;

        info!(
            event_name = "pvm.run.start",
            baseline = %periods.baseline,
            current = %periods.current,
            views = request.views.views.len(),
            metrics = request.metrics.len(),
            filtered = request.filter.is_some(),
            "starting attribution run"
        );

        let (trees, view_failures) = build_trees(request)?;
        let scopes = scope_roots(&trees, request.filter.as_ref())?;

        let store = ObservationStore::from_metrics(request.metrics.iter().cloned());
        let entities = scopes
            .iter()
            .flat_map(|(tree, start)| tree.leaves_under(start))
            .map(|leaf| leaf.as_entity())
            .collect::<BTreeSet<EntityId>>();
        let leaves = decompose_leaves(
            &self.decomposer,
            &store,
            periods,
            &entities,
            self.settings.parallel,
        );

        let aggregator = HierarchyAggregator::new(self.settings.parallel);
        let aggregate_scope = |(tree, start): &(&ViewTree, NodeId)| {
            aggregator.aggregate(tree, start, &leaves, periods)
        };
        let aggregations = if self.settings.parallel {
            scopes.par_iter().map(aggregate_scope).collect::<Result<Vec<_>, _>>()?
        } else {
            scopes.iter().map(aggregate_scope).collect::<Result<Vec<_>, _>>()?
        };

        let mut results = ResultSet::new();
        let mut exclusions = Vec::new();
        for aggregation in aggregations {
            results.extend(aggregation.results);
            exclusions.extend(aggregation.exclusions);
        }
        for exclusion in &exclusions {
            warn!(
                event_name = "pvm.leaf.excluded",
                view = %exclusion.view,
                entity = %exclusion.issue.entity(),
                reason = %exclusion.issue,
                "leaf excluded from view decomposition"
            );
        }

        let mut warnings = Vec::new();
        if request.filter.is_none() {
            warnings.extend(
                store
                    .entities()
                    .filter(|entity| !entities.contains(*entity))
                    .map(|entity| ValidationWarning::UnusedObservation { entity: entity.clone() }),
            );
        }

        if self.settings.verify_consistency {
            warnings.extend(self.verify(&scopes, &results, &store, periods, request)?);
        } else {
            warnings.push(ValidationWarning::ValidationDisabled);
        }

        let fingerprint = results.fingerprint();
        info!(
            event_name = "pvm.run.completed",
            baseline = %periods.baseline,
            current = %periods.current,
            results = results.len(),
            excluded_leaves = exclusions.len(),
            failed_views = view_failures.len(),
            warnings = warnings.len(),
            fingerprint = %fingerprint,
            "attribution run completed"
        );

        Ok(AttributionReport {
            periods: periods.clone(),
            results,
            exclusions,
            view_failures,
            warnings,
            fingerprint,
        })
    }
}

impl<D> DeterministicAttributionEngine<D> {
    fn verify(
        &self,
        scopes: &[(&ViewTree, NodeId)],
        results: &ResultSet,
        store: &ObservationStore,
        periods: &PeriodPair,
        request: &AttributionRequest,
    ) -> Result<Vec<ValidationWarning>, EngineError> {
        let validator =
            ConsistencyValidator::new(self.settings.tolerance, self.settings.cross_term_policy);

        let mut violations = scopes
            .iter()
            .flat_map(|(tree, start)| validator.check_view(tree, start, results, store, periods))
            .collect::<Vec<_>>();

        let mut warnings = Vec::new();
        if request.filter.is_none() {
            let trees = scopes.iter().map(|(tree, _)| *tree).collect::<Vec<_>>();
            let cross_view = validator.check_cross_view(&trees, results, periods);
            violations.extend(cross_view.violations);
            warnings.extend(cross_view.warnings);
        } else if request.views.views.len() > 1 {
            warnings.push(ValidationWarning::CrossViewCheckSkipped);
        }

        if violations.is_empty() {
            debug!(
                event_name = "pvm.validation.passed",
                views = scopes.len(),
                "consistency validation passed"
            );
            return Ok(warnings);
        }

        for violation in &violations {
            error!(
                event_name = "pvm.validation.failed",
                violation = %violation,
                "consistency violation detected"
            );
        }
        Err(EngineError::Integrity(violations))
    }
}

fn check_view_names(views: &HierarchyDefinition) -> Result<(), EngineError> {
    if views.views.is_empty() {
        return Err(EngineError::NoViews);
    }
    let mut seen = BTreeSet::new();
    for view in &views.views {
        if !seen.insert(&view.name) {
            return Err(EngineError::DuplicateView(view.name.clone()));
        }
    }
    Ok(())
}

fn build_trees(
    request: &AttributionRequest,
) -> Result<(Vec<ViewTree>, Vec<ViewFailure>), EngineError> {
    if let Some(filter) = &request.filter {
        let view = request
            .views
            .view(&filter.view)
            .ok_or_else(|| EngineError::UnknownView(filter.view.clone()))?;
        let tree = ViewTree::build(view).map_err(|error| EngineError::FilteredViewInvalid {
            view: view.name.clone(),
            error,
        })?;
        return Ok((vec![tree], Vec::new()));
    }

    let mut trees = Vec::new();
    let mut failures = Vec::new();
    for view in &request.views.views {
        match ViewTree::build(view) {
            Ok(tree) => {
                debug!(
                    event_name = "pvm.view.accepted",
                    view = %view.name,
                    nodes = tree.len(),
                    "hierarchy view accepted"
                );
                trees.push(tree);
            }
            Err(error) => {
                warn!(
                    event_name = "pvm.view.aborted",
                    view = %view.name,
                    reason = %error,
                    "hierarchy view failed structural validation"
                );
                failures.push(ViewFailure { view: view.name.clone(), error });
            }
        }
    }
    Ok((trees, failures))
}

fn scope_roots<'a>(
    trees: &'a [ViewTree],
    filter: Option<&SubtreeFilter>,
) -> Result<Vec<(&'a ViewTree, NodeId)>, EngineError> {
    match filter {
        Some(filter) => {
            let tree = trees
                .iter()
                .find(|tree| tree.name() == &filter.view)
                .ok_or_else(|| EngineError::UnknownView(filter.view.clone()))?;
            if !tree.contains(&filter.node) {
                return Err(EngineError::UnknownNode {
                    view: filter.view.clone(),
                    node: filter.node.clone(),
                });
            }
            Ok(vec![(tree, filter.node.clone())])
        }
        None => Ok(trees.iter().map(|tree| (tree, tree.root().clone())).collect()),
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::{
        AttributionReport, AttributionRequest, AttributionRuntime, DeterministicAttributionEngine,
        EngineSettings, SubtreeFilter,
    };
    use crate::domain::hierarchy::{
        HierarchyDefinition, HierarchyNode, HierarchyView, NodeId, ViewName,
    };
    use crate::domain::metric::{EntityId, LeafMetric};
    use crate::domain::period::{PeriodId, PeriodPair};
    use crate::domain::result::{DecompositionResult, DiagnosticFlag};
    use crate::errors::{
        EngineError, HierarchyIntegrityError, LeafIssue, MetricError, ValidationWarning,
    };

    fn request() -> AttributionRequest {
        AttributionRequest {
            periods: PeriodPair::new(PeriodId::new("FY23"), PeriodId::new("FY24")),
            metrics: vec![
                LeafMetric::new("SKU-001", "FY23", dec!(11200), dec!(607)),
                LeafMetric::new("SKU-001", "FY24", dec!(12500), dec!(680)),
                LeafMetric::new("SKU-002", "FY23", dec!(900), dec!(1200)),
                LeafMetric::new("SKU-002", "FY24", dec!(880), dec!(1500)),
            ],
            views: HierarchyDefinition::new(vec![HierarchyView::new(
                "by_product",
                vec![
                    HierarchyNode::total("TOTAL", &["LINE-A"]),
                    HierarchyNode::group("LINE-A", &["SKU-001", "SKU-002"]),
                    HierarchyNode::leaf("SKU-001"),
                    HierarchyNode::leaf("SKU-002"),
                ],
            )]),
            filter: None,
        }
    }

    #[test]
    fn runs_every_node_of_every_view() {
        let report = DeterministicAttributionEngine::default().attribute(&request()).expect("run");

        assert_eq!(report.results.len(), 4);
        assert!(report.exclusions.is_empty());
        assert!(report.view_failures.is_empty());
        assert!(report.warnings.is_empty());
        assert_eq!(report.fingerprint, report.results.fingerprint());
    }

    #[test]
    fn rejects_identical_periods() {
        let mut request = request();
        request.periods.current = PeriodId::new("FY23");

        assert_eq!(
            DeterministicAttributionEngine::default().attribute(&request).unwrap_err(),
            EngineError::SamePeriod { period: PeriodId::new("FY23") }
        );
    }

    #[test]
    fn rejects_empty_and_duplicate_views() {
        let engine = DeterministicAttributionEngine::default();

        let mut empty = request();
        empty.views = HierarchyDefinition::default();
        assert_eq!(engine.attribute(&empty).unwrap_err(), EngineError::NoViews);

        let mut doubled = request();
        let copy = doubled.views.views[0].clone();
        doubled.views.views.push(copy);
        assert!(matches!(engine.attribute(&doubled), Err(EngineError::DuplicateView(_))));
    }

    #[test]
    fn broken_view_is_reported_while_other_views_run() {
        let mut request = request();
        request.views.views.push(HierarchyView::new(
            "broken",
            vec![HierarchyNode::total("TOTAL", &["SKU-001", "SKU-404"]), HierarchyNode::leaf("SKU-001")],
        ));

        let report = DeterministicAttributionEngine::default().attribute(&request).expect("run");

        assert_eq!(report.view_failures.len(), 1);
        assert_eq!(report.view_failures[0].view, ViewName::new("broken"));
        assert!(matches!(
            report.view_failures[0].error,
            HierarchyIntegrityError::DanglingChild { .. }
        ));
        assert_eq!(report.results.view_results(&ViewName::new("by_product")).count(), 4);
    }

    #[test]
    fn subtree_filter_limits_results() {
        let mut request = request();
        request.filter =
            Some(SubtreeFilter { view: ViewName::new("by_product"), node: NodeId::new("LINE-A") });

        let report = DeterministicAttributionEngine::default().attribute(&request).expect("run");

        assert_eq!(report.results.len(), 3);
        assert!(report.results.node(&ViewName::new("by_product"), &NodeId::new("TOTAL")).is_none());
    }

    #[test]
    fn subtree_filter_rejects_unknown_targets() {
        let engine = DeterministicAttributionEngine::default();

        let mut unknown_view = request();
        unknown_view.filter =
            Some(SubtreeFilter { view: ViewName::new("by_region"), node: NodeId::new("TOTAL") });
        assert!(matches!(engine.attribute(&unknown_view), Err(EngineError::UnknownView(_))));

        let mut unknown_node = request();
        unknown_node.filter =
            Some(SubtreeFilter { view: ViewName::new("by_product"), node: NodeId::new("LINE-Z") });
        assert!(matches!(engine.attribute(&unknown_node), Err(EngineError::UnknownNode { .. })));
    }

    #[test]
    fn unreferenced_observations_are_warned_about() {
        let mut request = request();
        request.metrics.push(LeafMetric::new("SKU-999", "FY23", dec!(1), dec!(1)));

        let report = DeterministicAttributionEngine::default().attribute(&request).expect("run");

        assert_eq!(
            report.warnings,
            vec![ValidationWarning::UnusedObservation { entity: EntityId::new("SKU-999") }]
        );
    }

    #[test]
    fn disabled_validation_is_surfaced_as_warning() {
        let engine = DeterministicAttributionEngine::with_settings(EngineSettings {
            verify_consistency: false,
            ..EngineSettings::default()
        });

        let report = engine.attribute(&request()).expect("run");

        assert_eq!(report.warnings, vec![ValidationWarning::ValidationDisabled]);
    }

    fn by_geography() -> HierarchyView {
        HierarchyView::new(
            "by_geography",
            vec![
                HierarchyNode::total("WORLD", &["EMEA"]),
                HierarchyNode::group("EMEA", &["SKU-001", "SKU-002"]),
                HierarchyNode::leaf("SKU-001"),
                HierarchyNode::leaf("SKU-002"),
            ],
        )
    }

    fn line_a(report: &AttributionReport) -> &DecompositionResult {
        report
            .results
            .node(&ViewName::new("by_product"), &NodeId::new("LINE-A"))
            .expect("LINE-A row")
    }

    #[test]
    fn filtered_run_over_several_views_skips_cross_view_check() {
        let mut request = request();
        request.views.views.push(by_geography());
        request.filter =
            Some(SubtreeFilter { view: ViewName::new("by_product"), node: NodeId::new("LINE-A") });

        let report = DeterministicAttributionEngine::default().attribute(&request).expect("run");

        assert_eq!(report.warnings, vec![ValidationWarning::CrossViewCheckSkipped]);
        assert_eq!(report.results.view_results(&ViewName::new("by_geography")).count(), 0);
    }

    #[test]
    fn filter_on_structurally_invalid_view_fails_the_run() {
        let mut request = request();
        request.views.views.push(HierarchyView::new(
            "broken",
            vec![HierarchyNode::total("TOTAL", &["SKU-001", "SKU-404"]), HierarchyNode::leaf("SKU-001")],
        ));
        request.filter =
            Some(SubtreeFilter { view: ViewName::new("broken"), node: NodeId::new("TOTAL") });

        let error = DeterministicAttributionEngine::default().attribute(&request).unwrap_err();

        assert!(matches!(
            error,
            EngineError::FilteredViewInvalid {
                ref view,
                error: HierarchyIntegrityError::DanglingChild { .. },
            } if view == &ViewName::new("broken")
        ));
    }

    #[test]
    fn negative_volume_excludes_the_leaf_and_degrades_its_ancestors() {
        let mut request = request();
        request.metrics[3] = LeafMetric::new("SKU-002", "FY24", dec!(880), dec!(-5));

        let report = DeterministicAttributionEngine::default().attribute(&request).expect("run");

        assert_eq!(report.results.len(), 3);
        assert!(report.results.node(&ViewName::new("by_product"), &NodeId::new("SKU-002")).is_none());
        assert!(matches!(
            report.exclusions.as_slice(),
            [exclusion] if matches!(
                exclusion.issue,
                LeafIssue::InvalidMetric(MetricError::NegativeVolume { .. })
            )
        ));
        let line = line_a(&report);
        assert!(line.has_flag(DiagnosticFlag::Degraded));
        assert_eq!(line.leaf_count, 1);
    }

    #[test]
    fn revenues_near_decimal_limits_validate_without_overflow() {
        let request = AttributionRequest {
            periods: PeriodPair::new(PeriodId::new("FY23"), PeriodId::new("FY24")),
            metrics: vec![
                LeafMetric::new("SKU-A", "FY23", dec!(1000000), dec!(1000000000000)),
                LeafMetric::new("SKU-A", "FY24", dec!(1000000), dec!(2000000000000)),
                LeafMetric::new("SKU-B", "FY23", dec!(1), dec!(1)),
                LeafMetric::new("SKU-B", "FY24", dec!(1), dec!(1)),
            ],
            views: HierarchyDefinition::new(vec![HierarchyView::new(
                "by_product",
                vec![
                    HierarchyNode::total("TOTAL", &["SKU-A", "SKU-B"]),
                    HierarchyNode::leaf("SKU-A"),
                    HierarchyNode::leaf("SKU-B"),
                ],
            )]),
            filter: None,
        };

        let report = DeterministicAttributionEngine::default().attribute(&request).expect("run");

        assert_eq!(report.results.len(), 3);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn leaf_revenue_beyond_decimal_range_is_excluded() {
        let mut request = request();
        request.metrics[3] = LeafMetric::new(
            "SKU-002",
            "FY24",
            dec!(1000000000000000),
            dec!(1000000000000000),
        );

        let report = DeterministicAttributionEngine::default().attribute(&request).expect("run");

        assert!(matches!(
            report.exclusions.as_slice(),
            [exclusion] if matches!(
                exclusion.issue,
                LeafIssue::InvalidMetric(MetricError::Overflow { .. })
            )
        ));
        assert!(line_a(&report).has_flag(DiagnosticFlag::Degraded));
        assert!(report.results.node(&ViewName::new("by_product"), &NodeId::new("SKU-001")).is_some());
    }

    #[test]
    fn group_total_beyond_decimal_range_fails_the_run() {
        let mut request = request();
        request.metrics = ["SKU-001", "SKU-002"]
            .into_iter()
            .flat_map(|entity| {
                ["FY23", "FY24"].into_iter().map(move |period| {
                    LeafMetric::new(entity, period, dec!(500000000000000), dec!(100000000000000))
                })
            })
            .collect();

        let error = DeterministicAttributionEngine::default().attribute(&request).unwrap_err();

        assert!(matches!(error, EngineError::Overflow { ref node, .. } if node.0 == "LINE-A"));
    }

    #[test]
    fn request_deserializes_from_flat_json() {
        let json = r#"{
            "baseline": "FY23",
            "current": "FY24",
            "metrics": [
                {"entity_id": "SKU-001", "period_id": "FY23", "price": "11200", "volume": 607},
                {"entity_id": "SKU-001", "period_id": "FY24", "price": "12500", "volume": 680}
            ],
            "views": [
                {"name": "by_product", "nodes": [
                    {"id": "TOTAL", "kind": "total", "children": ["SKU-001"]},
                    {"id": "SKU-001", "kind": "leaf"}
                ]}
            ]
        }"#;

        let request: AttributionRequest = serde_json::from_str(json).expect("parse request");

        assert_eq!(request.periods.baseline, PeriodId::new("FY23"));
        assert_eq!(request.metrics[0].volume, dec!(607));
        assert!(request.filter.is_none());
    }
}
