use proptest::prelude::*;
use revbridge_core::domain::hierarchy::{
    HierarchyDefinition, HierarchyNode, HierarchyView, NodeId, NodeKind, ViewName,
};
use revbridge_core::domain::metric::LeafMetric;
use revbridge_core::domain::period::{PeriodId, PeriodPair};
use revbridge_core::pvm::{
    AttributionReport, AttributionRequest, AttributionRuntime, DeterministicAttributionEngine,
};
use rust_decimal::Decimal;

const GROUPS: [&str; 3] = ["GRP-0", "GRP-1", "GRP-2"];

#[derive(Clone, Debug)]
struct LeafCase {
    price_baseline: Decimal,
    volume_baseline: Decimal,
    price_current: Decimal,
    volume_current: Decimal,
    group: usize,
}

fn leaf_case() -> impl Strategy<Value = LeafCase> {
    (0i64..100_000, 0i64..500, 0i64..100_000, 0i64..500, 0usize..GROUPS.len()).prop_map(
        |(p0, v0, p1, v1, group)| LeafCase {
            price_baseline: Decimal::new(p0, 2),
            volume_baseline: Decimal::from(v0),
            price_current: Decimal::new(p1, 2),
            volume_current: Decimal::from(v1),
            group,
        },
    )
}

fn sku(index: usize) -> String {
    format!("SKU-{index:03}")
}

fn metrics(leaves: &[LeafCase]) -> Vec<LeafMetric> {
    leaves
        .iter()
        .enumerate()
        .flat_map(|(index, leaf)| {
            [
                LeafMetric::new(&sku(index), "FY23", leaf.price_baseline, leaf.volume_baseline),
                LeafMetric::new(&sku(index), "FY24", leaf.price_current, leaf.volume_current),
            ]
        })
        .collect()
}

fn flat_view(leaves: &[LeafCase]) -> HierarchyView {
    let ids: Vec<String> = (0..leaves.len()).map(sku).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let mut nodes = vec![HierarchyNode::total("TOTAL", &refs)];
    nodes.extend(refs.iter().map(|id| HierarchyNode::leaf(*id)));
    HierarchyView::new("flat", nodes)
}

fn grouped_view(leaves: &[LeafCase]) -> HierarchyView {
    let mut nodes = Vec::new();
    let mut used_groups = Vec::new();
    for (group_index, group) in GROUPS.iter().enumerate() {
        let members: Vec<String> = leaves
            .iter()
            .enumerate()
            .filter(|(_, leaf)| leaf.group == group_index)
            .map(|(index, _)| sku(index))
            .collect();
        if members.is_empty() {
            continue;
        }
        let refs: Vec<&str> = members.iter().map(String::as_str).collect();
        nodes.push(HierarchyNode::group(*group, &refs));
        nodes.extend(refs.iter().map(|id| HierarchyNode::leaf(*id)));
        used_groups.push(*group);
    }
    nodes.push(HierarchyNode::total("TOTAL", &used_groups));
    HierarchyView::new("grouped", nodes)
}

fn request(metrics: Vec<LeafMetric>, views: Vec<HierarchyView>) -> AttributionRequest {
    AttributionRequest {
        periods: PeriodPair::new(PeriodId::new("FY23"), PeriodId::new("FY24")),
        metrics,
        views: HierarchyDefinition::new(views),
        filter: None,
    }
}

fn attribute(request: &AttributionRequest) -> Result<AttributionReport, TestCaseError> {
    DeterministicAttributionEngine::default()
        .attribute(request)
        .map_err(|error| TestCaseError::fail(format!("attribution failed: {error}")))
}

proptest! {
    #[test]
    fn every_node_has_zero_residual(leaves in prop::collection::vec(leaf_case(), 1..8)) {
        let report = attribute(&request(metrics(&leaves), vec![grouped_view(&leaves)]))?;

        prop_assert_eq!(report.results.len(), grouped_node_count(&leaves));
        for result in report.results.iter() {
            prop_assert_eq!(
                result.residual(),
                Decimal::ZERO,
                "residual at {}/{}",
                result.view,
                result.node_id
            );
            if result.kind == NodeKind::Leaf {
                prop_assert_eq!(result.mix_effect, Decimal::ZERO);
            }
        }
    }

    #[test]
    fn totals_agree_across_groupings(leaves in prop::collection::vec(leaf_case(), 1..8)) {
        let report = attribute(&request(
            metrics(&leaves),
            vec![flat_view(&leaves), grouped_view(&leaves)],
        ))?;

        let total = NodeId::new("TOTAL");
        let flat = report.results.node(&ViewName::new("flat"), &total);
        let grouped = report.results.node(&ViewName::new("grouped"), &total);
        prop_assert!(flat.is_some() && grouped.is_some());
        if let (Some(flat), Some(grouped)) = (flat, grouped) {
            prop_assert_eq!(flat.price_effect, grouped.price_effect);
            prop_assert_eq!(flat.volume_and_mix(), grouped.volume_and_mix());
            prop_assert_eq!(flat.volume_effect, grouped.volume_effect);
        }
    }

    #[test]
    fn input_order_does_not_change_results(
        (leaves, metric_order, node_order) in prop::collection::vec(leaf_case(), 1..8)
            .prop_flat_map(|leaves| {
                let metric_count = leaves.len() * 2;
                let node_count = grouped_node_count(&leaves);
                (
                    Just(leaves),
                    Just((0..metric_count).collect::<Vec<_>>()).prop_shuffle(),
                    Just((0..node_count).collect::<Vec<_>>()).prop_shuffle(),
                )
            })
    ) {
        let ordered = attribute(&request(metrics(&leaves), vec![grouped_view(&leaves)]))?;

        let source_metrics = metrics(&leaves);
        let shuffled_metrics = metric_order.iter().map(|index| source_metrics[*index].clone()).collect();
        let source_view = grouped_view(&leaves);
        let shuffled_nodes = node_order.iter().map(|index| source_view.nodes[*index].clone()).collect();
        let shuffled = attribute(&request(
            shuffled_metrics,
            vec![HierarchyView::new("grouped", shuffled_nodes)],
        ))?;

        prop_assert_eq!(&ordered.results, &shuffled.results);
        prop_assert_eq!(ordered.fingerprint, shuffled.fingerprint);
    }

    #[test]
    fn repeated_runs_are_identical(leaves in prop::collection::vec(leaf_case(), 1..6)) {
        let request = request(metrics(&leaves), vec![flat_view(&leaves), grouped_view(&leaves)]);

        let first = attribute(&request)?;
        let second = attribute(&request)?;
        prop_assert_eq!(first, second);
    }
}

fn grouped_node_count(leaves: &[LeafCase]) -> usize {
    let used_groups =
        (0..GROUPS.len()).filter(|group| leaves.iter().any(|leaf| leaf.group == *group)).count();
    leaves.len() + used_groups + 1
}
