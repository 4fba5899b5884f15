use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::hierarchy::{NodeId, ViewName};
use crate::domain::period::PeriodId;
use crate::domain::result::DecompositionResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStage {
    BaselineRevenue,
    Price,
    Volume,
    Mix,
    CurrentRevenue,
}

impl BridgeStage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::BaselineRevenue => "baseline revenue",
            Self::Price => "price effect",
            Self::Volume => "volume effect",
            Self::Mix => "mix effect",
            Self::CurrentRevenue => "current revenue",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStep {
    pub stage: BridgeStage,
    pub amount: Decimal,
    pub running_total: Decimal,
}

/// Waterfall from baseline to current revenue for one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueBridge {
    pub view: ViewName,
    pub node_id: NodeId,
    pub baseline: PeriodId,
    pub current: PeriodId,
    pub steps: Vec<BridgeStep>,
}

impl RevenueBridge {
    pub fn from_result(result: &DecompositionResult) -> Self {
        let mut running_total = result.revenue_baseline;
        let mut steps = vec![BridgeStep {
            stage: BridgeStage::BaselineRevenue,
            amount: result.revenue_baseline,
            running_total,
        }];

        for (stage, amount) in [
            (BridgeStage::Price, result.price_effect),
            (BridgeStage::Volume, result.volume_effect),
            (BridgeStage::Mix, result.mix_effect),
        ] {
            running_total += amount;
            steps.push(BridgeStep { stage, amount, running_total });
        }

        steps.push(BridgeStep {
            stage: BridgeStage::CurrentRevenue,
            amount: result.revenue_current,
            running_total: result.revenue_current,
        });

        Self {
            view: result.view.clone(),
            node_id: result.node_id.clone(),
            baseline: result.baseline.clone(),
            current: result.current.clone(),
            steps,
        }
    }

    /// Running total after the mix step minus current revenue.
    pub fn closing_gap(&self) -> Decimal {
        let bridged = self
            .steps
            .iter()
            .rev()
            .find(|step| step.stage == BridgeStage::Mix)
            .map(|step| step.running_total)
            .unwrap_or_default();
        let current = self
            .steps
            .last()
            .map(|step| step.running_total)
            .unwrap_or_default();
        bridged - current
    }

    pub fn render_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "revenue bridge {} / {} ({} -> {})",
            self.view, self.node_id, self.baseline, self.current
        )];
        for step in &self.steps {
            lines.push(format!(
                "  {:<18} {:>20} {:>20}",
                step.stage.label(),
                step.amount.normalize(),
                step.running_total.normalize()
            ));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::{BridgeStage, RevenueBridge};
    use crate::domain::hierarchy::{NodeId, NodeKind, ViewName};
    use crate::domain::period::PeriodId;
    use crate::domain::result::DecompositionResult;

    fn sku_001() -> DecompositionResult {
        DecompositionResult {
            view: ViewName::new("by_product"),
            node_id: NodeId::new("SKU-001"),
            kind: NodeKind::Leaf,
            baseline: PeriodId::new("FY23"),
            current: PeriodId::new("FY24"),
            price_effect: dec!(884000),
            volume_effect: dec!(817600),
            mix_effect: Decimal::ZERO,
            revenue_baseline: dec!(6798400),
            revenue_current: dec!(8500000),
            volume_baseline: dec!(607),
            volume_current: dec!(680),
            leaf_count: 1,
            flags: BTreeSet::new(),
            excluded_leaves: BTreeSet::new(),
        }
    }

    #[test]
    fn bridge_walks_from_baseline_to_current() {
        let bridge = RevenueBridge::from_result(&sku_001());

        let stages = bridge.steps.iter().map(|step| step.stage).collect::<Vec<_>>();
        assert_eq!(
            stages,
            vec![
                BridgeStage::BaselineRevenue,
                BridgeStage::Price,
                BridgeStage::Volume,
                BridgeStage::Mix,
                BridgeStage::CurrentRevenue,
            ]
        );
        assert_eq!(bridge.steps[1].running_total, dec!(7682400));
        assert_eq!(bridge.steps[3].running_total, dec!(8500000));
        assert_eq!(bridge.closing_gap(), Decimal::ZERO);
    }

    #[test]
    fn rendered_bridge_names_node_and_periods() {
        let lines = RevenueBridge::from_result(&sku_001()).render_lines();

        assert_eq!(lines[0], "revenue bridge by_product / SKU-001 (FY23 -> FY24)");
        assert_eq!(lines.len(), 6);
        assert!(lines[2].contains("price effect"));
        assert!(lines[2].contains("884000"));
    }
}
