use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::hierarchy::{NodeId, NodeKind, ViewName};
use crate::domain::metric::EntityId;
use crate::domain::period::PeriodId;

/// Diagnostic markers attached to a node result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticFlag {
    /// Zero baseline volume: the whole change is volume.
    NewEntity,
    /// Zero current volume: the whole change is volume.
    DiscontinuedEntity,
    /// Children had zero combined baseline volume, so the whole volume side is mix.
    UndefinedGrowthRate,
    /// At least one leaf in the subtree was excluded.
    Degraded,
    /// At least one leaf in the subtree was excluded for missing a period.
    IncompleteObservation,
}

impl DiagnosticFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewEntity => "new_entity",
            Self::DiscontinuedEntity => "discontinued_entity",
            Self::UndefinedGrowthRate => "undefined_growth_rate",
            Self::Degraded => "degraded",
            Self::IncompleteObservation => "incomplete_observation",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompositionResult {
    pub view: ViewName,
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub baseline: PeriodId,
    pub current: PeriodId,
    pub price_effect: Decimal,
    pub volume_effect: Decimal,
    pub mix_effect: Decimal,
    pub revenue_baseline: Decimal,
    pub revenue_current: Decimal,
    pub volume_baseline: Decimal,
    pub volume_current: Decimal,
    pub leaf_count: usize,
    pub flags: BTreeSet<DiagnosticFlag>,
    pub excluded_leaves: BTreeSet<EntityId>,
}

impl DecompositionResult {
    pub fn key(&self) -> ResultKey {
        ResultKey {
            view: self.view.clone(),
            node: self.node_id.clone(),
            baseline: self.baseline.clone(),
            current: self.current.clone(),
        }
    }

    pub fn revenue_change(&self) -> Decimal {
        self.revenue_current - self.revenue_baseline
    }

    pub fn volume_and_mix(&self) -> Decimal {
        self.volume_effect + self.mix_effect
    }

    pub fn total_effect(&self) -> Decimal {
        self.price_effect + self.volume_effect + self.mix_effect
    }

    /// Effects minus revenue change; zero when the node is additive.
    pub fn residual(&self) -> Decimal {
        self.total_effect() - self.revenue_change()
    }

    pub fn has_flag(&self, flag: DiagnosticFlag) -> bool {
        self.flags.contains(&flag)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResultKey {
    pub view: ViewName,
    pub node: NodeId,
    pub baseline: PeriodId,
    pub current: PeriodId,
}

/// Ordered, immutable output of one run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<DecompositionResult>", into = "Vec<DecompositionResult>")]
pub struct ResultSet {
    entries: BTreeMap<ResultKey, DecompositionResult>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, result: DecompositionResult) -> Option<DecompositionResult> {
        self.entries.insert(result.key(), result)
    }

    pub fn extend(&mut self, results: impl IntoIterator<Item = DecompositionResult>) {
        for result in results {
            self.insert(result);
        }
    }

    pub fn get(&self, key: &ResultKey) -> Option<&DecompositionResult> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &ResultKey) -> Option<&mut DecompositionResult> {
        self.entries.get_mut(key)
    }

    /// First row of `node` in `view`. Keys order by view and node before the
    /// period pair, so this is a range seek from the smallest pair.
    pub fn node(&self, view: &ViewName, node: &NodeId) -> Option<&DecompositionResult> {
        let lower = ResultKey {
            view: view.clone(),
            node: node.clone(),
            baseline: PeriodId::new(""),
            current: PeriodId::new(""),
        };
        self.entries
            .range(lower..)
            .next()
            .filter(|(key, _)| &key.view == view && &key.node == node)
            .map(|(_, result)| result)
    }

    pub fn view_results<'a>(
        &'a self,
        view: &'a ViewName,
    ) -> impl Iterator<Item = &'a DecompositionResult> + 'a {
        self.entries.values().filter(move |result| &result.view == view)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DecompositionResult> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// SHA-256 over a canonical rendering of every row, in key order.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for result in self.entries.values() {
            hasher.update(canonical_row(result).as_bytes());
            hasher.update(b"\n");
        }
        encode_hex(hasher.finalize().as_slice())
    }
}

impl From<Vec<DecompositionResult>> for ResultSet {
    fn from(value: Vec<DecompositionResult>) -> Self {
        let mut set = Self::new();
        set.extend(value);
        set
    }
}

impl From<ResultSet> for Vec<DecompositionResult> {
    fn from(value: ResultSet) -> Self {
        value.entries.into_values().collect()
    }
}

fn canonical_row(result: &DecompositionResult) -> String {
    let flags = result.flags.iter().map(DiagnosticFlag::as_str).collect::<Vec<_>>().join(",");
    let excluded =
        result.excluded_leaves.iter().map(|entity| entity.0.as_str()).collect::<Vec<_>>().join(",");
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        result.view,
        result.node_id,
        result.baseline,
        result.current,
        result.price_effect,
        result.volume_effect,
        result.mix_effect,
        result.revenue_baseline,
        result.revenue_current,
        result.volume_baseline,
        result.volume_current,
        result.leaf_count,
        flags,
        excluded,
    )
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
