use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::hierarchy::{NodeId, ViewName};
use crate::domain::metric::EntityId;
use crate::domain::period::PeriodId;

/// Checked decimal arithmetic left the representable range.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("decimal overflow")]
pub struct DecimalOverflow;

/// A metric row that cannot be used.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricError {
    #[error("negative price {price} for `{entity}` in period `{period}`")]
    NegativePrice { entity: EntityId, period: PeriodId, price: Decimal },
    #[error("negative volume {volume} for `{entity}` in period `{period}`")]
    NegativeVolume { entity: EntityId, period: PeriodId, volume: Decimal },
    #[error("{count} observations for `{entity}` in period `{period}` (expected one)")]
    DuplicateObservation { entity: EntityId, period: PeriodId, count: usize },
    #[error("{quantity} for `{entity}` is outside the decimal range")]
    Overflow { entity: EntityId, quantity: String },
}

impl MetricError {
    pub fn entity(&self) -> &EntityId {
        match self {
            Self::NegativePrice { entity, .. }
            | Self::NegativeVolume { entity, .. }
            | Self::DuplicateObservation { entity, .. }
            | Self::Overflow { entity, .. } => entity,
        }
    }
}

/// Why a leaf was excluded. Recovered locally: the leaf is dropped and its
/// ancestors are flagged.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafIssue {
    #[error("invalid metric: {0}")]
    InvalidMetric(MetricError),
    #[error("incomplete observation for `{entity}`: missing period(s) {}", join_periods(.missing))]
    IncompleteObservation { entity: EntityId, missing: Vec<PeriodId> },
}

impl LeafIssue {
    pub fn entity(&self) -> &EntityId {
        match self {
            Self::InvalidMetric(error) => error.entity(),
            Self::IncompleteObservation { entity, .. } => entity,
        }
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::IncompleteObservation { .. })
    }
}

/// A leaf issue tied to the view it was excluded from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafExclusion {
    pub view: ViewName,
    pub issue: LeafIssue,
}

/// Structural defect in one view. The whole view is aborted.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HierarchyIntegrityError {
    #[error("view has no nodes")]
    EmptyView,
    #[error("node `{node}` is declared more than once")]
    DuplicateNode { node: NodeId },
    #[error("view has no total node")]
    MissingTotal,
    #[error("view has {} total nodes (expected one)", .totals.len())]
    MultipleTotals { totals: Vec<NodeId> },
    #[error("total node `{node}` is referenced as a child of `{parent}`")]
    TotalHasParent { node: NodeId, parent: NodeId },
    #[error("node `{parent}` references undeclared child `{child}`")]
    DanglingChild { parent: NodeId, child: NodeId },
    #[error("node `{node}` is claimed by {} parents", .parents.len())]
    MultipleParents { node: NodeId, parents: Vec<NodeId> },
    #[error("cycle detected through node `{node}`")]
    Cycle { node: NodeId },
    #[error("leaf node `{node}` declares children")]
    LeafWithChildren { node: NodeId },
    #[error("node `{node}` is not reachable from the total node")]
    Unreachable { node: NodeId },
}

/// A view that failed structural validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewFailure {
    pub view: ViewName,
    pub error: HierarchyIntegrityError,
}

/// Consistency violation found after aggregation. Signals a logic defect and
/// fails the whole run.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityError {
    #[error("node `{node}` in view `{view}` is not additive (residual {residual})")]
    AdditivityViolation { view: ViewName, node: NodeId, residual: Decimal },
    #[error(
        "node `{node}` in view `{view}` {field} rollup {actual} does not match direct recomputation {expected}"
    )]
    RollupMismatch {
        view: ViewName,
        node: NodeId,
        field: String,
        expected: Decimal,
        actual: Decimal,
    },
    #[error("node `{node}` in view `{view}` has no result")]
    MissingResult { view: ViewName, node: NodeId },
    #[error("excluded leaf `{node}` in view `{view}` has a result")]
    UnexpectedResult { view: ViewName, node: NodeId },
    #[error("leaf `{node}` in view `{view}` carries a non-zero mix effect {mix_effect}")]
    LeafMixEffect { view: ViewName, node: NodeId, mix_effect: Decimal },
    #[error("checking {field} for node `{node}` in view `{view}` left the decimal range")]
    ArithmeticOverflow { view: ViewName, node: NodeId, field: String },
    #[error("total {field} differs between view `{left}` ({left_value}) and view `{right}` ({right_value})")]
    CrossViewMismatch {
        field: String,
        left: ViewName,
        left_value: Decimal,
        right: ViewName,
        right_value: Decimal,
    },
}

/// Non-fatal observation surfaced for the caller to log.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationWarning {
    #[error("observations for `{entity}` are not referenced by any view")]
    UnusedObservation { entity: EntityId },
    #[error("views `{left}` and `{right}` include different leaf sets; cross-view totals not compared")]
    LeafSetMismatch { left: ViewName, right: ViewName },
    #[error("cross-view totals not compared for a subtree-filtered run")]
    CrossViewCheckSkipped,
    #[error("consistency validation disabled by configuration")]
    ValidationDisabled,
}

/// Failure of a whole run, returned as `Err`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("baseline and current period are both `{period}`")]
    SamePeriod { period: PeriodId },
    #[error("no hierarchy views supplied")]
    NoViews,
    #[error("view `{0}` is declared more than once")]
    DuplicateView(ViewName),
    #[error("filter references unknown view `{0}`")]
    UnknownView(ViewName),
    #[error("filter references node `{node}` missing from view `{view}`")]
    UnknownNode { view: ViewName, node: NodeId },
    #[error("filtered view `{view}` failed structural validation: {error}")]
    FilteredViewInvalid { view: ViewName, error: HierarchyIntegrityError },
    #[error("{quantity} at node `{node}` in view `{view}` is outside the decimal range")]
    Overflow { view: ViewName, node: NodeId, quantity: String },
    #[error("consistency validation failed with {} violation(s)", .0.len())]
    Integrity(Vec<IntegrityError>),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("input failure: {0}")]
    Input(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. } | Self::Internal { correlation_id, .. } => {
                correlation_id
            }
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::Engine(EngineError::Integrity(violations)) => Self::Internal {
                message: format!("{} consistency violation(s)", violations.len()),
                correlation_id: "unassigned".to_owned(),
            },
            ApplicationError::Engine(error) => Self::BadRequest {
                message: error.to_string(),
                correlation_id: "unassigned".to_owned(),
            },
            ApplicationError::Input(message) => {
                Self::BadRequest { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}

fn join_periods(periods: &[PeriodId]) -> String {
    periods.iter().map(PeriodId::as_str).collect::<Vec<_>>().join(", ")
}
