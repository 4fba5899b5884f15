pub mod config;
pub mod domain;
pub mod errors;
pub mod pvm;

pub use config::{AppConfig, ConfigError, EngineConfig, LoadOptions, LogFormat};
pub use domain::hierarchy::{
    HierarchyDefinition, HierarchyNode, HierarchyView, NodeId, NodeKind, ViewName,
};
pub use domain::metric::{EntityId, LeafMetric, ObservationStore};
pub use domain::period::{PeriodId, PeriodPair};
pub use domain::result::{DecompositionResult, DiagnosticFlag, ResultSet};
pub use errors::{
    ApplicationError, EngineError, HierarchyIntegrityError, IntegrityError, InterfaceError,
    LeafIssue, MetricError, ValidationWarning,
};
pub use pvm::bridge::RevenueBridge;
pub use pvm::leaf::{CrossTermPolicy, LeafDecomposer, StandardLeafDecomposer};
pub use pvm::validate::Tolerance;
pub use pvm::{
    AttributionReport, AttributionRequest, AttributionRuntime, DeterministicAttributionEngine,
    EngineSettings, SubtreeFilter,
};
