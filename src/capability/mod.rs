//! 能力层：角色与回答、注册表、熔断器、表现指标、调用器与后台补充调用

pub mod breaker;
pub mod enrichment;
pub mod invoker;
pub mod metrics;
pub mod payload;
pub mod registry;
pub mod result;

pub use breaker::{
    Admission, BreakerBank, BreakerConfig, BreakerSnapshot, BreakerState, CallStats,
    CircuitBreaker,
};
pub use enrichment::{Enricher, EnrichmentCache, EnrichmentFailure, ERROR_CHANNEL_CAPACITY};
pub use invoker::CapabilityInvoker;
pub use metrics::{CapabilityMetrics, MetricsTable, Trend};
pub use payload::{
    normalize, CapabilityRole, DiagnosisAnswer, GeneralAnswer, Payload, RiskAnswer, RiskLevel,
    Tier, TreatmentAnswer, TriageAnswer, Urgency,
};
pub use registry::{default_catalog, CapabilityDescriptor, CapabilityRegistry};
pub use result::{DecisionResult, InvocationError};
