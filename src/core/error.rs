//! 协同内核错误类型
//!
//! 单个能力的失败（超时、服务错误、熔断）不走这里，而是作为 DecisionResult 中的 InvocationError 返回；
//! CouncilError 只表示整个请求无法继续的情况。

use thiserror::Error;

use crate::orchestrator::PlanError;

#[derive(Error, Debug)]
pub enum CouncilError {
    /// 必需阶段中没有任何启用且熔断器放行的能力；未发起任何调用
    #[error("No capability available for stage '{stage}' (requested: {requested:?})")]
    NoCapabilityAvailable {
        stage: String,
        requested: Vec<String>,
    },

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid plan: {0}")]
    InvalidPlan(#[from] PlanError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl CouncilError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CouncilError::Cancelled)
    }
}
