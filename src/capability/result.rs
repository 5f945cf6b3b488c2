//! 单次调用结果
//!
//! DecisionResult 每次调用只产生一次，之后不可变；失败也以结果形式返回，不会以错误向上传播。

use serde::Serialize;
use thiserror::Error;

use crate::capability::Payload;

/// 调用失败原因（可克隆、可序列化，随结果一起保存）
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvocationError {
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("service error: {message}")]
    Service { message: String },

    #[error("malformed answer: {message}")]
    MalformedAnswer { message: String },

    /// 熔断器打开，未发起调用
    #[error("unavailable, retry in {retry_in_ms}ms")]
    Unavailable { retry_in_ms: u64 },

    #[error("capability disabled")]
    Disabled,

    #[error("cancelled")]
    Cancelled,

    #[error("unknown capability")]
    UnknownCapability,
}

impl InvocationError {
    /// 可按重试策略重试的失败
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InvocationError::Timeout { .. }
                | InvocationError::Service { .. }
                | InvocationError::MalformedAnswer { .. }
        )
    }

    /// 没有真正发起调用的失败（不计入学习）
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            InvocationError::Unavailable { .. }
                | InvocationError::Disabled
                | InvocationError::Cancelled
                | InvocationError::UnknownCapability
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            InvocationError::Timeout { .. } => "timeout",
            InvocationError::Service { .. } => "service_error",
            InvocationError::MalformedAnswer { .. } => "malformed_answer",
            InvocationError::Unavailable { .. } => "unavailable",
            InvocationError::Disabled => "disabled",
            InvocationError::Cancelled => "cancelled",
            InvocationError::UnknownCapability => "unknown_capability",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionResult {
    pub capability_id: String,
    pub input: String,
    pub answer: Option<Payload>,
    /// 0-100
    pub confidence: f64,
    pub latency_ms: u64,
    pub success: bool,
    pub error: Option<InvocationError>,
    /// Unix 毫秒
    pub timestamp: i64,
}

impl DecisionResult {
    pub fn succeeded(
        capability_id: impl Into<String>,
        input: impl Into<String>,
        answer: Payload,
        confidence: f64,
        latency_ms: u64,
    ) -> Self {
        Self {
            capability_id: capability_id.into(),
            input: input.into(),
            answer: Some(answer),
            confidence: confidence.clamp(0.0, 100.0),
            latency_ms,
            success: true,
            error: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn failed(
        capability_id: impl Into<String>,
        input: impl Into<String>,
        error: InvocationError,
        latency_ms: u64,
    ) -> Self {
        Self {
            capability_id: capability_id.into(),
            input: input.into(),
            answer: None,
            confidence: 0.0,
            latency_ms,
            success: false,
            error: Some(error),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 结果是否反映能力本身的表现（用于学习与记忆）
    pub fn is_outcome(&self) -> bool {
        self.error.as_ref().map_or(true, |e| !e.is_unavailable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{GeneralAnswer, Payload};

    #[test]
    fn test_confidence_clamped() {
        let r = DecisionResult::succeeded(
            "x",
            "in",
            Payload::General(GeneralAnswer {
                summary: "ok".to_string(),
            }),
            130.0,
            5,
        );
        assert_eq!(r.confidence, 100.0);
        assert!(r.is_outcome());
    }

    #[test]
    fn test_error_classes() {
        assert!(InvocationError::Timeout { after_ms: 10 }.is_transient());
        assert!(!InvocationError::Cancelled.is_transient());
        let r = DecisionResult::failed("x", "in", InvocationError::Disabled, 0);
        assert!(!r.is_outcome());
        let json = serde_json::to_value(&r.error).unwrap();
        assert_eq!(json["kind"], "disabled");
    }
}
