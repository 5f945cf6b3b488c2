//! 推理服务契约
//!
//! 每个能力通过 ReasoningService::call 提出一个窄问题：输入文本 + 系统上下文 → 结构化回答 + 置信度。
//! 服务本身不可靠（可能失败或超时），所有调用都由熔断器与调用器兜底。
//! LlmReasoningService 把任意 LlmClient 适配为推理服务：要求模型只输出 `{"answer": {...}, "confidence": n}`。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::llm::{LlmClient, Message};

/// 单次调用请求
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub capability_id: String,
    /// 记忆层给出的能力相关上下文（已渲染为文本）
    pub system_context: String,
    pub user_input: String,
}

/// 服务返回：结构化回答（按能力角色解码）与置信度（0-100）
#[derive(Debug, Clone)]
pub struct ServiceReply {
    pub answer: serde_json::Value,
    pub confidence: f64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed reply: {0}")]
    MalformedReply(String),

    #[error("rate limited")]
    RateLimited,

    #[error("service error: {0}")]
    Other(String),
}

/// 外部推理服务 trait
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn call(&self, request: &ServiceRequest) -> Result<ServiceReply, ServiceError>;
}

#[derive(Deserialize)]
struct RawReply {
    answer: serde_json::Value,
    confidence: f64,
}

/// 基于 LLM 的推理服务：system 消息为上下文，user 消息为输入，回复须为 JSON
pub struct LlmReasoningService {
    llm: Arc<dyn LlmClient>,
}

impl LlmReasoningService {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ReasoningService for LlmReasoningService {
    async fn call(&self, request: &ServiceRequest) -> Result<ServiceReply, ServiceError> {
        let messages = vec![
            Message::system(request.system_context.clone()),
            Message::user(request.user_input.clone()),
        ];
        let raw = self
            .llm
            .complete(&messages)
            .await
            .map_err(ServiceError::Transport)?;
        parse_reply(&raw)
    }
}

/// 解析模型回复；允许外层包裹 ``` 代码块
pub fn parse_reply(raw: &str) -> Result<ServiceReply, ServiceError> {
    let body = strip_code_fence(raw.trim());
    let parsed: RawReply =
        serde_json::from_str(body).map_err(|e| ServiceError::MalformedReply(e.to_string()))?;
    if !parsed.confidence.is_finite() {
        return Err(ServiceError::MalformedReply(
            "confidence is not a finite number".to_string(),
        ));
    }
    Ok(ServiceReply {
        answer: parsed.answer,
        confidence: parsed.confidence,
    })
}

fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
