//! LLM 客户端抽象
//!
//! 后端（OpenAI 兼容 / Mock）实现 LlmClient::complete；推理服务适配层在其上解析结构化回答。

use async_trait::async_trait;
use serde::Serialize;

use crate::llm::Message;

/// 累计 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 不统计用量的后端返回全零
    fn token_usage(&self) -> TokenUsage {
        TokenUsage::default()
    }
}
