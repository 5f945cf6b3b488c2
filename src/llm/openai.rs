//! OpenAI 兼容推理后端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。
//! 推理请求固定为 system + user 两条消息，低温度以便回答稳定可解码。

use std::sync::atomic::{AtomicU64, Ordering};

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::config::LlmSection;
use crate::llm::{LlmClient, Message, Role, TokenUsage};

const DEFAULT_TEMPERATURE: f32 = 0.2;

#[derive(Debug, Default)]
struct UsageCounter {
    prompt: AtomicU64,
    completion: AtomicU64,
}

impl UsageCounter {
    fn add(&self, prompt: u64, completion: u64) {
        self.prompt.fetch_add(prompt, Ordering::Relaxed);
        self.completion.fetch_add(completion, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TokenUsage {
        let prompt = self.prompt.load(Ordering::Relaxed);
        let completion = self.completion.load(Ordering::Relaxed);
        TokenUsage {
            prompt,
            completion,
            total: prompt + completion,
        }
    }
}

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    usage: UsageCounter,
}

impl OpenAiClient {
    /// api_key 未给出时读取 OPENAI_API_KEY
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        if api_key.is_empty() {
            tracing::warn!("No API key configured for OpenAI-compatible backend");
        }

        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            usage: UsageCounter::default(),
        }
    }

    pub fn from_section(section: &LlmSection) -> Self {
        Self::new(
            section.base_url.as_deref(),
            &section.model,
            section.api_key.as_deref(),
        )
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }
}

fn to_request_message(m: &Message) -> Result<ChatCompletionRequestMessage, String> {
    let built = match m.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(m.content.clone())
            .build()
            .map(ChatCompletionRequestMessage::System),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(m.content.clone())
            .build()
            .map(ChatCompletionRequestMessage::User),
    };
    built.map_err(|e| e.to_string())
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let messages = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>, _>>()?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(self.temperature)
            .messages(messages)
            .build()
            .map_err(|e| e.to_string())?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
            tracing::debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Completion received"
            );
        }

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| "empty completion".to_string())
    }

    fn token_usage(&self) -> TokenUsage {
        self.usage.snapshot()
    }
}
