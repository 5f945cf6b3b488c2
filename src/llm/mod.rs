//! LLM 与推理服务层：客户端抽象与实现（OpenAI 兼容 / Mock）、推理服务契约与脚本化实现

pub mod message;
pub mod mock;
pub mod openai;
pub mod reasoning;
pub mod traits;

pub use message::{Message, Role};
pub use mock::{CallRecord, MockLlmClient, Script, ScriptedService};
pub use openai::OpenAiClient;
pub use reasoning::{
    parse_reply, LlmReasoningService, ReasoningService, ServiceError, ServiceReply, ServiceRequest,
};
pub use traits::{LlmClient, TokenUsage};
