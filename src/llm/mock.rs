//! Mock 客户端与脚本化推理服务（用于测试与演示，无需 API）
//!
//! - MockLlmClient：返回固定回复；未设置时回显最后一条 User 消息
//! - ScriptedService：按能力 ID 预设回答/失败/挂起，并记录调用先后顺序（用于校验阶段屏障）

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::{
    LlmClient, Message, ReasoningService, Role, ServiceError, ServiceReply, ServiceRequest,
};

/// Mock LLM 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    reply: Option<String>,
}

impl MockLlmClient {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Some(reply) = &self.reply {
            return Ok(reply.clone());
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(serde_json::json!({
            "answer": { "summary": format!("Echo from Mock: {last_user}") },
            "confidence": 50
        })
        .to_string())
    }
}

/// 单次调用的脚本
#[derive(Debug, Clone)]
pub enum Script {
    Reply {
        answer: Value,
        confidence: f64,
        delay: Duration,
    },
    Fail(String),
    /// 永不返回（用于超时与取消）
    Hang,
}

/// 调用记录：started / finished 为全局递增序号
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub capability_id: String,
    pub started: usize,
    pub finished: Option<usize>,
}

/// 脚本化推理服务：一次性脚本（队列）优先，其次为常驻脚本，均未设置时返回失败
#[derive(Debug, Default)]
pub struct ScriptedService {
    queued: Mutex<HashMap<String, VecDeque<Script>>>,
    sticky: Mutex<HashMap<String, Script>>,
    clock: AtomicUsize,
    records: Mutex<Vec<CallRecord>>,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, capability_id: &str, answer: Value, confidence: f64) -> Self {
        self.reply_after(capability_id, answer, confidence, Duration::ZERO)
    }

    pub fn reply_after(
        self,
        capability_id: &str,
        answer: Value,
        confidence: f64,
        delay: Duration,
    ) -> Self {
        self.set(
            capability_id,
            Script::Reply {
                answer,
                confidence,
                delay,
            },
        );
        self
    }

    pub fn failing(self, capability_id: &str, message: &str) -> Self {
        self.set(capability_id, Script::Fail(message.to_string()));
        self
    }

    pub fn hanging(self, capability_id: &str) -> Self {
        self.set(capability_id, Script::Hang);
        self
    }

    /// 替换常驻脚本
    pub fn set(&self, capability_id: &str, script: Script) {
        self.sticky
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(capability_id.to_string(), script);
    }

    /// 追加一次性脚本
    pub fn push(&self, capability_id: &str, script: Script) {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(capability_id.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn call_count(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn calls_for(&self, capability_id: &str) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.capability_id == capability_id)
            .count()
    }

    pub fn records(&self) -> Vec<CallRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_script(&self, capability_id: &str) -> Option<Script> {
        let queued = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(capability_id)
            .and_then(VecDeque::pop_front);
        queued.or_else(|| {
            self.sticky
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(capability_id)
                .cloned()
        })
    }

    fn start(&self, capability_id: &str) -> usize {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.push(CallRecord {
            capability_id: capability_id.to_string(),
            started: self.clock.fetch_add(1, Ordering::SeqCst),
            finished: None,
        });
        records.len() - 1
    }

    fn finish(&self, index: usize) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = records.get_mut(index) {
            record.finished = Some(self.clock.fetch_add(1, Ordering::SeqCst));
        }
    }
}

#[async_trait]
impl ReasoningService for ScriptedService {
    async fn call(&self, request: &ServiceRequest) -> Result<ServiceReply, ServiceError> {
        let script = self.next_script(&request.capability_id);
        let index = self.start(&request.capability_id);
        match script {
            Some(Script::Reply {
                answer,
                confidence,
                delay,
            }) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                self.finish(index);
                Ok(ServiceReply { answer, confidence })
            }
            Some(Script::Fail(message)) => {
                self.finish(index);
                Err(ServiceError::Other(message))
            }
            Some(Script::Hang) => std::future::pending().await,
            None => {
                self.finish(index);
                Err(ServiceError::Other(format!(
                    "no script for capability '{}'",
                    request.capability_id
                )))
            }
        }
    }
}
