//! 后台补充调用（fire-and-forget）
//!
//! 决策返回后对计划中的 background 能力发起独立任务，结果只写入尽力而为的缓存，
//! 失败经独立的有界错误通道上报，通道满（或无人消费）时丢弃，不影响主流程。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capability::{CapabilityInvoker, DecisionResult, InvocationError};
use crate::memory::ContextBundle;

/// 错误通道容量；无人消费时最多保留这么多条
pub const ERROR_CHANNEL_CAPACITY: usize = 64;

/// 补充结果缓存：按能力 ID 保留最近一次成功结果
#[derive(Default)]
pub struct EnrichmentCache {
    entries: RwLock<HashMap<String, DecisionResult>>,
}

impl EnrichmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, capability_id: &str) -> Option<DecisionResult> {
        self.entries.read().await.get(capability_id).cloned()
    }

    pub async fn insert(&self, result: DecisionResult) {
        self.entries
            .write()
            .await
            .insert(result.capability_id.clone(), result);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

/// 补充调用失败
#[derive(Debug, Clone)]
pub struct EnrichmentFailure {
    pub capability_id: String,
    pub error: InvocationError,
}

pub struct Enricher {
    invoker: Arc<CapabilityInvoker>,
    cache: Arc<EnrichmentCache>,
    errors_tx: mpsc::Sender<EnrichmentFailure>,
    errors_rx: Mutex<Option<mpsc::Receiver<EnrichmentFailure>>>,
}

impl Enricher {
    pub fn new(invoker: Arc<CapabilityInvoker>, cache: Arc<EnrichmentCache>) -> Self {
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            invoker,
            cache,
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        }
    }

    pub fn cache(&self) -> &Arc<EnrichmentCache> {
        &self.cache
    }

    /// 取走错误接收端（只能取一次）
    pub async fn take_error_receiver(&self) -> Option<mpsc::Receiver<EnrichmentFailure>> {
        self.errors_rx.lock().await.take()
    }

    /// 发起独立的后台调用；返回句柄仅供测试等待
    pub fn spawn(
        &self,
        capability_id: String,
        input: String,
        context: ContextBundle,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let invoker = self.invoker.clone();
        let cache = self.cache.clone();
        let errors = self.errors_tx.clone();
        tokio::spawn(async move {
            let result = invoker.invoke(&capability_id, &input, &context, cancel).await;
            if result.success {
                cache.insert(result).await;
            } else if let Some(error) = result.error {
                tracing::debug!(capability = %capability_id, error = %error, "Enrichment failed");
                let failure = EnrichmentFailure {
                    capability_id,
                    error,
                };
                // 接收端已关闭时同样丢弃
                if let Err(TrySendError::Full(dropped)) = errors.try_send(failure) {
                    tracing::debug!(capability = %dropped.capability_id, "Enrichment error channel full, dropping failure");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as Map;

    use serde_json::json;

    use super::*;
    use crate::capability::{
        BreakerBank, BreakerConfig, CapabilityDescriptor, CapabilityRegistry, CapabilityRole,
    };
    use crate::llm::ScriptedService;
    use crate::observability::EventSink;

    fn enricher(service: ScriptedService) -> Enricher {
        let registry = Arc::new(CapabilityRegistry::from_descriptors(vec![
            CapabilityDescriptor::new("follow_up", CapabilityRole::General),
            CapabilityDescriptor::new("broken", CapabilityRole::General),
        ]));
        let sink = EventSink::default();
        let breakers = Arc::new(BreakerBank::from_registry(
            &registry,
            BreakerConfig::default(),
            &Map::new(),
            sink.clone(),
        ));
        let invoker = Arc::new(CapabilityInvoker::new(
            registry,
            breakers,
            Arc::new(service),
            sink,
        ));
        Enricher::new(invoker, Arc::new(EnrichmentCache::new()))
    }

    #[tokio::test]
    async fn test_success_lands_in_cache() {
        let e = enricher(ScriptedService::new().reply("follow_up", json!({"summary": "recheck"}), 70.0));
        e.spawn(
            "follow_up".to_string(),
            "input".to_string(),
            ContextBundle::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(e.cache().get("follow_up").await.is_some());
    }

    #[tokio::test]
    async fn test_failure_goes_to_error_channel() {
        let e = enricher(ScriptedService::new().failing("broken", "down"));
        let mut rx = e.take_error_receiver().await.unwrap();
        assert!(e.take_error_receiver().await.is_none());
        e.spawn(
            "broken".to_string(),
            "input".to_string(),
            ContextBundle::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let failure = rx.recv().await.unwrap();
        assert_eq!(failure.capability_id, "broken");
        assert_eq!(e.cache().len().await, 0);
    }

    #[tokio::test]
    async fn test_unconsumed_failures_stay_bounded() {
        let e = enricher(ScriptedService::new().failing("broken", "down"));
        for _ in 0..ERROR_CHANNEL_CAPACITY * 3 {
            e.spawn(
                "broken".to_string(),
                "input".to_string(),
                ContextBundle::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        }

        let mut rx = e.take_error_receiver().await.unwrap();
        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, ERROR_CHANNEL_CAPACITY);
    }
}
