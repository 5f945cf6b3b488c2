//! 协同上下文：持有全部共享组件（无全局单例）
//!
//! CouncilContext 拥有注册表、熔断器组、指标、记忆、学习适配器、共识引擎、编排器与后台任务；
//! 会话（Session）通过 Arc<CouncilContext> 共享这些组件。
//! 后台任务（熔断器清扫、元认知循环）由 start_background 启动，shutdown 取消并等待其结束；
//! 测试可直接调用 sweep_now / metacognitive_tick 手动推进。

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::capability::{
    BreakerBank, CapabilityDescriptor, CapabilityInvoker, CapabilityRegistry, Enricher,
    EnrichmentCache, MetricsTable,
};
use crate::config::AppConfig;
use crate::consensus::{ConsensusEngine, StrategySet};
use crate::core::{CouncilError, Session};
use crate::learning::{LearningAdapter, MetacognitiveReport, Metacognition};
use crate::llm::ReasoningService;
use crate::memory::{ContextClassifier, ContextualMemory, KeywordClassifier, MemorySnapshot};
use crate::observability::{CouncilEvent, EventSink};
use crate::orchestrator::{ExecutionPlan, Orchestrator, PlanSupplier, StaticPlan};

pub struct CouncilContext {
    config: AppConfig,
    registry: Arc<CapabilityRegistry>,
    breakers: Arc<BreakerBank>,
    metrics: Arc<MetricsTable>,
    invoker: Arc<CapabilityInvoker>,
    learner: Arc<LearningAdapter>,
    memory: Arc<ContextualMemory>,
    consensus: Arc<ConsensusEngine>,
    orchestrator: Orchestrator,
    enricher: Enricher,
    metacognition: Metacognition,
    plan_supplier: Option<Arc<dyn PlanSupplier>>,
    sink: EventSink,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl CouncilContext {
    pub fn builder(service: Arc<dyn ReasoningService>) -> CouncilBuilder {
        CouncilBuilder::new(service)
    }

    /// 新会话；会话 token 是上下文关闭 token 的子 token
    pub fn session(self: &Arc<Self>) -> Session {
        Session::new(Arc::clone(self), self.shutdown.child_token())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<BreakerBank> {
        &self.breakers
    }

    pub fn metrics(&self) -> &Arc<MetricsTable> {
        &self.metrics
    }

    pub fn invoker(&self) -> &Arc<CapabilityInvoker> {
        &self.invoker
    }

    pub fn learner(&self) -> &Arc<LearningAdapter> {
        &self.learner
    }

    pub fn memory(&self) -> &Arc<ContextualMemory> {
        &self.memory
    }

    pub fn consensus(&self) -> &Arc<ConsensusEngine> {
        &self.consensus
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn enricher(&self) -> &Enricher {
        &self.enricher
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CouncilEvent> {
        self.sink.subscribe()
    }

    /// 当前输入的执行计划：计划提供者优先，否则默认三阶段流水线
    pub fn plan_for(&self, input: &str) -> ExecutionPlan {
        let label = self.memory.current_label();
        self.plan_supplier
            .as_ref()
            .and_then(|s| s.plan(input, label, &self.registry))
            .unwrap_or_else(|| ExecutionPlan::default_pipeline(&self.registry))
    }

    /// 运行期启用/禁用能力，同时重置其熔断器
    pub fn set_enabled(&self, capability_id: &str, enabled: bool) -> Result<(), CouncilError> {
        if !self.registry.set_enabled(capability_id, enabled) {
            return Err(CouncilError::UnknownCapability(capability_id.to_string()));
        }
        self.breakers.reset(capability_id);
        tracing::info!(capability = %capability_id, enabled, "Capability toggled");
        Ok(())
    }

    /// 立即执行一次熔断器清扫，返回发生迁移的数量
    pub fn sweep_now(&self) -> usize {
        self.breakers.sweep(Instant::now())
    }

    pub fn metacognitive_tick(&self) -> MetacognitiveReport {
        self.metacognition.tick(Instant::now())
    }

    /// 启动后台清扫与元认知循环（重复调用无效）
    pub fn start_background(self: &Arc<Self>) {
        let mut handles = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        if !handles.is_empty() || self.shutdown.is_cancelled() {
            return;
        }

        let ctx = Arc::clone(self);
        let token = self.shutdown.child_token();
        let sweep_every = self.config.breaker.sweep_interval();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let moved = ctx.sweep_now();
                        if moved > 0 {
                            tracing::debug!(transitions = moved, "Breaker sweep");
                        }
                    }
                }
            }
        }));

        let ctx = Arc::clone(self);
        let token = self.shutdown.child_token();
        let meta_every = self.config.metacognition.interval();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(meta_every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        ctx.metacognitive_tick();
                    }
                }
            }
        }));
        tracing::info!(
            sweep_ms = sweep_every.as_millis() as u64,
            metacognition_ms = meta_every.as_millis() as u64,
            "Background tasks started"
        );
    }

    /// 取消所有会话与后台任务，并等待后台任务结束
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// 上下文构建器：推理服务必需，其余均有默认值
pub struct CouncilBuilder {
    service: Arc<dyn ReasoningService>,
    config: AppConfig,
    capabilities: Option<Vec<CapabilityDescriptor>>,
    classifier: Option<Arc<dyn ContextClassifier>>,
    plan_supplier: Option<Arc<dyn PlanSupplier>>,
    strategies: Option<StrategySet>,
    snapshot: Option<MemorySnapshot>,
    sink: Option<EventSink>,
}

impl CouncilBuilder {
    pub fn new(service: Arc<dyn ReasoningService>) -> Self {
        Self {
            service,
            config: AppConfig::default(),
            capabilities: None,
            classifier: None,
            plan_supplier: None,
            strategies: None,
            snapshot: None,
            sink: None,
        }
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    /// 覆盖配置中的能力目录
    pub fn with_capabilities(mut self, capabilities: Vec<CapabilityDescriptor>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ContextClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_plan_supplier(mut self, supplier: Arc<dyn PlanSupplier>) -> Self {
        self.plan_supplier = Some(supplier);
        self
    }

    pub fn with_strategies(mut self, strategies: StrategySet) -> Self {
        self.strategies = Some(strategies);
        self
    }

    /// 固定随机种子（探索扰动可复现）
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.learning.seed = Some(seed);
        self
    }

    /// 启动时恢复的情景/语义记忆
    pub fn with_memory_snapshot(mut self, snapshot: MemorySnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_sink(mut self, sink: EventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Arc<CouncilContext>, CouncilError> {
        let config = self.config;
        let capabilities = self
            .capabilities
            .unwrap_or_else(|| config.capabilities.0.clone());
        if capabilities.is_empty() {
            return Err(CouncilError::Config("capability catalog is empty".to_string()));
        }

        let plan_supplier = match self.plan_supplier {
            Some(s) => Some(s),
            None => match &config.app.plan_file {
                Some(path) => {
                    let text = std::fs::read_to_string(path).map_err(|e| {
                        CouncilError::Config(format!("plan file {}: {}", path.display(), e))
                    })?;
                    let plan = ExecutionPlan::from_toml_str(&text)?;
                    Some(Arc::new(StaticPlan(plan)) as Arc<dyn PlanSupplier>)
                }
                None => None,
            },
        };

        let sink = self.sink.unwrap_or_default();
        let registry = Arc::new(CapabilityRegistry::from_descriptors(capabilities));
        let overrides = config.breaker.resolve(&registry.descriptors());
        let breakers = Arc::new(BreakerBank::from_registry(
            &registry,
            config.breaker.base(),
            &overrides,
            sink.clone(),
        ));
        let metrics = Arc::new(MetricsTable::from_registry(&registry));
        let invoker = Arc::new(CapabilityInvoker::new(
            registry.clone(),
            breakers.clone(),
            self.service,
            sink.clone(),
        ));
        let learner = Arc::new(LearningAdapter::new(
            registry.clone(),
            metrics.clone(),
            config.learning.clone(),
            sink.clone(),
        ));

        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(KeywordClassifier::default()));
        let memory = Arc::new(ContextualMemory::new(&config.memory, classifier));
        if let Some(snapshot) = self.snapshot {
            tracing::info!(
                episodes = snapshot.episodes.len(),
                insights = snapshot.insights.len(),
                "Restoring memory snapshot"
            );
            memory.restore(snapshot);
        }

        let mut consensus = ConsensusEngine::new(&config.consensus, metrics.clone(), sink.clone());
        if let Some(strategies) = self.strategies {
            consensus = consensus.with_strategies(strategies);
        }
        let consensus = Arc::new(consensus);

        let orchestrator = Orchestrator::new(
            registry.clone(),
            invoker.clone(),
            learner.clone(),
            memory.clone(),
        );
        let enricher = Enricher::new(invoker.clone(), Arc::new(EnrichmentCache::new()));
        let metacognition = Metacognition::new(
            config.metacognition.clone(),
            learner.clone(),
            consensus.clone(),
            breakers.clone(),
            sink.clone(),
        );

        tracing::info!(capabilities = registry.len(), "Council context ready");
        Ok(Arc::new(CouncilContext {
            config,
            registry,
            breakers,
            metrics,
            invoker,
            learner,
            memory,
            consensus,
            orchestrator,
            enricher,
            metacognition,
            plan_supplier,
            sink,
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }))
    }
}
