//! 编排器：按计划驱动能力调用
//!
//! - 候选能力 = 启用 且 熔断器放行，按学习适配器的排序执行
//! - 无条件（Always）的必需阶段在开始前统一预检，任何一个没有候选能力即失败，不发起任何调用；
//!   带条件的必需阶段在条件成立后再检查
//! - 阶段内的每次调用按能力目录的 retry_count 对瞬时失败退避重试
//! - 阶段内并行（join_all）或顺序执行，阶段之间严格串行；前序阶段的成功结果作为已有结论传入
//! - 每次调用使用会话 token 的子 token，取消会话即取消全部未完成调用

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::capability::{
    BreakerState, CapabilityInvoker, CapabilityRegistry, DecisionResult, InvocationError,
};
use crate::core::CouncilError;
use crate::learning::LearningAdapter;
use crate::memory::{ContextBundle, ContextualMemory, Finding};
use crate::orchestrator::{ExecutionPlan, Stage, StageCondition, StageMode};

/// run_single 的退避基数：第 n 次重试前等待 2^n 秒
const BACKOFF_BASE: Duration = Duration::from_secs(1);

pub struct Orchestrator {
    registry: Arc<CapabilityRegistry>,
    invoker: Arc<CapabilityInvoker>,
    learner: Arc<LearningAdapter>,
    memory: Arc<ContextualMemory>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        invoker: Arc<CapabilityInvoker>,
        learner: Arc<LearningAdapter>,
        memory: Arc<ContextualMemory>,
    ) -> Self {
        Self {
            registry,
            invoker,
            learner,
            memory,
        }
    }

    pub fn invoker(&self) -> &Arc<CapabilityInvoker> {
        &self.invoker
    }

    /// 过滤出启用且熔断器放行的能力，并按学习排序
    pub fn candidates(&self, ids: &[String]) -> Vec<String> {
        let now = Instant::now();
        let available: Vec<String> = ids
            .iter()
            .filter(|id| self.registry.is_enabled(id) && self.invoker.breakers().would_admit(id, now))
            .cloned()
            .collect();
        self.learner.rank(&available, self.memory.current_label())
    }

    fn ensure_available(&self, stage: &Stage) -> Result<Vec<String>, CouncilError> {
        let candidates = self.candidates(&stage.capabilities);
        if candidates.is_empty() {
            tracing::warn!(stage = %stage.name, requested = ?stage.capabilities, "No capability available");
            return Err(CouncilError::NoCapabilityAvailable {
                stage: stage.name.clone(),
                requested: stage.capabilities.clone(),
            });
        }
        Ok(candidates)
    }

    pub async fn run_plan(
        &self,
        input: &str,
        plan: &ExecutionPlan,
        cancel: &CancellationToken,
    ) -> Result<Vec<DecisionResult>, CouncilError> {
        plan.validate(&self.registry)?;
        // 只有无条件阶段确定会执行
        for stage in plan
            .stages
            .iter()
            .filter(|s| s.required && s.condition == StageCondition::Always)
        {
            self.ensure_available(stage)?;
        }

        let mut results: Vec<DecisionResult> = Vec::new();
        for stage in &plan.stages {
            if cancel.is_cancelled() {
                return Err(CouncilError::Cancelled);
            }
            if !stage.condition.evaluate(&results) {
                tracing::info!(stage = %stage.name, "Stage condition not met, skipping");
                continue;
            }
            let candidates = if stage.required {
                self.ensure_available(stage)?
            } else {
                let c = self.candidates(&stage.capabilities);
                if c.is_empty() {
                    tracing::info!(stage = %stage.name, "Optional stage has no available capability, skipping");
                    continue;
                }
                c
            };

            tracing::info!(stage = %stage.name, mode = ?stage.mode, candidates = ?candidates, "Stage started");
            let stage_results = self
                .run_stage(input, stage.mode, &candidates, &results, cancel)
                .await;
            // 阶段屏障：全部调用到达终态后才进入下一阶段
            if cancel.is_cancelled() {
                return Err(CouncilError::Cancelled);
            }
            let ok = stage_results.iter().filter(|r| r.success).count();
            tracing::info!(stage = %stage.name, succeeded = ok, total = stage_results.len(), "Stage finished");
            results.extend(stage_results);
        }
        Ok(results)
    }

    async fn run_stage(
        &self,
        input: &str,
        mode: StageMode,
        candidates: &[String],
        prior: &[DecisionResult],
        cancel: &CancellationToken,
    ) -> Vec<DecisionResult> {
        let mut findings: Vec<Finding> = prior.iter().filter_map(Finding::from_result).collect();
        match mode {
            StageMode::Parallel => {
                let calls = candidates.iter().map(|id| {
                    let context = self
                        .memory
                        .get_relevant_context(id)
                        .with_prior_findings(&findings);
                    async move { self.invoke_with_policy(id, input, &context, cancel).await }
                });
                join_all(calls).await
            }
            StageMode::Sequential => {
                let mut out = Vec::with_capacity(candidates.len());
                for id in candidates {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let context = self
                        .memory
                        .get_relevant_context(id)
                        .with_prior_findings(&findings);
                    let result = self.invoke_with_policy(id, input, &context, cancel).await;
                    findings.extend(Finding::from_result(&result));
                    out.push(result);
                }
                out
            }
        }
    }

    /// 单阶段并行
    pub async fn run_parallel(
        &self,
        input: &str,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<DecisionResult>, CouncilError> {
        self.run_plan(input, &ExecutionPlan::parallel(ids.to_vec()), cancel)
            .await
    }

    /// 多阶段：阶段内并行、阶段间串行，每个阶段均为必需
    pub async fn run_sequential_phases(
        &self,
        input: &str,
        phases: Vec<Vec<String>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<DecisionResult>, CouncilError> {
        self.run_plan(input, &ExecutionPlan::from_phases(phases), cancel)
            .await
    }

    /// 单个能力，失败后按 2^attempt 秒退避重试；熔断器中途打开则提前放弃并返回最后一次结果
    pub async fn run_single(
        &self,
        id: &str,
        input: &str,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> Result<DecisionResult, CouncilError> {
        if !self.registry.contains(id) {
            return Err(CouncilError::UnknownCapability(id.to_string()));
        }
        if self.candidates(&[id.to_string()]).is_empty() {
            return Err(CouncilError::NoCapabilityAvailable {
                stage: "single".to_string(),
                requested: vec![id.to_string()],
            });
        }

        let context = self.memory.get_relevant_context(id);
        let result = self
            .invoke_with_retries(id, input, &context, max_retries, cancel)
            .await;
        if matches!(result.error, Some(InvocationError::Cancelled)) {
            return Err(CouncilError::Cancelled);
        }
        Ok(result)
    }

    /// 阶段内调用：重试次数取自能力目录
    async fn invoke_with_policy(
        &self,
        id: &str,
        input: &str,
        context: &ContextBundle,
        cancel: &CancellationToken,
    ) -> DecisionResult {
        let retries = self.registry.get(id).map(|d| d.retry_count).unwrap_or(0);
        self.invoke_with_retries(id, input, context, retries, cancel)
            .await
    }

    /// 瞬时失败后按 2^attempt 秒退避重试；熔断器打开或非瞬时失败时返回最后一次结果
    async fn invoke_with_retries(
        &self,
        id: &str,
        input: &str,
        context: &ContextBundle,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> DecisionResult {
        let mut attempt: u32 = 0;
        loop {
            let result = self
                .invoker
                .invoke(id, input, context, cancel.child_token())
                .await;
            if result.success || !result.error.as_ref().is_some_and(|e| e.is_transient()) {
                return result;
            }
            if self.invoker.breakers().state(id) == Some(BreakerState::Open) {
                tracing::info!(capability = %id, attempt, "Breaker opened, abandoning retries");
                return result;
            }
            if attempt >= max_retries {
                return result;
            }

            let backoff = BACKOFF_BASE * 2u32.pow(attempt.min(16));
            tracing::debug!(capability = %id, attempt, backoff_ms = backoff.as_millis() as u64, "Retrying");
            tokio::select! {
                _ = cancel.cancelled() => {
                    return DecisionResult::failed(id, input, InvocationError::Cancelled, result.latency_ms);
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        }
    }
}
