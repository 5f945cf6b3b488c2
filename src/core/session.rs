//! 会话：一次完整的协同决策流程
//!
//! process(input) 依次执行：
//! 1. 写入上下文记忆并分类
//! 2. 取执行计划（计划提供者或默认流水线）
//! 3. 按阶段调用能力
//! 4. 按角色分组投票（共识 / 辩论 / 默认规则）
//! 5. 学习适配器更新指标与动态优先级
//! 6. 结果写回记忆（情景 → 语义晋升、工作记忆假设）
//! 7. 异常检测（全部失败 / 平均置信度过低），只发事件不中断
//! 8. 后台补充调用
//!
//! cancel() 取消本会话所有未完成调用；reset() 额外清空短期与工作记忆并换新 token。

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capability::{CapabilityRole, DecisionResult, Payload, Tier};
use crate::consensus::VotingRound;
use crate::core::{CouncilContext, CouncilError};
use crate::learning::LearningUpdate;
use crate::memory::{ContextLabel, Finding};
use crate::observability::CouncilEvent;

/// 一个角色组的投票结果
#[derive(Debug, Clone, Serialize)]
pub struct RoleDecision {
    pub role: CapabilityRole,
    pub round: VotingRound,
}

/// 请求级异常（不中断请求）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    AllFailed { attempted: usize },
    LowConfidence { average: f64, threshold: f64 },
}

impl Anomaly {
    fn reason(&self) -> &'static str {
        match self {
            Anomaly::AllFailed { .. } => "all_failed",
            Anomaly::LowConfidence { .. } => "low_confidence",
        }
    }

    fn detail(&self) -> String {
        match self {
            Anomaly::AllFailed { attempted } => format!("all {} capabilities failed", attempted),
            Anomaly::LowConfidence { average, threshold } => {
                format!("average confidence {:.1} below {:.1}", average, threshold)
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionOutcome {
    pub session_id: String,
    pub plan: String,
    pub label: ContextLabel,
    pub results: Vec<DecisionResult>,
    pub rounds: Vec<RoleDecision>,
    pub updates: Vec<LearningUpdate>,
    pub anomalies: Vec<Anomaly>,
    /// 后台补充调用句柄，宿主可选择等待
    #[serde(skip)]
    pub enrichment: Vec<JoinHandle<()>>,
}

impl SessionOutcome {
    pub fn round_for(&self, role: CapabilityRole) -> Option<&VotingRound> {
        self.rounds.iter().find(|r| r.role == role).map(|r| &r.round)
    }

    /// 主决策：优先主分析阶段的结论，否则取第一个有结论的角色组
    pub fn decision(&self) -> Option<&Payload> {
        self.rounds
            .iter()
            .filter(|r| r.round.final_decision.is_some())
            .min_by_key(|r| match r.role.tier() {
                Tier::Primary => 0,
                Tier::Triage => 1,
                Tier::Secondary => 2,
            })
            .and_then(|r| r.round.final_decision.as_ref())
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}

pub struct Session {
    id: String,
    ctx: Arc<CouncilContext>,
    parent: CancellationToken,
    cancel: Mutex<CancellationToken>,
}

impl Session {
    pub(crate) fn new(ctx: Arc<CouncilContext>, parent: CancellationToken) -> Self {
        let cancel = parent.child_token();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ctx,
            parent,
            cancel: Mutex::new(cancel),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token().is_cancelled()
    }

    /// 取消所有未完成的调用；之后的 process 直接返回 Cancelled，直到 reset
    pub fn cancel(&self) {
        tracing::info!(session = %self.id, "Session cancelled");
        self.token().cancel();
    }

    /// 取消未完成调用，清空短期与工作记忆，换新 token
    pub fn reset(&self) {
        let mut guard = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        guard.cancel();
        *guard = self.parent.child_token();
        drop(guard);
        self.ctx.memory().reset();
        tracing::info!(session = %self.id, "Session reset");
    }

    pub async fn process(&self, input: &str) -> Result<SessionOutcome, CouncilError> {
        let cancel = self.token();
        if cancel.is_cancelled() {
            return Err(CouncilError::Cancelled);
        }
        let ctx = &self.ctx;

        let label = ctx.memory().update_with_input(input);
        let plan = ctx.plan_for(input);
        tracing::info!(session = %self.id, label = label.as_str(), plan = %plan.name, "Processing input");

        let results = ctx.orchestrator().run_plan(input, &plan, &cancel).await?;

        let rounds = self.vote_by_role(input, &results, label);

        let updates: Vec<LearningUpdate> = results
            .iter()
            .filter_map(|r| ctx.learner().on_result(r, label))
            .collect();
        for r in &results {
            ctx.memory().update_with_decision(r);
        }

        let anomalies = self.detect_anomalies(&results);
        for anomaly in &anomalies {
            ctx.sink().emit(CouncilEvent::AnomalyDetected {
                reason: anomaly.reason().to_string(),
                detail: anomaly.detail(),
            });
        }

        let enrichment = self.spawn_enrichment(input, &plan.background, &results, &cancel);

        tracing::info!(
            session = %self.id,
            results = results.len(),
            rounds = rounds.len(),
            anomalies = anomalies.len(),
            "Input processed"
        );
        Ok(SessionOutcome {
            session_id: self.id.clone(),
            plan: plan.name,
            label,
            results,
            rounds,
            updates,
            anomalies,
            enrichment,
        })
    }

    /// 同一角色的结果才具有可比的回答形状；按首次出现顺序逐组投票
    fn vote_by_role(
        &self,
        input: &str,
        results: &[DecisionResult],
        label: ContextLabel,
    ) -> Vec<RoleDecision> {
        let mut groups: Vec<(CapabilityRole, Vec<DecisionResult>)> = Vec::new();
        for r in results {
            let Some(role) = self.ctx.registry().get(&r.capability_id).map(|d| d.role) else {
                continue;
            };
            match groups.iter_mut().find(|(g, _)| *g == role) {
                Some((_, members)) => members.push(r.clone()),
                None => groups.push((role, vec![r.clone()])),
            }
        }
        groups
            .into_iter()
            .map(|(role, members)| {
                let question = format!("{}: {}", role.as_str(), input);
                RoleDecision {
                    role,
                    round: self.ctx.consensus().vote(&question, &members, label),
                }
            })
            .collect()
    }

    fn detect_anomalies(&self, results: &[DecisionResult]) -> Vec<Anomaly> {
        let attempted: Vec<&DecisionResult> = results.iter().filter(|r| r.is_outcome()).collect();
        if attempted.is_empty() {
            return Vec::new();
        }
        let succeeded: Vec<&DecisionResult> = attempted.iter().copied().filter(|r| r.success).collect();
        if succeeded.is_empty() {
            return vec![Anomaly::AllFailed {
                attempted: attempted.len(),
            }];
        }
        let average = succeeded.iter().map(|r| r.confidence).sum::<f64>() / succeeded.len() as f64;
        let threshold = self.ctx.config().metacognition.low_confidence;
        if average < threshold {
            return vec![Anomaly::LowConfidence { average, threshold }];
        }
        Vec::new()
    }

    fn spawn_enrichment(
        &self,
        input: &str,
        background: &[String],
        results: &[DecisionResult],
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        if background.is_empty() {
            return Vec::new();
        }
        let findings: Vec<Finding> = results.iter().filter_map(Finding::from_result).collect();
        self.ctx
            .orchestrator()
            .candidates(background)
            .into_iter()
            .map(|id| {
                let context = self
                    .ctx
                    .memory()
                    .get_relevant_context(&id)
                    .with_prior_findings(&findings);
                self.ctx
                    .enricher()
                    .spawn(id, input.to_string(), context, cancel.child_token())
            })
            .collect()
    }
}
