//! 学习适配器
//!
//! 每个调用结果计算一次奖励，EMA 更新能力指标，再按探索率随机扰动或沿综合得分调整动态优先级。
//! 奖励历史只用于趋势判断（最近 5 次均值 vs 之前 5 次）。
//! 锁顺序：先学习状态，再单个能力的指标锁。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::capability::{CapabilityRegistry, CapabilityRole, DecisionResult, MetricsTable, Trend};
use crate::config::LearningConfig;
use crate::memory::ContextLabel;
use crate::observability::{CouncilEvent, EventSink};

const TREND_WINDOW: usize = 5;
const TREND_THRESHOLD: f64 = 0.1;
const EXPLORATION_DECAY: f64 = 0.95;
const PRIORITY_MIN: f64 = 1.0;
const PRIORITY_MAX: f64 = 10.0;

/// 单个结果的奖励
pub fn compute_reward(result: &DecisionResult, context: ContextLabel, role: CapabilityRole) -> f64 {
    let high_stakes = context.is_high_stakes();
    let mut reward = if result.success { 1.0 } else { -0.5 };
    if high_stakes {
        reward *= 2.0;
    }
    if result.success {
        if result.confidence > 90.0 {
            reward += 0.5;
        } else if result.confidence > 80.0 {
            reward += 0.25;
        }
        if result.latency_ms < 500 {
            reward += 0.3;
        } else if result.latency_ms < 1000 {
            reward += 0.15;
        }
    }
    if high_stakes && role.is_urgency() {
        reward *= 1.5;
    }
    reward
}

/// 最近 5 次均值相对之前 5 次的变化超过 10% 视为上升/下降；样本不足时为 Stable
pub fn detect_trend(history: &VecDeque<f64>) -> Trend {
    if history.len() < TREND_WINDOW * 2 {
        return Trend::Stable;
    }
    let n = history.len();
    let mean = |range: std::ops::Range<usize>| {
        range.clone().map(|i| history[i]).sum::<f64>() / range.len() as f64
    };
    let recent = mean(n - TREND_WINDOW..n);
    let prior = mean(n - TREND_WINDOW * 2..n - TREND_WINDOW);
    let change = if prior.abs() < f64::EPSILON {
        recent - prior
    } else {
        (recent - prior) / prior.abs()
    };
    if change > TREND_THRESHOLD {
        Trend::Improving
    } else if change < -TREND_THRESHOLD {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

/// 已发出的优先级调整
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningUpdate {
    pub capability_id: String,
    pub previous_priority: f64,
    pub priority: f64,
    pub reward: f64,
    pub trend: Trend,
    pub explored: bool,
}

/// 校准后的学习参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Calibration {
    pub exploration_rate: f64,
    pub learning_rate: f64,
}

struct LearnerState {
    exploration_rate: f64,
    learning_rate: f64,
    rewards: HashMap<String, VecDeque<f64>>,
    last_emitted: HashMap<String, f64>,
    rng: StdRng,
}

pub struct LearningAdapter {
    registry: Arc<CapabilityRegistry>,
    metrics: Arc<MetricsTable>,
    config: LearningConfig,
    state: Mutex<LearnerState>,
    sink: EventSink,
}

impl LearningAdapter {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        metrics: Arc<MetricsTable>,
        config: LearningConfig,
        sink: EventSink,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let state = LearnerState {
            exploration_rate: config.exploration_rate,
            learning_rate: config.learning_rate,
            rewards: HashMap::new(),
            last_emitted: HashMap::new(),
            rng,
        };
        Self {
            registry,
            metrics,
            config,
            state: Mutex::new(state),
            sink,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsTable> {
        &self.metrics
    }

    pub fn exploration_rate(&self) -> f64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .exploration_rate
    }

    pub fn learning_rate(&self) -> f64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .learning_rate
    }

    /// 处理一个调用结果；仅当优先级相对上次发出值变化超过阈值时返回 Some
    pub fn on_result(&self, result: &DecisionResult, context: ContextLabel) -> Option<LearningUpdate> {
        if !result.is_outcome() {
            return None;
        }
        let role = self.registry.get(&result.capability_id)?.role;
        let reward = compute_reward(result, context, role);

        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;

        let history = state.rewards.entry(result.capability_id.clone()).or_default();
        if history.len() == self.config.reward_history {
            history.pop_front();
        }
        history.push_back(reward);
        let trend = detect_trend(history);

        let explored = state.rng.gen::<f64>() < state.exploration_rate;
        let step = if state.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        let learning_rate = state.learning_rate;

        let (before, after) = self.metrics.update(&result.capability_id, |m| {
            m.record(result.success, result.confidence, result.latency_ms, context);
            m.trend = trend;
            let before = m.dynamic_priority;
            let target = if explored {
                before + step
            } else {
                let score = m.priority_score(context);
                before + learning_rate * (score - 0.5) * trend.multiplier() * 10.0
            };
            m.dynamic_priority = target.clamp(PRIORITY_MIN, PRIORITY_MAX);
            (before, m.dynamic_priority)
        })?;

        state.exploration_rate =
            (state.exploration_rate * EXPLORATION_DECAY).max(self.config.exploration_floor);

        let last = *state
            .last_emitted
            .entry(result.capability_id.clone())
            .or_insert(before);
        if (after - last).abs() <= self.config.emit_threshold {
            return None;
        }
        state
            .last_emitted
            .insert(result.capability_id.clone(), after);
        drop(guard);

        tracing::debug!(capability = %result.capability_id, from = last, to = after, explored, "Priority adjusted");
        self.sink.emit(CouncilEvent::PriorityAdjusted {
            capability: result.capability_id.clone(),
            from: last,
            to: after,
            explored,
        });
        Some(LearningUpdate {
            capability_id: result.capability_id.clone(),
            previous_priority: last,
            priority: after,
            reward,
            trend,
            explored,
        })
    }

    /// 按整体成功率调整探索率，按趋势稳定度调整学习率
    pub fn calibrate(&self) -> Calibration {
        let overall = self.metrics.overall_success_rate();
        let all = self.metrics.all();
        let stable = all.iter().filter(|m| m.trend == Trend::Stable).count();
        let mostly_stable = !all.is_empty() && stable as f64 / all.len() as f64 >= 0.7;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match overall {
            Some(rate) if rate < 0.4 => {
                state.exploration_rate =
                    (state.exploration_rate * 1.5).min(self.config.exploration_cap);
            }
            Some(rate) if rate > 0.8 => {
                state.exploration_rate =
                    (state.exploration_rate * 0.5).max(self.config.exploration_floor);
            }
            _ => {}
        }
        state.learning_rate = if mostly_stable {
            (state.learning_rate * 0.9).max(self.config.learning_rate_floor)
        } else {
            (state.learning_rate * 1.1).min(self.config.learning_rate_cap)
        };
        Calibration {
            exploration_rate: state.exploration_rate,
            learning_rate: state.learning_rate,
        }
    }

    /// 按动态优先级降序排列候选能力；同分时按上下文成功率、再按 ID
    pub fn rank(&self, candidates: &[String], context: ContextLabel) -> Vec<String> {
        let mut scored: Vec<(String, f64, f64)> = candidates
            .iter()
            .map(|id| {
                let (priority, ctx_rate) = self
                    .metrics
                    .get(id)
                    .map(|m| (m.dynamic_priority, m.context_success_rate(context)))
                    .unwrap_or((PRIORITY_MIN, 0.0));
                (id.clone(), priority, ctx_rate)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| b.2.total_cmp(&a.2))
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.into_iter().map(|(id, _, _)| id).collect()
    }
}
