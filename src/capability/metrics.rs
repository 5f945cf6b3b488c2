//! 能力表现指标
//!
//! 每个能力一份 CapabilityMetrics，由学习适配器按结果做 EMA 更新；
//! dynamic_priority 是编排器排序的依据（1-10）。

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::capability::CapabilityRegistry;
use crate::memory::ContextLabel;

pub const EMA_ALPHA: f64 = 0.2;

/// 指数移动平均
pub fn ema(current: f64, sample: f64, alpha: f64) -> f64 {
    alpha * sample + (1.0 - alpha) * current
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    #[default]
    Stable,
    Declining,
}

impl Trend {
    pub fn multiplier(&self) -> f64 {
        match self {
            Trend::Improving => 1.2,
            Trend::Stable => 1.0,
            Trend::Declining => 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilityMetrics {
    pub capability_id: String,
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    /// 0-100
    pub avg_confidence: f64,
    pub avg_latency_ms: f64,
    pub success_rate_by_context: HashMap<ContextLabel, f64>,
    pub trend: Trend,
    /// 1-10
    pub dynamic_priority: f64,
}

/// 没有样本时的先验成功率
const PRIOR_SUCCESS_RATE: f64 = 0.5;
const LATENCY_CEILING_MS: f64 = 5000.0;

impl CapabilityMetrics {
    pub fn new(capability_id: impl Into<String>, static_priority: u8) -> Self {
        Self {
            capability_id: capability_id.into(),
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            success_rate: PRIOR_SUCCESS_RATE,
            avg_confidence: 50.0,
            avg_latency_ms: 0.0,
            success_rate_by_context: HashMap::new(),
            trend: Trend::Stable,
            dynamic_priority: (static_priority as f64 * 2.0).clamp(1.0, 10.0),
        }
    }

    /// 记录一次终态结果；置信度只在成功时计入
    pub fn record(&mut self, success: bool, confidence: f64, latency_ms: u64, context: ContextLabel) {
        let first = self.total_calls == 0;
        self.total_calls += 1;
        let outcome = if success { 1.0 } else { 0.0 };
        if success {
            self.success_count += 1;
            self.avg_confidence = ema(self.avg_confidence, confidence, EMA_ALPHA);
        } else {
            self.failure_count += 1;
        }
        self.success_rate = ema(self.success_rate, outcome, EMA_ALPHA);
        self.avg_latency_ms = if first {
            latency_ms as f64
        } else {
            ema(self.avg_latency_ms, latency_ms as f64, EMA_ALPHA)
        };
        let by_context = self
            .success_rate_by_context
            .entry(context)
            .or_insert(PRIOR_SUCCESS_RATE);
        *by_context = ema(*by_context, outcome, EMA_ALPHA);
    }

    pub fn context_success_rate(&self, context: ContextLabel) -> f64 {
        self.success_rate_by_context
            .get(&context)
            .copied()
            .unwrap_or(PRIOR_SUCCESS_RATE)
    }

    /// 综合得分 0-1：成功率、置信度、延迟、上下文成功率加权
    pub fn priority_score(&self, context: ContextLabel) -> f64 {
        let latency_term = (1.0 - self.avg_latency_ms / LATENCY_CEILING_MS).max(0.0);
        0.35 * self.success_rate
            + 0.25 * (self.avg_confidence / 100.0)
            + 0.2 * latency_term
            + 0.2 * self.context_success_rate(context)
    }
}

/// 全部能力的指标表：每个能力一把锁
#[derive(Default)]
pub struct MetricsTable {
    entries: HashMap<String, Mutex<CapabilityMetrics>>,
}

impl MetricsTable {
    pub fn from_registry(registry: &CapabilityRegistry) -> Self {
        let entries = registry
            .descriptors()
            .into_iter()
            .map(|d| {
                let metrics = CapabilityMetrics::new(d.id.clone(), d.priority);
                (d.id, Mutex::new(metrics))
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, capability_id: &str) -> Option<CapabilityMetrics> {
        self.entries
            .get(capability_id)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// 持锁修改；未知能力返回 None
    pub fn update<R>(
        &self,
        capability_id: &str,
        f: impl FnOnce(&mut CapabilityMetrics) -> R,
    ) -> Option<R> {
        let cell = self.entries.get(capability_id)?;
        let mut metrics = cell.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&mut metrics))
    }

    pub fn all(&self) -> Vec<CapabilityMetrics> {
        let mut all: Vec<CapabilityMetrics> = self
            .entries
            .values()
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect();
        all.sort_by(|a, b| a.capability_id.cmp(&b.capability_id));
        all
    }

    pub fn dynamic_priority(&self, capability_id: &str) -> Option<f64> {
        self.update(capability_id, |m| m.dynamic_priority)
    }

    /// 有调用记录的能力的平均成功率；尚无调用时为 None
    pub fn overall_success_rate(&self) -> Option<f64> {
        let rates: Vec<f64> = self
            .all()
            .into_iter()
            .filter(|m| m.total_calls > 0)
            .map(|m| m.success_rate)
            .collect();
        if rates.is_empty() {
            None
        } else {
            Some(rates.iter().sum::<f64>() / rates.len() as f64)
        }
    }
}
