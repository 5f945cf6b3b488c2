//! 熔断器与熔断器组
//!
//! 每个能力一个熔断器：CLOSED 放行；OPEN 直接拒绝（冷却期满后先转 HALF_OPEN 再放行）；
//! HALF_OPEN 放行并计数探测，成功达到 half_open_tests 即关闭并清零失败计数，任一失败立即重新打开。
//! 与流量无关的周期清扫：冷却期满的 OPEN 转 HALF_OPEN；最后一次失败早于 reset_timeout 的熔断器完全复位。
//!
//! 熔断器组内每个能力一把锁，不同能力之间互不加锁；调用结果处理与周期清扫共用同一把锁。

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::capability::metrics::{ema, EMA_ALPHA};
use crate::capability::{CapabilityRegistry, CapabilityRole};
use crate::observability::{CouncilEvent, EventSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// 单个熔断器的阈值配置（每个能力可独立调整）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    pub max_failures: u32,
    pub cooldown: Duration,
    pub half_open_tests: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            cooldown: Duration::from_secs(30),
            half_open_tests: 2,
            reset_timeout: Duration::from_secs(300),
        }
    }
}

impl BreakerConfig {
    /// 以 base 为基准按角色调整：分诊对延迟敏感，阈值更严；治疗/风险类更宽容
    pub fn for_role(role: CapabilityRole, base: BreakerConfig) -> Self {
        match role {
            CapabilityRole::Triage => Self {
                max_failures: base.max_failures.saturating_sub(2).max(1),
                cooldown: base.cooldown / 2,
                half_open_tests: base.half_open_tests,
                reset_timeout: base.reset_timeout / 2,
            },
            CapabilityRole::Treatment | CapabilityRole::RiskAssessment => Self {
                max_failures: base.max_failures + 2,
                cooldown: base.cooldown * 2,
                ..base
            },
            CapabilityRole::Diagnosis | CapabilityRole::General => base,
        }
    }
}

/// 调用统计（EMA，α = 0.2）：每个终态结果都会更新
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CallStats {
    pub calls: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub avg_confidence: f64,
}

impl Default for CallStats {
    fn default() -> Self {
        Self {
            calls: 0,
            success_rate: 1.0,
            avg_latency_ms: 0.0,
            avg_confidence: 0.0,
        }
    }
}

impl CallStats {
    fn record(&mut self, success: bool, latency_ms: u64, confidence: Option<f64>) {
        let first = self.calls == 0;
        self.calls += 1;
        let outcome = if success { 1.0 } else { 0.0 };
        let latency = latency_ms as f64;
        if first {
            self.success_rate = outcome;
            self.avg_latency_ms = latency;
        } else {
            self.success_rate = ema(self.success_rate, outcome, EMA_ALPHA);
            self.avg_latency_ms = ema(self.avg_latency_ms, latency, EMA_ALPHA);
        }
        if let Some(c) = confidence {
            self.avg_confidence = if self.avg_confidence == 0.0 {
                c
            } else {
                ema(self.avg_confidence, c, EMA_ALPHA)
            };
        }
    }
}

/// 准入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    /// 半开状态下的探测调用
    Probe,
    Rejected { retry_in: Duration },
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    next_retry_at: Option<Instant>,
    half_open_probe_count: u32,
    config: BreakerConfig,
    stats: CallStats,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_at: None,
            next_retry_at: None,
            half_open_probe_count: 0,
            config,
            stats: CallStats::default(),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn probe_count(&self) -> u32 {
        self.half_open_probe_count
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.next_retry_at
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    /// 不改变状态地判断本次是否会被放行
    pub fn would_admit(&self, now: Instant) -> bool {
        match self.state {
            BreakerState::Open => self.next_retry_at.map_or(true, |t| now >= t),
            BreakerState::Closed | BreakerState::HalfOpen => true,
        }
    }

    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            BreakerState::Closed => Admission::Proceed,
            BreakerState::HalfOpen => Admission::Probe,
            BreakerState::Open => match self.next_retry_at {
                Some(t) if now < t => Admission::Rejected {
                    retry_in: t.saturating_duration_since(now),
                },
                _ => {
                    self.half_open();
                    Admission::Probe
                }
            },
        }
    }

    pub fn on_success(&mut self, latency_ms: u64, confidence: f64) {
        self.stats.record(true, latency_ms, Some(confidence));
        match self.state {
            BreakerState::Closed => self.failure_count = 0,
            BreakerState::HalfOpen => {
                self.half_open_probe_count += 1;
                if self.half_open_probe_count >= self.config.half_open_tests {
                    self.close();
                }
            }
            // 重新打开后才返回的迟到结果不改变状态
            BreakerState::Open => {}
        }
    }

    pub fn on_failure(&mut self, now: Instant, latency_ms: u64) {
        self.stats.record(false, latency_ms, None);
        self.failure_count += 1;
        self.last_failure_at = Some(now);
        match self.state {
            BreakerState::Closed => {
                if self.failure_count >= self.config.max_failures {
                    self.trip(now);
                }
            }
            BreakerState::HalfOpen => self.trip(now),
            BreakerState::Open => {}
        }
    }

    /// 周期清扫：空闲超过 reset_timeout 完全复位；否则冷却期满的 OPEN 转 HALF_OPEN
    pub fn sweep(&mut self, now: Instant) {
        let idle = self
            .last_failure_at
            .map(|t| now.saturating_duration_since(t) >= self.config.reset_timeout)
            .unwrap_or(false);
        if idle && (self.state != BreakerState::Closed || self.failure_count > 0) {
            self.reset();
            return;
        }
        if self.state == BreakerState::Open && self.next_retry_at.map_or(true, |t| now >= t) {
            self.half_open();
        }
    }

    /// 无论之前处于何种状态，复位后均为 {CLOSED, failures: 0}
    pub fn reset(&mut self) {
        self.close();
        self.last_failure_at = None;
    }

    fn trip(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.next_retry_at = Some(now + self.config.cooldown);
        self.half_open_probe_count = 0;
    }

    fn half_open(&mut self) {
        self.state = BreakerState::HalfOpen;
        self.next_retry_at = None;
        self.half_open_probe_count = 0;
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.next_retry_at = None;
        self.half_open_probe_count = 0;
    }
}

/// 熔断器快照（供宿主展示与元认知采样）
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub capability: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub probe_count: u32,
    pub retry_in_ms: Option<u64>,
    pub stats: CallStats,
}

/// 熔断器组：启动时按注册表创建，进程生命周期内复用
pub struct BreakerBank {
    breakers: HashMap<String, Mutex<CircuitBreaker>>,
    sink: EventSink,
}

impl BreakerBank {
    pub fn new(sink: EventSink) -> Self {
        Self {
            breakers: HashMap::new(),
            sink,
        }
    }

    /// 为注册表中每个能力创建熔断器；configs 中缺失的能力使用角色默认值
    pub fn from_registry(
        registry: &CapabilityRegistry,
        base: BreakerConfig,
        configs: &HashMap<String, BreakerConfig>,
        sink: EventSink,
    ) -> Self {
        let mut bank = Self::new(sink);
        for d in registry.descriptors() {
            let config = configs
                .get(&d.id)
                .copied()
                .unwrap_or_else(|| BreakerConfig::for_role(d.role, base));
            bank.register(&d.id, config);
        }
        bank
    }

    pub fn register(&mut self, capability_id: &str, config: BreakerConfig) {
        self.breakers
            .insert(capability_id.to_string(), Mutex::new(CircuitBreaker::new(config)));
    }

    /// 持锁执行 f；状态变化在释放锁后作为事件发出
    fn with_breaker<R>(&self, capability_id: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> Option<R> {
        let cell = self.breakers.get(capability_id)?;
        let (from, to, out) = {
            let mut breaker = cell.lock().unwrap_or_else(PoisonError::into_inner);
            let from = breaker.state();
            let out = f(&mut breaker);
            (from, breaker.state(), out)
        };
        if from != to {
            self.sink.emit(CouncilEvent::BreakerTransition {
                capability: capability_id.to_string(),
                from,
                to,
            });
        }
        Some(out)
    }

    /// 未注册的能力一律拒绝
    pub fn admit(&self, capability_id: &str, now: Instant) -> Admission {
        self.with_breaker(capability_id, |b| b.admit(now))
            .unwrap_or(Admission::Rejected {
                retry_in: Duration::ZERO,
            })
    }

    pub fn would_admit(&self, capability_id: &str, now: Instant) -> bool {
        self.breakers
            .get(capability_id)
            .map(|cell| {
                cell.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .would_admit(now)
            })
            .unwrap_or(false)
    }

    pub fn record_success(&self, capability_id: &str, latency_ms: u64, confidence: f64) {
        self.with_breaker(capability_id, |b| b.on_success(latency_ms, confidence));
    }

    pub fn record_failure(&self, capability_id: &str, now: Instant, latency_ms: u64) {
        self.with_breaker(capability_id, |b| b.on_failure(now, latency_ms));
    }

    pub fn reset(&self, capability_id: &str) -> bool {
        self.with_breaker(capability_id, CircuitBreaker::reset).is_some()
    }

    pub fn state(&self, capability_id: &str) -> Option<BreakerState> {
        self.breakers.get(capability_id).map(|cell| {
            cell.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .state()
        })
    }

    /// 清扫全部熔断器，返回发生状态迁移的数量
    pub fn sweep(&self, now: Instant) -> usize {
        let ids: Vec<&String> = self.breakers.keys().collect();
        let mut transitions = 0;
        for id in ids {
            let changed = self.with_breaker(id, |b| {
                let before = b.state();
                b.sweep(now);
                before != b.state()
            });
            if changed == Some(true) {
                transitions += 1;
            }
        }
        if transitions > 0 {
            tracing::debug!(transitions, "Breaker sweep");
        }
        transitions
    }

    pub fn snapshot(&self, capability_id: &str, now: Instant) -> Option<BreakerSnapshot> {
        let cell = self.breakers.get(capability_id)?;
        let b = cell.lock().unwrap_or_else(PoisonError::into_inner);
        Some(BreakerSnapshot {
            capability: capability_id.to_string(),
            state: b.state(),
            failure_count: b.failure_count(),
            probe_count: b.probe_count(),
            retry_in_ms: b
                .next_retry_at()
                .map(|t| t.saturating_duration_since(now).as_millis() as u64),
            stats: *b.stats(),
        })
    }

    pub fn snapshots(&self, now: Instant) -> Vec<BreakerSnapshot> {
        let mut ids: Vec<&String> = self.breakers.keys().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| self.snapshot(id, now))
            .collect()
    }

    pub fn count_in(&self, state: BreakerState) -> usize {
        self.breakers
            .values()
            .filter(|cell| cell.lock().unwrap_or_else(PoisonError::into_inner).state() == state)
            .count()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_failures: u32, cooldown_ms: u64, half_open_tests: u32) -> BreakerConfig {
        BreakerConfig {
            max_failures,
            cooldown: Duration::from_millis(cooldown_ms),
            half_open_tests,
            reset_timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_failures_open_never_close() {
        let now = Instant::now();
        let mut b = CircuitBreaker::new(config(3, 1000, 2));
        b.on_failure(now, 10);
        b.on_failure(now, 10);
        assert_eq!(b.state(), BreakerState::Closed);
        b.on_failure(now, 10);
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.next_retry_at(), Some(now + Duration::from_millis(1000)));
    }

    #[test]
    fn test_success_in_closed_resets_consecutive_failures() {
        let now = Instant::now();
        let mut b = CircuitBreaker::new(config(2, 1000, 2));
        b.on_failure(now, 10);
        b.on_success(10, 90.0);
        b.on_failure(now, 10);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_lifecycle_open_halfopen_closed() {
        let t0 = Instant::now();
        let mut b = CircuitBreaker::new(config(2, 1000, 2));
        b.on_failure(t0, 5);
        b.on_failure(t0, 5);
        assert_eq!(b.state(), BreakerState::Open);

        let early = b.admit(t0 + Duration::from_millis(500));
        assert_eq!(
            early,
            Admission::Rejected {
                retry_in: Duration::from_millis(500)
            }
        );

        assert_eq!(b.admit(t0 + Duration::from_millis(1000)), Admission::Probe);
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.on_success(5, 80.0);
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.on_success(5, 80.0);
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[test]
    fn test_failure_in_half_open_reopens() {
        let t0 = Instant::now();
        let mut b = CircuitBreaker::new(config(1, 1000, 2));
        b.on_failure(t0, 5);
        let t1 = t0 + Duration::from_millis(1500);
        b.admit(t1);
        b.on_failure(t1, 5);
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.next_retry_at(), Some(t1 + Duration::from_millis(1000)));
    }

    #[test]
    fn test_reset_from_any_state() {
        let t0 = Instant::now();
        for trips in 0..3 {
            let mut b = CircuitBreaker::new(config(1, 1000, 2));
            for _ in 0..trips {
                b.on_failure(t0, 5);
            }
            if trips == 2 {
                b.admit(t0 + Duration::from_secs(2));
            }
            b.reset();
            assert_eq!(b.state(), BreakerState::Closed);
            assert_eq!(b.failure_count(), 0);
        }
    }

    #[test]
    fn test_sweep_moves_open_to_half_open_then_idle_reset() {
        let t0 = Instant::now();
        let mut b = CircuitBreaker::new(config(1, 1000, 2));
        b.on_failure(t0, 5);
        b.sweep(t0 + Duration::from_millis(999));
        assert_eq!(b.state(), BreakerState::Open);
        b.sweep(t0 + Duration::from_millis(1000));
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.sweep(t0 + Duration::from_secs(61));
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[test]
    fn test_stats_ema() {
        let mut b = CircuitBreaker::new(BreakerConfig::default());
        b.on_success(100, 90.0);
        b.on_failure(Instant::now(), 200);
        let stats = b.stats();
        assert_eq!(stats.calls, 2);
        assert!((stats.success_rate - 0.8).abs() < 1e-9);
        assert!((stats.avg_latency_ms - 120.0).abs() < 1e-9);
        assert_eq!(stats.avg_confidence, 90.0);
    }

    #[test]
    fn test_role_configs_differ() {
        let base = BreakerConfig::default();
        let triage = BreakerConfig::for_role(CapabilityRole::Triage, base);
        let treatment = BreakerConfig::for_role(CapabilityRole::Treatment, base);
        assert!(triage.max_failures < base.max_failures);
        assert!(treatment.max_failures > base.max_failures);
        assert!(triage.cooldown < treatment.cooldown);
    }

    #[tokio::test]
    async fn test_bank_emits_transition_events() {
        let sink = EventSink::new(16);
        let mut rx = sink.subscribe();
        let mut bank = BreakerBank::new(sink);
        bank.register("x", config(1, 1000, 1));

        bank.record_failure("x", Instant::now(), 5);
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            CouncilEvent::BreakerTransition {
                capability: "x".to_string(),
                from: BreakerState::Closed,
                to: BreakerState::Open,
            }
        );
        assert_eq!(bank.count_in(BreakerState::Open), 1);
        assert!(bank.reset("x"));
        assert_eq!(bank.state("x"), Some(BreakerState::Closed));
    }

    #[test]
    fn test_bank_rejects_unknown_capability() {
        let bank = BreakerBank::new(EventSink::default());
        assert!(matches!(
            bank.admit("ghost", Instant::now()),
            Admission::Rejected { .. }
        ));
        assert!(!bank.would_admit("ghost", Instant::now()));
    }
}
