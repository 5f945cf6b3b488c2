//! 元认知循环
//!
//! 周期性采样系统状态（熔断器、共识统计、学习参数），触发学习参数校准，
//! 并在共识率过低/过高时小步调整共识阈值（限定在 [threshold_min, threshold_max]）。

use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;

use crate::capability::{BreakerBank, BreakerSnapshot, BreakerState, MetricsTable};
use crate::config::MetacognitionConfig;
use crate::consensus::{ConsensusEngine, ConsensusStats};
use crate::learning::{Calibration, LearningAdapter};
use crate::observability::{CouncilEvent, EventSink};

/// 一次采样
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub breakers: Vec<BreakerSnapshot>,
    pub open_breakers: usize,
    pub consensus: ConsensusStats,
    pub consensus_threshold: f64,
    pub exploration_rate: f64,
    pub learning_rate: f64,
    pub overall_success_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetacognitiveReport {
    pub snapshot: SystemSnapshot,
    pub calibration: Calibration,
    pub threshold_before: f64,
    pub threshold_after: f64,
    pub anomalies: Vec<String>,
}

pub struct Metacognition {
    config: MetacognitionConfig,
    learner: Arc<LearningAdapter>,
    consensus: Arc<ConsensusEngine>,
    breakers: Arc<BreakerBank>,
    metrics: Arc<MetricsTable>,
    sink: EventSink,
}

impl Metacognition {
    pub fn new(
        config: MetacognitionConfig,
        learner: Arc<LearningAdapter>,
        consensus: Arc<ConsensusEngine>,
        breakers: Arc<BreakerBank>,
        sink: EventSink,
    ) -> Self {
        let metrics = learner.metrics().clone();
        Self {
            config,
            learner,
            consensus,
            breakers,
            metrics,
            sink,
        }
    }

    pub fn sample(&self, now: Instant) -> SystemSnapshot {
        SystemSnapshot {
            breakers: self.breakers.snapshots(now),
            open_breakers: self.breakers.count_in(BreakerState::Open),
            consensus: self.consensus.stats(),
            consensus_threshold: self.consensus.threshold(),
            exploration_rate: self.learner.exploration_rate(),
            learning_rate: self.learner.learning_rate(),
            overall_success_rate: self.metrics.overall_success_rate(),
        }
    }

    /// 按共识率给出新阈值
    fn next_threshold(&self, stats: &ConsensusStats, current: f64) -> f64 {
        if stats.rounds < self.config.min_rounds {
            return current;
        }
        let adjusted = if stats.consensus_rate < 0.3 {
            current - self.config.threshold_step
        } else if stats.consensus_rate > 0.9 {
            current + self.config.threshold_step
        } else {
            current
        };
        adjusted.clamp(self.config.threshold_min, self.config.threshold_max)
    }

    pub fn tick(&self, now: Instant) -> MetacognitiveReport {
        let snapshot = self.sample(now);
        let calibration = self.learner.calibrate();

        let before = snapshot.consensus_threshold;
        let after = self.next_threshold(&snapshot.consensus, before);
        if (after - before).abs() > f64::EPSILON {
            self.consensus.set_threshold(after);
        }

        let mut anomalies = Vec::new();
        let total = self.breakers.len();
        if total > 0 && snapshot.open_breakers as f64 / total as f64 >= self.config.open_breaker_ratio {
            let detail = format!("{}/{} breakers open", snapshot.open_breakers, total);
            self.sink.emit(CouncilEvent::AnomalyDetected {
                reason: "breakers_open".to_string(),
                detail: detail.clone(),
            });
            anomalies.push(detail);
        }
        if snapshot.consensus.rounds >= self.config.min_rounds
            && snapshot.consensus.average_confidence < self.config.low_confidence
        {
            let detail = format!(
                "average consensus confidence {:.1} below {:.1}",
                snapshot.consensus.average_confidence, self.config.low_confidence
            );
            self.sink.emit(CouncilEvent::AnomalyDetected {
                reason: "low_confidence_trend".to_string(),
                detail: detail.clone(),
            });
            anomalies.push(detail);
        }

        self.sink.emit(CouncilEvent::Calibrated {
            exploration_rate: calibration.exploration_rate,
            learning_rate: calibration.learning_rate,
            consensus_threshold: after,
        });
        tracing::info!(
            exploration_rate = calibration.exploration_rate,
            learning_rate = calibration.learning_rate,
            threshold_before = before,
            threshold_after = after,
            anomalies = anomalies.len(),
            "Metacognitive tick"
        );

        MetacognitiveReport {
            snapshot,
            calibration,
            threshold_before: before,
            threshold_after: after,
            anomalies,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::capability::{
        default_catalog, BreakerConfig, CapabilityRegistry, DecisionResult, DiagnosisAnswer,
        Payload,
    };
    use crate::config::{ConsensusConfig, LearningConfig};
    use crate::memory::ContextLabel;

    struct Fixture {
        meta: Metacognition,
        consensus: Arc<ConsensusEngine>,
        breakers: Arc<BreakerBank>,
    }

    fn fixture() -> Fixture {
        let sink = EventSink::default();
        let registry = Arc::new(CapabilityRegistry::from_descriptors(default_catalog()));
        let metrics = Arc::new(MetricsTable::from_registry(&registry));
        let breakers = Arc::new(BreakerBank::from_registry(
            &registry,
            BreakerConfig {
                max_failures: 1,
                ..BreakerConfig::default()
            },
            &HashMap::new(),
            sink.clone(),
        ));
        let learner = Arc::new(LearningAdapter::new(
            registry,
            metrics.clone(),
            LearningConfig {
                seed: Some(1),
                ..LearningConfig::default()
            },
            sink.clone(),
        ));
        let consensus = Arc::new(ConsensusEngine::new(
            &ConsensusConfig::default(),
            metrics,
            sink.clone(),
        ));
        let meta = Metacognition::new(
            MetacognitionConfig::default(),
            learner,
            consensus.clone(),
            breakers.clone(),
            sink,
        );
        Fixture {
            meta,
            consensus,
            breakers,
        }
    }

    fn dx(id: &str, primary: &str, confidence: f64) -> DecisionResult {
        DecisionResult::succeeded(
            id,
            "q",
            Payload::Diagnosis(DiagnosisAnswer {
                primary: primary.to_string(),
                differentials: vec![],
            }),
            confidence,
            100,
        )
    }

    #[test]
    fn test_high_consensus_raises_threshold_within_bounds() {
        let f = fixture();
        for _ in 0..6 {
            f.consensus
                .vote("q", &[dx("symptom_analysis", "flu", 90.0)], ContextLabel::Routine);
        }
        let mut last = 0.0;
        for _ in 0..10 {
            last = f.meta.tick(Instant::now()).threshold_after;
        }
        assert!((last - 0.85).abs() < 1e-9);
        assert!((f.consensus.threshold() - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_low_consensus_lowers_threshold() {
        let f = fixture();
        for _ in 0..6 {
            f.consensus.vote(
                "q",
                &[
                    dx("symptom_analysis", "flu", 90.0),
                    dx("differential_diagnosis", "cold", 88.0),
                ],
                ContextLabel::Routine,
            );
        }
        let report = f.meta.tick(Instant::now());
        assert!((report.threshold_after - 0.65).abs() < 1e-9);
    }

    #[test]
    fn test_too_few_rounds_keeps_threshold() {
        let f = fixture();
        let report = f.meta.tick(Instant::now());
        assert_eq!(report.threshold_before, report.threshold_after);
        assert!(report.anomalies.is_empty());
    }

    #[test]
    fn test_open_breakers_anomaly() {
        let f = fixture();
        let now = Instant::now();
        for id in ["triage", "symptom_analysis", "differential_diagnosis"] {
            f.breakers.record_failure(id, now, 10);
        }
        let report = f.meta.tick(now);
        assert_eq!(report.snapshot.open_breakers, 3);
        assert_eq!(report.anomalies.len(), 1);
    }
}
