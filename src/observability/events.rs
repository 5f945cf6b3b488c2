//! 协调事件：供宿主记录或展示（调用开始/成功/失败/拒绝、熔断迁移、共识、辩论、优先级调整、校准、异常）

use serde::Serialize;
use tokio::sync::broadcast;

use crate::capability::BreakerState;

/// 单个协调事件（可序列化为 JSON 供宿主消费）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouncilEvent {
    /// 已通过熔断检查，开始调用推理服务
    CallStarted { capability: String },
    CallSucceeded {
        capability: String,
        confidence: f64,
        latency_ms: u64,
    },
    /// 超时、服务错误或回答无法解码
    CallFailed {
        capability: String,
        reason: String,
        latency_ms: u64,
    },
    /// 熔断打开或能力被禁用，未发起调用
    CallRejected { capability: String, reason: String },
    BreakerTransition {
        capability: String,
        from: BreakerState,
        to: BreakerState,
    },
    ConsensusReached {
        round_id: String,
        ratio: f64,
        confidence: f64,
    },
    DebateOpened {
        debate_id: String,
        participants: Vec<String>,
    },
    DebateResolved {
        debate_id: String,
        winner: String,
        rounds: usize,
    },
    /// 辩论轮次耗尽，按默认规则裁决
    DebateEscalated { debate_id: String, fallback: String },
    PriorityAdjusted {
        capability: String,
        from: f64,
        to: f64,
        explored: bool,
    },
    Calibrated {
        exploration_rate: f64,
        learning_rate: f64,
        consensus_threshold: f64,
    },
    /// 全部失败或平均置信度过低；高优先级，但不中断请求
    AnomalyDetected { reason: String, detail: String },
}

impl CouncilEvent {
    pub fn is_high_priority(&self) -> bool {
        matches!(
            self,
            CouncilEvent::AnomalyDetected { .. } | CouncilEvent::DebateEscalated { .. }
        )
    }
}

/// 事件出口：写 tracing 日志并广播给订阅者（无订阅者时丢弃）
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: broadcast::Sender<CouncilEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CouncilEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CouncilEvent) {
        match &event {
            CouncilEvent::AnomalyDetected { reason, detail } => {
                tracing::warn!(reason = %reason, detail = %detail, "Anomaly detected");
            }
            CouncilEvent::DebateEscalated { debate_id, fallback } => {
                tracing::warn!(debate = %debate_id, fallback = %fallback, "Debate escalated to default rule");
            }
            CouncilEvent::BreakerTransition { capability, from, to } => {
                tracing::info!(capability = %capability, ?from, ?to, "Breaker transition");
            }
            other => tracing::debug!(event = ?other, "council event"),
        }
        let _ = self.tx.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}
