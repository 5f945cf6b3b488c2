//! 投票与投票轮次

use serde::Serialize;

use crate::capability::{Payload, Trend};
use crate::consensus::Debate;

pub const MIN_VOTE_WEIGHT: f64 = 0.1;
pub const MAX_VOTE_WEIGHT: f64 = 3.0;

/// 票权 = (置信度/100 × 1.5) × (0.5 + 上下文成功率) × 趋势系数，限制在 [0.1, 3.0]
pub fn vote_weight(confidence: f64, context_success_rate: f64, trend: Trend) -> f64 {
    let w = (confidence / 100.0 * 1.5) * (0.5 + context_success_rate) * trend.multiplier();
    if w.is_nan() {
        return MIN_VOTE_WEIGHT;
    }
    w.clamp(MIN_VOTE_WEIGHT, MAX_VOTE_WEIGHT)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Vote {
    pub capability_id: String,
    pub payload: Payload,
    pub confidence: f64,
    pub weight: f64,
    /// 等价分组键
    pub group: String,
}

/// 轮次的裁决方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// 没有成功结果
    NoVotes,
    /// 只有一票
    Trivial,
    /// 主导组占比达到阈值
    Quorum,
    /// 未达阈值，辩论中达成
    DebateResolved,
    /// 辩论轮次耗尽，按默认规则裁决
    Escalated,
}

#[derive(Debug, Clone, Serialize)]
pub struct VotingRound {
    pub id: String,
    pub question: String,
    pub votes: Vec<Vote>,
    /// 仅 Trivial / Quorum 为 true
    pub consensus_reached: bool,
    /// 主导组权重占比
    pub ratio: f64,
    /// 0-100，取整
    pub confidence: f64,
    pub final_decision: Option<Payload>,
    /// 给出最终结论的能力（合并结果时为权重最高者）
    pub decided_by: Option<String>,
    pub resolution: Resolution,
    pub debate: Option<Debate>,
    pub timestamp: i64,
}

impl VotingRound {
    pub(crate) fn new(question: &str, votes: Vec<Vote>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            question: question.to_string(),
            votes,
            consensus_reached: false,
            ratio: 0.0,
            confidence: 0.0,
            final_decision: None,
            decided_by: None,
            resolution: Resolution::NoVotes,
            debate: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 是否给出了最终结论（共识、辩论或默认规则）
    pub fn has_decision(&self) -> bool {
        self.final_decision.is_some()
    }
}
