//! 有界辩论：投票未达阈值且存在多个不同结论时开启
//!
//! 每轮每个仍在场的参与者给出一个论点（立场 + 强度）。支持强度按分组累加，
//! 领先组支持强度占全部在场强度的比例达到阈值即结束，由该组最强的支持者给出结论。
//! 未达成时反对者退出；从第 2 轮起非领先组的中立者也退出；在场者不再变化或轮次耗尽则交由默认规则：
//! 置信度 × 历史成功率最高者胜出（同分按 ID）。

use serde::Serialize;

use crate::capability::{Payload, Trend};

pub const MAX_DEBATE_ROUNDS: usize = 5;
const SUPPORT_ABOVE: f64 = 80.0;
const OPPOSE_BELOW: f64 = 50.0;
const LATENCY_CEILING_MS: f64 = 5000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    Support,
    Oppose,
    Neutral,
}

impl Position {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence > SUPPORT_ABOVE {
            Position::Support
        } else if confidence < OPPOSE_BELOW {
            Position::Oppose
        } else {
            Position::Neutral
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateStatus {
    Open,
    Resolved,
    Escalated,
}

/// 参与辩论的一方：一张选票加上其历史表现
#[derive(Debug, Clone)]
pub struct Participant {
    pub capability_id: String,
    pub payload: Payload,
    pub group: String,
    pub confidence: f64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub trend: Trend,
}

impl Participant {
    /// 论点强度 0-1：置信度、历史成功率、延迟倒数的加权，趋势 ±0.1
    pub fn strength(&self) -> f64 {
        let inverse_latency = 1.0 - (self.avg_latency_ms / LATENCY_CEILING_MS).clamp(0.0, 1.0);
        let trend_bonus = match self.trend {
            Trend::Improving => 0.1,
            Trend::Stable => 0.0,
            Trend::Declining => -0.1,
        };
        (0.4 * self.confidence / 100.0 + 0.3 * self.success_rate + 0.2 * inverse_latency + trend_bonus)
            .clamp(0.0, 1.0)
    }

    fn fallback_score(&self) -> f64 {
        self.confidence * self.success_rate
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Argument {
    pub round: usize,
    pub capability_id: String,
    pub group: String,
    pub position: Position,
    pub strength: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Debate {
    pub id: String,
    pub topic: String,
    pub participant_ids: Vec<String>,
    pub arguments: Vec<Argument>,
    pub status: DebateStatus,
    pub rounds: usize,
    pub winner: Option<String>,
    /// 最后一轮的支持比例
    pub ratio: f64,
}

impl Debate {
    pub fn open(topic: &str, participants: &[Participant]) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            participant_ids: participants.iter().map(|p| p.capability_id.clone()).collect(),
            arguments: Vec::new(),
            status: DebateStatus::Open,
            rounds: 0,
            winner: None,
            ratio: 0.0,
        }
    }

    /// 运行至结束；返回胜出者在 participants 中的下标
    pub fn run(&mut self, participants: &[Participant], threshold: f64, max_rounds: usize) -> Option<usize> {
        if participants.is_empty() {
            self.status = DebateStatus::Escalated;
            return None;
        }
        let mut active: Vec<usize> = (0..participants.len()).collect();

        for round in 1..=max_rounds.max(1) {
            self.rounds = round;
            for &i in &active {
                let p = &participants[i];
                self.arguments.push(Argument {
                    round,
                    capability_id: p.capability_id.clone(),
                    group: p.group.clone(),
                    position: Position::from_confidence(p.confidence),
                    strength: p.strength(),
                });
            }

            let (leading, ratio) = leading_group(participants, &active);
            self.ratio = ratio;
            if let Some(group) = leading.as_deref().filter(|_| ratio >= threshold) {
                if let Some(w) = strongest_supporter(participants, &active, group) {
                    self.status = DebateStatus::Resolved;
                    self.winner = Some(participants[w].capability_id.clone());
                    return Some(w);
                }
            }

            let remaining: Vec<usize> = active
                .iter()
                .copied()
                .filter(|&i| {
                    let p = &participants[i];
                    match Position::from_confidence(p.confidence) {
                        Position::Oppose => false,
                        Position::Neutral if round >= 2 => leading.as_deref() == Some(p.group.as_str()),
                        _ => true,
                    }
                })
                .collect();
            // 第 1 轮之后在场者不再变化，继续辩论不会有新结果
            if remaining.is_empty() || (round >= 2 && remaining == active) {
                break;
            }
            active = remaining;
        }

        self.status = DebateStatus::Escalated;
        let fallback = fallback_winner(participants);
        self.winner = fallback.map(|i| participants[i].capability_id.clone());
        fallback
    }
}

/// 领先组（支持强度最高）及其在场强度占比
fn leading_group(participants: &[Participant], active: &[usize]) -> (Option<String>, f64) {
    let total: f64 = active.iter().map(|&i| participants[i].strength()).sum();
    let mut support: Vec<(String, f64)> = Vec::new();
    for &i in active {
        let p = &participants[i];
        if Position::from_confidence(p.confidence) != Position::Support {
            continue;
        }
        match support.iter_mut().find(|(g, _)| *g == p.group) {
            Some((_, s)) => *s += p.strength(),
            None => support.push((p.group.clone(), p.strength())),
        }
    }
    support.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    match support.into_iter().next() {
        Some((group, s)) if total > 0.0 => (Some(group), s / total),
        Some((group, _)) => (Some(group), 0.0),
        None => (None, 0.0),
    }
}

fn strongest_supporter(participants: &[Participant], active: &[usize], group: &str) -> Option<usize> {
    active
        .iter()
        .copied()
        .filter(|&i| {
            participants[i].group == group
                && Position::from_confidence(participants[i].confidence) == Position::Support
        })
        .max_by(|&a, &b| {
            participants[a]
                .strength()
                .total_cmp(&participants[b].strength())
                .then_with(|| participants[b].capability_id.cmp(&participants[a].capability_id))
        })
}

/// 默认规则：置信度 × 历史成功率最高；同分取 ID 较小者
pub fn fallback_winner(participants: &[Participant]) -> Option<usize> {
    (0..participants.len()).max_by(|&a, &b| {
        participants[a]
            .fallback_score()
            .total_cmp(&participants[b].fallback_score())
            .then_with(|| participants[b].capability_id.cmp(&participants[a].capability_id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{DiagnosisAnswer, Payload};

    fn p(id: &str, group: &str, confidence: f64, success_rate: f64) -> Participant {
        Participant {
            capability_id: id.to_string(),
            payload: Payload::Diagnosis(DiagnosisAnswer {
                primary: group.to_string(),
                differentials: vec![],
            }),
            group: group.to_string(),
            confidence,
            success_rate,
            avg_latency_ms: 0.0,
            trend: Trend::Stable,
        }
    }

    #[test]
    fn test_positions() {
        assert_eq!(Position::from_confidence(81.0), Position::Support);
        assert_eq!(Position::from_confidence(80.0), Position::Neutral);
        assert_eq!(Position::from_confidence(50.0), Position::Neutral);
        assert_eq!(Position::from_confidence(49.9), Position::Oppose);
    }

    #[test]
    fn test_strength_bounds() {
        let mut x = p("a", "g", 100.0, 1.0);
        x.trend = Trend::Improving;
        assert_eq!(x.strength(), 1.0);
        let mut y = p("b", "g", 0.0, 0.0);
        y.avg_latency_ms = 10_000.0;
        y.trend = Trend::Declining;
        assert_eq!(y.strength(), 0.0);
    }

    #[test]
    fn test_opposers_withdraw_then_resolve() {
        // 支持者 a 与反对者 b、c 各属不同组；反对者退出后 a 独占支持
        let participants = vec![
            p("a", "flu", 85.0, 0.5),
            p("b", "cold", 45.0, 0.5),
            p("c", "covid", 40.0, 0.5),
        ];
        let mut debate = Debate::open("dx", &participants);
        let winner = debate.run(&participants, 0.7, MAX_DEBATE_ROUNDS);
        assert_eq!(winner, Some(0));
        assert_eq!(debate.status, DebateStatus::Resolved);
        assert_eq!(debate.rounds, 2);
    }

    #[test]
    fn test_split_supporters_escalate() {
        let participants = vec![
            p("a", "flu", 90.0, 0.4),
            p("b", "cold", 85.0, 0.9),
        ];
        let mut debate = Debate::open("dx", &participants);
        let winner = debate.run(&participants, 0.7, MAX_DEBATE_ROUNDS);
        assert_eq!(debate.status, DebateStatus::Escalated);
        // 90 × 0.4 = 36 < 85 × 0.9 = 76.5
        assert_eq!(winner, Some(1));
        assert!(debate.rounds <= MAX_DEBATE_ROUNDS);
    }

    #[test]
    fn test_fallback_tie_breaks_by_id() {
        let participants = vec![p("b", "x", 80.0, 0.5), p("a", "y", 80.0, 0.5)];
        assert_eq!(fallback_winner(&participants), Some(1));
    }
}
