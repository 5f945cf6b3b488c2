//! 共识引擎
//!
//! vote(question, decisions, context)：成功结果转为选票并按回答等价分组，
//! 主导组权重占比达到阈值即共识（合并该组回答）；否则开启有界辩论，辩论不成则按默认规则裁决。
//! 每轮都写入有界历史，用于共识率与平均置信度统计。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::capability::{DecisionResult, MetricsTable, Trend};
use crate::config::ConsensusConfig;
use crate::consensus::{
    vote_weight, Debate, DebateStatus, Participant, Resolution, StrategySet, Vote, VotingRound,
    MAX_DEBATE_ROUNDS,
};
use crate::memory::ContextLabel;
use crate::observability::{CouncilEvent, EventSink};

/// 历史轮次统计
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct ConsensusStats {
    pub rounds: usize,
    /// 有投票的轮次中达成共识的比例
    pub consensus_rate: f64,
    pub average_confidence: f64,
    pub debates: usize,
    pub escalations: usize,
}

pub struct ConsensusEngine {
    strategies: StrategySet,
    metrics: Arc<MetricsTable>,
    threshold: Mutex<f64>,
    max_debate_rounds: usize,
    history: Mutex<VecDeque<VotingRound>>,
    history_capacity: usize,
    sink: EventSink,
}

impl ConsensusEngine {
    pub fn new(config: &ConsensusConfig, metrics: Arc<MetricsTable>, sink: EventSink) -> Self {
        Self {
            strategies: StrategySet::default(),
            metrics,
            threshold: Mutex::new(config.threshold),
            max_debate_rounds: config.max_debate_rounds.clamp(1, MAX_DEBATE_ROUNDS),
            history: Mutex::new(VecDeque::new()),
            history_capacity: config.history_capacity.max(1),
            sink,
        }
    }

    pub fn with_strategies(mut self, strategies: StrategySet) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn threshold(&self) -> f64 {
        *self.threshold.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_threshold(&self, threshold: f64) {
        *self.threshold.lock().unwrap_or_else(PoisonError::into_inner) = threshold.clamp(0.0, 1.0);
    }

    fn history_of(&self, capability_id: &str, context: ContextLabel) -> (f64, f64, Trend) {
        self.metrics
            .get(capability_id)
            .map(|m| (m.context_success_rate(context), m.avg_latency_ms, m.trend))
            .unwrap_or((0.5, 0.0, Trend::Stable))
    }

    pub fn vote(&self, question: &str, decisions: &[DecisionResult], context: ContextLabel) -> VotingRound {
        let votes: Vec<Vote> = decisions
            .iter()
            .filter(|d| d.success)
            .filter_map(|d| {
                let payload = d.answer.clone()?;
                let (success_rate, _, trend) = self.history_of(&d.capability_id, context);
                Some(Vote {
                    capability_id: d.capability_id.clone(),
                    group: self.strategies.key(&payload),
                    weight: vote_weight(d.confidence, success_rate, trend),
                    confidence: d.confidence,
                    payload,
                })
            })
            .collect();

        let threshold = self.threshold();
        let mut round = VotingRound::new(question, votes);
        match round.votes.len() {
            0 => {}
            1 => {
                let v = &round.votes[0];
                round.resolution = Resolution::Trivial;
                round.consensus_reached = true;
                round.ratio = 1.0;
                round.confidence = v.confidence.round();
                round.final_decision = Some(v.payload.clone());
                round.decided_by = Some(v.capability_id.clone());
            }
            _ => self.resolve(&mut round, threshold, context),
        }

        if round.consensus_reached {
            self.sink.emit(CouncilEvent::ConsensusReached {
                round_id: round.id.clone(),
                ratio: round.ratio,
                confidence: round.confidence,
            });
        }
        tracing::info!(
            question = %question,
            votes = round.votes.len(),
            resolution = ?round.resolution,
            ratio = round.ratio,
            confidence = round.confidence,
            "Voting round closed"
        );

        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.len() == self.history_capacity {
            history.pop_front();
        }
        history.push_back(round.clone());
        round
    }

    fn resolve(&self, round: &mut VotingRound, threshold: f64, context: ContextLabel) {
        // 分组：保持首次出现顺序
        let mut groups: Vec<(String, Vec<usize>, f64)> = Vec::new();
        for (i, v) in round.votes.iter().enumerate() {
            match groups.iter_mut().find(|(g, _, _)| *g == v.group) {
                Some((_, members, weight)) => {
                    members.push(i);
                    *weight += v.weight;
                }
                None => groups.push((v.group.clone(), vec![i], v.weight)),
            }
        }
        let total: f64 = round.votes.iter().map(|v| v.weight).sum();
        let Some((_, members, weight)) = groups
            .iter()
            .max_by(|a, b| a.2.total_cmp(&b.2).then_with(|| b.0.cmp(&a.0)))
            .cloned()
        else {
            return;
        };
        let ratio = weight / total;
        round.ratio = ratio;

        if ratio >= threshold {
            let mut ordered = members.clone();
            ordered.sort_by(|&a, &b| round.votes[b].weight.total_cmp(&round.votes[a].weight));
            let payloads: Vec<_> = ordered.iter().map(|&i| &round.votes[i].payload).collect();
            let avg_confidence =
                members.iter().map(|&i| round.votes[i].confidence).sum::<f64>() / members.len() as f64;
            round.final_decision = self.strategies.merge(&payloads);
            round.decided_by = Some(round.votes[ordered[0]].capability_id.clone());
            round.confidence = (avg_confidence * ratio).round();
            round.consensus_reached = true;
            round.resolution = Resolution::Quorum;
            return;
        }

        let participants: Vec<Participant> = round
            .votes
            .iter()
            .map(|v| {
                let (success_rate, avg_latency_ms, trend) = self.history_of(&v.capability_id, context);
                Participant {
                    capability_id: v.capability_id.clone(),
                    payload: v.payload.clone(),
                    group: v.group.clone(),
                    confidence: v.confidence,
                    success_rate,
                    avg_latency_ms,
                    trend,
                }
            })
            .collect();
        let mut debate = Debate::open(&round.question, &participants);
        self.sink.emit(CouncilEvent::DebateOpened {
            debate_id: debate.id.clone(),
            participants: debate.participant_ids.clone(),
        });
        let winner = debate.run(&participants, threshold, self.max_debate_rounds);

        if let Some(w) = winner {
            let p = &participants[w];
            round.final_decision = Some(p.payload.clone());
            round.decided_by = Some(p.capability_id.clone());
            match debate.status {
                DebateStatus::Resolved => {
                    round.resolution = Resolution::DebateResolved;
                    round.confidence = (p.confidence * debate.ratio).round();
                    self.sink.emit(CouncilEvent::DebateResolved {
                        debate_id: debate.id.clone(),
                        winner: p.capability_id.clone(),
                        rounds: debate.rounds,
                    });
                }
                _ => {
                    round.resolution = Resolution::Escalated;
                    round.confidence = (p.confidence * p.success_rate).round();
                    self.sink.emit(CouncilEvent::DebateEscalated {
                        debate_id: debate.id.clone(),
                        fallback: p.capability_id.clone(),
                    });
                }
            }
        }
        round.debate = Some(debate);
    }

    pub fn history(&self) -> Vec<VotingRound> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> ConsensusStats {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let voted: Vec<&VotingRound> = history
            .iter()
            .filter(|r| r.resolution != Resolution::NoVotes)
            .collect();
        if voted.is_empty() {
            return ConsensusStats {
                rounds: history.len(),
                ..ConsensusStats::default()
            };
        }
        let reached = voted.iter().filter(|r| r.consensus_reached).count();
        ConsensusStats {
            rounds: history.len(),
            consensus_rate: reached as f64 / voted.len() as f64,
            average_confidence: voted.iter().map(|r| r.confidence).sum::<f64>() / voted.len() as f64,
            debates: voted.iter().filter(|r| r.debate.is_some()).count(),
            escalations: voted
                .iter()
                .filter(|r| r.resolution == Resolution::Escalated)
                .count(),
        }
    }
}
