//! 情景记忆：每次决策一条 Episode（事件、结果、派生经验），跨会话保留，超出上限按 FIFO 淘汰

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::capability::DecisionResult;
use crate::memory::ContextLabel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub timestamp: i64,
    pub capability_id: String,
    pub context: ContextLabel,
    /// 事件：输入摘要 + 回答摘要
    pub event: String,
    pub outcome: Outcome,
    pub confidence: f64,
    pub learnings: Vec<String>,
}

impl Episode {
    pub fn from_result(result: &DecisionResult, context: ContextLabel) -> Self {
        let outcome = if result.success {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        let answer = result
            .answer
            .as_ref()
            .map(|p| p.headline())
            .unwrap_or_else(|| "-".to_string());
        let event = format!("{} => {}", preview(&result.input, 80), answer);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: result.timestamp,
            capability_id: result.capability_id.clone(),
            context,
            event,
            outcome,
            confidence: result.confidence,
            learnings: derive_learnings(result, context),
        }
    }
}

fn preview(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}

/// 从单个结果派生经验条目
fn derive_learnings(result: &DecisionResult, context: ContextLabel) -> Vec<String> {
    let mut learnings = Vec::new();
    let ctx = context.as_str();
    match &result.error {
        None => {
            if result.confidence > 80.0 {
                learnings.push(format!("{} is confident in {} context", result.capability_id, ctx));
            }
            if result.latency_ms < 500 {
                learnings.push(format!("{} answers fast", result.capability_id));
            }
        }
        Some(e) => learnings.push(format!(
            "{} failed in {} context: {}",
            result.capability_id,
            ctx,
            e.label()
        )),
    }
    learnings
}

#[derive(Debug, Clone)]
pub struct EpisodicMemory {
    episodes: VecDeque<Episode>,
    capacity: usize,
}

impl Default for EpisodicMemory {
    fn default() -> Self {
        Self::new(500)
    }
}

impl EpisodicMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            episodes: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, episode: Episode) {
        if self.episodes.len() == self.capacity {
            self.episodes.pop_front();
        }
        self.episodes.push_back(episode);
    }

    pub fn len(&self) -> usize {
        self.episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Episode> {
        self.episodes.iter()
    }

    /// 同一 (上下文, 能力, 结果) 模式在记忆中出现的次数
    pub fn recurrence(&self, context: ContextLabel, capability_id: &str, outcome: Outcome) -> usize {
        self.episodes
            .iter()
            .filter(|e| e.context == context && e.capability_id == capability_id && e.outcome == outcome)
            .count()
    }

    /// (上下文, 能力) 的成功比例；没有记录时为 None
    pub fn reliability(&self, context: ContextLabel, capability_id: &str) -> Option<f64> {
        let (total, ok) = self
            .episodes
            .iter()
            .filter(|e| e.context == context && e.capability_id == capability_id)
            .fold((0usize, 0usize), |(t, s), e| {
                (t + 1, s + usize::from(e.outcome == Outcome::Success))
            });
        if total == 0 {
            None
        } else {
            Some(ok as f64 / total as f64)
        }
    }

    /// 在同一上下文中成功过的其他能力
    pub fn associated_capabilities(&self, context: ContextLabel, capability_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .episodes
            .iter()
            .filter(|e| {
                e.context == context && e.capability_id != capability_id && e.outcome == Outcome::Success
            })
            .map(|e| e.capability_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn recent_for(&self, capability_id: &str, limit: usize) -> Vec<&Episode> {
        self.episodes
            .iter()
            .rev()
            .filter(|e| e.capability_id == capability_id)
            .take(limit)
            .collect()
    }

    pub fn episodes(&self) -> Vec<Episode> {
        self.episodes.iter().cloned().collect()
    }

    /// 从快照恢复（超出容量时保留最新的）
    pub fn restore(&mut self, episodes: Vec<Episode>) {
        self.episodes.clear();
        for e in episodes {
            self.push(e);
        }
    }
}
