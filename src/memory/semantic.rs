//! 语义记忆：从情景记忆中提升的稳定模式
//!
//! 以 (上下文, 能力, 结果) 为键；同一模式在情景记忆中出现次数达到阈值后才物化为 Insight，
//! 之后每次出现刷新频次、可靠度与关联能力。超出上限按插入顺序淘汰。

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::memory::{ContextLabel, Outcome};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternKey {
    pub context: ContextLabel,
    pub capability_id: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub key: PatternKey,
    pub frequency: usize,
    /// 该上下文下该能力的成功比例
    pub reliability: f64,
    pub associated_capabilities: Vec<String>,
    pub last_seen: i64,
}

impl Insight {
    pub fn describe(&self) -> String {
        format!(
            "{} tends to {} in {} context (seen {}x, reliability {:.2})",
            self.key.capability_id,
            match self.key.outcome {
                Outcome::Success => "succeed",
                Outcome::Failure => "fail",
            },
            self.key.context.as_str(),
            self.frequency,
            self.reliability
        )
    }
}

#[derive(Debug, Clone)]
pub struct SemanticMemory {
    insights: HashMap<PatternKey, Insight>,
    order: VecDeque<PatternKey>,
    capacity: usize,
    promotion_threshold: usize,
}

impl Default for SemanticMemory {
    fn default() -> Self {
        Self::new(200, 3)
    }
}

impl SemanticMemory {
    pub fn new(capacity: usize, promotion_threshold: usize) -> Self {
        Self {
            insights: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            promotion_threshold: promotion_threshold.max(1),
        }
    }

    /// 记录一次模式出现；recurrence 为情景记忆中的出现次数。返回是否新物化了 Insight
    pub fn observe(
        &mut self,
        key: PatternKey,
        recurrence: usize,
        reliability: f64,
        associated: Vec<String>,
        now: i64,
    ) -> bool {
        if let Some(insight) = self.insights.get_mut(&key) {
            insight.frequency = insight.frequency.max(recurrence);
            insight.reliability = reliability;
            insight.associated_capabilities = associated;
            insight.last_seen = now;
            return false;
        }
        if recurrence < self.promotion_threshold {
            return false;
        }
        self.insert(Insight {
            key,
            frequency: recurrence,
            reliability,
            associated_capabilities: associated,
            last_seen: now,
        });
        true
    }

    fn insert(&mut self, insight: Insight) {
        if self.insights.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.insights.remove(&oldest);
            }
        }
        self.order.push_back(insight.key.clone());
        self.insights.insert(insight.key.clone(), insight);
    }

    pub fn get(&self, key: &PatternKey) -> Option<&Insight> {
        self.insights.get(key)
    }

    /// 与能力相关的洞察：能力本身的模式，或把它列为关联能力的模式
    pub fn relevant_to(&self, capability_id: &str, context: ContextLabel) -> Vec<Insight> {
        let mut out: Vec<Insight> = self
            .order
            .iter()
            .filter_map(|k| self.insights.get(k))
            .filter(|i| {
                i.key.context == context
                    && (i.key.capability_id == capability_id
                        || i.associated_capabilities.iter().any(|a| a == capability_id))
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.frequency.cmp(&a.frequency));
        out
    }

    pub fn len(&self) -> usize {
        self.insights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insights.is_empty()
    }

    pub fn insights(&self) -> Vec<Insight> {
        self.order
            .iter()
            .filter_map(|k| self.insights.get(k))
            .cloned()
            .collect()
    }

    pub fn restore(&mut self, insights: Vec<Insight>) {
        self.insights.clear();
        self.order.clear();
        for i in insights {
            self.insert(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> PatternKey {
        PatternKey {
            context: ContextLabel::Diagnostic,
            capability_id: id.to_string(),
            outcome: Outcome::Success,
        }
    }

    #[test]
    fn test_promotion_requires_recurrence() {
        let mut m = SemanticMemory::default();
        assert!(!m.observe(key("dx"), 1, 1.0, vec![], 0));
        assert!(!m.observe(key("dx"), 2, 1.0, vec![], 0));
        assert!(m.is_empty());
        assert!(m.observe(key("dx"), 3, 1.0, vec![], 0));
        assert!(!m.observe(key("dx"), 4, 0.9, vec!["tx".to_string()], 1));
        let insight = m.get(&key("dx")).unwrap();
        assert_eq!(insight.frequency, 4);
        assert_eq!(insight.associated_capabilities, vec!["tx"]);
    }

    #[test]
    fn test_relevant_includes_associated() {
        let mut m = SemanticMemory::default();
        m.observe(key("dx"), 3, 1.0, vec!["tx".to_string()], 0);
        assert_eq!(m.relevant_to("tx", ContextLabel::Diagnostic).len(), 1);
        assert!(m.relevant_to("tx", ContextLabel::Emergency).is_empty());
    }

    #[test]
    fn test_fifo_eviction() {
        let mut m = SemanticMemory::new(2, 1);
        m.observe(key("a"), 1, 1.0, vec![], 0);
        m.observe(key("b"), 1, 1.0, vec![], 0);
        m.observe(key("c"), 1, 1.0, vec![], 0);
        assert_eq!(m.len(), 2);
        assert!(m.get(&key("a")).is_none());
    }
}
