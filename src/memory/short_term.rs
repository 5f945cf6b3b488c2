//! 短期记忆：最近输入与决策的环形缓冲、活跃症状集合、当前上下文标签
//!
//! 会话重置时清空。上下文分类通过可插拔的 ContextClassifier 完成。

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::capability::DecisionResult;

/// 上下文标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextLabel {
    Emergency,
    Diagnostic,
    Treatment,
    #[default]
    Routine,
}

impl ContextLabel {
    /// 高风险上下文：奖励翻倍、分诊类能力额外加成
    pub fn is_high_stakes(&self) -> bool {
        matches!(self, ContextLabel::Emergency)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextLabel::Emergency => "emergency",
            ContextLabel::Diagnostic => "diagnostic",
            ContextLabel::Treatment => "treatment",
            ContextLabel::Routine => "routine",
        }
    }
}

/// 可插拔的上下文分类器
pub trait ContextClassifier: Send + Sync {
    fn classify(&self, text: &str) -> ContextLabel;

    /// 从输入中识别的症状词；默认不识别
    fn symptoms(&self, _text: &str) -> Vec<String> {
        Vec::new()
    }
}

/// 关键词分类器：按 emergency > treatment > diagnostic 的顺序匹配，均未命中为 routine
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    pub emergency: Vec<String>,
    pub treatment: Vec<String>,
    pub diagnostic: Vec<String>,
    pub symptoms: Vec<String>,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self {
            emergency: words(&[
                "emergency",
                "unconscious",
                "chest pain",
                "bleeding",
                "seizure",
                "not breathing",
                "stroke",
            ]),
            treatment: words(&["treatment", "medication", "dose", "therapy", "prescription"]),
            diagnostic: words(&["diagnose", "diagnosis", "symptom", "test result", "why"]),
            symptoms: words(&[
                "fever",
                "cough",
                "headache",
                "nausea",
                "dizziness",
                "fatigue",
                "rash",
                "chest pain",
                "shortness of breath",
                "bleeding",
                "vomiting",
            ]),
        }
    }
}

impl ContextClassifier for KeywordClassifier {
    fn classify(&self, text: &str) -> ContextLabel {
        let lower = text.to_lowercase();
        let hit = |list: &[String]| list.iter().any(|k| lower.contains(k.as_str()));
        if hit(&self.emergency) {
            ContextLabel::Emergency
        } else if hit(&self.treatment) {
            ContextLabel::Treatment
        } else if hit(&self.diagnostic) || hit(&self.symptoms) {
            ContextLabel::Diagnostic
        } else {
            ContextLabel::Routine
        }
    }

    fn symptoms(&self, text: &str) -> Vec<String> {
        let lower = text.to_lowercase();
        self.symptoms
            .iter()
            .filter(|s| lower.contains(s.as_str()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ShortTermMemory {
    inputs: VecDeque<String>,
    decisions: VecDeque<DecisionResult>,
    symptoms: BTreeSet<String>,
    label: ContextLabel,
    capacity: usize,
}

impl ShortTermMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            inputs: VecDeque::new(),
            decisions: VecDeque::new(),
            symptoms: BTreeSet::new(),
            label: ContextLabel::Routine,
            capacity: capacity.max(1),
        }
    }

    pub fn push_input(&mut self, text: &str, label: ContextLabel, symptoms: Vec<String>) {
        if self.inputs.len() == self.capacity {
            self.inputs.pop_front();
        }
        self.inputs.push_back(text.to_string());
        self.symptoms.extend(symptoms);
        self.label = label;
    }

    pub fn push_decision(&mut self, result: DecisionResult) {
        if self.decisions.len() == self.capacity {
            self.decisions.pop_front();
        }
        self.decisions.push_back(result);
    }

    pub fn label(&self) -> ContextLabel {
        self.label
    }

    pub fn recent_inputs(&self) -> impl DoubleEndedIterator<Item = &String> {
        self.inputs.iter()
    }

    pub fn recent_decisions(&self) -> impl Iterator<Item = &DecisionResult> {
        self.decisions.iter()
    }

    pub fn symptoms(&self) -> Vec<String> {
        self.symptoms.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.inputs.clear();
        self.decisions.clear();
        self.symptoms.clear();
        self.label = ContextLabel::Routine;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_classifier() {
        let c = KeywordClassifier::default();
        assert_eq!(c.classify("Sudden CHEST PAIN and sweating"), ContextLabel::Emergency);
        assert_eq!(c.classify("what dose of ibuprofen"), ContextLabel::Treatment);
        assert_eq!(c.classify("fever for three days"), ContextLabel::Diagnostic);
        assert_eq!(c.classify("hello"), ContextLabel::Routine);
        assert_eq!(c.symptoms("fever and cough"), vec!["fever", "cough"]);
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let mut m = ShortTermMemory::new(2);
        for i in 0..5 {
            m.push_input(&format!("in {i}"), ContextLabel::Routine, vec![]);
        }
        let inputs: Vec<&String> = m.recent_inputs().collect();
        assert_eq!(inputs, vec!["in 3", "in 4"]);
    }

    #[test]
    fn test_symptoms_merge_and_clear() {
        let mut m = ShortTermMemory::new(4);
        m.push_input("a", ContextLabel::Diagnostic, vec!["fever".to_string()]);
        m.push_input("b", ContextLabel::Emergency, vec!["fever".to_string(), "rash".to_string()]);
        assert_eq!(m.symptoms(), vec!["fever", "rash"]);
        assert_eq!(m.label(), ContextLabel::Emergency);
        m.clear();
        assert!(m.symptoms().is_empty());
        assert_eq!(m.label(), ContextLabel::Routine);
    }
}
