//! 分层上下文记忆门面
//!
//! update_with_input：分类上下文、写入短期缓冲、合并症状；
//! update_with_decision：写入最近决策、生成情景条目、提升语义洞察、更新工作记忆假设；
//! get_relevant_context：为指定能力汇总相关子集，渲染为发给推理服务的系统上下文。
//! 每层一把锁；reset 只清空短期与工作记忆。

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::capability::DecisionResult;
use crate::config::MemoryConfig;
use crate::memory::{
    ContextClassifier, ContextLabel, Episode, EpisodicMemory, Hypothesis, KeywordClassifier,
    MemorySnapshot, PatternKey, SemanticMemory, ShortTermMemory, WorkingMemory,
};

/// 已有结论（前序阶段的成功结果）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub capability_id: String,
    pub headline: String,
    pub confidence: f64,
}

impl Finding {
    pub fn from_result(result: &DecisionResult) -> Option<Self> {
        let payload = result.answer.as_ref().filter(|_| result.success)?;
        Some(Self {
            capability_id: result.capability_id.clone(),
            headline: payload.headline(),
            confidence: result.confidence,
        })
    }
}

/// 面向单个能力的上下文子集
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextBundle {
    pub capability_id: String,
    pub label: ContextLabel,
    pub symptoms: Vec<String>,
    pub recent_inputs: Vec<String>,
    pub hypotheses: Vec<Hypothesis>,
    pub recent_outcomes: Vec<String>,
    pub insights: Vec<String>,
    pub prior_findings: Vec<Finding>,
}

impl ContextBundle {
    pub fn with_prior_findings(mut self, findings: &[Finding]) -> Self {
        self.prior_findings = findings.to_vec();
        self
    }

    /// 渲染为系统上下文文本（各段为空时省略）
    pub fn to_system_context(&self) -> String {
        let mut s = format!(
            "## Capability\n{}\n\n## Context\n{}\n\n",
            self.capability_id,
            self.label.as_str()
        );
        let mut section = |title: &str, items: &[String]| {
            if items.is_empty() {
                return;
            }
            s.push_str(&format!("## {}\n", title));
            for item in items {
                s.push_str(&format!("- {}\n", item));
            }
            s.push('\n');
        };
        section("Active symptoms", &self.symptoms);
        section("Recent inputs", &self.recent_inputs);
        let findings: Vec<String> = self
            .prior_findings
            .iter()
            .map(|f| format!("{}: {} ({:.0})", f.capability_id, f.headline, f.confidence))
            .collect();
        section("Prior findings", &findings);
        let hypotheses: Vec<String> = self
            .hypotheses
            .iter()
            .map(|h| format!("{} ({:.0})", h.name, h.confidence))
            .collect();
        section("Active hypotheses", &hypotheses);
        section("Recent outcomes", &self.recent_outcomes);
        section("Known patterns", &self.insights);
        s
    }
}

pub struct ContextualMemory {
    classifier: Arc<dyn ContextClassifier>,
    short_term: Mutex<ShortTermMemory>,
    working: Mutex<WorkingMemory>,
    episodic: Mutex<EpisodicMemory>,
    semantic: Mutex<SemanticMemory>,
}

impl Default for ContextualMemory {
    fn default() -> Self {
        Self::new(&MemoryConfig::default(), Arc::new(KeywordClassifier::default()))
    }
}

impl ContextualMemory {
    pub fn new(config: &MemoryConfig, classifier: Arc<dyn ContextClassifier>) -> Self {
        Self {
            classifier,
            short_term: Mutex::new(ShortTermMemory::new(config.short_term_capacity)),
            working: Mutex::new(WorkingMemory::new(config.max_hypotheses)),
            episodic: Mutex::new(EpisodicMemory::new(config.episodic_capacity)),
            semantic: Mutex::new(SemanticMemory::new(
                config.semantic_capacity,
                config.promotion_threshold,
            )),
        }
    }

    /// 分类输入并写入短期记忆，返回上下文标签
    pub fn update_with_input(&self, text: &str) -> ContextLabel {
        let label = self.classifier.classify(text);
        let symptoms = self.classifier.symptoms(text);
        self.short_term
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_input(text, label, symptoms);
        tracing::debug!(label = label.as_str(), "Input classified");
        label
    }

    pub fn current_label(&self) -> ContextLabel {
        self.short_term
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .label()
    }

    /// 写入一次决策结果；熔断/禁用/取消等未真正调用的结果不进入记忆。返回是否新提升了语义洞察
    pub fn update_with_decision(&self, result: &DecisionResult) -> bool {
        if !result.is_outcome() {
            return false;
        }
        let label = {
            let mut st = self.short_term.lock().unwrap_or_else(PoisonError::into_inner);
            st.push_decision(result.clone());
            st.label()
        };

        let episode = Episode::from_result(result, label);
        let key = PatternKey {
            context: label,
            capability_id: result.capability_id.clone(),
            outcome: episode.outcome,
        };
        let (recurrence, reliability, associated) = {
            let mut episodic = self.episodic.lock().unwrap_or_else(PoisonError::into_inner);
            episodic.push(episode);
            (
                episodic.recurrence(label, &result.capability_id, key.outcome),
                episodic
                    .reliability(label, &result.capability_id)
                    .unwrap_or(0.0),
                episodic.associated_capabilities(label, &result.capability_id),
            )
        };
        let promoted = self
            .semantic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(key, recurrence, reliability, associated, result.timestamp);
        if promoted {
            tracing::info!(capability = %result.capability_id, context = label.as_str(), "Pattern promoted to semantic memory");
        }

        self.working
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(result);
        promoted
    }

    pub fn get_relevant_context(&self, capability_id: &str) -> ContextBundle {
        let (label, symptoms, recent_inputs) = {
            let st = self.short_term.lock().unwrap_or_else(PoisonError::into_inner);
            (
                st.label(),
                st.symptoms(),
                st.recent_inputs().rev().take(3).cloned().collect::<Vec<_>>(),
            )
        };
        let hypotheses = self
            .working
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .hypotheses()
            .to_vec();
        let recent_outcomes = self
            .episodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent_for(capability_id, 3)
            .into_iter()
            .flat_map(|e| e.learnings.clone())
            .collect();
        let insights = self
            .semantic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .relevant_to(capability_id, label)
            .iter()
            .map(|i| i.describe())
            .collect();
        ContextBundle {
            capability_id: capability_id.to_string(),
            label,
            symptoms,
            recent_inputs,
            hypotheses,
            recent_outcomes,
            insights,
            prior_findings: Vec::new(),
        }
    }

    pub fn hypotheses(&self) -> Vec<Hypothesis> {
        self.working
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .hypotheses()
            .to_vec()
    }

    pub fn episode_count(&self) -> usize {
        self.episodic.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn insight_count(&self) -> usize {
        self.semantic.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// 清空短期与工作记忆；情景与语义记忆保留
    pub fn reset(&self) {
        self.short_term
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.working
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot::new(
            self.episodic
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .episodes(),
            self.semantic
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insights(),
        )
    }

    pub fn restore(&self, snapshot: MemorySnapshot) {
        self.episodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .restore(snapshot.episodes);
        self.semantic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .restore(snapshot.insights);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{DiagnosisAnswer, InvocationError, Payload};

    fn dx(primary: &str, confidence: f64) -> DecisionResult {
        DecisionResult::succeeded(
            "dx",
            "fever and cough",
            Payload::Diagnosis(DiagnosisAnswer {
                primary: primary.to_string(),
                differentials: vec![],
            }),
            confidence,
            100,
        )
    }

    #[test]
    fn test_input_classified_and_symptoms_merged() {
        let memory = ContextualMemory::default();
        assert_eq!(memory.update_with_input("fever since monday"), ContextLabel::Diagnostic);
        memory.update_with_input("now a cough too");
        let bundle = memory.get_relevant_context("dx");
        assert_eq!(bundle.symptoms, vec!["cough", "fever"]);
        assert_eq!(bundle.recent_inputs[0], "now a cough too");
    }

    #[test]
    fn test_semantic_promotion_after_three_recurrences() {
        let memory = ContextualMemory::default();
        memory.update_with_input("fever");
        assert!(!memory.update_with_decision(&dx("flu", 85.0)));
        assert!(!memory.update_with_decision(&dx("flu", 85.0)));
        assert!(memory.update_with_decision(&dx("flu", 85.0)));
        assert_eq!(memory.episode_count(), 3);
        assert_eq!(memory.insight_count(), 1);
        let bundle = memory.get_relevant_context("dx");
        assert_eq!(bundle.insights.len(), 1);
        assert!(bundle.to_system_context().contains("## Known patterns"));
    }

    #[test]
    fn test_unavailable_results_not_recorded() {
        let memory = ContextualMemory::default();
        let r = DecisionResult::failed("dx", "x", InvocationError::Unavailable { retry_in_ms: 5 }, 0);
        memory.update_with_decision(&r);
        assert_eq!(memory.episode_count(), 0);
    }

    #[test]
    fn test_reset_keeps_long_term_layers() {
        let memory = ContextualMemory::default();
        memory.update_with_input("fever");
        memory.update_with_decision(&dx("flu", 85.0));
        memory.reset();
        assert!(memory.hypotheses().is_empty());
        assert_eq!(memory.current_label(), ContextLabel::Routine);
        assert_eq!(memory.episode_count(), 1);
    }

    #[test]
    fn test_render_prior_findings() {
        let bundle = ContextBundle::default().with_prior_findings(&[Finding {
            capability_id: "triage".to_string(),
            headline: "urgency high".to_string(),
            confidence: 91.0,
        }]);
        let text = bundle.to_system_context();
        assert!(text.contains("## Prior findings\n- triage: urgency high (91)"));
        assert!(!text.contains("## Known patterns"));
    }
}
