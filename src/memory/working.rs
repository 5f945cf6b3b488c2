//! 工作记忆：当前会话的活跃假设
//!
//! 假设以回答摘要为名，同名替换；同一角色下出现不同结论视为相互矛盾，旧假设置信度 ×0.8。
//! 按置信度降序，最多保留 max_hypotheses 条。会话重置时清空。

use serde::Serialize;

use crate::capability::{CapabilityRole, DecisionResult};

/// 矛盾证据的置信度衰减系数
pub const CONTRADICTION_DECAY: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hypothesis {
    pub name: String,
    pub role: CapabilityRole,
    /// 0-100
    pub confidence: f64,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkingMemory {
    hypotheses: Vec<Hypothesis>,
    max_hypotheses: usize,
}

impl Default for WorkingMemory {
    fn default() -> Self {
        Self::new(5)
    }
}

impl WorkingMemory {
    pub fn new(max_hypotheses: usize) -> Self {
        Self {
            hypotheses: Vec::new(),
            max_hypotheses: max_hypotheses.max(1),
        }
    }

    /// 用一次成功结果更新假设；失败结果不产生假设
    pub fn observe(&mut self, result: &DecisionResult) {
        let Some(payload) = result.answer.as_ref().filter(|_| result.success) else {
            return;
        };
        let name = payload.headline();
        let role = payload.role();

        for h in self.hypotheses.iter_mut() {
            if h.role == role && h.name != name {
                h.confidence *= CONTRADICTION_DECAY;
            }
        }

        match self.hypotheses.iter_mut().find(|h| h.name == name) {
            Some(existing) => {
                existing.confidence = result.confidence;
                if !existing.sources.contains(&result.capability_id) {
                    existing.sources.push(result.capability_id.clone());
                }
            }
            None => self.hypotheses.push(Hypothesis {
                name,
                role,
                confidence: result.confidence,
                sources: vec![result.capability_id.clone()],
            }),
        }

        self.hypotheses
            .sort_by(|a, b| b.confidence.total_cmp(&a.confidence).then_with(|| a.name.cmp(&b.name)));
        self.hypotheses.truncate(self.max_hypotheses);
    }

    pub fn hypotheses(&self) -> &[Hypothesis] {
        &self.hypotheses
    }

    pub fn top(&self) -> Option<&Hypothesis> {
        self.hypotheses.first()
    }

    pub fn clear(&mut self) {
        self.hypotheses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{DiagnosisAnswer, Payload};

    fn dx(id: &str, primary: &str, confidence: f64) -> DecisionResult {
        DecisionResult::succeeded(
            id,
            "input",
            Payload::Diagnosis(DiagnosisAnswer {
                primary: primary.to_string(),
                differentials: vec![],
            }),
            confidence,
            10,
        )
    }

    #[test]
    fn test_contradiction_decays_others() {
        let mut wm = WorkingMemory::default();
        wm.observe(&dx("a", "flu", 80.0));
        wm.observe(&dx("b", "cold", 70.0));
        let flu = wm.hypotheses().iter().find(|h| h.name == "flu").unwrap();
        assert!((flu.confidence - 64.0).abs() < 1e-9);
        assert_eq!(wm.top().unwrap().name, "cold");
    }

    #[test]
    fn test_same_name_replaced() {
        let mut wm = WorkingMemory::default();
        wm.observe(&dx("a", "Flu", 60.0));
        wm.observe(&dx("b", "flu", 90.0));
        assert_eq!(wm.hypotheses().len(), 1);
        assert_eq!(wm.top().unwrap().confidence, 90.0);
        assert_eq!(wm.top().unwrap().sources, vec!["a", "b"]);
    }

    #[test]
    fn test_capped_and_sorted() {
        let mut wm = WorkingMemory::new(5);
        for i in 0..8 {
            wm.observe(&dx("a", &format!("h{i}"), 50.0 + i as f64));
        }
        assert_eq!(wm.hypotheses().len(), 5);
        let confs: Vec<f64> = wm.hypotheses().iter().map(|h| h.confidence).collect();
        assert!(confs.windows(2).all(|w| w[0] >= w[1]));
    }
}
