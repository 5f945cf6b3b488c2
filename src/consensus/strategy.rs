//! 按回答形状区分的等价判定与合并策略
//!
//! 分组键必须是确定性的：同一回答永远落入同一组。合并时传入的回答已按权重降序排列。

use std::collections::HashMap;

use crate::capability::{
    normalize, CapabilityRole, DiagnosisAnswer, GeneralAnswer, Payload, RiskAnswer,
    TreatmentAnswer, TriageAnswer,
};

pub trait ConsensusStrategy: Send + Sync {
    /// 等价分组键
    fn group_key(&self, payload: &Payload) -> String;

    /// 合并同组回答；payloads 非空且按权重降序
    fn merge(&self, payloads: &[&Payload]) -> Payload;
}

/// 合并列表：保序去重（按规范化后的文本）
fn union(lists: impl Iterator<Item = Vec<String>>) -> Vec<String> {
    let mut seen = Vec::new();
    let mut out = Vec::new();
    for item in lists.flatten() {
        let key = normalize(&item);
        if !seen.contains(&key) {
            seen.push(key);
            out.push(item);
        }
    }
    out
}

pub struct TriageStrategy;

impl ConsensusStrategy for TriageStrategy {
    fn group_key(&self, payload: &Payload) -> String {
        match payload {
            Payload::Triage(t) => t.urgency.as_str().to_string(),
            other => other.headline(),
        }
    }

    fn merge(&self, payloads: &[&Payload]) -> Payload {
        let answers: Vec<&TriageAnswer> = payloads
            .iter()
            .filter_map(|p| match p {
                Payload::Triage(t) => Some(t),
                _ => None,
            })
            .collect();
        match answers.first() {
            Some(first) => Payload::Triage(TriageAnswer {
                urgency: first.urgency,
                rationale: union(answers.iter().map(|a| a.rationale.clone())),
            }),
            None => payloads[0].clone(),
        }
    }
}

pub struct DiagnosisStrategy;

impl ConsensusStrategy for DiagnosisStrategy {
    fn group_key(&self, payload: &Payload) -> String {
        match payload {
            Payload::Diagnosis(d) => normalize(&d.primary),
            other => other.headline(),
        }
    }

    fn merge(&self, payloads: &[&Payload]) -> Payload {
        let answers: Vec<&DiagnosisAnswer> = payloads
            .iter()
            .filter_map(|p| match p {
                Payload::Diagnosis(d) => Some(d),
                _ => None,
            })
            .collect();
        match answers.first() {
            Some(first) => {
                let primary = normalize(&first.primary);
                let differentials = union(answers.iter().map(|a| a.differentials.clone()))
                    .into_iter()
                    .filter(|d| normalize(d) != primary)
                    .collect();
                Payload::Diagnosis(DiagnosisAnswer {
                    primary: first.primary.clone(),
                    differentials,
                })
            }
            None => payloads[0].clone(),
        }
    }
}

/// 以首项方案（主方案）判等
pub struct TreatmentStrategy;

impl ConsensusStrategy for TreatmentStrategy {
    fn group_key(&self, payload: &Payload) -> String {
        payload.headline()
    }

    fn merge(&self, payloads: &[&Payload]) -> Payload {
        let answers: Vec<&TreatmentAnswer> = payloads
            .iter()
            .filter_map(|p| match p {
                Payload::Treatment(t) => Some(t),
                _ => None,
            })
            .collect();
        match answers.first() {
            Some(_) => Payload::Treatment(TreatmentAnswer {
                plan: union(answers.iter().map(|a| a.plan.clone())),
                cautions: union(answers.iter().map(|a| a.cautions.clone())),
            }),
            None => payloads[0].clone(),
        }
    }
}

pub struct RiskStrategy;

impl ConsensusStrategy for RiskStrategy {
    fn group_key(&self, payload: &Payload) -> String {
        match payload {
            Payload::Risk(r) => r.level.as_str().to_string(),
            other => other.headline(),
        }
    }

    fn merge(&self, payloads: &[&Payload]) -> Payload {
        let answers: Vec<&RiskAnswer> = payloads
            .iter()
            .filter_map(|p| match p {
                Payload::Risk(r) => Some(r),
                _ => None,
            })
            .collect();
        match answers.first() {
            Some(first) => Payload::Risk(RiskAnswer {
                level: first.level,
                factors: union(answers.iter().map(|a| a.factors.clone())),
            }),
            None => payloads[0].clone(),
        }
    }
}

/// 自由文本：规范化后完全相同才视为等价，合并取权重最高者
pub struct GeneralStrategy;

impl ConsensusStrategy for GeneralStrategy {
    fn group_key(&self, payload: &Payload) -> String {
        match payload {
            Payload::General(g) => normalize(&g.summary),
            other => other.headline(),
        }
    }

    fn merge(&self, payloads: &[&Payload]) -> Payload {
        match payloads[0] {
            Payload::General(g) => Payload::General(GeneralAnswer {
                summary: g.summary.clone(),
            }),
            other => other.clone(),
        }
    }
}

/// 角色 → 策略
pub struct StrategySet {
    strategies: HashMap<CapabilityRole, Box<dyn ConsensusStrategy>>,
}

impl Default for StrategySet {
    fn default() -> Self {
        let mut strategies: HashMap<CapabilityRole, Box<dyn ConsensusStrategy>> = HashMap::new();
        strategies.insert(CapabilityRole::Triage, Box::new(TriageStrategy));
        strategies.insert(CapabilityRole::Diagnosis, Box::new(DiagnosisStrategy));
        strategies.insert(CapabilityRole::Treatment, Box::new(TreatmentStrategy));
        strategies.insert(CapabilityRole::RiskAssessment, Box::new(RiskStrategy));
        strategies.insert(CapabilityRole::General, Box::new(GeneralStrategy));
        Self { strategies }
    }
}

impl StrategySet {
    /// 替换某个角色的策略
    pub fn with(mut self, role: CapabilityRole, strategy: Box<dyn ConsensusStrategy>) -> Self {
        self.strategies.insert(role, strategy);
        self
    }

    /// 分组键带角色前缀，不同形状的回答永不同组
    pub fn key(&self, payload: &Payload) -> String {
        let role = payload.role();
        let inner = match self.strategies.get(&role) {
            Some(s) => s.group_key(payload),
            None => payload.headline(),
        };
        format!("{}:{}", role.as_str(), inner)
    }

    pub fn merge(&self, payloads: &[&Payload]) -> Option<Payload> {
        let first = payloads.first()?;
        Some(match self.strategies.get(&first.role()) {
            Some(s) => s.merge(payloads),
            None => (*first).clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Urgency;

    fn dx(primary: &str, differentials: &[&str]) -> Payload {
        Payload::Diagnosis(DiagnosisAnswer {
            primary: primary.to_string(),
            differentials: differentials.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_keys_are_normalized_and_role_prefixed() {
        let set = StrategySet::default();
        assert_eq!(set.key(&dx("Acute  Bronchitis", &[])), "diagnosis:acute bronchitis");
        assert_eq!(set.key(&dx("acute bronchitis", &["flu"])), set.key(&dx(" ACUTE bronchitis", &[])));
        let triage = Payload::Triage(TriageAnswer {
            urgency: Urgency::High,
            rationale: vec![],
        });
        assert_eq!(set.key(&triage), "triage:high");
    }

    #[test]
    fn test_diagnosis_merge_unions_differentials() {
        let set = StrategySet::default();
        let a = dx("Flu", &["cold", "covid"]);
        let b = dx("flu", &["Cold", "strep", "flu"]);
        let merged = set.merge(&[&a, &b]).unwrap();
        assert_eq!(merged, dx("Flu", &["cold", "covid", "strep"]));
    }

    #[test]
    fn test_treatment_grouped_by_first_step() {
        let set = StrategySet::default();
        let a = Payload::Treatment(TreatmentAnswer {
            plan: vec!["Rest".to_string(), "fluids".to_string()],
            cautions: vec![],
        });
        let b = Payload::Treatment(TreatmentAnswer {
            plan: vec!["rest".to_string(), "paracetamol".to_string()],
            cautions: vec!["liver".to_string()],
        });
        assert_eq!(set.key(&a), set.key(&b));
        let Payload::Treatment(merged) = set.merge(&[&a, &b]).unwrap() else {
            panic!("expected treatment");
        };
        assert_eq!(merged.plan, vec!["Rest", "fluids", "paracetamol"]);
        assert_eq!(merged.cautions, vec!["liver"]);
    }

    #[test]
    fn test_merge_empty_is_none() {
        assert!(StrategySet::default().merge(&[]).is_none());
    }
}
