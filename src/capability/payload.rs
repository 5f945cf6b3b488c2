//! 能力角色与结构化回答
//!
//! 每种角色的回答形状不同，用带标签的枚举 Payload 表示；共识引擎按变体选择相似度/合并策略。

use serde::{Deserialize, Serialize};

/// 能力角色：决定回答形状与默认执行阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityRole {
    /// 分诊：判断紧急程度
    Triage,
    Diagnosis,
    Treatment,
    RiskAssessment,
    General,
}

/// 默认流水线中的阶段归属
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    /// 第一阶段（必需）
    Triage,
    /// 第二阶段：主分析（必需）
    Primary,
    /// 第三阶段：辅助（可选）
    Secondary,
}

impl CapabilityRole {
    pub fn tier(&self) -> Tier {
        match self {
            CapabilityRole::Triage => Tier::Triage,
            CapabilityRole::Diagnosis => Tier::Primary,
            CapabilityRole::Treatment | CapabilityRole::RiskAssessment | CapabilityRole::General => {
                Tier::Secondary
            }
        }
    }

    /// 紧急度类能力：高风险上下文中奖励加成
    pub fn is_urgency(&self) -> bool {
        matches!(self, CapabilityRole::Triage)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityRole::Triage => "triage",
            CapabilityRole::Diagnosis => "diagnosis",
            CapabilityRole::Treatment => "treatment",
            CapabilityRole::RiskAssessment => "risk_assessment",
            CapabilityRole::General => "general",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Moderate => "moderate",
            RiskLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageAnswer {
    pub urgency: Urgency,
    #[serde(default)]
    pub rationale: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisAnswer {
    /// 首要判断
    pub primary: String,
    #[serde(default)]
    pub differentials: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreatmentAnswer {
    /// 按优先级排列的方案步骤，首项为主方案
    pub plan: Vec<String>,
    #[serde(default)]
    pub cautions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAnswer {
    pub level: RiskLevel,
    #[serde(default)]
    pub factors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralAnswer {
    pub summary: String,
}

/// 结构化回答（按角色区分形状）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Triage(TriageAnswer),
    Diagnosis(DiagnosisAnswer),
    Treatment(TreatmentAnswer),
    Risk(RiskAnswer),
    General(GeneralAnswer),
}

impl Payload {
    /// 按能力角色把服务返回的 JSON 解码为对应形状
    pub fn decode(role: CapabilityRole, answer: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match role {
            CapabilityRole::Triage => Payload::Triage(serde_json::from_value(answer)?),
            CapabilityRole::Diagnosis => Payload::Diagnosis(serde_json::from_value(answer)?),
            CapabilityRole::Treatment => Payload::Treatment(serde_json::from_value(answer)?),
            CapabilityRole::RiskAssessment => Payload::Risk(serde_json::from_value(answer)?),
            CapabilityRole::General => Payload::General(serde_json::from_value(answer)?),
        })
    }

    pub fn role(&self) -> CapabilityRole {
        match self {
            Payload::Triage(_) => CapabilityRole::Triage,
            Payload::Diagnosis(_) => CapabilityRole::Diagnosis,
            Payload::Treatment(_) => CapabilityRole::Treatment,
            Payload::Risk(_) => CapabilityRole::RiskAssessment,
            Payload::General(_) => CapabilityRole::General,
        }
    }

    /// 一行摘要：用作工作记忆假设名与上下文中的已有结论
    pub fn headline(&self) -> String {
        match self {
            Payload::Triage(t) => format!("urgency {}", t.urgency.as_str()),
            Payload::Diagnosis(d) => normalize(&d.primary),
            Payload::Treatment(t) => t
                .plan
                .first()
                .map(|s| normalize(s))
                .unwrap_or_else(|| "no treatment".to_string()),
            Payload::Risk(r) => format!("risk {}", r.level.as_str()),
            Payload::General(g) => {
                let s = normalize(&g.summary);
                if s.chars().count() > 80 {
                    format!("{}...", s.chars().take(80).collect::<String>())
                } else {
                    s
                }
            }
        }
    }
}

/// 小写、去首尾空白、合并连续空白
pub fn normalize(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_by_role() {
        let p = Payload::decode(CapabilityRole::Triage, json!({"urgency": "critical"})).unwrap();
        assert_eq!(
            p,
            Payload::Triage(TriageAnswer {
                urgency: Urgency::Critical,
                rationale: vec![]
            })
        );
        assert_eq!(p.role(), CapabilityRole::Triage);
    }

    #[test]
    fn test_decode_shape_mismatch_fails() {
        assert!(Payload::decode(CapabilityRole::Diagnosis, json!({"urgency": "low"})).is_err());
    }

    #[test]
    fn test_headline_normalizes() {
        let p = Payload::Diagnosis(DiagnosisAnswer {
            primary: "  Acute   Bronchitis ".to_string(),
            differentials: vec![],
        });
        assert_eq!(p.headline(), "acute bronchitis");
    }

    #[test]
    fn test_role_tiers() {
        assert_eq!(CapabilityRole::Triage.tier(), Tier::Triage);
        assert_eq!(CapabilityRole::Diagnosis.tier(), Tier::Primary);
        assert_eq!(CapabilityRole::General.tier(), Tier::Secondary);
    }
}
