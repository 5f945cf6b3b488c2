//! 执行计划
//!
//! 计划由有序阶段组成：阶段内并行或顺序执行，阶段之间严格串行。
//! 阶段可标记为必需（无可用能力时整个请求失败）并附带进入条件（按前序结果求值）。
//! background 中的能力在决策返回后以后台补充调用的方式执行。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::{normalize, CapabilityRegistry, DecisionResult, Tier};
use crate::memory::ContextLabel;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Plan has no stages")]
    Empty,

    #[error("Stage '{0}' lists no capabilities")]
    EmptyStage(String),

    #[error("Stage '{stage}' references unknown capability '{capability}'")]
    UnknownCapability { stage: String, capability: String },

    #[error("Plan parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    #[default]
    Parallel,
    Sequential,
}

/// 阶段进入条件（对前序阶段的全部结果求值）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum StageCondition {
    #[default]
    Always,
    /// 前序结果全部成功（没有前序结果时为真）
    AllSucceeded,
    AnySucceeded,
    /// 指定能力（未指定则任一成功结果）的置信度不低于 value
    MinConfidence {
        #[serde(default)]
        capability: Option<String>,
        value: f64,
    },
    /// 指定能力的成功回答摘要等于 headline（规范化后比较）
    AnswerIs { capability: String, headline: String },
    Not { condition: Box<StageCondition> },
}

impl StageCondition {
    pub fn evaluate(&self, prior: &[DecisionResult]) -> bool {
        match self {
            StageCondition::Always => true,
            StageCondition::AllSucceeded => prior.iter().all(|r| r.success),
            StageCondition::AnySucceeded => prior.iter().any(|r| r.success),
            StageCondition::MinConfidence { capability, value } => prior
                .iter()
                .filter(|r| r.success)
                .filter(|r| capability.as_ref().map_or(true, |c| *c == r.capability_id))
                .any(|r| r.confidence >= *value),
            StageCondition::AnswerIs {
                capability,
                headline,
            } => {
                let want = normalize(headline);
                prior.iter().any(|r| {
                    r.success
                        && r.capability_id == *capability
                        && r.answer.as_ref().map(|p| p.headline()) == Some(want.clone())
                })
            }
            StageCondition::Not { condition } => !condition.evaluate(prior),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub mode: StageMode,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub condition: StageCondition,
}

fn default_required() -> bool {
    true
}

impl Stage {
    pub fn parallel(name: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            name: name.into(),
            capabilities,
            mode: StageMode::Parallel,
            required: true,
            condition: StageCondition::Always,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub name: String,
    #[serde(rename = "stage")]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub background: Vec<String>,
}

impl ExecutionPlan {
    /// 默认三阶段流水线：分诊（必需）→ 主分析（必需）→ 辅助（可选）；没有成员的层级不生成阶段
    pub fn default_pipeline(registry: &CapabilityRegistry) -> Self {
        let tiers = [
            (Tier::Triage, "triage", true),
            (Tier::Primary, "primary", true),
            (Tier::Secondary, "secondary", false),
        ];
        let stages = tiers
            .into_iter()
            .filter_map(|(tier, name, required)| {
                let ids: Vec<String> = registry.by_tier(tier).into_iter().map(|d| d.id).collect();
                if ids.is_empty() {
                    return None;
                }
                Some(Stage {
                    required,
                    ..Stage::parallel(name, ids)
                })
            })
            .collect();
        Self {
            name: "default".to_string(),
            stages,
            background: Vec::new(),
        }
    }

    /// 每组一个并行的必需阶段
    pub fn from_phases(phases: Vec<Vec<String>>) -> Self {
        let stages = phases
            .into_iter()
            .enumerate()
            .map(|(i, ids)| Stage::parallel(format!("phase-{}", i + 1), ids))
            .collect();
        Self {
            name: "phases".to_string(),
            stages,
            background: Vec::new(),
        }
    }

    /// 单阶段并行计划
    pub fn parallel(capabilities: Vec<String>) -> Self {
        Self {
            name: "parallel".to_string(),
            stages: vec![Stage::parallel("parallel", capabilities)],
            background: Vec::new(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, PlanError> {
        toml::from_str(text).map_err(|e| PlanError::Parse(e.to_string()))
    }

    pub fn validate(&self, registry: &CapabilityRegistry) -> Result<(), PlanError> {
        if self.stages.is_empty() {
            return Err(PlanError::Empty);
        }
        for stage in &self.stages {
            if stage.capabilities.is_empty() {
                return Err(PlanError::EmptyStage(stage.name.clone()));
            }
            for id in &stage.capabilities {
                if !registry.contains(id) {
                    return Err(PlanError::UnknownCapability {
                        stage: stage.name.clone(),
                        capability: id.clone(),
                    });
                }
            }
        }
        for id in &self.background {
            if !registry.contains(id) {
                return Err(PlanError::UnknownCapability {
                    stage: "background".to_string(),
                    capability: id.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn capability_count(&self) -> usize {
        self.stages.iter().map(|s| s.capabilities.len()).sum()
    }
}

/// 外部计划提供者；返回 None 时使用默认流水线
pub trait PlanSupplier: Send + Sync {
    fn plan(&self, input: &str, context: ContextLabel, registry: &CapabilityRegistry) -> Option<ExecutionPlan>;
}

/// 固定计划
pub struct StaticPlan(pub ExecutionPlan);

impl PlanSupplier for StaticPlan {
    fn plan(&self, _input: &str, _context: ContextLabel, _registry: &CapabilityRegistry) -> Option<ExecutionPlan> {
        Some(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{default_catalog, InvocationError, Payload, TriageAnswer, Urgency};

    fn triage(urgency: Urgency, confidence: f64) -> DecisionResult {
        DecisionResult::succeeded(
            "triage",
            "in",
            Payload::Triage(TriageAnswer {
                urgency,
                rationale: vec![],
            }),
            confidence,
            10,
        )
    }

    #[test]
    fn test_default_pipeline() {
        let registry = CapabilityRegistry::from_descriptors(default_catalog());
        let plan = ExecutionPlan::default_pipeline(&registry);
        let names: Vec<&str> = plan.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["triage", "primary", "secondary"]);
        assert!(plan.stages[0].required && plan.stages[1].required);
        assert!(!plan.stages[2].required);
        assert_eq!(plan.capability_count(), 6);
        assert!(plan.validate(&registry).is_ok());
    }

    #[test]
    fn test_conditions() {
        let prior = vec![
            triage(Urgency::Critical, 92.0),
            DecisionResult::failed("x", "in", InvocationError::Timeout { after_ms: 1 }, 1),
        ];
        assert!(StageCondition::AnySucceeded.evaluate(&prior));
        assert!(!StageCondition::AllSucceeded.evaluate(&prior));
        assert!(StageCondition::MinConfidence {
            capability: Some("triage".to_string()),
            value: 90.0
        }
        .evaluate(&prior));
        let critical = StageCondition::AnswerIs {
            capability: "triage".to_string(),
            headline: "Urgency Critical".to_string(),
        };
        assert!(critical.evaluate(&prior));
        assert!(!StageCondition::Not {
            condition: Box::new(critical)
        }
        .evaluate(&prior));
    }

    #[test]
    fn test_from_toml() {
        let plan = ExecutionPlan::from_toml_str(
            r#"
            name = "fast-track"
            background = ["follow_up"]

            [[stage]]
            name = "triage"
            capabilities = ["triage"]

            [[stage]]
            name = "treat"
            capabilities = ["treatment_planning", "drug_safety"]
            mode = "sequential"
            required = false
            condition = { when = "min_confidence", value = 80.0 }
            "#,
        )
        .unwrap();
        assert_eq!(plan.stages.len(), 2);
        assert_eq!(plan.stages[1].mode, StageMode::Sequential);
        assert_eq!(
            plan.stages[1].condition,
            StageCondition::MinConfidence {
                capability: None,
                value: 80.0
            }
        );
        let registry = CapabilityRegistry::from_descriptors(default_catalog());
        assert!(plan.validate(&registry).is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown() {
        let registry = CapabilityRegistry::from_descriptors(default_catalog());
        let plan = ExecutionPlan::from_phases(vec![vec!["ghost".to_string()]]);
        assert!(matches!(
            plan.validate(&registry),
            Err(PlanError::UnknownCapability { .. })
        ));
        assert_eq!(
            ExecutionPlan::from_phases(vec![]).validate(&registry),
            Err(PlanError::Empty)
        );
    }
}
