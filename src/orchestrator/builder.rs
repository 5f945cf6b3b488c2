//! 计划构建器
//!
//! 提供流畅的 API 来构建执行计划；修饰方法作用于最近添加的阶段。

use crate::orchestrator::plan::*;

pub struct PlanBuilder {
    name: String,
    stages: Vec<Stage>,
    background: Vec<String>,
}

impl PlanBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            background: Vec::new(),
        }
    }

    /// 添加并行的必需阶段
    pub fn stage<I, S>(mut self, name: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stages.push(Stage::parallel(
            name,
            capabilities.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// 最近的阶段改为顺序执行
    pub fn sequential(mut self) -> Self {
        if let Some(stage) = self.stages.last_mut() {
            stage.mode = StageMode::Sequential;
        }
        self
    }

    /// 最近的阶段改为可选
    pub fn optional(mut self) -> Self {
        if let Some(stage) = self.stages.last_mut() {
            stage.required = false;
        }
        self
    }

    /// 设置最近阶段的进入条件
    pub fn when(mut self, condition: StageCondition) -> Self {
        if let Some(stage) = self.stages.last_mut() {
            stage.condition = condition;
        }
        self
    }

    /// 决策返回后后台执行的能力
    pub fn background<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.background
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Result<ExecutionPlan, PlanError> {
        if self.stages.is_empty() {
            return Err(PlanError::Empty);
        }
        if let Some(empty) = self.stages.iter().find(|s| s.capabilities.is_empty()) {
            return Err(PlanError::EmptyStage(empty.name.clone()));
        }
        Ok(ExecutionPlan {
            name: self.name,
            stages: self.stages,
            background: self.background,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_modifiers_apply_to_last_stage() {
        let plan = PlanBuilder::new("custom")
            .stage("first", ["triage"])
            .stage("second", ["treatment_planning", "drug_safety"])
            .sequential()
            .optional()
            .when(StageCondition::AnySucceeded)
            .background(["follow_up"])
            .build()
            .unwrap();
        assert_eq!(plan.stages[0].mode, StageMode::Parallel);
        assert!(plan.stages[0].required);
        assert_eq!(plan.stages[1].mode, StageMode::Sequential);
        assert!(!plan.stages[1].required);
        assert_eq!(plan.stages[1].condition, StageCondition::AnySucceeded);
        assert_eq!(plan.background, vec!["follow_up"]);
    }

    #[test]
    fn test_builder_rejects_empty() {
        assert_eq!(PlanBuilder::new("x").build(), Err(PlanError::Empty));
        let empty: [&str; 0] = [];
        assert_eq!(
            PlanBuilder::new("x").stage("s", empty).build(),
            Err(PlanError::EmptyStage("s".to_string()))
        );
    }
}
