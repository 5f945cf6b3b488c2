//! 编排层：执行计划、计划构建器与按阶段驱动调用的编排器

pub mod builder;
pub mod plan;
pub mod runner;

pub use builder::PlanBuilder;
pub use plan::{
    ExecutionPlan, PlanError, PlanSupplier, Stage, StageCondition, StageMode, StaticPlan,
};
pub use runner::Orchestrator;
