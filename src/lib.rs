//! Council - Rust 多能力协同决策内核
//!
//! 模块划分：
//! - **capability**: 能力目录、熔断器组、调用器、调用指标、后台补充调用
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **consensus**: 加权投票、有界辩论与默认裁决
//! - **core**: 协同上下文、会话流程、错误类型与优雅关闭
//! - **learning**: 奖励计算、动态优先级与元认知校准
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）、推理服务契约
//! - **memory**: 短期 / 工作 / 情景 / 语义记忆与快照持久化
//! - **observability**: 日志初始化与结构化协调事件
//! - **orchestrator**: 执行计划、计划构建器与按阶段编排

pub mod capability;
pub mod config;
pub mod consensus;
pub mod core;
pub mod learning;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod orchestrator;

pub use crate::core::{CouncilBuilder, CouncilContext, CouncilError, Session, SessionOutcome};
