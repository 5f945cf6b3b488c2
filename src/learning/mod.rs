//! 学习层：奖励与动态优先级（学习适配器）、周期性自我校准（元认知循环）

pub mod adapter;
pub mod metacognition;

pub use adapter::{compute_reward, detect_trend, Calibration, LearningAdapter, LearningUpdate};
pub use metacognition::{MetacognitiveReport, Metacognition, SystemSnapshot};
