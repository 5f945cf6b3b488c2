//! 记忆层：短期（输入/决策缓冲）、工作（活跃假设）、情景（事件/结果）、语义（稳定模式）、持久化

pub mod contextual;
pub mod episodic;
pub mod persistence;
pub mod semantic;
pub mod short_term;
pub mod working;

pub use contextual::{ContextBundle, ContextualMemory, Finding};
pub use episodic::{Episode, EpisodicMemory, Outcome};
pub use persistence::{MemoryPersistence, MemorySnapshot};
pub use semantic::{Insight, PatternKey, SemanticMemory};
pub use short_term::{ContextClassifier, ContextLabel, KeywordClassifier, ShortTermMemory};
pub use working::{Hypothesis, WorkingMemory};
