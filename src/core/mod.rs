//! 核心层：错误类型、协同上下文、会话流程与优雅关闭

pub mod context;
pub mod error;
pub mod session;
pub mod shutdown;

pub use context::{CouncilBuilder, CouncilContext};
pub use error::CouncilError;
pub use session::{Anomaly, RoleDecision, Session, SessionOutcome};
pub use shutdown::{
    run_until_shutdown, BackgroundTasksCleanup, MemorySnapshotCleanup, ShutdownCleanup,
    ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
