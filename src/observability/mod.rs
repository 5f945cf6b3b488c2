//! 可观测性：日志初始化与结构化事件
//!
//! 日志走 tracing；协调过程中的关键节点（调用、熔断、共识、辩论、优先级、异常）另以 CouncilEvent 广播给宿主。

pub mod events;

pub use events::{CouncilEvent, EventSink};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认 info，可通过 RUST_LOG 覆盖；重复初始化时静默忽略
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
