//! 优雅关闭
//!
//! 统一监听关闭信号（Ctrl+C / SIGTERM），取消全部会话与后台任务，
//! 再依次执行清理任务（每个任务有超时）：
//! - 停止熔断器清扫与元认知循环
//! - 保存情景/语义记忆快照

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::CouncilContext;
use crate::memory::{ContextualMemory, MemoryPersistence};

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C 或宿主主动退出
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

/// 关闭信号管理器：token 供会话与后台任务派生子 token
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            token: CancellationToken::new(),
            reason_tx,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.token.is_cancelled() {
            return;
        }
        tracing::info!(reason = ?reason, "Shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装系统信号处理器（Ctrl+C, SIGTERM）
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务，单个任务失败或超时不影响后续任务
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 执行全部清理任务，返回成功完成的数量
    pub async fn run_cleanup(&self) -> usize {
        tracing::info!(tasks = self.cleanup_tasks.len(), "Running cleanup tasks");
        let mut completed = 0;
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    completed += 1;
                    tracing::info!(task = name, "Cleanup task completed");
                }
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "Cleanup task failed"),
                Err(_) => tracing::warn!(task = name, timeout_ms = self.timeout.as_millis() as u64, "Cleanup task timed out"),
            }
        }
        completed
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 停止上下文持有的后台任务（熔断器清扫、元认知循环）
pub struct BackgroundTasksCleanup {
    context: Arc<CouncilContext>,
}

impl BackgroundTasksCleanup {
    pub fn new(context: Arc<CouncilContext>) -> Self {
        Self { context }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for BackgroundTasksCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.context.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "BackgroundTasks"
    }
}

/// 保存情景 + 语义记忆快照
pub struct MemorySnapshotCleanup {
    memory: Arc<ContextualMemory>,
    persistence: MemoryPersistence,
}

impl MemorySnapshotCleanup {
    pub fn new(memory: Arc<ContextualMemory>, persistence: MemoryPersistence) -> Self {
        Self {
            memory,
            persistence,
        }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for MemorySnapshotCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let snapshot = self.memory.snapshot();
        let persistence = self.persistence.clone();
        tokio::task::spawn_blocking(move || persistence.save(&snapshot)).await??;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MemorySnapshot"
    }
}

/// 运行 app 直到其结束或收到关闭信号；返回 app 的输出（被关闭打断时为 None）
pub async fn run_until_shutdown<F, T>(manager: Arc<ShutdownManager>, app: F) -> Option<T>
where
    F: Future<Output = T>,
{
    manager.install_signal_handlers();
    tokio::select! {
        out = app => Some(out),
        _ = manager.wait_for_shutdown() => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn test_shutdown_cancels_token_once() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        let mut rx = manager.subscribe();
        manager.shutdown(ShutdownReason::UserInitiated);
        manager.shutdown(ShutdownReason::Signal);
        assert!(token.is_cancelled());
        assert_eq!(rx.try_recv().unwrap(), ShutdownReason::UserInitiated);
        assert!(rx.try_recv().is_err());
    }

    struct Flag(Arc<AtomicBool>);

    #[async_trait::async_trait]
    impl ShutdownCleanup for Flag {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Flag"
        }
    }

    struct Hang;

    #[async_trait::async_trait]
    impl ShutdownCleanup for Hang {
        async fn cleanup(&self) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Hang"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_task_does_not_block_others() {
        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()))
            .with_timeout(Duration::from_millis(100));
        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(Hang);
        coordinator.register(Flag(called.clone()));
        assert_eq!(coordinator.run_cleanup().await, 1);
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_memory_snapshot_cleanup_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        let cleanup = MemorySnapshotCleanup::new(
            Arc::new(ContextualMemory::default()),
            MemoryPersistence::new(&path),
        );
        cleanup.cleanup().await.unwrap();
        assert!(MemoryPersistence::new(&path).load().unwrap().is_some());
    }
}
