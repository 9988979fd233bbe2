//! 优雅关闭
//!
//! Ctrl+C / SIGTERM / 监听失败都归结为同一个关闭令牌：HTTP 与 WebSocket 监听随令牌退出，
//! 随后编排器停止接收新任务，执行中的任务在宽限期内结束，最后关闭通知中枢。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::Orchestrator;

/// 编排器自身等待之外，再留给中枢关闭的余量
const DRAIN_MARGIN: Duration = Duration::from_secs(5);

/// 触发关闭的原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 监听失败等致命错误
    ServerFailed(String),
}

/// 进程级关闭信号；只记录第一次触发的原因
#[derive(Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// 传给各监听循环
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self, reason: ShutdownReason) {
        let mut slot = match self.reason.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_none() {
            tracing::info!(?reason, "shutdown requested");
            *slot = Some(reason);
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        match self.reason.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 把 Ctrl+C 与（unix 下的）SIGTERM 接到关闭令牌上
    pub fn listen_os_signals(self: &Arc<Self>) {
        let signal = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal.trigger(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let signal = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal as unix_signal, SignalKind};
                if let Ok(mut sigterm) = unix_signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    signal.trigger(ShutdownReason::Terminate);
                }
            });
        }
    }
}

/// 运行监听直到关闭信号，然后排空编排器
///
/// servers 自行结束（例如监听失败）也视为关闭。
pub async fn serve_until_shutdown<F>(
    signal: Arc<ShutdownSignal>,
    servers: F,
    orchestrator: &Orchestrator,
    grace: Duration,
) where
    F: Future<Output = ()>,
{
    signal.listen_os_signals();
    let token = signal.token();
    tokio::pin!(servers);

    let exited_first = tokio::select! {
        _ = &mut servers => true,
        _ = token.cancelled() => false,
    };
    if exited_first {
        tracing::info!("listeners stopped on their own");
        signal.trigger(ShutdownReason::ServerFailed("listeners exited".into()));
    } else {
        // 监听随令牌退出，等它们把在途请求送完
        servers.await;
    }

    drain(orchestrator, grace).await;
    tracing::info!(reason = ?signal.reason(), "shutdown complete");
}

/// 停止编排器；超出宽限期与余量仍未结束时放弃等待
pub async fn drain(orchestrator: &Orchestrator, grace: Duration) {
    if tokio::time::timeout(grace + DRAIN_MARGIN, orchestrator.shutdown(grace))
        .await
        .is_err()
    {
        tracing::warn!(grace_secs = grace.as_secs(), "orchestrator did not stop in time");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::OrchestratorBuilder;

    fn orchestrator() -> Arc<Orchestrator> {
        let mut config = AppConfig::default();
        config.fda.offline = true;
        OrchestratorBuilder::new(config).build().unwrap()
    }

    #[test]
    fn test_first_reason_wins() {
        let signal = ShutdownSignal::new();
        let token = signal.token();
        assert!(signal.reason().is_none());

        signal.trigger(ShutdownReason::Terminate);
        signal.trigger(ShutdownReason::Interrupt);
        assert!(token.is_cancelled());
        assert_eq!(signal.reason(), Some(ShutdownReason::Terminate));
    }

    #[tokio::test]
    async fn test_drain_stops_hub() {
        let orchestrator = orchestrator();
        drain(&orchestrator, Duration::from_millis(50)).await;
        assert!(orchestrator.hub().is_shutdown());
    }

    #[tokio::test]
    async fn test_listener_exit_triggers_shutdown() {
        let orchestrator = orchestrator();
        let signal = Arc::new(ShutdownSignal::new());
        serve_until_shutdown(
            signal.clone(),
            async {},
            &orchestrator,
            Duration::from_millis(50),
        )
        .await;

        assert!(signal.token().is_cancelled());
        assert!(matches!(signal.reason(), Some(ShutdownReason::ServerFailed(_))));
        assert!(orchestrator.hub().is_shutdown());
    }

    #[tokio::test]
    async fn test_triggered_signal_waits_for_listeners() {
        let orchestrator = orchestrator();
        let signal = Arc::new(ShutdownSignal::new());
        let token = signal.token();
        let stopped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = stopped.clone();
        let servers = async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        };

        signal.trigger(ShutdownReason::Interrupt);
        serve_until_shutdown(signal.clone(), servers, &orchestrator, Duration::from_millis(50)).await;

        assert!(stopped.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(signal.reason(), Some(ShutdownReason::Interrupt));
    }
}
