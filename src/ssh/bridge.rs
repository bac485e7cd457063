//! 取消桥接
//!
//! 协议库正在进行中的调用不响应协作式取消。桥接为每次受保护的调用
//! 启动一个监视任务：等待上下文结束时强制关闭指定资源，使阻塞调用
//! 以传输错误的形式返回。
//!
//! 使用方式：
//!
//! ```ignore
//! let guard = bridge::protect(ctx, transport.clone());
//! let result = guard.run(blocking_call()).await;
//! let fired = guard.release().await;
//! ```
//!
//! 关闭资源并不总能唤醒上层调用：有些协议客户端在连接断开后仍持有
//! 没有超时的应答等待。因此监视任务触发后，[`CancellationGuard::run`]
//! 立即停止轮询并丢弃被保护的 future。
//!
//! `release` 必须在调用方返回之前完成，它会等待监视任务完全退出，
//! 保证资源被复用于下一次操作时不会再被这次的监视任务关闭。

use std::future::Future;
use std::io;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::utils::context::WaitContext;

/// 可被强制关闭的资源
pub trait Closable: Send + Sync + 'static {
    /// 关闭资源，唤醒所有阻塞在其上的调用
    fn close(&self) -> io::Result<()>;
}

/// 取消守卫
///
/// 只存在于一次受保护调用期间。
#[must_use = "守卫必须通过 release() 释放"]
pub struct CancellationGuard {
    release_tx: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<bool>>,
    /// 监视任务关闭资源之后触发
    fired: CancellationToken,
}

/// 在 `ctx` 结束时强制关闭 `resource`，直到守卫被释放
///
/// 同一资源上同一时刻只能存在一个守卫。
pub fn protect<C: Closable>(ctx: &WaitContext, resource: Arc<C>) -> CancellationGuard {
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let ctx = ctx.clone();
    let fired = CancellationToken::new();
    let fired_signal = fired.clone();

    let watcher = tokio::spawn(async move {
        tokio::select! {
            biased;

            // 释放信号优先：守卫已释放（或被丢弃）后不再关闭资源
            _ = release_rx => false,

            reason = ctx.done() => {
                tracing::warn!("{}，强制关闭传输层", reason);
                if let Err(e) = resource.close() {
                    tracing::debug!("强制关闭失败: {}", e);
                }
                fired_signal.cancel();
                true
            }
        }
    });

    CancellationGuard {
        release_tx: Some(release_tx),
        watcher: Some(watcher),
        fired,
    }
}

impl CancellationGuard {
    /// 在守卫保护下执行 `fut`
    ///
    /// 监视任务触发后不再等待 `fut`，直接丢弃它并返回 None。
    /// `fut` 恰好与触发同时完成时优先返回其结果，调用方仍应以
    /// [`release`](Self::release) 的返回值判断是否被强制关闭。
    pub async fn run<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            output = fut => Some(output),
            _ = self.fired.cancelled() => None,
        }
    }

    /// 监视任务是否已强制关闭资源
    pub fn has_fired(&self) -> bool {
        self.fired.is_cancelled()
    }

    /// 释放守卫并等待监视任务退出
    ///
    /// 返回监视任务是否已强制关闭资源。
    pub async fn release(mut self) -> bool {
        if let Some(tx) = self.release_tx.take() {
            // 监视任务已退出时发送失败，忽略
            let _ = tx.send(());
        }

        match self.watcher.take() {
            Some(watcher) => match watcher.await {
                Ok(fired) => fired,
                Err(e) => {
                    tracing::error!("取消监视任务异常退出: {}", e);
                    false
                }
            },
            None => false,
        }
    }
}

impl Drop for CancellationGuard {
    fn drop(&mut self) {
        // 未经 release 就被丢弃（panic 或 future 被取消）：丢弃发送端，
        // 监视任务会收到通道关闭并在不关闭资源的情况下退出
        if self.release_tx.take().is_some() {
            tracing::debug!("取消守卫未释放即被丢弃");
        }
    }
}
