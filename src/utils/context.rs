//! 等待上下文
//!
//! 每个远程操作都接收一个 `WaitContext`：取消令牌加可选截止时间。
//! 子上下文继承父上下文的取消，并取两者中更早的截止时间。

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 上下文结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    /// 被主动取消
    Canceled,
    /// 截止时间已过
    DeadlineExceeded,
}

impl fmt::Display for DoneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoneReason::Canceled => write!(f, "上下文已取消"),
            DoneReason::DeadlineExceeded => write!(f, "已超过截止时间"),
        }
    }
}

/// 等待上下文
#[derive(Debug, Clone)]
pub struct WaitContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl WaitContext {
    /// 创建没有截止时间的根上下文
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// 创建带超时的根上下文
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// 派生子上下文，截止时间不变
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// 派生带超时的子上下文
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        self.child_with_deadline(Instant::now() + timeout)
    }

    /// 派生带截止时间的子上下文，父上下文的截止时间更早时沿用父上下文
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// 取消该上下文及其所有子上下文
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 上下文已结束的原因；未结束时返回 None
    pub fn err(&self) -> Option<DoneReason> {
        if self.token.is_cancelled() {
            return Some(DoneReason::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(DoneReason::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// 等待上下文结束（取消或超时）
    pub async fn done(&self) -> DoneReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => DoneReason::Canceled,
                    _ = tokio::time::sleep_until(deadline) => DoneReason::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                DoneReason::Canceled
            }
        }
    }
}

impl Default for WaitContext {
    fn default() -> Self {
        Self::new()
    }
}
