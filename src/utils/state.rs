//! 连接状态管理
//!
//! 客户端持有的连接遵循三态状态机：
//!
//! ```text
//! Unconnected --拨号成功--> Connected --显式关闭 / 强制关闭--> Closed
//! ```
//!
//! 状态只在拨号、关闭和强制关闭时转换。Closed 对所有操作而言是终态，
//! 只有显式重新拨号才能回到 Connected。

use std::fmt;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// 尚未拨号
    Unconnected,
    /// 已建立连接
    Connected,
    /// 已关闭（显式关闭或被强制关闭）
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Unconnected => "unconnected",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// 被拒绝的状态转换
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
    pub reason: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}: {}", self.from, self.to, self.reason)
    }
}

/// 连接槽位
///
/// 以显式的所有权字段承载唯一的活动连接，替代 "可能已连接" 的可空句柄。
#[derive(Debug)]
enum Slot<T> {
    Unconnected,
    Connected(T),
    Closed,
}

/// 连接状态管理器
///
/// 每个客户端实例至多持有一个活动连接。
#[derive(Debug)]
pub struct ConnectionSlot<T> {
    slot: Slot<T>,
    /// 连接标识（用于日志）
    label: String,
}

impl<T> ConnectionSlot<T> {
    /// 创建未连接的槽位
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            slot: Slot::Unconnected,
            label: label.into(),
        }
    }

    /// 获取当前状态
    pub fn status(&self) -> ConnectionStatus {
        match self.slot {
            Slot::Unconnected => ConnectionStatus::Unconnected,
            Slot::Connected(_) => ConnectionStatus::Connected,
            Slot::Closed => ConnectionStatus::Closed,
        }
    }

    /// 当前连接（仅 Connected 状态下存在）
    pub fn get(&self) -> Option<&T> {
        match &self.slot {
            Slot::Connected(conn) => Some(conn),
            _ => None,
        }
    }

    /// 装入新建立的连接
    ///
    /// 已有活动连接时拒绝转换，新连接原样交还调用方处理。
    pub fn install(&mut self, conn: T) -> Result<(), (T, InvalidTransition)> {
        let from = self.status();
        if !Self::is_valid_transition(from, ConnectionStatus::Connected) {
            let rejected = InvalidTransition {
                from,
                to: ConnectionStatus::Connected,
                reason: Self::get_invalid_transition_reason(from, ConnectionStatus::Connected),
            };
            tracing::warn!("连接 {} 无效状态转换: {}", self.label, rejected);
            return Err((conn, rejected));
        }

        self.slot = Slot::Connected(conn);
        tracing::debug!("连接 {} 状态转换: {} -> connected", self.label, from);
        Ok(())
    }

    /// 转换到 Closed，交出仍持有的连接以便调用方关闭
    ///
    /// 任何状态都可以转换到 Closed，重复调用是幂等的。
    pub fn close(&mut self) -> Option<T> {
        let from = self.status();
        let previous = std::mem::replace(&mut self.slot, Slot::Closed);
        if from != ConnectionStatus::Closed {
            tracing::debug!("连接 {} 状态转换: {} -> closed", self.label, from);
        }
        match previous {
            Slot::Connected(conn) => Some(conn),
            _ => None,
        }
    }

    /// 检查状态转换是否有效
    ///
    /// 状态转换规则：
    /// - Unconnected -> Connected, Closed
    /// - Connected -> Closed
    /// - Closed -> Connected（仅限显式重新拨号）
    pub fn is_valid_transition(from: ConnectionStatus, to: ConnectionStatus) -> bool {
        match (from, to) {
            (ConnectionStatus::Unconnected, ConnectionStatus::Connected) => true,
            (ConnectionStatus::Closed, ConnectionStatus::Connected) => true,
            (_, ConnectionStatus::Closed) => true,
            _ => false,
        }
    }

    /// 获取无效转换的原因
    fn get_invalid_transition_reason(from: ConnectionStatus, to: ConnectionStatus) -> String {
        match (from, to) {
            (ConnectionStatus::Connected, ConnectionStatus::Connected) => {
                "已存在活动连接，需先关闭".to_string()
            }
            _ => format!("不允许从 {} 转换到 {}", from, to),
        }
    }

    /// 检查是否处于终态
    pub fn is_closed(&self) -> bool {
        matches!(self.slot, Slot::Closed)
    }
}
