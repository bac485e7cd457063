//! 工具模块
//!
//! 提供错误类型、等待上下文和连接状态管理。

pub mod context;
pub mod error;
pub mod state;

pub use context::{DoneReason, WaitContext};
pub use error::RemoterError;
pub use state::{ConnectionSlot, ConnectionStatus, InvalidTransition};
