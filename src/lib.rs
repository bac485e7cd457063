//! Remoter 库
//!
//! 基于 SSH 的远程执行客户端：执行 shell 命令、双向传输文件，
//! 每个操作都受调用方提供的截止时间和取消信号约束。

pub mod runner;
pub mod ssh;
pub mod utils;

pub use ssh::{CommandOutput, DialConfig, PathPrefix, Remoter};
pub use utils::{RemoterError, WaitContext};
