//! SSH 连接模块
//!
//! 负责 SSH 连接的建立、命令执行和文件传输，以及把外部取消信号
//! 桥接到协议调用上的强制关闭机制。

pub mod auth;
pub mod bridge;
pub mod client;
pub mod config;
pub mod prefix;
pub mod remoter;
pub mod session;
#[cfg(test)]
pub(crate) mod testing;
pub mod transfer;
pub mod transport;

pub use client::Connection;
pub use config::{DialConfig, HostConfig};
pub use prefix::{with_prefix, PathPrefix};
pub use remoter::Remoter;
pub use session::CommandOutput;
