//! 错误类型定义
//!
//! 定义远程执行客户端的错误类型，提供描述性错误消息。
//!
//! ## 功能
//! - 定义 RemoterError 枚举，按阶段划分：配置、连接、会话、执行、传输
//! - 实现 russh 错误转换（From trait），供协议处理器使用
//! - 提供错误分类和辅助构造方法
//!
//! 取消不是独立的错误类型：取消通过强制关闭传输层生效，表现为
//! 执行或传输错误。调用方需要检查传入的 `WaitContext` 才能区分
//! "网络故障" 与 "主动取消"。

use thiserror::Error;

use crate::ssh::session::CommandOutput;

/// 远程执行错误类型
#[derive(Debug, Error)]
pub enum RemoterError {
    /// 配置缺失或格式错误
    #[error("配置错误: {0}")]
    Config(String),

    /// TCP 连接、SSH 握手或认证失败（包括超时）
    #[error("SSH 连接失败: {0}")]
    Dial(String),

    /// 会话通道创建失败
    #[error("会话创建失败: {0}")]
    Session(String),

    /// shell 启动、写入或等待失败，或命令没有以 0 退出
    #[error("命令执行失败: {message}")]
    Execution {
        message: String,
        /// 命令已经执行时的命令行、合并输出和退出码
        output: Option<Box<CommandOutput>>,
    },

    /// 文件传输失败
    #[error("文件传输失败: {0}")]
    Transfer(String),

    /// 连接已关闭
    #[error("未连接: {0}")]
    NotConnected(String),
}

impl From<russh::Error> for RemoterError {
    fn from(err: russh::Error) -> Self {
        // 将 russh 错误转换为更友好的错误消息
        let message = match &err {
            russh::Error::Disconnect => "服务器断开连接".to_string(),
            russh::Error::NoCommonKexAlgo => "无法协商密钥交换算法".to_string(),
            russh::Error::NoCommonCipher => "无法协商加密算法".to_string(),
            russh::Error::NoCommonCompression => "无法协商压缩算法".to_string(),
            russh::Error::NoCommonMac => "无法协商 MAC 算法".to_string(),
            russh::Error::NoCommonKeyAlgo => "无法协商密钥算法".to_string(),
            _ => err.to_string(),
        };
        RemoterError::Dial(message)
    }
}

impl RemoterError {
    /// 获取错误码
    pub fn code(&self) -> i32 {
        match self {
            RemoterError::Config(_) => 1001,
            RemoterError::Dial(_) => 1002,
            RemoterError::Session(_) => 1003,
            RemoterError::Execution { .. } => 1004,
            RemoterError::Transfer(_) => 1005,
            RemoterError::NotConnected(_) => 1006,
        }
    }

    /// 获取错误类型名称
    pub fn error_type(&self) -> &'static str {
        match self {
            RemoterError::Config(_) => "config_error",
            RemoterError::Dial(_) => "dial_error",
            RemoterError::Session(_) => "session_error",
            RemoterError::Execution { .. } => "execution_error",
            RemoterError::Transfer(_) => "transfer_error",
            RemoterError::NotConnected(_) => "not_connected",
        }
    }

    /// 检查是否为可重试错误
    ///
    /// 只有连接阶段的错误值得重新拨号，其余错误重试也不会改变结果。
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RemoterError::Dial(_))
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, RemoterError::Config(_))
    }

    /// 检查是否为连接相关错误
    pub fn is_connection_error(&self) -> bool {
        matches!(self, RemoterError::Dial(_) | RemoterError::NotConnected(_))
    }

    // ============ 错误构造辅助方法 ============

    /// 创建缺少必填字段的配置错误
    pub fn missing_field(field: &str) -> Self {
        RemoterError::Config(format!("缺少必填字段 {}", field))
    }

    /// 创建字段格式错误
    pub fn invalid_field(field: &str, reason: &str) -> Self {
        RemoterError::Config(format!("字段 {} 无效: {}", field, reason))
    }

    /// 创建私钥加载失败错误
    pub fn key_load_failed(key_path: &str, reason: &str) -> Self {
        RemoterError::Config(format!("无法加载私钥 {}: {}", key_path, reason))
    }

    /// 创建 SSH 连接失败错误（包含主机信息）
    pub fn dial_failed(addr: &str, reason: &str) -> Self {
        RemoterError::Dial(format!("无法连接到 {} - {}", addr, reason))
    }

    /// 创建认证失败错误（包含认证方式）
    pub fn auth_failed(method: &str, reason: &str) -> Self {
        RemoterError::Dial(format!("{}认证失败: {}", method, reason))
    }

    /// 创建会话通道错误
    pub fn session_failed(operation: &str, reason: &str) -> Self {
        RemoterError::Session(format!("{} 失败: {}", operation, reason))
    }

    /// 创建命令执行错误
    pub fn execution_failed(command: &str, reason: &str) -> Self {
        RemoterError::Execution {
            message: format!("{:?}: {}", command, reason),
            output: None,
        }
    }

    /// 创建携带命令输出的执行错误
    pub fn command_failed(output: CommandOutput, reason: &str) -> Self {
        RemoterError::Execution {
            message: format!("{:?}: {}", output.command, reason),
            output: Some(Box::new(output)),
        }
    }

    /// 执行错误中携带的命令输出
    pub fn command_output(&self) -> Option<&CommandOutput> {
        match self {
            RemoterError::Execution {
                output: Some(output),
                ..
            } => Some(output),
            _ => None,
        }
    }

    /// 创建文件传输错误
    pub fn transfer_failed(operation: &str, path: &str, reason: &str) -> Self {
        RemoterError::Transfer(format!("{} {} 失败: {}", operation, path, reason))
    }

    /// 创建未连接错误
    pub fn not_connected(addr: &str) -> Self {
        RemoterError::NotConnected(format!("{} 的连接已关闭", addr))
    }
}
