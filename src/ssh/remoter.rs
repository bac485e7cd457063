//! 远程执行客户端
//!
//! `Remoter` 持有拨号配置和唯一的连接槽位，所有操作都经过连接状态机：
//! 新建的客户端在第一次使用前惰性拨号；关闭（显式或被取消桥接强制关闭）
//! 之后的操作立即返回未连接错误，不会在操作中途隐式重连。
//!
//! 方法都接收 `&mut self`，同一连接上同一时刻只有一个操作在进行，
//! 不会有两个取消桥接同时作用于同一个传输层。

use std::path::Path;

use tokio::io::AsyncWrite;

use crate::utils::context::WaitContext;
use crate::utils::error::RemoterError;
use crate::utils::state::{ConnectionSlot, ConnectionStatus};

use super::client::{self, Connection};
use super::config::DialConfig;
use super::session::{self, CommandOutput};
use super::transfer;

/// 远程执行客户端
pub struct Remoter {
    config: DialConfig,
    conn: ConnectionSlot<Connection>,
}

impl Remoter {
    /// 创建未连接的客户端，第一次使用时拨号
    pub fn new(config: DialConfig) -> Self {
        let conn = ConnectionSlot::new(config.addr());
        Self { config, conn }
    }

    /// 创建客户端并立即拨号
    pub async fn dial(config: DialConfig, ctx: &WaitContext) -> Result<Self, RemoterError> {
        let mut remoter = Self::new(config);
        remoter.connect(ctx).await?;
        Ok(remoter)
    }

    /// 获取配置
    pub fn config(&self) -> &DialConfig {
        &self.config
    }

    /// 当前连接状态
    pub fn status(&self) -> ConnectionStatus {
        self.conn.status()
    }

    /// 检查是否已连接
    pub fn is_connected(&self) -> bool {
        self.conn.status() == ConnectionStatus::Connected
    }

    /// 显式拨号
    ///
    /// 使用保存的配置；从 Closed 状态调用即为显式重新拨号。
    /// 已连接时直接返回。
    pub async fn connect(&mut self, ctx: &WaitContext) -> Result<(), RemoterError> {
        if self.is_connected() {
            return Ok(());
        }

        let conn = client::dial(&self.config, ctx).await?;
        if let Err((conn, rejected)) = self.conn.install(conn) {
            let _ = conn.close().await;
            return Err(RemoterError::dial_failed(
                &self.config.addr(),
                &rejected.to_string(),
            ));
        }
        Ok(())
    }

    /// 断开连接
    ///
    /// 未持有连接时是幂等的。之后的操作都会返回未连接错误。
    pub async fn close(&mut self) -> Result<(), RemoterError> {
        match self.conn.close() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }

    /// 操作前确认连接可用
    ///
    /// 只有从未连接过的客户端会在这里惰性拨号。
    async fn ensure_connected(&mut self, ctx: &WaitContext) -> Result<(), RemoterError> {
        match self.conn.status() {
            ConnectionStatus::Connected => Ok(()),
            ConnectionStatus::Unconnected => self.connect(ctx).await,
            ConnectionStatus::Closed => Err(RemoterError::not_connected(&self.config.addr())),
        }
    }

    fn connection(&self) -> Result<&Connection, RemoterError> {
        self.conn
            .get()
            .ok_or_else(|| RemoterError::not_connected(&self.config.addr()))
    }

    /// 操作结束后同步状态：传输层已被强制关闭时转换到 Closed
    async fn settle(&mut self) {
        let closed = self.conn.get().map(Connection::is_closed).unwrap_or(false);
        if closed {
            tracing::info!("连接 {} 的传输层已关闭，连接不再可用", self.config.addr());
            if let Some(conn) = self.conn.close() {
                let _ = conn.close().await;
            }
        }
    }

    /// 在共享 shell 中依次执行命令
    ///
    /// 命令不需要以换行结尾，也不需要包含 exit。中间命令失败时后续命令
    /// 照常执行；stdout 和 stderr 流式写入调用方提供的输出。
    pub async fn run<S, O, E>(
        &mut self,
        ctx: &WaitContext,
        commands: &[S],
        stdout: &mut O,
        stderr: &mut E,
    ) -> Result<(), RemoterError>
    where
        S: AsRef<str>,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        self.ensure_connected(ctx).await?;
        let result = session::run(self.connection()?, ctx, commands, stdout, stderr).await;
        self.settle().await;
        result
    }

    /// 执行单条命令，捕获合并后的输出
    ///
    /// 退出码非零、被信号终止或被取消时返回执行错误，已经收到的输出
    /// 通过 [`RemoterError::command_output`] 取回。
    pub async fn output(
        &mut self,
        ctx: &WaitContext,
        command: impl Into<String>,
    ) -> Result<CommandOutput, RemoterError> {
        let command = command.into();
        self.ensure_connected(ctx).await?;
        let result = session::output(self.connection()?, ctx, command).await;
        self.settle().await;
        result
    }

    /// 上传本地文件到远端，远端同名文件先被删除
    pub async fn put(
        &mut self,
        ctx: &WaitContext,
        local: impl AsRef<Path>,
        remote: &str,
    ) -> Result<u64, RemoterError> {
        self.ensure_connected(ctx).await?;
        let result = transfer::put(self.connection()?, ctx, local.as_ref(), remote).await;
        self.settle().await;
        result
    }

    /// 下载远端文件到本地，本地同名文件先被删除
    pub async fn get(
        &mut self,
        ctx: &WaitContext,
        remote: &str,
        local: impl AsRef<Path>,
    ) -> Result<u64, RemoterError> {
        self.ensure_connected(ctx).await?;
        let result = transfer::get(self.connection()?, ctx, remote, local.as_ref()).await;
        self.settle().await;
        result
    }
}
