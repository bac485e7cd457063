//! 文件传输
//!
//! 在连接上打开 SFTP 子客户端，单文件上传和下载。
//!
//! 目标文件会先被尽力删除，然后从头写入；不做临时文件加重命名，
//! 取消或失败可能在原路径留下不完整的文件。
//!
//! SFTP 客户端等待写确认时没有超时，传输层被强制关闭后也可能不返回，
//! 因此取消桥接触发后直接丢弃进行中的传输 future。

use std::path::Path;

use russh_sftp::client::SftpSession;
use tokio::io::{self, AsyncWriteExt};

use crate::utils::context::WaitContext;
use crate::utils::error::RemoterError;

use super::bridge;
use super::client::Connection;

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Put,
    Get,
}

impl Direction {
    fn verb(self) -> &'static str {
        match self {
            Direction::Put => "上传",
            Direction::Get => "下载",
        }
    }
}

/// 打开 SFTP 子客户端
async fn open_sftp(conn: &Connection) -> Result<SftpSession, String> {
    let channel = conn
        .handle()
        .channel_open_session()
        .await
        .map_err(|e| format!("打开通道失败: {}", e))?;

    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| format!("请求 SFTP 子系统失败: {}", e))?;

    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| format!("初始化 SFTP 会话失败: {}", e))
}

/// 上传本地文件，远端已存在的同名文件会被覆盖
///
/// 返回复制的字节数。
pub async fn put(
    conn: &Connection,
    ctx: &WaitContext,
    local: &Path,
    remote: &str,
) -> Result<u64, RemoterError> {
    tracing::debug!("上传 {} -> {}:{}", local.display(), conn.addr(), remote);

    let guard = bridge::protect(ctx, conn.transport());
    let result = guard.run(upload(conn, local, remote)).await;
    let fired = guard.release().await;

    finish(Direction::Put, remote, ctx, fired, result)
}

async fn upload(conn: &Connection, local: &Path, remote: &str) -> Result<u64, String> {
    let sftp = open_sftp(conn).await?;

    let result = async {
        // 目标不存在不算错误
        if let Err(e) = sftp.remove_file(remote).await {
            tracing::debug!("删除远端文件 {} 失败（忽略）: {}", remote, e);
        }

        let mut reader = tokio::fs::File::open(local)
            .await
            .map_err(|e| format!("无法打开本地文件 {}: {}", local.display(), e))?;

        let mut writer = sftp
            .create(remote)
            .await
            .map_err(|e| format!("无法创建远端文件: {}", e))?;

        let copied = io::copy(&mut reader, &mut writer).await;
        // 无论复制是否成功都关闭远端句柄
        let closed = writer.shutdown().await;

        let copied = copied.map_err(|e| format!("复制中断: {}", e))?;
        closed.map_err(|e| format!("关闭远端文件失败: {}", e))?;
        Ok(copied)
    }
    .await;

    close_sftp(sftp).await;
    result
}

/// 下载远端文件，本地已存在的同名文件会被覆盖
///
/// 返回复制的字节数。
pub async fn get(
    conn: &Connection,
    ctx: &WaitContext,
    remote: &str,
    local: &Path,
) -> Result<u64, RemoterError> {
    tracing::debug!("下载 {}:{} -> {}", conn.addr(), remote, local.display());

    let guard = bridge::protect(ctx, conn.transport());
    let result = guard.run(download(conn, remote, local)).await;
    let fired = guard.release().await;

    finish(Direction::Get, remote, ctx, fired, result)
}

async fn download(conn: &Connection, remote: &str, local: &Path) -> Result<u64, String> {
    let sftp = open_sftp(conn).await?;

    let result = async {
        if let Err(e) = tokio::fs::remove_file(local).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!("删除本地文件 {} 失败（忽略）: {}", local.display(), e);
            }
        }

        let mut reader = sftp
            .open(remote)
            .await
            .map_err(|e| format!("无法打开远端文件: {}", e))?;

        let mut writer = tokio::fs::File::create(local)
            .await
            .map_err(|e| format!("无法创建本地文件 {}: {}", local.display(), e))?;

        let copied = io::copy(&mut reader, &mut writer).await;
        let flushed = writer.flush().await;
        // 远端句柄只读，关闭失败不影响结果
        let _ = reader.shutdown().await;

        let copied = copied.map_err(|e| format!("复制中断: {}", e))?;
        flushed.map_err(|e| format!("写入本地文件失败: {}", e))?;
        Ok(copied)
    }
    .await;

    close_sftp(sftp).await;
    result
}

async fn close_sftp(sftp: SftpSession) {
    if let Err(e) = sftp.close().await {
        tracing::debug!("关闭 SFTP 会话失败: {}", e);
    }
}

fn finish(
    direction: Direction,
    remote: &str,
    ctx: &WaitContext,
    fired: bool,
    result: Option<Result<u64, String>>,
) -> Result<u64, RemoterError> {
    let result = match result {
        Some(result) if !fired => result,
        _ => Err(interrupted_reason(ctx)),
    };

    match result {
        Ok(bytes) => {
            tracing::debug!("{} {} 完成: {} bytes", direction.verb(), remote, bytes);
            Ok(bytes)
        }
        Err(reason) => Err(RemoterError::transfer_failed(direction.verb(), remote, &reason)),
    }
}

fn interrupted_reason(ctx: &WaitContext) -> String {
    let reason = ctx
        .err()
        .map(|r| r.to_string())
        .unwrap_or_else(|| "上下文已结束".to_string());
    format!("传输层已被强制关闭 ({})", reason)
}
