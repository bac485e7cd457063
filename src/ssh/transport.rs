//! 传输层
//!
//! SSH 握手之后 TCP 流归 russh 的会话任务所有。这里在交出流之前
//! 复制一份底层套接字句柄，用于强制关闭：对套接字执行 shutdown
//! 会让会话任务读到 EOF 并退出，所有阻塞在通道上的调用随之返回。

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::TcpStream;

use crate::utils::context::WaitContext;
use crate::utils::error::RemoterError;

use super::bridge::Closable;

/// 原始传输句柄
#[derive(Debug)]
pub struct Transport {
    socket: std::net::TcpStream,
    peer: SocketAddr,
    closed: AtomicBool,
}

impl Transport {
    /// 拆分已建立的 TCP 流：返回交给协议库的流和保留下来的关闭句柄
    pub fn split(stream: TcpStream) -> io::Result<(TcpStream, Transport)> {
        let peer = stream.peer_addr()?;
        let std_stream = stream.into_std()?;
        let socket = std_stream.try_clone()?;
        let stream = TcpStream::from_std(std_stream)?;

        Ok((
            stream,
            Transport {
                socket,
                peer,
                closed: AtomicBool::new(false),
            },
        ))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// 传输层是否已被关闭
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Closable for Transport {
    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!("关闭传输层: {}", self.peer);
        match self.socket.shutdown(Shutdown::Both) {
            // 对端已断开
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// 建立 TCP 连接，连接过程受 `ctx` 约束
pub async fn connect_tcp(ctx: &WaitContext, addr: &str) -> Result<TcpStream, RemoterError> {
    if let Some(reason) = ctx.err() {
        return Err(RemoterError::dial_failed(addr, &reason.to_string()));
    }

    tokio::select! {
        result = TcpStream::connect(addr) => result.map_err(|e| {
            RemoterError::dial_failed(addr, &format!("TCP 连接失败: {}", e))
        }),
        reason = ctx.done() => Err(RemoterError::dial_failed(
            addr,
            &format!("TCP 连接中断: {}", reason),
        )),
    }
}
