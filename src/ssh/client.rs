//! SSH 客户端
//!
//! 使用 russh 建立 SSH 连接，支持密码和私钥认证。
//!
//! 拨号分两步：TCP 连接（直接与上下文竞争），然后 SSH 握手和认证
//! （由取消桥接保护，上下文结束时强制关闭传输层）。私钥在握手之后、
//! 认证之前读取，主机不可达时先得到拨号错误。只尝试一次，
//! 重试由调用方以独立的截止时间循环调用 [`dial`] 实现。

use std::sync::Arc;

use russh::client::{Config, Handle, Handler};
use russh::keys::key::PublicKey;
use russh::Disconnect;
use tokio::net::TcpStream;

use crate::utils::context::WaitContext;
use crate::utils::error::RemoterError;

use super::auth::{load_private_key, AuthMethod};
use super::bridge::{self, Closable};
use super::config::DialConfig;
use super::transport::{self, Transport};

/// SSH 客户端事件处理器
pub struct SshClientHandler {
    /// 服务器地址（用于日志）
    addr: String,
}

impl SshClientHandler {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

/// 实现 russh 的 Handler trait
#[async_trait::async_trait]
impl Handler for SshClientHandler {
    type Error = RemoterError;

    /// 检查服务器公钥
    ///
    /// 不做主机密钥校验，接受服务器出示的任何公钥。
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::warn!(
            "接受 {} 的服务器密钥 {}（未验证 known_hosts）",
            self.addr,
            server_public_key.fingerprint()
        );
        Ok(true)
    }
}

/// 已建立的连接
///
/// 同时持有协议句柄和原始传输句柄，后者用于强制关闭。
pub struct Connection {
    handle: Handle<SshClientHandler>,
    transport: Arc<Transport>,
    addr: String,
}

impl Connection {
    /// 获取 SSH 会话句柄
    pub fn handle(&self) -> &Handle<SshClientHandler> {
        &self.handle
    }

    /// 获取传输句柄（交给取消桥接）
    pub fn transport(&self) -> Arc<Transport> {
        self.transport.clone()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// 传输层是否已关闭（显式关闭或被强制关闭）
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// 断开连接
    ///
    /// 先发送 SSH 断开消息，再关闭传输层。传输层已关闭时直接返回。
    pub async fn close(&self) -> Result<(), RemoterError> {
        if self.transport.is_closed() {
            return Ok(());
        }

        tracing::info!("断开 SSH 连接: {}", self.addr);
        let result = self
            .handle
            .disconnect(Disconnect::ByApplication, "Client disconnecting", "en")
            .await;

        if let Err(e) = self.transport.close() {
            tracing::debug!("关闭传输层失败: {}", e);
        }

        result.map_err(|e| RemoterError::dial_failed(&self.addr, &format!("断开连接失败: {}", e)))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.transport.is_closed() {
            tracing::warn!("SSH 连接被丢弃但未断开: {}", self.addr);
            let _ = self.transport.close();
        }
    }
}

/// 连接到远程服务器
pub async fn dial(config: &DialConfig, ctx: &WaitContext) -> Result<Connection, RemoterError> {
    let addr = config.addr();
    tracing::info!("连接到 SSH 服务器: {}@{}", config.user(), addr);

    let tcp = transport::connect_tcp(ctx, &addr).await?;
    let (tcp, transport) = Transport::split(tcp)
        .map_err(|e| RemoterError::dial_failed(&addr, &format!("无法复制套接字句柄: {}", e)))?;
    let transport = Arc::new(transport);

    let guard = bridge::protect(ctx, transport.clone());
    let result = guard.run(handshake(config, &addr, tcp)).await;
    let fired = guard.release().await;

    match result {
        Some(Ok(handle)) if !fired => {
            tracing::info!("SSH 连接成功: {}@{}", config.user(), addr);
            Ok(Connection {
                handle,
                transport,
                addr,
            })
        }
        Some(Err(e)) if !fired => {
            let _ = transport.close();
            Err(e)
        }
        _ => {
            // 握手恰好在强制关闭时完成也按中断处理，连接已不可用
            let _ = transport.close();
            Err(interrupted(&addr, ctx))
        }
    }
}

fn interrupted(addr: &str, ctx: &WaitContext) -> RemoterError {
    let reason = ctx
        .err()
        .map(|r| r.to_string())
        .unwrap_or_else(|| "上下文已结束".to_string());
    RemoterError::dial_failed(addr, &format!("SSH 握手被中断: {}", reason))
}

/// SSH 握手与认证
async fn handshake(
    config: &DialConfig,
    addr: &str,
    tcp: TcpStream,
) -> Result<Handle<SshClientHandler>, RemoterError> {
    let ssh_config = Arc::new(Config::default());
    let handler = SshClientHandler::new(addr);

    let mut handle = russh::client::connect_stream(ssh_config, tcp, handler)
        .await
        .map_err(|e| RemoterError::dial_failed(addr, &format!("SSH 握手失败: {}", e)))?;

    authenticate(&mut handle, config).await?;
    Ok(handle)
}

/// 执行认证
///
/// 私钥在这里读取；读取或解析失败是配置错误，不会被重试。
async fn authenticate(
    handle: &mut Handle<SshClientHandler>,
    config: &DialConfig,
) -> Result<(), RemoterError> {
    let accepted = match config.auth() {
        AuthMethod::Password(password) => {
            tracing::debug!("使用密码认证");
            handle
                .authenticate_password(config.user(), password)
                .await
                .map_err(|e| {
                    RemoterError::auth_failed("密码", &format!("认证请求失败: {}", e))
                })?
        }
        AuthMethod::PrivateKey { path, passphrase } => {
            let key = load_private_key(path, passphrase.as_deref()).await?;
            tracing::debug!("使用私钥认证: {}", path);
            handle
                .authenticate_publickey(config.user(), Arc::new(key))
                .await
                .map_err(|e| {
                    RemoterError::auth_failed("私钥", &format!("认证请求失败 ({}): {}", path, e))
                })?
        }
    };

    if !accepted {
        return Err(RemoterError::auth_failed(
            config.auth().name(),
            "凭据被服务器拒绝",
        ));
    }

    tracing::info!("SSH 认证成功");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use tokio::net::TcpListener;

    use crate::ssh::testing::TestServer;

    fn config_for(addr: std::net::SocketAddr) -> DialConfig {
        DialConfig::builder()
            .host(addr.ip().to_string())
            .user("root")
            .port(addr.port().to_string())
            .password("secret")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_dial_silent_peer_respects_deadline() {
        // 对端接受 TCP 连接但从不发送 SSH 标识，握手会一直阻塞
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let ctx = WaitContext::with_timeout(Duration::from_millis(300));
        let started = Instant::now();
        let result = dial(&config_for(addr), &ctx).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(RemoterError::Dial(_))));
        assert!(elapsed >= Duration::from_millis(250), "过早返回: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(5), "未及时返回: {:?}", elapsed);
        server.abort();
    }

    #[tokio::test]
    async fn test_dial_canceled_context_fails_fast() {
        let ctx = WaitContext::new();
        ctx.cancel();
        let addr: std::net::SocketAddr = "127.0.0.1:9".parse().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), dial(&config_for(addr), &ctx))
            .await
            .expect("已取消的上下文应立即返回");
        assert!(matches!(result, Err(RemoterError::Dial(_))));
    }

    #[tokio::test]
    async fn test_dial_refused_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let ctx = WaitContext::with_timeout(Duration::from_secs(5));
        let err = dial(&config_for(addr), &ctx).await.err().unwrap();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_dial_garbage_peer_is_dial_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            let _ = socket.shutdown().await;
        });

        let ctx = WaitContext::with_timeout(Duration::from_secs(5));
        let result = dial(&config_for(addr), &ctx).await;
        assert!(matches!(result, Err(RemoterError::Dial(_))));
        let _ = server.await;
    }

    #[tokio::test]
    async fn test_dial_key_against_silent_peer_is_dial_error() {
        // 私钥不存在，但对端从不完成握手：先到截止时间，返回拨号错误
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let config = DialConfig::builder()
            .host(addr.ip().to_string())
            .user("root")
            .port(addr.port().to_string())
            .private_key_path("/k")
            .build()
            .unwrap();
        let ctx = WaitContext::with_timeout(Duration::from_millis(300));
        let started = Instant::now();
        let result = dial(&config, &ctx).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(RemoterError::Dial(_))));
        assert!(elapsed >= Duration::from_millis(250), "过早返回: {:?}", elapsed);
        server.abort();
    }

    #[tokio::test]
    async fn test_dial_password() {
        let server = TestServer::start().await;
        let ctx = WaitContext::with_timeout(Duration::from_secs(10));
        let conn = dial(&server.dial_config(), &ctx).await.unwrap();
        assert!(!conn.is_closed());
        assert_eq!(conn.addr(), server.addr().to_string());

        conn.close().await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_dial_wrong_password_is_auth_error() {
        let server = TestServer::start().await;
        let config = DialConfig::builder()
            .host(server.addr().ip().to_string())
            .user("tester")
            .port(server.addr().port().to_string())
            .password("wrong")
            .build()
            .unwrap();

        let ctx = WaitContext::with_timeout(Duration::from_secs(10));
        let err = dial(&config, &ctx).await.unwrap_err();
        assert!(matches!(err, RemoterError::Dial(_)));
        assert!(err.to_string().contains("认证失败"));
        assert!(!err.is_config_error());
    }

    #[tokio::test]
    async fn test_dial_missing_key_is_config_error_after_handshake() {
        let server = TestServer::start().await;
        let ctx = WaitContext::with_timeout(Duration::from_secs(10));
        let err = dial(&server.dial_config_with_key("/nonexistent/key"), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("文件不存在"));
    }

    #[tokio::test]
    async fn test_dial_private_key() {
        use std::io::Write;

        let key = russh_keys::key::KeyPair::generate_ed25519().unwrap();
        let mut pem = Vec::new();
        russh_keys::encode_pkcs8_pem(&key, &mut pem).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&pem).unwrap();

        let server = TestServer::start().await;
        let ctx = WaitContext::with_timeout(Duration::from_secs(10));
        let config = server.dial_config_with_key(file.path().to_str().unwrap());
        let conn = dial(&config, &ctx).await.unwrap();
        conn.close().await.unwrap();
    }
}
