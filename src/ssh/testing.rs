//! 进程内 SSH 测试服务器
//!
//! russh 服务端加 russh-sftp 服务端：exec 和 shell 交给本机 `sh` 执行，
//! SFTP 文件保存在内存中。SFTP 读写可以配置为永远不应答，用来验证
//! 取消桥接在协议客户端挂起时仍能及时返回。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::{KeyPair, PublicKey};
use russh_sftp::protocol::{Data, FileAttributes, Handle, OpenFlags, Status, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use super::config::DialConfig;

/// 测试服务器接受的密码
pub(crate) const PASSWORD: &str = "secret";

/// 服务端行为
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Behavior {
    /// SFTP 写请求永不应答
    pub stall_sftp_write: bool,
    /// SFTP 读请求永不应答
    pub stall_sftp_read: bool,
}

/// 内存中的远端文件
pub(crate) type FileStore = Arc<Mutex<HashMap<String, Vec<u8>>>>;

pub(crate) struct TestServer {
    addr: SocketAddr,
    files: FileStore,
    accept: JoinHandle<()>,
}

impl TestServer {
    pub(crate) async fn start() -> Self {
        Self::with_behavior(Behavior::default()).await
    }

    pub(crate) async fn with_behavior(behavior: Behavior) -> Self {
        let config = Arc::new(server::Config {
            keys: vec![KeyPair::generate_ed25519().expect("生成主机密钥失败")],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: None,
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let files: FileStore = Arc::default();

        let store = files.clone();
        let accept = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let handler = SessionHandler::new(behavior, store.clone());
                let config = config.clone();
                tokio::spawn(async move {
                    if let Ok(running) = server::run_stream(config, socket, handler).await {
                        let _ = running.await;
                    }
                });
            }
        });

        Self {
            addr,
            files,
            accept,
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// 使用密码认证的拨号配置
    pub(crate) fn dial_config(&self) -> DialConfig {
        DialConfig::builder()
            .host(self.addr.ip().to_string())
            .user("tester")
            .port(self.addr.port().to_string())
            .password(PASSWORD)
            .build()
            .unwrap()
    }

    /// 使用私钥认证的拨号配置
    pub(crate) fn dial_config_with_key(&self, path: &str) -> DialConfig {
        DialConfig::builder()
            .host(self.addr.ip().to_string())
            .user("tester")
            .port(self.addr.port().to_string())
            .private_key_path(path)
            .build()
            .unwrap()
    }

    pub(crate) fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub(crate) fn write_file(&self, path: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// 每个客户端连接一个处理器
struct SessionHandler {
    behavior: Behavior,
    files: FileStore,
    channels: HashMap<ChannelId, Channel<Msg>>,
    shells: HashMap<ChannelId, ChildStdin>,
}

impl SessionHandler {
    fn new(behavior: Behavior, files: FileStore) -> Self {
        Self {
            behavior,
            files,
            channels: HashMap::new(),
            shells: HashMap::new(),
        }
    }
}

#[async_trait]
impl server::Handler for SessionHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, _user: &str, password: &str) -> Result<Auth, Self::Error> {
        if password == PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        let command = String::from_utf8_lossy(data).into_owned();
        session.channel_success(channel);

        let spawned = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let handle = session.handle();
        match spawned {
            Ok(child) => {
                tokio::spawn(forward_process(handle, channel, child));
            }
            Err(_) => {
                session.exit_status_request(channel, 127);
                session.eof(channel);
                session.close(channel);
            }
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        session.channel_success(channel);

        let spawned = Command::new("sh")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        match spawned {
            Ok(mut child) => {
                if let Some(stdin) = child.stdin.take() {
                    self.shells.insert(channel, stdin);
                }
                tokio::spawn(forward_process(session.handle(), channel, child));
            }
            Err(_) => {
                session.exit_status_request(channel, 127);
                session.close(channel);
            }
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(stdin) = self.shells.get_mut(&channel) {
            let _ = stdin.write_all(data).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // 关闭 stdin，shell 读到 EOF
        self.shells.remove(&channel);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.channels.remove(&channel) {
            Some(chan) if name == "sftp" => {
                session.channel_success(channel);
                let sftp = MemorySftp {
                    behavior: self.behavior,
                    files: self.files.clone(),
                };
                russh_sftp::server::run(chan.into_stream(), sftp).await;
            }
            _ => session.channel_failure(channel),
        }
        Ok(())
    }
}

/// 等待进程结束，把输出和退出码发回客户端
async fn forward_process(handle: server::Handle, channel: ChannelId, child: Child) {
    let output = match child.wait_with_output().await {
        Ok(output) => output,
        Err(_) => return,
    };

    if !output.stdout.is_empty() {
        let _ = handle.data(channel, CryptoVec::from(output.stdout)).await;
    }
    if !output.stderr.is_empty() {
        let _ = handle
            .extended_data(channel, 1, CryptoVec::from(output.stderr))
            .await;
    }
    let code = output.status.code().unwrap_or(255) as u32;
    let _ = handle.exit_status_request(channel, code).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

/// 内存 SFTP 服务端，句柄就是文件路径
struct MemorySftp {
    behavior: Behavior,
    files: FileStore,
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

impl russh_sftp::server::Handler for MemorySftp {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let mut files = self.files.lock().unwrap();
        if pflags.contains(OpenFlags::CREATE) {
            let entry = files.entry(filename.clone()).or_default();
            if pflags.contains(OpenFlags::TRUNCATE) {
                entry.clear();
            }
        } else if !files.contains_key(&filename) {
            return Err(StatusCode::NoSuchFile);
        }
        Ok(Handle {
            id,
            handle: filename,
        })
    }

    async fn close(&mut self, id: u32, _handle: String) -> Result<Status, Self::Error> {
        Ok(ok_status(id))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        if self.behavior.stall_sftp_read {
            std::future::pending::<()>().await;
        }

        let files = self.files.lock().unwrap();
        let content = files.get(&handle).ok_or(StatusCode::NoSuchFile)?;
        let start = offset as usize;
        if start >= content.len() {
            return Err(StatusCode::Eof);
        }
        let end = content.len().min(start + len as usize);
        Ok(Data {
            id,
            data: content[start..end].to_vec(),
        })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        if self.behavior.stall_sftp_write {
            std::future::pending::<()>().await;
        }

        let mut files = self.files.lock().unwrap();
        let content = files.get_mut(&handle).ok_or(StatusCode::NoSuchFile)?;
        let start = offset as usize;
        if content.len() < start + data.len() {
            content.resize(start + data.len(), 0);
        }
        content[start..start + data.len()].copy_from_slice(&data);
        Ok(ok_status(id))
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        match self.files.lock().unwrap().remove(&filename) {
            Some(_) => Ok(ok_status(id)),
            None => Err(StatusCode::NoSuchFile),
        }
    }
}
