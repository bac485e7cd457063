//! SSH 会话
//!
//! 在连接上打开短生命周期的会话通道执行命令：
//! - [`run`]：共享一个交互式 shell，按顺序写入命令序列，输出流式写入调用方
//! - [`output`]：执行单条命令，stdout 和 stderr 合并捕获
//!
//! 每次调用都由一个取消桥接保护，会话通道在返回前关闭。

use russh::client::Msg;
use russh::ChannelMsg;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::utils::context::WaitContext;
use crate::utils::error::RemoterError;

use super::bridge;
use super::client::Connection;

/// shell 退出命令，没有它 shell 不会结束，等待也不会返回
const EXIT_COMMAND: &str = "exit";

/// SSH 通道包装器
///
/// 封装 russh Channel，统一错误映射。
struct SessionChannel {
    inner: russh::Channel<Msg>,
}

impl SessionChannel {
    /// 在连接上打开会话通道
    async fn open(conn: &Connection) -> Result<Self, RemoterError> {
        let channel = conn.handle().channel_open_session().await.map_err(|e| {
            RemoterError::session_failed("打开会话通道", &e.to_string())
        })?;
        Ok(Self { inner: channel })
    }

    /// 请求 shell
    async fn request_shell(&self) -> Result<(), String> {
        self.inner
            .request_shell(true)
            .await
            .map_err(|e| format!("请求 shell 失败: {}", e))
    }

    /// 执行命令
    async fn exec(&self, command: &str) -> Result<(), String> {
        self.inner
            .exec(true, command)
            .await
            .map_err(|e| format!("执行请求失败: {}", e))
    }

    /// 发送数据
    async fn send_data(&self, data: &[u8]) -> Result<(), String> {
        self.inner
            .data(data)
            .await
            .map_err(|e| format!("写入 shell 失败: {}", e))
    }

    /// 发送 EOF
    async fn eof(&self) -> Result<(), String> {
        self.inner
            .eof()
            .await
            .map_err(|e| format!("发送 EOF 失败: {}", e))
    }

    /// 等待消息
    async fn wait(&mut self) -> Option<ChannelMsg> {
        self.inner.wait().await
    }

    /// 关闭通道，连接已断开时忽略错误
    async fn close(self) {
        if let Err(e) = self.inner.close().await {
            tracing::debug!("关闭会话通道失败: {}", e);
        }
    }
}

/// 单条命令的执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// 实际执行的命令（可能带有目录前缀）
    pub command: String,
    /// stdout 与 stderr 按到达顺序合并后的输出
    pub output: Vec<u8>,
    /// 远端进程退出码
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    /// 退出码是否为 0
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// 输出（有损 UTF-8 转换）
    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// shell 会话终止方式
#[derive(Debug, Default)]
struct Termination {
    exit_status: Option<u32>,
    exit_signal: Option<String>,
}

impl Termination {
    /// 非正常结束的原因；以 0 退出时返回 None
    fn failure(&self) -> Option<String> {
        match (&self.exit_signal, self.exit_status) {
            (Some(signal), _) => Some(format!("被信号 {} 终止", signal)),
            (None, Some(0)) => None,
            (None, Some(code)) => Some(format!("退出码 {}", code)),
            (None, None) => Some("会话在返回退出码之前关闭".to_string()),
        }
    }
}

/// 按顺序拼接写入 shell 的内容：每条命令以换行结尾，最后是 exit
pub fn shell_script<S: AsRef<str>>(commands: &[S]) -> Vec<u8> {
    let mut script = Vec::new();
    for command in commands {
        script.extend_from_slice(command.as_ref().as_bytes());
        script.push(b'\n');
    }
    script.extend_from_slice(EXIT_COMMAND.as_bytes());
    script.push(b'\n');
    script
}

/// 在共享 shell 中执行命令序列
///
/// 中间命令失败不会阻止后续命令被提交；返回值只反映 shell 会话
/// 的终止结果。打开通道、提交和等待整个过程由一个取消桥接保护。
pub async fn run<S, O, E>(
    conn: &Connection,
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
    let label = format!("shell ({} 条命令)", commands.len());
    let script = shell_script(commands);
    tracing::debug!("启动 shell: {} 条命令 @ {}", commands.len(), conn.addr());

    let guard = bridge::protect(ctx, conn.transport());
    let result = guard.run(shell(conn, &script, stdout, stderr)).await;
    let fired = guard.release().await;

    let flushed = flush_sinks(stdout, stderr).await;

    match result {
        _ if fired => Err(interrupted(&label, ctx)),
        None => Err(interrupted(&label, ctx)),
        Some(Err(e)) => Err(e),
        Some(Ok(Err(reason))) => Err(RemoterError::execution_failed(&label, &reason)),
        Some(Ok(Ok(termination))) => {
            if let Some(reason) = termination.failure() {
                return Err(RemoterError::execution_failed(
                    &label,
                    &format!("shell {}", reason),
                ));
            }
            flushed.map_err(|reason| RemoterError::execution_failed(&label, &reason))
        }
    }
}

/// 打开通道并驱动 shell；外层错误是通道打开失败，内层是执行失败
async fn shell<O, E>(
    conn: &Connection,
    script: &[u8],
    stdout: &mut O,
    stderr: &mut E,
) -> Result<Result<Termination, String>, RemoterError>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut channel = SessionChannel::open(conn).await?;
    let result = drive_shell(&mut channel, script, stdout, stderr).await;
    channel.close().await;
    Ok(result)
}

async fn drive_shell<O, E>(
    channel: &mut SessionChannel,
    script: &[u8],
    stdout: &mut O,
    stderr: &mut E,
) -> Result<Termination, String>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    channel.request_shell().await?;
    channel.send_data(script).await?;
    channel.eof().await?;

    let mut termination = Termination::default();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                stdout
                    .write_all(&data)
                    .await
                    .map_err(|e| format!("写入 stdout 失败: {}", e))?;
            }
            ChannelMsg::ExtendedData { data, ext } => {
                // ext == 1 为 stderr
                if ext == 1 {
                    stderr
                        .write_all(&data)
                        .await
                        .map_err(|e| format!("写入 stderr 失败: {}", e))?;
                } else {
                    tracing::debug!("忽略扩展数据 (ext={}): {} bytes", ext, data.len());
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                tracing::debug!("shell 退出 (code={})", exit_status);
                termination.exit_status = Some(exit_status);
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                termination.exit_signal = Some(format!("{:?}", signal_name));
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    Ok(termination)
}

async fn flush_sinks<O, E>(stdout: &mut O, stderr: &mut E) -> Result<(), String>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let out = stdout.flush().await;
    let err = stderr.flush().await;
    out.map_err(|e| format!("刷新 stdout 失败: {}", e))?;
    err.map_err(|e| format!("刷新 stderr 失败: {}", e))
}

/// 执行单条命令，stdout 与 stderr 合并为一个字节流
///
/// 成功时返回的 [`CommandOutput`] 携带原始命令字符串，调用方拼接过的命令
/// （例如带目录前缀）可以据此得知实际执行了什么。命令以非零状态退出、
/// 被信号终止、没有返回退出码或被取消时是执行错误，错误中仍带有命令和
/// 已捕获的输出，见 [`RemoterError::command_output`]。
pub async fn output(
    conn: &Connection,
    ctx: &WaitContext,
    command: String,
) -> Result<CommandOutput, RemoterError> {
    tracing::debug!("执行命令: {:?} @ {}", command, conn.addr());

    // 输出缓冲在被保护的 future 之外，强制关闭后仍能拿到已到达的部分
    let mut combined = Vec::new();
    let guard = bridge::protect(ctx, conn.transport());
    let result = guard.run(exec(conn, &command, &mut combined)).await;
    let fired = guard.release().await;

    let (exit_status, failure) = match result {
        _ if fired => (None, Some(interrupted_reason(ctx))),
        None => (None, Some(interrupted_reason(ctx))),
        Some(Err(e)) => return Err(e),
        Some(Ok(Err(reason))) => (None, Some(reason)),
        Some(Ok(Ok(termination))) => (termination.exit_status, termination.failure()),
    };

    let out = CommandOutput {
        command,
        output: combined,
        exit_status,
    };
    match failure {
        None => Ok(out),
        Some(reason) => Err(RemoterError::command_failed(out, &reason)),
    }
}

/// 打开通道并执行命令；外层错误是通道打开失败，内层是执行失败
async fn exec(
    conn: &Connection,
    command: &str,
    combined: &mut Vec<u8>,
) -> Result<Result<Termination, String>, RemoterError> {
    let mut channel = SessionChannel::open(conn).await?;
    let result = capture(&mut channel, command, combined).await;
    channel.close().await;
    Ok(result)
}

async fn capture(
    channel: &mut SessionChannel,
    command: &str,
    combined: &mut Vec<u8>,
) -> Result<Termination, String> {
    channel.exec(command).await?;

    let mut termination = Termination::default();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => combined.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, .. } => combined.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => {
                termination.exit_status = Some(exit_status);
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                termination.exit_signal = Some(format!("{:?}", signal_name));
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    Ok(termination)
}

/// 取消桥接触发后的错误：底层是被强制关闭的传输层
fn interrupted(what: &str, ctx: &WaitContext) -> RemoterError {
    RemoterError::execution_failed(what, &interrupted_reason(ctx))
}

fn interrupted_reason(ctx: &WaitContext) -> String {
    let reason = ctx
        .err()
        .map(|r| r.to_string())
        .unwrap_or_else(|| "上下文已结束".to_string());
    format!("传输层已被强制关闭 ({})", reason)
}
