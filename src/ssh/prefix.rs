//! 工作目录前缀
//!
//! 以 `cd /home` 为前缀时，`ls -al .` 实际执行的是 `cd /home && ls -al .`；
//! 相对的远端路径拼接到前缀目录下，绝对路径保持不变。

use std::path::Path;

use tokio::io::AsyncWrite;

use crate::utils::context::WaitContext;
use crate::utils::error::RemoterError;

use super::remoter::Remoter;
use super::session::CommandOutput;

/// 带工作目录前缀的客户端视图
pub struct PathPrefix<'a> {
    prefix: String,
    remoter: &'a mut Remoter,
}

/// 为客户端设置工作目录前缀
pub fn with_prefix(prefix: impl Into<String>, remoter: &mut Remoter) -> PathPrefix<'_> {
    PathPrefix {
        prefix: prefix.into(),
        remoter,
    }
}

/// `cd <prefix> && <command>`
pub fn prefix_command(prefix: &str, command: &str) -> String {
    format!("cd {} && {}", prefix, command)
}

/// 相对路径拼接到前缀目录下
pub fn prefix_remote_path(prefix: &str, remote: &str) -> String {
    if remote.starts_with('/') {
        return remote.to_string();
    }
    if prefix.ends_with('/') {
        format!("{}{}", prefix, remote)
    } else {
        format!("{}/{}", prefix, remote)
    }
}

impl PathPrefix<'_> {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// 每条命令都在前缀目录下执行
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
        let commands: Vec<String> = commands
            .iter()
            .map(|cmd| prefix_command(&self.prefix, cmd.as_ref()))
            .collect();
        self.remoter.run(ctx, &commands, stdout, stderr).await
    }

    /// 返回的 `CommandOutput::command` 是带前缀的完整命令
    pub async fn output(
        &mut self,
        ctx: &WaitContext,
        command: &str,
    ) -> Result<CommandOutput, RemoterError> {
        let command = prefix_command(&self.prefix, command);
        self.remoter.output(ctx, command).await
    }

    pub async fn put(
        &mut self,
        ctx: &WaitContext,
        local: impl AsRef<Path>,
        remote: &str,
    ) -> Result<u64, RemoterError> {
        let remote = prefix_remote_path(&self.prefix, remote);
        self.remoter.put(ctx, local, &remote).await
    }

    pub async fn get(
        &mut self,
        ctx: &WaitContext,
        remote: &str,
        local: impl AsRef<Path>,
    ) -> Result<u64, RemoterError> {
        let remote = prefix_remote_path(&self.prefix, remote);
        self.remoter.get(ctx, &remote, local).await
    }
}
