//! 批量执行
//!
//! 每台主机分两个阶段：
//! 1. 拨号：最多尝试 `connectRetryCount` 次，每次使用独立的 `connectTimeout`
//! 2. 作业：上传、shell 命令序列、逐条命令、下载，共享一个 `commandsTimeout`
//!
//! 所有主机并发执行，互不影响；根上下文取消时所有主机立即结束。

use std::path::Path;

use futures::future::join_all;

use crate::ssh::config::{DialConfig, HostConfig, RetryPolicy};
use crate::ssh::prefix::{prefix_command, prefix_remote_path};
use crate::ssh::remoter::Remoter;
use crate::ssh::session::CommandOutput;
use crate::utils::context::WaitContext;
use crate::utils::error::RemoterError;

use super::types::{ErrorReport, HostReport, Job, StepKind, StepReport};

/// 带重试的拨号
///
/// 返回客户端（或最后一次的错误）以及实际尝试次数。配置错误不重试。
pub async fn dial_with_retry(
    config: &DialConfig,
    policy: &RetryPolicy,
    root: &WaitContext,
) -> (Result<Remoter, RemoterError>, u32) {
    let mut last_err = RemoterError::Dial("未尝试拨号".to_string());

    for attempt in 1..=policy.attempts {
        if root.is_done() {
            return (Err(last_err), attempt - 1);
        }

        let ctx = root.child_with_timeout(policy.connect_timeout);
        match Remoter::dial(config.clone(), &ctx).await {
            Ok(remoter) => return (Ok(remoter), attempt),
            Err(e) => {
                tracing::warn!(
                    "拨号 {} 第 {}/{} 次失败: {}",
                    config.addr(),
                    attempt,
                    policy.attempts,
                    e
                );
                if !e.is_recoverable() {
                    return (Err(e), attempt);
                }
                last_err = e;
            }
        }
    }

    (Err(last_err), policy.attempts)
}

/// 执行整个作业
pub async fn run_job(job: &Job, root: &WaitContext) -> Vec<HostReport> {
    let tasks = job.hosts.iter().map(|host| run_host(job, host, root));
    join_all(tasks).await
}

/// 在单台主机上执行作业
pub async fn run_host(job: &Job, host: &HostConfig, root: &WaitContext) -> HostReport {
    let label = host.display_name();
    let mut report = HostReport {
        label: label.clone(),
        addr: String::new(),
        online: false,
        dial_attempts: 0,
        dial_error: None,
        steps: Vec::new(),
        finished_at: chrono::Utc::now(),
    };

    let prepared = host
        .dial_config()
        .and_then(|config| Ok((config, host.retry_policy()?)));
    let (config, policy) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            report.dial_error = Some(ErrorReport::new(&e, false));
            return report;
        }
    };
    report.addr = config.addr();

    let (dialed, attempts) = dial_with_retry(&config, &policy, root).await;
    report.dial_attempts = attempts;
    let mut remoter = match dialed {
        Ok(remoter) => remoter,
        Err(e) => {
            tracing::error!("主机 {} 离线: {}", label, e);
            report.dial_error = Some(ErrorReport::new(&e, root.is_done()));
            report.finished_at = chrono::Utc::now();
            return report;
        }
    };
    report.online = true;
    tracing::info!("主机 {} 在线", label);

    let ctx = root.child_with_timeout(policy.commands_timeout);
    report.steps = run_steps(job, &mut remoter, &ctx).await;

    if let Err(e) = remoter.close().await {
        tracing::debug!("关闭 {} 失败: {}", label, e);
    }
    report.finished_at = chrono::Utc::now();
    report
}

async fn run_steps(job: &Job, remoter: &mut Remoter, ctx: &WaitContext) -> Vec<StepReport> {
    let workdir = job.workdir.as_deref();
    let remote_path = |remote: &str| match workdir {
        Some(dir) => prefix_remote_path(dir, remote),
        None => remote.to_string(),
    };
    let command_line = |command: &str| match workdir {
        Some(dir) => prefix_command(dir, command),
        None => command.to_string(),
    };

    let mut steps = Vec::new();

    for upload in &job.uploads {
        let remote = remote_path(&upload.remote);
        let result = remoter.put(ctx, Path::new(&upload.local), &remote).await;
        steps.push(transfer_step(
            StepKind::Put,
            format!("{} -> {}", upload.local, remote),
            result,
            ctx,
        ));
    }

    if !job.script.is_empty() {
        let commands: Vec<String> = job.script.iter().map(|c| command_line(c)).collect();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let result = remoter.run(ctx, &commands, &mut stdout, &mut stderr).await;

        let mut output = String::from_utf8_lossy(&stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&stderr));
        steps.push(StepReport {
            kind: StepKind::Run,
            target: commands.join("; "),
            ok: result.is_ok(),
            output: Some(output),
            exit_status: None,
            bytes: None,
            error: result.err().map(|e| ErrorReport::new(&e, ctx.is_done())),
        });
    }

    for command in &job.commands {
        let step = match remoter.output(ctx, command_line(command)).await {
            Ok(out) => StepReport {
                kind: StepKind::Output,
                ok: out.success(),
                output: Some(out.output_lossy()),
                exit_status: out.exit_status,
                target: out.command,
                bytes: None,
                error: None,
            },
            // 命令已执行时错误里带有输出和退出码
            Err(e) => {
                let captured = e.command_output();
                StepReport {
                    kind: StepKind::Output,
                    target: captured
                        .map(|out| out.command.clone())
                        .unwrap_or_else(|| command_line(command)),
                    ok: false,
                    output: captured.map(CommandOutput::output_lossy),
                    exit_status: captured.and_then(|out| out.exit_status),
                    bytes: None,
                    error: Some(ErrorReport::new(&e, ctx.is_done())),
                }
            }
        };
        steps.push(step);
    }

    for download in &job.downloads {
        let remote = remote_path(&download.remote);
        let result = remoter.get(ctx, &remote, Path::new(&download.local)).await;
        steps.push(transfer_step(
            StepKind::Get,
            format!("{} -> {}", remote, download.local),
            result,
            ctx,
        ));
    }

    steps
}

fn transfer_step(
    kind: StepKind,
    target: String,
    result: Result<u64, RemoterError>,
    ctx: &WaitContext,
) -> StepReport {
    match result {
        Ok(bytes) => StepReport {
            kind,
            target,
            ok: true,
            output: None,
            exit_status: None,
            bytes: Some(bytes),
            error: None,
        },
        Err(e) => StepReport {
            kind,
            target,
            ok: false,
            output: None,
            exit_status: None,
            bytes: None,
            error: Some(ErrorReport::new(&e, ctx.is_done())),
        },
    }
}
