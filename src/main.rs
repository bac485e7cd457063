//! Remoter CLI 入口点
//!
//! 用法：`remoter-cli [job.json]`，省略路径时从 stdin 读取作业。
//! 主要功能：
//! - 多台主机并发执行，拨号带重试，作业阶段有总超时
//! - Ctrl+C / SIGTERM 强制结束所有进行中的操作
//! - 每台主机输出一行 JSON 报告到 stdout

use std::path::Path;

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use remoter::runner::{run_job, Job};
use remoter::WaitContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，输出到 stderr 避免干扰 JSON 报告
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let job = match std::env::args().nth(1) {
        Some(path) => Job::load(Path::new(&path))?,
        None => {
            let mut json = String::new();
            tokio::io::stdin()
                .read_to_string(&mut json)
                .await
                .context("读取 stdin 失败")?;
            Job::from_json(&json)?
        }
    };

    tracing::info!("Remoter 启动: {} 台主机, pid={}", job.hosts.len(), std::process::id());

    let root = WaitContext::new();
    let signal_task = tokio::spawn(cancel_on_signal(root.clone()));

    let reports = run_job(&job, &root).await;
    signal_task.abort();

    let mut failed = false;
    for report in &reports {
        failed |= !report.online || report.steps.iter().any(|s| !s.ok);
        println!("{}", serde_json::to_string(report)?);
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM，然后取消根上下文
async fn cancel_on_signal(root: WaitContext) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("无法监听 SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::warn!("收到退出信号，取消所有操作");
    root.cancel();
}
