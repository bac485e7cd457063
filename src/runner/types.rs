//! 作业数据类型定义
//!
//! 定义作业文件和执行报告的数据结构。

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ssh::config::HostConfig;
use crate::utils::error::RemoterError;

/// 文件传输条目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferSpec {
    pub local: String,
    pub remote: String,
}

/// 作业文件
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub hosts: Vec<HostConfig>,
    /// 逐条执行并捕获输出的命令
    #[serde(default)]
    pub commands: Vec<String>,
    /// 在同一个 shell 中执行的命令序列
    #[serde(default)]
    pub script: Vec<String>,
    /// 所有命令的工作目录
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default)]
    pub uploads: Vec<TransferSpec>,
    #[serde(default)]
    pub downloads: Vec<TransferSpec>,
}

impl Job {
    /// 解析作业 JSON
    pub fn from_json(json: &str) -> Result<Self, RemoterError> {
        let job: Job = serde_json::from_str(json)
            .map_err(|e| RemoterError::Config(format!("作业文件解析失败: {}", e)))?;
        job.validate()?;
        Ok(job)
    }

    /// 读取作业文件
    pub fn load(path: &Path) -> Result<Self, RemoterError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            RemoterError::Config(format!("无法读取作业文件 {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// 所有主机配置都必须完整，包括重试循环参数
    pub fn validate(&self) -> Result<(), RemoterError> {
        if self.hosts.is_empty() {
            return Err(RemoterError::missing_field("hosts"));
        }
        for host in &self.hosts {
            host.dial_config().map_err(|e| {
                RemoterError::Config(format!("主机 {}: {}", host.display_name(), e))
            })?;
            host.retry_policy().map_err(|e| {
                RemoterError::Config(format!("主机 {}: {}", host.display_name(), e))
            })?;
        }
        Ok(())
    }
}

/// 步骤类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Output,
    Run,
    Put,
    Get,
}

/// 单个步骤的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub kind: StepKind,
    /// 命令或 `local -> remote`
    pub target: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

/// 错误详情
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub error_type: String,
    pub error_code: i32,
    pub message: String,
    /// 错误发生时上下文已结束：多半是取消或超时，而不是网络故障
    pub canceled: bool,
}

impl ErrorReport {
    pub fn new(err: &RemoterError, canceled: bool) -> Self {
        Self {
            error_type: err.error_type().to_string(),
            error_code: err.code(),
            message: err.to_string(),
            canceled,
        }
    }
}

/// 单台主机的报告
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostReport {
    pub label: String,
    pub addr: String,
    pub online: bool,
    pub dial_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dial_error: Option<ErrorReport>,
    pub steps: Vec<StepReport>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: &str = r#"{
        "hosts": [{
            "host": "10.0.0.5",
            "user": "root",
            "port": "22",
            "privateKeyPath": "/k",
            "connectTimeout": 3,
            "connectRetryCount": 4,
            "commandsTimeout": 5
        }],
        "commands": ["echo hello"],
        "uploads": [{"local": "/bigfile", "remote": "/root/bigfile"}]
    }"#;

    #[test]
    fn test_parse_job() {
        let job = Job::from_json(JOB).unwrap();
        assert_eq!(job.hosts.len(), 1);
        assert_eq!(job.commands, vec!["echo hello".to_string()]);
        assert!(job.script.is_empty());
        assert_eq!(job.uploads[0].remote, "/root/bigfile");
        assert!(job.downloads.is_empty());
    }

    #[test]
    fn test_job_requires_hosts() {
        let err = Job::from_json(r#"{"hosts": []}"#).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_job_requires_retry_policy() {
        let json = r#"{"hosts": [{"host": "h", "user": "u", "port": "22", "password": "p"}]}"#;
        let err = Job::from_json(json).unwrap_err();
        assert!(err.to_string().contains("connectTimeout"));
    }

    #[test]
    fn test_job_rejects_both_auth_methods() {
        let json = r#"{"hosts": [{
            "host": "h", "user": "u", "port": "22",
            "password": "p", "privateKeyPath": "/k",
            "connectTimeout": 1, "connectRetryCount": 1, "commandsTimeout": 1
        }]}"#;
        assert!(Job::from_json(json).unwrap_err().is_config_error());
    }

    #[test]
    fn test_error_report_serialization() {
        let err = RemoterError::Dial("timeout".to_string());
        let report = ErrorReport::new(&err, true);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["errorType"], "dial_error");
        assert_eq!(value["errorCode"], 1002);
        assert_eq!(value["canceled"], true);
    }
}
