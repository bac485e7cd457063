//! 拨号配置
//!
//! `DialConfig` 是强类型、构建后不可变的连接配置；`HostConfig` 是
//! 作业文件中的键值形式，附带调用方重试循环所需的超时参数。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::error::RemoterError;

use super::auth::AuthMethod;

/// 拨号配置
#[derive(Debug, Clone)]
pub struct DialConfig {
    host: String,
    user: String,
    port: u16,
    auth: AuthMethod,
}

impl DialConfig {
    /// 创建配置构建器
    pub fn builder() -> DialConfigBuilder {
        DialConfigBuilder::default()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn auth(&self) -> &AuthMethod {
        &self.auth
    }

    /// `host:port` 形式的地址，IPv6 地址加方括号
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// 配置构建器
#[derive(Debug, Default, Clone)]
pub struct DialConfigBuilder {
    host: Option<String>,
    user: Option<String>,
    port: Option<String>,
    password: Option<String>,
    private_key_path: Option<String>,
    passphrase: Option<String>,
}

impl DialConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn private_key_path(mut self, path: impl Into<String>) -> Self {
        self.private_key_path = Some(path.into());
        self
    }

    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// 校验并构建配置
    ///
    /// 必填字段缺失、端口无法解析、认证方式缺失或同时提供两种时返回配置错误。
    pub fn build(self) -> Result<DialConfig, RemoterError> {
        let host = required("host", self.host)?;
        let user = required("user", self.user)?;
        let port = required("port", self.port)?;
        let port = port
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| RemoterError::invalid_field("port", &format!("{:?} 不是有效端口", port)))?;

        let auth = match (self.password, self.private_key_path) {
            (Some(password), None) => AuthMethod::Password(password),
            (None, Some(path)) if !path.is_empty() => AuthMethod::PrivateKey {
                path,
                passphrase: self.passphrase,
            },
            (None, Some(_)) => return Err(RemoterError::invalid_field("privateKeyPath", "路径为空")),
            (None, None) => {
                return Err(RemoterError::Config(
                    "需要提供 password 或 privateKeyPath 之一".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(RemoterError::Config(
                    "password 与 privateKeyPath 不能同时提供".to_string(),
                ))
            }
        };

        Ok(DialConfig {
            host,
            user,
            port,
            auth,
        })
    }
}

fn required(field: &str, value: Option<String>) -> Result<String, RemoterError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(RemoterError::missing_field(field)),
    }
}

/// 端口既可以写成字符串也可以写成数字
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PortValue {
    Text(String),
    Number(u16),
}

impl PortValue {
    fn into_text(self) -> String {
        match self {
            PortValue::Text(s) => s,
            PortValue::Number(n) => n.to_string(),
        }
    }
}

/// 作业文件中的主机配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<PortValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "privKey")]
    pub private_key_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// 报告中显示的标签
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// 每次拨号尝试的超时（秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
    /// 拨号尝试次数
    #[serde(skip_serializing_if = "Option::is_none", alias = "connectTryTimes")]
    pub connect_retry_count: Option<u32>,
    /// 作业阶段的总超时（秒）
    #[serde(skip_serializing_if = "Option::is_none", alias = "cmdsTimeout")]
    pub commands_timeout: Option<u64>,
}

impl HostConfig {
    /// 转换为拨号配置
    pub fn dial_config(&self) -> Result<DialConfig, RemoterError> {
        let mut builder = DialConfig::builder();
        if let Some(host) = &self.host {
            builder = builder.host(host);
        }
        if let Some(user) = &self.user {
            builder = builder.user(user);
        }
        if let Some(port) = &self.port {
            builder = builder.port(port.clone().into_text());
        }
        if let Some(password) = &self.password {
            builder = builder.password(password);
        }
        if let Some(path) = &self.private_key_path {
            builder = builder.private_key_path(path);
        }
        if let Some(passphrase) = &self.passphrase {
            builder = builder.passphrase(passphrase);
        }
        builder.build()
    }

    /// 调用方重试循环所需的参数，三项都必须提供
    pub fn retry_policy(&self) -> Result<RetryPolicy, RemoterError> {
        let connect_timeout = self
            .connect_timeout
            .ok_or_else(|| RemoterError::missing_field("connectTimeout"))?;
        let attempts = self
            .connect_retry_count
            .ok_or_else(|| RemoterError::missing_field("connectRetryCount"))?;
        let commands_timeout = self
            .commands_timeout
            .ok_or_else(|| RemoterError::missing_field("commandsTimeout"))?;

        if attempts == 0 {
            return Err(RemoterError::invalid_field("connectRetryCount", "至少为 1"));
        }

        Ok(RetryPolicy {
            connect_timeout: Duration::from_secs(connect_timeout),
            attempts,
            commands_timeout: Duration::from_secs(commands_timeout),
        })
    }

    /// 报告中使用的名称
    pub fn display_name(&self) -> String {
        self.label
            .clone()
            .or_else(|| self.host.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// 调用方重试循环参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub connect_timeout: Duration,
    pub attempts: u32,
    pub commands_timeout: Duration,
}
