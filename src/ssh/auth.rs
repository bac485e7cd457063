//! SSH 认证
//!
//! 支持密码和私钥两种认证方式，二者必须且只能提供一种。

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use russh_keys::key::KeyPair;

use crate::utils::error::RemoterError;

/// 认证方式
#[derive(Clone)]
pub enum AuthMethod {
    /// 密码认证
    Password(String),
    /// 私钥认证
    PrivateKey {
        /// 私钥文件路径
        path: String,
        /// 私钥密码（可选）
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    /// 认证方式名称（用于日志和错误消息）
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            AuthMethod::PrivateKey { .. } => "publickey",
        }
    }
}

// 避免在日志中泄露密码
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password(***)"),
            AuthMethod::PrivateKey { path, passphrase } => f
                .debug_struct("PrivateKey")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "***"))
                .finish(),
        }
    }
}

/// 读取并解析私钥文件
///
/// 认证步骤在 SSH 握手之后调用，文件读取走 tokio::fs，不阻塞运行时。
/// 文件缺失、无法读取或无法解析都是配置错误。
pub async fn load_private_key(
    path: &str,
    passphrase: Option<&str>,
) -> Result<KeyPair, RemoterError> {
    let key_path = resolve_home(path);
    let shown = key_path.display().to_string();

    let metadata = tokio::fs::metadata(&key_path).await.map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            RemoterError::key_load_failed(&shown, "文件不存在")
        } else {
            RemoterError::key_load_failed(&shown, &format!("无法访问: {}", e))
        }
    })?;
    warn_if_exposed(&shown, &metadata);

    let pem = tokio::fs::read_to_string(&key_path)
        .await
        .map_err(|e| RemoterError::key_load_failed(&shown, &format!("无法读取: {}", e)))?;

    let key = decode_key(&shown, &pem, passphrase)?;
    tracing::debug!("已加载私钥: {}", shown);
    Ok(key)
}

fn decode_key(shown: &str, pem: &str, passphrase: Option<&str>) -> Result<KeyPair, RemoterError> {
    russh_keys::decode_secret_key(pem, passphrase).map_err(|e| {
        let reason = match (passphrase, e) {
            (None, russh_keys::Error::KeyIsEncrypted) => "私钥已加密，需要提供密码".to_string(),
            (Some(_), e) => format!("无法解密或解析（密码可能错误）: {}", e),
            (None, e) => format!("无法解析: {}", e),
        };
        RemoterError::key_load_failed(shown, &reason)
    })
}

/// 组或其他用户可读时只记录警告
#[cfg(unix)]
fn warn_if_exposed(shown: &str, metadata: &std::fs::Metadata) {
    use std::os::unix::fs::PermissionsExt;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        tracing::warn!("私钥 {} 的权限为 {:o}，建议改为 600", shown, mode);
    }
}

#[cfg(not(unix))]
fn warn_if_exposed(_shown: &str, _metadata: &std::fs::Metadata) {}

/// `~` 开头的路径解析到用户主目录下
pub fn resolve_home(path: &str) -> PathBuf {
    match (Path::new(path).strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
