//! 配置模块职责：
//! 1. 启动时一次性读取 gate 运行所需的环境变量并提供默认值。
//! 2. 校验密钥材料（32 字节 hex 加密密钥、签名密钥）。
//! 3. 提供布尔/时长/整数等通用解析能力。

use std::time::Duration;

use anyhow::{Context, anyhow};
use url::Url;

use crate::{
    ledger::DEFAULT_MAX_USES,
    link::{
        cipher::{KEY_LEN, parse_key_hex},
        temp::DEFAULT_TEMP_LINK_TTL_SEC,
        token::TokenVersion,
    },
    session::DEFAULT_SESSION_TTL_SEC,
    transfer::DEFAULT_TRANSFER_CODE_TTL_SEC,
};

/// 默认监听地址。
pub(crate) const DEFAULT_GATE_ADDR: &str = "0.0.0.0:18090";
/// 默认对外链接前缀。
pub(crate) const DEFAULT_PUBLIC_BASE_URL: &str = "http://127.0.0.1:18090";
/// 链接默认有效期（秒）。
pub(crate) const DEFAULT_LINK_TTL_SEC: u64 = 1800;
/// 台账簿记默认保留期（秒）。
pub(crate) const DEFAULT_LEDGER_RETENTION_SEC: u64 = 24 * 3600;
/// 清扫默认周期（秒）。
pub(crate) const DEFAULT_SWEEP_INTERVAL_SEC: u64 = 60;
/// 签名密钥最小长度（字节）。
const MIN_SIGNING_SECRET_LEN: usize = 16;

/// 加密密钥环境变量。
pub(crate) const CIPHER_KEY_ENV: &str = "GATE_CIPHER_KEY";
/// 签名密钥环境变量。
pub(crate) const SIGNING_SECRET_ENV: &str = "GATE_SIGNING_SECRET";
/// 调试开关：签名不匹配降级为告警。仅限测试环境。
const ALLOW_SIGNATURE_MISMATCH_ENV: &str = "GATE_DEBUG_ALLOW_SIGNATURE_MISMATCH";

/// gate 运行时配置，启动后不可变。
#[derive(Clone)]
pub(crate) struct GateConfig {
    /// HTTP 监听地址。
    pub(crate) listen_addr: String,
    /// 签发链接使用的对外前缀（不含结尾 `/`）。
    pub(crate) public_base_url: String,
    /// AES-256 密钥。
    pub(crate) cipher_key: [u8; KEY_LEN],
    /// HMAC 签名密钥。
    pub(crate) signing_secret: String,
    /// 新签发 token 的版本。
    pub(crate) token_version: TokenVersion,
    pub(crate) link_ttl_sec: u64,
    pub(crate) default_max_uses: u32,
    pub(crate) ledger_retention_sec: u64,
    pub(crate) transfer_code_ttl_sec: u64,
    pub(crate) session_ttl_sec: u64,
    pub(crate) temp_link_ttl_sec: u64,
    pub(crate) sweep_interval: Duration,
    /// 签名不匹配时仅告警放行。默认关闭，生产环境禁止开启。
    pub(crate) allow_signature_mismatch: bool,
}

impl std::fmt::Debug for GateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateConfig")
            .field("listen_addr", &self.listen_addr)
            .field("public_base_url", &self.public_base_url)
            .field("token_version", &self.token_version)
            .field("link_ttl_sec", &self.link_ttl_sec)
            .field("default_max_uses", &self.default_max_uses)
            .field("ledger_retention_sec", &self.ledger_retention_sec)
            .field("transfer_code_ttl_sec", &self.transfer_code_ttl_sec)
            .field("session_ttl_sec", &self.session_ttl_sec)
            .field("temp_link_ttl_sec", &self.temp_link_ttl_sec)
            .field("sweep_interval", &self.sweep_interval)
            .field("allow_signature_mismatch", &self.allow_signature_mismatch)
            .finish_non_exhaustive()
    }
}

impl GateConfig {
    /// 用给定密钥与默认策略构建配置。
    pub(crate) fn with_keys(cipher_key: [u8; KEY_LEN], signing_secret: impl Into<String>) -> Self {
        Self {
            listen_addr: DEFAULT_GATE_ADDR.to_string(),
            public_base_url: DEFAULT_PUBLIC_BASE_URL.to_string(),
            cipher_key,
            signing_secret: signing_secret.into(),
            token_version: TokenVersion::Enhanced,
            link_ttl_sec: DEFAULT_LINK_TTL_SEC,
            default_max_uses: DEFAULT_MAX_USES,
            ledger_retention_sec: DEFAULT_LEDGER_RETENTION_SEC,
            transfer_code_ttl_sec: DEFAULT_TRANSFER_CODE_TTL_SEC,
            session_ttl_sec: DEFAULT_SESSION_TTL_SEC,
            temp_link_ttl_sec: DEFAULT_TEMP_LINK_TTL_SEC,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SEC),
            allow_signature_mismatch: false,
        }
    }

    /// 从环境变量构建配置；密钥缺失或非法时直接失败。
    pub(crate) fn from_env() -> anyhow::Result<Self> {
        let cipher_raw = required_env(CIPHER_KEY_ENV)?;
        let cipher_key = parse_key_hex(&cipher_raw)
            .map_err(|err| anyhow!(err))
            .with_context(|| format!("invalid {CIPHER_KEY_ENV}"))?;
        let signing_secret = required_env(SIGNING_SECRET_ENV)?;
        if signing_secret.len() < MIN_SIGNING_SECRET_LEN {
            return Err(anyhow!(
                "{SIGNING_SECRET_ENV} must be at least {MIN_SIGNING_SECRET_LEN} bytes"
            ));
        }

        let mut config = Self::with_keys(cipher_key, signing_secret);
        config.listen_addr = string_from_env("GATE_ADDR", DEFAULT_GATE_ADDR);
        let public_base_url = string_from_env("GATE_PUBLIC_BASE_URL", DEFAULT_PUBLIC_BASE_URL);
        config.public_base_url = validate_public_base_url(&public_base_url)
            .with_context(|| format!("invalid public base url: {public_base_url}"))?;
        config.link_ttl_sec = u64_from_env("GATE_LINK_TTL_SEC", DEFAULT_LINK_TTL_SEC);
        config.default_max_uses = u32_from_env("GATE_MAX_USES", DEFAULT_MAX_USES);
        config.ledger_retention_sec =
            u64_from_env("GATE_LEDGER_RETENTION_SEC", DEFAULT_LEDGER_RETENTION_SEC);
        config.transfer_code_ttl_sec =
            u64_from_env("GATE_TRANSFER_CODE_TTL_SEC", DEFAULT_TRANSFER_CODE_TTL_SEC);
        config.session_ttl_sec = u64_from_env("GATE_SESSION_TTL_SEC", DEFAULT_SESSION_TTL_SEC);
        config.temp_link_ttl_sec =
            u64_from_env("GATE_TEMP_LINK_TTL_SEC", DEFAULT_TEMP_LINK_TTL_SEC);
        config.sweep_interval =
            duration_from_env("GATE_SWEEP_INTERVAL_SEC", DEFAULT_SWEEP_INTERVAL_SEC);
        config.allow_signature_mismatch = bool_from_env(ALLOW_SIGNATURE_MISMATCH_ENV, false);
        Ok(config)
    }
}

/// 校验对外前缀：仅允许 http/https，去掉结尾 `/`。
pub(crate) fn validate_public_base_url(raw: &str) -> anyhow::Result<String> {
    let parsed = Url::parse(raw.trim()).context("parse url")?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(anyhow!("scheme must be http or https"));
    }
    if parsed.host_str().is_none() {
        return Err(anyhow!("missing host"));
    }
    Ok(raw.trim().trim_end_matches('/').to_string())
}

/// 读取必填环境变量。
fn required_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("missing {key}; run `cl-gate keygen` to generate one"))
}

/// 读取字符串配置，空值回退默认值。
fn string_from_env(key: &str, fallback: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// 读取秒级时长配置，非法值回退到默认秒数。
fn duration_from_env(key: &str, fallback_sec: u64) -> Duration {
    Duration::from_secs(u64_from_env(key, fallback_sec))
}

/// 读取正整数配置，非法值回退到默认值。
fn u64_from_env(key: &str, fallback: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn u32_from_env(key: &str, fallback: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

/// 解析布尔环境变量，非法值回退默认值。
fn bool_from_env(key: &str, fallback: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => parse_bool(&raw).unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}
