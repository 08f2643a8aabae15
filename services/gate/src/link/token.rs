//! 链接安全 token：版本化 claims + HMAC-SHA256 签名。
//!
//! 序列化格式为 `lgt_v{N}.<claims_b64url>.<sig_b64url>`，签名输入是按版本固定字段顺序
//! 以换行拼接的规范串，而不是 claims 的 JSON 原文：
//! - `lgt_v1`（basic）：`rid`、`did`、`exp`；
//! - `lgt_v2`（enhanced）：额外绑定 `iat`、客户端地址与 nonce。

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// token 版本。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenVersion {
    /// 仅绑定资源、设备与过期时间，兼容旧调用方。
    Basic,
    /// 额外绑定签发时间、客户端地址与 nonce。
    Enhanced,
}

impl TokenVersion {
    fn prefix(self) -> &'static str {
        match self {
            Self::Basic => "lgt_v1",
            Self::Enhanced => "lgt_v2",
        }
    }

    fn from_prefix(raw: &str) -> Option<Self> {
        match raw {
            "lgt_v1" => Some(Self::Basic),
            "lgt_v2" => Some(Self::Enhanced),
            _ => None,
        }
    }
}

/// token claims。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TokenClaims {
    /// 资源 ID（资源 URL 的 sha256 hex）。
    pub(crate) rid: String,
    /// 绑定设备，空串表示签发时未指定。
    pub(crate) did: String,
    pub(crate) exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) addr: Option<String>,
}

/// 解析后的 token。
#[derive(Debug, Clone)]
pub(crate) struct SignedToken {
    pub(crate) version: TokenVersion,
    pub(crate) claims: TokenClaims,
    signature: Vec<u8>,
}

/// token 编解码错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenError {
    Format,
    Version,
    Payload,
    Claims,
    SignatureFormat,
    Signer,
}

/// token 签发与校验器。
#[derive(Clone)]
pub(crate) struct TokenCodec {
    secret: Vec<u8>,
}

impl TokenCodec {
    pub(crate) fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// 以 `now` 为签发时间生成 token。
    pub(crate) fn mint_at(
        &self,
        version: TokenVersion,
        resource_id: &str,
        device_id: &str,
        ttl_sec: u64,
        client_address: Option<&str>,
        now: u64,
    ) -> Result<String, TokenError> {
        let claims = match version {
            TokenVersion::Basic => TokenClaims {
                rid: resource_id.to_string(),
                did: device_id.to_string(),
                exp: now.saturating_add(ttl_sec),
                iat: None,
                nonce: None,
                addr: None,
            },
            TokenVersion::Enhanced => TokenClaims {
                rid: resource_id.to_string(),
                did: device_id.to_string(),
                exp: now.saturating_add(ttl_sec),
                iat: Some(now),
                nonce: Some(Uuid::new_v4().simple().to_string()),
                addr: client_address
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string),
            },
        };

        let payload = serde_json::to_vec(&claims).map_err(|_| TokenError::Claims)?;
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
        let input = canonical_input(version, &claims, resource_id, device_id);
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| TokenError::Signer)?;
        mac.update(input.as_bytes());
        let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{}.{payload_b64}.{sig_b64}", version.prefix()))
    }

    /// 解析 token 结构（不校验签名）。
    pub(crate) fn parse(&self, raw: &str) -> Result<SignedToken, TokenError> {
        let mut parts = raw.trim().split('.');
        let prefix = parts.next().unwrap_or_default();
        let payload_b64 = parts.next().unwrap_or_default();
        let sig_b64 = parts.next().unwrap_or_default();
        if payload_b64.is_empty() || sig_b64.is_empty() || parts.next().is_some() {
            return Err(TokenError::Format);
        }
        let version = TokenVersion::from_prefix(prefix).ok_or(TokenError::Version)?;

        let signature = URL_SAFE_NO_PAD
            .decode(sig_b64.as_bytes())
            .map_err(|_| TokenError::SignatureFormat)?;
        let payload_raw = URL_SAFE_NO_PAD
            .decode(payload_b64.as_bytes())
            .map_err(|_| TokenError::Payload)?;
        let claims: TokenClaims =
            serde_json::from_slice(&payload_raw).map_err(|_| TokenError::Claims)?;
        if version == TokenVersion::Enhanced && (claims.iat.is_none() || claims.nonce.is_none()) {
            return Err(TokenError::Claims);
        }

        Ok(SignedToken {
            version,
            claims,
            signature,
        })
    }

    /// 用期望的资源与设备重算签名并常量时间比较。
    pub(crate) fn verify_signature(
        &self,
        token: &SignedToken,
        resource_id: &str,
        device_id: &str,
    ) -> bool {
        let input = canonical_input(token.version, &token.claims, resource_id, device_id);
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(input.as_bytes());
        mac.verify_slice(&token.signature).is_ok()
    }
}

/// 过期判定与签名无关。
pub(crate) fn is_expired(claims: &TokenClaims, now: u64) -> bool {
    now > claims.exp
}

/// 资源 URL 对应的资源 ID。
pub(crate) fn resource_id_for(resource_url: &str) -> String {
    sha256_hex(resource_url)
}

/// sha256 hex。
pub(crate) fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// 组装签名输入。
fn canonical_input(
    version: TokenVersion,
    claims: &TokenClaims,
    resource_id: &str,
    device_id: &str,
) -> String {
    match version {
        TokenVersion::Basic => format!(
            "{}\n{resource_id}\n{device_id}\n{}",
            version.prefix(),
            claims.exp
        ),
        TokenVersion::Enhanced => format!(
            "{}\n{resource_id}\n{device_id}\n{}\n{}\n{}\n{}",
            version.prefix(),
            claims.exp,
            claims.iat.unwrap_or_default(),
            claims.addr.as_deref().unwrap_or_default(),
            claims.nonce.as_deref().unwrap_or_default(),
        ),
    }
}
