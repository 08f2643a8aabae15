//! 设备换绑确认码：人工转交的 6 位一次性数字码。

use rand::Rng;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::store::{Expiring, ExpiringStore};

/// 换绑码默认有效期（秒）。
pub(crate) const DEFAULT_TRANSFER_CODE_TTL_SEC: u64 = 600;
/// 换绑码长度。
pub(crate) const TRANSFER_CODE_LEN: usize = 6;
const CODE_MIN: u32 = 100_000;
const CODE_MAX: u32 = 999_999;
/// 生成不重复换绑码的最大尝试次数。
const MAX_CODE_ATTEMPTS: usize = 64;

/// 换绑码记录。
#[derive(Debug, Clone)]
pub(crate) struct ConfirmationCode {
    pub(crate) token: String,
    pub(crate) original_device_id: String,
    pub(crate) created_at: u64,
    pub(crate) expires_at: u64,
    pub(crate) used: bool,
    pub(crate) new_device_id: Option<String>,
    pub(crate) used_at: Option<u64>,
}

impl Expiring for ConfirmationCode {
    fn purge_eligible(&self, now: u64) -> bool {
        now > self.expires_at
    }
}

/// 新签发的换绑码。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TransferTicket {
    pub(crate) code: String,
    pub(crate) expires_at: u64,
}

/// 兑换成功后交给台账的授权。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TransferGrant {
    pub(crate) code: String,
    pub(crate) original_device_id: String,
    pub(crate) new_device_id: String,
}

/// 兑换失败原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferError {
    Malformed,
    Unknown,
    Expired,
    AlreadyUsed,
    TokenMismatch,
    /// 兑换设备与申请设备相同。
    SameDevice,
}

impl TransferError {
    pub(crate) fn code(self) -> &'static str {
        match self {
            Self::Malformed => "TRANSFER_CODE_INVALID",
            Self::Unknown => "TRANSFER_CODE_UNKNOWN",
            Self::Expired => "TRANSFER_CODE_EXPIRED",
            Self::AlreadyUsed => "TRANSFER_CODE_USED",
            Self::TokenMismatch => "TRANSFER_CODE_MISMATCH",
            Self::SameDevice => "TRANSFER_SAME_DEVICE",
        }
    }

    pub(crate) fn reason(self) -> &'static str {
        match self {
            Self::Malformed => "transfer code must be 6 digits",
            Self::Unknown => "transfer code not found",
            Self::Expired => "transfer code expired",
            Self::AlreadyUsed => "transfer code already used",
            Self::TokenMismatch => "transfer code issued for another link",
            Self::SameDevice => "transfer code must be redeemed on another device",
        }
    }
}

/// 判断字符串是否是换绑码形态。
pub(crate) fn looks_like_transfer_code(raw: &str) -> bool {
    let raw = raw.trim();
    raw.len() == TRANSFER_CODE_LEN && raw.bytes().all(|b| b.is_ascii_digit())
}

/// 换绑确认流程。
#[derive(Clone)]
pub(crate) struct TransferFlow {
    codes: ExpiringStore<String, ConfirmationCode>,
    ttl_sec: u64,
}

impl TransferFlow {
    pub(crate) fn new(ttl_sec: u64) -> Self {
        Self {
            codes: ExpiringStore::new("transfer_codes"),
            ttl_sec,
        }
    }

    pub(crate) fn store(&self) -> &ExpiringStore<String, ConfirmationCode> {
        &self.codes
    }

    /// 签发换绑码，保证与所有未过期的码不重复。
    ///
    /// 同一 token 只保留一个未使用的码，新码签发时旧码作废。
    /// 随机尝试耗尽时返回 `None`。
    pub(crate) async fn request_at(
        &self,
        token: &str,
        original_device_id: &str,
        now: u64,
    ) -> Option<TransferTicket> {
        let expires_at = now.saturating_add(self.ttl_sec);
        self.codes
            .update(|codes| {
                codes.retain(|_, existing| existing.used || existing.token != token);
                let mut rng = rand::thread_rng();
                let code = (0..MAX_CODE_ATTEMPTS)
                    .map(|_| rng.gen_range(CODE_MIN..=CODE_MAX).to_string())
                    .find(|candidate| {
                        codes
                            .get(candidate)
                            .is_none_or(|existing| existing.purge_eligible(now))
                    })?;
                codes.insert(
                    code.clone(),
                    ConfirmationCode {
                        token: token.to_string(),
                        original_device_id: original_device_id.to_string(),
                        created_at: now,
                        expires_at,
                        used: false,
                        new_device_id: None,
                        used_at: None,
                    },
                );
                info!("transfer code issued for device {original_device_id}");
                Some(TransferTicket { code, expires_at })
            })
            .await
    }

    /// 兑换换绑码。检查顺序：格式 → 存在 → 过期 → 已用 → token 匹配。
    pub(crate) async fn redeem_at(
        &self,
        code: &str,
        token: &str,
        new_device_id: &str,
        now: u64,
    ) -> Result<TransferGrant, TransferError> {
        if !looks_like_transfer_code(code) {
            return Err(TransferError::Malformed);
        }
        let code = code.trim();
        self.codes
            .update(|codes| {
                let record = codes.get_mut(code).ok_or(TransferError::Unknown)?;
                if record.purge_eligible(now) {
                    return Err(TransferError::Expired);
                }
                if record.used {
                    warn!(
                        "transfer code replay rejected (redeemed by {} at {})",
                        record.new_device_id.as_deref().unwrap_or("?"),
                        record.used_at.unwrap_or_default()
                    );
                    return Err(TransferError::AlreadyUsed);
                }
                if !bool::from(record.token.as_bytes().ct_eq(token.as_bytes())) {
                    return Err(TransferError::TokenMismatch);
                }
                if record.original_device_id == new_device_id {
                    return Err(TransferError::SameDevice);
                }

                record.used = true;
                record.used_at = Some(now);
                record.new_device_id = Some(new_device_id.to_string());
                info!(
                    "transfer code redeemed: {} -> {new_device_id} ({}s after issue)",
                    record.original_device_id,
                    now.saturating_sub(record.created_at)
                );
                Ok(TransferGrant {
                    code: code.to_string(),
                    original_device_id: record.original_device_id.clone(),
                    new_device_id: new_device_id.to_string(),
                })
            })
            .await
    }
}
