//! 临时链接 token：把确认页环节与同一条链接的最终解密环节关联起来。

use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::{
    link::payload::LinkKey,
    store::{Expiring, ExpiringStore},
};

/// 临时链接 token 默认有效期（秒）。
pub(crate) const DEFAULT_TEMP_LINK_TTL_SEC: u64 = 300;

/// 单条链接的确认 token 记录。
#[derive(Debug, Clone)]
pub(crate) struct TempLinkToken {
    pub(crate) token: String,
    pub(crate) created_at: u64,
    pub(crate) expires_at: u64,
    pub(crate) client_address: Option<String>,
    pub(crate) used: bool,
    /// 领取确认 token 的设备；为空时任何设备都可出示。
    pub(crate) device_id: Option<String>,
}

impl Expiring for TempLinkToken {
    fn purge_eligible(&self, now: u64) -> bool {
        now > self.expires_at
    }
}

/// 确认 token 校验失败原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConfirmError {
    Unknown,
    Expired,
    AlreadyUsed,
    /// 出示设备不是领取确认 token 的设备。
    DeviceMismatch,
    Mismatch,
}

impl ConfirmError {
    pub(crate) fn code(self) -> &'static str {
        match self {
            Self::Unknown => "CONFIRM_TOKEN_UNKNOWN",
            Self::Expired => "CONFIRM_TOKEN_EXPIRED",
            Self::AlreadyUsed => "CONFIRM_TOKEN_USED",
            Self::DeviceMismatch => "CONFIRM_TOKEN_DEVICE_MISMATCH",
            Self::Mismatch => "CONFIRM_TOKEN_MISMATCH",
        }
    }

    pub(crate) fn reason(self) -> &'static str {
        match self {
            Self::Unknown => "confirmation token not found",
            Self::Expired => "confirmation token expired",
            Self::AlreadyUsed => "confirmation token already used",
            Self::DeviceMismatch => "confirmation token issued to another device",
            Self::Mismatch => "confirmation token mismatch",
        }
    }
}

/// 临时链接 token 存储。
#[derive(Clone)]
pub(crate) struct TempLinkStore {
    entries: ExpiringStore<LinkKey, TempLinkToken>,
    ttl_sec: u64,
}

impl TempLinkStore {
    pub(crate) fn new(ttl_sec: u64) -> Self {
        Self {
            entries: ExpiringStore::new("temp_links"),
            ttl_sec,
        }
    }

    pub(crate) fn store(&self) -> &ExpiringStore<LinkKey, TempLinkToken> {
        &self.entries
    }

    /// 签发或重新签发确认 token，旧 token 立即失效。
    pub(crate) async fn mint_at(
        &self,
        key: LinkKey,
        device_id: Option<&str>,
        client_address: Option<&str>,
        now: u64,
    ) -> String {
        let token = format!("lct_{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        self.entries
            .insert(
                key,
                TempLinkToken {
                    token: token.clone(),
                    created_at: now,
                    expires_at: now.saturating_add(self.ttl_sec),
                    client_address: client_address.map(str::to_string),
                    used: false,
                    device_id: device_id.map(str::to_string),
                },
            )
            .await;
        token
    }

    /// 校验确认 token；成功时标记已使用。
    ///
    /// 检查顺序：存在 → 过期 → 已用 → 设备 → token 匹配，失败不消耗 token。
    pub(crate) async fn confirm_at(
        &self,
        key: &LinkKey,
        proof: &str,
        device_id: &str,
        now: u64,
    ) -> Result<TempLinkToken, ConfirmError> {
        self.entries
            .update(|entries| {
                let record = entries.get_mut(key).ok_or(ConfirmError::Unknown)?;
                if record.purge_eligible(now) {
                    return Err(ConfirmError::Expired);
                }
                if record.used {
                    return Err(ConfirmError::AlreadyUsed);
                }
                if record
                    .device_id
                    .as_deref()
                    .is_some_and(|owner| owner != device_id)
                {
                    return Err(ConfirmError::DeviceMismatch);
                }
                if !bool::from(record.token.as_bytes().ct_eq(proof.trim().as_bytes())) {
                    return Err(ConfirmError::Mismatch);
                }
                record.used = true;
                Ok(record.clone())
            })
            .await
    }
}
