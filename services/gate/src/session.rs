//! 一次性会话握手：把确认页与最终资源获取绑定为单次交接。

use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{Expiring, ExpiringStore};

/// 会话默认有效期（秒）。
pub(crate) const DEFAULT_SESSION_TTL_SEC: u64 = 120;

/// 会话记录。
#[derive(Debug, Clone)]
pub(crate) struct SessionRecord {
    pub(crate) app_id: String,
    pub(crate) device_id: String,
    pub(crate) token: String,
    pub(crate) resource_url: String,
    pub(crate) created_at: u64,
    pub(crate) expires_at: u64,
    pub(crate) used: bool,
}

impl Expiring for SessionRecord {
    fn purge_eligible(&self, now: u64) -> bool {
        now > self.expires_at
    }
}

/// 新开会话。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionTicket {
    pub(crate) session_id: String,
    pub(crate) token: String,
    pub(crate) expires_at: u64,
}

/// 会话消费失败原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionError {
    Unknown,
    Expired,
    AlreadyUsed,
    DeviceMismatch,
    TokenMismatch,
}

impl SessionError {
    pub(crate) fn code(self) -> &'static str {
        match self {
            Self::Unknown => "SESSION_UNKNOWN",
            Self::Expired => "SESSION_EXPIRED",
            Self::AlreadyUsed => "SESSION_USED",
            Self::DeviceMismatch => "SESSION_DEVICE_MISMATCH",
            Self::TokenMismatch => "SESSION_TOKEN_MISMATCH",
        }
    }

    pub(crate) fn reason(self) -> &'static str {
        match self {
            Self::Unknown => "session not found",
            Self::Expired => "session expired",
            Self::AlreadyUsed => "session already used",
            Self::DeviceMismatch => "session bound to another device",
            Self::TokenMismatch => "session token mismatch",
        }
    }
}

/// 会话握手存储。
#[derive(Clone)]
pub(crate) struct SessionHandshake {
    sessions: ExpiringStore<String, SessionRecord>,
    ttl_sec: u64,
}

impl SessionHandshake {
    pub(crate) fn new(ttl_sec: u64) -> Self {
        Self {
            sessions: ExpiringStore::new("sessions"),
            ttl_sec,
        }
    }

    pub(crate) fn store(&self) -> &ExpiringStore<String, SessionRecord> {
        &self.sessions
    }

    /// 打开会话。
    pub(crate) async fn open_at(
        &self,
        app_id: &str,
        device_id: &str,
        resource_url: &str,
        now: u64,
    ) -> SessionTicket {
        let session_id = format!("ses_{}", Uuid::new_v4().simple());
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let expires_at = now.saturating_add(self.ttl_sec);
        self.sessions
            .insert(
                session_id.clone(),
                SessionRecord {
                    app_id: app_id.to_string(),
                    device_id: device_id.to_string(),
                    token: token.clone(),
                    resource_url: resource_url.to_string(),
                    created_at: now,
                    expires_at,
                    used: false,
                },
            )
            .await;
        debug!("session opened for app {app_id}");
        SessionTicket {
            session_id,
            token,
            expires_at,
        }
    }

    /// 消费会话。检查顺序：存在 → 过期 → 已用 → 设备 → token。
    pub(crate) async fn consume_at(
        &self,
        session_id: &str,
        token: &str,
        device_id: &str,
        now: u64,
    ) -> Result<String, SessionError> {
        let session_id = session_id.trim();
        self.sessions
            .update(|sessions| {
                let record = sessions.get_mut(session_id).ok_or(SessionError::Unknown)?;
                if record.purge_eligible(now) {
                    return Err(SessionError::Expired);
                }
                if record.used {
                    warn!("session replay rejected for app {}", record.app_id);
                    return Err(SessionError::AlreadyUsed);
                }
                if record.device_id != device_id {
                    return Err(SessionError::DeviceMismatch);
                }
                if !bool::from(record.token.as_bytes().ct_eq(token.trim().as_bytes())) {
                    return Err(SessionError::TokenMismatch);
                }
                record.used = true;
                debug!(
                    "session consumed for app {} after {}s",
                    record.app_id,
                    now.saturating_sub(record.created_at)
                );
                Ok(record.resource_url.clone())
            })
            .await
    }
}
