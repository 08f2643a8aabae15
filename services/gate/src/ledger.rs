//! 使用台账：token 首用设备绑定、使用次数上限与换绑状态。
//!
//! 状态迁移：`Bound(A) -> PendingTransfer{A, B} -> Bound(B)`。换绑码兑换成功后台账进入
//! `PendingTransfer`，只有 B 的下一次访问能完成迁移；迁移前 A 仍按原绑定访问。
//! 使用次数跟随 token 而非设备，换绑不会重置预算。

use tracing::{debug, info};

use crate::store::{Expiring, ExpiringStore};

/// 默认单链接最大使用次数（一次安装 + 一次重新下载）。
pub(crate) const DEFAULT_MAX_USES: u32 = 2;
/// 单条记录保留的访问地址条数上限。
const MAX_IP_HISTORY: usize = 32;

/// token 当前绑定状态。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Binding {
    Bound {
        device_id: String,
    },
    PendingTransfer {
        from: String,
        to: String,
        code: String,
    },
}

impl Binding {
    /// 当前仍然有效的绑定设备。
    pub(crate) fn device_id(&self) -> &str {
        match self {
            Self::Bound { device_id } => device_id,
            Self::PendingTransfer { from, .. } => from,
        }
    }
}

/// 单个 token 的使用记录。
#[derive(Debug, Clone)]
pub(crate) struct UsageRecord {
    pub(crate) binding: Binding,
    pub(crate) use_count: u32,
    pub(crate) max_uses: u32,
    pub(crate) first_seen_at: u64,
    pub(crate) last_used_at: u64,
    pub(crate) ip_history: Vec<String>,
    pub(crate) transferred_to_device_id: Option<String>,
    /// token 自身的有效期。
    pub(crate) token_expires_at: u64,
    /// 台账簿记保留期，与 token 有效期相互独立。
    retention_sec: u64,
}

impl UsageRecord {
    fn push_address(&mut self, client_address: Option<&str>) {
        let Some(address) = client_address.map(str::trim).filter(|v| !v.is_empty()) else {
            return;
        };
        if let Some(last) = self.ip_history.last()
            && last != address
        {
            // 地址变化只记录不拒绝（NAT/漫游）。
            info!(
                "usage address changed for device {}: {last} -> {address}",
                self.binding.device_id()
            );
        }
        if self.ip_history.len() >= MAX_IP_HISTORY {
            self.ip_history.remove(0);
        }
        self.ip_history.push(address.to_string());
    }
}

impl Expiring for UsageRecord {
    fn purge_eligible(&self, now: u64) -> bool {
        now > self.token_expires_at && now > self.last_used_at.saturating_add(self.retention_sec)
    }
}

/// 放行类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UseKind {
    FirstUse,
    RepeatUse,
    Transferred,
}

/// 台账判定结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UsageDecision {
    Allow { kind: UseKind, use_count: u32 },
    /// 非硬失败：`allow_transfer` 为真时调用方可引导申请换绑码。
    DenyDeviceMismatch { allow_transfer: bool },
    DenyMaxUsesExceeded { use_count: u32, max_uses: u32 },
}

/// 一次台账判定的输入。
#[derive(Debug, Clone, Copy)]
pub(crate) struct UsageCheck<'a> {
    pub(crate) token: &'a str,
    /// 签发时预绑定的设备；首用时优先绑定到它。
    pub(crate) expected_device_id: Option<&'a str>,
    pub(crate) device_id: &'a str,
    pub(crate) client_address: Option<&'a str>,
    pub(crate) max_uses: u32,
    pub(crate) token_expires_at: u64,
}

/// 换绑授权失败。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferAuthError {
    /// token 尚无使用记录。
    NotBound,
    /// 原设备与当前绑定不一致。
    DeviceMismatch,
    /// 目标设备就是当前绑定设备。
    SameDevice,
}

/// 使用台账。
#[derive(Clone)]
pub(crate) struct UsageLedger {
    records: ExpiringStore<String, UsageRecord>,
    retention_sec: u64,
}

impl UsageLedger {
    pub(crate) fn new(retention_sec: u64) -> Self {
        Self {
            records: ExpiringStore::new("usage"),
            retention_sec,
        }
    }

    pub(crate) fn store(&self) -> &ExpiringStore<String, UsageRecord> {
        &self.records
    }

    /// 只判定不落账（确认页环节使用，避免消耗次数）。
    pub(crate) async fn peek(&self, check: UsageCheck<'_>) -> UsageDecision {
        let key = check.token.to_string();
        self.records
            .read(&key, |record| evaluate(record, &check))
            .await
    }

    /// 判定并在放行时原子地落账。
    pub(crate) async fn check_and_record_at(
        &self,
        check: UsageCheck<'_>,
        now: u64,
    ) -> UsageDecision {
        let retention_sec = self.retention_sec;
        self.records
            .update(|records| {
                let decision = evaluate(records.get(check.token), &check);
                let UsageDecision::Allow { kind, .. } = decision else {
                    return decision;
                };
                match kind {
                    UseKind::FirstUse => {
                        let mut record = UsageRecord {
                            binding: Binding::Bound {
                                device_id: check.device_id.to_string(),
                            },
                            use_count: 1,
                            max_uses: check.max_uses.max(1),
                            first_seen_at: now,
                            last_used_at: now,
                            ip_history: Vec::new(),
                            transferred_to_device_id: None,
                            token_expires_at: check.token_expires_at,
                            retention_sec,
                        };
                        record.push_address(check.client_address);
                        records.insert(check.token.to_string(), record);
                    }
                    UseKind::RepeatUse => {
                        if let Some(record) = records.get_mut(check.token) {
                            record.use_count = record.use_count.saturating_add(1);
                            record.last_used_at = now;
                            record.push_address(check.client_address);
                        }
                    }
                    UseKind::Transferred => {
                        if let Some(record) = records.get_mut(check.token) {
                            if let Binding::PendingTransfer { from, code, .. } = &record.binding {
                                info!(
                                    "usage rebound: {from} -> {} via code {code} (bound since {})",
                                    check.device_id, record.first_seen_at
                                );
                            }
                            if let Some(previous) = &record.transferred_to_device_id {
                                debug!("token transferred again, previous target {previous}");
                            }
                            record.binding = Binding::Bound {
                                device_id: check.device_id.to_string(),
                            };
                            record.use_count = record.use_count.saturating_add(1);
                            record.last_used_at = now;
                            record.transferred_to_device_id = Some(check.device_id.to_string());
                            record.push_address(check.client_address);
                        }
                    }
                }
                debug!("usage recorded: {kind:?}");
                decision
            })
            .await
    }

    /// 换绑码兑换成功后调用：`Bound(from) -> PendingTransfer{from, to}`。
    pub(crate) async fn authorize_transfer(
        &self,
        token: &str,
        from: &str,
        to: &str,
        code: &str,
    ) -> Result<(), TransferAuthError> {
        if from == to {
            return Err(TransferAuthError::SameDevice);
        }
        self.records
            .update(|records| {
                let record = records.get_mut(token).ok_or(TransferAuthError::NotBound)?;
                if record.binding.device_id() != from {
                    return Err(TransferAuthError::DeviceMismatch);
                }
                record.binding = Binding::PendingTransfer {
                    from: from.to_string(),
                    to: to.to_string(),
                    code: code.to_string(),
                };
                Ok(())
            })
            .await
    }

    /// token 当前绑定设备。
    pub(crate) async fn bound_device(&self, token: &str) -> Option<String> {
        let key = token.to_string();
        self.records
            .read(&key, |record| {
                record.map(|record| record.binding.device_id().to_string())
            })
            .await
    }
}

/// 纯判定逻辑，不修改记录。
fn evaluate(record: Option<&UsageRecord>, check: &UsageCheck<'_>) -> UsageDecision {
    let Some(record) = record else {
        let bind_to = check.expected_device_id.unwrap_or(check.device_id);
        if bind_to != check.device_id {
            // 预绑定设备尚未使用，不存在可迁移的绑定。
            return UsageDecision::DenyDeviceMismatch {
                allow_transfer: false,
            };
        }
        return UsageDecision::Allow {
            kind: UseKind::FirstUse,
            use_count: 1,
        };
    };

    let kind = match &record.binding {
        Binding::PendingTransfer { to, .. } if to == check.device_id => UseKind::Transferred,
        binding if binding.device_id() == check.device_id => UseKind::RepeatUse,
        Binding::PendingTransfer { .. } => {
            return UsageDecision::DenyDeviceMismatch {
                allow_transfer: false,
            };
        }
        Binding::Bound { .. } => {
            return UsageDecision::DenyDeviceMismatch {
                allow_transfer: true,
            };
        }
    };
    if record.use_count >= record.max_uses {
        return UsageDecision::DenyMaxUsesExceeded {
            use_count: record.use_count,
            max_uses: record.max_uses,
        };
    }
    UsageDecision::Allow {
        kind,
        use_count: record.use_count.saturating_add(1),
    }
}
