//! Gate 共享状态：密钥材料与四类限时存储句柄。

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    config::GateConfig,
    ledger::UsageLedger,
    link::{cipher::LinkCipher, temp::TempLinkStore, token::TokenCodec},
    session::SessionHandshake,
    transfer::TransferFlow,
};

/// Gate 共享状态，克隆只复制句柄。
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) config: Arc<GateConfig>,
    pub(crate) cipher: LinkCipher,
    pub(crate) tokens: TokenCodec,
    pub(crate) ledger: UsageLedger,
    pub(crate) transfers: TransferFlow,
    pub(crate) sessions: SessionHandshake,
    pub(crate) temp_links: TempLinkStore,
}

/// 一轮清扫的结果。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SweepReport {
    pub(crate) usage: usize,
    pub(crate) transfer_codes: usize,
    pub(crate) sessions: usize,
    pub(crate) temp_links: usize,
}

impl SweepReport {
    pub(crate) fn total(&self) -> usize {
        self.usage + self.transfer_codes + self.sessions + self.temp_links
    }
}

/// 各存储当前记录数（调试接口）。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoreSizes {
    pub(crate) usage: usize,
    pub(crate) transfer_codes: usize,
    pub(crate) sessions: usize,
    pub(crate) temp_links: usize,
}

impl AppState {
    pub(crate) fn new(config: GateConfig) -> Self {
        if config.allow_signature_mismatch {
            warn!(
                "signature mismatch downgrade is ENABLED; forged links will be accepted, never use this in production"
            );
        }
        Self {
            cipher: LinkCipher::new(config.cipher_key),
            tokens: TokenCodec::new(&config.signing_secret),
            ledger: UsageLedger::new(config.ledger_retention_sec),
            transfers: TransferFlow::new(config.transfer_code_ttl_sec),
            sessions: SessionHandshake::new(config.session_ttl_sec),
            temp_links: TempLinkStore::new(config.temp_link_ttl_sec),
            config: Arc::new(config),
        }
    }

    /// 依次清扫各存储；每次只持有一把锁。
    pub(crate) async fn sweep_expired_at(&self, now: u64) -> SweepReport {
        let report = SweepReport {
            usage: self.ledger.store().sweep(now).await,
            transfer_codes: self.transfers.store().sweep(now).await,
            sessions: self.sessions.store().sweep(now).await,
            temp_links: self.temp_links.store().sweep(now).await,
        };
        if report.total() > 0 {
            debug!(
                "sweep removed {} records ({}={}, {}={}, {}={}, {}={})",
                report.total(),
                self.ledger.store().name(),
                report.usage,
                self.transfers.store().name(),
                report.transfer_codes,
                self.sessions.store().name(),
                report.sessions,
                self.temp_links.store().name(),
                report.temp_links
            );
        }
        report
    }

    /// 调试快照：各存储记录数。
    pub(crate) async fn store_sizes(&self) -> StoreSizes {
        StoreSizes {
            usage: self.ledger.store().len().await,
            transfer_codes: self.transfers.store().len().await,
            sessions: self.sessions.store().len().await,
            temp_links: self.temp_links.store().len().await,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::AppState;
    use crate::config::GateConfig;

    /// 测试用签名密钥。
    pub(crate) const TEST_SECRET: &str = "test-signing-secret-0123456789";

    pub(crate) fn test_state() -> AppState {
        AppState::new(GateConfig::with_keys([42u8; 32], TEST_SECRET))
    }

    pub(crate) fn lenient_state() -> AppState {
        let mut config = GateConfig::with_keys([42u8; 32], TEST_SECRET);
        config.allow_signature_mismatch = true;
        AppState::new(config)
    }
}
