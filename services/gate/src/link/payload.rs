//! 加密前的链接载荷与对外链接路径。

use serde::{Deserialize, Serialize};

/// 当前载荷结构版本。
pub(crate) const LINK_PAYLOAD_VERSION: u8 = 1;

/// 链接载荷（加密后才离开服务）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LinkPayload {
    pub(crate) v: u8,
    /// 原始资源 URL。
    pub(crate) url: String,
    pub(crate) exp: u64,
    pub(crate) nonce: String,
    /// 安全 token（使用台账的主键）。
    pub(crate) tok: String,
    /// 签发时指定的设备。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) did: Option<String>,
    /// 单链接最大使用次数。
    pub(crate) max: u32,
    /// 是否要求先经过确认页。
    #[serde(default)]
    pub(crate) gate: bool,
}

impl LinkPayload {
    pub(crate) fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 解码载荷，未知版本视为格式错误。
    pub(crate) fn decode(raw: &str) -> Option<Self> {
        let payload: Self = serde_json::from_str(raw).ok()?;
        (payload.v == LINK_PAYLOAD_VERSION && !payload.url.is_empty() && payload.max > 0)
            .then_some(payload)
    }
}

/// 一条已签发链接的标识（`(iv, ciphertext)`）。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct LinkKey {
    pub(crate) iv: String,
    pub(crate) ciphertext: String,
}

impl LinkKey {
    pub(crate) fn new(iv: &str, ciphertext: &str) -> Self {
        Self {
            iv: iv.trim().to_ascii_lowercase(),
            ciphertext: ciphertext.trim().to_ascii_lowercase(),
        }
    }

    /// 对外路径：`/v1/link/{iv}/{ciphertext}`。
    pub(crate) fn path(&self) -> String {
        format!("/v1/link/{}/{}", self.iv, self.ciphertext)
    }
}
