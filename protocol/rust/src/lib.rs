// 文件职责：
// 1) 定义 gate 服务与控制器/客户端共用的请求、响应数据结构。
// 2) 提供时间戳格式化、设备 ID 归一化等跨端一致的基础函数。
// 3) 作为 Rust 侧协议唯一代码源，供其他服务复用。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 设备 ID 最大长度（字符）。
pub const MAX_DEVICE_ID_LEN: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueLinkRequest {
    // 原始安装清单 URL（敏感，不回显给客户端）。
    pub resource_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    // 预绑定设备（可选）。
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    // 签发时客户端地址（可选）。
    pub client_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    // 单链接最大使用次数（可选，缺省走服务端策略）。
    pub max_uses: Option<u32>,
    #[serde(default)]
    // 是否要求先经过确认页。
    pub interstitial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueLinkData {
    // 完整可访问链接。
    pub link: String,
    // 链接路径（`/v1/link/{iv}/{ciphertext}`）。
    pub path: String,
    // 十六进制 IV。
    pub iv: String,
    // 十六进制密文。
    pub ciphertext: String,
    // 链接安全 token（申请换绑时使用）。
    pub token: String,
    // 链接过期时间（RFC3339）。
    pub expires_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveLinkRequest {
    // 十六进制 IV。
    pub iv: String,
    // 十六进制密文。
    pub ciphertext: String,
    // 访问设备。
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    // 访问客户端地址（可选）。
    pub client_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    // 附加证明：6 位换绑码或确认页 token（可选）。
    pub proof: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResolveLinkData {
    // 是否放行。
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    // 放行后的原始资源 URL。
    pub resource_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    // 拒绝原因。
    pub reason: Option<String>,
    // 是否需要先经过确认页。
    pub requires_interstitial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    // 确认页 token（requiresInterstitial 时返回）。
    pub confirm_token: Option<String>,
    // 是否可以申请换绑码。
    pub can_request_transfer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    // 申请换绑时需携带的链接 token。
    pub transfer_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    // 当前已使用次数。
    pub use_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionRequest {
    // 应用 ID。
    pub app_id: String,
    // 设备 ID。
    pub device_id: String,
    // 会话结束时交付的资源 URL。
    pub resource_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionData {
    // 会话 ID。
    pub session_id: String,
    // 会话 token。
    pub token: String,
    // 会话过期时间（RFC3339）。
    pub expires_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeSessionRequest {
    // 会话 ID。
    pub session_id: String,
    // 会话 token。
    pub token: String,
    // 设备 ID。
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeSessionData {
    // 会话绑定的资源 URL。
    pub resource_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTransferRequest {
    // 链接 token。
    pub token: String,
    // 当前绑定设备。
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTransferData {
    // 6 位换绑码。
    pub code: String,
    // 换绑码过期时间（RFC3339）。
    pub expires_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemTransferRequest {
    // 6 位换绑码。
    pub code: String,
    // 链接 token。
    pub token: String,
    // 新设备 ID。
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemTransferData {
    // 是否兑换成功。
    pub valid: bool,
    // 换绑后的设备 ID。
    pub device_id: String,
}

/// unix 秒转 RFC3339；越界时回退到 epoch。
pub fn unix_to_rfc3339(secs: u64) -> String {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX);
    DateTime::<Utc>::from_timestamp(secs, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// 归一化设备 ID：去空白并截断长度，空串返回 None。
pub fn normalize_device_id(raw: &str) -> Option<String> {
    let normalized = raw.trim();
    if normalized.is_empty() {
        return None;
    }
    Some(normalized.chars().take(MAX_DEVICE_ID_LEN).collect())
}

#[cfg(test)]
mod tests {
    use super::{
        ResolveLinkData, ResolveLinkRequest, normalize_device_id, unix_to_rfc3339,
    };

    #[test]
    fn resolve_request_uses_camel_case_and_optional_proof() {
        let raw = r#"{"iv":"00","ciphertext":"ff","deviceId":"D1"}"#;
        let req: ResolveLinkRequest = serde_json::from_str(raw).expect("decode request");
        assert_eq!(req.device_id, "D1");
        assert!(req.proof.is_none());
        assert!(req.client_address.is_none());
    }

    #[test]
    fn resolve_data_omits_empty_optionals() {
        let data = ResolveLinkData {
            valid: true,
            resource_url: Some("https://x/app.ipa".to_string()),
            ..Default::default()
        };
        let encoded = serde_json::to_string(&data).expect("encode data");
        assert!(encoded.contains("\"resourceUrl\""));
        assert!(encoded.contains("\"requiresInterstitial\":false"));
        assert!(!encoded.contains("confirmToken"));
        assert!(!encoded.contains("reason"));
    }

    #[test]
    fn device_id_is_trimmed_and_bounded() {
        assert_eq!(normalize_device_id("  D1 ").as_deref(), Some("D1"));
        assert!(normalize_device_id("   ").is_none());
        let long = "x".repeat(300);
        assert_eq!(normalize_device_id(&long).map(|v| v.len()), Some(128));
    }

    #[test]
    fn unix_seconds_format_as_utc() {
        assert_eq!(unix_to_rfc3339(0), "1970-01-01T00:00:00Z");
        assert_eq!(unix_to_rfc3339(86_400), "1970-01-02T00:00:00Z");
    }
}
