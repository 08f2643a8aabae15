//! 链接签发：校验资源 URL，签发 token，加密载荷并登记确认 token。

use axum::http::StatusCode;
use cl_shared_protocol::{IssueLinkData, IssueLinkRequest, normalize_device_id, unix_to_rfc3339};
use tracing::{error, info};
use url::Url;
use uuid::Uuid;

use crate::{
    api::error::ApiError,
    link::{
        payload::{LINK_PAYLOAD_VERSION, LinkKey, LinkPayload},
        token::resource_id_for,
    },
    state::AppState,
};

/// 资源 URL 只允许 http/https。
pub(crate) fn validate_resource_url(raw: &str) -> Result<String, ApiError> {
    let raw = raw.trim();
    let parsed = Url::parse(raw).map_err(|_| {
        ApiError::bad_request("INVALID_RESOURCE_URL", "resourceUrl 不是合法 URL")
    })?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ApiError::bad_request(
            "INVALID_RESOURCE_URL",
            "resourceUrl 仅支持 http/https",
        ));
    }
    Ok(raw.to_string())
}

/// 去空白后的可选客户端地址。
pub(crate) fn normalize_client_address(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|value| !value.is_empty())
}

impl AppState {
    /// 签发一条加密链接。
    pub(crate) async fn issue_link_at(
        &self,
        req: &IssueLinkRequest,
        now: u64,
    ) -> Result<IssueLinkData, ApiError> {
        let resource_url = validate_resource_url(&req.resource_url)?;
        let device_id = req.device_id.as_deref().and_then(normalize_device_id);
        let client_address = normalize_client_address(req.client_address.as_deref());
        let max_uses = req
            .max_uses
            .filter(|value| *value > 0)
            .unwrap_or(self.config.default_max_uses);
        let ttl_sec = self.config.link_ttl_sec;

        let token = self
            .tokens
            .mint_at(
                self.config.token_version,
                &resource_id_for(&resource_url),
                device_id.as_deref().unwrap_or_default(),
                ttl_sec,
                client_address,
                now,
            )
            .map_err(|err| {
                error!("mint link token failed: {err:?}");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "TOKEN_MINT_FAILED",
                    "链接 token 签发失败",
                    "请稍后重试",
                )
            })?;

        let expires_at = now.saturating_add(ttl_sec);
        let payload = LinkPayload {
            v: LINK_PAYLOAD_VERSION,
            url: resource_url,
            exp: expires_at,
            nonce: Uuid::new_v4().simple().to_string(),
            tok: token.clone(),
            did: device_id,
            max: max_uses,
            gate: req.interstitial,
        };
        let plaintext = payload.encode().map_err(|err| {
            error!("encode link payload failed: {err}");
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "LINK_ENCODE_FAILED",
                "链接载荷编码失败",
                "请稍后重试",
            )
        })?;
        let sealed = self.cipher.encrypt(&plaintext);
        let key = LinkKey::new(&sealed.iv, &sealed.ciphertext);
        let path = key.path();

        if req.interstitial {
            self.temp_links
                .mint_at(key, payload.did.as_deref(), client_address, now)
                .await;
        }

        info!(
            "link issued: max_uses={max_uses}, interstitial={}, prebound={}",
            req.interstitial,
            payload.did.is_some()
        );
        Ok(IssueLinkData {
            link: format!("{}{path}", self.config.public_base_url),
            path,
            iv: sealed.iv,
            ciphertext: sealed.ciphertext,
            token,
            expires_at: unix_to_rfc3339(expires_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use cl_shared_protocol::IssueLinkRequest;

    use super::validate_resource_url;
    use crate::{
        link::payload::{LinkKey, LinkPayload},
        state::test_support::test_state,
    };

    const NOW: u64 = 1_700_000_000;

    fn request(url: &str) -> IssueLinkRequest {
        IssueLinkRequest {
            resource_url: url.to_string(),
            device_id: Some(" D1 ".to_string()),
            client_address: Some("10.0.0.1".to_string()),
            max_uses: None,
            interstitial: false,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn issued_link_hides_the_resource_url() {
        let state = test_state();
        let data = state
            .issue_link_at(&request("https://x/app.ipa"), NOW)
            .await
            .expect("issue link");

        assert_eq!(data.path, format!("/v1/link/{}/{}", data.iv, data.ciphertext));
        assert!(data.link.starts_with("http://127.0.0.1:18090/v1/link/"));
        assert!(!data.link.contains("app.ipa"));
        assert!(data.token.starts_with("lgt_v2."));
        assert_eq!(data.expires_at, "2023-11-14T22:43:20Z");

        let plaintext = state
            .cipher
            .decrypt(&data.ciphertext, &data.iv)
            .expect("decrypt");
        let payload = LinkPayload::decode(&plaintext).expect("payload");
        assert_eq!(payload.url, "https://x/app.ipa");
        assert_eq!(payload.did.as_deref(), Some("D1"));
        assert_eq!(payload.max, 2);
        assert_eq!(payload.exp, NOW + 1800);
        assert_eq!(state.store_sizes().await.temp_links, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn only_interstitial_links_register_a_confirmation_slot() {
        let state = test_state();
        let mut req = request("https://x/app.ipa");
        req.interstitial = true;
        let data = state.issue_link_at(&req, NOW).await.expect("issue link");
        assert_eq!(state.store_sizes().await.temp_links, 1);

        let key = LinkKey::new(&data.iv, &data.ciphertext);
        let owner = state
            .temp_links
            .store()
            .read(&key, |record| record.and_then(|record| record.device_id.clone()))
            .await;
        assert_eq!(owner.as_deref(), Some("D1"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn same_url_issues_distinct_links() {
        let state = test_state();
        let first = state
            .issue_link_at(&request("https://x/app.ipa"), NOW)
            .await
            .expect("first");
        let second = state
            .issue_link_at(&request("https://x/app.ipa"), NOW)
            .await
            .expect("second");
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.token, second.token);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn non_http_urls_are_rejected() {
        let state = test_state();
        let err = state
            .issue_link_at(&request("ftp://x/app.ipa"), NOW)
            .await
            .expect_err("ftp rejected");
        assert_eq!(err.code, "INVALID_RESOURCE_URL");
        assert!(validate_resource_url("not a url").is_err());
        assert_eq!(
            validate_resource_url(" https://x/a.ipa ").ok().as_deref(),
            Some("https://x/a.ipa")
        );
    }
}
