//! 链接解析：解密、过期、签名、确认页、换绑码与使用台账依次判定。
//!
//! 判定顺序固定：格式 → 过期 → 签名 → 确认 token → 台账（设备绑定 → 使用次数）。
//! 过期优先于其他所有失败原因。

use cl_shared_protocol::{ResolveLinkRequest, normalize_device_id};
use tracing::{debug, info, warn};

use crate::{
    api::error::ApiError,
    ledger::{TransferAuthError, UsageCheck, UsageDecision, UseKind},
    link::{
        issue::normalize_client_address,
        payload::{LinkKey, LinkPayload},
        temp::ConfirmError,
        token::{is_expired, resource_id_for},
    },
    state::AppState,
    transfer::{TransferError, TransferGrant, looks_like_transfer_code},
};

/// 解析结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResolveOutcome {
    /// 放行，返回原始资源 URL。
    Granted {
        resource_url: String,
        kind: UseKind,
        use_count: u32,
    },
    /// 需要先经过确认页，携带新签发的确认 token。
    Interstitial { confirm_token: String },
    Denied(LinkDenial),
}

/// 拒绝原因。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkDenial {
    Malformed,
    Expired,
    SignatureInvalid,
    /// 绑定到其他设备；回传 token 以便申请换绑码。
    DeviceMismatch {
        token: String,
        can_request_transfer: bool,
    },
    Exhausted {
        use_count: u32,
        max_uses: u32,
    },
    Confirmation(ConfirmError),
    Transfer(TransferError),
    /// 换绑码有效，但台账绑定已不再是签发换绑码时的设备。
    TransferNotBound,
}

impl LinkDenial {
    pub(crate) fn code(&self) -> &'static str {
        match self {
            Self::Malformed => "LINK_MALFORMED",
            Self::Expired => "LINK_EXPIRED",
            Self::SignatureInvalid => "LINK_SIGNATURE_INVALID",
            Self::DeviceMismatch { .. } => "LINK_DEVICE_MISMATCH",
            Self::Exhausted { .. } => "LINK_EXHAUSTED",
            Self::Confirmation(err) => err.code(),
            Self::Transfer(err) => err.code(),
            Self::TransferNotBound => "TRANSFER_NOT_BOUND",
        }
    }

    pub(crate) fn reason(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed link",
            Self::Expired => "link expired",
            Self::SignatureInvalid => "signature invalid",
            Self::DeviceMismatch { .. } => "bound to another device",
            Self::Exhausted { .. } => "link exhausted: max uses exceeded",
            Self::Confirmation(err) => err.reason(),
            Self::Transfer(err) => err.reason(),
            Self::TransferNotBound => "transfer does not match current binding",
        }
    }

    fn from_decision(decision: UsageDecision, token: &str) -> Option<Self> {
        match decision {
            UsageDecision::Allow { .. } => None,
            UsageDecision::DenyDeviceMismatch { allow_transfer } => Some(Self::DeviceMismatch {
                token: token.to_string(),
                can_request_transfer: allow_transfer,
            }),
            UsageDecision::DenyMaxUsesExceeded {
                use_count,
                max_uses,
            } => Some(Self::Exhausted {
                use_count,
                max_uses,
            }),
        }
    }
}

/// 附加证明：6 位数字为换绑码，其余视为确认 token。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Proof<'a> {
    Absent,
    TransferCode(&'a str),
    Confirmation(&'a str),
}

impl<'a> Proof<'a> {
    fn parse(raw: Option<&'a str>) -> Self {
        match raw.map(str::trim).filter(|value| !value.is_empty()) {
            None => Self::Absent,
            Some(value) if looks_like_transfer_code(value) => Self::TransferCode(value),
            Some(value) => Self::Confirmation(value),
        }
    }
}

/// 可以用换绑码覆盖的软拒绝。
fn transferable(decision: UsageDecision) -> bool {
    matches!(
        decision,
        UsageDecision::DenyDeviceMismatch {
            allow_transfer: true
        }
    )
}

impl AppState {
    /// 解析并校验一条链接。
    pub(crate) async fn resolve_link_at(
        &self,
        req: &ResolveLinkRequest,
        now: u64,
    ) -> Result<ResolveOutcome, ApiError> {
        let device_id = normalize_device_id(&req.device_id)
            .ok_or_else(|| ApiError::bad_request("MISSING_DEVICE_ID", "deviceId 不能为空"))?;
        let client_address = normalize_client_address(req.client_address.as_deref());
        let key = LinkKey::new(&req.iv, &req.ciphertext);

        let outcome = self
            .evaluate_link(&key, &device_id, client_address, req.proof.as_deref(), now)
            .await;
        match &outcome {
            ResolveOutcome::Granted {
                kind, use_count, ..
            } => info!("link granted for device {device_id}: {kind:?}, use {use_count}"),
            ResolveOutcome::Interstitial { .. } => {
                debug!("link awaiting confirmation for device {device_id}")
            }
            ResolveOutcome::Denied(denial) => {
                info!("link denied for device {device_id}: {}", denial.code())
            }
        }
        Ok(outcome)
    }

    async fn evaluate_link(
        &self,
        key: &LinkKey,
        device_id: &str,
        client_address: Option<&str>,
        proof: Option<&str>,
        now: u64,
    ) -> ResolveOutcome {
        let Some(payload) = self
            .cipher
            .decrypt(&key.ciphertext, &key.iv)
            .ok()
            .and_then(|plaintext| LinkPayload::decode(&plaintext))
        else {
            return ResolveOutcome::Denied(LinkDenial::Malformed);
        };
        if now > payload.exp {
            return ResolveOutcome::Denied(LinkDenial::Expired);
        }

        let token = match self.tokens.parse(&payload.tok) {
            Ok(token) => token,
            Err(err) => {
                warn!("link token unparsable: {err:?}");
                return ResolveOutcome::Denied(LinkDenial::SignatureInvalid);
            }
        };
        if is_expired(&token.claims, now) {
            return ResolveOutcome::Denied(LinkDenial::Expired);
        }
        let signed_ok = self.tokens.verify_signature(
            &token,
            &resource_id_for(&payload.url),
            payload.did.as_deref().unwrap_or_default(),
        );
        if !signed_ok {
            if !self.config.allow_signature_mismatch {
                warn!("link signature mismatch rejected");
                return ResolveOutcome::Denied(LinkDenial::SignatureInvalid);
            }
            warn!("link signature mismatch accepted by debug switch");
        }

        let proof = Proof::parse(proof);
        let check = UsageCheck {
            token: &payload.tok,
            expected_device_id: payload.did.as_deref(),
            device_id,
            client_address,
            max_uses: payload.max,
            token_expires_at: payload.exp,
        };

        match proof {
            Proof::Confirmation(confirm_token) if payload.gate => {
                match self
                    .temp_links
                    .confirm_at(key, confirm_token, device_id, now)
                    .await
                {
                    Ok(record) => {
                        if record.client_address.as_deref() != client_address {
                            debug!("confirmation presented from a different address");
                        }
                        debug!(
                            "confirmation accepted {}s after mint",
                            now.saturating_sub(record.created_at)
                        );
                    }
                    Err(err) => return ResolveOutcome::Denied(LinkDenial::Confirmation(err)),
                }
            }
            _ if payload.gate => {
                // 确认页环节只预判，不消耗次数。
                let mut decision = self.ledger.peek(check).await;
                if let Proof::TransferCode(code) = proof
                    && transferable(decision)
                {
                    if let Err(denial) = self
                        .apply_transfer_code(code, &payload.tok, device_id, now)
                        .await
                    {
                        return ResolveOutcome::Denied(denial);
                    }
                    decision = self.ledger.peek(check).await;
                }
                if let Some(denial) = LinkDenial::from_decision(decision, &payload.tok) {
                    return ResolveOutcome::Denied(denial);
                }
                let confirm_token = self
                    .temp_links
                    .mint_at(key.clone(), Some(device_id), client_address, now)
                    .await;
                return ResolveOutcome::Interstitial { confirm_token };
            }
            // 普通链接不要求确认，附带的确认 token 忽略。
            _ => {}
        }

        let mut decision = self.ledger.check_and_record_at(check, now).await;
        if let Proof::TransferCode(code) = proof
            && transferable(decision)
        {
            if let Err(denial) = self
                .apply_transfer_code(code, &payload.tok, device_id, now)
                .await
            {
                return ResolveOutcome::Denied(denial);
            }
            decision = self.ledger.check_and_record_at(check, now).await;
        }

        match decision {
            UsageDecision::Allow { kind, use_count } => ResolveOutcome::Granted {
                resource_url: payload.url,
                kind,
                use_count,
            },
            denied => match LinkDenial::from_decision(denied, &payload.tok) {
                Some(denial) => ResolveOutcome::Denied(denial),
                None => ResolveOutcome::Denied(LinkDenial::Malformed),
            },
        }
    }

    /// 兑换换绑码并让台账接受新设备一次。
    pub(crate) async fn apply_transfer_code(
        &self,
        code: &str,
        token: &str,
        new_device_id: &str,
        now: u64,
    ) -> Result<TransferGrant, LinkDenial> {
        let grant = self
            .transfers
            .redeem_at(code, token, new_device_id, now)
            .await
            .map_err(LinkDenial::Transfer)?;
        self.ledger
            .authorize_transfer(
                token,
                &grant.original_device_id,
                &grant.new_device_id,
                &grant.code,
            )
            .await
            .map_err(|err| {
                warn!("transfer authorization rejected: {err:?}");
                match err {
                    TransferAuthError::NotBound | TransferAuthError::DeviceMismatch => {
                        LinkDenial::TransferNotBound
                    }
                    TransferAuthError::SameDevice => {
                        LinkDenial::Transfer(TransferError::SameDevice)
                    }
                }
            })?;
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use cl_shared_protocol::{IssueLinkData, IssueLinkRequest, ResolveLinkRequest};

    use super::{LinkDenial, Proof, ResolveOutcome};
    use crate::{
        ledger::UseKind,
        link::{
            payload::{LINK_PAYLOAD_VERSION, LinkPayload},
            temp::ConfirmError,
            token::{TokenVersion, resource_id_for},
        },
        state::{
            AppState,
            test_support::{lenient_state, test_state},
        },
        transfer::TransferError,
    };

    const NOW: u64 = 1_700_000_000;
    const URL: &str = "https://x/app.ipa";

    async fn issue(state: &AppState, device_id: Option<&str>, interstitial: bool) -> IssueLinkData {
        state
            .issue_link_at(
                &IssueLinkRequest {
                    resource_url: URL.to_string(),
                    device_id: device_id.map(str::to_string),
                    client_address: None,
                    max_uses: None,
                    interstitial,
                },
                NOW,
            )
            .await
            .expect("issue link")
    }

    async fn resolve(
        state: &AppState,
        link: &IssueLinkData,
        device_id: &str,
        proof: Option<&str>,
        now: u64,
    ) -> ResolveOutcome {
        state
            .resolve_link_at(
                &ResolveLinkRequest {
                    iv: link.iv.clone(),
                    ciphertext: link.ciphertext.clone(),
                    device_id: device_id.to_string(),
                    client_address: Some("10.0.0.1".to_string()),
                    proof: proof.map(str::to_string),
                },
                now,
            )
            .await
            .expect("resolve link")
    }

    fn granted_count(outcome: &ResolveOutcome) -> Option<u32> {
        match outcome {
            ResolveOutcome::Granted {
                resource_url,
                use_count,
                ..
            } if resource_url == URL => Some(*use_count),
            _ => None,
        }
    }

    /// 手工拼装一条由本服务密钥加密、但签名不匹配的链接。
    async fn forged_link(state: &AppState) -> IssueLinkData {
        let genuine = issue(state, Some("D1"), false).await;
        // 用 D1 签发的 token 冒充绑定到 D9 的链接。
        let payload = LinkPayload {
            v: LINK_PAYLOAD_VERSION,
            url: URL.to_string(),
            exp: NOW + 1800,
            nonce: "n".to_string(),
            tok: genuine.token.clone(),
            did: Some("D9".to_string()),
            max: 2,
            gate: false,
        };
        let sealed = state
            .cipher
            .encrypt(&payload.encode().expect("encode payload"));
        IssueLinkData {
            iv: sealed.iv,
            ciphertext: sealed.ciphertext,
            ..genuine
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn same_device_twice_then_exhausted_then_other_device_denied() {
        let state = test_state();
        let link = issue(&state, None, false).await;

        let first = resolve(&state, &link, "D1", None, NOW + 1).await;
        assert_eq!(granted_count(&first), Some(1));
        let second = resolve(&state, &link, "D1", None, NOW + 2).await;
        assert_eq!(granted_count(&second), Some(2));
        let third = resolve(&state, &link, "D1", None, NOW + 3).await;
        assert_eq!(
            third,
            ResolveOutcome::Denied(LinkDenial::Exhausted {
                use_count: 2,
                max_uses: 2
            })
        );
        if let ResolveOutcome::Denied(denial) = &third {
            assert_eq!(denial.reason(), "link exhausted: max uses exceeded");
        }

        let other = resolve(&state, &link, "D2", None, NOW + 4).await;
        match other {
            ResolveOutcome::Denied(denial @ LinkDenial::DeviceMismatch { .. }) => {
                assert_eq!(denial.reason(), "bound to another device");
                assert_eq!(
                    denial,
                    LinkDenial::DeviceMismatch {
                        token: link.token.clone(),
                        can_request_transfer: true
                    }
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transfer_code_moves_the_binding_to_the_new_device() {
        let state = test_state();
        let link = issue(&state, None, false).await;
        assert!(granted_count(&resolve(&state, &link, "D1", None, NOW).await).is_some());

        let ticket = state
            .transfers
            .request_at(&link.token, "D1", NOW + 1)
            .await
            .expect("ticket");
        let moved = resolve(&state, &link, "D2", Some(&ticket.code), NOW + 2).await;
        // 使用次数随链接累计，换绑不重置。
        assert!(matches!(
            moved,
            ResolveOutcome::Granted {
                kind: UseKind::Transferred,
                use_count: 2,
                ..
            }
        ));
        assert_eq!(state.ledger.bound_device(&link.token).await.as_deref(), Some("D2"));

        // 旧设备被拒，换绑码不能再次使用。
        assert!(matches!(
            resolve(&state, &link, "D1", None, NOW + 3).await,
            ResolveOutcome::Denied(LinkDenial::DeviceMismatch { .. })
        ));
        assert_eq!(
            resolve(&state, &link, "D1", Some(&ticket.code), NOW + 3).await,
            ResolveOutcome::Denied(LinkDenial::Transfer(TransferError::AlreadyUsed))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn bouncing_the_link_between_devices_keeps_one_budget() {
        let state = test_state();
        let link = issue(&state, None, false).await;
        let mut grants = 0;
        let mut owner = "D1";
        assert!(granted_count(&resolve(&state, &link, owner, None, NOW).await).is_some());
        grants += 1;

        for step in 1..=4u64 {
            let next = if owner == "D1" { "D2" } else { "D1" };
            let ticket = state
                .transfers
                .request_at(&link.token, owner, NOW + step)
                .await
                .expect("ticket");
            match resolve(&state, &link, next, Some(&ticket.code), NOW + step).await {
                outcome @ ResolveOutcome::Granted { .. } => {
                    assert!(granted_count(&outcome).is_some());
                    grants += 1;
                    owner = next;
                }
                ResolveOutcome::Denied(LinkDenial::Exhausted {
                    use_count,
                    max_uses,
                }) => {
                    assert_eq!((use_count, max_uses), (2, 2));
                    break;
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(grants, 2);
        assert!(matches!(
            resolve(&state, &link, owner, None, NOW + 10).await,
            ResolveOutcome::Denied(LinkDenial::Exhausted { .. })
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn prebound_link_refuses_other_devices_without_transfer() {
        let state = test_state();
        let link = issue(&state, Some("D1"), false).await;
        assert_eq!(
            resolve(&state, &link, "D2", None, NOW).await,
            ResolveOutcome::Denied(LinkDenial::DeviceMismatch {
                token: link.token.clone(),
                can_request_transfer: false
            })
        );
        assert_eq!(
            granted_count(&resolve(&state, &link, "D1", None, NOW).await),
            Some(1)
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn interstitial_confirmation_is_single_use() {
        let state = test_state();
        let link = issue(&state, None, true).await;

        let ResolveOutcome::Interstitial { confirm_token } =
            resolve(&state, &link, "D1", None, NOW).await
        else {
            panic!("expected interstitial");
        };
        // 确认页环节不消耗次数。
        assert_eq!(state.store_sizes().await.usage, 0);

        let granted = resolve(&state, &link, "D1", Some(&confirm_token), NOW + 1).await;
        assert_eq!(granted_count(&granted), Some(1));
        assert_eq!(
            resolve(&state, &link, "D1", Some(&confirm_token), NOW + 2).await,
            ResolveOutcome::Denied(LinkDenial::Confirmation(ConfirmError::AlreadyUsed))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn confirmation_token_only_works_on_the_device_that_received_it() {
        let state = test_state();
        let link = issue(&state, None, true).await;
        let ResolveOutcome::Interstitial { confirm_token } =
            resolve(&state, &link, "D1", None, NOW).await
        else {
            panic!("expected interstitial");
        };

        assert_eq!(
            resolve(&state, &link, "D2", Some(&confirm_token), NOW + 1).await,
            ResolveOutcome::Denied(LinkDenial::Confirmation(ConfirmError::DeviceMismatch))
        );
        assert_eq!(state.store_sizes().await.usage, 0);
        assert_eq!(state.ledger.bound_device(&link.token).await, None);

        assert_eq!(
            granted_count(&resolve(&state, &link, "D1", Some(&confirm_token), NOW + 2).await),
            Some(1)
        );
        assert_eq!(
            state.ledger.bound_device(&link.token).await.as_deref(),
            Some("D1")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn plain_links_ignore_confirmation_shaped_proofs() {
        let state = test_state();
        let link = issue(&state, None, false).await;
        assert_eq!(
            granted_count(&resolve(&state, &link, "D1", Some("1234567"), NOW).await),
            Some(1)
        );
        assert!(matches!(
            resolve(&state, &link, "D2", Some("lct_typo"), NOW + 1).await,
            ResolveOutcome::Denied(LinkDenial::DeviceMismatch {
                can_request_transfer: true,
                ..
            })
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn interstitial_token_expires_and_can_be_reminted() {
        let state = test_state();
        let link = issue(&state, None, true).await;
        let ResolveOutcome::Interstitial { confirm_token } =
            resolve(&state, &link, "D1", None, NOW).await
        else {
            panic!("expected interstitial");
        };
        assert_eq!(
            resolve(&state, &link, "D1", Some(&confirm_token), NOW + 301).await,
            ResolveOutcome::Denied(LinkDenial::Confirmation(ConfirmError::Expired))
        );
        let ResolveOutcome::Interstitial {
            confirm_token: fresh,
        } = resolve(&state, &link, "D1", None, NOW + 302).await
        else {
            panic!("expected interstitial");
        };
        assert!(granted_count(&resolve(&state, &link, "D1", Some(&fresh), NOW + 303).await).is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn expiry_takes_precedence_over_every_other_failure() {
        let state = test_state();
        let link = issue(&state, None, false).await;
        assert!(granted_count(&resolve(&state, &link, "D1", None, NOW).await).is_some());
        assert!(granted_count(&resolve(&state, &link, "D1", None, NOW).await).is_some());

        // 已耗尽且设备不符，但过期优先。
        assert_eq!(
            resolve(&state, &link, "D2", Some("123456"), NOW + 1801).await,
            ResolveOutcome::Denied(LinkDenial::Expired)
        );
        let forged = forged_link(&state).await;
        assert_eq!(
            resolve(&state, &forged, "D9", None, NOW + 1801).await,
            ResolveOutcome::Denied(LinkDenial::Expired)
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tampered_links_are_malformed_or_unsigned() {
        let state = test_state();
        let link = issue(&state, None, false).await;

        let mut flipped = link.clone();
        let last = flipped.ciphertext.pop().expect("non-empty ciphertext");
        flipped.ciphertext.push(if last == '0' { '1' } else { '0' });
        let outcome = resolve(&state, &flipped, "D1", None, NOW).await;
        assert!(matches!(
            outcome,
            ResolveOutcome::Denied(LinkDenial::Malformed | LinkDenial::SignatureInvalid)
        ));

        let mut garbage = link.clone();
        garbage.iv = "zz".to_string();
        assert_eq!(
            resolve(&state, &garbage, "D1", None, NOW).await,
            ResolveOutcome::Denied(LinkDenial::Malformed)
        );

        let forged = forged_link(&state).await;
        assert_eq!(
            resolve(&state, &forged, "D9", None, NOW).await,
            ResolveOutcome::Denied(LinkDenial::SignatureInvalid)
        );
        assert_eq!(state.store_sizes().await.usage, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lenient_switch_only_downgrades_signature_mismatch() {
        let state = lenient_state();
        let forged = forged_link(&state).await;
        assert!(granted_count(&resolve(&state, &forged, "D9", None, NOW).await).is_some());
        assert_eq!(
            resolve(&state, &forged, "D9", None, NOW + 1801).await,
            ResolveOutcome::Denied(LinkDenial::Expired)
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn basic_tokens_still_verify() {
        let state = test_state();
        let token = state
            .tokens
            .mint_at(TokenVersion::Basic, &resource_id_for(URL), "", 1800, None, NOW)
            .expect("mint basic token");
        let payload = LinkPayload {
            v: LINK_PAYLOAD_VERSION,
            url: URL.to_string(),
            exp: NOW + 1800,
            nonce: "n".to_string(),
            tok: token.clone(),
            did: None,
            max: 1,
            gate: false,
        };
        let sealed = state
            .cipher
            .encrypt(&payload.encode().expect("encode payload"));
        let link = IssueLinkData {
            link: String::new(),
            path: String::new(),
            iv: sealed.iv,
            ciphertext: sealed.ciphertext,
            token,
            expires_at: String::new(),
        };
        assert_eq!(
            granted_count(&resolve(&state, &link, "D1", None, NOW).await),
            Some(1)
        );
        assert!(matches!(
            resolve(&state, &link, "D1", None, NOW).await,
            ResolveOutcome::Denied(LinkDenial::Exhausted { .. })
        ));
    }

    #[test]
    fn proof_shape_decides_its_meaning() {
        assert_eq!(Proof::parse(None), Proof::Absent);
        assert_eq!(Proof::parse(Some("  ")), Proof::Absent);
        assert_eq!(Proof::parse(Some(" 123456 ")), Proof::TransferCode("123456"));
        assert_eq!(
            Proof::parse(Some("lct_abc")),
            Proof::Confirmation("lct_abc")
        );
        assert_eq!(Proof::parse(Some("1234567")), Proof::Confirmation("1234567"));
    }
}
