//! HTTP 路由处理函数：只做请求解析与响应包裹，业务判定在 `AppState` 上完成。

use axum::{Json, extract::State};
use cl_shared_protocol::{
    ConsumeSessionData, ConsumeSessionRequest, IssueLinkData, IssueLinkRequest, OpenSessionData,
    OpenSessionRequest, RedeemTransferData, RedeemTransferRequest, RequestTransferData,
    RequestTransferRequest, ResolveLinkData, ResolveLinkRequest,
};

use crate::{
    api::{
        error::ApiError,
        response::{ApiReply, ok_response, reply},
    },
    link::resolve::{LinkDenial, ResolveOutcome},
    state::{AppState, StoreSizes},
    store::unix_now,
};

/// 签发链接接口。
pub(crate) async fn issue_link_handler(
    State(state): State<AppState>,
    Json(req): Json<IssueLinkRequest>,
) -> ApiReply<IssueLinkData> {
    reply(
        state.issue_link_at(&req, unix_now()).await,
        "链接已签发",
        "请将链接发送给目标设备",
    )
}

/// 解析链接接口：拒绝时也回传 `data`，便于客户端引导换绑。
pub(crate) async fn resolve_link_handler(
    State(state): State<AppState>,
    Json(req): Json<ResolveLinkRequest>,
) -> ApiReply<ResolveLinkData> {
    match state.resolve_link_at(&req, unix_now()).await {
        Ok(outcome) => resolve_reply(outcome),
        Err(err) => err.into_response(),
    }
}

fn resolve_reply(outcome: ResolveOutcome) -> ApiReply<ResolveLinkData> {
    match outcome {
        ResolveOutcome::Granted {
            resource_url,
            use_count,
            ..
        } => ok_response(
            "链接有效",
            "",
            ResolveLinkData {
                valid: true,
                resource_url: Some(resource_url),
                use_count: Some(use_count),
                ..Default::default()
            },
        ),
        ResolveOutcome::Interstitial { confirm_token } => ok_response(
            "需要确认后继续",
            "请在确认页提交 confirmToken",
            ResolveLinkData {
                requires_interstitial: true,
                confirm_token: Some(confirm_token),
                ..Default::default()
            },
        ),
        ResolveOutcome::Denied(denial) => {
            let mut data = ResolveLinkData {
                reason: Some(denial.reason().to_string()),
                ..Default::default()
            };
            match &denial {
                LinkDenial::DeviceMismatch {
                    token,
                    can_request_transfer,
                } => {
                    data.can_request_transfer = *can_request_transfer;
                    data.transfer_token = Some(token.clone());
                }
                LinkDenial::Exhausted { use_count, .. } => data.use_count = Some(*use_count),
                _ => {}
            }
            ApiError::from(&denial).into_response_with(Some(data))
        }
    }
}

/// 申请换绑码接口。
pub(crate) async fn request_transfer_handler(
    State(state): State<AppState>,
    Json(req): Json<RequestTransferRequest>,
) -> ApiReply<RequestTransferData> {
    reply(
        state.request_transfer_at(&req, unix_now()).await,
        "换绑码已签发",
        "请在新设备上输入换绑码",
    )
}

/// 兑换换绑码接口。
pub(crate) async fn redeem_transfer_handler(
    State(state): State<AppState>,
    Json(req): Json<RedeemTransferRequest>,
) -> ApiReply<RedeemTransferData> {
    reply(
        state.redeem_transfer_at(&req, unix_now()).await,
        "换绑成功",
        "请在新设备上重新打开链接",
    )
}

/// 打开会话接口。
pub(crate) async fn open_session_handler(
    State(state): State<AppState>,
    Json(req): Json<OpenSessionRequest>,
) -> ApiReply<OpenSessionData> {
    reply(
        state.open_session_at(&req, unix_now()).await,
        "会话已创建",
        "请在有效期内完成会话",
    )
}

/// 消费会话接口。
pub(crate) async fn consume_session_handler(
    State(state): State<AppState>,
    Json(req): Json<ConsumeSessionRequest>,
) -> ApiReply<ConsumeSessionData> {
    reply(
        state.consume_session_at(&req, unix_now()).await,
        "会话已完成",
        "",
    )
}

/// 健康检查接口。
pub(crate) async fn healthz() -> &'static str {
    "ok"
}

/// 调试接口：查看各存储记录数。
pub(crate) async fn debug_stores(State(state): State<AppState>) -> Json<StoreSizes> {
    Json(state.store_sizes().await)
}
