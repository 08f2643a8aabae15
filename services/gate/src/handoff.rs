//! 换绑码与会话握手的接口级操作：参数归一化、台账前置校验与时间格式化。

use axum::http::StatusCode;
use cl_shared_protocol::{
    ConsumeSessionData, ConsumeSessionRequest, OpenSessionData, OpenSessionRequest,
    RedeemTransferData, RedeemTransferRequest, RequestTransferData, RequestTransferRequest,
    normalize_device_id, unix_to_rfc3339,
};
use tracing::{info, warn};

use crate::{api::error::ApiError, link::issue::validate_resource_url, state::AppState};

fn required_device_id(raw: &str) -> Result<String, ApiError> {
    normalize_device_id(raw)
        .ok_or_else(|| ApiError::bad_request("MISSING_DEVICE_ID", "deviceId 不能为空"))
}

fn required_field<'a>(raw: &'a str, code: &'static str, name: &str) -> Result<&'a str, ApiError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ApiError::bad_request(code, format!("{name} 不能为空")));
    }
    Ok(value)
}

impl AppState {
    /// 当前绑定设备为链接申请换绑码。
    pub(crate) async fn request_transfer_at(
        &self,
        req: &RequestTransferRequest,
        now: u64,
    ) -> Result<RequestTransferData, ApiError> {
        let token = required_field(&req.token, "MISSING_TOKEN", "token")?;
        let device_id = required_device_id(&req.device_id)?;
        match self.ledger.bound_device(token).await {
            None => {
                return Err(ApiError::new(
                    StatusCode::NOT_FOUND,
                    "TRANSFER_TOKEN_UNKNOWN",
                    "链接尚未被任何设备使用",
                    "请先在原设备上打开链接",
                ));
            }
            Some(bound) if bound != device_id => {
                info!("transfer request from non-owner {device_id} rejected");
                return Err(ApiError::new(
                    StatusCode::FORBIDDEN,
                    "TRANSFER_NOT_OWNER",
                    "只有当前绑定设备可以申请换绑码",
                    "请在原设备上申请换绑码",
                ));
            }
            Some(_) => {}
        }

        let ticket = self
            .transfers
            .request_at(token, &device_id, now)
            .await
            .ok_or_else(|| {
                warn!("transfer code space exhausted");
                ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "TRANSFER_CODE_UNAVAILABLE",
                    "暂时无法签发换绑码",
                    "请稍后重试",
                )
            })?;
        Ok(RequestTransferData {
            code: ticket.code,
            expires_at: unix_to_rfc3339(ticket.expires_at),
        })
    }

    /// 新设备兑换换绑码。
    pub(crate) async fn redeem_transfer_at(
        &self,
        req: &RedeemTransferRequest,
        now: u64,
    ) -> Result<RedeemTransferData, ApiError> {
        let token = required_field(&req.token, "MISSING_TOKEN", "token")?;
        let device_id = required_device_id(&req.device_id)?;
        let grant = self
            .apply_transfer_code(&req.code, token, &device_id, now)
            .await
            .map_err(|denial| ApiError::from(&denial))?;
        Ok(RedeemTransferData {
            valid: true,
            device_id: grant.new_device_id,
        })
    }

    /// 打开一次性会话。
    pub(crate) async fn open_session_at(
        &self,
        req: &OpenSessionRequest,
        now: u64,
    ) -> Result<OpenSessionData, ApiError> {
        let app_id = required_field(&req.app_id, "MISSING_APP_ID", "appId")?;
        let device_id = required_device_id(&req.device_id)?;
        let resource_url = validate_resource_url(&req.resource_url)?;
        let ticket = self
            .sessions
            .open_at(app_id, &device_id, &resource_url, now)
            .await;
        Ok(OpenSessionData {
            session_id: ticket.session_id,
            token: ticket.token,
            expires_at: unix_to_rfc3339(ticket.expires_at),
        })
    }

    /// 消费会话，成功时交付资源 URL。
    pub(crate) async fn consume_session_at(
        &self,
        req: &ConsumeSessionRequest,
        now: u64,
    ) -> Result<ConsumeSessionData, ApiError> {
        let session_id = required_field(&req.session_id, "MISSING_SESSION_ID", "sessionId")?;
        let device_id = required_device_id(&req.device_id)?;
        let resource_url = self
            .sessions
            .consume_at(session_id, &req.token, &device_id, now)
            .await
            .map_err(ApiError::from)?;
        Ok(ConsumeSessionData { resource_url })
    }
}
