//! API 错误定义与响应转换。

use axum::{Json, http::StatusCode};
use serde::Serialize;

use super::response::ApiEnvelope;
use crate::{
    link::{resolve::LinkDenial, temp::ConfirmError},
    session::SessionError,
    transfer::TransferError,
};

/// 接口错误。
#[derive(Debug)]
pub(crate) struct ApiError {
    pub(crate) status: StatusCode,
    pub(crate) code: &'static str,
    pub(crate) message: String,
    pub(crate) suggestion: &'static str,
}

impl ApiError {
    /// 构造统一 API 错误。
    pub(crate) fn new(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        suggestion: &'static str,
    ) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            suggestion,
        }
    }

    /// 请求参数缺失或非法。
    pub(crate) fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message, "请检查输入后重试")
    }

    /// 转换为统一响应体，`data` 为拒绝场景下需要回传给客户端的附加信息。
    pub(crate) fn into_response_with<T: Serialize>(
        self,
        data: Option<T>,
    ) -> (StatusCode, Json<ApiEnvelope<T>>) {
        (
            self.status,
            Json(ApiEnvelope {
                ok: false,
                code: self.code.to_string(),
                message: self.message,
                suggestion: self.suggestion.to_string(),
                data,
            }),
        )
    }

    /// 转换为不带数据的统一响应体。
    pub(crate) fn into_response<T: Serialize>(self) -> (StatusCode, Json<ApiEnvelope<T>>) {
        self.into_response_with(None)
    }
}

fn transfer_status(err: TransferError) -> (StatusCode, &'static str) {
    match err {
        TransferError::Malformed => (StatusCode::BAD_REQUEST, "换绑码为 6 位数字"),
        TransferError::Unknown => (StatusCode::NOT_FOUND, "请确认换绑码是否输入正确"),
        TransferError::Expired => (StatusCode::GONE, "请在原设备上重新申请换绑码"),
        TransferError::AlreadyUsed => (StatusCode::FORBIDDEN, "请在原设备上重新申请换绑码"),
        TransferError::TokenMismatch => (StatusCode::FORBIDDEN, "换绑码只能用于申请时的链接"),
        TransferError::SameDevice => (StatusCode::FORBIDDEN, "请在新设备上输入换绑码"),
    }
}

fn confirm_status(err: ConfirmError) -> (StatusCode, &'static str) {
    match err {
        ConfirmError::Unknown => (StatusCode::NOT_FOUND, "请重新打开链接"),
        ConfirmError::Expired => (StatusCode::GONE, "确认页已超时，请重新打开链接"),
        ConfirmError::AlreadyUsed => (StatusCode::FORBIDDEN, "请重新打开链接"),
        ConfirmError::DeviceMismatch => (StatusCode::FORBIDDEN, "请在打开确认页的设备上继续"),
        ConfirmError::Mismatch => (StatusCode::UNAUTHORIZED, "请重新打开链接"),
    }
}

impl From<&LinkDenial> for ApiError {
    fn from(denial: &LinkDenial) -> Self {
        let (status, suggestion) = match denial {
            LinkDenial::Malformed => (StatusCode::BAD_REQUEST, "请使用完整的原始链接"),
            LinkDenial::Expired => (StatusCode::GONE, "请联系发放方重新获取链接"),
            LinkDenial::SignatureInvalid => (StatusCode::UNAUTHORIZED, "请使用完整的原始链接"),
            LinkDenial::DeviceMismatch {
                can_request_transfer: true,
                ..
            } => (StatusCode::FORBIDDEN, "请在原设备上申请换绑码"),
            LinkDenial::DeviceMismatch { .. } => (StatusCode::FORBIDDEN, "请在指定设备上打开链接"),
            LinkDenial::Exhausted { .. } => (StatusCode::GONE, "请联系发放方重新获取链接"),
            LinkDenial::Confirmation(err) => confirm_status(*err),
            LinkDenial::Transfer(err) => transfer_status(*err),
            LinkDenial::TransferNotBound => (StatusCode::FORBIDDEN, "请在原设备上重新申请换绑码"),
        };
        Self::new(status, denial.code(), denial.reason(), suggestion)
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let (status, suggestion) = match err {
            SessionError::Unknown => (StatusCode::NOT_FOUND, "请重新发起会话"),
            SessionError::Expired => (StatusCode::GONE, "请重新发起会话"),
            SessionError::AlreadyUsed => (StatusCode::FORBIDDEN, "会话只能使用一次，请重新发起"),
            SessionError::DeviceMismatch => (StatusCode::FORBIDDEN, "请在发起会话的设备上完成操作"),
            SessionError::TokenMismatch => (StatusCode::UNAUTHORIZED, "请重新发起会话"),
        };
        Self::new(status, err.code(), err.reason(), suggestion)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::Value;

    use super::ApiError;
    use crate::{
        link::{resolve::LinkDenial, temp::ConfirmError},
        session::SessionError,
        transfer::TransferError,
    };

    #[test]
    fn error_envelope_is_not_ok_and_keeps_code() {
        let (status, body) = ApiError::bad_request("MISSING_DEVICE_ID", "deviceId 不能为空")
            .into_response::<Value>();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.0.ok);
        assert_eq!(body.0.code, "MISSING_DEVICE_ID");
        assert!(body.0.data.is_none());
    }

    #[test]
    fn denials_map_to_stable_statuses() {
        let cases = [
            (LinkDenial::Malformed, StatusCode::BAD_REQUEST),
            (LinkDenial::Expired, StatusCode::GONE),
            (LinkDenial::SignatureInvalid, StatusCode::UNAUTHORIZED),
            (
                LinkDenial::DeviceMismatch {
                    token: "t".to_string(),
                    can_request_transfer: true,
                },
                StatusCode::FORBIDDEN,
            ),
            (
                LinkDenial::Exhausted {
                    use_count: 2,
                    max_uses: 2,
                },
                StatusCode::GONE,
            ),
            (
                LinkDenial::Confirmation(ConfirmError::AlreadyUsed),
                StatusCode::FORBIDDEN,
            ),
            (
                LinkDenial::Confirmation(ConfirmError::DeviceMismatch),
                StatusCode::FORBIDDEN,
            ),
            (
                LinkDenial::Transfer(TransferError::Unknown),
                StatusCode::NOT_FOUND,
            ),
            (
                LinkDenial::Transfer(TransferError::SameDevice),
                StatusCode::FORBIDDEN,
            ),
        ];
        for (denial, status) in cases {
            let err = ApiError::from(&denial);
            assert_eq!(err.status, status, "{denial:?}");
            assert_eq!(err.code, denial.code());
            assert_eq!(err.message, denial.reason());
        }
    }

    #[test]
    fn session_errors_carry_their_reason() {
        let err = ApiError::from(SessionError::Expired);
        assert_eq!(err.status, StatusCode::GONE);
        assert_eq!(err.code, "SESSION_EXPIRED");
        assert_eq!(err.message, "session expired");
    }
}
