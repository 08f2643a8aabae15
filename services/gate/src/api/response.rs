//! 统一响应包裹：`{ok, code, message, suggestion, data?}`。

use axum::{Json, http::StatusCode};
use serde::Serialize;

use super::error::ApiError;

/// 处理函数统一返回类型。
pub(crate) type ApiReply<T> = (StatusCode, Json<ApiEnvelope<T>>);

/// 通用 API 成功/失败包裹结构。
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApiEnvelope<T>
where
    T: Serialize,
{
    pub(crate) ok: bool,
    pub(crate) code: String,
    pub(crate) message: String,
    pub(crate) suggestion: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) data: Option<T>,
}

/// 构造成功响应。
pub(crate) fn ok_response<T: Serialize>(
    message: impl Into<String>,
    suggestion: impl Into<String>,
    data: T,
) -> ApiReply<T> {
    (
        StatusCode::OK,
        Json(ApiEnvelope {
            ok: true,
            code: "OK".to_string(),
            message: message.into(),
            suggestion: suggestion.into(),
            data: Some(data),
        }),
    )
}

/// 业务结果转响应：成功走 `ok_response`，失败走错误包裹。
pub(crate) fn reply<T: Serialize>(
    result: Result<T, ApiError>,
    message: &str,
    suggestion: &str,
) -> ApiReply<T> {
    match result {
        Ok(data) => ok_response(message, suggestion, data),
        Err(err) => err.into_response(),
    }
}
