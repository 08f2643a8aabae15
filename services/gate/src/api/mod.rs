//! HTTP 接口层：统一响应包裹、错误映射与路由处理函数。

pub(crate) mod error;
pub(crate) mod handlers;
pub(crate) mod response;
