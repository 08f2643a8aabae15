//! Gate 应用装配：路由、CORS、清扫任务与监听。

use axum::{
    Router,
    http::{Method, header::CONTENT_TYPE},
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::{
    api::handlers::{
        consume_session_handler, debug_stores, healthz, issue_link_handler,
        open_session_handler, redeem_transfer_handler, request_transfer_handler,
        resolve_link_handler,
    },
    config::GateConfig,
    state::AppState,
    sweeper::spawn_sweeper,
};

/// 构建路由。
pub(crate) fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/debug/stores", get(debug_stores))
        .route("/v1/link/issue", post(issue_link_handler))
        .route("/v1/link/resolve", post(resolve_link_handler))
        .route("/v1/session/open", post(open_session_handler))
        .route("/v1/session/consume", post(consume_session_handler))
        .route("/v1/transfer/request", post(request_transfer_handler))
        .route("/v1/transfer/redeem", post(redeem_transfer_handler))
        .layer(cors)
        .with_state(state)
}

/// Gate 入口：启动清扫任务与 HTTP 路由。
pub(crate) async fn run(config: GateConfig) -> anyhow::Result<()> {
    let addr = config.listen_addr.clone();
    let state = AppState::new(config);
    let _sweeper = spawn_sweeper(state.clone());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("cl-gate listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
