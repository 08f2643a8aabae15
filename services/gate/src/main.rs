//! Gate 二进制入口：解析 CLI、加载配置并启动应用。

mod api;
mod app;
mod cli;
mod config;
mod handoff;
mod ledger;
mod link;
mod logging;
mod session;
mod state;
mod store;
mod sweeper;
mod transfer;

#[tokio::main]
/// 启动 Gate 服务。
async fn main() -> anyhow::Result<()> {
    let args = std::env::args().skip(1).collect::<Vec<String>>();
    match cli::dispatch(&args)? {
        cli::CliDispatch::Run => {}
        cli::CliDispatch::Exit => return Ok(()),
    }

    let _log_runtime = logging::init("gate")?;
    let config = config::GateConfig::from_env()?;
    tracing::debug!("loaded config: {config:?}");
    app::run(config).await
}
