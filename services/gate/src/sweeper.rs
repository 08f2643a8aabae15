//! 过期清扫：固定周期清理四类限时存储。

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::info;

use crate::{state::AppState, store::unix_now};

/// 启动后台清扫任务；落后的周期直接跳过，不补跑。
pub(crate) fn spawn_sweeper(state: AppState) -> JoinHandle<()> {
    let period = state.config.sweep_interval;
    info!("expiry sweeper running every {}s", period.as_secs());
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            state.sweep_expired_at(unix_now()).await;
        }
    })
}
