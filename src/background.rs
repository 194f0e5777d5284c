//! 签名密钥轮换的后台任务。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::keys::{KeyStore, epoch_salt};

/// 启动后台任务：在每个轮换周期边界切换签名密钥。
pub fn spawn_key_rotation(keys: Arc<KeyStore>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            let wait = until_next_rotation(Utc::now(), interval);
            debug!(wait_secs = wait.as_secs(), "next key rotation scheduled");
            tokio::time::sleep(wait).await;
            keys.rotate(&epoch_salt(Utc::now(), interval));
        }
    });
}

/// 距离下一个轮换周期边界的时长。
fn until_next_rotation(now: DateTime<Utc>, interval: Duration) -> Duration {
    let interval_ms = interval.as_millis().max(1);
    let now_ms = u128::try_from(now.timestamp_millis()).unwrap_or(0);
    let remaining = interval_ms - now_ms % interval_ms;
    Duration::from_millis(u64::try_from(remaining).unwrap_or(u64::MAX))
}
