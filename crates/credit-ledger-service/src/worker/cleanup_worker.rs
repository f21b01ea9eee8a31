//! 过期兑换码清理 Worker
//!
//! 定期删除过期且从未使用、并已超出保留窗口的兑换码。兑换码在正常
//! 流程中永不删除，这里是唯一的显式维护删除路径；已使用的码永久
//! 保留，它们是审计对账的依据。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use credits_shared::error::Result;

use crate::store::{Filter, StoreBackend, collections};

/// 清理 Worker
///
/// 以固定间隔轮询存储，删除可清理的过期码。设计为常驻任务，
/// 单次清理逻辑独立可测。
pub struct CleanupWorker {
    store: Arc<dyn StoreBackend>,
    /// 轮询间隔（建议 3600 秒）
    poll_interval: Duration,
    /// 过期后的保留天数，窗口内的过期码暂不删除
    retention_days: i64,
}

impl CleanupWorker {
    /// 创建清理 Worker
    ///
    /// # 参数
    /// - `store`: 存储后端
    /// - `poll_interval_secs`: 轮询间隔（秒）
    /// - `retention_days`: 过期码的保留天数
    pub fn new(store: Arc<dyn StoreBackend>, poll_interval_secs: u64, retention_days: i64) -> Self {
        Self {
            store,
            poll_interval: Duration::from_secs(poll_interval_secs),
            retention_days,
        }
    }

    /// 使用默认配置创建清理 Worker
    pub fn with_defaults(store: Arc<dyn StoreBackend>) -> Self {
        Self::new(store, 3600, 30)
    }

    /// 主循环：持续清理直到进程退出
    pub async fn run(&self) {
        info!(
            poll_interval = ?self.poll_interval,
            retention_days = self.retention_days,
            "CleanupWorker 已启动"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            match self.cleanup_once().await {
                Ok(removed) if removed > 0 => {
                    info!(removed, "过期兑换码清理完成");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "过期兑换码清理失败，下一轮重试");
                }
            }
        }
    }

    /// 执行一次清理，返回删除的码数量
    ///
    /// 删除条件：未使用、过期时间早于保留窗口起点。
    /// 永不过期的码（expires_at 为空）不在清理范围内。
    pub async fn cleanup_once(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(self.retention_days);

        let removed = self
            .store
            .delete(
                collections::REDEMPTION_CODES,
                vec![
                    Filter::eq("is_used", false),
                    Filter::lt("expires_at", cutoff.to_rfc3339()),
                ],
            )
            .await?;

        Ok(removed.len() as u64)
    }
}
