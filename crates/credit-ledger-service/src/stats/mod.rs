//! 管理端统计
//!
//! 对码/用户计数的只读聚合，供管理面板使用。只依赖存储网关，
//! 不产生任何变更；不走缓存——管理端要的是新鲜度而非速度，
//! 所有数字都取调用时刻的存储状态。

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use credits_shared::error::Result;

use crate::store::{Filter, Query, StoreBackend, collections};

/// 兑换码使用统计
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageStatistics {
    pub total_users: i64,
    pub total_codes: i64,
    pub used_codes: i64,
    pub unused_codes: i64,
    /// 未使用且已过永久期限的码
    pub expired_codes: i64,
    /// 经兑换发放的积分总额（已使用码的面值之和）
    pub total_credits_issued: i64,
    /// 使用率（百分比，保留两位小数；无码时为 0）
    pub usage_rate: f64,
}

/// 统计报表器
pub struct StatsReporter {
    store: Arc<dyn StoreBackend>,
}

impl StatsReporter {
    pub fn new(store: Arc<dyn StoreBackend>) -> Self {
        Self { store }
    }

    /// count 聚合查询
    async fn count(&self, collection: &str, filters: Vec<Filter>) -> Result<i64> {
        let mut query = Query::new().select("count");
        for filter in filters {
            query = query.filter(filter);
        }
        let rows = self.store.select(collection, query).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0))
    }

    /// 获取兑换码使用统计
    #[instrument(skip(self))]
    pub async fn usage_statistics(&self) -> Result<UsageStatistics> {
        let total_users = self.count(collections::USERS, vec![]).await?;
        let total_codes = self.count(collections::REDEMPTION_CODES, vec![]).await?;
        let used_codes = self
            .count(
                collections::REDEMPTION_CODES,
                vec![Filter::eq("is_used", true)],
            )
            .await?;

        let now = Utc::now().to_rfc3339();
        let expired_codes = self
            .count(
                collections::REDEMPTION_CODES,
                vec![
                    Filter::lt("expires_at", &now),
                    Filter::eq("is_used", false),
                ],
            )
            .await?;

        // 已使用码的面值之和
        let credit_rows = self
            .store
            .select(
                collections::REDEMPTION_CODES,
                Query::new()
                    .select("credits_value")
                    .filter(Filter::eq("is_used", true)),
            )
            .await?;
        let total_credits_issued = credit_rows
            .iter()
            .filter_map(|row| row.get("credits_value").and_then(|v| v.as_i64()))
            .sum();

        let usage_rate = if total_codes > 0 {
            let rate = used_codes as f64 / total_codes as f64 * 100.0;
            (rate * 100.0).round() / 100.0
        } else {
            0.0
        };

        Ok(UsageStatistics {
            total_users,
            total_codes,
            used_codes,
            unused_codes: total_codes - used_codes,
            expired_codes,
            total_credits_issued,
            usage_rate,
        })
    }
}
