//! 对外操作门面
//!
//! 被上层 HTTP 路由消费的操作入口。门面持有网关、缓存与各引擎，
//! 把引擎的 `Result` 统一转换为三态响应（成功标记 + 消息 + 载荷），
//! 任何失败都以值的形式返回，绝不向调用方抛出。
//!
//! 资料类读取走读穿透缓存；引擎在变更成功后按主体失效缓存，
//! 保证读路径不会看到已变更主体的陈旧资料超过一次往返。

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use credits_shared::config::{AppConfig, CacheConfig};
use credits_shared::error::{CreditError, Result};

use crate::cache::{CacheKey, CacheStats, MemoryCache};
use crate::dto::{CreditAdjustment, RedeemOutcome, ServiceResponse};
use crate::ledger::LedgerEngine;
use crate::models::{RedemptionCode, User};
use crate::redemption::{CodeInfo, RedemptionEngine};
use crate::stats::{StatsReporter, UsageStatistics};
use crate::store::{Filter, Query, StoreBackend, StoreGateway, collections};

/// 积分服务门面
pub struct CreditService {
    store: Arc<dyn StoreBackend>,
    cache: Arc<MemoryCache>,
    ledger: LedgerEngine,
    redemption: RedemptionEngine,
    stats: StatsReporter,
    user_data_ttl: Duration,
}

impl CreditService {
    /// 基于任意存储后端构建服务（测试注入内存实现时使用）
    pub fn new(store: Arc<dyn StoreBackend>, cache_config: &CacheConfig) -> Self {
        let cache = Arc::new(MemoryCache::with_cleanup_every(
            cache_config.cleanup_every_inserts,
        ));
        Self {
            ledger: LedgerEngine::new(store.clone(), cache.clone()),
            redemption: RedemptionEngine::new(store.clone(), cache.clone()),
            stats: StatsReporter::new(store.clone()),
            user_data_ttl: Duration::from_secs(cache_config.user_data_ttl_seconds),
            store,
            cache,
        }
    }

    /// 基于配置构建服务，存储后端为 HTTP 网关
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let gateway = StoreGateway::new(&config.store)?;
        info!(
            service_name = %config.service_name,
            environment = %config.environment,
            "积分服务已初始化"
        );
        Ok(Self::new(Arc::new(gateway), &config.cache))
    }

    /// 调整用户积分（正数发放，负数消耗）
    pub async fn adjust_credits(
        &self,
        user_id: &str,
        delta: i64,
        action_type: &str,
    ) -> ServiceResponse<CreditAdjustment> {
        match self.ledger.adjust_credits(user_id, delta, action_type).await {
            Ok(new_balance) => ServiceResponse::ok(
                CreditAdjustment {
                    user_id: user_id.to_string(),
                    new_balance,
                },
                "积分更新成功",
            ),
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    /// 生成兑换码（管理端操作）
    pub async fn generate_code(
        &self,
        credits_value: i64,
        expires_in_days: Option<i64>,
        creator_id: Option<&str>,
    ) -> ServiceResponse<RedemptionCode> {
        match self
            .redemption
            .generate_code(credits_value, expires_in_days, creator_id)
            .await
        {
            Ok(record) => ServiceResponse::ok(record, "兑换码创建成功"),
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    /// 核销兑换码
    pub async fn redeem_code(&self, code: &str, user_id: &str) -> ServiceResponse<RedeemOutcome> {
        match self.redemption.redeem(code, user_id).await {
            Ok(credits_gained) => ServiceResponse::ok(
                RedeemOutcome {
                    code: code.trim().to_uppercase(),
                    credits_gained,
                },
                format!("兑换成功！获得 {credits_gained} 积分"),
            ),
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    /// 校验兑换码（不执行兑换）
    pub async fn validate_code(&self, code: &str) -> ServiceResponse<CodeInfo> {
        match self.redemption.validate_code(code).await {
            Ok(info) => {
                let message = format!("有效兑换码，价值 {} 积分", info.credits_value);
                ServiceResponse::ok(info, message)
            }
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    /// 获取用户的兑换历史
    pub async fn redemption_history(
        &self,
        user_id: &str,
    ) -> ServiceResponse<Vec<RedemptionCode>> {
        match self.redemption.redemption_history(user_id).await {
            Ok(history) => ServiceResponse::ok(history, "获取成功"),
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    /// 获取用户资料（读穿透缓存）
    pub async fn get_user_profile(&self, user_id: &str) -> ServiceResponse<User> {
        let key = CacheKey::user_data("get_user_profile", user_id, &[]);
        let store = self.store.clone();
        let uid = user_id.to_string();

        let result = self
            .cache
            .get_or_load(&key, self.user_data_ttl, || async move {
                let rows = store
                    .select(
                        collections::USERS,
                        Query::new().filter(Filter::eq("user_id", &uid)),
                    )
                    .await?;
                let row = rows
                    .into_iter()
                    .next()
                    .ok_or(CreditError::UserNotFound { user_id: uid })?;
                Ok(serde_json::from_value::<User>(row)?)
            })
            .await;

        match result {
            Ok(user) => ServiceResponse::ok(user, "获取成功"),
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    /// 获取兑换码使用统计（管理端操作）
    pub async fn usage_statistics(&self) -> ServiceResponse<UsageStatistics> {
        match self.stats.usage_statistics().await {
            Ok(stats) => ServiceResponse::ok(stats, "获取统计成功"),
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    /// 获取缓存统计信息（管理端操作）
    pub fn cache_stats(&self) -> ServiceResponse<CacheStats> {
        ServiceResponse::ok(self.cache.stats(), "获取成功")
    }

    /// 清空所有缓存（管理端操作）
    pub fn clear_cache(&self) -> ServiceResponse<()> {
        self.cache.clear();
        info!("缓存已全部清空");
        ServiceResponse::<()>::ok_empty("缓存已清空")
    }

    /// 存储后端句柄（维护 worker 共用）
    pub fn store(&self) -> Arc<dyn StoreBackend> {
        self.store.clone()
    }
}
