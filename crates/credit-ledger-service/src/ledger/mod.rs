//! 积分台账引擎
//!
//! 变更用户余额并追加审计流水，维护非负余额不变量。存储不提供
//! 事务，余额写入与审计写入是两次独立的远端调用：审计写入失败时
//! 引擎执行补偿写入把余额恢复原值，使外部可见状态如同操作从未
//! 发生；补偿本身失败时以最高级别日志上报，留待人工对账。
//!
//! 并发说明：读余额 -> 校验 -> 写余额构成读改写竞态窗口，同一用户的
//! 两次并发扣减可能都以过期余额通过校验而超扣。本引擎不提供跨请求
//! 串行化，这是已接受的设计边界而非疏漏；需要更强保证时应在存储端
//! 引入按用户互斥或条件更新原语。

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use credits_shared::error::{CreditError, Result};

use crate::cache::MemoryCache;
use crate::models::{User, UsageLogEntry};
use crate::store::{Filter, Query, StoreBackend, collections};

/// 积分台账引擎
///
/// 组合两个依赖：存储后端（全部读写）与进程缓存（变更后失效主体条目）。
pub struct LedgerEngine {
    store: Arc<dyn StoreBackend>,
    cache: Arc<MemoryCache>,
}

impl LedgerEngine {
    pub fn new(store: Arc<dyn StoreBackend>, cache: Arc<MemoryCache>) -> Self {
        Self { store, cache }
    }

    /// 按用户 ID 读取用户行
    async fn load_user(&self, user_id: &str) -> Result<User> {
        let rows = self
            .store
            .select(
                collections::USERS,
                Query::new().filter(Filter::eq("user_id", user_id)),
            )
            .await?;

        let row = rows.into_iter().next().ok_or_else(|| CreditError::UserNotFound {
            user_id: user_id.to_string(),
        })?;
        Ok(serde_json::from_value(row)?)
    }

    /// 调整用户积分
    ///
    /// `delta` 为正表示增加（如手工发放），为负表示消耗。消耗路径
    /// 会追加一条审计流水；任何会把余额推到负数的调用在写入前被拒绝。
    /// 成功返回新余额。
    #[instrument(skip(self))]
    pub async fn adjust_credits(
        &self,
        user_id: &str,
        delta: i64,
        action_type: &str,
    ) -> Result<i64> {
        // 1. 读取当前余额
        let user = self.load_user(user_id).await?;
        let current = user.credits;

        // 2. 非负余额校验，任何写入发生之前
        if delta < 0 && current + delta < 0 {
            return Err(CreditError::InsufficientCredits {
                required: -delta,
                actual: current,
            });
        }

        let new_balance = current + delta;

        // 3. 写入新余额
        self.store
            .update(
                collections::USERS,
                vec![Filter::eq("user_id", user_id)],
                json!({ "credits": new_balance }),
            )
            .await?;

        // 4. 消耗动作追加审计流水；失败则补偿回滚余额
        if delta < 0 {
            let entry = UsageLogEntry {
                log_id: Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                action_type: action_type.to_string(),
                credits_delta: delta,
                timestamp: Utc::now(),
                request_details: None,
            };

            if let Err(audit_err) = self
                .store
                .insert(collections::USAGE_LOGS, serde_json::to_value(&entry)?)
                .await
            {
                warn!(
                    user_id,
                    delta,
                    error = %audit_err,
                    "审计流水写入失败，开始补偿回滚余额"
                );

                // 5. 补偿写入：恢复余额原值。补偿序列一旦开始即执行
                //    完毕（成功或记录不一致），不会中途放弃。
                match self
                    .store
                    .update(
                        collections::USERS,
                        vec![Filter::eq("user_id", user_id)],
                        json!({ "credits": current }),
                    )
                    .await
                {
                    Ok(_) => {
                        info!(user_id, restored = current, "余额补偿回滚完成");
                        return Err(audit_err);
                    }
                    Err(comp_err) => {
                        // 余额已扣减且无审计流水，存储状态偏离台账不变量
                        let inconsistency = CreditError::Inconsistency {
                            user_id: user_id.to_string(),
                            detail: format!(
                                "余额已写为 {new_balance} 但审计流水缺失，\
                                 回滚亦失败: 审计错误={audit_err}, 回滚错误={comp_err}"
                            ),
                        };
                        error!(
                            user_id,
                            attempted_balance = new_balance,
                            original_balance = current,
                            audit_error = %audit_err,
                            compensation_error = %comp_err,
                            "补偿写入失败，余额与审计流水不一致，需要人工对账"
                        );
                        return Err(inconsistency);
                    }
                }
            }
        }

        // 6. 失效该用户的缓存条目后返回
        self.cache.invalidate_subject(user_id);

        info!(user_id, delta, new_balance, action_type, "积分调整完成");
        Ok(new_balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use crate::store::MemoryStore;
    use serde_json::Value;
    use std::time::Duration;

    fn user_row(user_id: &str, credits: i64) -> Value {
        json!({
            "user_id": user_id,
            "username": format!("user-{user_id}"),
            "email": null,
            "credits": credits,
            "is_admin": false,
            "created_at": Utc::now(),
            "last_login": null
        })
    }

    async fn make_engine(rows: Vec<Value>) -> (Arc<MemoryStore>, Arc<MemoryCache>, LedgerEngine) {
        let store = Arc::new(MemoryStore::new());
        store.seed(collections::USERS, rows).await;
        let cache = Arc::new(MemoryCache::new());
        let engine = LedgerEngine::new(store.clone(), cache.clone());
        (store, cache, engine)
    }

    async fn stored_credits(store: &MemoryStore, user_id: &str) -> i64 {
        store
            .rows(collections::USERS)
            .await
            .iter()
            .find(|row| row["user_id"] == user_id)
            .and_then(|row| row["credits"].as_i64())
            .unwrap()
    }

    #[tokio::test]
    async fn test_consume_writes_balance_and_audit_log() {
        let (store, _, engine) = make_engine(vec![user_row("u-1", 10)]).await;

        let new_balance = engine.adjust_credits("u-1", -3, "chat").await.unwrap();

        assert_eq!(new_balance, 7);
        assert_eq!(stored_credits(&store, "u-1").await, 7);

        // 恰好一条审计流水，带符号 delta
        let logs = store.rows(collections::USAGE_LOGS).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["credits_delta"], -3);
        assert_eq!(logs[0]["action_type"], "chat");
    }

    #[tokio::test]
    async fn test_grant_skips_audit_log() {
        let (store, _, engine) = make_engine(vec![user_row("u-1", 10)]).await;

        let new_balance = engine.adjust_credits("u-1", 5, "manual").await.unwrap();

        assert_eq!(new_balance, 15);
        // 非消耗调整单次写入提交，无审计流水
        assert!(store.rows(collections::USAGE_LOGS).await.is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_credits_rejected_before_any_write() {
        let (store, _, engine) = make_engine(vec![user_row("u-1", 2)]).await;

        let err = engine.adjust_credits("u-1", -5, "chat").await.unwrap_err();

        assert!(matches!(
            err,
            CreditError::InsufficientCredits {
                required: 5,
                actual: 2
            }
        ));
        // 余额原样，未产生任何写入
        assert_eq!(stored_credits(&store, "u-1").await, 2);
        assert!(store.rows(collections::USAGE_LOGS).await.is_empty());
    }

    #[tokio::test]
    async fn test_exact_balance_consumption_allowed() {
        let (store, _, engine) = make_engine(vec![user_row("u-1", 5)]).await;

        let new_balance = engine.adjust_credits("u-1", -5, "chat").await.unwrap();

        assert_eq!(new_balance, 0);
        assert_eq!(stored_credits(&store, "u-1").await, 0);
    }

    #[tokio::test]
    async fn test_user_not_found() {
        let (_, _, engine) = make_engine(vec![]).await;

        let err = engine.adjust_credits("ghost", -1, "chat").await.unwrap_err();
        assert!(matches!(err, CreditError::UserNotFound { .. }));
    }

    #[tokio::test]
    async fn test_audit_failure_compensates_balance() {
        let (store, _, engine) = make_engine(vec![user_row("u-1", 10)]).await;
        store.fail_on("insert", collections::USAGE_LOGS).await;

        let err = engine.adjust_credits("u-1", -4, "chat").await.unwrap_err();

        // 操作报失败，余额恢复原值，审计流水为空——外部状态如同未发生
        assert!(matches!(err, CreditError::StoreUnavailable { .. }));
        assert_eq!(stored_credits(&store, "u-1").await, 10);
        assert!(store.rows(collections::USAGE_LOGS).await.is_empty());
    }

    #[tokio::test]
    async fn test_compensation_failure_surfaces_inconsistency() {
        let (store, _, engine) = make_engine(vec![user_row("u-1", 10)]).await;
        store.fail_on("insert", collections::USAGE_LOGS).await;
        // 第一次 update 是扣减（允许），第二次是补偿回滚（注入故障）
        store.fail_after("update", collections::USERS, 1).await;

        let err = engine.adjust_credits("u-1", -4, "chat").await.unwrap_err();

        assert!(matches!(err, CreditError::Inconsistency { .. }));
        assert_eq!(err.code(), "INCONSISTENCY");
        // 余额停留在已扣减的中间状态，等待人工对账
        assert_eq!(stored_credits(&store, "u-1").await, 6);
    }

    #[tokio::test]
    async fn test_success_invalidates_subject_cache() {
        let (_, cache, engine) = make_engine(vec![user_row("u-1", 10)]).await;

        let key = CacheKey::user_data("get_user_profile", "u-1", &[]);
        cache.set(&key, &json!({"credits": 10}), Duration::from_secs(60));
        let other = CacheKey::user_data("get_user_profile", "u-2", &[]);
        cache.set(&other, &json!({"credits": 3}), Duration::from_secs(60));

        engine.adjust_credits("u-1", -1, "chat").await.unwrap();

        assert_eq!(cache.get::<Value>(&key), None);
        // 其它主体的缓存不受影响
        assert!(cache.get::<Value>(&other).is_some());
    }

    #[tokio::test]
    async fn test_failed_operation_keeps_cache() {
        let (_, cache, engine) = make_engine(vec![user_row("u-1", 1)]).await;

        let key = CacheKey::user_data("get_user_profile", "u-1", &[]);
        cache.set(&key, &json!({"credits": 1}), Duration::from_secs(60));

        let _ = engine.adjust_credits("u-1", -5, "chat").await;

        // 被拒绝的操作没有改变存储，缓存无需失效
        assert!(cache.get::<Value>(&key).is_some());
    }

    #[tokio::test]
    async fn test_balance_never_negative_across_sequence() {
        let (store, _, engine) = make_engine(vec![user_row("u-1", 3)]).await;

        for delta in [-1, -1, -1, -1, -1] {
            let _ = engine.adjust_credits("u-1", delta, "chat").await;
            assert!(stored_credits(&store, "u-1").await >= 0);
        }
        assert_eq!(stored_credits(&store, "u-1").await, 0);
    }
}
