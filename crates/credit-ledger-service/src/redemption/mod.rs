//! 兑换码引擎
//!
//! 生成无碰撞兑换码、校验可用性（未使用、未过期），并执行三步核销
//! 工作流：标记已使用 -> 余额入账 -> 追加审计流水。入账失败时把兑换码
//! 回滚为未使用——用户没有真正拿到积分，兑换码必须保持可兑换；审计
//! 流水失败则只告警不回滚——用户已经看到新余额，撤销入账比缺一条
//! 日志更糟。这个不对称的补偿策略是有意的取舍，不是控制流的巧合。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use credits_shared::error::{CreditError, Result};

use crate::cache::MemoryCache;
use crate::models::{ACTION_REDEEM_CODE, RedemptionCode, User, UsageLogEntry};
use crate::store::{Filter, Query, StoreBackend, collections};

/// 兑换码字符表：大写字母与数字，剔除易混淆的 O/0/I/L/1
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
/// 兑换码固定长度
pub const CODE_LENGTH: usize = 16;
/// 碰撞重试上限
const MAX_GENERATION_ATTEMPTS: u32 = 10;

/// 兑换码校验结果（只校验，不执行兑换）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeInfo {
    pub credits_value: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_valid: bool,
}

/// 兑换码引擎
pub struct RedemptionEngine {
    store: Arc<dyn StoreBackend>,
    cache: Arc<MemoryCache>,
}

impl RedemptionEngine {
    pub fn new(store: Arc<dyn StoreBackend>, cache: Arc<MemoryCache>) -> Self {
        Self { store, cache }
    }

    /// 生成一个随机兑换码
    fn random_code() -> String {
        let mut rng = rand::rng();
        (0..CODE_LENGTH)
            .map(|_| {
                let idx = rng.random_range(0..CODE_ALPHABET.len());
                CODE_ALPHABET[idx] as char
            })
            .collect()
    }

    /// 归一化输入的兑换码（对齐生成字符表的大写）
    fn normalize(code: &str) -> String {
        code.trim().to_uppercase()
    }

    /// 按码值读取兑换码行
    async fn load_code(&self, code: &str) -> Result<RedemptionCode> {
        let rows = self
            .store
            .select(
                collections::REDEMPTION_CODES,
                Query::new().filter(Filter::eq("code", code)),
            )
            .await?;

        let row = rows.into_iter().next().ok_or_else(|| CreditError::CodeNotFound {
            code: code.to_string(),
        })?;
        Ok(serde_json::from_value(row)?)
    }

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

    /// 可用性检查，优先级固定：已使用 -> 已过期 -> 有效
    fn check_usable(record: &RedemptionCode, now: DateTime<Utc>) -> Result<()> {
        if record.is_used {
            return Err(CreditError::CodeAlreadyUsed {
                code: record.code.clone(),
            });
        }
        if record.is_expired(now) {
            return Err(CreditError::CodeExpired {
                code: record.code.clone(),
            });
        }
        Ok(())
    }

    /// 生成兑换码
    ///
    /// 面值必须为正；显式过期窗口必须为正天数，省略则永不过期。
    /// 生成的候选码与存储比对查重，连续碰撞超过上限时报
    /// `CodeGenerationExhausted`——调用方应视为瞬时错误重试。
    #[instrument(skip(self))]
    pub async fn generate_code(
        &self,
        credits_value: i64,
        expires_in_days: Option<i64>,
        creator_id: Option<&str>,
    ) -> Result<RedemptionCode> {
        if credits_value <= 0 {
            return Err(CreditError::InvalidArgument {
                field: "credits_value".to_string(),
                message: "积分价值必须大于 0".to_string(),
            });
        }
        if let Some(days) = expires_in_days {
            if days <= 0 {
                return Err(CreditError::InvalidArgument {
                    field: "expires_in_days".to_string(),
                    message: "过期天数必须大于 0".to_string(),
                });
            }
        }

        // 生成唯一兑换码，碰撞时重试
        let mut code = None;
        for attempt in 0..MAX_GENERATION_ATTEMPTS {
            let candidate = Self::random_code();
            let existing = self
                .store
                .select(
                    collections::REDEMPTION_CODES,
                    Query::new()
                        .select("code")
                        .filter(Filter::eq("code", &candidate)),
                )
                .await?;

            if existing.is_empty() {
                code = Some(candidate);
                break;
            }
            debug!(attempt, "兑换码碰撞，重新生成");
        }
        let Some(code) = code else {
            return Err(CreditError::CodeGenerationExhausted {
                attempts: MAX_GENERATION_ATTEMPTS,
            });
        };

        let now = Utc::now();
        let record = RedemptionCode {
            code,
            credits_value,
            is_used: false,
            used_by_user_id: None,
            used_at: None,
            expires_at: expires_in_days.map(|days| now + Duration::days(days)),
            created_by_admin_id: creator_id.map(str::to_string),
            created_at: now,
        };

        self.store
            .insert(
                collections::REDEMPTION_CODES,
                serde_json::to_value(&record)?,
            )
            .await?;

        info!(
            code = %record.code,
            credits_value,
            expires_at = ?record.expires_at,
            "兑换码创建成功"
        );
        Ok(record)
    }

    /// 核销兑换码，成功返回获得的积分数
    ///
    /// 工作流：校验 -> 标记已使用 -> 余额入账 -> 审计流水 -> 失效缓存。
    /// 入账失败回滚兑换码状态；审计流水失败不回滚（见模块说明）。
    #[instrument(skip(self))]
    pub async fn redeem(&self, code: &str, user_id: &str) -> Result<i64> {
        // 1. 归一化并查找
        let normalized = Self::normalize(code);
        let record = self.load_code(&normalized).await?;

        // 2. 可用性检查：任何写入之前
        let now = Utc::now();
        Self::check_usable(&record, now)?;

        // 3. 查找用户
        let user = self.load_user(user_id).await?;

        // 4. 单次写入标记已使用：(状态, 核销人, 核销时间) 一起变更
        self.store
            .update(
                collections::REDEMPTION_CODES,
                vec![Filter::eq("code", &normalized)],
                json!({
                    "is_used": true,
                    "used_by_user_id": user_id,
                    "used_at": now,
                }),
            )
            .await?;

        // 5. 余额入账
        let new_credits = user.credits + record.credits_value;
        if let Err(credit_err) = self
            .store
            .update(
                collections::USERS,
                vec![Filter::eq("user_id", user_id)],
                json!({ "credits": new_credits }),
            )
            .await
        {
            warn!(
                code = %normalized,
                user_id,
                error = %credit_err,
                "积分入账失败，回滚兑换码状态"
            );

            // 6. 补偿：用户没有拿到积分，兑换码必须保持可兑换
            if let Err(revert_err) = self
                .store
                .update(
                    collections::REDEMPTION_CODES,
                    vec![Filter::eq("code", &normalized)],
                    json!({
                        "is_used": false,
                        "used_by_user_id": Value::Null,
                        "used_at": Value::Null,
                    }),
                )
                .await
            {
                error!(
                    code = %normalized,
                    user_id,
                    credit_error = %credit_err,
                    revert_error = %revert_err,
                    "兑换码状态回滚失败，码已标记使用但未入账，需要人工对账"
                );
                return Err(CreditError::Inconsistency {
                    user_id: user_id.to_string(),
                    detail: format!(
                        "兑换码 {normalized} 已标记使用但积分未入账，回滚亦失败: \
                         入账错误={credit_err}, 回滚错误={revert_err}"
                    ),
                });
            }
            return Err(credit_err);
        }

        // 7. 审计流水：用户已入账，此步失败只告警不回滚
        let entry = UsageLogEntry {
            log_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            action_type: ACTION_REDEEM_CODE.to_string(),
            credits_delta: record.credits_value,
            timestamp: now,
            request_details: Some(format!("兑换码: {normalized}")),
        };
        if let Err(log_err) = self
            .store
            .insert(collections::USAGE_LOGS, serde_json::to_value(&entry)?)
            .await
        {
            warn!(
                code = %normalized,
                user_id,
                error = %log_err,
                "兑换审计流水写入失败，积分已入账，不回滚"
            );
        }

        // 8. 失效该用户的缓存条目
        self.cache.invalidate_subject(user_id);

        info!(
            code = %normalized,
            user_id,
            credits_gained = record.credits_value,
            new_credits,
            "兑换成功"
        );
        Ok(record.credits_value)
    }

    /// 校验兑换码（不执行兑换）
    pub async fn validate_code(&self, code: &str) -> Result<CodeInfo> {
        let normalized = Self::normalize(code);
        let record = self.load_code(&normalized).await?;
        Self::check_usable(&record, Utc::now())?;

        Ok(CodeInfo {
            credits_value: record.credits_value,
            expires_at: record.expires_at,
            is_valid: true,
        })
    }

    /// 获取用户的兑换历史（最近核销的在前）
    pub async fn redemption_history(&self, user_id: &str) -> Result<Vec<RedemptionCode>> {
        // 确认用户存在，避免对不存在的用户返回空历史
        self.load_user(user_id).await?;

        let rows = self
            .store
            .select(
                collections::REDEMPTION_CODES,
                Query::new()
                    .filter(Filter::eq("used_by_user_id", user_id))
                    .filter(Filter::eq("is_used", true))
                    .order("used_at.desc"),
            )
            .await?;

        rows.into_iter()
            .map(|row| Ok(serde_json::from_value(row)?))
            .collect()
    }
}
