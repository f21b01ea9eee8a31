//! 数据模型
//!
//! 与远端存储各集合一一对应的行结构。存储按 JSON 行返回，
//! 模型负责类型化；未知列（如口令哈希）由 serde 默认忽略。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 兑换入账的审计动作类型
pub const ACTION_REDEEM_CODE: &str = "redeem_code";
/// 手工调整的审计动作类型
pub const ACTION_MANUAL: &str = "manual";

/// 用户
///
/// `credits` 是非负余额，台账引擎是它唯一的写入方。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    pub credits: i64,
    /// 角色标记：管理员可触发兑换码生成与统计
    #[serde(default)]
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
}

/// 兑换码
///
/// 生命周期：管理端生成时为未使用态，之后至多一次、永久地转为已使用态。
/// (is_used, used_by_user_id, used_at) 三元组在同一次写入中变更，
/// 任何后续读取者要么看到全部、要么全部看不到。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionCode {
    pub code: String,
    pub credits_value: i64,
    pub is_used: bool,
    #[serde(default)]
    pub used_by_user_id: Option<String>,
    #[serde(default)]
    pub used_at: Option<DateTime<Utc>>,
    /// None 表示永不过期
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by_admin_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RedemptionCode {
    /// 是否已过期（未设置过期时间视为永久有效）
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| now > t)
    }
}

/// 使用记录
///
/// 只追加的审计流水。`credits_delta` 带符号：负数表示消耗，
/// 正数表示通过兑换获得。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub log_id: String,
    pub user_id: String,
    pub action_type: String,
    pub credits_delta: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub request_details: Option<String>,
}
