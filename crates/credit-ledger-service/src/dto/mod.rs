//! 对外响应 DTO 定义
//!
//! 所有对外操作的统一响应结构：成功标记 + 人类可读消息 + 可选载荷。
//! 上层 HTTP 路由只负责透传，不做二次判断。

use serde::Serialize;

use credits_shared::error::CreditError;

/// 操作统一响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse<T> {
    pub success: bool,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ServiceResponse<T> {
    /// 创建成功响应
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            code: "SUCCESS".to_string(),
            message: message.into(),
            data: Some(data),
        }
    }

    /// 创建成功响应（无数据）
    pub fn ok_empty(message: impl Into<String>) -> ServiceResponse<()> {
        ServiceResponse {
            success: true,
            code: "SUCCESS".to_string(),
            message: message.into(),
            data: None,
        }
    }

    /// 从错误创建失败响应
    pub fn from_error(err: &CreditError) -> Self {
        Self {
            success: false,
            code: err.code().to_string(),
            message: err.to_string(),
            data: None,
        }
    }
}

/// 积分调整结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditAdjustment {
    pub user_id: String,
    pub new_balance: i64,
}

/// 兑换结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemOutcome {
    pub code: String,
    pub credits_gained: i64,
}
