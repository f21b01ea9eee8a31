//! 统一错误处理模块
//!
//! 定义系统中所有共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 所有引擎操作的失败都以该类型的值返回，不允许跨引擎边界抛出 panic。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum CreditError {
    // ==================== 未找到 ====================
    #[error("用户不存在: user_id={user_id}")]
    UserNotFound { user_id: String },

    #[error("兑换码不存在: {code}")]
    CodeNotFound { code: String },

    // ==================== 参数错误 ====================
    #[error("无效的参数: {field} - {message}")]
    InvalidArgument { field: String, message: String },

    #[error("参数验证失败: {0}")]
    Validation(String),

    // ==================== 业务冲突 ====================
    #[error("积分不足: 需要 {required}, 实际 {actual}")]
    InsufficientCredits { required: i64, actual: i64 },

    #[error("兑换码已被使用: {code}")]
    CodeAlreadyUsed { code: String },

    #[error("兑换码已过期: {code}")]
    CodeExpired { code: String },

    // ==================== 瞬时故障 ====================
    #[error("存储服务不可用: status={status:?}, {message}")]
    StoreUnavailable { status: Option<u16>, message: String },

    #[error("存储请求超时")]
    StoreTimeout,

    #[error("兑换码生成失败: 连续 {attempts} 次碰撞")]
    CodeGenerationExhausted { attempts: u32 },

    // ==================== 存储拒绝 ====================
    #[error("存储请求被拒绝: status={status}, {message}")]
    StoreRejected { status: u16, message: String },

    // ==================== 数据不一致 ====================
    /// 补偿写入失败后，余额与审计流水已经分叉。
    /// 该错误不允许被静默吞掉，必须以最高级别日志上报并人工对账。
    #[error("数据不一致，需要人工对账: user_id={user_id}, {detail}")]
    Inconsistency { user_id: String, detail: String },

    // ==================== 通用错误 ====================
    #[error("JSON 序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, CreditError>;

impl CreditError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::UserNotFound { .. } => "USER_NOT_FOUND",
            Self::CodeNotFound { .. } => "CODE_NOT_FOUND",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            Self::CodeAlreadyUsed { .. } => "CODE_ALREADY_USED",
            Self::CodeExpired { .. } => "CODE_EXPIRED",
            Self::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            Self::StoreTimeout => "STORE_TIMEOUT",
            Self::CodeGenerationExhausted { .. } => "CODE_GENERATION_EXHAUSTED",
            Self::StoreRejected { .. } => "STORE_REJECTED",
            Self::Inconsistency { .. } => "INCONSISTENCY",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 瞬时故障（存储不可用、超时、兑换码生成碰撞耗尽）可以重试，
    /// 业务逻辑错误与存储端的 4xx 拒绝不应被重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. }
                | Self::StoreTimeout
                | Self::CodeGenerationExhausted { .. }
        )
    }
}
