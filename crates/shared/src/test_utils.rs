//! 测试工具模块
//!
//! 提供集成测试所需的辅助函数和测试数据生成器。
//! 用于简化测试代码编写，提高测试的可重复性和可维护性。

use chrono::Utc;
use uuid::Uuid;

use crate::config::{RetryConfig, StoreConfig};

// ==================== 测试配置辅助 ====================

/// 创建测试用存储配置
///
/// 退避时间压缩到毫秒级，避免重试测试等待过久。
/// 优先使用环境变量中的存储地址，否则指向本地 mock。
pub fn test_store_config() -> StoreConfig {
    StoreConfig {
        url: std::env::var("TEST_STORE_URL")
            .unwrap_or_else(|_| "http://localhost:54321".to_string()),
        api_key: "test-anon-key".to_string(),
        service_key: "test-service-key".to_string(),
        timeout_seconds: 5,
        slow_request_threshold_ms: 2_000,
        retry: RetryConfig {
            max_retries: 2,
            initial_delay_ms: 1,
            max_delay_ms: 10,
            multiplier: 2.0,
        },
    }
}

// ==================== 测试数据生成 ====================

/// 生成唯一的测试用户 ID
pub fn test_user_id() -> String {
    format!("test-user-{}", Uuid::new_v4())
}

/// 生成唯一的测试日志 ID
///
/// 使用原子计数器确保并行测试时的唯一性
pub fn test_log_id() -> i64 {
    use std::sync::atomic::{AtomicI64, Ordering};
    static COUNTER: AtomicI64 = AtomicI64::new(0);
    let base = Utc::now().timestamp_micros() % 1_000_000_000;
    base + COUNTER.fetch_add(1, Ordering::SeqCst)
}
