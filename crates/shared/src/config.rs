//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::observability::ObservabilityConfig;
use crate::retry::RetryPolicy;

/// 远端存储网关重试配置
///
/// 以毫秒为单位配置，便于在测试环境中压缩退避时间。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// 转换为重试执行器使用的策略
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

/// 远端存储配置
///
/// 存储只暴露 REST 接口，所有表操作都经由 `{url}/rest/v1/{collection}`。
/// anon key 作为 apikey 请求头，service key 作为 Bearer 凭证。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub api_key: String,
    pub service_key: String,
    /// 单次请求的超时上限（秒），超时视为失败而非挂起
    pub timeout_seconds: u64,
    /// 慢请求告警阈值（毫秒）
    pub slow_request_threshold_ms: u64,
    pub retry: RetryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:54321".to_string(),
            api_key: "dev-anon-key".to_string(),
            service_key: "dev-service-key".to_string(),
            timeout_seconds: 30,
            slow_request_threshold_ms: 2_000,
            retry: RetryConfig::default(),
        }
    }
}

/// 进程内 TTL 缓存配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 默认 TTL（秒）
    pub default_ttl_seconds: u64,
    /// 用户数据缓存 TTL（秒）
    pub user_data_ttl_seconds: u64,
    /// API 响应缓存 TTL（秒）
    pub api_response_ttl_seconds: u64,
    /// 每 N 次写入触发一次过期项批量清理
    pub cleanup_every_inserts: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
            user_data_ttl_seconds: 600,
            api_response_ttl_seconds: 300,
            cleanup_every_inserts: 100,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（CREDITS_ 前缀，如 CREDITS_STORE_URL -> store.url）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("CREDITS_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            // 默认配置
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            // 加载默认配置文件
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            // 加载环境特定配置
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            // 加载服务特定配置（如 credit-ledger-service.toml）
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            // 环境变量覆盖（CREDITS_STORE_URL -> store.url）
            .add_source(
                Environment::with_prefix("CREDITS")
                    .separator("_")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.store.timeout_seconds, 30);
        assert_eq!(config.cache.default_ttl_seconds, 300);
        assert_eq!(config.cache.cleanup_every_inserts, 100);
    }

    #[test]
    fn test_retry_config_to_policy() {
        let retry = RetryConfig {
            max_retries: 5,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
            multiplier: 3.0,
        };
        let policy = retry.to_policy();

        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(2));
        assert!((policy.multiplier - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_is_production() {
        let config = AppConfig {
            environment: "production".to_string(),
            ..Default::default()
        };
        assert!(config.is_production());
        assert!(!AppConfig::default().is_production());
    }
}
