//! 进程级 TTL 缓存
//!
//! 为资料/统计类读路径挡住对远端存储的重复读取。整个进程共享一个
//! 实例，生命周期随进程创建与销毁，不跨重启持久化；所有访问都经由
//! 本模块的窄接口，便于将来替换为分布式缓存而不触碰引擎逻辑。
//!
//! ## 过期策略
//!
//! 惰性过期：读到过期条目按未命中处理并立即驱逐，无后台扫描线程；
//! 同时每 N 次写入触发一次批量清理，限制无人再读的条目带来的内存增长。
//!
//! ## 失败语义
//!
//! 缓存层故障（序列化失败等）降级为"始终未命中"，绝不向调用方抛出。

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use credits_shared::error::Result;

/// 用户作用域数据的键命名空间
pub const USER_DATA_PREFIX: &str = "user_data";
/// API 响应缓存的键命名空间
pub const API_RESPONSE_PREFIX: &str = "api_response";

/// 缓存条目
struct CacheEntry {
    value: Value,
    /// 保留用于调试与驱逐策略扩展
    #[allow(dead_code)]
    created_at: Instant,
    #[allow(dead_code)]
    last_accessed: Instant,
    expires_at: Instant,
}

/// 缓存统计信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_items: usize,
    pub active_items: usize,
    pub expired_items: usize,
    /// 以序列化长度估算的内存占用（字节）
    pub memory_usage_estimate: usize,
}

/// 进程级 TTL 缓存
///
/// 内部使用分片并发映射，可被任意数量的 worker 并发读写；
/// 不承诺跨键原子性。
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    /// 每 N 次写入触发一次过期清理
    cleanup_every: u64,
    insert_count: AtomicU64,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_cleanup_every(100)
    }

    pub fn with_cleanup_every(cleanup_every: u64) -> Self {
        Self {
            entries: DashMap::new(),
            cleanup_every: cleanup_every.max(1),
            insert_count: AtomicU64::new(0),
        }
    }

    /// 获取缓存值
    ///
    /// 过期条目按未命中处理并立即驱逐；反序列化失败降级为未命中。
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        {
            let mut entry = self.entries.get_mut(key)?;
            if now <= entry.expires_at {
                entry.last_accessed = now;
                let value = entry.value.clone();
                drop(entry);
                return match serde_json::from_value(value) {
                    Ok(parsed) => Some(parsed),
                    Err(e) => {
                        warn!(key, error = %e, "缓存反序列化失败，按未命中处理");
                        None
                    }
                };
            }
        }
        // 惰性过期
        self.entries.remove(key);
        None
    }

    /// 设置缓存值
    ///
    /// 序列化失败只告警并跳过写入，调用方不受影响。
    pub fn set<T: Serialize>(&self, key: impl Into<String>, value: &T, ttl: Duration) {
        let serialized = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "缓存序列化失败，跳过写入");
                return;
            }
        };

        let now = Instant::now();
        self.entries.insert(
            key.into(),
            CacheEntry {
                value: serialized,
                created_at: now,
                last_accessed: now,
                expires_at: now + ttl,
            },
        );

        let count = self.insert_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.cleanup_every == 0 {
            let removed = self.cleanup_expired();
            debug!(removed, "定期清理过期缓存项");
        }
    }

    /// 删除缓存项
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// 清空所有缓存
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// 移除指定主体（用户）名下的全部缓存项
    ///
    /// 只清除 `user_data:<操作>:<主体>:<参数哈希>` 命名空间中主体段
    /// 精确匹配的条目，其它主体与 api_response 命名空间不受影响。
    pub fn invalidate_subject(&self, subject_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| {
            !(key.starts_with(USER_DATA_PREFIX)
                && key.split(':').nth(2) == Some(subject_id))
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(subject_id, removed, "已失效主体缓存");
        }
        removed
    }

    /// 批量清理过期条目
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now <= entry.expires_at);
        before.saturating_sub(self.entries.len())
    }

    /// 获取缓存统计信息
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let mut total = 0usize;
        let mut expired = 0usize;
        let mut memory = 0usize;
        for entry in self.entries.iter() {
            total += 1;
            if now > entry.expires_at {
                expired += 1;
            }
            memory += entry.value.to_string().len();
        }
        CacheStats {
            total_items: total,
            active_items: total - expired,
            expired_items: expired,
            memory_usage_estimate: memory,
        }
    }

    /// 读穿透：命中直接返回，未命中调用 producer 并以给定 TTL 缓存结果
    ///
    /// 同键并发未命中可能各自调用一次 producer——读是幂等的，可以接受。
    pub async fn get_or_load<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        producer: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(cached) = self.get::<T>(key) {
            return Ok(cached);
        }

        let value = producer().await?;
        self.set(key, &value, ttl);
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// CacheKey — 键命名空间构造
// ---------------------------------------------------------------------------

/// 缓存键生成器
///
/// 键是 {操作标识, 相关参数, 主体 ID} 的确定性函数：不同用户的
/// 资料互不碰撞，参数变化产生新键而非脏命中。
pub struct CacheKey;

impl CacheKey {
    /// 用户作用域数据键: `user_data:<操作>:<用户>:<参数哈希>`
    pub fn user_data(operation: &str, user_id: &str, args: &[&str]) -> String {
        format!(
            "{}:{}:{}:{}",
            USER_DATA_PREFIX,
            operation,
            user_id,
            Self::args_hash(args)
        )
    }

    /// API 响应键: `api_response:<操作>:<参数哈希>`
    pub fn api_response(operation: &str, args: &[&str]) -> String {
        format!(
            "{}:{}:{}",
            API_RESPONSE_PREFIX,
            operation,
            Self::args_hash(args)
        )
    }

    /// 参数哈希（取 SHA-256 前 8 字节的十六进制表示）
    fn args_hash(args: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for arg in args {
            hasher.update(arg.as_bytes());
            // 参数分隔符，避免 ["ab","c"] 与 ["a","bc"] 同键
            hasher.update([0u8]);
        }
        hasher
            .finalize()
            .iter()
            .take(8)
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}
