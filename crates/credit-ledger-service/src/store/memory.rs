//! 内存存储实现
//!
//! 模拟远端存储的行为（等值/比较过滤、count 聚合、列投影、排序、分页），
//! 供引擎单元测试与本地开发使用，无需真实网络连接。
//!
//! 支持按（操作, 集合）注入故障：`fail_after(op, collection, n)` 允许
//! 前 n 次调用成功、其后全部失败，用于验证多步工作流的补偿路径。

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use credits_shared::error::{CreditError, Result};

use super::{Filter, FilterOp, Query, StoreBackend};

type OpKey = (String, String);

/// 内存存储
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Vec<Value>>>,
    /// (操作, 集合) -> 允许成功的调用次数，超出后注入故障
    fail_plan: RwLock<HashMap<OpKey, u32>>,
    calls: RwLock<HashMap<OpKey, u32>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置集合数据
    pub async fn seed(&self, collection: &str, rows: Vec<Value>) {
        let mut tables = self.tables.write().await;
        tables.entry(collection.to_string()).or_default().extend(rows);
    }

    /// 读取集合当前的全部行（测试断言用）
    pub async fn rows(&self, collection: &str) -> Vec<Value> {
        let tables = self.tables.read().await;
        tables.get(collection).cloned().unwrap_or_default()
    }

    /// 从下一次调用起对（操作, 集合）注入故障
    pub async fn fail_on(&self, op: &str, collection: &str) {
        self.fail_after(op, collection, 0).await;
    }

    /// 允许前 `allowed` 次调用成功，其后对（操作, 集合）注入故障
    pub async fn fail_after(&self, op: &str, collection: &str, allowed: u32) {
        let mut plan = self.fail_plan.write().await;
        plan.insert((op.to_string(), collection.to_string()), allowed);
    }

    /// 清除全部故障注入与调用计数
    pub async fn clear_faults(&self) {
        self.fail_plan.write().await.clear();
        self.calls.write().await.clear();
    }

    /// 记录调用并按注入计划决定是否失败
    async fn check_fault(&self, op: &str, collection: &str) -> Result<()> {
        let key = (op.to_string(), collection.to_string());
        let seen = {
            let mut calls = self.calls.write().await;
            let n = calls.entry(key.clone()).or_insert(0);
            *n += 1;
            *n
        };

        let plan = self.fail_plan.read().await;
        if let Some(allowed) = plan.get(&key) {
            if seen > *allowed {
                return Err(CreditError::StoreUnavailable {
                    status: Some(503),
                    message: format!("注入的故障: {op} {collection}"),
                });
            }
        }
        Ok(())
    }
}

/// 行字段与过滤取值的序比较
///
/// 时间戳字符串按时刻比较而非字典序，数字按数值比较。
fn ordering_of(actual: &Value, expected: &str) -> Option<Ordering> {
    match actual {
        Value::Bool(b) => expected.parse::<bool>().ok().map(|e| b.cmp(&e)),
        Value::Number(n) => {
            let a = n.as_f64()?;
            let e = expected.parse::<f64>().ok()?;
            a.partial_cmp(&e)
        }
        Value::String(s) => {
            if let (Ok(a), Ok(e)) = (
                DateTime::parse_from_rfc3339(s),
                DateTime::parse_from_rfc3339(expected),
            ) {
                Some(a.cmp(&e))
            } else {
                Some(s.as_str().cmp(expected))
            }
        }
        _ => None,
    }
}

fn matches(row: &Value, filter: &Filter) -> bool {
    let field_value = row.get(&filter.field);

    if filter.op == FilterOp::Is {
        // 仅支持 is.null 判空
        return filter.value == "null"
            && matches!(field_value, None | Some(Value::Null));
    }

    let Some(actual) = field_value else {
        return false;
    };
    let Some(ord) = ordering_of(actual, &filter.value) else {
        return false;
    };
    match filter.op {
        FilterOp::Eq => ord == Ordering::Equal,
        FilterOp::Neq => ord != Ordering::Equal,
        FilterOp::Gt => ord == Ordering::Greater,
        FilterOp::Gte => ord != Ordering::Less,
        FilterOp::Lt => ord == Ordering::Less,
        FilterOp::Lte => ord != Ordering::Greater,
        FilterOp::Is => unreachable!(),
    }
}

fn matches_all(row: &Value, filters: &[Filter]) -> bool {
    filters.iter().all(|f| matches(row, f))
}

/// 两行之间按排序字段比较（空值排在最后）
fn compare_rows(a: &Value, b: &Value, field: &str) -> Ordering {
    match (a.get(field), b.get(field)) {
        (Some(av), Some(bv)) => {
            let rendered = render_scalar(bv);
            ordering_of(av, &rendered).unwrap_or(Ordering::Equal)
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn select(&self, collection: &str, query: Query) -> Result<Vec<Value>> {
        self.check_fault("select", collection).await?;

        let tables = self.tables.read().await;
        let mut rows: Vec<Value> = tables
            .get(collection)
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches_all(row, &query.filters))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        // count 聚合与真实存储一样返回单行
        if query.select.as_deref() == Some("count") {
            return Ok(vec![serde_json::json!({ "count": rows.len() })]);
        }

        if let Some(order) = &query.order {
            let (field, descending) = match order.rsplit_once('.') {
                Some((field, "desc")) => (field.to_string(), true),
                Some((field, "asc")) => (field.to_string(), false),
                _ => (order.clone(), false),
            };
            rows.sort_by(|a, b| {
                let ord = compare_rows(a, b, &field);
                if descending { ord.reverse() } else { ord }
            });
        }

        if let Some(offset) = query.offset {
            rows = rows.into_iter().skip(offset as usize).collect();
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit as usize);
        }

        // 列投影
        if let Some(select) = &query.select {
            if select != "*" {
                let columns: Vec<&str> = select.split(',').map(str::trim).collect();
                rows = rows
                    .into_iter()
                    .map(|row| {
                        let mut projected = Map::new();
                        for column in &columns {
                            if let Some(v) = row.get(*column) {
                                projected.insert((*column).to_string(), v.clone());
                            }
                        }
                        Value::Object(projected)
                    })
                    .collect();
            }
        }

        Ok(rows)
    }

    async fn insert(&self, collection: &str, data: Value) -> Result<Vec<Value>> {
        self.check_fault("insert", collection).await?;

        let mut tables = self.tables.write().await;
        tables
            .entry(collection.to_string())
            .or_default()
            .push(data.clone());
        Ok(vec![data])
    }

    async fn update(
        &self,
        collection: &str,
        filters: Vec<Filter>,
        data: Value,
    ) -> Result<Vec<Value>> {
        self.check_fault("update", collection).await?;

        let patch = data
            .as_object()
            .ok_or_else(|| CreditError::Internal("更新载荷必须是对象".to_string()))?
            .clone();

        let mut tables = self.tables.write().await;
        let mut updated = Vec::new();
        if let Some(rows) = tables.get_mut(collection) {
            for row in rows.iter_mut() {
                if matches_all(row, &filters) {
                    if let Some(object) = row.as_object_mut() {
                        for (key, value) in &patch {
                            object.insert(key.clone(), value.clone());
                        }
                    }
                    updated.push(row.clone());
                }
            }
        }
        Ok(updated)
    }

    async fn delete(&self, collection: &str, filters: Vec<Filter>) -> Result<Vec<Value>> {
        self.check_fault("delete", collection).await?;

        let mut tables = self.tables.write().await;
        let mut removed = Vec::new();
        if let Some(rows) = tables.get_mut(collection) {
            rows.retain(|row| {
                if matches_all(row, &filters) {
                    removed.push(row.clone());
                    false
                } else {
                    true
                }
            });
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_rows() -> Vec<Value> {
        vec![
            json!({"code": "AAAA", "credits_value": 25, "is_used": false,
                   "expires_at": "2026-01-01T00:00:00Z"}),
            json!({"code": "BBBB", "credits_value": 50, "is_used": true,
                   "expires_at": null, "used_at": "2026-06-01T08:00:00Z"}),
            json!({"code": "CCCC", "credits_value": 100, "is_used": true,
                   "expires_at": "2027-01-01T00:00:00Z", "used_at": "2026-07-01T08:00:00Z"}),
        ]
    }

    #[tokio::test]
    async fn test_select_with_filters() {
        let store = MemoryStore::new();
        store.seed("redemption_codes", sample_rows()).await;

        let used = store
            .select(
                "redemption_codes",
                Query::new().filter(Filter::eq("is_used", true)),
            )
            .await
            .unwrap();
        assert_eq!(used.len(), 2);

        let big = store
            .select(
                "redemption_codes",
                Query::new().filter(Filter::gt("credits_value", 30)),
            )
            .await
            .unwrap();
        assert_eq!(big.len(), 2);
    }

    #[tokio::test]
    async fn test_select_count_aggregate() {
        let store = MemoryStore::new();
        store.seed("redemption_codes", sample_rows()).await;

        let rows = store
            .select(
                "redemption_codes",
                Query::new()
                    .select("count")
                    .filter(Filter::eq("is_used", true)),
            )
            .await
            .unwrap();
        assert_eq!(rows[0]["count"], 2);
    }

    #[tokio::test]
    async fn test_select_projection_and_order() {
        let store = MemoryStore::new();
        store.seed("redemption_codes", sample_rows()).await;

        let rows = store
            .select(
                "redemption_codes",
                Query::new()
                    .select("credits_value")
                    .filter(Filter::eq("is_used", true))
                    .order("used_at.desc"),
            )
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        // 最近使用的排在前面
        assert_eq!(rows[0], json!({"credits_value": 100}));
        assert_eq!(rows[1], json!({"credits_value": 50}));
    }

    #[tokio::test]
    async fn test_timestamp_filters_compare_instants() {
        let store = MemoryStore::new();
        store.seed("redemption_codes", sample_rows()).await;

        // 带 +00:00 后缀的取值应与 Z 后缀行正确比较
        let expired = store
            .select(
                "redemption_codes",
                Query::new().filter(Filter::lt("expires_at", "2026-06-01T00:00:00+00:00")),
            )
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0]["code"], "AAAA");
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let store = MemoryStore::new();
        store.seed("redemption_codes", sample_rows()).await;

        let updated = store
            .update(
                "redemption_codes",
                vec![Filter::eq("code", "AAAA")],
                json!({"is_used": true, "used_by_user_id": "u-1"}),
            )
            .await
            .unwrap();

        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0]["is_used"], true);
        // 未出现在补丁中的字段保持不变
        assert_eq!(updated[0]["credits_value"], 25);
    }

    #[tokio::test]
    async fn test_delete_returns_removed_rows() {
        let store = MemoryStore::new();
        store.seed("redemption_codes", sample_rows()).await;

        let removed = store
            .delete("redemption_codes", vec![Filter::eq("is_used", false)])
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(store.rows("redemption_codes").await.len(), 2);
    }

    #[tokio::test]
    async fn test_fault_injection_after_allowed_calls() {
        let store = MemoryStore::new();
        store.seed("users", vec![json!({"user_id": "u-1"})]).await;
        store.fail_after("update", "users", 1).await;

        // 第一次允许成功
        assert!(
            store
                .update("users", vec![Filter::eq("user_id", "u-1")], json!({"credits": 1}))
                .await
                .is_ok()
        );
        // 第二次注入故障
        let err = store
            .update("users", vec![Filter::eq("user_id", "u-1")], json!({"credits": 2}))
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::StoreUnavailable { .. }));

        store.clear_faults().await;
        assert!(
            store
                .update("users", vec![Filter::eq("user_id", "u-1")], json!({"credits": 3}))
                .await
                .is_ok()
        );
    }
}
