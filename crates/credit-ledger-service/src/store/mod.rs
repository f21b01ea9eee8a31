//! 远端存储访问层
//!
//! 存储只暴露按集合组织的 REST 接口，不提供多语句事务和行级锁。
//! 本模块定义逻辑表操作的抽象（[`StoreBackend`]）、过滤与查询构造，
//! 以及两个实现：HTTP 网关 [`gateway::StoreGateway`] 和
//! 内存实现 [`memory::MemoryStore`]（测试与本地开发用）。
//!
//! 通过 trait 抽象存储调用，便于测试时注入故障与桩数据。

pub mod gateway;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use credits_shared::error::Result;

pub use gateway::StoreGateway;
pub use memory::MemoryStore;

/// 集合名称
pub mod collections {
    pub const USERS: &str = "users";
    pub const REDEMPTION_CODES: &str = "redemption_codes";
    pub const USAGE_LOGS: &str = "usage_logs";
}

// ---------------------------------------------------------------------------
// Filter / Query — REST 查询参数构造
// ---------------------------------------------------------------------------

/// 过滤操作符，对应存储端的 `field=op.value` 查询语法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Is,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Is => "is",
        }
    }
}

/// 单个等值/比较过滤条件
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: String,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl ToString) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.to_string(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl ToString) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn gt(field: impl Into<String>, value: impl ToString) -> Self {
        Self::new(field, FilterOp::Gt, value)
    }

    pub fn lt(field: impl Into<String>, value: impl ToString) -> Self {
        Self::new(field, FilterOp::Lt, value)
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterOp::Is, "null")
    }

    /// 渲染为查询参数对，如 ("code", "eq.ABCD2345")
    pub fn to_query_pair(&self) -> (String, String) {
        (
            self.field.clone(),
            format!("{}.{}", self.op.as_str(), self.value),
        )
    }
}

/// 读取查询构造器
///
/// 支持列投影（含 `count` 聚合）、多条件过滤、排序与分页。
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub select: Option<String>,
    pub filters: Vec<Filter>,
    pub order: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// 列投影，如 "credits_value" 或聚合 "count"
    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.select = Some(columns.into());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// 排序，如 "used_at.desc"
    pub fn order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// 渲染为查询参数列表
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(select) = &self.select {
            params.push(("select".to_string(), select.clone()));
        }
        for filter in &self.filters {
            params.push(filter.to_query_pair());
        }
        if let Some(order) = &self.order {
            params.push(("order".to_string(), order.clone()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            params.push(("offset".to_string(), offset.to_string()));
        }
        params
    }
}

// ---------------------------------------------------------------------------
// StoreBackend — 存储操作抽象
// ---------------------------------------------------------------------------

/// 逻辑表操作的抽象接口
///
/// 引擎对存储的全部读写都经由该接口。所有失败都以 `CreditError`
/// 值返回，不会有异常越过此边界。每次调用对应一次独立的远端交互，
/// 多步工作流在存储侧不是原子单元——补偿逻辑因此存在。
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// 按查询读取行
    async fn select(&self, collection: &str, query: Query) -> Result<Vec<Value>>;

    /// 插入一行，返回存储端的行表示
    async fn insert(&self, collection: &str, data: Value) -> Result<Vec<Value>>;

    /// 按过滤条件更新，返回受影响的行
    async fn update(&self, collection: &str, filters: Vec<Filter>, data: Value)
    -> Result<Vec<Value>>;

    /// 按过滤条件删除，返回被删除的行
    async fn delete(&self, collection: &str, filters: Vec<Filter>) -> Result<Vec<Value>>;
}
