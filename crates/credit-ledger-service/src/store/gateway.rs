//! 远端存储 HTTP 网关
//!
//! 把每个逻辑表操作翻译成一次对存储 REST 端点的 HTTP 交互，
//! 对瞬时故障（连接错误、429、5xx）按退避策略重试，4xx 校验错误
//! 不重试。网关是引擎依赖的唯一网络边界，自身不含业务逻辑。
//!
//! 典型单次调用延迟在几十到几百毫秒，这是引擎侧尽量减少往返、
//! 并为多步工作流定义补偿动作的原因。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use credits_shared::config::StoreConfig;
use credits_shared::error::{CreditError, Result};
use credits_shared::retry::{RetryPolicy, retry_with_policy};

use super::{Filter, Query, StoreBackend};

/// 远端存储网关
///
/// 持有一个带连接池的 HTTP 客户端，clone 是廉价操作。
/// 所有请求携带固定的超时上限，超时视为失败而非挂起。
#[derive(Clone)]
pub struct StoreGateway {
    client: Client,
    base_url: String,
    retry_policy: RetryPolicy,
    slow_threshold: Duration,
}

impl StoreGateway {
    /// 根据配置创建网关
    ///
    /// anon key 作为 apikey 请求头，service key 作为 Bearer 凭证，
    /// `Prefer: return=representation` 让写操作返回受影响的行。
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("apikey"),
            header_value(&config.api_key)?,
        );
        headers.insert(
            AUTHORIZATION,
            header_value(&format!("Bearer {}", config.service_key))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static("prefer"),
            HeaderValue::from_static("return=representation"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| CreditError::Internal(format!("HTTP 客户端构建失败: {e}")))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            retry_policy: config.retry.to_policy(),
            slow_threshold: Duration::from_millis(config.slow_request_threshold_ms),
        })
    }

    fn endpoint(&self, collection: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, collection)
    }

    /// 执行一次带重试的逻辑表操作
    #[instrument(skip(self, data, params))]
    async fn execute(
        &self,
        method: Method,
        collection: &str,
        data: Option<Value>,
        params: Vec<(String, String)>,
    ) -> Result<Vec<Value>> {
        let operation = format!("{} /{}", method, collection);

        retry_with_policy(
            &self.retry_policy,
            &operation,
            CreditError::is_retryable,
            || {
                let method = method.clone();
                let data = data.clone();
                let params = params.clone();
                async move {
                    self.single_request(method, collection, data, params).await
                }
            },
        )
        .await
    }

    /// 发出单次 HTTP 请求并把响应归一化为行列表
    async fn single_request(
        &self,
        method: Method,
        collection: &str,
        data: Option<Value>,
        params: Vec<(String, String)>,
    ) -> Result<Vec<Value>> {
        let start = Instant::now();
        let mut request = self
            .client
            .request(method.clone(), self.endpoint(collection))
            .query(&params);
        if let Some(body) = &data {
            request = request.json(body);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let elapsed = start.elapsed();

        if elapsed > self.slow_threshold {
            warn!(
                collection,
                method = %method,
                elapsed_ms = elapsed.as_millis() as u64,
                "慢速存储请求"
            );
        }

        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;

        if status.is_success() {
            debug!(
                collection,
                method = %method,
                status = status.as_u16(),
                elapsed_ms = elapsed.as_millis() as u64,
                "存储请求完成"
            );
            return Self::parse_body(&body);
        }

        if is_transient_status(status) {
            Err(CreditError::StoreUnavailable {
                status: Some(status.as_u16()),
                message: body,
            })
        } else {
            Err(CreditError::StoreRejected {
                status: status.as_u16(),
                message: body,
            })
        }
    }

    /// 把响应体归一化为行列表
    ///
    /// 存储对空写返回空体，对单行/多行分别返回对象/数组。
    fn parse_body(body: &str) -> Result<Vec<Value>> {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(trimmed)?;
        Ok(match value {
            Value::Array(rows) => rows,
            other => vec![other],
        })
    }
}

fn header_value(raw: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(raw)
        .map_err(|e| CreditError::Internal(format!("非法的请求头取值: {e}")))
}

/// 瞬时状态码：限流与服务端错误
fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// 传输层错误归类：超时与连接故障都是瞬时错误
fn map_transport_error(err: reqwest::Error) -> CreditError {
    if err.is_timeout() {
        CreditError::StoreTimeout
    } else {
        CreditError::StoreUnavailable {
            status: None,
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl StoreBackend for StoreGateway {
    async fn select(&self, collection: &str, query: Query) -> Result<Vec<Value>> {
        self.execute(Method::GET, collection, None, query.to_params())
            .await
    }

    async fn insert(&self, collection: &str, data: Value) -> Result<Vec<Value>> {
        self.execute(Method::POST, collection, Some(data), Vec::new())
            .await
    }

    async fn update(
        &self,
        collection: &str,
        filters: Vec<Filter>,
        data: Value,
    ) -> Result<Vec<Value>> {
        let params = filters.iter().map(Filter::to_query_pair).collect();
        self.execute(Method::PATCH, collection, Some(data), params)
            .await
    }

    async fn delete(&self, collection: &str, filters: Vec<Filter>) -> Result<Vec<Value>> {
        let params = filters.iter().map(Filter::to_query_pair).collect();
        self.execute(Method::DELETE, collection, None, params).await
    }
}
