//! 积分台账与兑换服务核心
//!
//! 面向无事务 REST 存储的积分记账引擎：所有多步状态变更（余额变更 +
//! 审计日志、兑换码核销 + 入账 + 审计日志）都表达为显式的有序写序列，
//! 每一步带有定义好的补偿动作，以在存储不提供原生事务的前提下逼近原子性。
//!
//! 模块划分：
//! - [`store`]: 远端存储网关（唯一的网络边界）与查询构造
//! - [`cache`]: 进程级 TTL 缓存，读路径的挡板
//! - [`ledger`]: 积分台账引擎（余额变更 + 审计 + 补偿）
//! - [`redemption`]: 兑换码生成与核销引擎
//! - [`stats`]: 管理端只读统计
//! - [`service`]: 对外操作门面（被上层 HTTP 路由消费）
//! - [`worker`]: 过期兑换码维护清理

pub mod cache;
pub mod dto;
pub mod ledger;
pub mod models;
pub mod redemption;
pub mod service;
pub mod stats;
pub mod store;
pub mod worker;
