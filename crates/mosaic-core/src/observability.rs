//! 可观测性：结构化日志字段键名与订阅者安装入口。
//!
//! # 教案式说明
//! - **意图（Why）**：生命周期跃迁、片段池与注入解析分散在多个模块，日志字段若各自命名会导致检索困难；
//! - **逻辑（How）**：[`keys`] 集中登记字段名，`tracing` 宏中的字段与之逐字一致；
//!   [`install_subscriber`] 组装 `fmt + EnvFilter` 订阅者并注册为全局默认；
//! - **契约（What）**：运行时核心只通过 `tracing` 宏发出事件，是否输出、输出到哪里完全由宿主决定。

use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

use crate::error::{CoreError, Result, codes};

/// 日志字段键名。
pub mod keys {
    /// 发生跃迁的目标（`application` 或服务标识）。
    pub const LIFECYCLE_TARGET: &str = "lifecycle.target";
    /// 跃迁前状态。
    pub const LIFECYCLE_FROM: &str = "lifecycle.from";
    /// 跃迁后状态。
    pub const LIFECYCLE_TO: &str = "lifecycle.to";
    /// 跃迁所有者令牌。
    pub const LIFECYCLE_OWNER: &str = "lifecycle.owner";
    /// 服务标识。
    pub const SERVICE_ID: &str = "service.id";
    /// 组合模型名称。
    pub const COMPOSITE_MODEL: &str = "composite.model";
    /// 片段类型标识。
    pub const FRAGMENT_ID: &str = "fragment.id";
    /// 方法名。
    pub const METHOD_NAME: &str = "method.name";
    /// 错误码。
    pub const ERROR_CODE: &str = "error.code";
}

/// 安装全局 `tracing` 订阅者。
///
/// - **输入**：`directives` 为 `EnvFilter` 语法，例如 `"mosaic_core=debug"`；为空时回落到 `RUST_LOG`，再回落到 `info`；
/// - **错误**：若外部已设置全局订阅者，返回 [`codes::OBSERVABILITY_SUBSCRIBER_INSTALL_FAILED`]。
pub fn install_subscriber(directives: &str) -> Result<()> {
    if dispatcher::has_been_set() {
        return Err(CoreError::new(
            codes::OBSERVABILITY_SUBSCRIBER_INSTALL_FAILED,
            "a global tracing subscriber is already installed",
        ));
    }
    let filter = build_env_filter(directives)?;
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber).map_err(|err| {
        CoreError::new(
            codes::OBSERVABILITY_SUBSCRIBER_INSTALL_FAILED,
            "failed to set the global tracing subscriber",
        )
        .with_cause(err)
    })
}

fn build_env_filter(directives: &str) -> Result<EnvFilter> {
    if directives.trim().is_empty() {
        return Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    }
    EnvFilter::try_new(directives).map_err(|err| {
        CoreError::new(
            codes::OBSERVABILITY_SUBSCRIBER_INSTALL_FAILED,
            format!("invalid filter directives `{directives}`"),
        )
        .with_cause(err)
    })
}
