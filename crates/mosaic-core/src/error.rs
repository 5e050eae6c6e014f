//! 运行时统一错误域。
//!
//! # 教案式导航
//! - **定位（Where）**：生命周期、调用链、注入解析与服务注册表产生的所有失败最终都收敛为 [`CoreError`]；
//! - **动机（Why）**：同一次状态跃迁可能被多个线程同时观察，错误对象必须可廉价克隆，
//!   才能把“完全相同”的失败交给每一个等待者；
//! - **结构（How）**：稳定错误码 + 人类可读消息 + [`ErrorCategory`] + 可选结构化细节 [`ErrorDetail`] + 可选底层原因。

use std::{borrow::Cow, error::Error as StdError, fmt, sync::Arc};

use thiserror::Error;

use crate::composite::constraint::ViolationReport;

/// 底层原因的共享表示。
pub type ErrorCause = Arc<dyn StdError + Send + Sync + 'static>;

/// 稳定错误码表，命名遵循 `<领域>.<语义>`。
pub mod codes {
    /// 在自身的钝化流程内部请求激活。
    pub const LIFECYCLE_ACTIVATION_DURING_PASSIVATION: &str =
        "lifecycle.activation_during_passivation";
    /// 在自身的激活流程内部请求钝化。
    pub const LIFECYCLE_PASSIVATION_DURING_ACTIVATION: &str =
        "lifecycle.passivation_during_activation";
    /// 应用级钝化已开始，拒绝新的惰性激活。
    pub const LIFECYCLE_ACTIVATION_NOT_ALLOWED: &str = "lifecycle.activation_not_allowed";
    /// 激活动作失败，状态已回滚为 PASSIVE。
    pub const LIFECYCLE_ACTIVATION_FAILED: &str = "lifecycle.activation_failed";
    /// 钝化扫描中累积了一个或多个失败。
    pub const LIFECYCLE_PASSIVATION_FAILED: &str = "lifecycle.passivation_failed";
    /// 必选注入点无法解析。
    pub const INJECTION_UNRESOLVED: &str = "injection.unresolved";
    /// 属性或参数违反声明的约束。
    pub const CONSTRAINT_VIOLATED: &str = "constraint.violated";
    /// 请求的方法不存在于组合模型中。
    pub const COMPOSITE_UNKNOWN_METHOD: &str = "composite.unknown_method";
    /// 请求的接口视图未被组合实现。
    pub const COMPOSITE_UNKNOWN_VIEW: &str = "composite.unknown_view";
    /// 原型阶段结束后写入不可变属性。
    pub const COMPOSITE_IMMUTABLE_PROPERTY: &str = "composite.immutable_property";
    /// 按限定名查找属性或事件失败。
    pub const COMPOSITE_UNKNOWN_PROPERTY: &str = "composite.unknown_property";
    /// 服务标识未注册。
    pub const SERVICE_UNKNOWN: &str = "service.unknown";
    /// 类型工厂未能创建片段实例。
    pub const FACTORY_CREATION_FAILED: &str = "factory.creation_failed";
    /// 配置文档非法。
    pub const CONFIG_INVALID: &str = "config.invalid";
    /// 全局 tracing 订阅者安装失败。
    pub const OBSERVABILITY_SUBSCRIBER_INSTALL_FAILED: &str =
        "observability.subscriber_install_failed";
    /// 应用中未声明该组合模型。
    pub const APPLICATION_UNKNOWN_COMPOSITE: &str = "application.unknown_composite";
    /// 组合或服务模型在构建时未通过结构检查。
    pub const MODEL_INVALID: &str = "model.invalid";
    /// 片段自身在业务逻辑中报告的失败。
    pub const FRAGMENT_FAILED: &str = "fragment.failed";
}

/// 错误的处置分类，决定调用方能否直接重试。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// 可重试：例如激活失败后状态已回滚为 PASSIVE。
    Retryable,
    /// 不可重试：例如约束违例、钝化失败。
    NonRetryable,
    /// 编程错误：调用顺序本身非法，重试没有意义。
    ProgrammingError,
}

/// 附着在 [`CoreError`] 上的结构化细节。
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ErrorDetail {
    /// 按限定成员名分组的约束违例报告。
    Violations(ViolationReport),
    /// 钝化扫描期间累积的全部失败，按发生顺序排列。
    Aggregate(Vec<CoreError>),
    /// 未解析的注入点及其所属片段。
    Injection {
        fragment: Cow<'static, str>,
        point: Cow<'static, str>,
    },
}

/// 运行时核心错误。
///
/// # 契约说明（What）
/// - `code`：稳定字符串，取自 [`codes`]；
/// - `message`：面向排障人员的描述；
/// - `category`：默认 [`ErrorCategory::NonRetryable`]；
/// - `detail`：可选结构化细节，供测试与上层逻辑做精确断言；
/// - `cause`：可选底层原因，经 `source()` 暴露。
///
/// # 风险提示（Trade-offs）
/// - 克隆只复制 `Arc` 与少量字符串；聚合错误会复制其子错误列表，
///   这在钝化这种低频路径上可以接受。
#[derive(Clone, Debug, Error)]
#[error("[{code}] {message}")]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    category: ErrorCategory,
    detail: Option<ErrorDetail>,
    #[source]
    cause: Option<ErrorCause>,
}

impl CoreError {
    /// 构造核心错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            category: ErrorCategory::NonRetryable,
            detail: None,
            cause: None,
        }
    }

    /// 片段业务失败的便捷构造。
    pub fn fragment(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::FRAGMENT_FAILED, message)
    }

    /// 附带处置分类。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    /// 附带结构化细节。
    pub fn with_detail(mut self, detail: ErrorDetail) -> Self {
        self.detail = Some(detail);
        self
    }

    /// 附带底层原因。
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// 把一组失败合并成一个错误，消息中逐条列出每个失败。
    ///
    /// # 契约说明（What）
    /// - **前置条件**：`errors` 非空；调用方在列表为空时不应构造聚合错误；
    /// - **后置条件**：返回错误的 [`ErrorDetail::Aggregate`] 按原顺序保存全部子错误，一个都不丢弃。
    pub fn aggregate(code: &'static str, headline: &str, errors: Vec<CoreError>) -> Self {
        let listing = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Self::new(
            code,
            format!("{headline}: {} failure(s): {listing}", errors.len()),
        )
        .with_detail(ErrorDetail::Aggregate(errors))
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 描述信息。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 处置分类。
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// 结构化细节。
    pub fn detail(&self) -> Option<&ErrorDetail> {
        self.detail.as_ref()
    }

    /// 底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 底层原因本身是 [`CoreError`] 时返回它，例如激活失败包裹的原始错误。
    pub fn core_cause(&self) -> Option<&CoreError> {
        self.cause
            .as_deref()
            .and_then(|cause| cause.downcast_ref::<CoreError>())
    }

    /// 若为约束违例，返回违例报告。
    pub fn violations(&self) -> Option<&ViolationReport> {
        match &self.detail {
            Some(ErrorDetail::Violations(report)) => Some(report),
            _ => None,
        }
    }

    /// 若为聚合错误，返回子错误列表。
    pub fn aggregated(&self) -> &[CoreError] {
        match &self.detail {
            Some(ErrorDetail::Aggregate(errors)) => errors,
            _ => &[],
        }
    }

    /// 是否可直接重试。
    pub fn is_retryable(&self) -> bool {
        self.category == ErrorCategory::Retryable
    }
}

impl PartialEq for CoreError {
    /// 两个错误在码值、消息与细节形状一致时视为相等；底层原因只比较是否同一对象。
    fn eq(&self, other: &Self) -> bool {
        let cause_eq = match (&self.cause, &other.cause) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        self.code == other.code
            && self.message == other.message
            && self.category == other.category
            && detail_eq(self.detail.as_ref(), other.detail.as_ref())
            && cause_eq
    }
}

fn detail_eq(left: Option<&ErrorDetail>, right: Option<&ErrorDetail>) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(ErrorDetail::Violations(a)), Some(ErrorDetail::Violations(b))) => a == b,
        (Some(ErrorDetail::Aggregate(a)), Some(ErrorDetail::Aggregate(b))) => a == b,
        (
            Some(ErrorDetail::Injection {
                fragment: fa,
                point: pa,
            }),
            Some(ErrorDetail::Injection {
                fragment: fb,
                point: pb,
            }),
        ) => fa == fb && pa == pb,
        _ => false,
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCategory::Retryable => "retryable",
            ErrorCategory::NonRetryable => "non-retryable",
            ErrorCategory::ProgrammingError => "programming-error",
        };
        f.write_str(label)
    }
}

/// crate 级 `Result` 别名。
pub type Result<T, E = CoreError> = core::result::Result<T, E>;
