//! 运行时可调参数。
//!
//! # 教案式说明
//! - **意图（Why）**：生命周期等待粒度、片段池空闲上限以及“随应用激活”的服务扫描开关，
//!   都属于部署相关的决定，不应硬编码在运行时核心；
//! - **逻辑（How）**：使用 `serde` 反序列化 TOML 文档，缺省字段回落到 [`Default`]；
//!   解析后统一经过 [`RuntimeConfig::validate`] 校验；
//! - **契约（What）**：任何非法值都以 [`codes::CONFIG_INVALID`] 报告，绝不在运行期 panic。

use std::time::Duration;

use serde::Deserialize;

use crate::error::{CoreError, Result, codes};

/// 运行时配置根节点。
///
/// ```toml
/// [lifecycle]
/// wait_slice_ms = 25
///
/// [pool]
/// max_idle_per_type = 64
///
/// [services]
/// activate_with_application = true
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub lifecycle: LifecycleConfig,
    pub pool: PoolConfig,
    pub services: ServicesConfig,
}

/// 生命周期等待参数。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleConfig {
    /// 单次条件变量等待的上限（毫秒）。
    ///
    /// 唤醒依赖通知；该值只是活性兜底，确保错过通知时等待者仍会重新检查状态。
    pub wait_slice_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { wait_slice_ms: 25 }
    }
}

/// 片段池参数。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// 每个片段类型保留的空闲实例上限，归还时超出部分直接丢弃。
    pub max_idle_per_type: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_type: 64,
        }
    }
}

/// 服务相关开关。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServicesConfig {
    /// 应用激活时是否同步激活声明了 `activate_with_application` 的服务。
    pub activate_with_application: bool,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            activate_with_application: true,
        }
    }
}

impl RuntimeConfig {
    /// 从 TOML 文本解析配置并校验。
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(text).map_err(|err| {
            CoreError::new(codes::CONFIG_INVALID, "failed to parse runtime configuration")
                .with_cause(err)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 校验取值范围。
    pub fn validate(&self) -> Result<()> {
        if self.lifecycle.wait_slice_ms == 0 {
            return Err(CoreError::new(
                codes::CONFIG_INVALID,
                "lifecycle.wait_slice_ms must be greater than zero",
            ));
        }
        Ok(())
    }

    /// 生命周期单次等待时长。
    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.lifecycle.wait_slice_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = RuntimeConfig::from_toml_str("").expect("空文档应回落到默认值");
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.wait_slice(), Duration::from_millis(25));
        assert!(config.services.activate_with_application);
    }

    #[test]
    fn partial_document_overrides_selected_fields() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [pool]
            max_idle_per_type = 4

            [services]
            activate_with_application = false
            "#,
        )
        .expect("合法文档");
        assert_eq!(config.pool.max_idle_per_type, 4);
        assert!(!config.services.activate_with_application);
        assert_eq!(config.lifecycle, LifecycleConfig::default());
    }

    #[test]
    fn zero_wait_slice_is_rejected() {
        let err = RuntimeConfig::from_toml_str("[lifecycle]\nwait_slice_ms = 0\n")
            .expect_err("零等待粒度必须被拒绝");
        assert_eq!(err.code(), codes::CONFIG_INVALID);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = RuntimeConfig::from_toml_str("[pool]\nmax_idle = 3\n")
            .expect_err("未知字段必须被拒绝");
        assert_eq!(err.code(), codes::CONFIG_INVALID);
        assert!(err.cause().is_some());
    }
}
