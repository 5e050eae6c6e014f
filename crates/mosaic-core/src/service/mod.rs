//! 服务：按标识唯一、惰性物化、带独立生命周期的长生命周期组合。
//!
//! # 模块地图
//! - [`instance`]：[`ServiceCompositeInstance`] 与动作现场 [`ServiceActionContext`]；
//! - [`container`]：[`ServiceContainer`] 注册表与惰性 [`ServiceReference`]。

pub mod container;
pub mod instance;

pub use container::{ServiceContainer, ServiceReference};
pub use instance::{ServiceActionContext, ServiceCompositeInstance};
