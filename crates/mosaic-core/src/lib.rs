#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "mosaic-core: 片段组合对象（Composite）运行时核心。"]
#![doc = ""]
#![doc = "== 职责边界 =="]
#![doc = "1. 生命周期：应用与服务共用的恰好一次激活 / 钝化协议（`lifecycle`）；"]
#![doc = "2. 组合实例：视图索引、原型阶段、属性与事件状态，以及 concern → mixin → side effect 调用链（`composite`）；"]
#![doc = "3. 片段池：需要逐调用独占的片段按类型池化，借出永不阻塞（`composite::pool`）；"]
#![doc = "4. 依赖注入：按作用域登记的提供者，区分创建期与逐调用两种时机（`injection`）；"]
#![doc = "5. 服务注册表：按标识唯一、惰性物化与惰性激活的服务（`service`）。"]
#![doc = ""]
#![doc = "== 外部协作者 =="]
#![doc = "装配 DSL、模型发现与代码生成后端不在本 crate 内：`model` 提供显式构建的只读模型图，"]
#![doc = "`factory` 以 trait 表达类型工厂契约，并附带基于构造闭包表的静态实现。"]

pub mod application;
pub mod composite;
pub mod config;
pub mod error;
pub mod factory;
pub mod injection;
pub mod lifecycle;
pub mod model;
pub mod observability;
pub mod prelude;
pub mod service;

pub use application::{Application, ApplicationBuilder, ApplicationStructure};
pub use composite::{
    CompositeInstance, CompositeRef, Concern, Invocation, InvocationContext, Mixin, Next,
    SideEffect,
};
pub use config::RuntimeConfig;
pub use error::{CoreError, ErrorCategory, ErrorDetail, Result, codes};
pub use factory::{StaticTypeFactory, TypeFactory};
pub use injection::{InjectionProvider, InjectionResolver, InjectionScope, UsesBag};
pub use lifecycle::{
    ActivationOutcome, Cancellation, LifecycleController, LifecycleState, PassivationOutcome,
    TransitionOwner,
};
pub use model::{CompositeModel, ServiceId, ServiceModel};
pub use service::{ServiceCompositeInstance, ServiceContainer, ServiceReference};
