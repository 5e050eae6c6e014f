//! 常用类型一站式导入：`use mosaic_core::prelude::*;`。
//!
//! 只收录构建模型、装配应用与编写片段时高频出现的类型；诊断与底层原语仍请使用完整路径。

pub use serde_json::{Value, json};

pub use crate::{
    application::{Application, ApplicationStructure},
    composite::{
        CompositeInstance, CompositeRef, Concern, FragmentRef, Invocation, InvocationContext,
        Mixin, Next, NotEmpty, Predicate, QualifiedName, Range, SideEffect, StateParticipant,
    },
    config::RuntimeConfig,
    error::{CoreError, ErrorCategory, Result, codes},
    factory::{FragmentCreation, StaticTypeFactory},
    injection::{UsesBag, scope},
    lifecycle::{ActivationOutcome, LifecycleState, PassivationOutcome},
    model::{
        CompositeModel, DispatchMode, FragmentModel, FragmentRole, InjectionPoint, MethodModel,
        ParameterModel, PropertyModel, ServiceId, ServiceModel,
    },
    service::ServiceActionContext,
};
