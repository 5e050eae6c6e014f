//! 内建作用域的提供者。

use std::sync::Arc;

use super::{InjectedValue, InjectionContext, InjectionProvider, InjectionTiming};
use crate::model::{CompositeModel, InjectionPoint, ServiceId, TypeKey};

/// `This`：目标为空时注入第一个公开视图，否则注入指定类型的视图。
#[derive(Debug, Default)]
pub struct ThisProvider;

impl InjectionProvider for ThisProvider {
    fn can_resolve(&self, point: &InjectionPoint, model: &CompositeModel) -> bool {
        let Some(target) = point.target() else {
            return !model.public_facades().is_empty();
        };
        let key = TypeKey::from(target);
        model
            .public_facades()
            .iter()
            .chain(model.private_facades())
            .any(|facade| facade.implements(&key))
    }

    fn timing(&self, _point: &InjectionPoint, _model: &CompositeModel) -> InjectionTiming {
        InjectionTiming::OnCreation
    }

    fn provide(&self, point: &InjectionPoint, context: &InjectionContext<'_>) -> Option<InjectedValue> {
        let key = point.target().map(TypeKey::from);
        let handle = context.composite().self_ref(key.as_ref())?;
        Some(Arc::new(handle))
    }
}

/// `State`：目标必须是模型声明的属性或事件的限定名（`类型:成员`）。
#[derive(Debug, Default)]
pub struct StateProvider;

impl InjectionProvider for StateProvider {
    fn can_resolve(&self, point: &InjectionPoint, model: &CompositeModel) -> bool {
        let target = point.target_name();
        model
            .properties()
            .iter()
            .map(|p| p.name())
            .chain(model.events().iter().map(|e| e.name()))
            .any(|name| name.to_string() == target)
    }

    fn timing(&self, _point: &InjectionPoint, _model: &CompositeModel) -> InjectionTiming {
        InjectionTiming::OnCreation
    }

    fn provide(&self, point: &InjectionPoint, context: &InjectionContext<'_>) -> Option<InjectedValue> {
        let participant = context.composite().state().participant(point.target_name())?;
        Some(Arc::new(participant))
    }
}

/// `Structure`：注入 [`ApplicationStructure`](crate::application::ApplicationStructure) 句柄。
#[derive(Debug, Default)]
pub struct StructureProvider;

impl InjectionProvider for StructureProvider {
    fn can_resolve(&self, _point: &InjectionPoint, _model: &CompositeModel) -> bool {
        true
    }

    fn timing(&self, _point: &InjectionPoint, _model: &CompositeModel) -> InjectionTiming {
        InjectionTiming::OnCreation
    }

    fn provide(&self, _point: &InjectionPoint, context: &InjectionContext<'_>) -> Option<InjectedValue> {
        let structure: InjectedValue = Arc::clone(context.composite().structure()) as InjectedValue;
        Some(structure)
    }
}

/// `Uses`：从组合创建参数中按名字取值。
#[derive(Debug, Default)]
pub struct UsesProvider;

impl InjectionProvider for UsesProvider {
    fn can_resolve(&self, _point: &InjectionPoint, _model: &CompositeModel) -> bool {
        true
    }

    fn timing(&self, _point: &InjectionPoint, _model: &CompositeModel) -> InjectionTiming {
        InjectionTiming::OnCreation
    }

    fn provide(&self, point: &InjectionPoint, context: &InjectionContext<'_>) -> Option<InjectedValue> {
        context.composite().uses().get(point.target_name())
    }
}

/// `Invocation`：每次调用注入 [`InvocationInfo`](super::InvocationInfo)。
#[derive(Debug, Default)]
pub struct InvocationProvider;

impl InjectionProvider for InvocationProvider {
    fn can_resolve(&self, _point: &InjectionPoint, _model: &CompositeModel) -> bool {
        true
    }

    fn timing(&self, _point: &InjectionPoint, _model: &CompositeModel) -> InjectionTiming {
        InjectionTiming::OnEveryInvocation
    }

    fn provide(&self, _point: &InjectionPoint, context: &InjectionContext<'_>) -> Option<InjectedValue> {
        let info = context.invocation_info()?;
        Some(Arc::new(info))
    }
}

/// `Service`：按目标标识注入惰性 [`ServiceReference`](crate::service::ServiceReference)。
///
/// 引用本身不会触发服务创建或激活，首次经由引用调用方法时才会发生。
#[derive(Debug, Default)]
pub struct ServiceProvider;

impl InjectionProvider for ServiceProvider {
    fn can_resolve(&self, _point: &InjectionPoint, _model: &CompositeModel) -> bool {
        true
    }

    fn timing(&self, _point: &InjectionPoint, _model: &CompositeModel) -> InjectionTiming {
        InjectionTiming::OnCreation
    }

    fn provide(&self, point: &InjectionPoint, context: &InjectionContext<'_>) -> Option<InjectedValue> {
        let id = ServiceId::from(point.target_name());
        let reference = context.composite().structure().service_reference(&id)?;
        Some(Arc::new(reference))
    }
}
