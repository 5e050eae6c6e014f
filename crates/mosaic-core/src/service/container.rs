//! 服务注册表：标识到服务实例的并发映射。

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use super::instance::ServiceCompositeInstance;
use crate::{
    application::ApplicationStructure,
    composite::{CompositeBlueprint, CompositeInstance, InvocationContext},
    error::{CoreError, Result, codes},
    injection::UsesBag,
    model::{ServiceId, ServiceModel},
    observability::keys,
};

struct ServiceBlueprint {
    model: Arc<ServiceModel>,
    composite: Arc<CompositeBlueprint>,
}

/// 服务容器。
///
/// # 教案式说明
/// - **意图（Why）**：服务是按标识唯一的长生命周期单例，首次被需要时才物化；
/// - **逻辑（How）**：`DashMap::entry` 在分片锁内完成“查找或创建”，
///   创建只构造原型阶段的组合实例（不执行任何用户代码），因此持锁时间有界；
/// - **契约（What）**：
///   - 并发首次访问同一标识只会创建一个实例，所有调用方拿到同一个 `Arc`；
///   - [`existing_services`](Self::existing_services) 只枚举已物化的实例，不会触发创建；
///   - 激活闸门由应用生命周期控制，初始关闭。
pub struct ServiceContainer {
    structure: Arc<ApplicationStructure>,
    declared: Vec<ServiceId>,
    blueprints: HashMap<ServiceId, ServiceBlueprint>,
    instances: DashMap<ServiceId, Arc<ServiceCompositeInstance>>,
    activation_allowed: Arc<AtomicBool>,
    sequence: AtomicU64,
}

impl ServiceContainer {
    pub(crate) fn new(
        structure: Arc<ApplicationStructure>,
        services: Vec<(Arc<ServiceModel>, Arc<CompositeBlueprint>)>,
    ) -> Self {
        let mut declared = Vec::with_capacity(services.len());
        let mut blueprints = HashMap::with_capacity(services.len());
        for (model, composite) in services {
            declared.push(model.id().clone());
            blueprints.insert(model.id().clone(), ServiceBlueprint { model, composite });
        }
        Self {
            structure,
            declared,
            blueprints,
            instances: DashMap::new(),
            activation_allowed: Arc::new(AtomicBool::new(false)),
            sequence: AtomicU64::new(0),
        }
    }

    /// 取得服务实例，首次访问时物化（此时仍处于 PASSIVE）。
    pub fn get_service(&self, id: &ServiceId) -> Result<Arc<ServiceCompositeInstance>> {
        if let Some(existing) = self.instances.get(id) {
            return Ok(Arc::clone(existing.value()));
        }
        let blueprint = self.blueprints.get(id).ok_or_else(|| {
            CoreError::new(codes::SERVICE_UNKNOWN, format!("no service registered as `{id}`"))
        })?;
        let entry = self
            .instances
            .entry(id.clone())
            .or_insert_with(|| self.materialize(blueprint));
        Ok(Arc::clone(entry.value()))
    }

    /// 已物化的服务，按物化顺序排列。
    pub fn existing_services(&self) -> Vec<Arc<ServiceCompositeInstance>> {
        let mut services: Vec<_> = self
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        services.sort_by_key(|service| service.sequence());
        services
    }

    /// 是否登记了该服务。
    pub fn contains(&self, id: &ServiceId) -> bool {
        self.blueprints.contains_key(id)
    }

    /// 按声明顺序列出登记的服务标识。
    pub fn service_ids(&self) -> &[ServiceId] {
        &self.declared
    }

    /// 声明了“随应用激活”的服务标识，按声明顺序。
    pub fn eager_service_ids(&self) -> impl Iterator<Item = &ServiceId> {
        self.declared.iter().filter(|id| {
            self.blueprints
                .get(*id)
                .is_some_and(|blueprint| blueprint.model.activates_with_application())
        })
    }

    /// 当前是否允许新的服务激活。
    pub fn activation_allowed(&self) -> bool {
        self.activation_allowed.load(Ordering::SeqCst)
    }

    pub(crate) fn allow_activation(&self, allowed: bool) {
        self.activation_allowed.store(allowed, Ordering::SeqCst);
    }

    fn materialize(&self, blueprint: &ServiceBlueprint) -> Arc<ServiceCompositeInstance> {
        let composite = CompositeInstance::new(
            Arc::clone(&blueprint.composite),
            Arc::clone(&self.structure),
            UsesBag::new(),
        );
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        debug!(
            { keys::SERVICE_ID } = %blueprint.model.id(),
            { keys::COMPOSITE_MODEL } = blueprint.model.composite().name(),
            "service materialized"
        );
        Arc::new(ServiceCompositeInstance::new(
            Arc::clone(&blueprint.model),
            composite,
            Arc::clone(&self.activation_allowed),
            sequence,
        ))
    }
}

impl fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("declared", &self.declared)
            .field("materialized", &self.instances.len())
            .field("activation_allowed", &self.activation_allowed())
            .finish()
    }
}

/// 惰性服务引用：持有标识与容器的弱引用，直到首次使用才物化并激活服务。
#[derive(Clone)]
pub struct ServiceReference {
    id: ServiceId,
    container: Weak<ServiceContainer>,
}

impl ServiceReference {
    pub(crate) fn new(id: ServiceId, container: Weak<ServiceContainer>) -> Self {
        Self { id, container }
    }

    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    /// 解析为服务实例；应用已被释放时返回 [`codes::SERVICE_UNKNOWN`]。
    pub fn get(&self) -> Result<Arc<ServiceCompositeInstance>> {
        let container = self.container.upgrade().ok_or_else(|| {
            CoreError::new(
                codes::SERVICE_UNKNOWN,
                format!("service `{}` outlived its application", self.id),
            )
        })?;
        container.get_service(&self.id)
    }

    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.get()?.invoke(method, args)
    }

    /// 沿用调用方上下文调用，嵌套调用链共享同一个跃迁所有者。
    pub fn invoke_with(
        &self,
        context: &mut InvocationContext,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.get()?.invoke_with(context, method, args)
    }
}

impl fmt::Debug for ServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceReference").field("id", &self.id).finish()
    }
}
