//! 组合实例：视图索引、状态、片段槽与原型阶段。
//!
//! # 教案式说明
//! - **意图（Why）**：组合实例是片段、状态与视图的聚合体；刚创建时处于“原型”阶段，
//!   可以随意写入属性而不做检查，直到首次真正使用时一次性完成准备、校验与通知；
//! - **逻辑（How）**：
//!   1. 构造时建好公开/私有视图索引：每个实现的类型都映射到所属视图，任意视图最终指向同一实例；
//!   2. 原型阶段由 [`TransitionGate<PrototypeState>`] 驱动：CAS 赢家执行准备动作与状态校验，
//!      结果写入 `OnceLock` 后再结算网关，并发的首次使用者读取同一份结果；
//!   3. 同一所有者在准备动作内部调用自身方法时直接放行，不会等待自己；
//! - **契约（What）**：
//!   - 原型阶段结束恰好一次；校验失败后实例永久不可用，之后的每次使用都返回同一份违例；
//!   - 实例化观察者在网关结算之后调用，可以安全地使用实例。

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock, Weak},
};

use serde_json::Value;
use tracing::{debug, warn};

use super::{
    fragment::FragmentInstance,
    invocation::{InvocationContext, dispatch},
    pool::{FragmentTable, PoolStats},
    state::CompositeState,
};
use crate::{
    application::ApplicationStructure,
    error::{CoreError, Result, codes},
    factory::{FragmentCreation, GeneratedTypes, TypeFactory},
    injection::{InjectionContext, InjectionPlan, InjectionResolver, UsesBag},
    lifecycle::{GateState, TransitionGate, TransitionOwner, gate::SettleGuard},
    model::{CompositeModel, FacadeModel, FragmentTypeId, InjectionPoint, TypeKey},
    observability::keys,
};

/// 模型装载期为一个组合模型准备好的全部只读数据。
#[derive(Debug)]
pub struct CompositeBlueprint {
    model: Arc<CompositeModel>,
    generated: GeneratedTypes,
    plan: InjectionPlan,
}

impl CompositeBlueprint {
    /// 调用类型工厂生成片段元数据，并向解析器确定注入计划。
    pub fn load(
        model: Arc<CompositeModel>,
        factory: &dyn TypeFactory,
        resolver: &InjectionResolver,
    ) -> Result<Arc<Self>> {
        let generated = factory.generate(&model)?;
        let plan = resolver.plan(&model)?;
        debug!(
            { keys::COMPOSITE_MODEL } = model.name(),
            "composite blueprint loaded: {} fragment type(s), max arity {}",
            generated.fragments().count(),
            generated.max_arity()
        );
        Ok(Arc::new(Self {
            model,
            generated,
            plan,
        }))
    }

    pub fn model(&self) -> &Arc<CompositeModel> {
        &self.model
    }
}

/// 原型阶段的四态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PrototypeState {
    /// 刚创建，可自由写入。
    Prototype = 0,
    /// 首次使用转换进行中。
    Disabling = 1,
    /// 已可正常使用。
    Instance = 2,
    /// 首次使用失败，永久不可用。
    Invalid = 3,
}

impl GateState for PrototypeState {
    fn to_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => PrototypeState::Disabling,
            2 => PrototypeState::Instance,
            3 => PrototypeState::Invalid,
            _ => PrototypeState::Prototype,
        }
    }

    fn is_transitional(self) -> bool {
        self == PrototypeState::Disabling
    }
}

/// 准备动作可见的现场。
pub struct PrepareContext<'a> {
    instance: &'a CompositeInstance,
    owner: TransitionOwner,
}

impl<'a> PrepareContext<'a> {
    pub fn instance(&self) -> &'a CompositeInstance {
        self.instance
    }

    pub fn state(&self) -> &'a CompositeState {
        self.instance.state()
    }

    pub fn owner(&self) -> TransitionOwner {
        self.owner
    }

    /// 调用自身方法；沿用首次使用转换的所有者，因此不会等待自己。
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let mut context =
            InvocationContext::new(self.instance.structure.cancellation_token()).with_owner(self.owner);
        self.instance.invoke_with(&mut context, method, args)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Visibility {
    Public,
    Private,
}

impl Visibility {
    fn label(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

/// 组合实例。
pub struct CompositeInstance {
    blueprint: Arc<CompositeBlueprint>,
    structure: Arc<ApplicationStructure>,
    this: Weak<CompositeInstance>,
    public_index: HashMap<TypeKey, usize>,
    private_index: HashMap<TypeKey, usize>,
    state: CompositeState,
    fragments: FragmentTable,
    uses: UsesBag,
    prototype: TransitionGate<PrototypeState>,
    first_use: OnceLock<Result<()>>,
}

impl CompositeInstance {
    pub(crate) fn new(
        blueprint: Arc<CompositeBlueprint>,
        structure: Arc<ApplicationStructure>,
        uses: UsesBag,
    ) -> Arc<Self> {
        let model = Arc::clone(&blueprint.model);
        let config = structure.config();
        let fragments = FragmentTable::new(
            blueprint
                .generated
                .fragments()
                .map(|fragment| (fragment.type_id().clone(), fragment.needs_pooling())),
            config.pool.max_idle_per_type,
        );
        let prototype = TransitionGate::new(PrototypeState::Prototype, config.wait_slice());
        Arc::new_cyclic(|this| Self {
            public_index: index_facades(model.public_facades()),
            private_index: index_facades(model.private_facades()),
            state: CompositeState::new(model.properties(), model.events()),
            blueprint,
            structure,
            this: this.clone(),
            fragments,
            uses,
            prototype,
            first_use: OnceLock::new(),
        })
    }

    pub fn model(&self) -> &Arc<CompositeModel> {
        &self.blueprint.model
    }

    pub(crate) fn model_name(&self) -> Arc<str> {
        self.blueprint.model.shared_name()
    }

    pub fn state(&self) -> &CompositeState {
        &self.state
    }

    pub fn structure(&self) -> &Arc<ApplicationStructure> {
        &self.structure
    }

    pub(crate) fn uses(&self) -> &UsesBag {
        &self.uses
    }

    pub(crate) fn fragments(&self) -> &FragmentTable {
        &self.fragments
    }

    /// 是否仍处于原型阶段（含转换进行中）。
    pub fn is_prototype(&self) -> bool {
        matches!(
            self.prototype.state(),
            PrototypeState::Prototype | PrototypeState::Disabling
        )
    }

    pub fn prototype_state(&self) -> PrototypeState {
        self.prototype.state()
    }

    /// 显式结束原型阶段。
    pub fn instantiate(&self) -> Result<()> {
        self.ensure_instantiated(TransitionOwner::fresh())
    }

    /// 按公开类型取得视图。
    pub fn view(&self, key: &TypeKey) -> Result<CompositeRef> {
        self.view_in(key, Visibility::Public)
    }

    /// 按私有类型取得视图，供片段内部使用。
    pub fn private_view(&self, key: &TypeKey) -> Result<CompositeRef> {
        self.view_in(key, Visibility::Private)
    }

    fn view_in(&self, key: &TypeKey, visibility: Visibility) -> Result<CompositeRef> {
        let index = match visibility {
            Visibility::Public => &self.public_index,
            Visibility::Private => &self.private_index,
        };
        let facade = index.get(key).copied().ok_or_else(|| {
            CoreError::new(
                codes::COMPOSITE_UNKNOWN_VIEW,
                format!(
                    "composite `{}` implements no {} type `{key}`",
                    self.model().name(),
                    visibility.label()
                ),
            )
        })?;
        let instance = self.this.upgrade().ok_or_else(|| {
            CoreError::new(codes::COMPOSITE_UNKNOWN_VIEW, "composite instance was dropped")
        })?;
        Ok(CompositeRef {
            instance,
            key: key.clone(),
            facade,
            visibility,
        })
    }

    /// 指向自身的弱引用视图；`key` 为空时取第一个公开类型。
    pub(crate) fn self_ref(&self, key: Option<&TypeKey>) -> Option<SelfRef> {
        let key = match key {
            Some(key) => key.clone(),
            None => self
                .model()
                .public_facades()
                .first()
                .and_then(|facade| facade.types().first())
                .cloned()?,
        };
        let visibility = if self.public_index.contains_key(&key) {
            Visibility::Public
        } else if self.private_index.contains_key(&key) {
            Visibility::Private
        } else {
            return None;
        };
        Some(SelfRef {
            instance: self.this.clone(),
            key,
            visibility,
        })
    }

    /// 以全新上下文调用方法。
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let mut context = InvocationContext::new(self.structure.cancellation_token());
        self.invoke_with(&mut context, method, args)
    }

    /// 在给定上下文中调用方法；首次调用会结束原型阶段。
    pub fn invoke_with(
        &self,
        context: &mut InvocationContext,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let index = self.method_index(method)?;
        let owner = context.owner_or_fresh();
        self.ensure_instantiated(owner)?;
        dispatch(self, context, index, args)
    }

    pub(crate) fn method_index(&self, method: &str) -> Result<usize> {
        self.model().method_index(method).ok_or_else(|| {
            CoreError::new(
                codes::COMPOSITE_UNKNOWN_METHOD,
                format!("composite `{}` has no method `{method}`", self.model().name()),
            )
        })
    }

    /// 池化片段类型的诊断计数。
    pub fn pool_stats(&self, type_id: &FragmentTypeId) -> Option<PoolStats> {
        self.fragments.pool_stats(type_id)
    }

    /// 结束原型阶段；并发调用者收敛到同一次执行并观察同一结果。
    pub(crate) fn ensure_instantiated(&self, owner: TransitionOwner) -> Result<()> {
        loop {
            let contended = match self.prototype.try_claim(
                PrototypeState::Prototype,
                PrototypeState::Disabling,
                owner,
            ) {
                Ok(()) => return self.run_first_use(owner),
                Err(contended) => contended,
            };
            match contended.observed {
                PrototypeState::Instance => return Ok(()),
                PrototypeState::Invalid => return self.recorded_first_use(),
                PrototypeState::Disabling if contended.owner == Some(owner) => return Ok(()),
                PrototypeState::Disabling => {
                    self.prototype.wait_settled();
                }
                PrototypeState::Prototype => {}
            }
        }
    }

    fn run_first_use(&self, owner: TransitionOwner) -> Result<()> {
        let guard = SettleGuard::new(&self.prototype, PrototypeState::Invalid);
        let outcome = self.prepare_and_validate(owner);
        // 先记录结果再结算，被唤醒的等待者一定能读到它。
        let _ = self.first_use.set(outcome.clone());
        match &outcome {
            Ok(()) => {
                guard.settle(PrototypeState::Instance);
                debug!({ keys::COMPOSITE_MODEL } = self.model().name(), "composite instantiated");
                for observer in self.model().observers() {
                    observer(self);
                }
            }
            Err(err) => {
                guard.settle(PrototypeState::Invalid);
                warn!(
                    { keys::COMPOSITE_MODEL } = self.model().name(),
                    { keys::ERROR_CODE } = err.code(),
                    "composite failed its first use and is unusable: {err}"
                );
            }
        }
        outcome
    }

    fn prepare_and_validate(&self, owner: TransitionOwner) -> Result<()> {
        let context = PrepareContext {
            instance: self,
            owner,
        };
        for action in self.model().prepare_actions() {
            action(&context)?;
        }
        // 先封存再校验：封存之后的写入都要经过约束检查，校验结果不会被并发写入绕过。
        self.state.seal();
        let report = self.state.validate();
        if !report.is_empty() {
            return Err(report.into_error());
        }
        Ok(())
    }

    fn recorded_first_use(&self) -> Result<()> {
        self.first_use.get().cloned().unwrap_or_else(|| {
            Err(CoreError::new(
                codes::FRAGMENT_FAILED,
                format!(
                    "first use of composite `{}` was aborted by a panic",
                    self.model().name()
                ),
            ))
        })
    }

    /// 构造片段实例：解析创建期注入后交给类型工厂。
    pub(crate) fn create_fragment(&self, type_id: &FragmentTypeId) -> Result<FragmentInstance> {
        let generated = self.blueprint.generated.fragment(type_id).ok_or_else(|| {
            CoreError::new(
                codes::FACTORY_CREATION_FAILED,
                format!("no generated type for fragment `{type_id}`"),
            )
        })?;
        let injections = self.structure.resolver().resolve(
            self.creation_points(type_id),
            &InjectionContext::creation(self, type_id),
        )?;
        generated.instantiate(&FragmentCreation::new(type_id, &injections))
    }

    fn creation_points(&self, type_id: &FragmentTypeId) -> &[InjectionPoint] {
        self.blueprint
            .plan
            .fragment(type_id)
            .map(|plan| plan.on_creation())
            .unwrap_or_default()
    }

    pub(crate) fn per_invocation_points(&self, type_id: &FragmentTypeId) -> &[InjectionPoint] {
        self.blueprint
            .plan
            .fragment(type_id)
            .map(|plan| plan.per_invocation())
            .unwrap_or_default()
    }
}

impl fmt::Debug for CompositeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeInstance")
            .field("model", &self.model().name())
            .field("prototype", &self.prototype.state())
            .field("fragments", &self.fragments)
            .finish()
    }
}

fn index_facades(facades: &[FacadeModel]) -> HashMap<TypeKey, usize> {
    facades
        .iter()
        .enumerate()
        .flat_map(|(index, facade)| facade.types().iter().map(move |key| (key.clone(), index)))
        .collect()
}

/// 组合实例的一个接口视图。
#[derive(Clone)]
pub struct CompositeRef {
    instance: Arc<CompositeInstance>,
    key: TypeKey,
    facade: usize,
    visibility: Visibility,
}

impl CompositeRef {
    pub fn instance(&self) -> &Arc<CompositeInstance> {
        &self.instance
    }

    /// 取得视图时使用的类型。
    pub fn type_key(&self) -> &TypeKey {
        &self.key
    }

    /// 视图所属的模块边界。
    pub fn module(&self) -> &str {
        self.facade_model().module()
    }

    /// 两个视图是否指向同一实例。
    pub fn same_instance(&self, other: &CompositeRef) -> bool {
        Arc::ptr_eq(&self.instance, &other.instance)
    }

    /// 经由该视图调用方法；方法的声明类型必须属于该视图。
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let mut context = InvocationContext::new(self.instance.structure.cancellation_token());
        self.invoke_with(&mut context, method, args)
    }

    pub fn invoke_with(
        &self,
        context: &mut InvocationContext,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let index = self.instance.method_index(method)?;
        let declaring = self.instance.model().methods()[index].declaring_type();
        if !self.facade_model().implements(declaring) {
            return Err(CoreError::new(
                codes::COMPOSITE_UNKNOWN_METHOD,
                format!(
                    "method `{method}` is declared by `{declaring}`, which the `{}` view does not expose",
                    self.key
                ),
            ));
        }
        self.instance.invoke_with(context, method, args)
    }

    fn facade_model(&self) -> &FacadeModel {
        let model = self.instance.model();
        let facades = match self.visibility {
            Visibility::Public => model.public_facades(),
            Visibility::Private => model.private_facades(),
        };
        &facades[self.facade]
    }
}

impl fmt::Debug for CompositeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeRef")
            .field("model", &self.instance.model().name())
            .field("type", &self.key)
            .finish()
    }
}

/// `This` 作用域注入的弱引用视图，避免片段与所属实例之间形成引用环。
#[derive(Clone)]
pub struct SelfRef {
    instance: Weak<CompositeInstance>,
    key: TypeKey,
    visibility: Visibility,
}

impl SelfRef {
    pub fn type_key(&self) -> &TypeKey {
        &self.key
    }

    /// 升级为强引用视图；实例已释放时返回 `None`。
    pub fn upgrade(&self) -> Option<CompositeRef> {
        let instance = self.instance.upgrade()?;
        let result = match self.visibility {
            Visibility::Public => instance.view(&self.key),
            Visibility::Private => instance.private_view(&self.key),
        };
        result.ok()
    }
}

impl fmt::Debug for SelfRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfRef")
            .field("type", &self.key)
            .field("alive", &(self.instance.strong_count() > 0))
            .finish()
    }
}
