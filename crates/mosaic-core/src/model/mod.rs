//! 不可变组合图：组合、方法、片段、属性、事件与服务模型。
//!
//! # 教案式说明
//! - **定位（Where）**：运行时只消费模型，不推导模型；本模块提供一个最小构建器，
//!   让宿主或测试以代码方式声明组合图；
//! - **逻辑（How）**：[`CompositeModelBuilder::build`] 做一次轻量结构检查（方法名唯一、片段已声明且角色匹配、
//!   每个方法恰有一个 mixin），随后冻结为 `Arc<CompositeModel>`，由所有实例共享；
//! - **契约（What）**：模型构建后只读；方法下标即其在 [`CompositeModel::methods`] 中的位置，
//!   片段实例上的调用状态以该下标标识方法。

mod service;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use serde_json::Value;

pub use self::service::{ServiceAction, ServiceId, ServiceModel};
use crate::{
    composite::{
        constraint::Constraint,
        fragment::{Concern, FragmentRef, Mixin, SideEffect},
        instance::PrepareContext,
        state::QualifiedName,
        CompositeInstance,
    },
    error::{CoreError, Result, codes},
    factory::{FragmentConstructor, FragmentCreation},
    injection::{InjectionScope, ScopeId},
};

macro_rules! arc_str_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(value: impl Into<Arc<str>>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }
    };
}

arc_str_key!(
    /// 组合实现的接口类型标识。
    TypeKey
);

arc_str_key!(
    /// 片段类型标识。
    FragmentTypeId
);

/// 片段在调用链中的角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FragmentRole {
    Concern,
    Mixin,
    SideEffect,
}

/// 片段分派方式：`Generic` 片段按调用从池中借出，`Virtual` 片段在实例内共享一份。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DispatchMode {
    #[default]
    Generic,
    Virtual,
}

/// 片段上的注入点声明。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InjectionPoint {
    name: Arc<str>,
    scope: ScopeId,
    target: Option<Arc<str>>,
    optional: bool,
}

impl InjectionPoint {
    /// 在作用域 `S` 下声明名为 `name` 的注入点；片段以该名字取回注入值。
    pub fn new<S: InjectionScope>(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            scope: ScopeId::of::<S>(),
            target: None,
            optional: false,
        }
    }

    /// 指定作用域内的目标，例如属性限定名或服务标识。
    pub fn with_target(mut self, target: impl Into<Arc<str>>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// 标记为可选：解析不到时注入空值而非报错。
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// 显式指定的目标。
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// 目标；未指定时退化为注入点名字。
    pub fn target_name(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.name)
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }
}

/// 片段描述符。
#[derive(Clone)]
pub struct FragmentModel {
    type_id: FragmentTypeId,
    role: FragmentRole,
    dispatch: DispatchMode,
    injections: Vec<InjectionPoint>,
    constructor: Option<FragmentConstructor>,
}

impl FragmentModel {
    /// 仅声明片段，构造函数由类型工厂的静态表提供。
    pub fn declared(type_id: impl Into<FragmentTypeId>, role: FragmentRole) -> Self {
        Self {
            type_id: type_id.into(),
            role,
            dispatch: DispatchMode::default(),
            injections: Vec::new(),
            constructor: None,
        }
    }

    /// 声明 concern 片段并附带构造闭包。
    pub fn concern<C, F>(type_id: impl Into<FragmentTypeId>, build: F) -> Self
    where
        C: Concern + 'static,
        F: Fn(&FragmentCreation<'_>) -> Result<C> + Send + Sync + 'static,
    {
        Self::declared(type_id, FragmentRole::Concern).constructed_by(move |creation| {
            Ok(FragmentRef::Concern(Arc::new(build(creation)?) as Arc<dyn Concern>))
        })
    }

    /// 声明 mixin 片段并附带构造闭包。
    pub fn mixin<M, F>(type_id: impl Into<FragmentTypeId>, build: F) -> Self
    where
        M: Mixin + 'static,
        F: Fn(&FragmentCreation<'_>) -> Result<M> + Send + Sync + 'static,
    {
        Self::declared(type_id, FragmentRole::Mixin).constructed_by(move |creation| {
            Ok(FragmentRef::Mixin(Arc::new(build(creation)?) as Arc<dyn Mixin>))
        })
    }

    /// 声明 side-effect 片段并附带构造闭包。
    pub fn side_effect<S, F>(type_id: impl Into<FragmentTypeId>, build: F) -> Self
    where
        S: SideEffect + 'static,
        F: Fn(&FragmentCreation<'_>) -> Result<S> + Send + Sync + 'static,
    {
        Self::declared(type_id, FragmentRole::SideEffect).constructed_by(move |creation| {
            Ok(FragmentRef::SideEffect(
                Arc::new(build(creation)?) as Arc<dyn SideEffect>
            ))
        })
    }

    /// 替换构造闭包。
    pub fn constructed_by(
        mut self,
        constructor: impl Fn(&FragmentCreation<'_>) -> Result<FragmentRef> + Send + Sync + 'static,
    ) -> Self {
        self.constructor = Some(Arc::new(constructor));
        self
    }

    pub fn dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// 追加注入点。
    pub fn inject(mut self, point: InjectionPoint) -> Self {
        self.injections.push(point);
        self
    }

    pub fn type_id(&self) -> &FragmentTypeId {
        &self.type_id
    }

    pub fn role(&self) -> FragmentRole {
        self.role
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.dispatch
    }

    pub fn injections(&self) -> &[InjectionPoint] {
        &self.injections
    }

    pub(crate) fn constructor(&self) -> Option<&FragmentConstructor> {
        self.constructor.as_ref()
    }
}

impl fmt::Debug for FragmentModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentModel")
            .field("type_id", &self.type_id)
            .field("role", &self.role)
            .field("dispatch", &self.dispatch)
            .field("injections", &self.injections)
            .field("constructed", &self.constructor.is_some())
            .finish()
    }
}

/// 方法参数声明。
#[derive(Clone, Debug)]
pub struct ParameterModel {
    name: Arc<str>,
    optional: bool,
    constraints: Vec<Arc<dyn Constraint>>,
}

impl ParameterModel {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            optional: false,
            constraints: Vec::new(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn constraint(mut self, constraint: impl Constraint + 'static) -> Self {
        self.constraints.push(Arc::new(constraint));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn constraints(&self) -> &[Arc<dyn Constraint>] {
        &self.constraints
    }
}

/// 组合方法声明：参数约束与按序排列的 concern、唯一 mixin、按序排列的 side effect。
#[derive(Clone, Debug)]
pub struct MethodModel {
    name: Arc<str>,
    declaring: TypeKey,
    parameters: Vec<ParameterModel>,
    concerns: Vec<FragmentTypeId>,
    mixin: Option<FragmentTypeId>,
    side_effects: Vec<FragmentTypeId>,
}

impl MethodModel {
    pub fn new(name: impl Into<Arc<str>>, declaring: impl Into<TypeKey>) -> Self {
        Self {
            name: name.into(),
            declaring: declaring.into(),
            parameters: Vec::new(),
            concerns: Vec::new(),
            mixin: None,
            side_effects: Vec::new(),
        }
    }

    pub fn parameter(mut self, parameter: ParameterModel) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn concern(mut self, type_id: impl Into<FragmentTypeId>) -> Self {
        self.concerns.push(type_id.into());
        self
    }

    pub fn mixin(mut self, type_id: impl Into<FragmentTypeId>) -> Self {
        self.mixin = Some(type_id.into());
        self
    }

    pub fn side_effect(mut self, type_id: impl Into<FragmentTypeId>) -> Self {
        self.side_effects.push(type_id.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub fn declaring_type(&self) -> &TypeKey {
        &self.declaring
    }

    pub fn parameters(&self) -> &[ParameterModel] {
        &self.parameters
    }

    pub fn concerns(&self) -> &[FragmentTypeId] {
        &self.concerns
    }

    /// 唯一 mixin；构建成功的模型中总是存在。
    pub fn mixin_type(&self) -> Option<&FragmentTypeId> {
        self.mixin.as_ref()
    }

    pub fn side_effects(&self) -> &[FragmentTypeId] {
        &self.side_effects
    }

    fn fragments(&self) -> impl Iterator<Item = (&FragmentTypeId, FragmentRole)> {
        self.concerns
            .iter()
            .map(|id| (id, FragmentRole::Concern))
            .chain(self.mixin.iter().map(|id| (id, FragmentRole::Mixin)))
            .chain(self.side_effects.iter().map(|id| (id, FragmentRole::SideEffect)))
    }
}

/// 属性声明。
#[derive(Clone, Debug)]
pub struct PropertyModel {
    name: QualifiedName,
    default: Value,
    constraints: Vec<Arc<dyn Constraint>>,
    immutable: bool,
    optional: bool,
}

impl PropertyModel {
    pub fn new(name: QualifiedName, default: Value) -> Self {
        Self {
            name,
            default,
            constraints: Vec::new(),
            immutable: false,
            optional: false,
        }
    }

    pub fn constraint(mut self, constraint: impl Constraint + 'static) -> Self {
        self.constraints.push(Arc::new(constraint));
        self
    }

    /// 原型阶段结束后禁止写入。
    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    /// 允许空值；空值不触发任何约束检查。
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn name(&self) -> &QualifiedName {
        &self.name
    }

    pub fn default_value(&self) -> &Value {
        &self.default
    }

    pub fn constraints(&self) -> &[Arc<dyn Constraint>] {
        &self.constraints
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }
}

/// 事件声明。
#[derive(Clone, Debug)]
pub struct EventModel {
    name: QualifiedName,
}

impl EventModel {
    pub fn new(name: QualifiedName) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &QualifiedName {
        &self.name
    }
}

/// 一个模块边界上暴露的类型集合。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FacadeModel {
    module: Arc<str>,
    types: Vec<TypeKey>,
}

impl FacadeModel {
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn types(&self) -> &[TypeKey] {
        &self.types
    }

    pub fn implements(&self, key: &TypeKey) -> bool {
        self.types.contains(key)
    }
}

/// 原型阶段结束前执行的一次性准备动作。
pub type PrepareAction = Arc<dyn Fn(&PrepareContext<'_>) -> Result<()> + Send + Sync>;

/// 实例完成首次使用转换后的通知回调。
pub type InstantiationObserver = Arc<dyn Fn(&CompositeInstance) + Send + Sync>;

/// 冻结后的组合模型。
pub struct CompositeModel {
    name: Arc<str>,
    public_facades: Vec<FacadeModel>,
    private_facades: Vec<FacadeModel>,
    methods: Vec<Arc<MethodModel>>,
    method_index: HashMap<Arc<str>, usize>,
    fragments: BTreeMap<FragmentTypeId, FragmentModel>,
    properties: Vec<Arc<PropertyModel>>,
    events: Vec<Arc<EventModel>>,
    prepare: Vec<PrepareAction>,
    observers: Vec<InstantiationObserver>,
}

impl CompositeModel {
    pub fn builder(name: impl Into<Arc<str>>) -> CompositeModelBuilder {
        CompositeModelBuilder {
            name: name.into(),
            public_facades: Vec::new(),
            private_facades: Vec::new(),
            methods: Vec::new(),
            fragments: Vec::new(),
            properties: Vec::new(),
            events: Vec::new(),
            prepare: Vec::new(),
            observers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub fn public_facades(&self) -> &[FacadeModel] {
        &self.public_facades
    }

    pub fn private_facades(&self) -> &[FacadeModel] {
        &self.private_facades
    }

    pub fn methods(&self) -> &[Arc<MethodModel>] {
        &self.methods
    }

    /// 方法名到下标的查找。
    pub fn method_index(&self, name: &str) -> Option<usize> {
        self.method_index.get(name).copied()
    }

    pub fn fragment(&self, type_id: &FragmentTypeId) -> Option<&FragmentModel> {
        self.fragments.get(type_id)
    }

    pub fn fragments(&self) -> impl Iterator<Item = &FragmentModel> {
        self.fragments.values()
    }

    pub fn properties(&self) -> &[Arc<PropertyModel>] {
        &self.properties
    }

    pub fn events(&self) -> &[Arc<EventModel>] {
        &self.events
    }

    pub(crate) fn prepare_actions(&self) -> &[PrepareAction] {
        &self.prepare
    }

    pub(crate) fn observers(&self) -> &[InstantiationObserver] {
        &self.observers
    }
}

impl fmt::Debug for CompositeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeModel")
            .field("name", &self.name)
            .field("public_facades", &self.public_facades)
            .field("private_facades", &self.private_facades)
            .field("methods", &self.methods.len())
            .field("fragments", &self.fragments.len())
            .field("properties", &self.properties.len())
            .field("events", &self.events.len())
            .finish()
    }
}

/// [`CompositeModel`] 构建器。
pub struct CompositeModelBuilder {
    name: Arc<str>,
    public_facades: Vec<FacadeModel>,
    private_facades: Vec<FacadeModel>,
    methods: Vec<MethodModel>,
    fragments: Vec<FragmentModel>,
    properties: Vec<PropertyModel>,
    events: Vec<EventModel>,
    prepare: Vec<PrepareAction>,
    observers: Vec<InstantiationObserver>,
}

impl CompositeModelBuilder {
    /// 声明一个模块边界上公开实现的类型集合。
    pub fn public_types<I, T>(mut self, module: impl Into<Arc<str>>, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TypeKey>,
    {
        self.public_facades.push(FacadeModel {
            module: module.into(),
            types: types.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// 声明仅对片段可见的私有类型集合。
    pub fn private_types<I, T>(mut self, module: impl Into<Arc<str>>, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TypeKey>,
    {
        self.private_facades.push(FacadeModel {
            module: module.into(),
            types: types.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn method(mut self, method: MethodModel) -> Self {
        self.methods.push(method);
        self
    }

    pub fn fragment(mut self, fragment: FragmentModel) -> Self {
        self.fragments.push(fragment);
        self
    }

    pub fn property(mut self, property: PropertyModel) -> Self {
        self.properties.push(property);
        self
    }

    pub fn event(mut self, event: EventModel) -> Self {
        self.events.push(event);
        self
    }

    /// 追加原型阶段结束前的准备动作，按声明顺序执行。
    pub fn prepare(
        mut self,
        action: impl Fn(&PrepareContext<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.prepare.push(Arc::new(action));
        self
    }

    /// 追加实例化观察者。
    pub fn on_instantiated(
        mut self,
        observer: impl Fn(&CompositeInstance) + Send + Sync + 'static,
    ) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// 结构检查并冻结模型。
    pub fn build(self) -> Result<Arc<CompositeModel>> {
        let name = self.name;
        let invalid =
            |detail: String| CoreError::new(codes::MODEL_INVALID, format!("composite `{name}`: {detail}"));

        let mut fragments = BTreeMap::new();
        for fragment in self.fragments {
            let type_id = fragment.type_id.clone();
            if fragments.insert(type_id.clone(), fragment).is_some() {
                return Err(invalid(format!("fragment `{type_id}` declared twice")));
            }
        }

        let mut method_index = HashMap::with_capacity(self.methods.len());
        let mut methods = Vec::with_capacity(self.methods.len());
        for method in self.methods {
            let declared = self
                .public_facades
                .iter()
                .chain(self.private_facades.iter())
                .any(|facade| facade.implements(&method.declaring));
            if !declared {
                return Err(invalid(format!(
                    "method `{}` is declared by `{}`, which the composite does not implement",
                    method.name, method.declaring
                )));
            }
            if method.mixin.is_none() {
                return Err(invalid(format!("method `{}` has no mixin", method.name)));
            }
            for (type_id, role) in method.fragments() {
                match fragments.get(type_id) {
                    Some(fragment) if fragment.role == role => {}
                    Some(fragment) => {
                        return Err(invalid(format!(
                            "fragment `{type_id}` is a {:?} but method `{}` uses it as a {role:?}",
                            fragment.role, method.name
                        )));
                    }
                    None => {
                        return Err(invalid(format!(
                            "method `{}` references undeclared fragment `{type_id}`",
                            method.name
                        )));
                    }
                }
            }
            let method_name = method.shared_name();
            if method_index.insert(Arc::clone(&method_name), methods.len()).is_some() {
                return Err(invalid(format!("method `{method_name}` declared twice")));
            }
            methods.push(Arc::new(method));
        }

        let mut seen = HashSet::new();
        for member in self
            .properties
            .iter()
            .map(PropertyModel::name)
            .chain(self.events.iter().map(EventModel::name))
        {
            if !seen.insert(member.clone()) {
                return Err(invalid(format!("state member `{member}` declared twice")));
            }
        }

        Ok(Arc::new(CompositeModel {
            name,
            public_facades: self.public_facades,
            private_facades: self.private_facades,
            methods,
            method_index,
            fragments,
            properties: self.properties.into_iter().map(Arc::new).collect(),
            events: self.events.into_iter().map(Arc::new).collect(),
            prepare: self.prepare,
            observers: self.observers,
        }))
    }
}
