//! 依作用域分派、区分注入时机的依赖注入解析器。
//!
//! # 教案式说明
//! - **意图（Why）**：片段声明“需要什么”，运行时决定“从哪里来、何时计算”；
//!   不同来源（组合自身、状态、应用结构、创建参数、当前调用、服务）由可插拔的提供者负责；
//! - **逻辑（How）**：
//!   1. [`InjectionResolver`] 以作用域类型的 [`ScopeId`] 为键登记 [`InjectionProvider`]；
//!   2. 模型装载时 [`InjectionResolver::plan`] 逐个注入点询问提供者的结构可解析性与时机，
//!      得到每个片段类型的 [`FragmentInjections`]：创建时解析一次的点、每次调用都重算的点；
//!   3. 运行时 [`InjectionResolver::resolve`] 依计划取值；提供者只回答“有值 / 没有值”，从不报错，
//!      必选点缺值由解析器统一转换为 `injection.unresolved`；
//! - **契约（What）**：可选注入点缺值时不写入 [`Injections`]，片段读取得到 `None`。

mod builtin;
pub mod scope;

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use tracing::debug;

pub use self::builtin::{
    InvocationProvider, ServiceProvider, StateProvider, StructureProvider, ThisProvider,
    UsesProvider,
};
use crate::{
    composite::{CompositeInstance, StackFrame},
    error::{CoreError, ErrorDetail, Result, codes},
    model::{CompositeModel, FragmentTypeId, InjectionPoint, MethodModel},
    observability::keys,
};

/// 注入值的类型擦除表示，片段按具体类型向下转型取回。
pub type InjectedValue = Arc<dyn Any + Send + Sync>;

/// 注入作用域标记类型。
pub trait InjectionScope: 'static {
    /// 日志与错误信息中使用的名字。
    const NAME: &'static str;
}

/// 作用域的运行期标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScopeId {
    type_id: TypeId,
    name: &'static str,
}

impl ScopeId {
    pub fn of<S: InjectionScope>() -> Self {
        Self {
            type_id: TypeId::of::<S>(),
            name: S::NAME,
        }
    }

    pub fn name(self) -> &'static str {
        self.name
    }
}

/// 注入时机。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InjectionTiming {
    /// 片段实例创建时解析一次。
    OnCreation,
    /// 每次调用进入该片段前重新解析。
    OnEveryInvocation,
}

/// 提供者取值时可见的现场。
pub struct InjectionContext<'a> {
    composite: &'a CompositeInstance,
    fragment: &'a FragmentTypeId,
    invocation: Option<InvocationSite<'a>>,
}

/// 调用期注入的附加现场。
#[derive(Clone, Copy)]
pub(crate) struct InvocationSite<'a> {
    pub(crate) method: &'a MethodModel,
    pub(crate) method_index: usize,
    pub(crate) frames: &'a [StackFrame],
}

impl<'a> InjectionContext<'a> {
    pub(crate) fn creation(composite: &'a CompositeInstance, fragment: &'a FragmentTypeId) -> Self {
        Self {
            composite,
            fragment,
            invocation: None,
        }
    }

    pub(crate) fn invocation(
        composite: &'a CompositeInstance,
        fragment: &'a FragmentTypeId,
        site: InvocationSite<'a>,
    ) -> Self {
        Self {
            composite,
            fragment,
            invocation: Some(site),
        }
    }

    /// 注入目标所属的组合实例。
    pub fn composite(&self) -> &'a CompositeInstance {
        self.composite
    }

    /// 正在注入的片段类型。
    pub fn fragment(&self) -> &'a FragmentTypeId {
        self.fragment
    }

    /// 当前调用的方法与调用栈快照；创建期注入时为 `None`。
    pub fn invocation_info(&self) -> Option<InvocationInfo> {
        self.invocation.map(|site| InvocationInfo {
            method: site.method.shared_name(),
            method_index: site.method_index,
            stack: site.frames.to_vec(),
        })
    }
}

/// `Invocation` 作用域注入的值：当前方法与调用栈快照（栈底在前）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvocationInfo {
    pub method: Arc<str>,
    pub method_index: usize,
    pub stack: Vec<StackFrame>,
}

/// 单个作用域的值提供者。
///
/// # 契约说明（What）
/// - `can_resolve`：模型装载期的结构判断，只看模型不看实例；
/// - `timing`：同一模型下该注入点的计算时机；
/// - `provide`：运行期取值，缺值返回 `None`，不得 panic 或报错。
pub trait InjectionProvider: Send + Sync {
    fn can_resolve(&self, point: &InjectionPoint, model: &CompositeModel) -> bool;

    fn timing(&self, point: &InjectionPoint, model: &CompositeModel) -> InjectionTiming;

    fn provide(&self, point: &InjectionPoint, context: &InjectionContext<'_>) -> Option<InjectedValue>;
}

/// 已解析的注入值，按注入点名字索引。
#[derive(Clone, Default)]
pub struct Injections {
    values: HashMap<Arc<str>, InjectedValue>,
}

impl Injections {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// 取回并向下转型；缺值或类型不符时返回 `None`。
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.values
            .get(name)
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }

    /// 取回必选值；缺值视为注入错误。
    pub fn require<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>> {
        self.get(name).ok_or_else(|| {
            CoreError::new(
                codes::INJECTION_UNRESOLVED,
                format!("no injected value of the requested type named `{name}`"),
            )
        })
    }

    pub(crate) fn insert(&mut self, name: Arc<str>, value: InjectedValue) {
        self.values.insert(name, value);
    }
}

impl fmt::Debug for Injections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.values.keys().map(|k| &**k).collect();
        names.sort_unstable();
        f.debug_struct("Injections").field("names", &names).finish()
    }
}

/// 单个片段类型的注入计划。
#[derive(Clone, Debug, Default)]
pub struct FragmentInjections {
    on_creation: Vec<InjectionPoint>,
    per_invocation: Vec<InjectionPoint>,
}

impl FragmentInjections {
    pub fn on_creation(&self) -> &[InjectionPoint] {
        &self.on_creation
    }

    pub fn per_invocation(&self) -> &[InjectionPoint] {
        &self.per_invocation
    }
}

/// 一个组合模型的注入计划。
#[derive(Clone, Debug, Default)]
pub struct InjectionPlan {
    fragments: HashMap<FragmentTypeId, FragmentInjections>,
}

impl InjectionPlan {
    pub fn fragment(&self, type_id: &FragmentTypeId) -> Option<&FragmentInjections> {
        self.fragments.get(type_id)
    }
}

/// 作用域 → 提供者注册表。
#[derive(Clone, Default)]
pub struct InjectionResolver {
    providers: HashMap<ScopeId, Arc<dyn InjectionProvider>>,
}

impl InjectionResolver {
    /// 空注册表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置全部内建作用域的注册表。
    pub fn with_builtin() -> Self {
        let mut resolver = Self::new();
        resolver.register::<scope::This>(ThisProvider);
        resolver.register::<scope::State>(StateProvider);
        resolver.register::<scope::Structure>(StructureProvider);
        resolver.register::<scope::Uses>(UsesProvider);
        resolver.register::<scope::Invocation>(InvocationProvider);
        resolver.register::<scope::Service>(ServiceProvider);
        resolver
    }

    /// 登记或替换作用域 `S` 的提供者。
    pub fn register<S: InjectionScope>(&mut self, provider: impl InjectionProvider + 'static) {
        self.providers.insert(ScopeId::of::<S>(), Arc::new(provider));
    }

    fn provider(&self, scope: ScopeId) -> Option<&Arc<dyn InjectionProvider>> {
        self.providers.get(&scope)
    }

    /// 为模型中每个片段的注入点决定时机。
    ///
    /// 必选注入点找不到提供者或结构上不可解析时返回 `injection.unresolved`；
    /// 同样情况下的可选注入点被剔除，运行期永远缺值。
    pub fn plan(&self, model: &CompositeModel) -> Result<InjectionPlan> {
        let mut fragments = HashMap::new();
        for fragment in model.fragments() {
            let mut plan = FragmentInjections::default();
            for point in fragment.injections() {
                let Some(provider) = self
                    .provider(point.scope())
                    .filter(|provider| provider.can_resolve(point, model))
                else {
                    if point.is_optional() {
                        debug!(
                            { keys::COMPOSITE_MODEL } = model.name(),
                            { keys::FRAGMENT_ID } = %fragment.type_id(),
                            "optional injection point `{}` cannot be resolved and will stay empty",
                            point.name()
                        );
                        continue;
                    }
                    return Err(unresolved(fragment.type_id(), point, "no provider can resolve it"));
                };
                match provider.timing(point, model) {
                    InjectionTiming::OnCreation => plan.on_creation.push(point.clone()),
                    InjectionTiming::OnEveryInvocation => plan.per_invocation.push(point.clone()),
                }
            }
            fragments.insert(fragment.type_id().clone(), plan);
        }
        Ok(InjectionPlan { fragments })
    }

    /// 依次解析注入点。
    pub fn resolve(
        &self,
        points: &[InjectionPoint],
        context: &InjectionContext<'_>,
    ) -> Result<Injections> {
        let mut injections = Injections::default();
        for point in points {
            let value = self
                .provider(point.scope())
                .and_then(|provider| provider.provide(point, context));
            match value {
                Some(value) => injections.insert(Arc::from(point.name()), value),
                None if point.is_optional() => {}
                None => {
                    return Err(unresolved(
                        context.fragment(),
                        point,
                        "provider produced no value",
                    ));
                }
            }
        }
        Ok(injections)
    }
}

impl fmt::Debug for InjectionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut scopes: Vec<_> = self.providers.keys().map(|scope| scope.name()).collect();
        scopes.sort_unstable();
        f.debug_struct("InjectionResolver").field("scopes", &scopes).finish()
    }
}

fn unresolved(fragment: &FragmentTypeId, point: &InjectionPoint, reason: &str) -> CoreError {
    CoreError::new(
        codes::INJECTION_UNRESOLVED,
        format!(
            "required injection point `{}` ({} scope) of fragment `{fragment}` is unresolved: {reason}",
            point.name(),
            point.scope().name()
        ),
    )
    .with_detail(ErrorDetail::Injection {
        fragment: fragment.to_string().into(),
        point: point.name().to_owned().into(),
    })
}

/// 组合创建时提供的命名值，供 `Uses` 作用域注入。
#[derive(Clone, Default)]
pub struct UsesBag {
    values: HashMap<Arc<str>, InjectedValue>,
}

impl UsesBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个命名值。
    pub fn with<T: Any + Send + Sync>(mut self, name: impl Into<Arc<str>>, value: T) -> Self {
        self.values.insert(name.into(), Arc::new(value));
        self
    }

    pub(crate) fn get(&self, name: &str) -> Option<InjectedValue> {
        self.values.get(name).cloned()
    }
}

impl fmt::Debug for UsesBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsesBag").field("len", &self.values.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::{
        composite::{Invocation, fragment::Mixin},
        model::{FragmentModel, MethodModel},
    };

    struct Noop;

    impl Mixin for Noop {
        fn invoke(&self, _invocation: &mut Invocation<'_>) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    struct Custom;

    impl InjectionScope for Custom {
        const NAME: &'static str = "custom";
    }

    fn model(points: Vec<InjectionPoint>) -> Arc<CompositeModel> {
        let fragment = points
            .into_iter()
            .fold(FragmentModel::mixin("noop", |_| Ok(Noop)), FragmentModel::inject);
        CompositeModel::builder("Subject")
            .public_types("app", ["Subject"])
            .fragment(fragment)
            .method(MethodModel::new("run", "Subject").mixin("noop"))
            .build()
            .expect("模型合法")
    }

    #[test]
    fn plan_splits_points_by_timing() {
        let model = model(vec![
            InjectionPoint::new::<scope::This>("this"),
            InjectionPoint::new::<scope::Invocation>("call"),
        ]);
        let plan = InjectionResolver::with_builtin().plan(&model).expect("可解析");
        let fragment = plan.fragment(&"noop".into()).expect("片段存在");
        assert_eq!(fragment.on_creation().len(), 1);
        assert_eq!(fragment.per_invocation()[0].name(), "call");
    }

    #[test]
    fn missing_provider_fails_required_points_only() {
        let required = model(vec![InjectionPoint::new::<Custom>("thing")]);
        let err = InjectionResolver::with_builtin()
            .plan(&required)
            .expect_err("没有提供者");
        assert_eq!(err.code(), codes::INJECTION_UNRESOLVED);
        assert!(matches!(
            err.detail(),
            Some(ErrorDetail::Injection { fragment, point }) if fragment == "noop" && point == "thing"
        ));

        let optional = model(vec![InjectionPoint::new::<Custom>("thing").optional()]);
        let plan = InjectionResolver::with_builtin().plan(&optional).expect("可选点可缺省");
        assert!(plan.fragment(&"noop".into()).expect("存在").on_creation().is_empty());
    }

    #[test]
    fn state_points_must_name_a_declared_member() {
        let model = model(vec![
            InjectionPoint::new::<scope::State>("name").with_target("Subject:missing"),
        ]);
        let err = InjectionResolver::with_builtin()
            .plan(&model)
            .expect_err("目标不存在");
        assert_eq!(err.code(), codes::INJECTION_UNRESOLVED);
    }

    #[test]
    fn injections_downcast_by_type() {
        let mut injections = Injections::default();
        injections.insert(Arc::from("answer"), Arc::new(42_u32));
        assert_eq!(injections.get::<u32>("answer").as_deref(), Some(&42));
        assert!(injections.get::<String>("answer").is_none());
        assert_eq!(
            injections.require::<u32>("missing").expect_err("缺值").code(),
            codes::INJECTION_UNRESOLVED
        );
    }
}
