//! 类型工厂契约及其静态闭包表实现。
//!
//! # 教案式说明
//! - **意图（Why）**：运行时核心不关心片段如何被“生成”，只需要两件事：
//!   给定模型，返回每个片段类型的元数据（是否池化、构造参数个数）；给定类型与构造参数，返回活的片段；
//! - **逻辑（How）**：[`TypeFactory::generate`] 在模型装载期调用一次，产出 [`GeneratedTypes`]，
//!   其中每个 [`GeneratedFragment`] 携带已确定的构造闭包，运行期直接调用，不再查表；
//!   [`StaticTypeFactory`] 优先使用片段描述符自带的闭包，其次使用按类型登记的共享闭包；
//! - **契约（What）**：生成阶段找不到构造闭包即失败（`factory.creation_failed`），
//!   运行期构造出的片段角色必须与描述符一致。

use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    composite::fragment::{FragmentInstance, FragmentRef},
    error::{CoreError, Result, codes},
    injection::Injections,
    model::{CompositeModel, DispatchMode, FragmentRole, FragmentTypeId},
};

/// 片段构造闭包。
pub type FragmentConstructor =
    Arc<dyn Fn(&FragmentCreation<'_>) -> Result<FragmentRef> + Send + Sync>;

/// 构造片段时可见的参数：类型标识与创建期注入值。
#[derive(Debug)]
pub struct FragmentCreation<'a> {
    type_id: &'a FragmentTypeId,
    injections: &'a Injections,
}

impl<'a> FragmentCreation<'a> {
    pub(crate) fn new(type_id: &'a FragmentTypeId, injections: &'a Injections) -> Self {
        Self {
            type_id,
            injections,
        }
    }

    pub fn type_id(&self) -> &FragmentTypeId {
        self.type_id
    }

    pub fn injections(&self) -> &Injections {
        self.injections
    }
}

/// 单个片段类型的生成结果。
#[derive(Clone)]
pub struct GeneratedFragment {
    type_id: FragmentTypeId,
    role: FragmentRole,
    dispatch: DispatchMode,
    arity: usize,
    constructor: FragmentConstructor,
}

impl GeneratedFragment {
    pub fn type_id(&self) -> &FragmentTypeId {
        &self.type_id
    }

    /// 是否需要逐调用独占（池化）。
    pub fn needs_pooling(&self) -> bool {
        self.dispatch == DispatchMode::Generic
    }

    /// 构造参数个数上限，即声明的注入点数量。
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// 构造片段实例。
    pub fn instantiate(&self, creation: &FragmentCreation<'_>) -> Result<FragmentInstance> {
        if creation.injections().len() > self.arity {
            return Err(CoreError::new(
                codes::FACTORY_CREATION_FAILED,
                format!(
                    "fragment `{}` accepts at most {} constructor argument(s), got {}",
                    self.type_id,
                    self.arity,
                    creation.injections().len()
                ),
            ));
        }
        let fragment = (self.constructor)(creation).map_err(|err| {
            CoreError::new(
                codes::FACTORY_CREATION_FAILED,
                format!("constructor of fragment `{}` failed", self.type_id),
            )
            .with_cause(err)
        })?;
        let produced = match &fragment {
            FragmentRef::Concern(_) => FragmentRole::Concern,
            FragmentRef::Mixin(_) => FragmentRole::Mixin,
            FragmentRef::SideEffect(_) => FragmentRole::SideEffect,
        };
        if produced != self.role {
            return Err(CoreError::new(
                codes::FACTORY_CREATION_FAILED,
                format!(
                    "constructor of fragment `{}` produced a {produced:?}, expected a {:?}",
                    self.type_id, self.role
                ),
            ));
        }
        let instance = FragmentInstance::new(self.type_id.clone());
        instance.set_fragment(fragment);
        Ok(instance)
    }
}

impl fmt::Debug for GeneratedFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedFragment")
            .field("type_id", &self.type_id)
            .field("role", &self.role)
            .field("dispatch", &self.dispatch)
            .field("arity", &self.arity)
            .finish()
    }
}

/// 一个组合模型的生成结果。
#[derive(Clone, Debug, Default)]
pub struct GeneratedTypes {
    fragments: HashMap<FragmentTypeId, GeneratedFragment>,
}

impl GeneratedTypes {
    pub fn fragment(&self, type_id: &FragmentTypeId) -> Option<&GeneratedFragment> {
        self.fragments.get(type_id)
    }

    pub fn fragments(&self) -> impl Iterator<Item = &GeneratedFragment> {
        self.fragments.values()
    }

    /// 全部片段中最大的构造参数个数。
    pub fn max_arity(&self) -> usize {
        self.fragments.values().map(GeneratedFragment::arity).max().unwrap_or(0)
    }
}

/// 外部类型工厂契约。
pub trait TypeFactory: Send + Sync {
    fn generate(&self, model: &CompositeModel) -> Result<GeneratedTypes>;
}

/// 以构造闭包表实现的类型工厂。
#[derive(Clone, Default)]
pub struct StaticTypeFactory {
    table: HashMap<FragmentTypeId, FragmentConstructor>,
}

impl StaticTypeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为某个片段类型登记共享构造闭包，供未自带闭包的描述符使用。
    pub fn register(
        mut self,
        type_id: impl Into<FragmentTypeId>,
        constructor: impl Fn(&FragmentCreation<'_>) -> Result<FragmentRef> + Send + Sync + 'static,
    ) -> Self {
        self.table.insert(type_id.into(), Arc::new(constructor));
        self
    }
}

impl TypeFactory for StaticTypeFactory {
    fn generate(&self, model: &CompositeModel) -> Result<GeneratedTypes> {
        let mut fragments = HashMap::new();
        for fragment in model.fragments() {
            let constructor = fragment
                .constructor()
                .or_else(|| self.table.get(fragment.type_id()))
                .cloned()
                .ok_or_else(|| {
                    CoreError::new(
                        codes::FACTORY_CREATION_FAILED,
                        format!(
                            "composite `{}`: no constructor known for fragment `{}`",
                            model.name(),
                            fragment.type_id()
                        ),
                    )
                })?;
            fragments.insert(
                fragment.type_id().clone(),
                GeneratedFragment {
                    type_id: fragment.type_id().clone(),
                    role: fragment.role(),
                    dispatch: fragment.dispatch_mode(),
                    arity: fragment.injections().len(),
                    constructor,
                },
            );
        }
        Ok(GeneratedTypes { fragments })
    }
}

impl fmt::Debug for StaticTypeFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTypeFactory")
            .field("registered", &self.table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::{
        composite::{
            Invocation, Next,
            fragment::{Concern, Mixin},
        },
        model::{FragmentModel, MethodModel},
    };

    struct Pass;

    impl Concern for Pass {
        fn invoke(&self, invocation: &mut Invocation<'_>, next: Next) -> Result<Value> {
            next.proceed(invocation)
        }
    }

    struct Unit;

    impl Mixin for Unit {
        fn invoke(&self, _invocation: &mut Invocation<'_>) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    fn model() -> Arc<CompositeModel> {
        CompositeModel::builder("Unit")
            .public_types("app", ["Unit"])
            .fragment(FragmentModel::declared("pass", FragmentRole::Concern))
            .fragment(FragmentModel::mixin("unit", |_| Ok(Unit)).dispatch(DispatchMode::Virtual))
            .method(MethodModel::new("run", "Unit").concern("pass").mixin("unit"))
            .build()
            .expect("模型合法")
    }

    #[test]
    fn table_fills_in_missing_constructors() {
        let err = StaticTypeFactory::new()
            .generate(&model())
            .expect_err("pass 没有构造闭包");
        assert_eq!(err.code(), codes::FACTORY_CREATION_FAILED);

        let generated = StaticTypeFactory::new()
            .register("pass", |_| Ok(FragmentRef::Concern(Arc::new(Pass))))
            .generate(&model())
            .expect("生成成功");
        assert!(generated.fragment(&"pass".into()).expect("存在").needs_pooling());
        assert!(!generated.fragment(&"unit".into()).expect("存在").needs_pooling());
        assert_eq!(generated.max_arity(), 0);
    }

    #[test]
    fn role_mismatch_is_rejected_at_instantiation() {
        let generated = StaticTypeFactory::new()
            .register("pass", |_| Ok(FragmentRef::Mixin(Arc::new(Unit))))
            .generate(&model())
            .expect("生成成功");
        let injections = Injections::default();
        let pass: FragmentTypeId = "pass".into();
        let err = generated
            .fragment(&pass)
            .expect("存在")
            .instantiate(&FragmentCreation::new(&pass, &injections))
            .expect_err("角色不符");
        assert!(err.message().contains("expected a Concern"));
    }
}
