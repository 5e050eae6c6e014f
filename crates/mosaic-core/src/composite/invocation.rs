//! 调用链驱动与显式调用上下文。
//!
//! # 教案式说明
//! - **意图（Why）**：一次组合方法调用要依次经过 concern、mixin、side effect；
//!   片段需要回答“当前正在执行什么”，嵌套调用需要沿用同一个跃迁所有者；
//! - **逻辑（How）**：
//!   1. [`InvocationContext`] 是调用方持有的显式上下文：调用栈、跃迁所有者、取消令牌；
//!      嵌套调用通过 [`Invocation::invoke_self`] 复用同一个上下文，不依赖线程局部状态；
//!   2. 参数约束在进入调用链之前检查，违例时调用链完全不执行；
//!   3. 每进入一个片段：借出片段实例 → 压栈 → 解析逐调用注入 → 执行 → 出栈 → 归还；
//!   4. concern 通过 [`Next`] 继续，池化 concern 的下一跳写入其片段实例；
//!   5. side effect 在结果确定后按序执行，拿到结果的只读引用，自身失败只记录警告；
//! - **契约（What）**：同一次调用内片段严格按声明顺序串行执行；调用方收到的结果与 side effect 观察到的结果一致。

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use super::{
    constraint::{ViolationReport, check_value},
    fragment::{FragmentInstance, FragmentRef, MethodResult, NextInfo},
    instance::CompositeInstance,
    pool::FragmentLease,
};
use crate::{
    error::{CoreError, Result, codes},
    injection::{InjectionContext, Injections, InvocationSite},
    lifecycle::{Cancellation, TransitionOwner},
    model::{FragmentTypeId, MethodModel},
    observability::keys,
};

/// 调用栈上的一帧。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackFrame {
    /// 组合模型名。
    pub composite: Arc<str>,
    /// 方法名。
    pub method: Arc<str>,
    /// 正在执行的片段；刚进入方法、尚未进入任何片段时为 `None`。
    pub fragment: Option<FragmentTypeId>,
}

/// 调用方持有的显式调用上下文。
#[derive(Debug)]
pub struct InvocationContext {
    frames: Vec<StackFrame>,
    owner: Option<TransitionOwner>,
    cancellation: Cancellation,
}

impl InvocationContext {
    pub fn new(cancellation: Cancellation) -> Self {
        Self {
            frames: Vec::new(),
            owner: None,
            cancellation,
        }
    }

    /// 以指定跃迁所有者发起调用；生命周期动作内部的调用借此识别自身重入。
    pub fn with_owner(mut self, owner: TransitionOwner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn owner(&self) -> Option<TransitionOwner> {
        self.owner
    }

    /// 取得所有者，尚未分配时分配新令牌并记住。
    pub(crate) fn owner_or_fresh(&mut self) -> TransitionOwner {
        *self.owner.get_or_insert_with(TransitionOwner::fresh)
    }

    /// 栈底在前的调用栈。
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    /// 栈顶帧，即“当前正在执行什么”。
    pub fn current(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    fn push(&mut self, frame: StackFrame) {
        self.frames.push(frame);
    }

    fn pop(&mut self) {
        self.frames.pop();
    }
}

/// concern 的后继句柄，只能由调用链驱动器构造。
#[derive(Debug)]
pub struct Next {
    position: usize,
}

impl Next {
    /// 执行调用链的剩余部分。
    pub fn proceed(self, invocation: &mut Invocation<'_>) -> Result<Value> {
        invocation.proceed_from(self.position)
    }
}

/// 一次方法调用在片段眼中的全部现场。
pub struct Invocation<'a> {
    composite: &'a CompositeInstance,
    method: &'a MethodModel,
    method_index: usize,
    args: Vec<Value>,
    context: &'a mut InvocationContext,
    injected: Injections,
    current: Option<Arc<FragmentInstance>>,
}

impl<'a> Invocation<'a> {
    pub fn composite(&self) -> &'a CompositeInstance {
        self.composite
    }

    pub fn method(&self) -> &'a MethodModel {
        self.method
    }

    pub fn method_index(&self) -> usize {
        self.method_index
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// concern 可在继续调用链之前改写参数。
    pub fn args_mut(&mut self) -> &mut Vec<Value> {
        &mut self.args
    }

    /// 当前片段的逐调用注入值。
    pub fn injections(&self) -> &Injections {
        &self.injected
    }

    /// 取回当前片段的逐调用注入值。
    pub fn injected<T: std::any::Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.injected.get(name)
    }

    /// 当前正在执行的片段实例。
    pub fn current_fragment(&self) -> Option<&Arc<FragmentInstance>> {
        self.current.as_ref()
    }

    pub fn context(&self) -> &InvocationContext {
        &*self.context
    }

    pub fn cancellation(&self) -> &Cancellation {
        self.context.cancellation()
    }

    /// 在同一组合上发起嵌套调用，沿用本次调用的上下文与跃迁所有者。
    pub fn invoke_self(&mut self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.composite.invoke_with(self.context, method, args)
    }

    fn proceed_from(&mut self, position: usize) -> Result<Value> {
        let method = self.method;
        let method_index = self.method_index;
        if let Some(type_id) = method.concerns().get(position) {
            return self.enter(type_id, |invocation, lease| {
                let following = if lease.is_pooled() {
                    lease.set_next_info(Some(NextInfo {
                        method_index,
                        concern_index: position + 1,
                    }));
                    lease
                        .next_info()
                        .map_or(position + 1, |info| info.concern_index)
                } else {
                    position + 1
                };
                match lease.fragment() {
                    Some(FragmentRef::Concern(concern)) => concern.invoke(
                        invocation,
                        Next {
                            position: following,
                        },
                    ),
                    _ => Err(role_mismatch(type_id, "concern")),
                }
            });
        }
        let Some(type_id) = method.mixin_type() else {
            return Err(role_mismatch(&FragmentTypeId::from(method.name()), "mixin"));
        };
        self.enter(type_id, |invocation, lease| match lease.fragment() {
            Some(FragmentRef::Mixin(mixin)) => mixin.invoke(invocation),
            _ => Err(role_mismatch(type_id, "mixin")),
        })
    }

    fn run_side_effects(&mut self, outcome: &Result<Value>) {
        let method = self.method;
        let method_index = self.method_index;
        for type_id in method.side_effects() {
            let observed = self.enter(type_id, |invocation, lease| {
                if lease.is_pooled() {
                    lease.set_method_result(Some(MethodResult {
                        method_index,
                        outcome: outcome.clone(),
                    }));
                }
                match lease.fragment() {
                    Some(FragmentRef::SideEffect(effect)) => effect.observe(invocation, outcome),
                    _ => Err(role_mismatch(type_id, "side effect")),
                }
            });
            if let Err(err) = observed {
                warn!(
                    { keys::COMPOSITE_MODEL } = self.composite.model().name(),
                    { keys::METHOD_NAME } = method.name(),
                    { keys::FRAGMENT_ID } = %type_id,
                    { keys::ERROR_CODE } = err.code(),
                    "side effect failed, the method outcome is unaffected: {err}"
                );
            }
        }
    }

    /// 进入一个片段：借出实例、压栈、解析逐调用注入，执行 `body` 后逆序恢复现场。
    fn enter<R>(
        &mut self,
        type_id: &'a FragmentTypeId,
        body: impl FnOnce(&mut Self, &FragmentLease<'a>) -> Result<R>,
    ) -> Result<R> {
        let composite = self.composite;
        let lease = composite
            .fragments()
            .acquire(type_id, || composite.create_fragment(type_id))?;

        self.context.push(StackFrame {
            composite: composite.model_name(),
            method: self.method.shared_name(),
            fragment: Some(type_id.clone()),
        });
        let injected = {
            let site = InvocationSite {
                method: self.method,
                method_index: self.method_index,
                frames: self.context.frames(),
            };
            composite.structure().resolver().resolve(
                composite.per_invocation_points(type_id),
                &InjectionContext::invocation(composite, type_id, site),
            )
        };
        let injected = match injected {
            Ok(injected) => injected,
            Err(err) => {
                self.context.pop();
                return Err(err);
            }
        };

        let saved_injected = std::mem::replace(&mut self.injected, injected);
        let saved_current = self.current.replace(Arc::clone(lease.instance()));
        let outcome = body(self, &lease);
        self.current = saved_current;
        self.injected = saved_injected;
        self.context.pop();
        outcome
    }
}

/// 检查参数约束并驱动整条调用链。
pub(crate) fn dispatch(
    composite: &CompositeInstance,
    context: &mut InvocationContext,
    method_index: usize,
    args: Vec<Value>,
) -> Result<Value> {
    let Some(method) = composite.model().methods().get(method_index) else {
        return Err(CoreError::new(
            codes::COMPOSITE_UNKNOWN_METHOD,
            format!("method index {method_index} is out of range"),
        ));
    };
    check_parameters(method, &args)?;

    context.push(StackFrame {
        composite: composite.model_name(),
        method: method.shared_name(),
        fragment: None,
    });
    let mut invocation = Invocation {
        composite,
        method,
        method_index,
        args,
        context,
        injected: Injections::default(),
        current: None,
    };
    let outcome = invocation.proceed_from(0);
    invocation.run_side_effects(&outcome);
    invocation.context.pop();
    outcome
}

fn check_parameters(method: &MethodModel, args: &[Value]) -> Result<()> {
    let mut report = ViolationReport::default();
    for (index, parameter) in method.parameters().iter().enumerate() {
        let value = args.get(index).unwrap_or(&Value::Null);
        let violations = check_value(value, parameter.constraints(), parameter.is_optional());
        report.extend_named(format!("{}({})", method.name(), parameter.name()), violations);
    }
    if report.is_empty() {
        Ok(())
    } else {
        Err(report.into_error())
    }
}

fn role_mismatch(type_id: &FragmentTypeId, expected: &str) -> CoreError {
    CoreError::new(
        codes::FACTORY_CREATION_FAILED,
        format!("fragment `{type_id}` is not a {expected}"),
    )
}
