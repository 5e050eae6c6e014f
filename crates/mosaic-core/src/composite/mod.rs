//! 组合层：状态、约束、片段、实例池、调用链与组合实例。
//!
//! # 模块地图
//! - [`state`]：按限定名寻址的属性与事件参与者；
//! - [`constraint`]：值约束与按成员分组的违例报告；
//! - [`fragment`]：concern / mixin / side effect 契约与片段实例；
//! - [`pool`]：池化片段与共享片段槽；
//! - [`invocation`]：显式调用上下文与调用链驱动；
//! - [`instance`]：组合实例、视图与原型阶段。

pub mod constraint;
pub mod fragment;
pub mod instance;
pub mod invocation;
pub mod pool;
pub mod state;

pub use constraint::{Constraint, ConstraintViolation, NotEmpty, Predicate, Range, ViolationReport};
pub use fragment::{Concern, FragmentInstance, FragmentRef, Mixin, SideEffect};
pub use instance::{
    CompositeBlueprint, CompositeInstance, CompositeRef, PrepareContext, PrototypeState, SelfRef,
};
pub use invocation::{Invocation, InvocationContext, Next, StackFrame};
pub use pool::{FragmentPool, PoolStats};
pub use state::{CompositeState, EventInstance, PropertyInstance, QualifiedName, StateParticipant};
