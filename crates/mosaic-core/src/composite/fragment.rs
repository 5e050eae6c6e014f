//! 片段角色契约与片段实例。
//!
//! # 教案式说明
//! - **意图（Why）**：组合方法由多个片段协作完成：concern 包裹调用，mixin 给出实现，side effect 在结果确定后旁观；
//! - **逻辑（How）**：三种角色各自是一个对象安全的 trait，由 [`FragmentRef`] 统一承载；
//!   [`FragmentInstance`] 在片段对象之外保存“单次调用”状态（下一跳信息与方法结果），
//!   池化片段每次借出只服务一个调用，因此这些状态不会被并发调用者观察到；
//! - **契约（What）**：片段对象只设置一次，重复设置被忽略；调用状态在归还到池时清空。

use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;
use serde_json::Value;

use super::invocation::{Invocation, Next};
use crate::{error::Result, model::FragmentTypeId};

/// 包裹调用的 concern。
///
/// 实现者通过 `next.proceed(invocation)` 继续调用链，可以在此前改写参数、在此后改写结果，
/// 也可以完全不调用 `next` 而直接给出结果。
pub trait Concern: Send + Sync {
    fn invoke(&self, invocation: &mut Invocation<'_>, next: Next) -> Result<Value>;
}

/// 方法的唯一实现。
pub trait Mixin: Send + Sync {
    fn invoke(&self, invocation: &mut Invocation<'_>) -> Result<Value>;
}

/// 结果确定后按序执行的旁观者。
///
/// 返回的错误只会被记录，不影响调用方收到的结果。
pub trait SideEffect: Send + Sync {
    fn observe(&self, invocation: &mut Invocation<'_>, outcome: &Result<Value>) -> Result<()>;
}

/// 按角色区分的片段对象。
#[derive(Clone)]
pub enum FragmentRef {
    Concern(Arc<dyn Concern>),
    Mixin(Arc<dyn Mixin>),
    SideEffect(Arc<dyn SideEffect>),
}

impl FragmentRef {
    pub fn role_label(&self) -> &'static str {
        match self {
            FragmentRef::Concern(_) => "concern",
            FragmentRef::Mixin(_) => "mixin",
            FragmentRef::SideEffect(_) => "side_effect",
        }
    }
}

impl fmt::Debug for FragmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FragmentRef").field(&self.role_label()).finish()
    }
}

/// concern 链上的下一跳位置。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NextInfo {
    pub method_index: usize,
    pub concern_index: usize,
}

/// 供 side effect 读取的方法结果。
#[derive(Clone, Debug, PartialEq)]
pub struct MethodResult {
    pub method_index: usize,
    pub outcome: Result<Value>,
}

/// 片段对象与其单次调用状态。
pub struct FragmentInstance {
    type_id: FragmentTypeId,
    fragment: OnceLock<FragmentRef>,
    next_info: Mutex<Option<NextInfo>>,
    method_result: Mutex<Option<MethodResult>>,
}

impl FragmentInstance {
    pub fn new(type_id: FragmentTypeId) -> Self {
        Self {
            type_id,
            fragment: OnceLock::new(),
            next_info: Mutex::new(None),
            method_result: Mutex::new(None),
        }
    }

    pub fn type_id(&self) -> &FragmentTypeId {
        &self.type_id
    }

    /// 设置片段对象，返回本次是否生效。
    pub fn set_fragment(&self, fragment: FragmentRef) -> bool {
        self.fragment.set(fragment).is_ok()
    }

    pub fn fragment(&self) -> Option<&FragmentRef> {
        self.fragment.get()
    }

    pub fn next_info(&self) -> Option<NextInfo> {
        *self.next_info.lock()
    }

    pub fn set_next_info(&self, info: Option<NextInfo>) {
        *self.next_info.lock() = info;
    }

    pub fn method_result(&self) -> Option<MethodResult> {
        self.method_result.lock().clone()
    }

    pub fn set_method_result(&self, result: Option<MethodResult>) {
        *self.method_result.lock() = result;
    }

    /// 清空单次调用状态，片段对象保留。
    pub(crate) fn reset(&self) {
        self.set_next_info(None);
        self.set_method_result(None);
    }
}

impl fmt::Debug for FragmentInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentInstance")
            .field("type_id", &self.type_id)
            .field("fragment", &self.fragment.get())
            .field("next_info", &self.next_info())
            .finish()
    }
}
