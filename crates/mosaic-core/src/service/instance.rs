//! 带生命周期的服务组合实例。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use serde_json::Value;
use tracing::debug;

use crate::{
    composite::{CompositeInstance, InvocationContext},
    error::{CoreError, Result, codes},
    lifecycle::{
        ActivationOutcome, Cancellation, LifecycleController, LifecycleState, PassivationOutcome,
        TransitionOwner,
    },
    model::{ServiceId, ServiceModel},
    observability::keys,
};

/// 服务激活 / 钝化动作可见的现场。
///
/// 动作内部经由 [`invoke`](Self::invoke) 调用服务自身方法时沿用本次跃迁的所有者，
/// 因而不会等待自己的激活结算。
pub struct ServiceActionContext<'a> {
    service: &'a ServiceCompositeInstance,
    owner: TransitionOwner,
}

impl<'a> ServiceActionContext<'a> {
    pub fn service(&self) -> &'a ServiceCompositeInstance {
        self.service
    }

    pub fn owner(&self) -> TransitionOwner {
        self.owner
    }

    /// 以本次跃迁的所有者调用服务方法。
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let mut context = InvocationContext::new(self.cancellation()).with_owner(self.owner);
        self.service.invoke_with(&mut context, method, args)
    }

    pub fn cancellation(&self) -> Cancellation {
        self.service.composite.structure().cancellation_token()
    }
}

/// 服务组合实例：组合实例 + 服务级生命周期。
///
/// # 契约说明（What）
/// - 激活动作：结束组合的原型阶段，然后按声明顺序执行服务模型的激活动作；
/// - 激活闸门关闭时（应用未激活或正在钝化），新的激活请求以
///   [`codes::LIFECYCLE_ACTIVATION_NOT_ALLOWED`] 失败，已处于 ACTIVE 的服务不受影响；
/// - 方法调用在服务未激活时透明地触发激活，激活失败作为该次调用的错误返回。
pub struct ServiceCompositeInstance {
    model: Arc<ServiceModel>,
    composite: Arc<CompositeInstance>,
    lifecycle: LifecycleController,
    activation_allowed: Arc<AtomicBool>,
    sequence: u64,
}

impl ServiceCompositeInstance {
    pub(crate) fn new(
        model: Arc<ServiceModel>,
        composite: Arc<CompositeInstance>,
        activation_allowed: Arc<AtomicBool>,
        sequence: u64,
    ) -> Self {
        let lifecycle = LifecycleController::new(
            format!("service `{}`", model.id()),
            composite.structure().config().wait_slice(),
        );
        Self {
            model,
            composite,
            lifecycle,
            activation_allowed,
            sequence,
        }
    }

    pub fn id(&self) -> &ServiceId {
        self.model.id()
    }

    pub fn model(&self) -> &Arc<ServiceModel> {
        &self.model
    }

    pub fn composite(&self) -> &Arc<CompositeInstance> {
        &self.composite
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    /// 物化顺序，钝化扫描按其逆序进行。
    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    /// 显式激活服务。
    pub fn activate(&self) -> Result<ActivationOutcome> {
        self.activate_as(TransitionOwner::fresh())
    }

    /// 显式钝化服务。
    pub fn passivate(&self) -> Result<PassivationOutcome> {
        self.passivate_as(TransitionOwner::fresh())
    }

    pub(crate) fn activate_as(&self, owner: TransitionOwner) -> Result<ActivationOutcome> {
        if !self.activation_permitted() && !self.lifecycle.is_transition_owner(owner) {
            if self.lifecycle.is_active() {
                return Ok(ActivationOutcome::AlreadyActive);
            }
            return Err(self.not_allowed());
        }
        self.lifecycle.activate(owner, |owner| {
            // 赢得 CAS 后复查闸门：与应用钝化的清闸赛跑时，要么在这里失败，要么被钝化扫描看到。
            if !self.activation_permitted() {
                return Err(self.not_allowed());
            }
            self.composite.ensure_instantiated(owner)?;
            let context = ServiceActionContext {
                service: self,
                owner,
            };
            for action in self.model.activation_actions() {
                action(&context)?;
            }
            debug!({ keys::SERVICE_ID } = %self.id(), "service activation actions completed");
            Ok(())
        })
    }

    pub(crate) fn passivate_as(&self, owner: TransitionOwner) -> Result<PassivationOutcome> {
        self.lifecycle.passivate(owner, |owner, sweep| {
            let context = ServiceActionContext {
                service: self,
                owner,
            };
            for (position, action) in self.model.passivation_actions().iter().enumerate() {
                sweep.run(
                    &format!("service `{}` passivation action #{position}", self.id()),
                    || action(&context),
                );
            }
        })
    }

    /// 以全新上下文调用服务方法。
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let mut context = InvocationContext::new(self.composite.structure().cancellation_token());
        self.invoke_with(&mut context, method, args)
    }

    /// 在给定上下文中调用服务方法，必要时先惰性激活。
    pub fn invoke_with(
        &self,
        context: &mut InvocationContext,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let owner = context.owner_or_fresh();
        if !self.lifecycle.is_active() {
            self.activate_as(owner)?;
        }
        self.composite.invoke_with(context, method, args)
    }

    fn activation_permitted(&self) -> bool {
        self.activation_allowed.load(Ordering::SeqCst)
    }

    fn not_allowed(&self) -> CoreError {
        CoreError::new(
            codes::LIFECYCLE_ACTIVATION_NOT_ALLOWED,
            format!(
                "service `{}` cannot be activated while the application is not active",
                self.id()
            ),
        )
    }
}

impl fmt::Debug for ServiceCompositeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCompositeInstance")
            .field("id", self.id())
            .field("state", &self.state())
            .field("sequence", &self.sequence)
            .finish()
    }
}
