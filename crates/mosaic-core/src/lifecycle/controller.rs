//! 激活 / 钝化协议。
//!
//! # 教案式说明
//! - **意图（Why）**：应用与每个服务都需要“并发安全、动作恰好执行一次”的激活与钝化；
//!   两者语义不同：激活失败可重试，钝化无论成败都必须收敛到 PASSIVE；
//! - **逻辑（How）**：基于 [`TransitionGate`] 实现两个循环：
//!   - 激活：CAS `Passive → DuringActivation`，赢家执行动作，成功结算为 `Active`，失败回滚为 `Passive`；
//!   - 钝化：CAS `Active → DuringPassivation`，赢家执行动作并累积所有失败，最后强制结算为 `Passive`；
//!   - 输家根据观察到的状态与所有者令牌决定：立即返回、报告编程错误，或等待结算后重试；
//! - **契约（What）**：
//!   - 同一所有者在自身激活动作内部再次请求激活，视为重入并立即成功返回；
//!   - 同一所有者在自身钝化动作内部请求激活，立即以 `ProgrammingError` 失败；
//!   - 其他所有者遇到过渡态时阻塞等待，结算后重新判定，因而结果可能与初次观察不同。

use std::borrow::Cow;

use tracing::{debug, warn};

use crate::{
    error::{CoreError, ErrorCategory, Result, codes},
    observability::keys,
};

use super::{
    gate::{SettleGuard, TransitionGate, TransitionOwner},
    state::LifecycleState,
    sweep::PassivationSweep,
};

/// 激活调用的结局。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// 本次调用赢得 CAS 并执行了激活动作。
    Executed,
    /// 目标已处于 ACTIVE（可能是等待他人激活结算后观察到的）。
    AlreadyActive,
    /// 调用方就是在途激活的所有者，未重复执行。
    Reentrant,
}

/// 钝化调用的结局。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassivationOutcome {
    /// 本次调用执行了钝化动作且没有失败。
    Executed,
    /// 目标已处于 PASSIVE，调用为空操作。
    AlreadyPassive,
    /// 调用方就是在途钝化的所有者，未重复执行。
    Reentrant,
}

/// 单个生命周期目标（应用或服务）的状态控制器。
pub struct LifecycleController {
    target: Cow<'static, str>,
    gate: TransitionGate<LifecycleState>,
}

impl LifecycleController {
    /// 创建处于 PASSIVE 的控制器。
    pub fn new(target: impl Into<Cow<'static, str>>, wait_slice: std::time::Duration) -> Self {
        Self {
            target: target.into(),
            gate: TransitionGate::new(LifecycleState::Passive, wait_slice),
        }
    }

    /// 目标标签。
    pub fn target(&self) -> &str {
        &self.target
    }

    /// 当前状态。
    pub fn state(&self) -> LifecycleState {
        self.gate.state()
    }

    /// 是否处于 ACTIVE。
    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    /// `owner` 是否正在执行本目标的某个跃迁。
    pub fn is_transition_owner(&self, owner: TransitionOwner) -> bool {
        self.gate.is_owned_by(owner)
    }

    /// 执行激活协议。
    ///
    /// - **输入**：`owner` 标识本次调用的执行链；`action` 仅在赢得 CAS 时被调用一次，入参为同一令牌；
    /// - **返回**：动作失败时返回 [`codes::LIFECYCLE_ACTIVATION_FAILED`]（`Retryable`），原始错误作为 `source`；
    ///   状态此时已回滚为 PASSIVE。
    pub fn activate<F>(&self, owner: TransitionOwner, action: F) -> Result<ActivationOutcome>
    where
        F: FnOnce(TransitionOwner) -> Result<()>,
    {
        loop {
            match self.gate.try_claim(
                LifecycleState::Passive,
                LifecycleState::DuringActivation,
                owner,
            ) {
                Ok(()) => return self.run_activation(owner, action),
                Err(contended) => match contended.observed {
                    LifecycleState::Active => return Ok(ActivationOutcome::AlreadyActive),
                    LifecycleState::DuringActivation => {
                        if self.gate.is_owned_by(owner) {
                            return Ok(ActivationOutcome::Reentrant);
                        }
                        self.gate.wait_settled();
                    }
                    LifecycleState::DuringPassivation => {
                        if self.gate.is_owned_by(owner) {
                            return Err(CoreError::new(
                                codes::LIFECYCLE_ACTIVATION_DURING_PASSIVATION,
                                format!(
                                    "`{}` cannot be activated from within its own passivation",
                                    self.target
                                ),
                            )
                            .with_category(ErrorCategory::ProgrammingError));
                        }
                        self.gate.wait_settled();
                    }
                    LifecycleState::Passive => {}
                },
            }
        }
    }

    fn run_activation<F>(&self, owner: TransitionOwner, action: F) -> Result<ActivationOutcome>
    where
        F: FnOnce(TransitionOwner) -> Result<()>,
    {
        debug!(
            { keys::LIFECYCLE_TARGET } = %self.target,
            { keys::LIFECYCLE_FROM } = LifecycleState::Passive.label(),
            { keys::LIFECYCLE_TO } = LifecycleState::DuringActivation.label(),
            { keys::LIFECYCLE_OWNER } = owner.raw(),
            "activation started"
        );
        let guard = SettleGuard::new(&self.gate, LifecycleState::Passive);
        match action(owner) {
            Ok(()) => {
                guard.settle(LifecycleState::Active);
                debug!(
                    { keys::LIFECYCLE_TARGET } = %self.target,
                    { keys::LIFECYCLE_TO } = LifecycleState::Active.label(),
                    { keys::LIFECYCLE_OWNER } = owner.raw(),
                    "activation finished"
                );
                Ok(ActivationOutcome::Executed)
            }
            Err(err) => {
                guard.settle(LifecycleState::Passive);
                warn!(
                    { keys::LIFECYCLE_TARGET } = %self.target,
                    { keys::LIFECYCLE_TO } = LifecycleState::Passive.label(),
                    { keys::ERROR_CODE } = err.code(),
                    "activation failed, rolled back: {err}"
                );
                Err(CoreError::new(
                    codes::LIFECYCLE_ACTIVATION_FAILED,
                    format!("activation of `{}` failed: {err}", self.target),
                )
                .with_category(ErrorCategory::Retryable)
                .with_cause(err))
            }
        }
    }

    /// 执行钝化协议。
    ///
    /// - **输入**：`action` 仅在赢得 CAS 时被调用一次，通过 [`PassivationSweep`] 执行子步骤；
    /// - **返回**：扫描中存在失败时返回聚合错误，但状态无论如何都已结算为 PASSIVE；
    /// - **边界**：PASSIVE 上调用为空操作；他人激活在途时先等待其结算，再钝化结算后的结果。
    pub fn passivate<F>(&self, owner: TransitionOwner, action: F) -> Result<PassivationOutcome>
    where
        F: FnOnce(TransitionOwner, &mut PassivationSweep),
    {
        loop {
            match self.gate.try_claim(
                LifecycleState::Active,
                LifecycleState::DuringPassivation,
                owner,
            ) {
                Ok(()) => return self.run_passivation(owner, action),
                Err(contended) => match contended.observed {
                    LifecycleState::Passive => return Ok(PassivationOutcome::AlreadyPassive),
                    LifecycleState::DuringPassivation => {
                        if self.gate.is_owned_by(owner) {
                            return Ok(PassivationOutcome::Reentrant);
                        }
                        self.gate.wait_settled();
                    }
                    LifecycleState::DuringActivation => {
                        if self.gate.is_owned_by(owner) {
                            return Err(CoreError::new(
                                codes::LIFECYCLE_PASSIVATION_DURING_ACTIVATION,
                                format!(
                                    "`{}` cannot be passivated from within its own activation",
                                    self.target
                                ),
                            )
                            .with_category(ErrorCategory::ProgrammingError));
                        }
                        self.gate.wait_settled();
                    }
                    LifecycleState::Active => {}
                },
            }
        }
    }

    fn run_passivation<F>(&self, owner: TransitionOwner, action: F) -> Result<PassivationOutcome>
    where
        F: FnOnce(TransitionOwner, &mut PassivationSweep),
    {
        debug!(
            { keys::LIFECYCLE_TARGET } = %self.target,
            { keys::LIFECYCLE_FROM } = LifecycleState::Active.label(),
            { keys::LIFECYCLE_TO } = LifecycleState::DuringPassivation.label(),
            { keys::LIFECYCLE_OWNER } = owner.raw(),
            "passivation started"
        );
        let guard = SettleGuard::new(&self.gate, LifecycleState::Passive);
        let mut sweep = PassivationSweep::new(self.target.clone());
        let body = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            action(owner, &mut sweep)
        }));
        if body.is_err() {
            sweep.record(CoreError::fragment(format!(
                "passivation action of `{}` panicked",
                self.target
            )));
        }
        guard.settle(LifecycleState::Passive);
        debug!(
            { keys::LIFECYCLE_TARGET } = %self.target,
            { keys::LIFECYCLE_TO } = LifecycleState::Passive.label(),
            { keys::LIFECYCLE_OWNER } = owner.raw(),
            failures = sweep.failure_count(),
            "passivation finished"
        );
        sweep.finish().map(|()| PassivationOutcome::Executed)
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("target", &self.target)
            .field("gate", &self.gate)
            .finish()
    }
}
