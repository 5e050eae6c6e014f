//! 生命周期控制器的性质验证。
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：对任意顺序的激活 / 钝化请求（含失败动作与重入请求），验证控制器始终收敛到
//!   PASSIVE 或 ACTIVE，且动作执行次数与真实发生的跃迁次数严格相等。
//! - **设计手法 (How)**：以布尔影子模型 `Shadow` 预测每一步的结果，再与 [`LifecycleController`] 的实际返回对照，
//!   属于 Model-Based Testing。
//!
//! # 合同与边界 (What)
//!
//! - 失败的激活回滚为 PASSIVE，不计入成功跃迁；
//! - 存在失败步骤的钝化仍然结算为 PASSIVE，并以聚合错误报告；
//! - 重入请求（同一所有者在自己的激活中再次激活）不重复执行动作。

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use mosaic_core::{
    codes,
    error::CoreError,
    lifecycle::{
        ActivationOutcome, LifecycleController, LifecycleState, PassivationOutcome, TransitionOwner,
    },
};
use proptest::prelude::*;

/// 状态机输入事件。
#[derive(Clone, Copy, Debug)]
enum Op {
    Activate,
    FailingActivate,
    NestedActivate,
    Passivate,
    FailingPassivate,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Activate),
        1 => Just(Op::FailingActivate),
        1 => Just(Op::NestedActivate),
        3 => Just(Op::Passivate),
        1 => Just(Op::FailingPassivate),
    ]
}

/// 影子模型：只记录是否处于 ACTIVE 以及预期的动作执行次数。
#[derive(Default)]
struct Shadow {
    active: bool,
    activations: usize,
    passivations: usize,
}

struct Harness {
    controller: LifecycleController,
    activations: AtomicUsize,
    passivations: AtomicUsize,
}

impl Harness {
    fn new() -> Self {
        Self {
            controller: LifecycleController::new("property", Duration::from_millis(1)),
            activations: AtomicUsize::new(0),
            passivations: AtomicUsize::new(0),
        }
    }

    fn apply(&self, op: Op, shadow: &mut Shadow) -> Result<(), TestCaseError> {
        let owner = TransitionOwner::fresh();
        match op {
            Op::Activate | Op::NestedActivate => {
                let outcome = self.controller.activate(owner, |owner| {
                    self.activations.fetch_add(1, Ordering::SeqCst);
                    if matches!(op, Op::NestedActivate) {
                        let nested = self.controller.activate(owner, |_| {
                            Err(CoreError::fragment("nested action must not run"))
                        })?;
                        assert_eq!(nested, ActivationOutcome::Reentrant);
                    }
                    Ok(())
                });
                if shadow.active {
                    prop_assert_eq!(outcome, Ok(ActivationOutcome::AlreadyActive));
                } else {
                    prop_assert_eq!(outcome, Ok(ActivationOutcome::Executed));
                    shadow.active = true;
                    shadow.activations += 1;
                }
            }
            Op::FailingActivate => {
                let outcome = self.controller.activate(owner, |_| {
                    self.activations.fetch_add(1, Ordering::SeqCst);
                    Err(CoreError::fragment("refused"))
                });
                if shadow.active {
                    prop_assert_eq!(outcome, Ok(ActivationOutcome::AlreadyActive));
                } else {
                    let err = outcome.expect_err("失败动作必须报错");
                    prop_assert_eq!(err.code(), codes::LIFECYCLE_ACTIVATION_FAILED);
                    shadow.activations += 1;
                }
            }
            Op::Passivate | Op::FailingPassivate => {
                let outcome = self.controller.passivate(owner, |_, sweep| {
                    self.passivations.fetch_add(1, Ordering::SeqCst);
                    sweep.run("flush", || Ok(()));
                    if matches!(op, Op::FailingPassivate) {
                        sweep.run("close", || Err(CoreError::fragment("close failed")));
                    }
                });
                match (shadow.active, op) {
                    (false, _) => {
                        prop_assert_eq!(outcome, Ok(PassivationOutcome::AlreadyPassive));
                    }
                    (true, Op::FailingPassivate) => {
                        let err = outcome.expect_err("失败步骤必须被聚合报告");
                        prop_assert_eq!(err.code(), codes::LIFECYCLE_PASSIVATION_FAILED);
                        shadow.active = false;
                        shadow.passivations += 1;
                    }
                    (true, _) => {
                        prop_assert_eq!(outcome, Ok(PassivationOutcome::Executed));
                        shadow.active = false;
                        shadow.passivations += 1;
                    }
                }
            }
        }

        let expected = if shadow.active {
            LifecycleState::Active
        } else {
            LifecycleState::Passive
        };
        prop_assert_eq!(self.controller.state(), expected);
        prop_assert_eq!(self.activations.load(Ordering::SeqCst), shadow.activations);
        prop_assert_eq!(self.passivations.load(Ordering::SeqCst), shadow.passivations);
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_every_sequence_settles_and_counts_transitions(ops in prop::collection::vec(op(), 1..48)) {
        let harness = Harness::new();
        let mut shadow = Shadow::default();
        for op in ops {
            harness.apply(op, &mut shadow)?;
        }
    }

    #[test]
    fn prop_actions_run_at_most_once_per_transition(ops in prop::collection::vec(op(), 1..48)) {
        let harness = Harness::new();
        let mut shadow = Shadow::default();
        let mut activations_seen = 0usize;
        for op in ops {
            let was_active = shadow.active;
            harness.apply(op, &mut shadow)?;
            let ran = harness.activations.load(Ordering::SeqCst) - activations_seen;
            activations_seen += ran;
            prop_assert!(ran <= 1);
            if was_active {
                prop_assert_eq!(ran, 0, "ACTIVE 上的激活请求不得执行动作");
            }
        }
    }
}
