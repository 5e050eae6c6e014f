//! 生命周期四态。

use core::fmt;

/// 可由 [`TransitionGate`](super::gate::TransitionGate) 驱动的状态类型。
///
/// 状态以 `u8` 存放在原子单元中，实现者需保证 `from_raw(to_raw(s)) == s`，
/// 且 `from_raw` 对网关写入过的任何值都是全函数。
pub trait GateState: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// 编码为原子单元中的原始值。
    fn to_raw(self) -> u8;
    /// 从原始值解码。
    fn from_raw(raw: u8) -> Self;
    /// 是否为过渡态；等待者在过渡态上阻塞，直到跃迁结算。
    fn is_transitional(self) -> bool;
}

/// 应用与服务共用的生命周期状态。
///
/// 合法路径：`Passive → DuringActivation → {Active | Passive}`，
/// `Active → DuringPassivation → Passive`；不存在跳过过渡态的跃迁。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LifecycleState {
    Passive = 0,
    DuringActivation = 1,
    Active = 2,
    DuringPassivation = 3,
}

impl LifecycleState {
    /// 稳定的小写标签，用于日志字段。
    pub fn label(self) -> &'static str {
        match self {
            LifecycleState::Passive => "passive",
            LifecycleState::DuringActivation => "during_activation",
            LifecycleState::Active => "active",
            LifecycleState::DuringPassivation => "during_passivation",
        }
    }
}

impl GateState for LifecycleState {
    fn to_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => LifecycleState::DuringActivation,
            2 => LifecycleState::Active,
            3 => LifecycleState::DuringPassivation,
            _ => LifecycleState::Passive,
        }
    }

    fn is_transitional(self) -> bool {
        matches!(
            self,
            LifecycleState::DuringActivation | LifecycleState::DuringPassivation
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
