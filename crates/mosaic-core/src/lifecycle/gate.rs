//! 恰好一次（exactly-once）状态跃迁原语。
//!
//! # 教案式说明
//! - **意图（Why）**：应用激活、服务激活、组合实例退出原型阶段都遵循同一模式：
//!   多个线程同时触发，只有一个线程真正执行动作，其余线程要么立即返回，要么等待动作结算后重试；
//! - **逻辑（How）**：
//!   1. 状态存放在 `AtomicU8` 中，`try_claim` 以 CAS 从“期望初态”推进到“过渡态”，只有 CAS 赢家取得执行权；
//!   2. 赢家写入自己的 [`TransitionOwner`] 令牌，供后续调用区分“自身重入”与“他人并发跃迁”；
//!   3. 结算（`settle`）在互斥锁保护下写入终态、清空令牌并 `notify_all`；
//!      等待者在同一把锁下检查状态，因而不会丢失唤醒；
//! - **契约（What）**：
//!   - 令牌单调递增且永不复用，比较按值进行；
//!   - 条件变量等待以 `wait_slice` 为上限，仅作为活性兜底，正确性依赖通知。

use core::{
    marker::PhantomData,
    num::NonZeroU64,
    sync::atomic::{AtomicU64, AtomicU8, Ordering},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use super::state::GateState;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// 跃迁所有者令牌。
///
/// 每次调用 [`TransitionOwner::fresh`] 都得到一个进程内唯一的值。
/// 调用方把令牌沿显式上下文向下传递，嵌套调用据此判断自己是否就是正在执行跃迁的那一方。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransitionOwner(NonZeroU64);

impl TransitionOwner {
    /// 分配新令牌。
    pub fn fresh() -> Self {
        let raw = NEXT_OWNER.fetch_add(1, Ordering::Relaxed);
        // 计数器从 1 开始，u64 在进程生命周期内不会回绕到 0。
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// 原始值，仅供日志使用。
    pub fn raw(self) -> u64 {
        self.0.get()
    }

    fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }
}

/// `try_claim` 失败时观察到的现场。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Contended<S> {
    /// CAS 失败时读到的状态。
    pub observed: S,
    /// 读到的所有者；过渡态下若赢家尚未写入令牌，可能短暂为 `None`。
    pub owner: Option<TransitionOwner>,
}

/// 基于原子 CAS 与条件变量的跃迁网关。
pub struct TransitionGate<S: GateState> {
    state: AtomicU8,
    owner: AtomicU64,
    lock: Mutex<()>,
    settled: Condvar,
    wait_slice: Duration,
    _state: PhantomData<fn() -> S>,
}

impl<S: GateState> TransitionGate<S> {
    /// 以给定初态创建网关。
    pub fn new(initial: S, wait_slice: Duration) -> Self {
        Self {
            state: AtomicU8::new(initial.to_raw()),
            owner: AtomicU64::new(0),
            lock: Mutex::new(()),
            settled: Condvar::new(),
            wait_slice,
            _state: PhantomData,
        }
    }

    /// 当前状态。
    pub fn state(&self) -> S {
        S::from_raw(self.state.load(Ordering::Acquire))
    }

    /// 当前跃迁所有者；没有跃迁在途时为 `None`。
    pub fn owner(&self) -> Option<TransitionOwner> {
        TransitionOwner::from_raw(self.owner.load(Ordering::Acquire))
    }

    /// 判断 `owner` 是否正是在途跃迁的执行者。
    pub fn is_owned_by(&self, owner: TransitionOwner) -> bool {
        self.owner() == Some(owner)
    }

    /// 尝试以 CAS 从 `expected` 推进到 `intermediate` 并登记所有者。
    ///
    /// - **返回**：`Ok(())` 表示调用方赢得执行权，必须在之后调用 [`settle`](Self::settle)；
    ///   `Err` 携带失败时的现场。
    pub fn try_claim(
        &self,
        expected: S,
        intermediate: S,
        owner: TransitionOwner,
    ) -> Result<(), Contended<S>> {
        // SeqCst：与服务激活闸门的读写共同构成全序，钝化扫描与迟到的惰性激活不会互相错过。
        match self.state.compare_exchange(
            expected.to_raw(),
            intermediate.to_raw(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                self.owner.store(owner.raw(), Ordering::Release);
                Ok(())
            }
            Err(raw) => Err(Contended {
                observed: S::from_raw(raw),
                owner: self.owner(),
            }),
        }
    }

    /// 结算在途跃迁：写入终态、清空所有者并唤醒全部等待者。
    pub fn settle(&self, to: S) {
        let _guard = self.lock.lock();
        self.owner.store(0, Ordering::Release);
        self.state.store(to.to_raw(), Ordering::Release);
        self.settled.notify_all();
    }

    /// 阻塞直到状态离开过渡态，返回结算后的状态。
    pub fn wait_settled(&self) -> S {
        let mut guard = self.lock.lock();
        loop {
            let current = self.state();
            if !current.is_transitional() {
                return current;
            }
            // 超时返回后重新检查即可，无需区分是否被通知唤醒。
            let _ = self.settled.wait_for(&mut guard, self.wait_slice);
        }
    }
}

impl<S: GateState> core::fmt::Debug for TransitionGate<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransitionGate")
            .field("state", &self.state())
            .field("owner", &self.owner())
            .finish()
    }
}

/// 跃迁执行期间的结算守卫。
///
/// 赢家在执行动作前创建守卫；若动作 panic 导致栈展开，守卫在析构时把网关结算到
/// `fallback`，避免等待者永久阻塞在过渡态上。正常路径调用 [`SettleGuard::settle`] 显式结算。
pub(crate) struct SettleGuard<'a, S: GateState> {
    gate: &'a TransitionGate<S>,
    fallback: S,
    armed: bool,
}

impl<'a, S: GateState> SettleGuard<'a, S> {
    pub(crate) fn new(gate: &'a TransitionGate<S>, fallback: S) -> Self {
        Self {
            gate,
            fallback,
            armed: true,
        }
    }

    pub(crate) fn settle(mut self, to: S) {
        self.armed = false;
        self.gate.settle(to);
    }
}

impl<S: GateState> Drop for SettleGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.gate.settle(self.fallback);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::lifecycle::state::LifecycleState;

    fn gate() -> TransitionGate<LifecycleState> {
        TransitionGate::new(LifecycleState::Passive, Duration::from_millis(5))
    }

    #[test]
    fn owners_are_unique() {
        let a = TransitionOwner::fresh();
        let b = TransitionOwner::fresh();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
    }

    #[test]
    fn claim_records_owner_and_settle_clears_it() {
        let gate = gate();
        let owner = TransitionOwner::fresh();
        gate.try_claim(
            LifecycleState::Passive,
            LifecycleState::DuringActivation,
            owner,
        )
        .expect("首个声明者必须获胜");
        assert!(gate.is_owned_by(owner));

        let loser = gate
            .try_claim(
                LifecycleState::Passive,
                LifecycleState::DuringActivation,
                TransitionOwner::fresh(),
            )
            .expect_err("第二个声明者必须失败");
        assert_eq!(loser.observed, LifecycleState::DuringActivation);
        assert_eq!(loser.owner, Some(owner));

        gate.settle(LifecycleState::Active);
        assert_eq!(gate.state(), LifecycleState::Active);
        assert_eq!(gate.owner(), None);
    }

    #[test]
    fn waiters_wake_on_settle() {
        let gate = Arc::new(gate());
        gate.try_claim(
            LifecycleState::Passive,
            LifecycleState::DuringActivation,
            TransitionOwner::fresh(),
        )
        .expect("声明成功");

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait_settled())
        };
        thread::sleep(Duration::from_millis(20));
        gate.settle(LifecycleState::Active);
        assert_eq!(waiter.join().expect("等待线程不应 panic"), LifecycleState::Active);
    }

    #[test]
    fn guard_settles_fallback_on_unwind() {
        let gate = gate();
        gate.try_claim(
            LifecycleState::Passive,
            LifecycleState::DuringActivation,
            TransitionOwner::fresh(),
        )
        .expect("声明成功");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = SettleGuard::new(&gate, LifecycleState::Passive);
            panic!("activation exploded");
        }));
        assert!(result.is_err());
        assert_eq!(gate.state(), LifecycleState::Passive);
        assert_eq!(gate.owner(), None);
    }
}
