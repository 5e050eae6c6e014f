//! 应用级协作式取消。
//!
//! # 教案式说明
//! - **意图（Why）**：应用钝化时，长时间运行的片段代码需要一个共享信号来尽早收尾；
//!   信号是建议性的，框架不会强行中断任何正在执行的代码；
//! - **逻辑（How）**：[`Cancellation`] 以 `Arc<AtomicBool>` 表达单次取消；
//!   [`CancellationSource`] 用 `ArcSwap` 持有“当前令牌”，钝化时取消它，
//!   再次激活时若发现已取消则原子替换为全新令牌；
//! - **契约（What）**：已分发出去的旧令牌永远保持取消状态，新激活周期的代码需重新获取令牌。

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use arc_swap::ArcSwap;

/// 取消令牌。
///
/// - `cancel` 在首次成功设置取消位时返回 `true`，重复调用返回 `false`；
/// - `child` 派生共享同一原子位的令牌。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    /// 创建处于“未取消”状态的令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否已被取消。
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// 标记取消。
    pub fn cancel(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 派生共享同一原子位的子令牌。
    pub fn child(&self) -> Self {
        self.clone()
    }
}

/// 可跨激活周期复用的取消源。
#[derive(Debug)]
pub struct CancellationSource {
    current: ArcSwap<Cancellation>,
}

impl CancellationSource {
    /// 以未取消的令牌初始化。
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Cancellation::new()),
        }
    }

    /// 当前激活周期的令牌。
    pub fn token(&self) -> Cancellation {
        self.current.load().child()
    }

    /// 取消当前令牌；返回是否为首次取消。
    pub fn cancel(&self) -> bool {
        self.current.load().cancel()
    }

    /// 若当前令牌已取消则替换为新令牌，返回是否发生替换。
    ///
    /// 并发调用时只有一次替换生效：`compare_and_swap` 以旧指针为期望值。
    pub fn renew_if_cancelled(&self) -> bool {
        let observed = self.current.load_full();
        if !observed.is_cancelled() {
            return false;
        }
        let previous = self
            .current
            .compare_and_swap(&observed, Arc::new(Cancellation::new()));
        Arc::ptr_eq(&*previous, &observed)
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}
