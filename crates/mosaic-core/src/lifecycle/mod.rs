//! 生命周期：恰好一次的状态跃迁原语，以及构建其上的激活 / 钝化协议。
//!
//! # 模块地图
//! - [`state`]：`LifecycleState` 四态与可被网关驱动的 [`GateState`] 抽象；
//! - [`gate`]：CAS + 条件变量实现的 [`TransitionGate`] 与所有者令牌 [`TransitionOwner`]；
//! - [`controller`]：应用与服务共用的 [`LifecycleController`]；
//! - [`sweep`]：钝化期间的失败累积器 [`PassivationSweep`]；
//! - [`cancellation`]：应用级协作式取消源。

pub mod cancellation;
pub mod controller;
pub mod gate;
pub mod state;
pub mod sweep;

pub use cancellation::{Cancellation, CancellationSource};
pub use controller::{ActivationOutcome, LifecycleController, PassivationOutcome};
pub use gate::{Contended, TransitionGate, TransitionOwner};
pub use state::{GateState, LifecycleState};
pub use sweep::PassivationSweep;
