//! 片段实例池与共享片段槽。
//!
//! # 教案式说明
//! - **意图（Why）**：池化片段的调用状态（下一跳、方法结果）属于单次调用，
//!   同一实例绝不能同时服务两个调用；而为每次调用都新建片段又过于昂贵；
//! - **逻辑（How）**：
//!   1. 借出时以 `try_lock` 访问空闲栈：拿到锁且栈非空则复用，否则立即新建实例，借出路径从不等待；
//!   2. 归还时清空调用状态再压栈，超出 `max_idle` 的实例直接丢弃；
//!   3. 共享片段以 `OnceLock` 保存，允许多个线程竞争创建，只有第一个写入生效；
//! - **契约（What）**：[`FragmentLease`] 析构即归还，借出期间实例被调用方独占。

use std::{
    collections::HashMap,
    fmt,
    ops::Deref,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;

use super::fragment::FragmentInstance;
use crate::{
    error::{CoreError, Result, codes},
    model::FragmentTypeId,
};

/// 池的诊断计数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 累计新建的实例数。
    pub created: usize,
    /// 从空闲栈复用的次数。
    pub reused: usize,
    /// 当前空闲实例数。
    pub idle: usize,
}

/// 单个片段类型的实例池。
pub struct FragmentPool {
    type_id: FragmentTypeId,
    idle: Mutex<Vec<Arc<FragmentInstance>>>,
    max_idle: usize,
    created: AtomicUsize,
    reused: AtomicUsize,
}

impl FragmentPool {
    pub fn new(type_id: FragmentTypeId, max_idle: usize) -> Self {
        Self {
            type_id,
            idle: Mutex::new(Vec::new()),
            max_idle,
            created: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
        }
    }

    pub fn type_id(&self) -> &FragmentTypeId {
        &self.type_id
    }

    /// 借出一个实例；没有空闲实例或空闲栈正被占用时调用 `create` 新建。
    pub fn checkout<F>(&self, create: F) -> Result<Arc<FragmentInstance>>
    where
        F: FnOnce() -> Result<FragmentInstance>,
    {
        let recycled = self.idle.try_lock().and_then(|mut idle| idle.pop());
        if let Some(instance) = recycled {
            self.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(instance);
        }
        let instance = Arc::new(create()?);
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(instance)
    }

    /// 归还实例。
    pub fn give_back(&self, instance: Arc<FragmentInstance>) {
        instance.reset();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(instance);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
        }
    }
}

impl fmt::Debug for FragmentPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentPool")
            .field("type_id", &self.type_id)
            .field("max_idle", &self.max_idle)
            .field("stats", &self.stats())
            .finish()
    }
}

/// 实例内共享的片段槽，至多设置一次。
#[derive(Debug)]
pub struct SharedFragment {
    type_id: FragmentTypeId,
    slot: OnceLock<Arc<FragmentInstance>>,
}

impl SharedFragment {
    pub fn new(type_id: FragmentTypeId) -> Self {
        Self {
            type_id,
            slot: OnceLock::new(),
        }
    }

    /// 取出共享实例，首次访问时创建。
    ///
    /// 并发的首次访问可能各自创建一个实例，但只有第一个写入的实例会被保留并返回给所有调用方。
    pub fn get_or_create<F>(&self, create: F) -> Result<Arc<FragmentInstance>>
    where
        F: FnOnce() -> Result<FragmentInstance>,
    {
        if let Some(instance) = self.slot.get() {
            return Ok(Arc::clone(instance));
        }
        let candidate = Arc::new(create()?);
        let _ = self.slot.set(candidate);
        self.slot.get().cloned().ok_or_else(|| {
            CoreError::new(
                codes::FACTORY_CREATION_FAILED,
                format!("shared fragment `{}` was not retained", self.type_id),
            )
        })
    }

    pub fn is_created(&self) -> bool {
        self.slot.get().is_some()
    }
}

enum FragmentSlot {
    Pooled(FragmentPool),
    Shared(SharedFragment),
}

/// 一次借用：池化实例在析构时归还，共享实例只是一次引用计数。
pub struct FragmentLease<'a> {
    instance: Arc<FragmentInstance>,
    pool: Option<&'a FragmentPool>,
}

impl FragmentLease<'_> {
    /// 该借用是否来自池；只有池化实例可以安全写入单次调用状态。
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    pub fn instance(&self) -> &Arc<FragmentInstance> {
        &self.instance
    }
}

impl Deref for FragmentLease<'_> {
    type Target = FragmentInstance;

    fn deref(&self) -> &FragmentInstance {
        self.instance()
    }
}

impl Drop for FragmentLease<'_> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool {
            pool.give_back(Arc::clone(&self.instance));
        }
    }
}

/// 组合实例持有的全部片段槽，按片段类型索引；构造后结构只读。
pub struct FragmentTable {
    slots: HashMap<FragmentTypeId, FragmentSlot>,
}

impl FragmentTable {
    /// 按 `(类型, 是否池化)` 建表。
    pub fn new(types: impl IntoIterator<Item = (FragmentTypeId, bool)>, max_idle: usize) -> Self {
        let slots = types
            .into_iter()
            .map(|(type_id, pooled)| {
                let slot = if pooled {
                    FragmentSlot::Pooled(FragmentPool::new(type_id.clone(), max_idle))
                } else {
                    FragmentSlot::Shared(SharedFragment::new(type_id.clone()))
                };
                (type_id, slot)
            })
            .collect();
        Self { slots }
    }

    /// 借用指定类型的片段实例。
    pub fn acquire<F>(&self, type_id: &FragmentTypeId, create: F) -> Result<FragmentLease<'_>>
    where
        F: FnOnce() -> Result<FragmentInstance>,
    {
        match self.slots.get(type_id) {
            Some(FragmentSlot::Pooled(pool)) => Ok(FragmentLease {
                instance: pool.checkout(create)?,
                pool: Some(pool),
            }),
            Some(FragmentSlot::Shared(shared)) => Ok(FragmentLease {
                instance: shared.get_or_create(create)?,
                pool: None,
            }),
            None => Err(CoreError::new(
                codes::FACTORY_CREATION_FAILED,
                format!("no fragment slot for `{type_id}`"),
            )),
        }
    }

    /// 池化类型的诊断计数；共享类型或未知类型返回 `None`。
    pub fn pool_stats(&self, type_id: &FragmentTypeId) -> Option<PoolStats> {
        match self.slots.get(type_id) {
            Some(FragmentSlot::Pooled(pool)) => Some(pool.stats()),
            _ => None,
        }
    }
}

impl fmt::Debug for FragmentTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentTable")
            .field("slots", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Barrier, thread};

    use super::*;
    use crate::composite::fragment::NextInfo;

    fn blank(id: &str) -> Result<FragmentInstance> {
        Ok(FragmentInstance::new(id.into()))
    }

    #[test]
    fn sequential_use_reuses_a_single_instance() {
        let pool = FragmentPool::new("audit".into(), 4);
        let first = pool.checkout(|| blank("audit")).expect("创建成功");
        let first_ptr = Arc::as_ptr(&first);
        first.set_next_info(Some(NextInfo {
            method_index: 0,
            concern_index: 1,
        }));
        pool.give_back(first);

        let second = pool.checkout(|| blank("audit")).expect("复用成功");
        assert_eq!(Arc::as_ptr(&second), first_ptr);
        assert_eq!(second.next_info(), None, "归还时清空调用状态");
        assert_eq!(
            pool.stats(),
            PoolStats {
                created: 1,
                reused: 1,
                idle: 0
            }
        );
    }

    #[test]
    fn overlapping_checkouts_get_distinct_instances() {
        let pool = FragmentPool::new("audit".into(), 4);
        let a = pool.checkout(|| blank("audit")).expect("创建成功");
        let b = pool.checkout(|| blank("audit")).expect("创建成功");
        assert!(!Arc::ptr_eq(&a, &b));
        pool.give_back(a);
        pool.give_back(b);
        assert_eq!(pool.stats().idle, 2);
    }

    #[test]
    fn surplus_instances_are_dropped() {
        let pool = FragmentPool::new("audit".into(), 1);
        let a = pool.checkout(|| blank("audit")).expect("创建成功");
        let b = pool.checkout(|| blank("audit")).expect("创建成功");
        pool.give_back(a);
        pool.give_back(b);
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn concurrent_holders_never_share() {
        const WORKERS: usize = 8;
        let pool = Arc::new(FragmentPool::new("audit".into(), WORKERS));
        let barrier = Arc::new(Barrier::new(WORKERS));
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let held = pool.checkout(|| blank("audit")).expect("借出成功");
                    let ptr = Arc::as_ptr(&held) as usize;
                    barrier.wait();
                    pool.give_back(held);
                    ptr
                })
            })
            .collect();
        let distinct: HashSet<_> = handles
            .into_iter()
            .map(|h| h.join().expect("线程不应 panic"))
            .collect();
        assert_eq!(distinct.len(), WORKERS);
        assert_eq!(pool.stats().created, WORKERS);
    }

    #[test]
    fn shared_slot_keeps_first_instance() {
        let shared = SharedFragment::new("greeter".into());
        let first = shared.get_or_create(|| blank("greeter")).expect("创建成功");
        let second = shared
            .get_or_create(|| panic!("已创建后不应再次构造"))
            .expect("读取成功");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(shared.is_created());
    }

    #[test]
    fn table_returns_pooled_leases_on_drop() {
        let table = FragmentTable::new([("audit".into(), true), ("greeter".into(), false)], 4);
        let audit: FragmentTypeId = "audit".into();
        {
            let lease = table.acquire(&audit, || blank("audit")).expect("借出成功");
            assert!(lease.is_pooled());
            assert_eq!(table.pool_stats(&audit).map(|s| s.idle), Some(0));
        }
        assert_eq!(table.pool_stats(&audit).map(|s| s.idle), Some(1));

        let greeter: FragmentTypeId = "greeter".into();
        let lease = table.acquire(&greeter, || blank("greeter")).expect("借出成功");
        assert!(!lease.is_pooled());
        assert_eq!(table.pool_stats(&greeter), None);

        let err = table
            .acquire(&"missing".into(), || blank("missing"))
            .err()
            .expect("未知类型");
        assert_eq!(err.code(), codes::FACTORY_CREATION_FAILED);
    }
}
