//! 集成测试共用的夹具：回显 mixin、顺序记录器与快速等待配置。

#![allow(dead_code)]

use std::sync::Arc;

use mosaic_core::prelude::*;
use parking_lot::Mutex;

/// 原样返回第一个参数的 mixin。
pub struct Echo;

impl Mixin for Echo {
    fn invoke(&self, invocation: &mut Invocation<'_>) -> Result<Value> {
        Ok(invocation.args().first().cloned().unwrap_or(Value::Null))
    }
}

/// 仅含 `echo` 方法的最小组合模型。
pub fn echo_model(name: &str) -> Arc<CompositeModel> {
    CompositeModel::builder(name)
        .public_types("app", [name])
        .fragment(FragmentModel::mixin("echo", |_| Ok(Echo)).dispatch(DispatchMode::Virtual))
        .method(MethodModel::new("echo", name).mixin("echo"))
        .build()
        .expect("回显模型合法")
}

/// 等待粒度压到 2ms，让阻塞路径在测试中快速收敛。
pub fn fast_config() -> RuntimeConfig {
    RuntimeConfig::from_toml_str("[lifecycle]\nwait_slice_ms = 2\n").expect("配置合法")
}

/// 线程安全的事件顺序记录器。
#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries.lock().iter().filter(|e| *e == entry).count()
    }
}
