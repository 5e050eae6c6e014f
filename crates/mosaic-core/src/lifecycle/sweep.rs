//! 钝化扫描的失败累积器。

use std::{
    borrow::Cow,
    panic::{AssertUnwindSafe, catch_unwind},
};

use tracing::error;

use crate::{
    error::{CoreError, Result, codes},
    observability::keys,
};

/// 钝化扫描期间逐步执行子步骤，并收集每一个失败。
///
/// # 契约说明（What）
/// - 子步骤失败（返回 `Err` 或 panic）都不会中断扫描，后续步骤照常执行；
/// - [`finish`](Self::finish) 在存在失败时返回聚合错误，错误列表保持发生顺序；
/// - 每个失败在记录时输出一条 `error` 级日志。
#[derive(Debug)]
pub struct PassivationSweep {
    target: Cow<'static, str>,
    failures: Vec<CoreError>,
}

impl PassivationSweep {
    pub(crate) fn new(target: impl Into<Cow<'static, str>>) -> Self {
        Self {
            target: target.into(),
            failures: Vec::new(),
        }
    }

    /// 执行一个子步骤，失败只记录不传播。
    pub fn run<F>(&mut self, step: &str, f: F)
    where
        F: FnOnce() -> Result<()>,
    {
        let outcome = catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned());
            Err(CoreError::fragment(format!(
                "passivation step `{step}` panicked: {detail}"
            )))
        });
        if let Err(err) = outcome {
            self.record(err);
        }
    }

    /// 直接记录一个失败。
    ///
    /// 子组件自身返回的聚合错误会被展开，使最终报告是一张扁平列表。
    pub fn record(&mut self, err: CoreError) {
        if err.code() == codes::LIFECYCLE_PASSIVATION_FAILED && !err.aggregated().is_empty() {
            for nested in err.aggregated() {
                self.record(nested.clone());
            }
            return;
        }
        error!(
            { keys::LIFECYCLE_TARGET } = %self.target,
            { keys::ERROR_CODE } = err.code(),
            "passivation step failed: {err}"
        );
        self.failures.push(err);
    }

    /// 已累积的失败数量。
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// 结束扫描。
    pub fn finish(self) -> Result<()> {
        if self.failures.is_empty() {
            return Ok(());
        }
        Err(CoreError::aggregate(
            codes::LIFECYCLE_PASSIVATION_FAILED,
            &format!("passivation of `{}` completed with errors", self.target),
            self.failures,
        ))
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    #[test]
    fn every_step_runs_and_every_failure_is_kept() {
        let mut sweep = PassivationSweep::new("application");
        let mut ran = Vec::new();
        sweep.run("first", || {
            ran.push(1);
            Err(CoreError::fragment("first failed"))
        });
        sweep.run("second", || {
            ran.push(2);
            panic!("second exploded");
        });
        sweep.run("third", || {
            ran.push(3);
            Ok(())
        });

        assert_eq!(ran, vec![1, 2, 3]);
        let err = sweep.finish().expect_err("存在失败时必须报错");
        assert_eq!(err.code(), codes::LIFECYCLE_PASSIVATION_FAILED);
        assert_eq!(err.aggregated().len(), 2);
        assert!(err.aggregated()[1].message().contains("second exploded"));
    }

    #[test]
    fn nested_aggregates_are_flattened() {
        let inner = CoreError::aggregate(
            codes::LIFECYCLE_PASSIVATION_FAILED,
            "service",
            vec![CoreError::fragment("a"), CoreError::fragment("b")],
        );
        let mut sweep = PassivationSweep::new("application");
        sweep.record(inner);
        sweep.record(CoreError::fragment("c"));
        assert_eq!(sweep.failure_count(), 3);
    }

    #[test]
    fn clean_sweep_finishes_ok() {
        let mut sweep = PassivationSweep::new("svc");
        sweep.run("noop", || Ok(()));
        assert!(sweep.finish().is_ok());
    }

    #[test]
    #[traced_test]
    fn every_failure_is_logged_with_its_code() {
        let mut sweep = PassivationSweep::new("svc");
        sweep.run("close", || Err(CoreError::fragment("socket already closed")));
        assert!(logs_contain("passivation step failed"));
        assert!(logs_contain("socket already closed"));
        assert!(logs_contain(codes::FRAGMENT_FAILED));
        assert!(logs_contain(&format!("{}=", keys::ERROR_CODE)));
        assert!(logs_contain(&format!("{}=", keys::LIFECYCLE_TARGET)));
    }
}
