//! 值约束与违例报告。

use std::{borrow::Cow, collections::BTreeMap, fmt, sync::Arc};

use serde_json::Value;

use super::state::QualifiedName;

/// 作用于单个值的约束。
///
/// 实现者只判断“是否满足”，不负责空值语义：空值由属性或参数的 `optional` 标志决定，
/// 可选成员为空时不再检查任何约束。
pub trait Constraint: Send + Sync + fmt::Debug {
    /// 稳定名称，出现在违例报告中。
    fn name(&self) -> Cow<'static, str>;

    /// 判断 `value` 是否满足约束。
    fn is_satisfied(&self, value: &Value) -> bool;
}

/// 字符串、数组、对象均不得为空。
#[derive(Clone, Copy, Debug, Default)]
pub struct NotEmpty;

impl Constraint for NotEmpty {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("not_empty")
    }

    fn is_satisfied(&self, value: &Value) -> bool {
        match value {
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
            Value::Null => false,
            _ => true,
        }
    }
}

/// 数值落在闭区间内；非数值一律不满足。
#[derive(Clone, Copy, Debug)]
pub struct Range {
    min: f64,
    max: f64,
}

impl Range {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

impl Constraint for Range {
    fn name(&self) -> Cow<'static, str> {
        Cow::Owned(format!("range[{}, {}]", self.min, self.max))
    }

    fn is_satisfied(&self, value: &Value) -> bool {
        value
            .as_f64()
            .is_some_and(|n| n >= self.min && n <= self.max)
    }
}

/// 以闭包表达的自定义约束。
#[derive(Clone)]
pub struct Predicate {
    name: Cow<'static, str>,
    check: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
}

impl Predicate {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        check: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate").field("name", &self.name).finish()
    }
}

impl Constraint for Predicate {
    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn is_satisfied(&self, value: &Value) -> bool {
        (self.check)(value)
    }
}

/// 单条违例。
#[derive(Clone, Debug, PartialEq)]
pub struct ConstraintViolation {
    constraint: Cow<'static, str>,
    value: Value,
}

impl ConstraintViolation {
    pub fn new(constraint: impl Into<Cow<'static, str>>, value: Value) -> Self {
        Self {
            constraint: constraint.into(),
            value,
        }
    }

    /// 被违反的约束名称；空值检查固定为 `not_null`。
    pub fn constraint(&self) -> &str {
        &self.constraint
    }

    /// 违例时观察到的值。
    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// 按成员（属性或参数）分组的违例报告，键序稳定。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ViolationReport {
    entries: BTreeMap<String, Vec<ConstraintViolation>>,
}

impl ViolationReport {
    /// 追加某个成员的违例；空列表被忽略。
    pub fn extend(&mut self, member: &QualifiedName, violations: Vec<ConstraintViolation>) {
        self.extend_named(member.to_string(), violations);
    }

    pub(crate) fn extend_named(&mut self, member: String, violations: Vec<ConstraintViolation>) {
        if violations.is_empty() {
            return;
        }
        self.entries.entry(member).or_default().extend(violations);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 存在违例的成员数量。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 某成员的违例列表。
    pub fn get(&self, member: &str) -> Option<&[ConstraintViolation]> {
        self.entries.get(member).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ConstraintViolation])> {
        self.entries
            .iter()
            .map(|(member, violations)| (member.as_str(), violations.as_slice()))
    }
}

impl fmt::Display for ViolationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (member, violations) in &self.entries {
            for violation in violations {
                if !first {
                    f.write_str(", ")?;
                }
                first = false;
                write!(f, "{member} violates {}", violation.constraint)?;
            }
        }
        Ok(())
    }
}

/// 对单个值执行空值检查与约束检查。
pub(crate) fn check_value(
    value: &Value,
    constraints: &[Arc<dyn Constraint>],
    optional: bool,
) -> Vec<ConstraintViolation> {
    if value.is_null() {
        return if optional {
            Vec::new()
        } else {
            vec![ConstraintViolation::new("not_null", Value::Null)]
        };
    }
    constraints
        .iter()
        .filter(|constraint| !constraint.is_satisfied(value))
        .map(|constraint| ConstraintViolation::new(constraint.name(), value.clone()))
        .collect()
}
