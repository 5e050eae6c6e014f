//! 组合状态：按限定名寻址的属性与事件参与者。
//!
//! # 教案式说明
//! - **意图（Why）**：组合对象的状态由模型声明的访问器对推导而来，片段通过限定名读写它们；
//! - **逻辑（How）**：[`CompositeState`] 在实例构造时一次性建好 `限定名 → 参与者` 映射，此后只读；
//!   每个 [`PropertyInstance`] 自带互斥单元，提供原子 get / set / compare-exchange；
//! - **契约（What）**：属性之间不存在跨属性事务；原型阶段内不做约束检查，也允许写入不可变属性。

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::{
    error::{CoreError, ErrorDetail, Result, codes},
    model::{EventModel, PropertyModel},
};

use super::constraint::{ConstraintViolation, ViolationReport, check_value};

/// 成员限定名：`声明类型:成员名`。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedName {
    declaring: Arc<str>,
    member: Arc<str>,
}

impl QualifiedName {
    /// 直接由声明类型与成员名构造。
    pub fn new(declaring: impl Into<Arc<str>>, member: impl Into<Arc<str>>) -> Self {
        Self {
            declaring: declaring.into(),
            member: member.into(),
        }
    }

    /// 由访问器对推导限定名。
    ///
    /// 访问器需形如 `get_X` / `set_X`（事件为 `add_X` / `remove_X`），两者剥离前缀后必须一致；
    /// 只提供 getter 时 `setter` 传 `None`。不匹配时返回 `None`。
    pub fn from_accessors(
        declaring: impl Into<Arc<str>>,
        getter: &str,
        setter: Option<&str>,
    ) -> Option<Self> {
        const PAIRS: [(&str, &str); 2] = [("get_", "set_"), ("add_", "remove_")];
        let declaring: Arc<str> = declaring.into();
        PAIRS.iter().find_map(|(read, write)| {
            let member = getter.strip_prefix(read)?;
            if member.is_empty() {
                return None;
            }
            if let Some(setter) = setter {
                if setter.strip_prefix(write)? != member {
                    return None;
                }
            }
            Some(Self::new(Arc::clone(&declaring), member))
        })
    }

    /// 声明类型。
    pub fn declaring(&self) -> &str {
        &self.declaring
    }

    /// 成员名。
    pub fn member(&self) -> &str {
        &self.member
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.declaring, self.member)
    }
}

/// 单个属性的运行期参与者。
pub struct PropertyInstance {
    model: Arc<PropertyModel>,
    value: Mutex<Value>,
    sealed: Arc<AtomicBool>,
}

impl PropertyInstance {
    fn new(model: Arc<PropertyModel>, sealed: Arc<AtomicBool>) -> Self {
        let value = Mutex::new(model.default_value().clone());
        Self {
            model,
            value,
            sealed,
        }
    }

    /// 属性模型。
    pub fn model(&self) -> &PropertyModel {
        &self.model
    }

    /// 限定名。
    pub fn name(&self) -> &QualifiedName {
        self.model.name()
    }

    /// 读取当前值的快照。
    pub fn get(&self) -> Value {
        self.value.lock().clone()
    }

    /// 写入新值。
    ///
    /// 原型阶段结束后：不可变属性拒绝写入；违反约束的值被拒绝且原值保持不变。
    pub fn set(&self, value: Value) -> Result<()> {
        // 检查与写入在同一把锁内完成：与封存后的整体校验互斥，不会漏检。
        let mut slot = self.value.lock();
        self.ensure_writable(&value)?;
        *slot = value;
        Ok(())
    }

    /// 仅当当前值等于 `expected` 时写入 `value`，返回是否写入。
    pub fn compare_exchange(&self, expected: &Value, value: Value) -> Result<bool> {
        let mut slot = self.value.lock();
        self.ensure_writable(&value)?;
        if *slot != *expected {
            return Ok(false);
        }
        *slot = value;
        Ok(true)
    }

    fn ensure_writable(&self, value: &Value) -> Result<()> {
        if !self.sealed.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.model.is_immutable() {
            return Err(CoreError::new(
                codes::COMPOSITE_IMMUTABLE_PROPERTY,
                format!("property `{}` is immutable outside the prototype phase", self.name()),
            ));
        }
        let violations = self.violations_for(value);
        if violations.is_empty() {
            return Ok(());
        }
        let mut report = ViolationReport::default();
        report.extend(self.name(), violations);
        Err(report.into_error())
    }

    fn violations_for(&self, value: &Value) -> Vec<ConstraintViolation> {
        check_value(value, self.model.constraints(), self.model.is_optional())
    }

    pub(crate) fn current_violations(&self) -> Vec<ConstraintViolation> {
        let value = self.get();
        self.violations_for(&value)
    }
}

impl fmt::Debug for PropertyInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyInstance")
            .field("name", self.name())
            .field("value", &*self.value.lock())
            .finish()
    }
}

/// 事件处理器。
pub type EventHandler = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// 事件处理器句柄，用于注销。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// 单个事件的运行期参与者。
pub struct EventInstance {
    model: Arc<EventModel>,
    handlers: RwLock<Vec<(HandlerId, EventHandler)>>,
    next_id: AtomicU64,
}

impl EventInstance {
    fn new(model: Arc<EventModel>) -> Self {
        Self {
            model,
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 限定名。
    pub fn name(&self) -> &QualifiedName {
        self.model.name()
    }

    /// 注册处理器，返回注销句柄。
    pub fn add(&self, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    /// 注销处理器，返回是否存在。
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(candidate, _)| *candidate != id);
        handlers.len() != before
    }

    /// 按注册顺序调用全部处理器并收集结果。
    ///
    /// 调用前先复制处理器列表，处理器内部可以安全地注册或注销其他处理器。
    pub fn raise(&self, args: &[Value]) -> Vec<Result<Value>> {
        let snapshot: Vec<EventHandler> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        snapshot.iter().map(|handler| handler(args)).collect()
    }

    /// 当前处理器数量。
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl fmt::Debug for EventInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventInstance")
            .field("name", self.name())
            .field("handlers", &self.handler_count())
            .finish()
    }
}

/// 组合实例的全部状态参与者。
#[derive(Debug)]
pub struct CompositeState {
    properties: HashMap<QualifiedName, Arc<PropertyInstance>>,
    events: HashMap<QualifiedName, Arc<EventInstance>>,
    order: Vec<QualifiedName>,
    sealed: Arc<AtomicBool>,
}

impl CompositeState {
    pub(crate) fn new<'a>(
        properties: impl IntoIterator<Item = &'a Arc<PropertyModel>>,
        events: impl IntoIterator<Item = &'a Arc<EventModel>>,
    ) -> Self {
        let sealed = Arc::new(AtomicBool::new(false));
        let mut order = Vec::new();
        let properties = properties
            .into_iter()
            .map(|model| {
                order.push(model.name().clone());
                let instance = PropertyInstance::new(Arc::clone(model), Arc::clone(&sealed));
                (model.name().clone(), Arc::new(instance))
            })
            .collect();
        let events = events
            .into_iter()
            .map(|model| {
                (
                    model.name().clone(),
                    Arc::new(EventInstance::new(Arc::clone(model))),
                )
            })
            .collect();
        Self {
            properties,
            events,
            order,
            sealed,
        }
    }

    /// 按限定名查找属性。
    pub fn property(&self, name: &QualifiedName) -> Result<&Arc<PropertyInstance>> {
        self.properties.get(name).ok_or_else(|| unknown_member("property", name))
    }

    /// 按限定名查找事件。
    pub fn event(&self, name: &QualifiedName) -> Result<&Arc<EventInstance>> {
        self.events.get(name).ok_or_else(|| unknown_member("event", name))
    }

    /// 按声明顺序遍历属性。
    pub fn properties(&self) -> impl Iterator<Item = &Arc<PropertyInstance>> {
        self.order.iter().filter_map(|name| self.properties.get(name))
    }

    /// 按字符串形式的限定名查找属性或事件，供注入解析使用。
    pub(crate) fn participant(&self, qualified: &str) -> Option<StateParticipant> {
        self.properties
            .iter()
            .find(|(name, _)| name.to_string() == qualified)
            .map(|(_, p)| StateParticipant::Property(Arc::clone(p)))
            .or_else(|| {
                self.events
                    .iter()
                    .find(|(name, _)| name.to_string() == qualified)
                    .map(|(_, e)| StateParticipant::Event(Arc::clone(e)))
            })
    }

    /// 依据声明约束校验全部属性，返回按限定名分组的违例报告。
    pub fn validate(&self) -> ViolationReport {
        let mut report = ViolationReport::default();
        for property in self.properties() {
            report.extend(property.name(), property.current_violations());
        }
        report
    }

    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// 原型阶段是否已结束。
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}

/// 通过 `State` 作用域注入的参与者。
#[derive(Clone, Debug)]
pub enum StateParticipant {
    Property(Arc<PropertyInstance>),
    Event(Arc<EventInstance>),
}

fn unknown_member(kind: &str, name: &QualifiedName) -> CoreError {
    CoreError::new(
        codes::COMPOSITE_UNKNOWN_PROPERTY,
        format!("composite declares no {kind} named `{name}`"),
    )
}

impl ViolationReport {
    /// 转换为携带结构化细节的核心错误。
    pub fn into_error(self) -> CoreError {
        CoreError::new(codes::CONSTRAINT_VIOLATED, format!("constraint violation: {self}"))
            .with_detail(ErrorDetail::Violations(self))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::composite::constraint::Range;

    fn state() -> CompositeState {
        let age = Arc::new(
            PropertyModel::new(QualifiedName::new("Person", "age"), json!(30))
                .constraint(Range::new(0.0, 150.0)),
        );
        let id = Arc::new(PropertyModel::new(QualifiedName::new("Person", "id"), json!(7)).immutable());
        let changed = Arc::new(EventModel::new(QualifiedName::new("Person", "changed")));
        CompositeState::new([&age, &id], [&changed])
    }

    #[test]
    fn qualified_names_derive_from_accessor_pairs() {
        let name = QualifiedName::from_accessors("Person", "get_Name", Some("set_Name"))
            .expect("访问器对匹配");
        assert_eq!(name.to_string(), "Person:Name");
        assert!(QualifiedName::from_accessors("Person", "get_Name", Some("set_Other")).is_none());
        assert!(QualifiedName::from_accessors("Person", "Name", None).is_none());
        let event = QualifiedName::from_accessors("Person", "add_Changed", Some("remove_Changed"))
            .expect("事件访问器对匹配");
        assert_eq!(event.member(), "Changed");

        // 声明类型只转换一次，跨越多组前缀的查找仍然共享它。
        let declaring = String::from("Person");
        let owned = QualifiedName::from_accessors(declaring, "add_Moved", None)
            .expect("第二组前缀匹配");
        assert_eq!(owned.declaring(), "Person");
    }

    #[test]
    fn prototype_phase_accepts_anything_then_seals() {
        let state = state();
        let age = state.property(&QualifiedName::new("Person", "age")).expect("存在");
        age.set(json!(-5)).expect("原型阶段不做检查");
        assert_eq!(state.validate().len(), 1);

        age.set(json!(40)).expect("恢复合法值");
        state.seal();
        let err = age.set(json!(999)).expect_err("封存后拒绝非法值");
        assert_eq!(err.code(), codes::CONSTRAINT_VIOLATED);
        assert_eq!(age.get(), json!(40), "失败写入不改变原值");

        let id = state.property(&QualifiedName::new("Person", "id")).expect("存在");
        let err = id.set(json!(8)).expect_err("不可变属性");
        assert_eq!(err.code(), codes::COMPOSITE_IMMUTABLE_PROPERTY);
    }

    #[test]
    fn compare_exchange_only_writes_on_match() {
        let state = state();
        let age = state.property(&QualifiedName::new("Person", "age")).expect("存在");
        assert!(!age.compare_exchange(&json!(1), json!(2)).expect("合法"));
        assert!(age.compare_exchange(&json!(30), json!(31)).expect("合法"));
        assert_eq!(age.get(), json!(31));
    }

    #[test]
    fn event_handlers_run_in_registration_order() {
        let state = state();
        let event = state.event(&QualifiedName::new("Person", "changed")).expect("存在");
        let first = event.add(Arc::new(|_| Ok(json!("first"))));
        event.add(Arc::new(|args| Ok(json!(args.len()))));
        assert_eq!(
            event
                .raise(&[json!(1), json!(2)])
                .into_iter()
                .collect::<Result<Vec<_>>>()
                .expect("全部成功"),
            vec![json!("first"), json!(2)]
        );
        assert!(event.remove(first));
        assert!(!event.remove(first));
        assert_eq!(event.handler_count(), 1);
    }

    #[test]
    fn participants_resolve_by_string_name() {
        let state = state();
        assert!(matches!(
            state.participant("Person:age"),
            Some(StateParticipant::Property(_))
        ));
        assert!(matches!(
            state.participant("Person:changed"),
            Some(StateParticipant::Event(_))
        ));
        assert!(state.participant("Person:missing").is_none());
    }
}
