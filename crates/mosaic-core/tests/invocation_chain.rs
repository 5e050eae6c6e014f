//! 调用链顺序、参数约束、原型阶段、片段池与注入作用域的端到端行为。

mod support;

use std::{
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
};

use mosaic_core::{
    composite::{PrototypeState, SelfRef},
    injection::InvocationInfo,
    model::{EventModel, TypeKey},
    prelude::*,
};
use support::{Echo, Journal, fast_config};

/// 记录自身名字后继续调用链的 concern。
struct Step {
    name: &'static str,
    journal: Journal,
}

impl Concern for Step {
    fn invoke(&self, invocation: &mut Invocation<'_>, next: Next) -> Result<Value> {
        self.journal.record(self.name);
        next.proceed(invocation)
    }
}

/// 把参数转成大写，并在结果后追加感叹号。
struct Shout {
    journal: Journal,
}

impl Concern for Shout {
    fn invoke(&self, invocation: &mut Invocation<'_>, next: Next) -> Result<Value> {
        self.journal.record("shout");
        if let Some(Value::String(text)) = invocation.args_mut().first_mut() {
            *text = text.to_uppercase();
        }
        let result = next.proceed(invocation)?;
        Ok(json!(format!("{}!", result.as_str().unwrap_or_default())))
    }
}

struct Speak {
    journal: Journal,
    fail: bool,
}

impl Mixin for Speak {
    fn invoke(&self, invocation: &mut Invocation<'_>) -> Result<Value> {
        self.journal.record("mixin");
        if self.fail {
            return Err(CoreError::fragment("speaker is hoarse"));
        }
        Ok(invocation.args().first().cloned().unwrap_or(Value::Null))
    }
}

/// 记录观察到的结果，并故意失败以验证失败不影响调用方。
struct Audit {
    journal: Journal,
}

impl SideEffect for Audit {
    fn observe(&self, _invocation: &mut Invocation<'_>, outcome: &Result<Value>) -> Result<()> {
        match outcome {
            Ok(value) => self.journal.record(format!("audit:{value}")),
            Err(err) => self.journal.record(format!("audit:err:{}", err.message())),
        }
        Err(CoreError::fragment("audit sink offline"))
    }
}

fn speaker_model(journal: &Journal, fail: bool) -> Arc<CompositeModel> {
    let (a, b, m, s) = (journal.clone(), journal.clone(), journal.clone(), journal.clone());
    CompositeModel::builder("Speaker")
        .public_types("app", ["Speaker"])
        .fragment(FragmentModel::concern("concern_a", move |_| {
            Ok(Step {
                name: "concern_a",
                journal: a.clone(),
            })
        }))
        .fragment(FragmentModel::concern("concern_b", move |_| {
            Ok(Shout { journal: b.clone() })
        }))
        .fragment(FragmentModel::mixin("speak", move |_| {
            Ok(Speak {
                journal: m.clone(),
                fail,
            })
        }))
        .fragment(
            FragmentModel::side_effect("audit", move |_| Ok(Audit { journal: s.clone() }))
                .dispatch(DispatchMode::Virtual),
        )
        .method(
            MethodModel::new("say", "Speaker")
                .parameter(ParameterModel::new("text").constraint(NotEmpty))
                .concern("concern_a")
                .concern("concern_b")
                .mixin("speak")
                .side_effect("audit"),
        )
        .build()
        .expect("模型合法")
}

fn app_with(models: impl IntoIterator<Item = Arc<CompositeModel>>) -> Application {
    models
        .into_iter()
        .fold(
            Application::builder("chain").config(fast_config()),
            |builder, model| builder.composite(model),
        )
        .build()
        .expect("应用构建成功")
}

#[test]
fn chain_runs_in_declared_order_and_side_effects_only_observe() {
    let journal = Journal::default();
    let app = app_with([speaker_model(&journal, false)]);
    let speaker = app
        .new_composite("Speaker", UsesBag::new())
        .expect("组合已登记");

    let result = speaker.invoke("say", vec![json!("hello")]).expect("调用成功");

    assert_eq!(result, json!("HELLO!"));
    assert_eq!(
        journal.entries(),
        vec!["concern_a", "shout", "mixin", "audit:\"HELLO!\""]
    );
}

#[test]
fn side_effects_run_when_the_mixin_fails() {
    let journal = Journal::default();
    let app = app_with([speaker_model(&journal, true)]);
    let speaker = app
        .new_composite("Speaker", UsesBag::new())
        .expect("组合已登记");

    let err = speaker
        .invoke("say", vec![json!("hello")])
        .expect_err("mixin 失败必须传播");

    assert_eq!(err.message(), "speaker is hoarse");
    assert_eq!(
        journal.entries(),
        vec!["concern_a", "shout", "mixin", "audit:err:speaker is hoarse"]
    );
}

#[test]
fn parameter_violations_stop_the_chain_before_it_starts() {
    let journal = Journal::default();
    let app = app_with([speaker_model(&journal, false)]);
    let speaker = app
        .new_composite("Speaker", UsesBag::new())
        .expect("组合已登记");

    let err = speaker
        .invoke("say", vec![json!("")])
        .expect_err("空字符串违反 not_empty");
    assert_eq!(err.code(), codes::CONSTRAINT_VIOLATED);
    let report = err.violations().expect("携带违例报告");
    assert_eq!(report.get("say(text)").map(<[_]>::len), Some(1));

    let missing = speaker.invoke("say", vec![]).expect_err("缺参视为 null");
    assert_eq!(
        missing.violations().and_then(|r| r.get("say(text)")).map(|v| v[0].constraint()),
        Some("not_null")
    );
    assert!(journal.entries().is_empty(), "调用链不得执行");
}

fn greeter_model(observed: Arc<AtomicUsize>) -> Arc<CompositeModel> {
    CompositeModel::builder("Greeter")
        .public_types("app", ["Greeter"])
        .fragment(FragmentModel::mixin("echo", |_| Ok(Echo)).dispatch(DispatchMode::Virtual))
        .method(MethodModel::new("echo", "Greeter").mixin("echo"))
        .property(
            PropertyModel::new(QualifiedName::new("Greeter", "name"), json!("")).constraint(NotEmpty),
        )
        .property(
            PropertyModel::new(QualifiedName::new("Greeter", "id"), json!(0))
                .constraint(Range::new(1.0, 1000.0))
                .immutable(),
        )
        .on_instantiated(move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .expect("模型合法")
}

#[test]
fn invalid_prototype_reports_the_same_violation_to_every_first_user() {
    let observed = Arc::new(AtomicUsize::new(0));
    let app = app_with([greeter_model(Arc::clone(&observed))]);
    let greeter = app
        .new_composite("Greeter", UsesBag::new())
        .expect("组合已登记");

    const USERS: usize = 8;
    let barrier = Barrier::new(USERS);
    let errors: Vec<CoreError> = thread::scope(|scope| {
        let handles: Vec<_> = (0..USERS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    greeter
                        .invoke("echo", vec![json!(1)])
                        .expect_err("默认值违反约束")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("线程不应 panic"))
            .collect()
    });

    let first = &errors[0];
    assert_eq!(first.code(), codes::CONSTRAINT_VIOLATED);
    let report = first.violations().expect("携带违例报告");
    assert_eq!(report.get("Greeter:name").map(|v| v[0].constraint()), Some("not_empty"));
    assert_eq!(report.get("Greeter:id").map(|v| v[0].constraint()), Some("range[1, 1000]"));
    assert!(errors.iter().all(|err| err == first), "所有首次使用者观察到同一份违例");
    assert_eq!(greeter.prototype_state(), PrototypeState::Invalid);
    assert_eq!(observed.load(Ordering::SeqCst), 0, "校验失败不通知观察者");

    // 之后的使用继续返回同一份结果。
    assert_eq!(greeter.instantiate().expect_err("实例永久不可用"), *first);
}

#[test]
fn prototype_is_mutable_until_first_use_then_sealed() {
    let observed = Arc::new(AtomicUsize::new(0));
    let app = app_with([greeter_model(Arc::clone(&observed))]);
    let greeter = app
        .new_composite("Greeter", UsesBag::new())
        .expect("组合已登记");
    let name = QualifiedName::new("Greeter", "name");
    let id = QualifiedName::new("Greeter", "id");

    assert!(greeter.is_prototype());
    // 原型阶段不做任何检查，不可变属性也能写。
    greeter.state().property(&id).expect("属性存在").set(json!(7)).expect("原型可写");
    greeter.state().property(&name).expect("属性存在").set(json!("ada")).expect("原型可写");

    assert_eq!(greeter.invoke("echo", vec![json!("hi")]), Ok(json!("hi")));
    assert_eq!(greeter.prototype_state(), PrototypeState::Instance);
    assert_eq!(observed.load(Ordering::SeqCst), 1);

    let err = greeter
        .state()
        .property(&id)
        .expect("属性存在")
        .set(json!(8))
        .expect_err("不可变属性已封存");
    assert_eq!(err.code(), codes::COMPOSITE_IMMUTABLE_PROPERTY);

    let name_property = greeter.state().property(&name).expect("属性存在");
    let err = name_property.set(json!("")).expect_err("违反约束");
    assert_eq!(err.code(), codes::CONSTRAINT_VIOLATED);
    assert_eq!(name_property.get(), json!("ada"), "被拒绝的写入不改变原值");
    assert_eq!(name_property.compare_exchange(&json!("ada"), json!("grace")), Ok(true));
    assert_eq!(name_property.compare_exchange(&json!("ada"), json!("linus")), Ok(false));
    assert_eq!(name_property.get(), json!("grace"));
}

#[test]
fn writes_racing_the_first_use_never_leave_an_invalid_instance() {
    fn labelled() -> Arc<CompositeModel> {
        CompositeModel::builder("Label")
            .public_types("app", ["Label"])
            .fragment(FragmentModel::mixin("echo", |_| Ok(Echo)).dispatch(DispatchMode::Virtual))
            .method(MethodModel::new("echo", "Label").mixin("echo"))
            .property(
                PropertyModel::new(QualifiedName::new("Label", "text"), json!("ok"))
                    .constraint(NotEmpty),
            )
            .build()
            .expect("模型合法")
    }

    let app = app_with([labelled()]);
    let text = QualifiedName::new("Label", "text");
    for _ in 0..32 {
        let label = app.new_composite("Label", UsesBag::new()).expect("组合已登记");
        let property = Arc::clone(label.state().property(&text).expect("属性存在"));
        let barrier = Barrier::new(2);
        thread::scope(|scope| {
            scope.spawn(|| {
                barrier.wait();
                for _ in 0..64 {
                    // 封存后非法值被拒绝，合法值照常写入。
                    let _ = property.set(json!(""));
                    let _ = property.set(json!("ok"));
                }
            });
            barrier.wait();
            let _ = label.instantiate();
        });

        if label.prototype_state() == PrototypeState::Instance {
            assert!(
                label.state().validate().is_empty(),
                "离开原型阶段的实例必须满足全部约束"
            );
            assert_eq!(property.get(), json!("ok"));
        }
    }
}

#[test]
fn prepare_actions_may_call_back_into_the_instance() {
    let journal = Journal::default();
    let recorder = journal.clone();
    let model = CompositeModel::builder("Boot")
        .public_types("app", ["Boot"])
        .fragment(FragmentModel::mixin("echo", |_| Ok(Echo)).dispatch(DispatchMode::Virtual))
        .method(MethodModel::new("echo", "Boot").mixin("echo"))
        .property(PropertyModel::new(QualifiedName::new("Boot", "mode"), Value::Null))
        .prepare(move |context| {
            context
                .state()
                .property(&QualifiedName::new("Boot", "mode"))?
                .set(json!("ready"))?;
            let echoed = context.invoke("echo", vec![json!("warm-up")])?;
            recorder.record(format!("prepared:{echoed}"));
            Ok(())
        })
        .build()
        .expect("模型合法");
    let app = app_with([model]);
    let boot = app.new_composite("Boot", UsesBag::new()).expect("组合已登记");

    boot.instantiate().expect("准备动作内的自调用不会等待自己");
    assert_eq!(journal.entries(), vec!["prepared:\"warm-up\""]);
    assert_eq!(
        boot.state()
            .property(&QualifiedName::new("Boot", "mode"))
            .expect("属性存在")
            .get(),
        json!("ready")
    );
}

/// 进入时独占标记，离开时释放；同一实例被两个调用同时使用会立即失败。
struct Exclusive {
    busy: AtomicBool,
    rendezvous: Option<Arc<Barrier>>,
}

impl Concern for Exclusive {
    fn invoke(&self, invocation: &mut Invocation<'_>, next: Next) -> Result<Value> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(CoreError::fragment("pooled instance shared by two calls"));
        }
        if let Some(rendezvous) = &self.rendezvous {
            rendezvous.wait();
        }
        let result = next.proceed(invocation);
        self.busy.store(false, Ordering::SeqCst);
        result
    }
}

fn pooled_model(created: Arc<AtomicUsize>, rendezvous: Option<Arc<Barrier>>) -> Arc<CompositeModel> {
    CompositeModel::builder("Pooled")
        .public_types("app", ["Pooled"])
        .fragment(FragmentModel::concern("exclusive", move |_| {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(Exclusive {
                busy: AtomicBool::new(false),
                rendezvous: rendezvous.clone(),
            })
        }))
        .fragment(FragmentModel::mixin("echo", |_| Ok(Echo)).dispatch(DispatchMode::Virtual))
        .method(MethodModel::new("echo", "Pooled").concern("exclusive").mixin("echo"))
        .build()
        .expect("模型合法")
}

#[test]
fn sequential_calls_reuse_a_single_pooled_instance() {
    let created = Arc::new(AtomicUsize::new(0));
    let app = app_with([pooled_model(Arc::clone(&created), None)]);
    let pooled = app.new_composite("Pooled", UsesBag::new()).expect("组合已登记");

    for round in 0..10 {
        assert_eq!(pooled.invoke("echo", vec![json!(round)]), Ok(json!(round)));
    }

    assert_eq!(created.load(Ordering::SeqCst), 1);
    let stats = pooled.pool_stats(&"exclusive".into()).expect("concern 被池化");
    assert_eq!((stats.created, stats.reused, stats.idle), (1, 9, 1));
    assert!(pooled.pool_stats(&"echo".into()).is_none(), "虚分派片段不池化");
}

#[test]
fn concurrent_calls_never_share_a_pooled_instance() {
    const CALLERS: usize = 6;
    let created = Arc::new(AtomicUsize::new(0));
    let rendezvous = Arc::new(Barrier::new(CALLERS));
    let app = app_with([pooled_model(Arc::clone(&created), Some(rendezvous))]);
    let pooled = app.new_composite("Pooled", UsesBag::new()).expect("组合已登记");

    thread::scope(|scope| {
        let handles: Vec<_> = (0..CALLERS)
            .map(|caller| {
                let pooled = &pooled;
                scope.spawn(move || pooled.invoke("echo", vec![json!(caller)]))
            })
            .collect();
        for (caller, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().expect("线程不应 panic"), Ok(json!(caller)));
        }
    });

    // 所有调用方同时停在片段内部，只有各自持有不同实例才能全部到达汇合点。
    assert_eq!(created.load(Ordering::SeqCst), CALLERS);
    let stats = pooled.pool_stats(&"exclusive".into()).expect("concern 被池化");
    assert_eq!(stats.created, CALLERS);
    assert_eq!(stats.idle, CALLERS);
}

/// 通过创建期注入取得自身视图、状态参与者与创建参数。
struct Describe {
    me: Arc<SelfRef>,
    greeting: Arc<StateParticipant>,
    prefix: Arc<String>,
}

impl Mixin for Describe {
    fn invoke(&self, _invocation: &mut Invocation<'_>) -> Result<Value> {
        let StateParticipant::Property(greeting) = &*self.greeting else {
            return Err(CoreError::fragment("greeting is not a property"));
        };
        let view = self
            .me
            .upgrade()
            .ok_or_else(|| CoreError::fragment("composite dropped"))?;
        Ok(json!(format!(
            "{}{} from {}",
            self.prefix,
            greeting.get().as_str().unwrap_or_default(),
            view.type_key()
        )))
    }
}

/// 返回逐调用注入的调用栈快照。
struct Trace;

impl Mixin for Trace {
    fn invoke(&self, invocation: &mut Invocation<'_>) -> Result<Value> {
        let info = invocation
            .injected::<InvocationInfo>("call")
            .ok_or_else(|| CoreError::fragment("invocation info missing"))?;
        let frames: Vec<String> = info
            .stack
            .iter()
            .map(|frame| match &frame.fragment {
                Some(fragment) => format!("{}/{fragment}", frame.method),
                None => frame.method.to_string(),
            })
            .collect();
        Ok(json!(frames))
    }
}

/// 嵌套调用同一组合的另一个方法。
struct Relay;

impl Mixin for Relay {
    fn invoke(&self, invocation: &mut Invocation<'_>) -> Result<Value> {
        invocation.invoke_self("trace", vec![])
    }
}

fn introspective_model() -> Arc<CompositeModel> {
    CompositeModel::builder("Host")
        .public_types("app", ["Host"])
        .private_types("app", ["HostInternals"])
        .property(PropertyModel::new(QualifiedName::new("Host", "greeting"), json!("hi")))
        .fragment(
            FragmentModel::mixin("describe", |creation| {
                let injections = creation.injections();
                Ok(Describe {
                    me: injections.require("me")?,
                    greeting: injections.require("greeting")?,
                    prefix: injections.require("prefix")?,
                })
            })
            .inject(InjectionPoint::new::<scope::This>("me"))
            .inject(InjectionPoint::new::<scope::State>("greeting").with_target("Host:greeting"))
            .inject(InjectionPoint::new::<scope::Uses>("prefix")),
        )
        .fragment(
            FragmentModel::mixin("trace", |_| Ok(Trace))
                .inject(InjectionPoint::new::<scope::Invocation>("call")),
        )
        .fragment(FragmentModel::mixin("relay", |_| Ok(Relay)))
        .method(MethodModel::new("describe", "Host").mixin("describe"))
        .method(MethodModel::new("trace", "HostInternals").mixin("trace"))
        .method(MethodModel::new("relay", "Host").mixin("relay"))
        .build()
        .expect("模型合法")
}

#[test]
fn creation_injections_supply_self_state_and_uses() {
    let app = app_with([introspective_model()]);
    let host = app
        .new_composite("Host", UsesBag::new().with("prefix", String::from(">> ")))
        .expect("组合已登记");

    assert_eq!(host.invoke("describe", vec![]), Ok(json!(">> hi from Host")));
}

#[test]
fn missing_uses_value_fails_fragment_creation() {
    let app = app_with([introspective_model()]);
    let host = app.new_composite("Host", UsesBag::new()).expect("组合已登记");

    let err = host.invoke("describe", vec![]).expect_err("prefix 缺失");
    assert_eq!(err.code(), codes::INJECTION_UNRESOLVED);
}

#[test]
fn invocation_scope_sees_the_explicit_call_stack() {
    let app = app_with([introspective_model()]);
    let host = app.new_composite("Host", UsesBag::new()).expect("组合已登记");

    assert_eq!(
        host.invoke("relay", vec![]),
        Ok(json!(["relay", "relay/relay", "trace", "trace/trace"]))
    );
    assert_eq!(host.invoke("trace", vec![]), Ok(json!(["trace", "trace/trace"])));
}

#[test]
fn views_resolve_to_the_same_instance_and_guard_their_methods() {
    let app = app_with([introspective_model()]);
    let host = app
        .new_composite("Host", UsesBag::new().with("prefix", String::new()))
        .expect("组合已登记");

    let public = host.view(&TypeKey::from("Host")).expect("公开视图");
    let private = host.private_view(&TypeKey::from("HostInternals")).expect("私有视图");
    assert!(public.same_instance(&private));
    assert_eq!(public.module(), "app");

    assert!(public.invoke("describe", vec![]).is_ok());
    assert_eq!(
        public.invoke("trace", vec![]).expect_err("trace 不属于 Host 视图").code(),
        codes::COMPOSITE_UNKNOWN_METHOD
    );
    assert!(private.invoke("trace", vec![]).is_ok());

    assert_eq!(
        host.view(&TypeKey::from("HostInternals")).expect_err("私有类型不公开").code(),
        codes::COMPOSITE_UNKNOWN_VIEW
    );
    assert_eq!(
        host.invoke("missing", vec![]).expect_err("方法不存在").code(),
        codes::COMPOSITE_UNKNOWN_METHOD
    );
}

#[test]
fn events_dispatch_to_handlers_in_registration_order() {
    let model = CompositeModel::builder("Bell")
        .public_types("app", ["Bell"])
        .fragment(FragmentModel::mixin("echo", |_| Ok(Echo)))
        .method(MethodModel::new("echo", "Bell").mixin("echo"))
        .event(EventModel::new(QualifiedName::new("Bell", "rung")))
        .build()
        .expect("模型合法");
    let app = app_with([model]);
    let bell = app.new_composite("Bell", UsesBag::new()).expect("组合已登记");
    let rung = bell
        .state()
        .event(&QualifiedName::new("Bell", "rung"))
        .expect("事件存在");

    let first = rung.add(Arc::new(|args: &[Value]| -> Result<Value> {
        Ok(json!(["first", args.len()]))
    }));
    rung.add(Arc::new(|_: &[Value]| -> Result<Value> {
        Err(CoreError::fragment("second handler failed"))
    }));

    let results = rung.raise(&[json!(1), json!(2)]);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0], Ok(json!(["first", 2])));
    assert!(results[1].is_err());

    assert!(rung.remove(first));
    assert!(!rung.remove(first));
    assert_eq!(rung.handler_count(), 1);
}

#[test]
fn unknown_composite_is_reported() {
    let app = app_with([]);
    assert_eq!(
        app.new_composite("Ghost", UsesBag::new())
            .expect_err("未登记")
            .code(),
        codes::APPLICATION_UNKNOWN_COMPOSITE
    );
}
