//! 应用：全局生命周期、服务注册表与组合创建入口。
//!
//! # 教案式说明
//! - **意图（Why）**：应用是所有组合与服务的宿主；它的激活打开服务激活闸门并按需主动激活服务，
//!   它的钝化关闭闸门、发出取消信号，再以逆物化顺序钝化所有已物化服务；
//! - **逻辑（How）**：
//!   1. [`ApplicationStructure`] 是片段可注入的共享句柄：配置、注入解析器、取消源、服务容器弱引用；
//!   2. [`Application`] 持有 [`LifecycleController`]，激活 / 钝化动作都在其 CAS 赢家内执行；
//!   3. 激活扫描中任一服务失败，已在本轮激活的服务逆序钝化，闸门重新关闭，状态回滚为 PASSIVE；
//!   4. 钝化扫描借助 [`PassivationSweep`](crate::lifecycle::PassivationSweep) 累积每一个失败；
//! - **契约（What）**：
//!   - 钝化开始后不再有新的惰性激活启动；在途激活先结算再被扫描钝化；
//!   - 再次激活时若取消源已被取消，替换为新令牌。

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, OnceLock, Weak},
};

use tracing::{info, warn};

use crate::{
    composite::{CompositeBlueprint, CompositeInstance},
    config::RuntimeConfig,
    error::{CoreError, Result, codes},
    factory::{StaticTypeFactory, TypeFactory},
    injection::{InjectionProvider, InjectionResolver, InjectionScope, UsesBag},
    lifecycle::{
        ActivationOutcome, Cancellation, CancellationSource, LifecycleController, LifecycleState,
        PassivationOutcome, TransitionOwner,
    },
    model::{CompositeModel, ServiceId, ServiceModel},
    observability::keys,
    service::{ServiceCompositeInstance, ServiceContainer, ServiceReference},
};

/// 应用级钩子。
pub type ApplicationHook = Arc<dyn Fn(&ApplicationStructure) -> Result<()> + Send + Sync>;

/// 应用结构：组合与片段可见的共享句柄。
pub struct ApplicationStructure {
    name: Arc<str>,
    config: RuntimeConfig,
    resolver: InjectionResolver,
    cancellation: CancellationSource,
    services: OnceLock<Weak<ServiceContainer>>,
}

impl ApplicationStructure {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn resolver(&self) -> &InjectionResolver {
        &self.resolver
    }

    /// 当前激活周期的取消令牌。
    pub fn cancellation_token(&self) -> Cancellation {
        self.cancellation.token()
    }

    /// 服务容器；应用已释放时返回 `None`。
    pub fn services(&self) -> Option<Arc<ServiceContainer>> {
        self.services.get().and_then(Weak::upgrade)
    }

    /// 已登记服务的惰性引用，不触发物化。
    pub fn service_reference(&self, id: &ServiceId) -> Option<ServiceReference> {
        let container = self.services.get()?;
        container
            .upgrade()
            .filter(|services| services.contains(id))
            .map(|_| ServiceReference::new(id.clone(), Weak::clone(container)))
    }
}

impl fmt::Debug for ApplicationStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationStructure")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

/// 应用构建器。
pub struct ApplicationBuilder {
    name: Arc<str>,
    config: RuntimeConfig,
    resolver: InjectionResolver,
    factory: Arc<dyn TypeFactory>,
    composites: Vec<Arc<CompositeModel>>,
    services: Vec<ServiceModel>,
    on_activate: Vec<ApplicationHook>,
    on_passivate: Vec<ApplicationHook>,
}

impl ApplicationBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// 替换默认的 [`StaticTypeFactory`]。
    pub fn type_factory(mut self, factory: impl TypeFactory + 'static) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    /// 登记或替换作用域 `S` 的注入提供者。
    pub fn with_provider<S: InjectionScope>(
        mut self,
        provider: impl InjectionProvider + 'static,
    ) -> Self {
        self.resolver.register::<S>(provider);
        self
    }

    /// 登记可由 [`Application::new_composite`] 创建的组合模型。
    pub fn composite(mut self, model: Arc<CompositeModel>) -> Self {
        self.composites.push(model);
        self
    }

    pub fn service(mut self, model: ServiceModel) -> Self {
        self.services.push(model);
        self
    }

    pub fn on_activate(
        mut self,
        hook: impl Fn(&ApplicationStructure) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_activate.push(Arc::new(hook));
        self
    }

    pub fn on_passivate(
        mut self,
        hook: impl Fn(&ApplicationStructure) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_passivate.push(Arc::new(hook));
        self
    }

    /// 校验配置、装载全部模型并组装应用（处于 PASSIVE）。
    pub fn build(self) -> Result<Application> {
        self.config.validate()?;
        let wait_slice = self.config.wait_slice();
        let structure = Arc::new(ApplicationStructure {
            name: Arc::clone(&self.name),
            config: self.config,
            resolver: self.resolver,
            cancellation: CancellationSource::new(),
            services: OnceLock::new(),
        });

        let mut composites = HashMap::with_capacity(self.composites.len());
        for model in self.composites {
            let name = model.shared_name();
            let blueprint =
                CompositeBlueprint::load(model, self.factory.as_ref(), structure.resolver())?;
            if composites.insert(Arc::clone(&name), blueprint).is_some() {
                return Err(CoreError::new(
                    codes::MODEL_INVALID,
                    format!("composite `{name}` is registered twice"),
                ));
            }
        }

        let mut seen = HashSet::with_capacity(self.services.len());
        let mut services = Vec::with_capacity(self.services.len());
        for model in self.services {
            if !seen.insert(model.id().clone()) {
                return Err(CoreError::new(
                    codes::MODEL_INVALID,
                    format!("service `{}` is registered twice", model.id()),
                ));
            }
            let blueprint = CompositeBlueprint::load(
                Arc::clone(model.composite()),
                self.factory.as_ref(),
                structure.resolver(),
            )?;
            services.push((Arc::new(model), blueprint));
        }

        let container = Arc::new(ServiceContainer::new(Arc::clone(&structure), services));
        let _ = structure.services.set(Arc::downgrade(&container));

        Ok(Application {
            lifecycle: LifecycleController::new(format!("application `{}`", self.name), wait_slice),
            structure,
            services: container,
            composites,
            on_activate: self.on_activate,
            on_passivate: self.on_passivate,
        })
    }
}

impl fmt::Debug for ApplicationBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationBuilder")
            .field("name", &self.name)
            .field("composites", &self.composites.len())
            .field("services", &self.services.len())
            .finish()
    }
}

/// 应用实例。
pub struct Application {
    structure: Arc<ApplicationStructure>,
    lifecycle: LifecycleController,
    services: Arc<ServiceContainer>,
    composites: HashMap<Arc<str>, Arc<CompositeBlueprint>>,
    on_activate: Vec<ApplicationHook>,
    on_passivate: Vec<ApplicationHook>,
}

impl Application {
    pub fn builder(name: impl Into<Arc<str>>) -> ApplicationBuilder {
        ApplicationBuilder {
            name: name.into(),
            config: RuntimeConfig::default(),
            resolver: InjectionResolver::with_builtin(),
            factory: Arc::new(StaticTypeFactory::new()),
            composites: Vec::new(),
            services: Vec::new(),
            on_activate: Vec::new(),
            on_passivate: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.structure.name()
    }

    pub fn structure(&self) -> &Arc<ApplicationStructure> {
        &self.structure
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    /// 当前激活周期的取消令牌。
    pub fn cancellation(&self) -> Cancellation {
        self.structure.cancellation_token()
    }

    pub fn services(&self) -> &Arc<ServiceContainer> {
        &self.services
    }

    /// 取得服务实例（不激活）。
    pub fn service(&self, id: impl Into<ServiceId>) -> Result<Arc<ServiceCompositeInstance>> {
        self.services.get_service(&id.into())
    }

    /// 创建处于原型阶段的组合实例。
    pub fn new_composite(&self, model: &str, uses: UsesBag) -> Result<Arc<CompositeInstance>> {
        let blueprint = self.composites.get(model).ok_or_else(|| {
            CoreError::new(
                codes::APPLICATION_UNKNOWN_COMPOSITE,
                format!("application `{}` has no composite `{model}`", self.name()),
            )
        })?;
        Ok(CompositeInstance::new(
            Arc::clone(blueprint),
            Arc::clone(&self.structure),
            uses,
        ))
    }

    /// 激活应用。
    ///
    /// 动作依次：必要时更新取消源 → 打开服务激活闸门 → 应用钩子 → 主动激活服务。
    /// 任一步失败都会撤销本轮已完成的部分，应用回到 PASSIVE，可重试。
    pub fn activate(&self) -> Result<ActivationOutcome> {
        self.lifecycle
            .activate(TransitionOwner::fresh(), |owner| self.run_activation(owner))
    }

    /// 钝化应用；所有失败被累积，状态无论如何结算为 PASSIVE。
    pub fn passivate(&self) -> Result<PassivationOutcome> {
        self.lifecycle
            .passivate(TransitionOwner::fresh(), |owner, sweep| {
                self.services.allow_activation(false);
                self.structure.cancellation.cancel();
                for service in self.services.existing_services().into_iter().rev() {
                    sweep.run(&format!("service `{}`", service.id()), || {
                        service.passivate_as(owner).map(drop)
                    });
                }
                for hook in &self.on_passivate {
                    sweep.run("application passivation hook", || hook(&self.structure));
                }
                info!(
                    { keys::LIFECYCLE_TARGET } = self.lifecycle.target(),
                    failures = sweep.failure_count(),
                    "application passivation sweep finished"
                );
            })
    }

    fn run_activation(&self, owner: TransitionOwner) -> Result<()> {
        if self.structure.cancellation.renew_if_cancelled() {
            info!(
                { keys::LIFECYCLE_TARGET } = self.lifecycle.target(),
                "cancellation source renewed for the new activation cycle"
            );
        }
        self.services.allow_activation(true);
        let outcome = self.run_hooks_and_eager_services();
        if outcome.is_err() {
            self.roll_back_services(owner);
        }
        outcome
    }

    fn run_hooks_and_eager_services(&self) -> Result<()> {
        for hook in &self.on_activate {
            hook(&self.structure)?;
        }
        if !self.structure.config.services.activate_with_application {
            return Ok(());
        }
        for id in self.services.eager_service_ids() {
            self.services.get_service(id)?.activate()?;
        }
        Ok(())
    }

    /// 撤销失败的激活：先关闭闸门，再逆物化顺序钝化本轮被激活的全部服务。
    ///
    /// 覆盖范围不限于急切服务：钩子或并发调用方在闸门打开期间惰性激活的服务同样被钝化。
    fn roll_back_services(&self, owner: TransitionOwner) {
        self.services.allow_activation(false);
        for service in self.services.existing_services().into_iter().rev() {
            if service.state() == LifecycleState::Passive {
                continue;
            }
            if let Err(rollback) = service.passivate_as(owner) {
                warn!(
                    { keys::SERVICE_ID } = %service.id(),
                    { keys::ERROR_CODE } = rollback.code(),
                    "rollback passivation failed: {rollback}"
                );
            }
        }
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.structure.name)
            .field("state", &self.state())
            .field("services", &self.services)
            .finish()
    }
}
