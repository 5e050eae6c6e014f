use std::{fmt, sync::Arc};

use super::CompositeModel;
use crate::{error::Result, service::ServiceActionContext};

/// 服务标识。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(Arc<str>);

impl ServiceId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// 服务激活或钝化时执行的动作。
pub type ServiceAction = Arc<dyn Fn(&ServiceActionContext<'_>) -> Result<()> + Send + Sync>;

/// 服务模型：一个组合模型加上服务级生命周期声明。
///
/// - `activate_with_application`：应用激活扫描是否主动激活该服务，否则首次调用时惰性激活；
/// - 激活动作按声明顺序执行，任一失败即中止并回滚；
/// - 钝化动作全部执行，失败逐一累积。
#[derive(Clone)]
pub struct ServiceModel {
    id: ServiceId,
    composite: Arc<CompositeModel>,
    activate_with_application: bool,
    on_activate: Vec<ServiceAction>,
    on_passivate: Vec<ServiceAction>,
}

impl ServiceModel {
    pub fn new(id: impl Into<ServiceId>, composite: Arc<CompositeModel>) -> Self {
        Self {
            id: id.into(),
            composite,
            activate_with_application: false,
            on_activate: Vec::new(),
            on_passivate: Vec::new(),
        }
    }

    pub fn activate_with_application(mut self, eager: bool) -> Self {
        self.activate_with_application = eager;
        self
    }

    pub fn on_activate(
        mut self,
        action: impl Fn(&ServiceActionContext<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_activate.push(Arc::new(action));
        self
    }

    pub fn on_passivate(
        mut self,
        action: impl Fn(&ServiceActionContext<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_passivate.push(Arc::new(action));
        self
    }

    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    pub fn composite(&self) -> &Arc<CompositeModel> {
        &self.composite
    }

    pub fn activates_with_application(&self) -> bool {
        self.activate_with_application
    }

    pub(crate) fn activation_actions(&self) -> &[ServiceAction] {
        &self.on_activate
    }

    pub(crate) fn passivation_actions(&self) -> &[ServiceAction] {
        &self.on_passivate
    }
}

impl fmt::Debug for ServiceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceModel")
            .field("id", &self.id)
            .field("composite", &self.composite.name())
            .field("activate_with_application", &self.activate_with_application)
            .field("on_activate", &self.on_activate.len())
            .field("on_passivate", &self.on_passivate.len())
            .finish()
    }
}
