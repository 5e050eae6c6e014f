//! 内建注入作用域标记。

use super::InjectionScope;

/// 组合自身的一个接口视图（弱引用），创建时注入。
#[derive(Debug)]
pub struct This;

/// 按限定名注入属性或事件参与者，创建时注入。
#[derive(Debug)]
pub struct State;

/// 应用结构句柄：取消令牌、配置与服务注册表，创建时注入。
#[derive(Debug)]
pub struct Structure;

/// 组合创建时调用方提供的命名值，创建时注入。
#[derive(Debug)]
pub struct Uses;

/// 当前方法与调用栈快照，每次调用注入。
#[derive(Debug)]
pub struct Invocation;

/// 按标识注入惰性服务引用，创建时注入。
#[derive(Debug)]
pub struct Service;

impl InjectionScope for This {
    const NAME: &'static str = "this";
}

impl InjectionScope for State {
    const NAME: &'static str = "state";
}

impl InjectionScope for Structure {
    const NAME: &'static str = "structure";
}

impl InjectionScope for Uses {
    const NAME: &'static str = "uses";
}

impl InjectionScope for Invocation {
    const NAME: &'static str = "invocation";
}

impl InjectionScope for Service {
    const NAME: &'static str = "service";
}
