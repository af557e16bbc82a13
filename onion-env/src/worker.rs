//! 工作线程。
//!
//! 一个工作线程拥有一个 realm、其上的全部环境、一个异步网关以及
//! 模块函数表。主工作线程在上下文中注册收件端，次级工作线程把
//! `async_send` 转发过去。工作线程之间只通过消息通信。

use std::sync::{Arc, RwLock};

use log::{debug, error, info, trace, warn};
use onion_host::{HostFeatures, Realm, Rooted, SharedStore};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::unbounded_channel;

use crate::{
    config::EnvConfig,
    context::Context,
    env::{ActiveEnv, Env, EnvId},
    error::{NapiError, Result},
    gateway::{
        route, AsyncKind, AsyncSend, Gateway, Job, NativeCallback, NativeTask, RequestId,
        RequestState,
    },
    status::Status,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Primary,
    Secondary,
}

/// 模块函数表：原生侧以下标引用回调。可以在工作线程之间共享。
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: Arc<RwLock<Vec<NativeCallback>>>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册回调，返回它的下标。下标从 1 开始，0 表示空函数指针。
    pub fn register(&self, callback: NativeCallback) -> u32 {
        match self.functions.write() {
            Ok(mut functions) => {
                functions.push(callback);
                functions.len() as u32
            }
            Err(_) => {
                warn!("function table lock poisoned");
                0
            }
        }
    }

    pub fn get(&self, index: u32) -> Option<NativeCallback> {
        let index = (index as usize).checked_sub(1)?;
        self.functions.read().ok()?.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.read().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Worker {
    role: WorkerRole,
    context: Arc<Context>,
    realm: Realm,
    envs: FxHashMap<EnvId, Env>,
    gateway: Gateway,
    table: FunctionTable,
    uncaught: Vec<Rooted>,
}

impl Worker {
    /// 创建主工作线程并在上下文中注册它的收件端。
    pub fn primary(context: Arc<Context>, features: HostFeatures) -> Self {
        let (sender, receiver) = unbounded_channel();
        context.register_primary(sender);
        info!("primary worker started");
        Worker {
            role: WorkerRole::Primary,
            context,
            realm: Realm::new(features),
            envs: FxHashMap::default(),
            gateway: Gateway::with_inbox(receiver),
            table: FunctionTable::new(),
            uncaught: Vec::new(),
        }
    }

    /// 创建次级工作线程。它与主工作线程共用函数表，回调下标才能在两边通用。
    pub fn secondary(context: Arc<Context>, features: HostFeatures, table: FunctionTable) -> Self {
        debug!("secondary worker started");
        Worker {
            role: WorkerRole::Secondary,
            context,
            realm: Realm::new(features),
            envs: FxHashMap::default(),
            gateway: Gateway::new(),
            table,
            uncaught: Vec::new(),
        }
    }

    /// 按配置启动主工作线程：realm 使用配置中的宿主特性，并实例化第一个环境。
    pub fn boot(context: Arc<Context>, config: &EnvConfig) -> Result<(Worker, EnvId)> {
        let mut worker = Worker::primary(context, config.features);
        let env = worker.instantiate(config)?;
        Ok((worker, env))
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn realm(&mut self) -> &mut Realm {
        &mut self.realm
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn table(&self) -> &FunctionTable {
        &self.table
    }

    pub fn env(&self, env: EnvId) -> Option<&Env> {
        self.envs.get(&env)
    }

    /// 实例化一个模块环境。
    pub fn instantiate(&mut self, config: &EnvConfig) -> Result<EnvId> {
        config
            .validate()
            .map_err(|_| NapiError::InvalidArg("invalid environment config"))?;
        let env = Env::new(&mut self.realm, config)?;
        Ok(self.attach(env))
    }

    /// 在共享线性内存上实例化环境。本工作线程中已有使用同一块内存的环境时，
    /// 两者共用外部内存缓存表。
    pub fn instantiate_shared(&mut self, shared: SharedStore) -> Result<EnvId> {
        let memory = onion_host::LinearMemory::import_shared(&mut self.realm, shared.clone())?;
        let external = self
            .envs
            .values()
            .find(|env| env.memory().same_store(&shared))
            .map(|env| env.external_memory().share())
            .unwrap_or_default();
        let env = Env::with_memory(&self.realm, memory, external);
        Ok(self.attach(env))
    }

    fn attach(&mut self, env: Env) -> EnvId {
        let id = env.id();
        self.context.attach_env(id);
        self.envs.insert(id, env);
        id
    }

    /// 导出环境的共享线性内存，供其他环境或其他工作线程使用。
    pub fn export_memory(&self, env: EnvId) -> Result<SharedStore> {
        let env = self.envs.get(&env).ok_or(NapiError::EnvClosed)?;
        Ok(env.memory().export_shared()?)
    }

    /// 销毁环境。之后指向它的待执行回调都变为空操作。
    pub fn teardown(&mut self, env: EnvId) -> Result<()> {
        let mut removed = self.envs.remove(&env).ok_or(NapiError::EnvClosed)?;
        let freed = removed.teardown();
        self.context.detach_env(env);
        info!("env {} torn down ({} retained allocations freed)", env, freed);
        Ok(())
    }

    /// `checkEnv`：环境必须存在。
    pub fn activate(&mut self, env: EnvId) -> Result<ActiveEnv<'_>> {
        let Worker {
            role,
            context,
            realm,
            envs,
            gateway,
            ..
        } = self;
        let env = envs.get_mut(&env).ok_or(NapiError::EnvClosed)?;
        Ok(ActiveEnv::new(env, realm, gateway, &**context, *role))
    }

    /// `preamble`：有待处理异常时直接返回 `PendingException`，否则清空上一次的错误。
    pub fn preamble(&mut self, env: EnvId) -> std::result::Result<ActiveEnv<'_>, Status> {
        let mut active = self.activate(env).map_err(|e| e.status())?;
        if active.is_exception_pending() {
            return Err(active.set_last_error(Status::PendingException, 0, 0));
        }
        active.clear_last_error();
        Ok(active)
    }

    pub fn register_function(&self, callback: NativeCallback) -> u32 {
        self.table.register(callback)
    }

    pub fn function(&self, index: u32) -> Option<NativeCallback> {
        self.table.get(index)
    }

    pub fn set_immediate(
        &mut self,
        env: EnvId,
        callback: NativeCallback,
        data: usize,
    ) -> Result<RequestId> {
        Ok(self.activate(env)?.set_immediate(callback, data))
    }

    pub fn next_tick(
        &mut self,
        env: EnvId,
        callback: NativeCallback,
        data: usize,
    ) -> Result<RequestId> {
        Ok(self.activate(env)?.next_tick(callback, data))
    }

    /// 不需要激活本地环境：次级工作线程上 `target` 指主工作线程上的环境。
    pub fn async_send(
        &mut self,
        target: EnvId,
        kind: AsyncKind,
        callback: NativeCallback,
        data: usize,
    ) -> Result<Option<RequestId>> {
        route(
            self.role,
            &mut self.gateway,
            &self.context,
            AsyncSend {
                kind,
                env: target,
                callback,
                data,
            },
        )
    }

    pub fn request_state(&self, id: RequestId) -> Option<RequestState> {
        self.gateway.state(id)
    }

    /// 执行一个任务。没有可执行的任务时返回 `false`。
    pub fn run_once(&mut self) -> bool {
        let Some(job) = self.gateway.next_job() else {
            return false;
        };
        match job {
            Job::Native(task) => self.dispatch(task),
            Job::Reaction(job) => match self.realm.run_job(job) {
                Ok(jobs) => self.gateway.enqueue_reactions(jobs),
                Err(e) => error!("promise reaction failed: {}", e),
            },
        }
        true
    }

    /// 反复执行直到没有任务，返回执行的数量。
    pub fn run_until_idle(&mut self) -> usize {
        let mut ran = 0;
        while self.run_once() {
            ran += 1;
        }
        if ran > 0 {
            trace!("event loop ran {} jobs", ran);
        }
        ran
    }

    fn dispatch(&mut self, task: NativeTask) {
        let NativeTask {
            id,
            env,
            callback,
            data,
        } = task;
        self.gateway.mark(id, RequestState::Dispatched);
        let outcome = match self.activate(env) {
            Ok(mut active) => {
                trace!("dispatch request {} to env {}", id, env);
                Some(active.call_into_module(false, |active| callback(active, data)))
            }
            Err(_) => {
                debug!("request {} targets torn-down env {}, skipped", id, env);
                None
            }
        };
        if let Some(Err(e)) = outcome {
            self.report(env, e);
        }
        self.gateway.mark(id, RequestState::Completed);
    }

    fn report(&mut self, env: EnvId, error: NapiError) {
        match error {
            NapiError::Thrown(exception) => {
                warn!("uncaught exception in env {}", env);
                self.uncaught.push(exception.into_value());
            }
            other => error!("native callback in env {} failed: {}", env, other),
        }
    }

    /// 取走异步回调中未被捕获的异常。
    pub fn take_uncaught_exceptions(&mut self) -> Vec<Rooted> {
        std::mem::take(&mut self.uncaught)
    }

    pub fn collect_garbage(&mut self) -> usize {
        self.realm.collect_garbage()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let envs: Vec<EnvId> = self.envs.keys().copied().collect();
        for env in envs {
            if let Err(e) = self.teardown(env) {
                warn!("failed to tear down env {}: {}", env, e);
            }
        }
        if self.role == WorkerRole::Primary {
            self.context.unregister_primary();
            debug!("primary worker stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn small() -> EnvConfig {
        EnvConfig {
            initial_pages: 1,
            maximum_pages: 4,
            reserved_bytes: 64,
            ..EnvConfig::default()
        }
    }

    #[test]
    fn activate_rejects_unknown_env() {
        let mut worker = Worker::primary(Context::new(), HostFeatures::default());
        assert!(matches!(
            worker.activate(EnvId::from_raw(0)),
            Err(NapiError::EnvClosed)
        ));
        let env = worker.instantiate(&small()).unwrap();
        assert!(worker.context().is_env_alive(env));
        worker.teardown(env).unwrap();
        assert!(!worker.context().is_env_alive(env));
        assert!(worker.activate(env).is_err());
    }

    #[test]
    fn torn_down_env_turns_callbacks_into_noops() {
        let mut worker = Worker::primary(Context::new(), HostFeatures::default());
        let env = worker.instantiate(&small()).unwrap();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        let id = worker
            .set_immediate(
                env,
                Arc::new(move |_, _| {
                    *counter.lock().unwrap() += 1;
                    Ok(())
                }),
                0,
            )
            .unwrap();
        worker.teardown(env).unwrap();
        assert_eq!(worker.run_until_idle(), 1);
        assert_eq!(*hits.lock().unwrap(), 0);
        assert_eq!(worker.request_state(id), Some(RequestState::Completed));
    }

    #[test]
    fn function_table_indices_start_at_one() {
        let table = FunctionTable::new();
        assert!(table.get(0).is_none());
        let index = table.register(Arc::new(|_, _| Ok(())));
        assert_eq!(index, 1);
        assert!(table.get(1).is_some());
        assert!(table.get(2).is_none());
    }

    #[test]
    fn callback_scopes_are_closed_after_dispatch() {
        let mut worker = Worker::primary(Context::new(), HostFeatures::default());
        let env = worker.instantiate(&small()).unwrap();
        worker
            .next_tick(
                env,
                Arc::new(|active, _| {
                    active.create_object()?;
                    active.open_scope()?;
                    active.create_object()?;
                    Ok(())
                }),
                0,
            )
            .unwrap();
        worker.run_until_idle();
        let env = worker.env(env).unwrap();
        assert_eq!(env.scopes().depth(), 1);
        assert_eq!(env.handles().live_count(), 0);
    }
}
