//! 进程级上下文服务。
//!
//! 保存等待请求计数器、存活环境集合以及主工作线程的消息发送端。
//! 可以用 [`Context::new`] 显式创建（测试与嵌入方），
//! 也可以使用惰性初始化的 [`Context::global`]。
//! 环境创建时调用 `attach_env`，销毁时调用 `detach_env`。

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, OnceLock,
};

use log::{debug, warn};
use rustc_hash::FxHashSet;
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    env::EnvId,
    error::{NapiError, Result},
    gateway::AsyncSend,
};

static GLOBAL: OnceLock<Arc<Context>> = OnceLock::new();

#[derive(Default)]
pub struct Context {
    waiting: AtomicUsize,
    live_envs: Mutex<FxHashSet<EnvId>>,
    primary: Mutex<Option<UnboundedSender<AsyncSend>>>,
}

impl Context {
    pub fn new() -> Arc<Context> {
        Arc::new(Context::default())
    }

    pub fn global() -> Arc<Context> {
        GLOBAL.get_or_init(Context::new).clone()
    }

    /// 有原生异步工作开始，返回新的计数。
    pub fn increase_waiting_request_counter(&self) -> usize {
        let count = self.waiting.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("waiting request counter -> {}", count);
        count
    }

    /// 原生异步工作结束。计数已经为 0 时报告下溢，计数保持不变。
    pub fn decrease_waiting_request_counter(&self) -> Result<usize> {
        match self
            .waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(previous) => {
                debug!("waiting request counter -> {}", previous - 1);
                Ok(previous - 1)
            }
            Err(_) => {
                warn!("waiting request counter underflow");
                Err(NapiError::CounterUnderflow)
            }
        }
    }

    pub fn waiting_request_count(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// 宿主是否需要为未完成的原生异步工作保持存活。
    pub fn should_keep_alive(&self) -> bool {
        self.waiting_request_count() > 0
    }

    pub fn attach_env(&self, env: EnvId) {
        if let Ok(mut envs) = self.live_envs.lock() {
            envs.insert(env);
        }
    }

    pub fn detach_env(&self, env: EnvId) -> bool {
        self.live_envs
            .lock()
            .map(|mut envs| envs.remove(&env))
            .unwrap_or(false)
    }

    pub fn is_env_alive(&self, env: EnvId) -> bool {
        self.live_envs
            .lock()
            .map(|envs| envs.contains(&env))
            .unwrap_or(false)
    }

    pub fn live_env_count(&self) -> usize {
        self.live_envs.lock().map(|envs| envs.len()).unwrap_or(0)
    }

    /// 注册主工作线程的收件端。次级工作线程通过它转发异步调用。
    pub(crate) fn register_primary(&self, sender: UnboundedSender<AsyncSend>) {
        if let Ok(mut primary) = self.primary.lock() {
            if primary.replace(sender).is_some() {
                warn!("primary worker replaced");
            }
        }
    }

    pub(crate) fn unregister_primary(&self) {
        if let Ok(mut primary) = self.primary.lock() {
            primary.take();
        }
    }

    pub(crate) fn primary_sender(&self) -> Option<UnboundedSender<AsyncSend>> {
        self.primary.lock().ok().and_then(|primary| primary.clone())
    }
}
