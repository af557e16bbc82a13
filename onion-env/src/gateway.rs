//! 异步调用网关。
//!
//! 每个工作线程一个网关，维护两个本地队列：
//!
//! - 微任务队列：next-tick 原生回调与 promise 反应任务，按 FIFO 执行
//! - immediate 队列：每次只取一个，取之前总是先清空微任务队列
//!
//! 主工作线程另有一个收件箱，接收次级工作线程转发来的调用。
//! 每次取任务前先收下收件箱里已到达的全部消息，按各自的类别
//! 重新调度进本地队列，因此转发调用与本地调用遵守同一套顺序。
//!
//! 每个原生请求的状态依次为 `Scheduled -> Dispatched -> Completed`。

use std::{collections::VecDeque, fmt::Display, sync::Arc};

use log::{trace, warn};
use onion_host::PendingJob;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver, UnboundedSender};

use crate::{
    context::Context,
    env::{ActiveEnv, EnvId},
    error::{NapiError, Result},
    worker::WorkerRole,
};

/// 原生回调：模块函数表中的一个 `void (*)(napi_env, void*)` 形式的函数。
pub type NativeCallback = Arc<dyn Fn(&mut ActiveEnv<'_>, usize) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AsyncKind {
    Immediate = 0,
    NextTick = 1,
}

impl AsyncKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(AsyncKind::Immediate),
            1 => Some(AsyncKind::NextTick),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Scheduled,
    Dispatched,
    Completed,
}

/// 跨工作线程转发的异步调用。
pub struct AsyncSend {
    pub kind: AsyncKind,
    pub env: EnvId,
    pub callback: NativeCallback,
    pub data: usize,
}

impl std::fmt::Debug for AsyncSend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSend")
            .field("kind", &self.kind)
            .field("env", &self.env)
            .field("data", &self.data)
            .finish()
    }
}

pub struct NativeTask {
    pub id: RequestId,
    pub env: EnvId,
    pub callback: NativeCallback,
    pub data: usize,
}

pub enum Job {
    Native(NativeTask),
    Reaction(PendingJob),
}

#[derive(Default)]
pub struct Gateway {
    microtasks: VecDeque<Job>,
    immediates: VecDeque<NativeTask>,
    inbox: Option<UnboundedReceiver<AsyncSend>>,
    states: FxHashMap<RequestId, RequestState>,
    next_request: u64,
}

impl Gateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_inbox(inbox: UnboundedReceiver<AsyncSend>) -> Self {
        Gateway {
            inbox: Some(inbox),
            ..Self::default()
        }
    }

    fn request(&mut self, env: EnvId, callback: NativeCallback, data: usize) -> NativeTask {
        self.next_request += 1;
        let id = RequestId(self.next_request);
        self.states.insert(id, RequestState::Scheduled);
        NativeTask {
            id,
            env,
            callback,
            data,
        }
    }

    /// 按顺序类别调度原生回调。
    pub fn schedule(
        &mut self,
        kind: AsyncKind,
        env: EnvId,
        callback: NativeCallback,
        data: usize,
    ) -> RequestId {
        let task = self.request(env, callback, data);
        let id = task.id;
        trace!("schedule {:?} request {} for env {}", kind, id, env);
        match kind {
            AsyncKind::Immediate => self.immediates.push_back(task),
            AsyncKind::NextTick => self.microtasks.push_back(Job::Native(task)),
        }
        id
    }

    pub fn enqueue_reactions(&mut self, jobs: Vec<PendingJob>) {
        self.microtasks.extend(jobs.into_iter().map(Job::Reaction));
    }

    /// 取下一个要执行的任务：先收下转发消息，再按微任务优先、其次 immediate 的顺序出队。
    pub fn next_job(&mut self) -> Option<Job> {
        self.drain_inbox();
        if let Some(job) = self.microtasks.pop_front() {
            return Some(job);
        }
        self.immediates.pop_front().map(Job::Native)
    }

    fn drain_inbox(&mut self) {
        while let Some(message) = self.receive() {
            let id = self.schedule(message.kind, message.env, message.callback, message.data);
            trace!("accepted forwarded request {}", id);
        }
    }

    fn receive(&mut self) -> Option<AsyncSend> {
        let inbox = self.inbox.as_mut()?;
        match inbox.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.inbox = None;
                None
            }
        }
    }

    pub(crate) fn mark(&mut self, id: RequestId, state: RequestState) {
        if state == RequestState::Completed {
            self.states.remove(&id);
        } else {
            self.states.insert(id, state);
        }
    }

    /// 请求的当前状态。已完成的请求不再单独保存。
    pub fn state(&self, id: RequestId) -> Option<RequestState> {
        match self.states.get(&id) {
            Some(state) => Some(*state),
            None if id.0 >= 1 && id.0 <= self.next_request => Some(RequestState::Completed),
            None => None,
        }
    }

    pub fn pending(&self) -> usize {
        self.microtasks.len() + self.immediates.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}

/// 按工作线程角色投递：主工作线程按类别本地调度，
/// 次级工作线程转发给主工作线程，此时没有本地请求号。
pub(crate) fn route(
    role: WorkerRole,
    gateway: &mut Gateway,
    context: &Context,
    message: AsyncSend,
) -> Result<Option<RequestId>> {
    match role {
        WorkerRole::Primary => Ok(Some(gateway.schedule(
            message.kind,
            message.env,
            message.callback,
            message.data,
        ))),
        WorkerRole::Secondary => {
            let sender = context
                .primary_sender()
                .ok_or(NapiError::NoPrimaryWorker)?;
            trace!("forward {:?} send for env {} to primary", message.kind, message.env);
            forward(&sender, message)?;
            Ok(None)
        }
    }
}

/// 向主工作线程转发。
pub(crate) fn forward(sender: &UnboundedSender<AsyncSend>, message: AsyncSend) -> Result<()> {
    sender.send(message).map_err(|_| {
        warn!("primary worker is gone, dropping async send");
        NapiError::NoPrimaryWorker
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> NativeCallback {
        Arc::new(|_, _| Ok(()))
    }

    fn data_of(job: Job) -> usize {
        match job {
            Job::Native(task) => task.data,
            Job::Reaction(_) => usize::MAX,
        }
    }

    #[test]
    fn next_tick_runs_before_immediate() {
        let mut gateway = Gateway::new();
        let env = EnvId::from_raw(1);
        gateway.schedule(AsyncKind::Immediate, env, noop(), 1);
        gateway.schedule(AsyncKind::NextTick, env, noop(), 2);
        gateway.schedule(AsyncKind::Immediate, env, noop(), 3);
        gateway.schedule(AsyncKind::NextTick, env, noop(), 4);
        let order: Vec<_> = std::iter::from_fn(|| gateway.next_job()).map(data_of).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn request_states_progress() {
        let mut gateway = Gateway::new();
        let id = gateway.schedule(AsyncKind::Immediate, EnvId::from_raw(1), noop(), 0);
        assert_eq!(gateway.state(id), Some(RequestState::Scheduled));
        gateway.mark(id, RequestState::Dispatched);
        assert_eq!(gateway.state(id), Some(RequestState::Dispatched));
        gateway.mark(id, RequestState::Completed);
        assert_eq!(gateway.state(id), Some(RequestState::Completed));
        assert_eq!(gateway.state(RequestId(99)), None);
    }

    fn send(tx: &UnboundedSender<AsyncSend>, kind: AsyncKind, data: usize) {
        forward(
            tx,
            AsyncSend {
                kind,
                env: EnvId::from_raw(1),
                callback: noop(),
                data,
            },
        )
        .unwrap();
    }

    #[test]
    fn forwarded_sends_keep_their_kind() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut gateway = Gateway::with_inbox(rx);
        send(&tx, AsyncKind::Immediate, 0);
        send(&tx, AsyncKind::NextTick, 1);
        send(&tx, AsyncKind::Immediate, 2);
        send(&tx, AsyncKind::NextTick, 3);
        let order: Vec<_> = std::iter::from_fn(|| gateway.next_job()).map(data_of).collect();
        assert_eq!(order, vec![1, 3, 0, 2]);
    }

    #[test]
    fn forwarded_next_tick_overtakes_local_immediate() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut gateway = Gateway::with_inbox(rx);
        let env = EnvId::from_raw(1);
        gateway.schedule(AsyncKind::Immediate, env, noop(), 1);
        send(&tx, AsyncKind::NextTick, 2);
        let order: Vec<_> = std::iter::from_fn(|| gateway.next_job()).map(data_of).collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn forwarded_immediate_queues_behind_local_immediates_only() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut gateway = Gateway::with_inbox(rx);
        let env = EnvId::from_raw(1);
        gateway.schedule(AsyncKind::Immediate, env, noop(), 0);
        send(&tx, AsyncKind::Immediate, 100);

        // 本地 immediate 每执行一次就重新调度自己
        let mut order = Vec::new();
        while let Some(job) = gateway.next_job() {
            let data = data_of(job);
            order.push(data);
            if data < 50 {
                gateway.schedule(AsyncKind::Immediate, env, noop(), data + 1);
            }
        }
        assert_eq!(order.len(), 52);
        assert_eq!(order.iter().position(|&data| data == 100), Some(1));
    }

    #[test]
    fn disconnected_inbox_is_dropped() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut gateway = Gateway::with_inbox(rx);
        send(&tx, AsyncKind::Immediate, 7);
        drop(tx);
        assert_eq!(gateway.next_job().map(data_of), Some(7));
        assert!(gateway.next_job().is_none());
        assert!(gateway.inbox.is_none());
    }
}
