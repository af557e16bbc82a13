//! Promise 的最小实现。
//!
//! 结算（resolve/reject）不会直接调用回调，而是返回待执行的
//! [`PendingJob`] 列表，由调用方放进自己的微任务队列里执行。
//! 这样回调的执行时机完全由事件循环掌控。

use std::collections::VecDeque;

use arc_gc::{arc::GCArcWeak, traceable::GCTraceable};
use log::trace;

use crate::{
    error::HostError,
    object::{ErrorKind, HostCell, HostObject, HostValue, Rooted, ValueKind},
    realm::Realm,
};

#[derive(Debug, Clone)]
pub enum PromiseState {
    Pending,
    Fulfilled(HostValue),
    Rejected(HostValue),
}

impl PromiseState {
    pub fn is_pending(&self) -> bool {
        matches!(self, PromiseState::Pending)
    }
}

/// 注册在 pending promise 上的反应。
///
/// `derived` 为 `then` 返回的新 promise；处理函数缺省时结果直接透传给它。
#[derive(Clone)]
struct Reaction {
    on_fulfilled: Option<HostValue>,
    on_rejected: Option<HostValue>,
    derived: HostValue,
}

impl GCTraceable<HostCell> for Reaction {
    fn collect(&self, queue: &mut VecDeque<GCArcWeak<HostCell>>) {
        if let Some(f) = &self.on_fulfilled {
            f.collect(queue);
        }
        if let Some(f) = &self.on_rejected {
            f.collect(queue);
        }
        self.derived.collect(queue);
    }
}

pub struct PromiseData {
    state: PromiseState,
    already_resolved: bool,
    reactions: Vec<Reaction>,
}

impl PromiseData {
    pub(crate) fn new() -> Self {
        PromiseData {
            state: PromiseState::Pending,
            already_resolved: false,
            reactions: Vec::new(),
        }
    }

    pub fn state(&self) -> &PromiseState {
        &self.state
    }
}

impl GCTraceable<HostCell> for PromiseData {
    fn collect(&self, queue: &mut VecDeque<GCArcWeak<HostCell>>) {
        match &self.state {
            PromiseState::Fulfilled(v) | PromiseState::Rejected(v) => v.collect(queue),
            PromiseState::Pending => {}
        }
        for reaction in &self.reactions {
            reaction.collect(queue);
        }
    }
}

/// 一个待执行的 promise 反应任务。任务持有根，排队期间相关对象不会被回收。
#[derive(Clone)]
pub struct PendingJob {
    handler: Option<Rooted>,
    derived: Rooted,
    argument: Rooted,
    rejected: bool,
}

impl std::fmt::Debug for PendingJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingJob")
            .field("derived", &self.derived)
            .field("argument", &self.argument)
            .field("rejected", &self.rejected)
            .finish()
    }
}

fn with_promise<T>(
    promise: &Rooted,
    f: impl FnOnce(&mut PromiseData) -> Result<T, HostError>,
) -> Result<T, HostError> {
    promise.with_object_mut(|obj| {
        let found = obj.kind();
        match obj {
            HostObject::Promise(data) => f(data),
            _ => Err(HostError::TypeMismatch {
                expected: ValueKind::Promise,
                found,
            }),
        }
    })
}

fn reaction_job(reaction: &Reaction, state: &PromiseState) -> Result<PendingJob, HostError> {
    let (handler, argument, rejected) = match state {
        PromiseState::Fulfilled(v) => (&reaction.on_fulfilled, v, false),
        PromiseState::Rejected(v) => (&reaction.on_rejected, v, true),
        PromiseState::Pending => unreachable!("reactions are only scheduled on settled promises"),
    };
    Ok(PendingJob {
        handler: handler.as_ref().map(HostValue::try_root).transpose()?,
        derived: reaction.derived.try_root()?,
        argument: argument.try_root()?,
        rejected,
    })
}

impl Realm {
    pub fn create_promise(&mut self) -> Rooted {
        self.alloc(HostObject::Promise(PromiseData::new()))
    }

    pub fn promise_state(&self, promise: &Rooted) -> Result<PromiseState, HostError> {
        with_promise(promise, |data| Ok(data.state.clone()))
    }

    /// 注册 `then` 反应，返回派生 promise 以及（当 promise 已结算时）立即可执行的任务。
    pub fn then(
        &mut self,
        promise: &Rooted,
        on_fulfilled: Option<&Rooted>,
        on_rejected: Option<&Rooted>,
    ) -> Result<(Rooted, Vec<PendingJob>), HostError> {
        let derived = self.create_promise();
        let reaction = Reaction {
            on_fulfilled: on_fulfilled.map(|f| f.weak().clone()),
            on_rejected: on_rejected.map(|f| f.weak().clone()),
            derived: derived.weak().clone(),
        };
        let jobs = with_promise(promise, |data| {
            if data.state.is_pending() {
                data.reactions.push(reaction);
                Ok(vec![])
            } else {
                Ok(vec![reaction_job(&reaction, &data.state)?])
            }
        })?;
        Ok((derived, jobs))
    }

    /// 以 `value` 解决 promise。若 `value` 本身是 promise，则跟随它的结果。
    ///
    /// 已经结算或已经被锁定到另一个 promise 上时什么也不做。
    pub fn resolve_promise(
        &mut self,
        promise: &Rooted,
        value: &Rooted,
    ) -> Result<Vec<PendingJob>, HostError> {
        self.resolve_with(promise, value, false)
    }

    pub fn reject_promise(
        &mut self,
        promise: &Rooted,
        reason: &Rooted,
    ) -> Result<Vec<PendingJob>, HostError> {
        self.reject_with(promise, reason, false)
    }

    // `force` 用于透传任务：目标 promise 此前已被锁定在被跟随的 promise 上
    fn lock(promise: &Rooted, force: bool) -> Result<bool, HostError> {
        with_promise(promise, |data| {
            let first = data.state.is_pending() && (force || !data.already_resolved);
            data.already_resolved = true;
            Ok(first)
        })
    }

    fn resolve_with(
        &mut self,
        promise: &Rooted,
        value: &Rooted,
        force: bool,
    ) -> Result<Vec<PendingJob>, HostError> {
        if !Self::lock(promise, force)? {
            return Ok(vec![]);
        }

        if promise.is_same(value) {
            let error = self.create_error(
                ErrorKind::TypeError,
                "Chaining cycle detected for promise",
            );
            return self.settle(promise, PromiseState::Rejected(error.weak().clone()));
        }

        if self.is_promise(value)? {
            let reaction = Reaction {
                on_fulfilled: None,
                on_rejected: None,
                derived: promise.weak().clone(),
            };
            return with_promise(value, |data| {
                if data.state.is_pending() {
                    data.reactions.push(reaction);
                    Ok(vec![])
                } else {
                    Ok(vec![reaction_job(&reaction, &data.state)?])
                }
            });
        }

        self.settle(promise, PromiseState::Fulfilled(value.weak().clone()))
    }

    fn reject_with(
        &mut self,
        promise: &Rooted,
        reason: &Rooted,
        force: bool,
    ) -> Result<Vec<PendingJob>, HostError> {
        if !Self::lock(promise, force)? {
            return Ok(vec![]);
        }
        self.settle(promise, PromiseState::Rejected(reason.weak().clone()))
    }

    fn settle(
        &mut self,
        promise: &Rooted,
        state: PromiseState,
    ) -> Result<Vec<PendingJob>, HostError> {
        trace!(
            "settle promise {:?}: {}",
            promise.object_id(),
            if matches!(state, PromiseState::Rejected(_)) { "rejected" } else { "fulfilled" }
        );
        with_promise(promise, |data| {
            data.state = state;
            let reactions = std::mem::take(&mut data.reactions);
            reactions
                .iter()
                .map(|reaction| reaction_job(reaction, &data.state))
                .collect()
        })
    }

    /// 执行一个反应任务，返回由此产生的后续任务。
    ///
    /// 处理函数抛出的异常会拒绝派生 promise，不会向外传播。
    pub fn run_job(&mut self, job: PendingJob) -> Result<Vec<PendingJob>, HostError> {
        let PendingJob {
            handler,
            derived,
            argument,
            rejected,
        } = job;
        match handler {
            None if rejected => self.reject_with(&derived, &argument, true),
            None => self.resolve_with(&derived, &argument, true),
            Some(handler) => {
                let undefined = Rooted::undefined();
                match self.call_function(&handler, &undefined, &[argument]) {
                    Ok(result) => self.resolve_promise(&derived, &result),
                    Err(exception) => self.reject_promise(&derived, exception.value()),
                }
            }
        }
    }
}
