//! 异步调用入口。回调以模块函数表下标传入，0 表示空函数指针。

use log::debug;
use onion_env::{AsyncKind, EnvId, NapiError, NativeCallback, Status, Worker};

use super::check_env;

fn callback(worker: &Worker, index: u32) -> onion_env::Result<NativeCallback> {
    worker
        .function(index)
        .ok_or(NapiError::InvalidArg("unknown callback"))
}

pub fn _emnapi_set_immediate(
    worker: &mut Worker,
    env: u32,
    callback_index: u32,
    data: usize,
) -> Status {
    let callback = callback(worker, callback_index);
    check_env(worker, env, |active| {
        active.set_immediate(callback?, data);
        Ok(())
    })
}

pub fn _emnapi_next_tick(
    worker: &mut Worker,
    env: u32,
    callback_index: u32,
    data: usize,
) -> Status {
    let callback = callback(worker, callback_index);
    check_env(worker, env, |active| {
        active.next_tick(callback?, data);
        Ok(())
    })
}

/// 次级工作线程上 `env` 指主工作线程上的目标环境，状态只通过返回值报告。
pub fn _emnapi_async_send_js(
    worker: &mut Worker,
    kind: u32,
    env: u32,
    callback_index: u32,
    data: usize,
) -> Status {
    let Some(kind) = AsyncKind::from_raw(kind) else {
        return Status::InvalidArg;
    };
    let callback = match callback(worker, callback_index) {
        Ok(callback) => callback,
        Err(e) => return e.status(),
    };
    match worker.async_send(EnvId::from_raw(env), kind, callback, data) {
        Ok(_) => Status::Ok,
        Err(e) => {
            debug!("async send failed: {}", e);
            e.status()
        }
    }
}

/// 在新的句柄作用域中调用模块函数。
///
/// 回调抛出的异常重新放回错误通道，返回 `PendingException`，
/// 由调用方决定如何处理。
pub fn _emnapi_call_into_module(
    worker: &mut Worker,
    env: u32,
    callback_index: u32,
    data: usize,
    close_scope_if_throw: bool,
) -> Status {
    let callback = callback(worker, callback_index);
    check_env(worker, env, |active| {
        let callback = callback?;
        active.call_into_module(close_scope_if_throw, |active| callback(active, data))
    })
}

pub fn _emnapi_ctx_increase_waiting_request_counter(worker: &Worker) -> usize {
    worker.context().increase_waiting_request_counter()
}

/// 计数已经为 0 时返回 `GenericFailure`，计数不变。
pub fn _emnapi_ctx_decrease_waiting_request_counter(worker: &Worker) -> Status {
    match worker.context().decrease_waiting_request_counter() {
        Ok(_) => Status::Ok,
        Err(e) => e.status(),
    }
}
