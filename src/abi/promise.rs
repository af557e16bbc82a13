//! promise 与 deferred。

use onion_env::{DeferredId, Status, Worker};

use super::{arg, check_env, handle, preamble, write_bool, write_u32, Ptr};

pub fn napi_create_promise(worker: &mut Worker, env: u32, deferred: Ptr, promise: Ptr) -> Status {
    preamble(worker, env, |active| {
        arg(deferred)?;
        arg(promise)?;
        let (id, value) = active.create_deferred()?;
        write_u32(active, deferred, id.as_raw())?;
        write_u32(active, promise, value.as_raw())
    })
}

fn deferred_id(raw: u32) -> onion_env::Result<DeferredId> {
    match raw {
        0 => Err(onion_env::NapiError::InvalidArg("null napi_deferred")),
        raw => Ok(DeferredId::from_raw(raw)),
    }
}

pub fn napi_resolve_deferred(
    worker: &mut Worker,
    env: u32,
    deferred: u32,
    resolution: u32,
) -> Status {
    preamble(worker, env, |active| {
        let deferred = deferred_id(deferred)?;
        active.resolve_deferred(deferred, handle(resolution)?)
    })
}

pub fn napi_reject_deferred(
    worker: &mut Worker,
    env: u32,
    deferred: u32,
    rejection: u32,
) -> Status {
    preamble(worker, env, |active| {
        let deferred = deferred_id(deferred)?;
        active.reject_deferred(deferred, handle(rejection)?)
    })
}

pub fn napi_is_promise(worker: &mut Worker, env: u32, value: u32, is_promise: Ptr) -> Status {
    check_env(worker, env, |active| {
        let value = handle(value)?;
        arg(is_promise)?;
        let result = active.is_promise(value)?;
        write_bool(active, is_promise, result)
    })
}
