//! 句柄作用域。

use onion_env::{ScopeId, Status, Worker};

use super::{arg, check_env, handle, write_u32, Ptr};

fn scope_id(raw: u32) -> onion_env::Result<ScopeId> {
    match raw {
        0 => Err(onion_env::NapiError::InvalidArg("null scope")),
        raw => Ok(ScopeId::from_raw(raw)),
    }
}

pub fn napi_open_handle_scope(worker: &mut Worker, env: u32, result: Ptr) -> Status {
    check_env(worker, env, |active| {
        arg(result)?;
        let scope = active.open_scope()?;
        write_u32(active, result, scope.as_raw())
    })
}

pub fn napi_close_handle_scope(worker: &mut Worker, env: u32, scope: u32) -> Status {
    check_env(worker, env, |active| active.close_scope(scope_id(scope)?))
}

pub fn napi_open_escapable_handle_scope(worker: &mut Worker, env: u32, result: Ptr) -> Status {
    check_env(worker, env, |active| {
        arg(result)?;
        let scope = active.open_escapable_scope()?;
        write_u32(active, result, scope.as_raw())
    })
}

pub fn napi_close_escapable_handle_scope(worker: &mut Worker, env: u32, scope: u32) -> Status {
    check_env(worker, env, |active| active.close_scope(scope_id(scope)?))
}

pub fn napi_escape_handle(
    worker: &mut Worker,
    env: u32,
    scope: u32,
    escapee: u32,
    result: Ptr,
) -> Status {
    check_env(worker, env, |active| {
        let scope = scope_id(scope)?;
        let escapee = handle(escapee)?;
        arg(result)?;
        let escaped = active.escape(scope, escapee)?;
        write_u32(active, result, escaped.as_raw())
    })
}
