//! 计数引用（`napi_ref`）。

use onion_env::{HandleId, ReferenceId, Status, Worker};

use super::{arg, check_env, handle, write_u32, Ptr};

fn reference_id(raw: u32) -> onion_env::Result<ReferenceId> {
    match raw {
        0 => Err(onion_env::NapiError::InvalidArg("null napi_ref")),
        raw => Ok(ReferenceId::from_raw(raw)),
    }
}

pub fn napi_create_reference(
    worker: &mut Worker,
    env: u32,
    value: u32,
    initial_refcount: u32,
    result: Ptr,
) -> Status {
    check_env(worker, env, |active| {
        let value = handle(value)?;
        arg(result)?;
        let reference = active.create_reference(value, initial_refcount)?;
        write_u32(active, result, reference.as_raw())
    })
}

pub fn napi_delete_reference(worker: &mut Worker, env: u32, reference: u32) -> Status {
    check_env(worker, env, |active| active.delete_reference(reference_id(reference)?))
}

/// `result` 可以为 NULL。
pub fn napi_reference_ref(worker: &mut Worker, env: u32, reference: u32, result: Ptr) -> Status {
    check_env(worker, env, |active| {
        let count = active.reference_ref(reference_id(reference)?)?;
        match result {
            0 => Ok(()),
            result => write_u32(active, result, count),
        }
    })
}

pub fn napi_reference_unref(worker: &mut Worker, env: u32, reference: u32, result: Ptr) -> Status {
    check_env(worker, env, |active| {
        let count = active.reference_unref(reference_id(reference)?)?;
        match result {
            0 => Ok(()),
            result => write_u32(active, result, count),
        }
    })
}

/// 目标已被回收时写入 NULL。
pub fn napi_get_reference_value(
    worker: &mut Worker,
    env: u32,
    reference: u32,
    result: Ptr,
) -> Status {
    check_env(worker, env, |active| {
        let reference = reference_id(reference)?;
        arg(result)?;
        let value = active.get_reference_value(reference)?;
        write_u32(active, result, value.unwrap_or(HandleId::EMPTY).as_raw())
    })
}
