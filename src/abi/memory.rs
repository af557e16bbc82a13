//! emnapi 的外部内存入口。

use onion_env::{NapiError, Status, Worker};
use onion_host::ViewKind;

use super::{arg, check_env, handle, write_bool, write_u32, Ptr, AUTO_LENGTH};

/// `napi_typedarray_type`，外加 emnapi 的 `-1`（DataView）与 `-2`（Buffer）。
pub fn view_kind(raw: i32) -> Option<ViewKind> {
    match raw {
        -1 => Some(ViewKind::DataView),
        -2 => Some(ViewKind::Buffer),
        raw if raw >= 0 => ViewKind::from_raw(raw as u32),
        _ => None,
    }
}

/// 输出参数都可以为 NULL，只写出非空的那些。
pub fn emnapi_get_memory_address(
    worker: &mut Worker,
    env: u32,
    arraybuffer_or_view: u32,
    address: Ptr,
    ownership: Ptr,
    runtime_allocated: Ptr,
) -> Status {
    check_env(worker, env, |active| {
        let value = handle(arraybuffer_or_view)?;
        let pointer = active.get_memory_address(value)?;
        if address != 0 {
            write_u32(active, address, pointer.address as u32)?;
        }
        if ownership != 0 {
            write_u32(active, ownership, pointer.ownership as u32)?;
        }
        if runtime_allocated != 0 {
            write_bool(active, runtime_allocated, pointer.runtime_allocated)?;
        }
        Ok(())
    })
}

/// `js_to_wasm` 为真时把宿主字节拷入原生副本，否则反向。
/// `length` 为 [`AUTO_LENGTH`] 表示到末尾；`result` 可以为 NULL。
pub fn emnapi_sync_memory(
    worker: &mut Worker,
    env: u32,
    js_to_wasm: bool,
    arraybuffer_or_view: u32,
    byte_offset: usize,
    length: usize,
    result: Ptr,
) -> Status {
    check_env(worker, env, |active| {
        let value = handle(arraybuffer_or_view)?;
        let length = (length != AUTO_LENGTH).then_some(length);
        let synced = active.sync_memory(js_to_wasm, value, byte_offset, length)?;
        match result {
            0 => Ok(()),
            result => write_u32(active, result, synced.as_raw()),
        }
    })
}

pub fn emnapi_create_memory_view(
    worker: &mut Worker,
    env: u32,
    kind: i32,
    external_data: Ptr,
    byte_length: usize,
    result: Ptr,
) -> Status {
    check_env(worker, env, |active| {
        let kind = view_kind(kind).ok_or(NapiError::InvalidArg("unknown typed array type"))?;
        let address = arg(external_data)?;
        arg(result)?;
        let view = active.create_memory_view(kind, address, byte_length)?;
        write_u32(active, result, view.as_raw())
    })
}
