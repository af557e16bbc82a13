//! 错误与异常相关的入口。

use log::error;
use onion_env::{EnvId, HandleId, Status, Worker};
use onion_host::{ErrorKind, LinearMemory};

use super::{arg, check_env, handle, preamble, read_str, write_bool, write_u32, Ptr, AUTO_LENGTH};

/// `napi_get_last_error_info`：结果指向环境内一块固定的 `napi_extended_error_info`。
///
/// 成功时不会覆盖最近一次的错误记录，只有读到 `Ok` 时记录才被清空。
pub fn napi_get_last_error_info(worker: &mut Worker, env: u32, result: Ptr) -> Status {
    let mut active = match worker.activate(EnvId::from_raw(env)) {
        Ok(active) => active,
        Err(e) => return e.status(),
    };
    if result == 0 {
        return active.set_last_error(Status::InvalidArg, 0, 0);
    }
    match active
        .last_error_info_address()
        .and_then(|address| write_u32(&active, result, address as u32))
    {
        Ok(()) => Status::Ok,
        Err(e) => active.finish(Err(e)),
    }
}

pub fn napi_throw(worker: &mut Worker, env: u32, error: u32) -> Status {
    preamble(worker, env, |active| active.throw_value(handle(error)?))
}

fn throw_with_kind(worker: &mut Worker, env: u32, kind: ErrorKind, code: Ptr, msg: Ptr) -> Status {
    preamble(worker, env, |active| {
        let message = read_str(active, msg, AUTO_LENGTH)?;
        let code = match code {
            0 => None,
            code => Some(read_str(active, code, AUTO_LENGTH)?),
        };
        active.throw_error(kind, code.as_deref(), &message)
    })
}

pub fn napi_throw_error(worker: &mut Worker, env: u32, code: Ptr, msg: Ptr) -> Status {
    throw_with_kind(worker, env, ErrorKind::Error, code, msg)
}

pub fn napi_throw_type_error(worker: &mut Worker, env: u32, code: Ptr, msg: Ptr) -> Status {
    throw_with_kind(worker, env, ErrorKind::TypeError, code, msg)
}

pub fn napi_throw_range_error(worker: &mut Worker, env: u32, code: Ptr, msg: Ptr) -> Status {
    throw_with_kind(worker, env, ErrorKind::RangeError, code, msg)
}

pub fn node_api_throw_syntax_error(worker: &mut Worker, env: u32, code: Ptr, msg: Ptr) -> Status {
    throw_with_kind(worker, env, ErrorKind::SyntaxError, code, msg)
}

pub fn napi_is_exception_pending(worker: &mut Worker, env: u32, result: Ptr) -> Status {
    check_env(worker, env, |active| {
        let pending = active.is_exception_pending();
        write_bool(active, result, pending)
    })
}

fn create_with_kind(
    worker: &mut Worker,
    env: u32,
    kind: ErrorKind,
    code: u32,
    msg: u32,
    result: Ptr,
) -> Status {
    check_env(worker, env, |active| {
        let message = handle(msg)?;
        arg(result)?;
        let code = (code != 0).then(|| HandleId::from_raw(code));
        let error = active.create_error(kind, code, message)?;
        write_u32(active, result, error.as_raw())
    })
}

pub fn napi_create_error(
    worker: &mut Worker,
    env: u32,
    code: u32,
    msg: u32,
    result: Ptr,
) -> Status {
    create_with_kind(worker, env, ErrorKind::Error, code, msg, result)
}

pub fn napi_create_type_error(
    worker: &mut Worker,
    env: u32,
    code: u32,
    msg: u32,
    result: Ptr,
) -> Status {
    create_with_kind(worker, env, ErrorKind::TypeError, code, msg, result)
}

pub fn napi_create_range_error(
    worker: &mut Worker,
    env: u32,
    code: u32,
    msg: u32,
    result: Ptr,
) -> Status {
    create_with_kind(worker, env, ErrorKind::RangeError, code, msg, result)
}

pub fn node_api_create_syntax_error(
    worker: &mut Worker,
    env: u32,
    code: u32,
    msg: u32,
    result: Ptr,
) -> Status {
    create_with_kind(worker, env, ErrorKind::SyntaxError, code, msg, result)
}

/// 没有待处理异常时写入 `undefined`。
pub fn napi_get_and_clear_last_exception(worker: &mut Worker, env: u32, result: Ptr) -> Status {
    check_env(worker, env, |active| {
        arg(result)?;
        let exception = active.get_and_clear_last_exception()?;
        write_u32(active, result, exception.as_raw())
    })
}

/// 组装致命错误的诊断文本：`FATAL ERROR: <location> <message>`。
pub fn fatal_diagnostic(
    memory: &LinearMemory,
    location: Ptr,
    location_len: usize,
    message: Ptr,
    message_len: usize,
) -> String {
    let read = |ptr: Ptr, len: usize| -> String {
        if ptr == 0 {
            return String::new();
        }
        let len = (len != AUTO_LENGTH).then_some(len);
        memory.read_c_string(ptr as usize, len).unwrap_or_default()
    };
    format!(
        "FATAL ERROR: {} {}",
        read(location, location_len),
        read(message, message_len)
    )
}

/// `napi_fatal_error`：输出诊断后终止进程，不会返回。
pub fn napi_fatal_error(
    memory: &LinearMemory,
    location: Ptr,
    location_len: usize,
    message: Ptr,
    message_len: usize,
) -> ! {
    let diagnostic = fatal_diagnostic(memory, location, location_len, message, message_len);
    error!("{}", diagnostic);
    eprintln!("{}", diagnostic);
    std::process::abort()
}
