//! 原生模块看到的 ABI 入口。
//!
//! 每个入口都对应一个 Node-API / emnapi 函数：参数是原始整数
//! （`napi_env`、`napi_value`、线性内存地址），结果写回线性内存，
//! 返回值是 [`Status`]。地址 0 视为 NULL，一律返回 `InvalidArg`。
//!
//! 入口分两类前置检查：
//!
//! - [`check_env`]：只要求环境存在
//! - [`preamble`]：另外要求没有待处理异常，并清空上一次的错误

pub mod async_ops;
pub mod error;
pub mod memory;
pub mod promise;
pub mod reference;
pub mod scope;
pub mod version;

use onion_env::{ActiveEnv, EnvId, HandleId, NapiError, Status, Worker};

/// 线性内存中的地址。
pub type Ptr = u32;

/// `NAPI_AUTO_LENGTH`
pub const AUTO_LENGTH: usize = usize::MAX;

pub(crate) fn check_env<F>(worker: &mut Worker, env: u32, f: F) -> Status
where
    F: FnOnce(&mut ActiveEnv<'_>) -> onion_env::Result<()>,
{
    match worker.activate(EnvId::from_raw(env)) {
        Ok(mut active) => {
            let result = f(&mut active);
            active.finish(result)
        }
        Err(e) => e.status(),
    }
}

pub(crate) fn preamble<F>(worker: &mut Worker, env: u32, f: F) -> Status
where
    F: FnOnce(&mut ActiveEnv<'_>) -> onion_env::Result<()>,
{
    match worker.preamble(EnvId::from_raw(env)) {
        Ok(mut active) => {
            let result = f(&mut active);
            active.finish(result)
        }
        Err(status) => status,
    }
}

/// 非空地址。
pub(crate) fn arg(ptr: Ptr) -> onion_env::Result<usize> {
    match ptr {
        0 => Err(NapiError::InvalidArg("null pointer")),
        ptr => Ok(ptr as usize),
    }
}

/// 非空句柄。
pub(crate) fn handle(raw: u32) -> onion_env::Result<HandleId> {
    match raw {
        0 => Err(NapiError::InvalidArg("null napi_value")),
        raw => Ok(HandleId::from_raw(raw)),
    }
}

pub(crate) fn write_u32(active: &ActiveEnv<'_>, ptr: Ptr, value: u32) -> onion_env::Result<()> {
    active.memory().write_u32(arg(ptr)?, value)?;
    Ok(())
}

pub(crate) fn write_bool(active: &ActiveEnv<'_>, ptr: Ptr, value: bool) -> onion_env::Result<()> {
    active.memory().write_u8(arg(ptr)?, value as u8)?;
    Ok(())
}

/// 读取 UTF-8 字符串，`length` 为 [`AUTO_LENGTH`] 时读到 NUL 为止。
pub(crate) fn read_str(
    active: &ActiveEnv<'_>,
    ptr: Ptr,
    length: usize,
) -> onion_env::Result<String> {
    let length = (length != AUTO_LENGTH).then_some(length);
    Ok(active.memory().read_c_string(arg(ptr)?, length)?)
}
