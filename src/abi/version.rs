use onion_env::{Status, Worker};

use super::{check_env, write_u32, Ptr};

/// 支持的 Node-API 版本。
pub const NAPI_VERSION: u32 = 8;

pub fn napi_get_version(worker: &mut Worker, env: u32, result: Ptr) -> Status {
    check_env(worker, env, |active| write_u32(active, result, NAPI_VERSION))
}

pub fn emnapi_is_support_weakref(worker: &mut Worker) -> bool {
    worker.realm().features().weak_refs
}

pub fn emnapi_is_support_bigint(worker: &mut Worker) -> bool {
    worker.realm().features().bigint
}
