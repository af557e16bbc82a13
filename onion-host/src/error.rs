use thiserror::Error;

use crate::object::{ObjectId, Rooted, ValueKind};

/// 宿主运行时的内部错误。
///
/// 这些错误表示对宿主 API 的误用（越界访问、类型不符、对象已被回收），
/// 与脚本层面可观察的异常 [`HostException`] 区分开。
#[derive(Debug, Error)]
pub enum HostError {
    #[error("object {0} has been collected")]
    Collected(ObjectId),
    #[error("value is not an object")]
    NotAnObject,
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: ValueKind,
        found: ValueKind,
    },
    #[error("memory access out of bounds: address {address}, length {length}")]
    OutOfBounds { address: usize, length: usize },
    #[error("cannot grow linear memory beyond {maximum} pages")]
    GrowFailed { maximum: u32 },
    #[error("array buffer is detached")]
    Detached,
    #[error("shared array buffers cannot be detached")]
    NotDetachable,
    #[error("linear memory is not shared")]
    NotShared,
    #[error("lock poisoned in {0}")]
    Poisoned(&'static str),
}

/// 脚本层面抛出的异常，携带被抛出的值（通常是错误对象）。
#[derive(Debug, Clone)]
pub struct HostException {
    value: Rooted,
}

impl HostException {
    pub fn new(value: Rooted) -> Self {
        HostException { value }
    }

    pub fn value(&self) -> &Rooted {
        &self.value
    }

    pub fn into_value(self) -> Rooted {
        self.value
    }
}

impl std::fmt::Display for HostException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "uncaught exception {:?}", self.value)
    }
}

impl std::error::Error for HostException {}
