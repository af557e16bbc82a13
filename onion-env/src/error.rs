//! 环境内部操作的错误类型。

use onion_host::{HostError, HostException};
use thiserror::Error;

use crate::{
    deferred::DeferredId, handle::HandleId, reference::ReferenceId, scope::ScopeId,
    status::Status,
};

#[derive(Debug, Error)]
pub enum NapiError {
    /// 参数非法（空指针、未知的 env 等）
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error("handle {0} is unknown or belongs to a closed scope")]
    InvalidHandle(HandleId),

    #[error("scope {0} is not open")]
    ScopeClosed(ScopeId),

    #[error("scope {given} is not the innermost scope {top}")]
    ScopeMismatch { given: ScopeId, top: ScopeId },

    #[error("escape already called on scope {0}")]
    EscapeCalledTwice(ScopeId),

    #[error("deferred {0} not found")]
    DeferredNotFound(DeferredId),

    #[error("reference {0} not found")]
    ReferenceNotFound(ReferenceId),

    #[error("reference {0} count is already zero")]
    ReferenceUnderflow(ReferenceId),

    #[error("reference {0} count overflow")]
    ReferenceOverflow(ReferenceId),

    /// 单调递增的 id 空间已经用完
    #[error("{0} ids exhausted")]
    IdsExhausted(&'static str),

    #[error("waiting request counter underflow")]
    CounterUnderflow,

    #[error("expected {0}")]
    Expected(Status),

    #[error("out of memory while allocating {0} bytes")]
    OutOfMemory(usize),

    /// 宿主抛出的异常，尚未记录到错误通道
    #[error("{0}")]
    Thrown(#[from] HostException),

    /// 宿主异常已经被记录到错误通道中
    #[error("an exception is pending")]
    PendingException,

    #[error("environment has been torn down")]
    EnvClosed,

    #[error("no primary worker is available to receive async sends")]
    NoPrimaryWorker,

    #[error("host error: {0}")]
    Host(#[from] HostError),
}

impl NapiError {
    /// 对应的 ABI 状态码。
    pub fn status(&self) -> Status {
        match self {
            NapiError::InvalidArg(_)
            | NapiError::InvalidHandle(_)
            | NapiError::ScopeClosed(_)
            | NapiError::DeferredNotFound(_)
            | NapiError::ReferenceNotFound(_)
            | NapiError::EnvClosed => Status::InvalidArg,
            NapiError::ScopeMismatch { .. } => Status::HandleScopeMismatch,
            NapiError::EscapeCalledTwice(_) => Status::EscapeCalledTwice,
            NapiError::Expected(status) => *status,
            NapiError::Thrown(_) | NapiError::PendingException => Status::PendingException,
            NapiError::ReferenceUnderflow(_)
            | NapiError::ReferenceOverflow(_)
            | NapiError::IdsExhausted(_)
            | NapiError::CounterUnderflow
            | NapiError::NoPrimaryWorker
            | NapiError::OutOfMemory(_)
            | NapiError::Host(_) => Status::GenericFailure,
        }
    }
}

pub type Result<T> = std::result::Result<T, NapiError>;
