//! 错误通道：最近一次操作的状态与待处理异常。
//!
//! 每个 ABI 入口在返回前都必须恰好调用一次 [`ErrorChannel::set_last_error`]
//! 或 [`ErrorChannel::clear_last_error`]，因此 `get_last_error_info`
//! 总是反映紧邻的上一次调用。

use log::trace;
use onion_host::Rooted;

use crate::status::{ExtendedErrorInfo, Status};

/// 捕获到的宿主异常槽位。
#[derive(Debug, Default)]
pub struct TryCatch {
    exception: Option<Rooted>,
}

impl TryCatch {
    pub fn has_caught(&self) -> bool {
        self.exception.is_some()
    }

    pub fn exception(&self) -> Option<&Rooted> {
        self.exception.as_ref()
    }

    pub fn set_error(&mut self, exception: Rooted) {
        self.exception = Some(exception);
    }

    pub fn reset(&mut self) {
        self.exception = None;
    }

    /// 取出并清空异常。
    pub fn take_exception(&mut self) -> Option<Rooted> {
        self.exception.take()
    }
}

#[derive(Debug, Default)]
pub struct ErrorChannel {
    last: ExtendedErrorInfo,
    try_catch: TryCatch,
}

impl ErrorChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录终止状态。除 `PendingException` 外的失败状态会丢弃残留的异常。
    pub fn set_last_error(
        &mut self,
        status: Status,
        engine_error_code: u32,
        engine_reserved: usize,
    ) -> Status {
        if status != Status::Ok
            && status != Status::PendingException
            && self.try_catch.has_caught()
        {
            trace!("dropping stale exception on {:?}", status);
            self.try_catch.reset();
        }
        self.last = ExtendedErrorInfo {
            status,
            engine_error_code,
            engine_reserved,
        };
        status
    }

    pub fn clear_last_error(&mut self) -> Status {
        self.last = ExtendedErrorInfo::default();
        Status::Ok
    }

    /// 读取最近一次的错误信息。读到 `Ok` 时顺便清空记录。
    pub fn get_last_error_info(&mut self) -> ExtendedErrorInfo {
        let info = self.last;
        if info.status == Status::Ok {
            self.clear_last_error();
        }
        info
    }

    pub fn last_status(&self) -> Status {
        self.last.status
    }

    pub fn set_error(&mut self, exception: Rooted) {
        self.try_catch.set_error(exception);
    }

    pub fn has_caught(&self) -> bool {
        self.try_catch.has_caught()
    }

    pub fn exception(&self) -> Option<&Rooted> {
        self.try_catch.exception()
    }

    pub fn take_exception(&mut self) -> Option<Rooted> {
        self.try_catch.take_exception()
    }

    /// 有待处理异常时返回 `PendingException`，否则视为成功。
    pub fn return_status(&mut self) -> Status {
        if self.has_caught() {
            self.set_last_error(Status::PendingException, 0, 0)
        } else {
            self.clear_last_error()
        }
    }

    pub fn reset(&mut self) {
        self.try_catch.reset();
        self.clear_last_error();
    }
}
