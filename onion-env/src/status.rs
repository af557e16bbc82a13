//! 状态码与扩展错误信息。
//!
//! 状态码的数值与 `napi_status` 完全一致，原生侧直接按整数解读。

use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    InvalidArg = 1,
    ObjectExpected = 2,
    StringExpected = 3,
    NameExpected = 4,
    FunctionExpected = 5,
    NumberExpected = 6,
    BooleanExpected = 7,
    ArrayExpected = 8,
    GenericFailure = 9,
    PendingException = 10,
    Cancelled = 11,
    EscapeCalledTwice = 12,
    HandleScopeMismatch = 13,
    CallbackScopeMismatch = 14,
    QueueFull = 15,
    Closing = 16,
    BigintExpected = 17,
    DateExpected = 18,
    ArraybufferExpected = 19,
    DetachableArraybufferExpected = 20,
    WouldDeadlock = 21,
    NoExternalBuffersAllowed = 22,
    CannotRunJs = 23,
}

/// 与状态码一一对应的消息表，`Ok` 没有消息。
pub const MESSAGES: [Option<&str>; 24] = [
    None,
    Some("Invalid argument"),
    Some("An object was expected"),
    Some("A string was expected"),
    Some("A string or symbol was expected"),
    Some("A function was expected"),
    Some("A number was expected"),
    Some("A boolean was expected"),
    Some("An array was expected"),
    Some("Unknown failure"),
    Some("An exception is pending"),
    Some("The async work item was cancelled"),
    Some("napi_escape_handle already called on scope"),
    Some("Invalid handle scope usage"),
    Some("Invalid callback scope usage"),
    Some("Thread-safe function queue is full"),
    Some("Thread-safe function handle is closing"),
    Some("A bigint was expected"),
    Some("A date was expected"),
    Some("An arraybuffer was expected"),
    Some("A detachable arraybuffer was expected"),
    Some("Main thread would deadlock"),
    Some("External buffers are not allowed"),
    Some("Cannot run JavaScript"),
];

impl Status {
    pub const ALL: [Status; 24] = [
        Status::Ok,
        Status::InvalidArg,
        Status::ObjectExpected,
        Status::StringExpected,
        Status::NameExpected,
        Status::FunctionExpected,
        Status::NumberExpected,
        Status::BooleanExpected,
        Status::ArrayExpected,
        Status::GenericFailure,
        Status::PendingException,
        Status::Cancelled,
        Status::EscapeCalledTwice,
        Status::HandleScopeMismatch,
        Status::CallbackScopeMismatch,
        Status::QueueFull,
        Status::Closing,
        Status::BigintExpected,
        Status::DateExpected,
        Status::ArraybufferExpected,
        Status::DetachableArraybufferExpected,
        Status::WouldDeadlock,
        Status::NoExternalBuffersAllowed,
        Status::CannotRunJs,
    ];

    pub fn from_raw(raw: u32) -> Option<Status> {
        Status::ALL.get(raw as usize).copied()
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn message(self) -> Option<&'static str> {
        MESSAGES[self as usize]
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.message() {
            Some(message) => write!(f, "{} ({})", message, self.code()),
            None => write!(f, "ok"),
        }
    }
}

/// `napi_extended_error_info` 的内容。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedErrorInfo {
    pub status: Status,
    pub engine_error_code: u32,
    pub engine_reserved: usize,
}

impl ExtendedErrorInfo {
    /// 在线性内存中的布局（wasm32）：message 指针、reserved、engine code、status。
    pub const SIZE: usize = 16;
    pub const MESSAGE_OFFSET: usize = 0;
    pub const RESERVED_OFFSET: usize = 4;
    pub const ENGINE_CODE_OFFSET: usize = 8;
    pub const STATUS_OFFSET: usize = 12;

    pub fn message(&self) -> Option<&'static str> {
        self.status.message()
    }
}

impl Default for ExtendedErrorInfo {
    fn default() -> Self {
        ExtendedErrorInfo {
            status: Status::Ok,
            engine_error_code: 0,
            engine_reserved: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_codes() {
        for (index, status) in Status::ALL.iter().enumerate() {
            assert_eq!(status.code() as usize, index);
            assert_eq!(Status::from_raw(index as u32), Some(*status));
            assert_eq!(status.message().is_none(), status.is_ok());
        }
        assert_eq!(Status::from_raw(24), None);
        assert_eq!(
            Status::EscapeCalledTwice.message(),
            Some("napi_escape_handle already called on scope")
        );
    }
}
