//! onion-napi：面向编译到线性内存的原生模块的 Node-API 风格运行时。
//!
//! - [`onion_host`]：宿主运行时（GC 堆、promise、ArrayBuffer、线性内存）
//! - [`onion_env`]：环境与句柄作用域运行时
//! - [`abi`]：原生模块调用的入口函数

pub mod abi;
#[cfg(feature = "logging")]
pub mod logging;

pub use onion_env;
pub use onion_host;

pub use onion_env::{
    AsyncKind, Context, EnvConfig, EnvId, HandleId, NapiError, NativeCallback, Status, Worker,
};
pub use onion_host::{HostFeatures, ViewKind};
