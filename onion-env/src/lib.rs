pub mod config;
pub mod context;
pub mod deferred;
pub mod env;
pub mod error;
pub mod error_channel;
pub mod gateway;
pub mod handle;
pub mod memory;
pub mod reference;
pub mod scope;
pub mod status;
pub mod worker;

pub use config::{ConfigError, EnvConfig};
pub use context::Context;
pub use deferred::{DeferredId, DeferredStore};
pub use env::{ActiveEnv, Env, EnvId};
pub use error::{NapiError, Result};
pub use error_channel::{ErrorChannel, TryCatch};
pub use gateway::{AsyncKind, AsyncSend, Gateway, NativeCallback, RequestId, RequestState};
pub use handle::{HandleId, HandleStore};
pub use memory::{
    ArrayBufferPointer, ExternalMemory, MemoryAddress, MemoryViewDescriptor, Ownership,
    ViewPointer,
};
pub use reference::{ReferenceId, ReferenceStore};
pub use scope::{ScopeId, ScopeStack};
pub use status::{ExtendedErrorInfo, Status};
pub use worker::{FunctionTable, Worker, WorkerRole};

pub use onion_host;
