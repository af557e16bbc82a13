//! 环境：一个模块实例的全部运行时状态。
//!
//! [`Env`] 只保存状态；所有操作都通过 [`ActiveEnv`] 完成，
//! 它同时借用环境、所在工作线程的 realm 与网关，
//! 由 [`Worker::activate`](crate::worker::Worker::activate) 创建。

use std::{
    fmt::Display,
    sync::atomic::{AtomicU32, Ordering},
};

use log::{debug, trace, warn};
use onion_host::{
    ErrorKind, HostException, HostValue, LinearMemory, Realm, Rooted, ViewKind,
};
use rustc_hash::FxHashMap;

use crate::{
    config::EnvConfig,
    context::Context,
    deferred::{DeferredId, DeferredStore},
    error::{NapiError, Result},
    error_channel::ErrorChannel,
    gateway::{route, AsyncKind, AsyncSend, Gateway, NativeCallback, RequestId},
    handle::{HandleId, HandleStore},
    memory::{ArrayBufferPointer, ExternalMemory, MemoryAddress},
    reference::{ReferenceId, ReferenceStore},
    scope::{ScopeId, ScopeStack},
    status::{ExtendedErrorInfo, Status},
    worker::WorkerRole,
};

static NEXT_ENV: AtomicU32 = AtomicU32::new(1);

/// `napi_env`：进程内唯一的环境编号，0 保留为空。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvId(u32);

impl EnvId {
    fn next() -> Self {
        EnvId(NEXT_ENV.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u32) -> Self {
        EnvId(raw)
    }

    pub fn as_raw(self) -> u32 {
        self.0
    }
}

impl Display for EnvId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Env {
    id: EnvId,
    errors: ErrorChannel,
    handles: HandleStore,
    scopes: ScopeStack,
    deferreds: DeferredStore,
    references: ReferenceStore,
    memory: LinearMemory,
    external: ExternalMemory,
    /// `napi_get_last_error_info` 写出的结构体地址，首次使用时分配
    error_info: Option<usize>,
    /// 各状态消息字符串在线性内存中的地址
    messages: FxHashMap<Status, usize>,
}

impl Env {
    pub(crate) fn new(realm: &mut Realm, config: &EnvConfig) -> Result<Env> {
        let memory = LinearMemory::new(
            realm,
            config.initial_pages,
            config.maximum_pages,
            config.shared_memory,
            config.reserved_bytes,
        )?;
        Ok(Self::with_memory(realm, memory, ExternalMemory::new()))
    }

    pub(crate) fn with_memory(
        realm: &Realm,
        memory: LinearMemory,
        external: ExternalMemory,
    ) -> Env {
        let id = EnvId::next();
        debug!("env {} created (shared memory = {})", id, memory.is_shared());
        Env {
            id,
            errors: ErrorChannel::new(),
            handles: HandleStore::new(realm),
            scopes: ScopeStack::new(),
            deferreds: DeferredStore::new(),
            references: ReferenceStore::new(realm.features().weak_refs),
            memory,
            external,
            error_info: None,
            messages: FxHashMap::default(),
        }
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    pub fn handles(&self) -> &HandleStore {
        &self.handles
    }

    pub fn scopes(&self) -> &ScopeStack {
        &self.scopes
    }

    pub fn deferreds(&self) -> &DeferredStore {
        &self.deferreds
    }

    pub fn references(&self) -> &ReferenceStore {
        &self.references
    }

    pub fn memory(&self) -> &LinearMemory {
        &self.memory
    }

    pub fn external_memory(&self) -> &ExternalMemory {
        &self.external
    }

    /// 销毁前释放全部状态。返回释放的保留分配数量。
    pub(crate) fn teardown(&mut self) -> usize {
        let freed = match self.external.release_retained(&self.memory) {
            Ok(freed) => freed,
            Err(e) => {
                warn!("env {} failed to release retained memory: {}", self.id, e);
                0
            }
        };
        if !self.deferreds.is_empty() {
            debug!(
                "env {} dropped {} unsettled deferreds",
                self.id,
                self.deferreds.len()
            );
        }
        self.deferreds.clear();
        self.references.clear();
        self.scopes.clear(&mut self.handles);
        self.errors.reset();
        freed
    }
}

/// 正在使用中的环境。
pub struct ActiveEnv<'w> {
    env: &'w mut Env,
    realm: &'w mut Realm,
    gateway: &'w mut Gateway,
    context: &'w Context,
    role: WorkerRole,
}

impl<'w> ActiveEnv<'w> {
    pub(crate) fn new(
        env: &'w mut Env,
        realm: &'w mut Realm,
        gateway: &'w mut Gateway,
        context: &'w Context,
        role: WorkerRole,
    ) -> Self {
        ActiveEnv {
            env,
            realm,
            gateway,
            context,
            role,
        }
    }

    pub fn id(&self) -> EnvId {
        self.env.id
    }

    pub fn env(&self) -> &Env {
        self.env
    }

    pub fn realm(&mut self) -> &mut Realm {
        self.realm
    }

    pub fn context(&self) -> &Context {
        self.context
    }

    pub fn memory(&self) -> &LinearMemory {
        &self.env.memory
    }

    // ---- 错误通道 ----

    pub fn set_last_error(
        &mut self,
        status: Status,
        engine_error_code: u32,
        engine_reserved: usize,
    ) -> Status {
        self.env
            .errors
            .set_last_error(status, engine_error_code, engine_reserved)
    }

    pub fn clear_last_error(&mut self) -> Status {
        self.env.errors.clear_last_error()
    }

    pub fn return_status(&mut self) -> Status {
        self.env.errors.return_status()
    }

    /// 把宿主抛出的异常存入错误通道，其他错误原样返回。
    pub fn capture(&mut self, error: NapiError) -> NapiError {
        match error {
            NapiError::Thrown(exception) => {
                trace!("env {} captured exception", self.env.id);
                self.env.errors.set_error(exception.into_value());
                NapiError::PendingException
            }
            other => other,
        }
    }

    /// 以一次操作的结果结束 ABI 调用：成功时清空记录，失败时记录对应状态。
    pub fn finish(&mut self, result: Result<()>) -> Status {
        match result {
            Ok(()) => self.clear_last_error(),
            Err(error) => {
                let error = self.capture(error);
                let status = error.status();
                debug!("env {} call failed with {:?}: {}", self.env.id, status, error);
                self.set_last_error(status, 0, 0)
            }
        }
    }

    /// 把最近一次的错误信息按 `napi_extended_error_info` 布局写入线性内存，返回其地址。
    ///
    /// 读到 `Ok` 时记录会被清空。
    pub fn last_error_info_address(&mut self) -> Result<usize> {
        let info = self.env.errors.get_last_error_info();
        let address = match self.env.error_info {
            Some(address) => address,
            None => {
                let address = self.malloc(ExtendedErrorInfo::SIZE)?;
                self.env.error_info = Some(address);
                address
            }
        };
        let message = match info.message() {
            Some(text) => self.message_address(info.status, text)?,
            None => 0,
        };
        let memory = &self.env.memory;
        memory.write_u32(address + ExtendedErrorInfo::MESSAGE_OFFSET, message as u32)?;
        memory.write_u32(
            address + ExtendedErrorInfo::RESERVED_OFFSET,
            info.engine_reserved as u32,
        )?;
        memory.write_u32(
            address + ExtendedErrorInfo::ENGINE_CODE_OFFSET,
            info.engine_error_code,
        )?;
        memory.write_u32(address + ExtendedErrorInfo::STATUS_OFFSET, info.status.code())?;
        Ok(address)
    }

    fn message_address(&mut self, status: Status, text: &str) -> Result<usize> {
        if let Some(&address) = self.env.messages.get(&status) {
            return Ok(address);
        }
        let address = self.malloc(text.len() + 1)?;
        self.env.memory.write_c_string(address, text)?;
        self.env.messages.insert(status, address);
        Ok(address)
    }

    fn malloc(&mut self, size: usize) -> Result<usize> {
        self.env
            .memory
            .malloc(self.realm, size)
            .map_err(|_| NapiError::OutOfMemory(size))
    }

    pub fn is_exception_pending(&self) -> bool {
        self.env.errors.has_caught()
    }

    /// 取出并清除待处理异常。没有异常时返回 `undefined` 的句柄。
    pub fn get_and_clear_last_exception(&mut self) -> Result<HandleId> {
        match self.env.errors.take_exception() {
            Some(exception) => self.create_handle(exception),
            None => Ok(HandleId::UNDEFINED),
        }
    }

    /// `napi_throw`
    pub fn throw_value(&mut self, value: HandleId) -> Result<()> {
        let value = self.get_handle(value)?;
        self.env.errors.set_error(value);
        Ok(())
    }

    /// 构造错误对象（可带 `code`）并作为待处理异常。
    pub fn throw_error(
        &mut self,
        kind: ErrorKind,
        code: Option<&str>,
        message: &str,
    ) -> Result<()> {
        let error = self.realm.create_error(kind, message);
        if let Some(code) = code {
            self.realm.set_error_code(&error, &Rooted::string(code))?;
        }
        self.env.errors.set_error(error);
        Ok(())
    }

    /// 以字符串句柄构造错误对象。`message` 与 `code` 都必须是字符串。
    pub fn create_error(
        &mut self,
        kind: ErrorKind,
        code: Option<HandleId>,
        message: HandleId,
    ) -> Result<HandleId> {
        let message = self.get_handle(message)?;
        let HostValue::String(text) = message.weak() else {
            return Err(NapiError::Expected(Status::StringExpected));
        };
        let code = code.map(|code| self.get_handle(code)).transpose()?;
        if let Some(code) = &code {
            if !matches!(code.weak(), HostValue::String(_)) {
                return Err(NapiError::Expected(Status::StringExpected));
            }
        }
        let error = self.realm.create_error(kind, text);
        if let Some(code) = code {
            self.realm.set_error_code(&error, &code)?;
        }
        self.create_handle(error)
    }

    // ---- 句柄与作用域 ----

    pub fn create_handle(&mut self, value: Rooted) -> Result<HandleId> {
        let Env {
            scopes, handles, ..
        } = &mut *self.env;
        scopes.add_handle(handles, value)
    }

    pub fn get_handle(&self, id: HandleId) -> Result<Rooted> {
        self.env.handles.get(id).cloned()
    }

    pub fn open_scope(&mut self) -> Result<ScopeId> {
        self.env.scopes.open(false)
    }

    pub fn open_escapable_scope(&mut self) -> Result<ScopeId> {
        self.env.scopes.open(true)
    }

    pub fn close_scope(&mut self, scope: ScopeId) -> Result<()> {
        let Env {
            scopes, handles, ..
        } = &mut *self.env;
        scopes.close(scope, handles).map(|_| ())
    }

    pub fn escape(&mut self, scope: ScopeId, id: HandleId) -> Result<HandleId> {
        let Env {
            scopes, handles, ..
        } = &mut *self.env;
        scopes.escape(scope, id, handles)
    }

    // ---- 值 ----

    pub fn create_object(&mut self) -> Result<HandleId> {
        let object = self.realm.create_object();
        self.create_handle(object)
    }

    pub fn create_string(&mut self, text: &str) -> Result<HandleId> {
        self.create_handle(Rooted::string(text))
    }

    pub fn create_number(&mut self, n: f64) -> Result<HandleId> {
        self.create_handle(Rooted::number(n))
    }

    pub fn create_array_buffer(&mut self, bytes: &[u8]) -> Result<HandleId> {
        let buffer = self.realm.create_array_buffer_from(bytes);
        self.create_handle(buffer)
    }

    /// 在 buffer 上创建视图。越界或 buffer 已分离时宿主抛出异常。
    pub fn create_view(
        &mut self,
        kind: ViewKind,
        buffer: HandleId,
        byte_offset: usize,
        length: usize,
    ) -> Result<HandleId> {
        let buffer = self.get_handle(buffer)?;
        let view = self.realm.create_view(kind, &buffer, byte_offset, length)?;
        self.create_handle(view)
    }

    pub fn detach_array_buffer(&mut self, buffer: HandleId) -> Result<()> {
        let buffer = self.get_handle(buffer)?;
        self.realm.detach_array_buffer(&buffer).map_err(|e| match e {
            onion_host::HostError::NotDetachable | onion_host::HostError::TypeMismatch { .. } => {
                NapiError::Expected(Status::DetachableArraybufferExpected)
            }
            other => NapiError::Host(other),
        })
    }

    // ---- promise ----

    /// 创建 promise 与控制它的 deferred。promise 句柄加入当前作用域。
    pub fn create_deferred(&mut self) -> Result<(DeferredId, HandleId)> {
        let promise = self.realm.create_promise();
        let handle = self.create_handle(promise.clone())?;
        let deferred = self.env.deferreds.insert(promise)?;
        trace!("env {} created deferred {}", self.env.id, deferred);
        Ok((deferred, handle))
    }

    pub fn resolve_deferred(&mut self, deferred: DeferredId, value: HandleId) -> Result<()> {
        self.conclude(deferred, value, false)
    }

    pub fn reject_deferred(&mut self, deferred: DeferredId, reason: HandleId) -> Result<()> {
        self.conclude(deferred, reason, true)
    }

    fn conclude(&mut self, deferred: DeferredId, value: HandleId, reject: bool) -> Result<()> {
        let value = self.get_handle(value)?;
        let promise = self.env.deferreds.take(deferred)?;
        let jobs = if reject {
            self.realm.reject_promise(&promise, &value)?
        } else {
            self.realm.resolve_promise(&promise, &value)?
        };
        debug!(
            "env {} {} deferred {} ({} reactions queued)",
            self.env.id,
            if reject { "rejected" } else { "resolved" },
            deferred,
            jobs.len()
        );
        self.gateway.enqueue_reactions(jobs);
        Ok(())
    }

    /// 结构化查询；宿主查询失败会转为待处理异常。
    pub fn is_promise(&mut self, value: HandleId) -> Result<bool> {
        let value = self.get_handle(value)?;
        match self.realm.is_promise(&value) {
            Ok(is_promise) => Ok(is_promise),
            Err(e) => Err(NapiError::Thrown(self.realm.exception_from(&e))),
        }
    }

    // ---- 引用 ----

    pub fn create_reference(&mut self, value: HandleId, initial_count: u32) -> Result<ReferenceId> {
        let value = self.get_handle(value)?;
        if !value.weak().is_object() {
            return Err(NapiError::InvalidArg("references can only target objects"));
        }
        self.env.references.create(&value, initial_count)
    }

    pub fn reference_ref(&mut self, reference: ReferenceId) -> Result<u32> {
        self.env.references.reference(reference)
    }

    pub fn reference_unref(&mut self, reference: ReferenceId) -> Result<u32> {
        self.env.references.unreference(reference)
    }

    /// 目标已被回收时返回 `None`。
    pub fn get_reference_value(&mut self, reference: ReferenceId) -> Result<Option<HandleId>> {
        let value = self.env.references.get(reference)?;
        value.map(|value| self.create_handle(value)).transpose()
    }

    pub fn delete_reference(&mut self, reference: ReferenceId) -> Result<()> {
        self.env.references.delete(reference)
    }

    // ---- 外部内存 ----

    fn refresh_memory(&mut self) -> Result<()> {
        self.env.memory.refresh(self.realm)?;
        Ok(())
    }

    pub fn is_detached(&self, buffer: HandleId) -> Result<bool> {
        let buffer = self.get_handle(buffer)?;
        ExternalMemory::is_detached(&*self.realm, &buffer)
    }

    pub fn get_array_buffer_pointer(
        &mut self,
        buffer: HandleId,
        should_copy: bool,
    ) -> Result<ArrayBufferPointer> {
        self.refresh_memory()?;
        let buffer = self.get_handle(buffer)?;
        let Env {
            memory, external, ..
        } = &mut *self.env;
        external.get_array_buffer_pointer(self.realm, memory, &buffer, should_copy)
    }

    /// 返回（可能被重建的）视图句柄与它首字节的地址。
    pub fn get_view_pointer(
        &mut self,
        view: HandleId,
        should_copy: bool,
    ) -> Result<(HandleId, ArrayBufferPointer)> {
        self.refresh_memory()?;
        let view = self.get_handle(view)?;
        let Env {
            memory, external, ..
        } = &mut *self.env;
        let result = external.get_view_pointer(self.realm, memory, &view, should_copy)?;
        Ok((self.create_handle(result.view)?, result.pointer))
    }

    /// `emnapi_get_memory_address`：只查询，不拷贝。
    pub fn get_memory_address(&mut self, value: HandleId) -> Result<ArrayBufferPointer> {
        self.refresh_memory()?;
        let value = self.get_handle(value)?;
        let Env {
            memory, external, ..
        } = &mut *self.env;
        let address = external.get_memory_address(self.realm, memory, &value)?;
        Ok(match address {
            MemoryAddress::Buffer(pointer) => pointer,
            MemoryAddress::View(view) => view.pointer,
        })
    }

    /// `emnapi_sync_memory`，返回同步后的值句柄（视图可能被重建）。
    pub fn sync_memory(
        &mut self,
        host_to_native: bool,
        value: HandleId,
        byte_offset: usize,
        length: Option<usize>,
    ) -> Result<HandleId> {
        self.refresh_memory()?;
        let original = value;
        let value = self.get_handle(value)?;
        let Env {
            memory, external, ..
        } = &mut *self.env;
        let synced = external.sync_memory(
            self.realm,
            memory,
            host_to_native,
            &value,
            byte_offset,
            length,
        )?;
        if synced.is_same(&value) {
            return Ok(original);
        }
        self.create_handle(synced)
    }

    /// `emnapi_create_memory_view`
    pub fn create_memory_view(
        &mut self,
        kind: ViewKind,
        address: usize,
        byte_length: usize,
    ) -> Result<HandleId> {
        self.refresh_memory()?;
        let Env {
            memory, external, ..
        } = &mut *self.env;
        let view = external.create_memory_view(self.realm, memory, kind, address, byte_length)?;
        self.create_handle(view)
    }

    // ---- 异步 ----

    pub fn set_immediate(&mut self, callback: NativeCallback, data: usize) -> RequestId {
        self.gateway
            .schedule(AsyncKind::Immediate, self.env.id, callback, data)
    }

    pub fn next_tick(&mut self, callback: NativeCallback, data: usize) -> RequestId {
        self.gateway
            .schedule(AsyncKind::NextTick, self.env.id, callback, data)
    }

    /// `_emnapi_async_send_js`：把回调投递给 `target` 环境。
    ///
    /// 主工作线程上按类别本地调度；次级工作线程上转发给主工作线程，
    /// 此时 `target` 指主工作线程上的环境，返回 `None`。
    pub fn async_send(
        &mut self,
        kind: AsyncKind,
        target: EnvId,
        callback: NativeCallback,
        data: usize,
    ) -> Result<Option<RequestId>> {
        route(
            self.role,
            self.gateway,
            self.context,
            AsyncSend {
                kind,
                env: target,
                callback,
                data,
            },
        )
    }

    pub fn increase_waiting_request_counter(&self) -> usize {
        self.context.increase_waiting_request_counter()
    }

    pub fn decrease_waiting_request_counter(&self) -> Result<usize> {
        self.context.decrease_waiting_request_counter()
    }

    /// 在新的句柄作用域中执行原生代码。
    ///
    /// 结束时关闭期间打开的全部作用域。执行中抛出了异常时，
    /// 异常从错误通道中取出并以 `Thrown` 返回；`close_scope_if_throw`
    /// 为真时再额外关闭调用方的一个作用域。
    pub fn call_into_module<F>(&mut self, close_scope_if_throw: bool, f: F) -> Result<()>
    where
        F: FnOnce(&mut ActiveEnv<'w>) -> Result<()>,
    {
        let id = self.env.id;
        let depth = self.env.scopes.depth();
        let scope = self.open_scope()?;
        trace!("env {} call into module in scope {}", id, scope);

        let outcome = match f(self) {
            Ok(()) => self.take_thrown().map_or(Ok(()), Err),
            Err(NapiError::PendingException) => {
                Err(self.take_thrown().unwrap_or(NapiError::PendingException))
            }
            Err(error) => Err(error),
        };

        let Env {
            scopes, handles, ..
        } = &mut *self.env;
        scopes.close_to(depth, handles);
        if outcome.is_err() && close_scope_if_throw && scopes.depth() > 1 {
            let top = scopes.current();
            if let Err(e) = scopes.close(top, handles) {
                warn!("env {} failed to close caller scope: {}", id, e);
            }
        }
        if let Err(error) = &outcome {
            debug!("env {} module call threw: {}", id, error);
        }
        outcome
    }

    fn take_thrown(&mut self) -> Option<NapiError> {
        self.env
            .errors
            .take_exception()
            .map(|exception| NapiError::Thrown(HostException::new(exception)))
    }
}
