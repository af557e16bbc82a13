//! 外部内存跟踪器。
//!
//! 原生代码只能通过线性内存地址访问数据，而宿主侧的 ArrayBuffer
//! 可能位于线性内存之外。跟踪器负责：
//!
//! - 为线性内存之外的 buffer 分配线性内存副本，并按对象身份缓存地址
//! - 记录副本由哪一方拥有（`Runtime` 由终结回调释放，`Userland` 保留到环境销毁）
//! - 记录建立在线性内存上的视图的描述符，线性内存增长搬迁后按描述符重建视图
//!
//! 缓存表以对象身份为键、只持有弱引用，对象被回收后条目随之失效。
//! 非共享内存的环境各自拥有独立的表；共享内存时多个环境共用同一张表。

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};
use onion_host::{HostValue, LinearMemory, ObjectId, Realm, Rooted, ValueKind, ViewKind};
use rustc_hash::FxHashMap;

use crate::error::{NapiError, Result};

/// `emnapi_ownership`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Ownership {
    Runtime = 0,
    Userland = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayBufferPointer {
    /// 线性内存地址，0 表示没有可用的原生地址
    pub address: usize,
    pub ownership: Ownership,
    /// 地址指向的存储是否由跟踪器分配
    pub runtime_allocated: bool,
}

impl ArrayBufferPointer {
    pub const NULL: ArrayBufferPointer = ArrayBufferPointer {
        address: 0,
        ownership: Ownership::Runtime,
        runtime_allocated: false,
    };
}

/// 建立在线性内存上的视图的描述符，用于搬迁后重建。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryViewDescriptor {
    pub kind: ViewKind,
    pub address: usize,
    /// 元素个数（DataView 为字节数）
    pub length: usize,
    pub ownership: Ownership,
    pub runtime_allocated: bool,
}

impl MemoryViewDescriptor {
    fn pointer(&self) -> ArrayBufferPointer {
        ArrayBufferPointer {
            address: self.address,
            ownership: self.ownership,
            runtime_allocated: self.runtime_allocated,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViewPointer {
    pub view: Rooted,
    pub pointer: ArrayBufferPointer,
}

/// 弱键表：键为对象身份，值旁边保存目标的弱引用用于判断存活。
struct WeakTable<T> {
    entries: FxHashMap<ObjectId, (HostValue, T)>,
    prune_at: usize,
}

impl<T> Default for WeakTable<T> {
    fn default() -> Self {
        WeakTable {
            entries: FxHashMap::default(),
            prune_at: 64,
        }
    }
}

impl<T> WeakTable<T> {
    fn get_mut(&mut self, key: &Rooted) -> Option<&mut T> {
        let id = key.object_id()?;
        self.entries.get_mut(&id).map(|(_, value)| value)
    }

    fn get(&self, key: &Rooted) -> Option<&T> {
        let id = key.object_id()?;
        self.entries.get(&id).map(|(_, value)| value)
    }

    fn insert(&mut self, key: &Rooted, value: T) {
        let Some(id) = key.object_id() else {
            return;
        };
        if self.entries.len() >= self.prune_at {
            self.prune();
        }
        self.entries.insert(id, (key.weak().clone(), value));
    }

    fn remove(&mut self, id: ObjectId) {
        self.entries.remove(&id);
    }

    fn prune(&mut self) {
        self.entries.retain(|_, (target, _)| match target {
            HostValue::Object(r) => r.is_alive(),
            _ => false,
        });
        self.prune_at = (self.entries.len() * 2).max(64);
    }

    fn live_len(&self) -> usize {
        self.entries
            .values()
            .filter(|(target, _)| matches!(target, HostValue::Object(r) if r.is_alive()))
            .count()
    }
}

#[derive(Default)]
struct Tables {
    buffers: WeakTable<ArrayBufferPointer>,
    views: WeakTable<MemoryViewDescriptor>,
}

pub struct ExternalMemory {
    tables: Arc<Mutex<Tables>>,
    /// 无法注册终结回调时保留到环境销毁的分配
    retained: Vec<(ObjectId, usize)>,
}

impl Default for ExternalMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalMemory {
    pub fn new() -> Self {
        ExternalMemory {
            tables: Arc::new(Mutex::new(Tables::default())),
            retained: Vec::new(),
        }
    }

    /// 与另一个使用同一块共享线性内存的环境共用缓存表。
    pub fn share(&self) -> Self {
        ExternalMemory {
            tables: self.tables.clone(),
            retained: Vec::new(),
        }
    }

    pub fn shares_tables_with(&self, other: &ExternalMemory) -> bool {
        Arc::ptr_eq(&self.tables, &other.tables)
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| NapiError::Host(onion_host::HostError::Poisoned("ExternalMemory")))
    }

    fn is_linear_memory(memory: &LinearMemory, buffer: &Rooted) -> bool {
        buffer.object_id().is_some() && buffer.object_id() == memory.buffer_id()
    }

    pub fn is_detached(realm: &Realm, buffer: &Rooted) -> Result<bool> {
        Ok(realm.is_detached(buffer)?)
    }

    /// 取得 buffer 在线性内存中的地址。
    ///
    /// - 线性内存本身：返回空记录（地址 0，`Runtime`）
    /// - 已跟踪：返回缓存记录；已分离时地址被强制为 0；
    ///   `should_copy` 且副本由本跟踪器以 `Runtime` 方式拥有时重新拷贝
    /// - 未跟踪、已分离或长度为 0、或未要求拷贝：返回空记录
    /// - 否则分配副本、拷入全部字节并缓存
    pub fn get_array_buffer_pointer(
        &mut self,
        realm: &mut Realm,
        memory: &mut LinearMemory,
        buffer: &Rooted,
        should_copy: bool,
    ) -> Result<ArrayBufferPointer> {
        if Self::is_linear_memory(memory, buffer) {
            return Ok(ArrayBufferPointer::NULL);
        }

        let detached = realm.is_detached(buffer)?;
        let cached = {
            let mut tables = self.tables()?;
            match tables.buffers.get_mut(buffer) {
                Some(cached) if detached => {
                    cached.address = 0;
                    Some(*cached)
                }
                Some(cached) => Some(*cached),
                None => None,
            }
        };
        if let Some(cached) = cached {
            if !detached
                && should_copy
                && cached.ownership == Ownership::Runtime
                && cached.runtime_allocated
                && cached.address != 0
            {
                let bytes = realm.read_bytes(buffer)?;
                memory.write(cached.address, &bytes)?;
                trace!("refreshed {} bytes at {:#x}", bytes.len(), cached.address);
            }
            return Ok(cached);
        }

        let byte_length = realm.byte_length(buffer)?;
        if detached || byte_length == 0 || !should_copy {
            return Ok(ArrayBufferPointer::NULL);
        }

        let address = memory
            .malloc(realm, byte_length)
            .map_err(|_| NapiError::OutOfMemory(byte_length))?;
        let bytes = realm.read_bytes(buffer)?;
        memory.write(address, &bytes)?;

        let finalizable = realm.features().finalization;
        let record = ArrayBufferPointer {
            address,
            ownership: if finalizable {
                Ownership::Runtime
            } else {
                Ownership::Userland
            },
            runtime_allocated: true,
        };
        self.tables()?.buffers.insert(buffer, record);

        let deallocator = memory.deallocator();
        let registered = realm.register_finalizer(
            buffer,
            Box::new(move || {
                deallocator.free(address);
            }),
        );
        if !registered {
            if let Some(id) = buffer.object_id() {
                self.retained.push((id, address));
            }
        }
        debug!(
            "copied {} bytes of buffer {:?} to {:#x} ({:?})",
            byte_length,
            buffer.object_id(),
            address,
            record.ownership
        );
        Ok(record)
    }

    /// 返回一个可用的视图。
    ///
    /// 视图建立在线性内存上时缓存它的描述符并原样返回；
    /// 视图的 buffer 可能是搬迁前的线性内存（已分离或共享）且有描述符时，
    /// 在当前线性内存上按描述符重建视图。
    pub fn get_or_update_view(
        &mut self,
        realm: &mut Realm,
        memory: &LinearMemory,
        view: &Rooted,
    ) -> Result<Rooted> {
        let info = realm.view_info(view)?;
        let buffer = info.buffer.try_root()?;

        if Self::is_linear_memory(memory, &buffer) {
            let mut tables = self.tables()?;
            if tables.views.get(view).is_none() {
                tables.views.insert(
                    view,
                    MemoryViewDescriptor {
                        kind: info.kind,
                        address: info.byte_offset,
                        length: info.length,
                        ownership: Ownership::Userland,
                        runtime_allocated: false,
                    },
                );
            }
            return Ok(view.clone());
        }

        let maybe_old_memory =
            realm.is_detached(&buffer)? || realm.array_buffer_info(&buffer)?.shared;
        if !maybe_old_memory {
            return Ok(view.clone());
        }
        let descriptor = self.tables()?.views.get(view).copied();
        let Some(descriptor) = descriptor else {
            return Ok(view.clone());
        };

        let fresh = realm.create_view(
            descriptor.kind,
            memory.buffer(),
            descriptor.address,
            descriptor.length,
        )?;
        self.tables()?.views.insert(&fresh, descriptor);
        debug!(
            "rebound {:?} view at {:#x} (length {}) onto relocated memory",
            descriptor.kind, descriptor.address, descriptor.length
        );
        Ok(fresh)
    }

    /// 组合上面两步，返回视图首字节的线性内存地址。
    pub fn get_view_pointer(
        &mut self,
        realm: &mut Realm,
        memory: &mut LinearMemory,
        view: &Rooted,
        should_copy: bool,
    ) -> Result<ViewPointer> {
        let view = self.get_or_update_view(realm, memory, view)?;
        let info = realm.view_info(&view)?;
        let buffer = info.buffer.try_root()?;

        if Self::is_linear_memory(memory, &buffer) {
            let pointer = match self.tables()?.views.get(&view) {
                Some(descriptor) => descriptor.pointer(),
                None => ArrayBufferPointer {
                    address: info.byte_offset,
                    ownership: Ownership::Userland,
                    runtime_allocated: false,
                },
            };
            return Ok(ViewPointer { view, pointer });
        }

        let base = self.get_array_buffer_pointer(realm, memory, &buffer, should_copy)?;
        let pointer = ArrayBufferPointer {
            address: if base.address == 0 {
                0
            } else {
                base.address + info.byte_offset
            },
            ..base
        };
        Ok(ViewPointer { view, pointer })
    }

    /// `emnapi_get_memory_address`：不拷贝，只查询。
    pub fn get_memory_address(
        &mut self,
        realm: &mut Realm,
        memory: &mut LinearMemory,
        value: &Rooted,
    ) -> Result<MemoryAddress> {
        match realm.kind_of(value.weak())? {
            ValueKind::ArrayBuffer => Ok(MemoryAddress::Buffer(
                self.get_array_buffer_pointer(realm, memory, value, false)?,
            )),
            ValueKind::TypedArray | ValueKind::DataView => Ok(MemoryAddress::View(
                self.get_view_pointer(realm, memory, value, false)?,
            )),
            _ => Err(NapiError::InvalidArg("expected an ArrayBuffer or a view")),
        }
    }

    /// 在宿主字节与其线性内存副本之间同步。
    ///
    /// `host_to_native` 为真时把宿主字节拷入线性内存，否则反向拷贝。
    /// `length` 为 `None` 表示到宿主字节末尾。返回（可能被重建的）值。
    pub fn sync_memory(
        &mut self,
        realm: &mut Realm,
        memory: &mut LinearMemory,
        host_to_native: bool,
        value: &Rooted,
        byte_offset: usize,
        length: Option<usize>,
    ) -> Result<Rooted> {
        let (value, pointer) = match self.get_memory_address(realm, memory, value)? {
            MemoryAddress::Buffer(pointer) => (value.clone(), pointer),
            MemoryAddress::View(ViewPointer { view, pointer }) => (view, pointer),
        };
        let host_length = realm.byte_length(&value)?;
        let length = match length {
            Some(length) => length,
            None => host_length
                .checked_sub(byte_offset)
                .ok_or(NapiError::InvalidArg("byte offset out of range"))?,
        };
        match byte_offset.checked_add(length) {
            Some(end) if end <= host_length => {}
            _ => return Err(NapiError::InvalidArg("sync range out of bounds")),
        }
        if length == 0 {
            return Ok(value);
        }

        let over_linear_memory = match realm.kind_of(value.weak())? {
            ValueKind::ArrayBuffer => Self::is_linear_memory(memory, &value),
            _ => Self::is_linear_memory(memory, &realm.view_buffer(&value)?),
        };
        if over_linear_memory {
            // 同一块存储，无需拷贝
            return Ok(value);
        }
        if pointer.address == 0 {
            return Err(NapiError::InvalidArg("value has no native backing store"));
        }

        let address = pointer.address + byte_offset;
        if host_to_native {
            let bytes = realm.read_bytes(&value)?;
            memory.write(address, &bytes[byte_offset..byte_offset + length])?;
        } else {
            let bytes = memory.read(address, length)?;
            realm.write_bytes(&value, byte_offset, &bytes)?;
        }
        trace!(
            "synced {} bytes {} {:#x}",
            length,
            if host_to_native { "to" } else { "from" },
            address
        );
        Ok(value)
    }

    /// `emnapi_create_memory_view`：直接在线性内存上建立视图并缓存描述符。
    pub fn create_memory_view(
        &mut self,
        realm: &mut Realm,
        memory: &LinearMemory,
        kind: ViewKind,
        address: usize,
        byte_length: usize,
    ) -> Result<Rooted> {
        let length = byte_length / kind.element_size();
        let view = realm.create_view(kind, memory.buffer(), address, length)?;
        self.tables()?.views.insert(
            &view,
            MemoryViewDescriptor {
                kind,
                address,
                length,
                ownership: Ownership::Userland,
                runtime_allocated: false,
            },
        );
        Ok(view)
    }

    pub fn descriptor_of(&self, view: &Rooted) -> Result<Option<MemoryViewDescriptor>> {
        Ok(self.tables()?.views.get(view).copied())
    }

    pub fn tracked_buffers(&self) -> Result<usize> {
        Ok(self.tables()?.buffers.live_len())
    }

    pub fn retained(&self) -> usize {
        self.retained.len()
    }

    /// 释放保留的分配（环境销毁时调用），返回释放的数量。
    pub fn release_retained(&mut self, memory: &LinearMemory) -> Result<usize> {
        let retained = std::mem::take(&mut self.retained);
        let mut tables = self.tables()?;
        let mut freed = 0;
        for (id, address) in retained {
            tables.buffers.remove(id);
            if memory.free(address) {
                freed += 1;
            }
        }
        if freed > 0 {
            debug!("released {} retained native allocations", freed);
        }
        Ok(freed)
    }
}

/// [`ExternalMemory::get_memory_address`] 的结果。
#[derive(Debug, Clone)]
pub enum MemoryAddress {
    Buffer(ArrayBufferPointer),
    View(ViewPointer),
}

impl MemoryAddress {
    pub fn pointer(&self) -> ArrayBufferPointer {
        match self {
            MemoryAddress::Buffer(pointer) => *pointer,
            MemoryAddress::View(view) => view.pointer,
        }
    }
}
