//! 原生模块的线性内存。
//!
//! 线性内存以 64 KiB 为一页，可以增长但不能收缩。
//! 非共享内存增长时会搬迁到新的存储：旧的 buffer 对象被分离，
//! 之前建立在它上面的所有视图都随之失效。共享内存原地扩容，
//! 并生成一个新的 SharedArrayBuffer 对象描述新的长度。
//!
//! 地址 0 永远不会被分配出去，它在原生侧表示 NULL。

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock},
};

use log::{debug, trace, warn};
use rustc_hash::FxHashMap;

use crate::{
    error::HostError,
    object::{ByteStore, ObjectId, Rooted},
    realm::Realm,
};

pub const PAGE_SIZE: usize = 65536;
const ALIGN: usize = 8;

fn align_up(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// 首次适配分配器，空闲块按地址排序并在释放时合并相邻块。
#[derive(Debug, Default)]
struct Allocator {
    free: BTreeMap<usize, usize>,
    used: FxHashMap<usize, usize>,
}

impl Allocator {
    fn new(start: usize, end: usize) -> Self {
        let mut allocator = Allocator::default();
        let start = align_up(start.max(ALIGN));
        if end > start {
            allocator.free.insert(start, end - start);
        }
        allocator
    }

    fn allocate(&mut self, size: usize) -> Option<usize> {
        let size = align_up(size.max(1));
        let (&start, &len) = self.free.iter().find(|(_, len)| **len >= size)?;
        self.free.remove(&start);
        if len > size {
            self.free.insert(start + size, len - size);
        }
        self.used.insert(start, size);
        Some(start)
    }

    fn release(&mut self, address: usize) -> bool {
        let Some(size) = self.used.remove(&address) else {
            return false;
        };
        self.insert_free(address, size);
        true
    }

    fn insert_free(&mut self, mut start: usize, mut len: usize) {
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(start + len)) {
            self.free.remove(&(start + len));
            len += next_len;
        }
        self.free.insert(start, len);
    }

    fn in_use(&self) -> usize {
        self.used.values().sum()
    }
}

/// 只能用来释放内存的句柄，可以被移入终结回调中。
#[derive(Clone)]
pub struct Deallocator {
    allocator: Arc<Mutex<Allocator>>,
}

impl Deallocator {
    pub fn free(&self, address: usize) -> bool {
        match self.allocator.lock() {
            Ok(mut allocator) => allocator.release(address),
            Err(_) => {
                warn!("allocator lock poisoned, leaking {:#x}", address);
                false
            }
        }
    }
}

/// 共享线性内存的可跨线程传递的部分。
#[derive(Clone)]
pub struct SharedStore {
    store: ByteStore,
    allocator: Arc<Mutex<Allocator>>,
    maximum_pages: u32,
}

pub struct LinearMemory {
    store: ByteStore,
    buffer: Rooted,
    shared: bool,
    maximum_pages: u32,
    allocator: Arc<Mutex<Allocator>>,
}

impl LinearMemory {
    /// 创建线性内存。前 `reserved_bytes` 字节（至少 8 字节）不参与分配。
    pub fn new(
        realm: &mut Realm,
        initial_pages: u32,
        maximum_pages: u32,
        shared: bool,
        reserved_bytes: usize,
    ) -> Result<Self, HostError> {
        if initial_pages > maximum_pages {
            return Err(HostError::GrowFailed {
                maximum: maximum_pages,
            });
        }
        let size = initial_pages as usize * PAGE_SIZE;
        let store: ByteStore = Arc::new(RwLock::new(vec![0u8; size]));
        let buffer = realm.create_array_buffer_with_store(store.clone(), size, shared);
        debug!(
            "linear memory created: {} pages (max {}), shared = {}",
            initial_pages, maximum_pages, shared
        );
        Ok(LinearMemory {
            store,
            buffer,
            shared,
            maximum_pages,
            allocator: Arc::new(Mutex::new(Allocator::new(reserved_bytes, size))),
        })
    }

    /// 导出共享内存的底层存储，供其他环境（可能在其他线程）打开同一块内存。
    pub fn export_shared(&self) -> Result<SharedStore, HostError> {
        if !self.shared {
            return Err(HostError::NotShared);
        }
        Ok(SharedStore {
            store: self.store.clone(),
            allocator: self.allocator.clone(),
            maximum_pages: self.maximum_pages,
        })
    }

    /// 在 `realm` 中打开导出的共享内存，两者共用存储与分配器。
    pub fn import_shared(realm: &mut Realm, shared: SharedStore) -> Result<Self, HostError> {
        let size = shared
            .store
            .read()
            .map_err(|_| HostError::Poisoned("LinearMemory::import_shared"))?
            .len();
        let buffer = realm.create_array_buffer_with_store(shared.store.clone(), size, true);
        Ok(LinearMemory {
            store: shared.store,
            buffer,
            shared: true,
            maximum_pages: shared.maximum_pages,
            allocator: shared.allocator,
        })
    }

    pub fn same_store(&self, shared: &SharedStore) -> bool {
        Arc::ptr_eq(&self.store, &shared.store)
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// 当前的 buffer 对象。增长后它会被替换。
    pub fn buffer(&self) -> &Rooted {
        &self.buffer
    }

    pub fn buffer_id(&self) -> Option<ObjectId> {
        self.buffer.object_id()
    }

    pub fn byte_length(&self) -> Result<usize, HostError> {
        Ok(self
            .store
            .read()
            .map_err(|_| HostError::Poisoned("LinearMemory::byte_length"))?
            .len())
    }

    pub fn pages(&self) -> Result<u32, HostError> {
        Ok((self.byte_length()? / PAGE_SIZE) as u32)
    }

    pub fn deallocator(&self) -> Deallocator {
        Deallocator {
            allocator: self.allocator.clone(),
        }
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocator.lock().map(|a| a.in_use()).unwrap_or(0)
    }

    /// 增长 `delta` 页，返回增长前的页数。
    pub fn grow(&mut self, realm: &mut Realm, delta: u32) -> Result<u32, HostError> {
        let old_pages = self.pages()?;
        let new_pages = old_pages
            .checked_add(delta)
            .filter(|&pages| pages <= self.maximum_pages)
            .ok_or(HostError::GrowFailed {
                maximum: self.maximum_pages,
            })?;
        let old_size = old_pages as usize * PAGE_SIZE;
        let new_size = new_pages as usize * PAGE_SIZE;

        if self.shared {
            self.store
                .write()
                .map_err(|_| HostError::Poisoned("LinearMemory::grow"))?
                .resize(new_size, 0);
        } else {
            let mut bytes = self
                .store
                .read()
                .map_err(|_| HostError::Poisoned("LinearMemory::grow"))?
                .clone();
            bytes.resize(new_size, 0);
            self.store = Arc::new(RwLock::new(bytes));
            realm.detach_array_buffer(&self.buffer)?;
        }
        self.buffer =
            realm.create_array_buffer_with_store(self.store.clone(), new_size, self.shared);
        self.allocator
            .lock()
            .map_err(|_| HostError::Poisoned("LinearMemory::grow"))?
            .insert_free(old_size, new_size - old_size);
        debug!("linear memory grown from {} to {} pages", old_pages, new_pages);
        Ok(old_pages)
    }

    /// 共享内存被其他 realm 增长后，刷新本 realm 中的 buffer 对象。
    pub fn refresh(&mut self, realm: &mut Realm) -> Result<bool, HostError> {
        let size = self.byte_length()?;
        if realm.byte_length(&self.buffer)? == size {
            return Ok(false);
        }
        self.buffer = realm.create_array_buffer_with_store(self.store.clone(), size, self.shared);
        Ok(true)
    }

    /// 分配 `size` 字节，不足时按需增长。无法增长时返回 `GrowFailed`。
    pub fn malloc(&mut self, realm: &mut Realm, size: usize) -> Result<usize, HostError> {
        let first_try = self
            .allocator
            .lock()
            .map_err(|_| HostError::Poisoned("LinearMemory::malloc"))?
            .allocate(size);
        if let Some(address) = first_try {
            trace!("malloc({}) = {:#x}", size, address);
            return Ok(address);
        }
        let needed_pages = (align_up(size.max(1)) + PAGE_SIZE - 1) / PAGE_SIZE;
        self.grow(realm, needed_pages as u32)?;
        let address = self
            .allocator
            .lock()
            .map_err(|_| HostError::Poisoned("LinearMemory::malloc"))?
            .allocate(size)
            .ok_or(HostError::GrowFailed {
                maximum: self.maximum_pages,
            })?;
        trace!("malloc({}) = {:#x} after grow", size, address);
        Ok(address)
    }

    pub fn free(&self, address: usize) -> bool {
        self.deallocator().free(address)
    }

    pub fn read(&self, address: usize, length: usize) -> Result<Vec<u8>, HostError> {
        let bytes = self
            .store
            .read()
            .map_err(|_| HostError::Poisoned("LinearMemory::read"))?;
        address
            .checked_add(length)
            .and_then(|end| bytes.get(address..end))
            .map(|slice| slice.to_vec())
            .ok_or(HostError::OutOfBounds { address, length })
    }

    pub fn write(&self, address: usize, data: &[u8]) -> Result<(), HostError> {
        let mut bytes = self
            .store
            .write()
            .map_err(|_| HostError::Poisoned("LinearMemory::write"))?;
        let length = data.len();
        address
            .checked_add(length)
            .and_then(|end| bytes.get_mut(address..end))
            .ok_or(HostError::OutOfBounds { address, length })?
            .copy_from_slice(data);
        Ok(())
    }

    pub fn write_u8(&self, address: usize, value: u8) -> Result<(), HostError> {
        self.write(address, &[value])
    }

    pub fn read_u32(&self, address: usize) -> Result<u32, HostError> {
        let bytes = self.read(address, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u32(&self, address: usize, value: u32) -> Result<(), HostError> {
        self.write(address, &value.to_le_bytes())
    }

    pub fn write_i32(&self, address: usize, value: i32) -> Result<(), HostError> {
        self.write(address, &value.to_le_bytes())
    }

    /// 读取 UTF-8 字符串。`length` 为 `None` 时读到第一个 NUL 为止。
    pub fn read_c_string(
        &self,
        address: usize,
        length: Option<usize>,
    ) -> Result<String, HostError> {
        let bytes = self
            .store
            .read()
            .map_err(|_| HostError::Poisoned("LinearMemory::read_c_string"))?;
        let tail = bytes.get(address..).ok_or(HostError::OutOfBounds {
            address,
            length: length.unwrap_or(0),
        })?;
        let slice = match length {
            Some(length) => tail
                .get(..length)
                .ok_or(HostError::OutOfBounds { address, length })?,
            None => {
                let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
                &tail[..end]
            }
        };
        Ok(String::from_utf8_lossy(slice).into_owned())
    }

    /// 在 `address` 处写入以 NUL 结尾的字符串。
    pub fn write_c_string(&self, address: usize, text: &str) -> Result<(), HostError> {
        let mut data = Vec::with_capacity(text.len() + 1);
        data.extend_from_slice(text.as_bytes());
        data.push(0);
        self.write(address, &data)
    }
}
