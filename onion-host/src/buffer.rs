//! ArrayBuffer 与视图（TypedArray / DataView）。
//!
//! 视图只弱引用它的 buffer（可追踪），buffer 持有实际的字节存储。
//! 分离（detach）后 buffer 的存储被丢弃，长度变为 0，
//! 所有依赖它的视图读到的都是空窗口。

use std::sync::{Arc, RwLock};

use log::debug;

use crate::{
    error::{HostError, HostException},
    object::{
        ArrayBufferData, ByteStore, ErrorKind, HostObject, HostValue, Rooted, ValueKind, ViewData,
        ViewKind,
    },
    realm::Realm,
};

fn expect_buffer<'a>(obj: &'a HostObject) -> Result<&'a ArrayBufferData, HostError> {
    match obj {
        HostObject::ArrayBuffer(data) => Ok(data),
        other => Err(HostError::TypeMismatch {
            expected: ValueKind::ArrayBuffer,
            found: other.kind(),
        }),
    }
}

fn expect_view<'a>(obj: &'a HostObject) -> Result<&'a ViewData, HostError> {
    match obj {
        HostObject::View(data) => Ok(data),
        other => Err(HostError::TypeMismatch {
            expected: ValueKind::TypedArray,
            found: other.kind(),
        }),
    }
}

impl Realm {
    pub fn create_array_buffer(&mut self, byte_length: usize) -> Rooted {
        self.create_array_buffer_from(&vec![0u8; byte_length])
    }

    pub fn create_array_buffer_from(&mut self, bytes: &[u8]) -> Rooted {
        let store = Arc::new(RwLock::new(bytes.to_vec()));
        self.create_array_buffer_with_store(store, bytes.len(), false)
    }

    /// 用已有的字节存储构造 buffer 对象。`byte_length` 不能超过存储的实际长度。
    pub fn create_array_buffer_with_store(
        &mut self,
        store: ByteStore,
        byte_length: usize,
        shared: bool,
    ) -> Rooted {
        self.alloc(HostObject::ArrayBuffer(ArrayBufferData {
            store: Some(store),
            byte_length,
            shared,
        }))
    }

    /// 构造视图。buffer 已分离时抛出 TypeError，越界或未对齐时抛出 RangeError。
    pub fn create_view(
        &mut self,
        kind: ViewKind,
        buffer: &Rooted,
        byte_offset: usize,
        length: usize,
    ) -> Result<Rooted, HostException> {
        let info = match self.array_buffer_info(buffer) {
            Ok(info) => info,
            Err(e) => return Err(self.exception_from(&e)),
        };
        if info.is_detached() {
            return Err(self.throw(
                ErrorKind::TypeError,
                "Cannot perform Construct on a detached ArrayBuffer",
            ));
        }
        let size = kind.element_size();
        if byte_offset % size != 0 {
            return Err(self.throw(
                ErrorKind::RangeError,
                &format!("start offset of {:?} should be a multiple of {}", kind, size),
            ));
        }
        let end = length
            .checked_mul(size)
            .and_then(|bytes| bytes.checked_add(byte_offset));
        match end {
            Some(end) if end <= info.byte_length => {}
            _ => {
                return Err(self.throw(
                    ErrorKind::RangeError,
                    &format!("Invalid typed array length: {}", length),
                ))
            }
        }
        Ok(self.alloc(HostObject::View(ViewData {
            kind,
            buffer: buffer.weak().clone(),
            byte_offset,
            length,
        })))
    }

    /// 分离 buffer：丢弃存储，长度归零。重复分离是无害的。
    pub fn detach_array_buffer(&mut self, buffer: &Rooted) -> Result<(), HostError> {
        buffer.with_object_mut(|obj| match obj {
            HostObject::ArrayBuffer(data) if data.shared => Err(HostError::NotDetachable),
            HostObject::ArrayBuffer(data) => {
                if data.store.take().is_some() {
                    debug!("detached array buffer {:?}", buffer.object_id());
                }
                data.byte_length = 0;
                Ok(())
            }
            other => Err(HostError::TypeMismatch {
                expected: ValueKind::ArrayBuffer,
                found: other.kind(),
            }),
        })
    }

    pub fn is_detached(&self, buffer: &Rooted) -> Result<bool, HostError> {
        buffer.with_object(|obj| expect_buffer(obj).map(ArrayBufferData::is_detached))
    }

    pub fn array_buffer_info(&self, buffer: &Rooted) -> Result<ArrayBufferData, HostError> {
        buffer.with_object(|obj| expect_buffer(obj).cloned())
    }

    pub fn view_info(&self, view: &Rooted) -> Result<ViewData, HostError> {
        view.with_object(|obj| expect_view(obj).cloned())
    }

    pub fn view_buffer(&self, view: &Rooted) -> Result<Rooted, HostError> {
        self.view_info(view)?.buffer.try_root()
    }

    pub fn is_array_buffer_view(&self, value: &HostValue) -> Result<bool, HostError> {
        Ok(matches!(
            self.kind_of(value)?,
            ValueKind::TypedArray | ValueKind::DataView
        ))
    }

    /// 返回 buffer 或视图可见的字节窗口 `(store, offset, len)`，已分离时为 `None`。
    fn window(&self, value: &Rooted) -> Result<Option<(ByteStore, usize, usize)>, HostError> {
        match self.kind_of(value.weak())? {
            ValueKind::ArrayBuffer => {
                let info = self.array_buffer_info(value)?;
                Ok(info.store.map(|store| (store, 0, info.byte_length)))
            }
            ValueKind::TypedArray | ValueKind::DataView => {
                let view = self.view_info(value)?;
                let buffer = self.array_buffer_info(&view.buffer.try_root()?)?;
                match buffer.store {
                    Some(store) if view.byte_offset + view.byte_length() <= buffer.byte_length => {
                        Ok(Some((store, view.byte_offset, view.byte_length())))
                    }
                    _ => Ok(None),
                }
            }
            found => Err(HostError::TypeMismatch {
                expected: ValueKind::ArrayBuffer,
                found,
            }),
        }
    }

    /// 可见字节数。已分离的 buffer 与其视图返回 0。
    pub fn byte_length(&self, value: &Rooted) -> Result<usize, HostError> {
        Ok(self.window(value)?.map(|(_, _, len)| len).unwrap_or(0))
    }

    pub fn read_bytes(&self, value: &Rooted) -> Result<Vec<u8>, HostError> {
        match self.window(value)? {
            None => Ok(Vec::new()),
            Some((store, offset, len)) => {
                let bytes = store
                    .read()
                    .map_err(|_| HostError::Poisoned("Realm::read_bytes"))?;
                bytes
                    .get(offset..offset + len)
                    .map(|slice| slice.to_vec())
                    .ok_or(HostError::OutOfBounds {
                        address: offset,
                        length: len,
                    })
            }
        }
    }

    /// 从可见窗口内的 `offset` 开始写入 `data`。
    pub fn write_bytes(&self, value: &Rooted, offset: usize, data: &[u8]) -> Result<(), HostError> {
        let (store, base, len) = self.window(value)?.ok_or(HostError::Detached)?;
        if offset + data.len() > len {
            return Err(HostError::OutOfBounds {
                address: offset,
                length: data.len(),
            });
        }
        let mut bytes = store
            .write()
            .map_err(|_| HostError::Poisoned("Realm::write_bytes"))?;
        let start = base + offset;
        bytes
            .get_mut(start..start + data.len())
            .ok_or(HostError::OutOfBounds {
                address: start,
                length: data.len(),
            })?
            .copy_from_slice(data);
        Ok(())
    }
}
