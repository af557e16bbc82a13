//! 计数引用（`napi_ref`）。
//!
//! 计数大于 0 时引用持有强根；降到 0 后只保留弱引用，
//! 目标被回收后 `get` 返回 `None`。宿主不支持弱引用时，
//! 计数为 0 的引用依旧保持强根。

use std::fmt::Display;

use log::trace;
use onion_host::{HostValue, Rooted};
use rustc_hash::FxHashMap;

use crate::error::{NapiError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReferenceId(u32);

impl ReferenceId {
    pub fn from_raw(raw: u32) -> Self {
        ReferenceId(raw)
    }

    pub fn as_raw(self) -> u32 {
        self.0
    }
}

impl Display for ReferenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Reference {
    count: u32,
    strong: Option<Rooted>,
    target: HostValue,
}

pub struct ReferenceStore {
    references: FxHashMap<ReferenceId, Reference>,
    next: u32,
    weak_refs: bool,
}

impl ReferenceStore {
    pub fn new(weak_refs: bool) -> Self {
        ReferenceStore {
            references: FxHashMap::default(),
            next: 1,
            weak_refs,
        }
    }

    fn can_be_weak(&self, value: &HostValue) -> bool {
        self.weak_refs && value.is_object()
    }

    pub fn create(&mut self, value: &Rooted, initial_count: u32) -> Result<ReferenceId> {
        let id = ReferenceId(self.next);
        self.next = self
            .next
            .checked_add(1)
            .ok_or(NapiError::IdsExhausted("reference"))?;
        let target = value.weak().clone();
        let strong = if initial_count > 0 || !self.can_be_weak(&target) {
            Some(value.clone())
        } else {
            None
        };
        self.references.insert(
            id,
            Reference {
                count: initial_count,
                strong,
                target,
            },
        );
        Ok(id)
    }

    fn entry(&mut self, id: ReferenceId) -> Result<&mut Reference> {
        self.references
            .get_mut(&id)
            .ok_or(NapiError::ReferenceNotFound(id))
    }

    /// 计数加一并返回新计数。目标已被回收时计数照常增加，但无法重新建立强根。
    pub fn reference(&mut self, id: ReferenceId) -> Result<u32> {
        let entry = self.entry(id)?;
        entry.count = entry
            .count
            .checked_add(1)
            .ok_or(NapiError::ReferenceOverflow(id))?;
        if entry.count == 1 && entry.strong.is_none() {
            entry.strong = entry.target.root();
        }
        Ok(entry.count)
    }

    pub fn unreference(&mut self, id: ReferenceId) -> Result<u32> {
        let weak_refs = self.weak_refs;
        let entry = self.entry(id)?;
        if entry.count == 0 {
            return Err(NapiError::ReferenceUnderflow(id));
        }
        entry.count -= 1;
        if entry.count == 0 && weak_refs && entry.target.is_object() {
            trace!("reference {} became weak", id);
            entry.strong = None;
        }
        Ok(entry.count)
    }

    pub fn get(&self, id: ReferenceId) -> Result<Option<Rooted>> {
        let entry = self
            .references
            .get(&id)
            .ok_or(NapiError::ReferenceNotFound(id))?;
        Ok(match &entry.strong {
            Some(strong) => Some(strong.clone()),
            None => entry.target.root(),
        })
    }

    pub fn count(&self, id: ReferenceId) -> Result<u32> {
        self.references
            .get(&id)
            .map(|entry| entry.count)
            .ok_or(NapiError::ReferenceNotFound(id))
    }

    pub fn delete(&mut self, id: ReferenceId) -> Result<()> {
        self.references
            .remove(&id)
            .map(|_| ())
            .ok_or(NapiError::ReferenceNotFound(id))
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.references.clear();
    }
}
