use std::fmt::Display;

use onion_host::Rooted;
use rustc_hash::FxHashMap;

use crate::error::{NapiError, Result};

/// `napi_deferred`：原生侧持有的 promise 控制令牌。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeferredId(u32);

impl DeferredId {
    pub fn from_raw(raw: u32) -> Self {
        DeferredId(raw)
    }

    pub fn as_raw(self) -> u32 {
        self.0
    }
}

impl Display for DeferredId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 未结算的 deferred 记录。每条记录只能被 resolve 或 reject 消费一次。
pub struct DeferredStore {
    records: FxHashMap<DeferredId, Rooted>,
    next: u32,
}

impl Default for DeferredStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredStore {
    pub fn new() -> Self {
        DeferredStore {
            records: FxHashMap::default(),
            next: 1,
        }
    }

    pub fn insert(&mut self, promise: Rooted) -> Result<DeferredId> {
        let id = DeferredId(self.next);
        self.next = self
            .next
            .checked_add(1)
            .ok_or(NapiError::IdsExhausted("deferred"))?;
        self.records.insert(id, promise);
        Ok(id)
    }

    pub fn contains(&self, id: DeferredId) -> bool {
        self.records.contains_key(&id)
    }

    /// 取出记录。不存在（未知或已消费）时返回 `DeferredNotFound`。
    pub fn take(&mut self, id: DeferredId) -> Result<Rooted> {
        self.records
            .remove(&id)
            .ok_or(NapiError::DeferredNotFound(id))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_consumed_once() {
        let mut store = DeferredStore::new();
        let id = store.insert(Rooted::undefined()).unwrap();
        assert!(store.contains(id));
        assert!(store.take(id).is_ok());
        assert!(matches!(store.take(id), Err(NapiError::DeferredNotFound(_))));
        assert!(matches!(
            store.take(DeferredId::from_raw(99)),
            Err(NapiError::DeferredNotFound(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn exhausted_ids_are_reported() {
        let mut store = DeferredStore::new();
        store.next = u32::MAX;
        assert!(matches!(
            store.insert(Rooted::undefined()),
            Err(NapiError::IdsExhausted(_))
        ));
        assert!(store.is_empty());
    }
}
