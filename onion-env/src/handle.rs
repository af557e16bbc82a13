//! 句柄存储。
//!
//! 句柄是原生侧看到的 `napi_value`：一个整数 id 加上一个带根的宿主值。
//! 句柄存活期间它引用的对象不会被回收；作用域关闭时句柄被释放，
//! 对象重新交给 GC 管理。
//!
//! - id 在一个环境内单调递增且永不复用
//! - `0` 是空句柄（原生侧的 NULL），永远无效
//! - `1..=5` 保留给 `undefined`、`null`、`false`、`true` 与全局对象，永不释放
//! - 同一个堆对象在打开的作用域链中只有一个句柄（合并）

use std::fmt::Display;

use log::trace;
use onion_host::{HostValue, ObjectId, Realm, Rooted};
use rustc_hash::FxHashMap;

use crate::{
    error::{NapiError, Result},
    scope::ScopeId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u32);

impl HandleId {
    pub const EMPTY: HandleId = HandleId(0);
    pub const UNDEFINED: HandleId = HandleId(1);
    pub const NULL: HandleId = HandleId(2);
    pub const FALSE: HandleId = HandleId(3);
    pub const TRUE: HandleId = HandleId(4);
    pub const GLOBAL: HandleId = HandleId(5);

    const FIRST_DYNAMIC: u32 = 6;

    pub fn from_raw(raw: u32) -> Self {
        HandleId(raw)
    }

    pub fn as_raw(self) -> u32 {
        self.0
    }

    pub fn is_reserved(self) -> bool {
        self.0 != 0 && self.0 < Self::FIRST_DYNAMIC
    }
}

impl Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Slot {
    value: Rooted,
    owner: ScopeId,
}

pub struct HandleStore {
    reserved: [Rooted; 5],
    slots: FxHashMap<HandleId, Slot>,
    by_object: FxHashMap<ObjectId, HandleId>,
    next: u32,
}

impl HandleStore {
    pub fn new(realm: &Realm) -> Self {
        HandleStore {
            reserved: [
                Rooted::undefined(),
                Rooted::null(),
                Rooted::boolean(false),
                Rooted::boolean(true),
                realm.global().clone(),
            ],
            slots: FxHashMap::default(),
            by_object: FxHashMap::default(),
            next: HandleId::FIRST_DYNAMIC,
        }
    }

    fn reserved_id(&self, value: &HostValue) -> Option<HandleId> {
        match value {
            HostValue::Undefined => Some(HandleId::UNDEFINED),
            HostValue::Null => Some(HandleId::NULL),
            HostValue::Boolean(false) => Some(HandleId::FALSE),
            HostValue::Boolean(true) => Some(HandleId::TRUE),
            HostValue::Object(r) if Some(r.id()) == self.reserved[4].object_id() => {
                Some(HandleId::GLOBAL)
            }
            _ => None,
        }
    }

    /// 为值分配句柄，归属于 `owner` 作用域。返回 `(id, 是否新分配)`。
    pub fn create(&mut self, value: Rooted, owner: ScopeId) -> Result<(HandleId, bool)> {
        if let Some(id) = self.reserved_id(value.weak()) {
            return Ok((id, false));
        }
        if let Some(object) = value.object_id() {
            if let Some(&id) = self.by_object.get(&object) {
                return Ok((id, false));
            }
        }
        let id = HandleId(self.next);
        self.next = self
            .next
            .checked_add(1)
            .ok_or(NapiError::IdsExhausted("handle"))?;
        if let Some(object) = value.object_id() {
            self.by_object.insert(object, id);
        }
        trace!("handle {} -> {:?} in scope {}", id, value, owner);
        self.slots.insert(id, Slot { value, owner });
        Ok((id, true))
    }

    pub fn get(&self, id: HandleId) -> Result<&Rooted> {
        if id.is_reserved() {
            return Ok(&self.reserved[id.0 as usize - 1]);
        }
        self.slots
            .get(&id)
            .map(|slot| &slot.value)
            .ok_or(NapiError::InvalidHandle(id))
    }

    /// 已存在的对象句柄，不分配新的 id。
    pub fn find(&self, value: &HostValue) -> Option<HandleId> {
        self.reserved_id(value)
            .or_else(|| value.object_id().and_then(|o| self.by_object.get(&o).copied()))
    }

    pub fn owner(&self, id: HandleId) -> Option<ScopeId> {
        if id.is_reserved() {
            return Some(ScopeId::ROOT);
        }
        self.slots.get(&id).map(|slot| slot.owner)
    }

    pub(crate) fn set_owner(&mut self, id: HandleId, owner: ScopeId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.owner = owner;
        }
    }

    /// 释放仍归属于 `owner` 的句柄，已经转移给其他作用域的跳过。
    pub(crate) fn release(&mut self, ids: &[HandleId], owner: ScopeId) -> usize {
        let mut released = 0;
        for id in ids {
            let owned = matches!(self.slots.get(id), Some(slot) if slot.owner == owner);
            if !owned {
                continue;
            }
            if let Some(slot) = self.slots.remove(id) {
                if let Some(object) = slot.value.object_id() {
                    self.by_object.remove(&object);
                }
                released += 1;
            }
        }
        released
    }

    pub fn is_live(&self, id: HandleId) -> bool {
        id.is_reserved() || self.slots.contains_key(&id)
    }

    /// 当前存活的动态句柄数（不含保留句柄）。
    pub fn live_count(&self) -> usize {
        self.slots.len()
    }

    pub fn live_ids(&self) -> Vec<HandleId> {
        let mut ids: Vec<_> = self.slots.keys().copied().collect();
        ids.sort();
        ids
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.by_object.clear();
    }
}

#[cfg(test)]
mod tests {
    use onion_host::HostFeatures;

    use super::*;

    #[test]
    fn singletons_use_reserved_ids() {
        let realm = Realm::new(HostFeatures::default());
        let mut store = HandleStore::new(&realm);
        let mut id_of = |value: Rooted| store.create(value, ScopeId::ROOT).unwrap().0;
        assert_eq!(id_of(Rooted::undefined()), HandleId::UNDEFINED);
        assert_eq!(id_of(Rooted::null()), HandleId::NULL);
        assert_eq!(id_of(Rooted::boolean(true)), HandleId::TRUE);
        assert_eq!(id_of(realm.global().clone()), HandleId::GLOBAL);
        assert_eq!(store.live_count(), 0);
        assert!(store.get(HandleId::FALSE).is_ok());
        assert!(matches!(
            store.get(HandleId::EMPTY),
            Err(NapiError::InvalidHandle(_))
        ));
    }

    #[test]
    fn objects_are_coalesced_primitives_are_not() {
        let mut realm = Realm::new(HostFeatures::default());
        let mut store = HandleStore::new(&realm);
        let object = realm.create_object();
        let (a, fresh_a) = store.create(object.clone(), ScopeId::ROOT).unwrap();
        let (b, fresh_b) = store.create(object, ScopeId::ROOT).unwrap();
        assert_eq!(a, b);
        assert!(fresh_a && !fresh_b);
        let (x, _) = store.create(Rooted::number(1.0), ScopeId::ROOT).unwrap();
        let (y, _) = store.create(Rooted::number(1.0), ScopeId::ROOT).unwrap();
        assert_ne!(x, y);
        assert!(!x.is_reserved());
    }

    #[test]
    fn released_ids_are_never_reused() {
        let realm = Realm::new(HostFeatures::default());
        let mut store = HandleStore::new(&realm);
        let (a, _) = store.create(Rooted::number(1.0), ScopeId::ROOT).unwrap();
        assert_eq!(store.release(&[a], ScopeId::ROOT), 1);
        assert!(matches!(store.get(a), Err(NapiError::InvalidHandle(_))));
        let (b, _) = store.create(Rooted::number(1.0), ScopeId::ROOT).unwrap();
        assert!(b > a);
    }

    #[test]
    fn exhausted_id_space_is_an_error() {
        let realm = Realm::new(HostFeatures::default());
        let mut store = HandleStore::new(&realm);
        store.next = u32::MAX;
        assert!(matches!(
            store.create(Rooted::number(1.0), ScopeId::ROOT),
            Err(NapiError::IdsExhausted(_))
        ));
        assert_eq!(store.live_count(), 0);
        // 保留句柄不占用 id 空间
        assert_eq!(
            store.create(Rooted::undefined(), ScopeId::ROOT).unwrap().0,
            HandleId::UNDEFINED
        );
    }
}
