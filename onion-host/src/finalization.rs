//! 基于弱引用的终结回调注册表。
//!
//! 目标对象被回收后，下一次 [`FinalizationRegistry::cleanup_some`]
//! 会依次执行对应的清理回调。回调只执行一次。

use log::debug;

use crate::object::HostRef;

pub type Cleanup = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct FinalizationRegistry {
    entries: Vec<(HostRef, Cleanup)>,
}

impl FinalizationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, target: HostRef, cleanup: Cleanup) {
        self.entries.push((target, cleanup));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 执行所有目标已死亡的清理回调，返回执行的数量。
    pub fn cleanup_some(&mut self) -> usize {
        let (dead, alive): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|(target, _)| !target.is_alive());
        self.entries = alive;
        let count = dead.len();
        for (target, cleanup) in dead {
            debug!("finalizing collected object {}", target.id());
            cleanup();
        }
        count
    }
}
