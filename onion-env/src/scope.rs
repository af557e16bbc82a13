//! 作用域栈。
//!
//! 作用域严格按 LIFO 顺序打开与关闭。栈底的根作用域贯穿整个环境的生命周期，
//! 不能被关闭。可逃逸作用域允许在关闭前把恰好一个句柄转移到父作用域。

use std::fmt::Display;

use log::{debug, trace};
use onion_host::Rooted;

use crate::{
    error::{NapiError, Result},
    handle::{HandleId, HandleStore},
};

/// `napi_handle_scope` / `napi_escapable_handle_scope`。0 表示 NULL，不会被分配。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u32);

impl ScopeId {
    pub const ROOT: ScopeId = ScopeId(1);

    pub fn from_raw(raw: u32) -> Self {
        ScopeId(raw)
    }

    pub fn as_raw(self) -> u32 {
        self.0
    }
}

impl Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct Scope {
    id: ScopeId,
    escapable: bool,
    escape_called: bool,
    handles: Vec<HandleId>,
}

impl Scope {
    fn new(id: ScopeId, escapable: bool) -> Self {
        Scope {
            id,
            escapable,
            escape_called: false,
            handles: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct ScopeStack {
    scopes: Vec<Scope>,
    next: u32,
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeStack {
    pub fn new() -> Self {
        ScopeStack {
            scopes: vec![Scope::new(ScopeId::ROOT, false)],
            next: ScopeId::ROOT.0 + 1,
        }
    }

    pub fn open(&mut self, escapable: bool) -> Result<ScopeId> {
        let id = ScopeId(self.next);
        self.next = self
            .next
            .checked_add(1)
            .ok_or(NapiError::IdsExhausted("scope"))?;
        self.scopes.push(Scope::new(id, escapable));
        trace!("open scope {} (escapable = {}, depth = {})", id, escapable, self.scopes.len());
        Ok(id)
    }

    pub fn current(&self) -> ScopeId {
        self.top().id
    }

    fn top(&self) -> &Scope {
        // 根作用域永远在栈底
        &self.scopes[self.scopes.len() - 1]
    }

    /// 打开的作用域数量，含根作用域。
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    fn position(&self, scope: ScopeId) -> Option<usize> {
        self.scopes.iter().rposition(|s| s.id == scope)
    }

    pub fn is_open(&self, scope: ScopeId) -> bool {
        self.position(scope).is_some()
    }

    /// 在当前作用域中为值分配句柄（已有句柄的对象直接复用）。
    pub fn add_handle(&mut self, handles: &mut HandleStore, value: Rooted) -> Result<HandleId> {
        let top = self.scopes.len() - 1;
        let scope = &mut self.scopes[top];
        let (id, fresh) = handles.create(value, scope.id)?;
        if fresh {
            scope.handles.push(id);
        }
        Ok(id)
    }

    /// 关闭栈顶作用域，释放它仍然拥有的句柄，返回释放的数量。
    pub fn close(&mut self, scope: ScopeId, handles: &mut HandleStore) -> Result<usize> {
        let top = self.current();
        if scope != top || scope == ScopeId::ROOT {
            return Err(NapiError::ScopeMismatch { given: scope, top });
        }
        let closed = match self.scopes.pop() {
            Some(closed) => closed,
            None => return Err(NapiError::ScopeMismatch { given: scope, top }),
        };
        let released = handles.release(&closed.handles, closed.id);
        trace!("close scope {} released {} handles", closed.id, released);
        Ok(released)
    }

    /// 关闭作用域直到只剩 `depth` 个为止（根作用域总会保留）。
    pub fn close_to(&mut self, depth: usize, handles: &mut HandleStore) -> usize {
        let depth = depth.max(1);
        let mut closed = 0;
        while self.scopes.len() > depth {
            let top = self.current();
            if self.close(top, handles).is_err() {
                break;
            }
            closed += 1;
        }
        if closed > 0 {
            debug!("force-closed {} scopes down to depth {}", closed, depth);
        }
        closed
    }

    /// 把句柄转移到可逃逸作用域的父作用域。返回的 id 在该作用域关闭后依然有效。
    pub fn escape(
        &mut self,
        scope: ScopeId,
        id: HandleId,
        handles: &mut HandleStore,
    ) -> Result<HandleId> {
        let position = self.position(scope).ok_or(NapiError::ScopeClosed(scope))?;
        if !self.scopes[position].escapable {
            return Err(NapiError::InvalidArg("scope is not escapable"));
        }
        if self.scopes[position].escape_called {
            return Err(NapiError::EscapeCalledTwice(scope));
        }
        handles.get(id)?;
        self.scopes[position].escape_called = true;

        if id.is_reserved() {
            return Ok(id);
        }
        let owner_position = handles.owner(id).and_then(|owner| self.position(owner));
        if matches!(owner_position, Some(p) if p >= position) {
            // 可逃逸作用域不会是根作用域，父作用域一定存在
            let parent = &mut self.scopes[position - 1];
            handles.set_owner(id, parent.id);
            parent.handles.push(id);
            trace!("escaped handle {} from scope {} to {}", id, scope, parent.id);
        }
        Ok(id)
    }

    pub(crate) fn clear(&mut self, handles: &mut HandleStore) {
        self.scopes.truncate(1);
        self.scopes[0].handles.clear();
        handles.clear();
    }
}
