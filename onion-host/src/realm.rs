//! Realm：一个工作线程上的宿主运行时实例。
//!
//! 拥有 GC 堆、全局对象与终结注册表，并提供对象的创建、
//! 种类查询、函数调用与异常构造。

use std::sync::Arc;

use arc_gc::gc::GC;
use indexmap::IndexMap;
use log::debug;

use crate::{
    error::{HostError, HostException},
    finalization::{Cleanup, FinalizationRegistry},
    object::{
        ErrorData, ErrorKind, HostCell, HostFunction, HostObject, HostValue, Rooted, TypeOf,
        ValueKind,
    },
};

/// 宿主可选能力。缺失时上层需要降级处理。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde_support", serde(default))]
pub struct HostFeatures {
    /// 是否支持终结回调（FinalizationRegistry）
    pub finalization: bool,
    /// 是否支持弱引用（WeakRef）
    pub weak_refs: bool,
    pub bigint: bool,
}

impl Default for HostFeatures {
    fn default() -> Self {
        HostFeatures {
            finalization: true,
            weak_refs: true,
            bigint: true,
        }
    }
}

pub struct Realm {
    gc: GC<HostCell>,
    features: HostFeatures,
    global: Rooted,
    registry: FinalizationRegistry,
}

impl Realm {
    pub fn new(features: HostFeatures) -> Self {
        let mut gc = GC::new();
        let global = Rooted::from_arc(gc.create(HostCell::new(HostObject::Plain(IndexMap::new()))));
        Realm {
            gc,
            features,
            global,
            registry: FinalizationRegistry::new(),
        }
    }

    pub fn features(&self) -> HostFeatures {
        self.features
    }

    pub fn global(&self) -> &Rooted {
        &self.global
    }

    pub(crate) fn alloc(&mut self, object: HostObject) -> Rooted {
        Rooted::from_arc(self.gc.create(HostCell::new(object)))
    }

    pub fn create_object(&mut self) -> Rooted {
        self.alloc(HostObject::Plain(IndexMap::new()))
    }

    pub fn create_function<F>(&mut self, name: &str, f: F) -> Rooted
    where
        F: Fn(&mut Realm, &HostValue, &[HostValue]) -> Result<Rooted, HostException>
            + Send
            + Sync
            + 'static,
    {
        self.alloc(HostObject::Function(HostFunction {
            name: Arc::from(name),
            call: Arc::new(f),
        }))
    }

    pub fn create_error(&mut self, kind: ErrorKind, message: &str) -> Rooted {
        self.alloc(HostObject::Error(ErrorData {
            kind,
            message: Arc::from(message),
            code: None,
        }))
    }

    pub fn create_external(&mut self, data: usize) -> Rooted {
        self.alloc(HostObject::External(data))
    }

    pub fn set_property(
        &mut self,
        object: &Rooted,
        key: &str,
        value: &Rooted,
    ) -> Result<(), HostError> {
        object.with_object_mut(|obj| match obj {
            HostObject::Plain(properties) => {
                properties.insert(Arc::from(key), value.weak().clone());
                Ok(())
            }
            other => Err(HostError::TypeMismatch {
                expected: ValueKind::Object,
                found: other.kind(),
            }),
        })
    }

    pub fn get_property(&self, object: &Rooted, key: &str) -> Result<Rooted, HostError> {
        let value = object.with_object(|obj| match obj {
            HostObject::Plain(properties) => Ok(properties.get(key).cloned()),
            _ => Ok(None),
        })?;
        match value {
            None => Ok(Rooted::undefined()),
            Some(v) => v.try_root(),
        }
    }

    /// 值种类的能力查询。
    pub fn kind_of(&self, value: &HostValue) -> Result<ValueKind, HostError> {
        Ok(match value {
            HostValue::Undefined => ValueKind::Undefined,
            HostValue::Null => ValueKind::Null,
            HostValue::Boolean(_) => ValueKind::Boolean,
            HostValue::Number(_) => ValueKind::Number,
            HostValue::BigInt(_) => ValueKind::BigInt,
            HostValue::String(_) => ValueKind::String,
            HostValue::Object(r) => match r.upgrade() {
                Some(cell) => cell.as_ref().with_data(|obj| Ok(obj.kind()))?,
                None => return Err(HostError::Collected(r.id())),
            },
        })
    }

    pub fn type_of(&self, value: &HostValue) -> Result<TypeOf, HostError> {
        self.kind_of(value).map(TypeOf::from)
    }

    pub fn is_promise(&self, value: &Rooted) -> Result<bool, HostError> {
        Ok(self.kind_of(value.weak())? == ValueKind::Promise)
    }

    pub fn is_error(&self, value: &Rooted) -> Result<bool, HostError> {
        Ok(self.kind_of(value.weak())? == ValueKind::Error)
    }

    pub fn error_info(&self, error: &Rooted) -> Result<ErrorData, HostError> {
        error.with_object(|obj| match obj {
            HostObject::Error(data) => Ok(data.clone()),
            other => Err(HostError::TypeMismatch {
                expected: ValueKind::Error,
                found: other.kind(),
            }),
        })
    }

    /// 设置错误对象的 `code` 属性。
    pub fn set_error_code(&mut self, error: &Rooted, code: &Rooted) -> Result<(), HostError> {
        error.with_object_mut(|obj| match obj {
            HostObject::Error(data) => {
                data.code = Some(code.weak().clone());
                Ok(())
            }
            other => Err(HostError::TypeMismatch {
                expected: ValueKind::Error,
                found: other.kind(),
            }),
        })
    }

    /// 构造一个指定种类的错误对象并作为异常返回。
    pub fn throw(&mut self, kind: ErrorKind, message: &str) -> HostException {
        HostException::new(self.create_error(kind, message))
    }

    /// 把内部错误转换为脚本可见的异常。
    pub fn exception_from(&mut self, error: &HostError) -> HostException {
        let kind = match error {
            HostError::TypeMismatch { .. } | HostError::NotAnObject | HostError::Detached => {
                ErrorKind::TypeError
            }
            HostError::OutOfBounds { .. } | HostError::GrowFailed { .. } => ErrorKind::RangeError,
            _ => ErrorKind::Error,
        };
        self.throw(kind, &error.to_string())
    }

    pub fn call_function(
        &mut self,
        function: &Rooted,
        this: &Rooted,
        args: &[Rooted],
    ) -> Result<Rooted, HostException> {
        let callee = function.with_object(|obj| match obj {
            HostObject::Function(f) => Ok(Some(f.clone())),
            _ => Ok(None),
        });
        let callee = match callee {
            Ok(Some(f)) => f,
            Ok(None) | Err(HostError::NotAnObject) => {
                return Err(self.throw(ErrorKind::TypeError, "value is not a function"))
            }
            Err(e) => return Err(self.exception_from(&e)),
        };
        let args: Vec<HostValue> = args.iter().map(|a| a.weak().clone()).collect();
        (callee.call)(self, this.weak(), &args)
    }

    /// 注册终结回调。宿主不支持终结或目标不是对象时返回 `false`。
    pub fn register_finalizer(&mut self, target: &Rooted, cleanup: Cleanup) -> bool {
        if !self.features.finalization {
            return false;
        }
        match target.weak() {
            HostValue::Object(r) => {
                self.registry.register(r.clone(), cleanup);
                true
            }
            _ => false,
        }
    }

    pub fn pending_finalizers(&self) -> usize {
        self.registry.len()
    }

    /// 执行一次完整回收，然后运行已死亡对象的终结回调。
    pub fn collect_garbage(&mut self) -> usize {
        self.gc.collect();
        let finalized = self.registry.cleanup_some();
        debug!("garbage collection finished, {} finalizers ran", finalized);
        finalized
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn kinds_are_closed() {
        let mut realm = Realm::new(HostFeatures::default());
        let object = realm.create_object();
        let promise = realm.create_promise();
        let external = realm.create_external(0x10);
        assert_eq!(realm.kind_of(object.weak()).unwrap(), ValueKind::Object);
        assert_eq!(realm.kind_of(promise.weak()).unwrap(), ValueKind::Promise);
        assert_eq!(realm.type_of(external.weak()).unwrap(), TypeOf::External);
        assert_eq!(realm.type_of(&HostValue::Null).unwrap(), TypeOf::Null);
        assert!(realm.is_promise(&promise).unwrap());
        assert!(!realm.is_promise(&object).unwrap());
    }

    #[test]
    fn unrooted_objects_are_collected() {
        let mut realm = Realm::new(HostFeatures::default());
        let object = realm.create_object();
        let weak = object.weak().clone();
        drop(object);
        realm.collect_garbage();
        assert!(weak.root().is_none());
        assert!(realm.kind_of(&weak).is_err());
    }

    #[test]
    fn properties_keep_children_alive() {
        let mut realm = Realm::new(HostFeatures::default());
        let parent = realm.create_object();
        let child = realm.create_object();
        realm.set_property(&parent, "child", &child).unwrap();
        let weak = child.weak().clone();
        drop(child);
        realm.collect_garbage();
        assert!(weak.root().is_some());
        let again = realm.get_property(&parent, "child").unwrap();
        assert!(again.weak().is_same(&weak));
    }

    #[test]
    fn finalizers_run_once_after_collection() {
        let mut realm = Realm::new(HostFeatures::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let target = realm.create_object();
        let c = counter.clone();
        assert!(realm.register_finalizer(
            &target,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        ));
        realm.collect_garbage();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        drop(target);
        realm.collect_garbage();
        realm.collect_garbage();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(realm.pending_finalizers(), 0);
    }

    #[test]
    fn finalizers_disabled_without_feature() {
        let mut realm = Realm::new(HostFeatures {
            finalization: false,
            ..HostFeatures::default()
        });
        let target = realm.create_object();
        assert!(!realm.register_finalizer(&target, Box::new(|| {})));
    }

    #[test]
    fn calling_non_function_throws_type_error() {
        let mut realm = Realm::new(HostFeatures::default());
        let object = realm.create_object();
        let err = realm
            .call_function(&object, &Rooted::undefined(), &[])
            .unwrap_err();
        assert_eq!(realm.error_info(err.value()).unwrap().kind, ErrorKind::TypeError);
    }
}
