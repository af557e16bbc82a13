//! 宿主运行时对象模型。
//!
//! 堆对象保存在 `GC<HostCell>` 中。
//! 堆内部的引用一律是可追踪的弱引用（`HostValue::Object`），
//! 堆外部持有对象时使用 `Rooted`，它额外持有一个 `GCArc` 强引用作为根。
//!
//! - `HostValue`：廉价可复制的值，原始值内联，对象为弱引用
//! - `Rooted`：带根的值，只要它存活对象就不会被回收
//! - `HostObject`：封闭的对象种类集合（普通对象、函数、错误、Promise、
//!   ArrayBuffer、视图、External）

use std::{
    collections::VecDeque,
    fmt::{Debug, Display},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use arc_gc::{
    arc::{GCArc, GCArcWeak},
    traceable::GCTraceable,
};
use indexmap::IndexMap;

use crate::{error::HostError, promise::PromiseData, realm::Realm};

/// ArrayBuffer 的底层字节存储。线性内存和它暴露出来的 buffer 对象共享同一个存储。
pub type ByteStore = Arc<RwLock<Vec<u8>>>;

/// 宿主函数的实现。参数依次为 realm、this 与实参列表。
pub type HostFunctionImpl =
    dyn Fn(&mut Realm, &HostValue, &[HostValue]) -> Result<Rooted, crate::HostException>
        + Send
        + Sync;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// 堆对象的进程内唯一标识，永不复用。
///
/// 外部的弱映射表（例如外部内存跟踪器）用它作为“对象身份”的键。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    pub(crate) fn next() -> Self {
        ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 对值种类的能力查询结果（封闭集合）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Undefined,
    Null,
    Boolean,
    Number,
    BigInt,
    String,
    Object,
    Function,
    Error,
    Promise,
    ArrayBuffer,
    TypedArray,
    DataView,
    External,
}

impl Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueKind::Undefined => "undefined",
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::BigInt => "bigint",
            ValueKind::String => "string",
            ValueKind::Object => "object",
            ValueKind::Function => "function",
            ValueKind::Error => "error",
            ValueKind::Promise => "promise",
            ValueKind::ArrayBuffer => "arraybuffer",
            ValueKind::TypedArray => "typedarray",
            ValueKind::DataView => "dataview",
            ValueKind::External => "external",
        };
        write!(f, "{}", name)
    }
}

/// `typeof` 的结果，数值与 `napi_valuetype` 保持一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TypeOf {
    Undefined = 0,
    Null = 1,
    Boolean = 2,
    Number = 3,
    String = 4,
    Object = 6,
    Function = 7,
    External = 8,
    BigInt = 9,
}

impl From<ValueKind> for TypeOf {
    fn from(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Undefined => TypeOf::Undefined,
            ValueKind::Null => TypeOf::Null,
            ValueKind::Boolean => TypeOf::Boolean,
            ValueKind::Number => TypeOf::Number,
            ValueKind::BigInt => TypeOf::BigInt,
            ValueKind::String => TypeOf::String,
            ValueKind::Function => TypeOf::Function,
            ValueKind::External => TypeOf::External,
            ValueKind::Object
            | ValueKind::Error
            | ValueKind::Promise
            | ValueKind::ArrayBuffer
            | ValueKind::TypedArray
            | ValueKind::DataView => TypeOf::Object,
        }
    }
}

/// 错误对象的构造器种类。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    TypeError,
    RangeError,
    SyntaxError,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::SyntaxError => "SyntaxError",
        }
    }
}

/// 视图的元素类型。前 11 项的数值与 `napi_typedarray_type` 一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
    DataView,
    Buffer,
}

impl ViewKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ViewKind::Int8,
            1 => ViewKind::Uint8,
            2 => ViewKind::Uint8Clamped,
            3 => ViewKind::Int16,
            4 => ViewKind::Uint16,
            5 => ViewKind::Int32,
            6 => ViewKind::Uint32,
            7 => ViewKind::Float32,
            8 => ViewKind::Float64,
            9 => ViewKind::BigInt64,
            10 => ViewKind::BigUint64,
            _ => return None,
        })
    }

    /// 单个元素的字节数。DataView 与 Buffer 以字节为单位。
    pub fn element_size(self) -> usize {
        match self {
            ViewKind::Int8
            | ViewKind::Uint8
            | ViewKind::Uint8Clamped
            | ViewKind::DataView
            | ViewKind::Buffer => 1,
            ViewKind::Int16 | ViewKind::Uint16 => 2,
            ViewKind::Int32 | ViewKind::Uint32 | ViewKind::Float32 => 4,
            ViewKind::Float64 | ViewKind::BigInt64 | ViewKind::BigUint64 => 8,
        }
    }
}

/// 堆内的弱对象引用。
#[derive(Clone)]
pub struct HostRef {
    id: ObjectId,
    weak: GCArcWeak<HostCell>,
}

impl HostRef {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn upgrade(&self) -> Option<GCArc<HostCell>> {
        self.weak.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.weak.upgrade().is_some()
    }
}

impl Debug for HostRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostRef({})", self.id)
    }
}

/// 宿主值。对象只以弱引用形式出现，因此可以安全地存进其他堆对象里。
#[derive(Clone)]
pub enum HostValue {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    BigInt(i128),
    String(Arc<str>),
    Object(HostRef),
}

impl HostValue {
    pub fn string(s: &str) -> Self {
        HostValue::String(Arc::from(s))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, HostValue::Object(_))
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            HostValue::Object(r) => Some(r.id()),
            _ => None,
        }
    }

    /// 为这个值建立根。对象已被回收时返回 `None`。
    pub fn root(&self) -> Option<Rooted> {
        match self {
            HostValue::Object(r) => r.upgrade().map(Rooted::from_arc),
            primitive => Some(Rooted::primitive(primitive.clone())),
        }
    }

    pub fn try_root(&self) -> Result<Rooted, HostError> {
        match self {
            HostValue::Object(r) => r
                .upgrade()
                .map(Rooted::from_arc)
                .ok_or(HostError::Collected(r.id())),
            primitive => Ok(Rooted::primitive(primitive.clone())),
        }
    }

    /// 两个值是否是同一个值（对象比较身份，原始值比较内容）。
    pub fn is_same(&self, other: &HostValue) -> bool {
        match (self, other) {
            (HostValue::Undefined, HostValue::Undefined) => true,
            (HostValue::Null, HostValue::Null) => true,
            (HostValue::Boolean(a), HostValue::Boolean(b)) => a == b,
            (HostValue::Number(a), HostValue::Number(b)) => a.to_bits() == b.to_bits(),
            (HostValue::BigInt(a), HostValue::BigInt(b)) => a == b,
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Object(a), HostValue::Object(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

impl Debug for HostValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostValue::Undefined => write!(f, "Undefined"),
            HostValue::Null => write!(f, "Null"),
            HostValue::Boolean(b) => write!(f, "Boolean({})", b),
            HostValue::Number(n) => write!(f, "Number({})", n),
            HostValue::BigInt(n) => write!(f, "BigInt({})", n),
            HostValue::String(s) => write!(f, "String({})", s),
            HostValue::Object(r) => write!(f, "Object({})", r.id()),
        }
    }
}

impl GCTraceable<HostCell> for HostValue {
    fn collect(&self, queue: &mut VecDeque<GCArcWeak<HostCell>>) {
        if let HostValue::Object(r) = self {
            queue.push_back(r.weak.clone());
        }
    }
}

/// 带根的宿主值：持有强引用，保证对象在其生命周期内不被回收。
#[derive(Clone)]
pub struct Rooted {
    value: HostValue,
    root: Option<GCArc<HostCell>>,
}

impl Rooted {
    pub fn primitive(value: HostValue) -> Self {
        debug_assert!(!value.is_object(), "object values must be rooted through the heap");
        Rooted { value, root: None }
    }

    pub fn undefined() -> Self {
        Rooted::primitive(HostValue::Undefined)
    }

    pub fn null() -> Self {
        Rooted::primitive(HostValue::Null)
    }

    pub fn boolean(b: bool) -> Self {
        Rooted::primitive(HostValue::Boolean(b))
    }

    pub fn number(n: f64) -> Self {
        Rooted::primitive(HostValue::Number(n))
    }

    pub fn string(s: &str) -> Self {
        Rooted::primitive(HostValue::string(s))
    }

    pub(crate) fn from_arc(arc: GCArc<HostCell>) -> Self {
        let value = HostValue::Object(HostRef {
            id: arc.as_ref().id(),
            weak: arc.as_weak(),
        });
        Rooted {
            value,
            root: Some(arc),
        }
    }

    /// 取出不带根的值，用于存入其他堆对象。
    #[inline(always)]
    pub fn weak(&self) -> &HostValue {
        &self.value
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        self.value.object_id()
    }

    pub fn is_same(&self, other: &Rooted) -> bool {
        self.value.is_same(&other.value)
    }

    pub fn cell(&self) -> Option<&HostCell> {
        self.root.as_ref().map(|arc| arc.as_ref())
    }

    /// 以只读方式访问堆对象，原始值返回类型错误。
    pub fn with_object<T, F>(&self, f: F) -> Result<T, HostError>
    where
        F: FnOnce(&HostObject) -> Result<T, HostError>,
    {
        match self.cell() {
            Some(cell) => cell.with_data(f),
            None => Err(HostError::NotAnObject),
        }
    }

    pub fn with_object_mut<T, F>(&self, f: F) -> Result<T, HostError>
    where
        F: FnOnce(&mut HostObject) -> Result<T, HostError>,
    {
        match self.cell() {
            Some(cell) => cell.with_data_mut(f),
            None => Err(HostError::NotAnObject),
        }
    }
}

impl Debug for Rooted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Rooted({:?})", self.value)
    }
}

/// 错误对象的数据。
#[derive(Debug, Clone)]
pub struct ErrorData {
    pub kind: ErrorKind,
    pub message: Arc<str>,
    pub code: Option<HostValue>,
}

/// ArrayBuffer 的数据。`store == None` 表示已分离（detached）。
#[derive(Clone)]
pub struct ArrayBufferData {
    pub store: Option<ByteStore>,
    pub byte_length: usize,
    pub shared: bool,
}

impl ArrayBufferData {
    pub fn is_detached(&self) -> bool {
        self.store.is_none()
    }
}

/// TypedArray / DataView 的数据。`length` 是元素个数。
#[derive(Debug, Clone)]
pub struct ViewData {
    pub kind: ViewKind,
    pub buffer: HostValue,
    pub byte_offset: usize,
    pub length: usize,
}

impl ViewData {
    pub fn byte_length(&self) -> usize {
        self.length * self.kind.element_size()
    }
}

#[derive(Clone)]
pub struct HostFunction {
    pub name: Arc<str>,
    pub call: Arc<HostFunctionImpl>,
}

/// 堆对象的封闭种类集合。
pub enum HostObject {
    Plain(IndexMap<Arc<str>, HostValue>),
    Function(HostFunction),
    Error(ErrorData),
    Promise(PromiseData),
    ArrayBuffer(ArrayBufferData),
    View(ViewData),
    External(usize),
}

impl HostObject {
    pub fn kind(&self) -> ValueKind {
        match self {
            HostObject::Plain(_) => ValueKind::Object,
            HostObject::Function(_) => ValueKind::Function,
            HostObject::Error(_) => ValueKind::Error,
            HostObject::Promise(_) => ValueKind::Promise,
            HostObject::ArrayBuffer(_) => ValueKind::ArrayBuffer,
            HostObject::View(view) if view.kind == ViewKind::DataView => ValueKind::DataView,
            HostObject::View(_) => ValueKind::TypedArray,
            HostObject::External(_) => ValueKind::External,
        }
    }
}

impl GCTraceable<HostCell> for HostObject {
    fn collect(&self, queue: &mut VecDeque<GCArcWeak<HostCell>>) {
        match self {
            HostObject::Plain(properties) => {
                for value in properties.values() {
                    value.collect(queue);
                }
            }
            HostObject::Error(error) => {
                if let Some(code) = &error.code {
                    code.collect(queue);
                }
            }
            HostObject::Promise(promise) => promise.collect(queue),
            HostObject::View(view) => view.buffer.collect(queue),
            HostObject::Function(_) | HostObject::ArrayBuffer(_) | HostObject::External(_) => {}
        }
    }
}

/// GC 堆中的单元。
pub struct HostCell {
    id: ObjectId,
    inner: RwLock<HostObject>,
}

impl HostCell {
    pub(crate) fn new(object: HostObject) -> Self {
        HostCell {
            id: ObjectId::next(),
            inner: RwLock::new(object),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[inline(always)]
    pub fn with_data<T, F>(&self, f: F) -> Result<T, HostError>
    where
        F: FnOnce(&HostObject) -> Result<T, HostError>,
    {
        match self.inner.read() {
            Ok(guard) => f(&guard),
            Err(_) => Err(HostError::Poisoned("HostCell::with_data")),
        }
    }

    #[inline(always)]
    pub fn with_data_mut<T, F>(&self, f: F) -> Result<T, HostError>
    where
        F: FnOnce(&mut HostObject) -> Result<T, HostError>,
    {
        match self.inner.write() {
            Ok(mut guard) => f(&mut guard),
            Err(_) => Err(HostError::Poisoned("HostCell::with_data_mut")),
        }
    }
}

impl GCTraceable<HostCell> for HostCell {
    fn collect(&self, queue: &mut VecDeque<GCArcWeak<HostCell>>) {
        if let Ok(obj) = self.inner.read() {
            obj.collect(queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_identity() {
        assert!(HostValue::Number(1.0).is_same(&HostValue::Number(1.0)));
        assert!(!HostValue::Number(1.0).is_same(&HostValue::string("1")));
        assert!(HostValue::string("a").is_same(&HostValue::string("a")));
        assert!(HostValue::Undefined.root().is_some());
    }

    #[test]
    fn view_kind_table() {
        assert_eq!(ViewKind::from_raw(1), Some(ViewKind::Uint8));
        assert_eq!(ViewKind::from_raw(10), Some(ViewKind::BigUint64));
        assert_eq!(ViewKind::from_raw(11), None);
        assert_eq!(ViewKind::Float64.element_size(), 8);
        assert_eq!(ViewKind::DataView.element_size(), 1);
    }

    #[test]
    fn object_ids_are_unique() {
        let a = ObjectId::next();
        let b = ObjectId::next();
        assert!(b > a);
    }

    #[test]
    fn type_of_collapses_object_kinds() {
        assert_eq!(TypeOf::from(ValueKind::Promise), TypeOf::Object);
        assert_eq!(TypeOf::from(ValueKind::Function), TypeOf::Function);
        assert_eq!(TypeOf::from(ValueKind::External) as u32, 8);
    }
}
