pub mod buffer;
pub mod error;
pub mod finalization;
pub mod memory;
pub mod object;
pub mod promise;
pub mod realm;

pub use arc_gc::gc::GC as GC;
pub use arc_gc::traceable::GCTraceable as GCTraceable;
pub use arc_gc::arc::GCArc as GCArc;
pub use arc_gc::arc::GCArcWeak as GCArcWeak;

pub use error::{HostError, HostException};
pub use memory::{Deallocator, LinearMemory, SharedStore, PAGE_SIZE};
pub use object::{
    ArrayBufferData, ByteStore, ErrorData, ErrorKind, HostObject, HostValue, ObjectId, Rooted,
    TypeOf, ValueKind, ViewData, ViewKind,
};
pub use promise::{PendingJob, PromiseState};
pub use realm::{HostFeatures, Realm};
