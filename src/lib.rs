// Library crate for the CoralFS metadata engine: expose the POSIX-shaped
// client surface while keeping storage internals private.

pub mod meta;

// Public surface for the kernel bridge and mount plumbing.
pub use crate::meta::config::MetaConfig;
pub use crate::meta::error::MetaError;
pub use crate::meta::format::Format;
pub use crate::meta::metrics::MetricsSnapshot;
pub use crate::meta::plock::{PlockRecord, PlockType};
pub use crate::meta::redis::RedisMeta;
pub use crate::meta::store::{Meta, Msg, MsgCallback, MsgKind};
pub use crate::meta::types::{
    Attr, Behavior, Ctx, Entry, FallocFlags, FileKind, FlockKind, FsStat, Ino, SetAttrMask, Slice,
    Summary, ROOT_INO,
};
