//! The POSIX-shaped metadata interface and the data-plane message contract.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::Arc;

use crate::meta::error::MetaError;
use crate::meta::format::Format;
use crate::meta::plock::PlockRecord;
use crate::meta::types::{
    Attr, Ctx, Entry, FallocFlags, FileKind, FlockKind, FsStat, Ino, SetAttrMask, Slice, Summary,
};

/// Outward message kinds the kernel bridge can register callbacks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MsgKind {
    /// Remove one object from the object store.
    DeleteChunk,
    /// Coalesce the given slices into a newly allocated object.
    CompactChunk,
}

/// Outward messages to the data plane.
#[derive(Clone, Debug)]
pub enum Msg {
    DeleteChunk { chunk_id: u64, size: u32 },
    CompactChunk { slices: Vec<Slice>, chunk_id: u64 },
}

impl Msg {
    pub fn kind(&self) -> MsgKind {
        match self {
            Msg::DeleteChunk { .. } => MsgKind::DeleteChunk,
            Msg::CompactChunk { .. } => MsgKind::CompactChunk,
        }
    }
}

/// Async, fallible handler the bridge registers per message kind. A failed
/// deletion is retried later by the sweepers, so handlers should only return
/// an error when the data-plane operation really did not happen.
pub type MsgCallback = Arc<dyn Fn(Msg) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// The metadata engine surface used by the kernel bridge. All operations are
/// atomic with respect to concurrent clients; errors map 1:1 onto errnos via
/// [`MetaError::errno`].
#[async_trait]
#[auto_impl::auto_impl(&, Arc)]
pub trait Meta: Send + Sync {
    /// Format the volume, or update credentials of an existing one. `force`
    /// overwrites whatever is there.
    async fn init(&self, format: Format, force: bool) -> Result<(), MetaError>;

    /// Read the volume format record.
    async fn load(&self) -> Result<Format, MetaError>;

    /// Register this client: allocates a session id, loads server-side
    /// helpers and starts the background maintenance tasks.
    async fn new_session(&self) -> Result<(), MetaError>;

    /// Register the data-plane callback for one message kind.
    fn on_msg(&self, kind: MsgKind, cb: MsgCallback);

    async fn stat_fs(&self, ctx: &Ctx) -> Result<FsStat, MetaError>;

    /// Recursive usage accounting of a subtree.
    async fn summary(&self, ctx: &Ctx, ino: Ino) -> Result<Summary, MetaError>;

    async fn lookup(&self, ctx: &Ctx, parent: Ino, name: &str) -> Result<(Ino, Attr), MetaError>;

    async fn get_attr(&self, ctx: &Ctx, ino: Ino) -> Result<Attr, MetaError>;

    /// Apply the fields selected by `set`, returning the resulting
    /// attributes.
    async fn set_attr(
        &self,
        ctx: &Ctx,
        ino: Ino,
        set: SetAttrMask,
        attr: &Attr,
    ) -> Result<Attr, MetaError>;

    /// POSIX permission check; `mask` is an rwx bitmask (4/2/1).
    async fn access(&self, ctx: &Ctx, ino: Ino, mask: u8) -> Result<(), MetaError>;

    async fn truncate(&self, ctx: &Ctx, ino: Ino, length: u64) -> Result<Attr, MetaError>;

    async fn fallocate(
        &self,
        ctx: &Ctx,
        ino: Ino,
        mode: FallocFlags,
        off: u64,
        size: u64,
    ) -> Result<(), MetaError>;

    async fn read_link(&self, ctx: &Ctx, ino: Ino) -> Result<Bytes, MetaError>;

    async fn symlink(
        &self,
        ctx: &Ctx,
        parent: Ino,
        name: &str,
        target: &str,
    ) -> Result<(Ino, Attr), MetaError>;

    #[allow(clippy::too_many_arguments)]
    async fn mknod(
        &self,
        ctx: &Ctx,
        parent: Ino,
        name: &str,
        kind: FileKind,
        mode: u16,
        cumask: u16,
        rdev: u32,
    ) -> Result<(Ino, Attr), MetaError>;

    async fn mkdir(
        &self,
        ctx: &Ctx,
        parent: Ino,
        name: &str,
        mode: u16,
        cumask: u16,
    ) -> Result<(Ino, Attr), MetaError>;

    /// Create a regular file and account it as opened by this client.
    async fn create(
        &self,
        ctx: &Ctx,
        parent: Ino,
        name: &str,
        mode: u16,
        cumask: u16,
    ) -> Result<(Ino, Attr), MetaError>;

    async fn link(&self, ctx: &Ctx, ino: Ino, parent: Ino, name: &str) -> Result<Attr, MetaError>;

    async fn unlink(&self, ctx: &Ctx, parent: Ino, name: &str) -> Result<(), MetaError>;

    async fn rmdir(&self, ctx: &Ctx, parent: Ino, name: &str) -> Result<(), MetaError>;

    async fn rename(
        &self,
        ctx: &Ctx,
        parent_src: Ino,
        name_src: &str,
        parent_dst: Ino,
        name_dst: &str,
    ) -> Result<(Ino, Attr), MetaError>;

    /// List a directory. `plus` additionally hydrates full attributes for
    /// every entry.
    async fn readdir(&self, ctx: &Ctx, ino: Ino, plus: bool) -> Result<Vec<Entry>, MetaError>;

    /// Recursive remove of a name, directories included.
    async fn remove_all(&self, ctx: &Ctx, parent: Ino, name: &str) -> Result<(), MetaError>;

    async fn open(&self, ctx: &Ctx, ino: Ino) -> Result<Attr, MetaError>;

    async fn close(&self, ctx: &Ctx, ino: Ino) -> Result<(), MetaError>;

    /// Resolve one chunk of a file into its visible slices.
    async fn read(&self, ctx: &Ctx, ino: Ino, index: u32) -> Result<Vec<Slice>, MetaError>;

    /// Allocate a fresh data-plane chunk id.
    async fn new_chunk(&self, ctx: &Ctx) -> Result<u64, MetaError>;

    /// Record a flushed write of `slice` at `off` within chunk `index`.
    async fn write(
        &self,
        ctx: &Ctx,
        ino: Ino,
        index: u32,
        off: u32,
        slice: Slice,
    ) -> Result<(), MetaError>;

    /// Share the source byte range into the destination file without moving
    /// data; returns the number of bytes copied.
    #[allow(clippy::too_many_arguments)]
    async fn copy_file_range(
        &self,
        ctx: &Ctx,
        src: Ino,
        off_in: u64,
        dst: Ino,
        off_out: u64,
        size: u64,
        flags: u32,
    ) -> Result<u64, MetaError>;

    /// Every live slice of the volume, for offline verification tooling.
    async fn list_slices(&self, ctx: &Ctx) -> Result<Vec<Slice>, MetaError>;

    async fn get_xattr(&self, ctx: &Ctx, ino: Ino, name: &str) -> Result<Vec<u8>, MetaError>;

    /// NUL-separated xattr name list, listxattr(2) wire format.
    async fn list_xattr(&self, ctx: &Ctx, ino: Ino) -> Result<Vec<u8>, MetaError>;

    async fn set_xattr(&self, ctx: &Ctx, ino: Ino, name: &str, value: &[u8])
        -> Result<(), MetaError>;

    async fn remove_xattr(&self, ctx: &Ctx, ino: Ino, name: &str) -> Result<(), MetaError>;

    /// Whole-file advisory lock; EAGAIN on conflict, the bridge retries.
    async fn flock(&self, ctx: &Ctx, ino: Ino, owner: u64, kind: FlockKind)
        -> Result<(), MetaError>;

    /// F_GETLK: the first lock that would block `record`, if any. The pid is
    /// reported only for locks held by this session.
    async fn get_plock(
        &self,
        ctx: &Ctx,
        ino: Ino,
        owner: u64,
        record: PlockRecord,
    ) -> Result<Option<PlockRecord>, MetaError>;

    /// F_SETLK: apply a byte-range lock; EAGAIN on conflict.
    async fn set_plock(
        &self,
        ctx: &Ctx,
        ino: Ino,
        owner: u64,
        record: PlockRecord,
    ) -> Result<(), MetaError>;
}
