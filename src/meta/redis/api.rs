//! [`Meta`] trait wiring. The operations themselves are inherent methods
//! grouped by concern in the sibling modules; this impl only exists so the
//! bridge can hold the engine as a `dyn Meta`.

use async_trait::async_trait;
use bytes::Bytes;

use crate::meta::error::MetaError;
use crate::meta::format::Format;
use crate::meta::plock::PlockRecord;
use crate::meta::redis::RedisMeta;
use crate::meta::store::{Meta, MsgCallback, MsgKind};
use crate::meta::types::{
    Attr, Ctx, Entry, FallocFlags, FileKind, FlockKind, FsStat, Ino, SetAttrMask, Slice, Summary,
};

#[async_trait]
impl Meta for RedisMeta {
    async fn init(&self, format: Format, force: bool) -> Result<(), MetaError> {
        RedisMeta::init(self, format, force).await
    }

    async fn load(&self) -> Result<Format, MetaError> {
        RedisMeta::load(self).await
    }

    async fn new_session(&self) -> Result<(), MetaError> {
        RedisMeta::new_session(self).await
    }

    fn on_msg(&self, kind: MsgKind, cb: MsgCallback) {
        RedisMeta::on_msg(self, kind, cb)
    }

    async fn stat_fs(&self, ctx: &Ctx) -> Result<FsStat, MetaError> {
        RedisMeta::stat_fs(self, ctx).await
    }

    async fn summary(&self, ctx: &Ctx, ino: Ino) -> Result<Summary, MetaError> {
        RedisMeta::summary(self, ctx, ino).await
    }

    async fn lookup(&self, ctx: &Ctx, parent: Ino, name: &str) -> Result<(Ino, Attr), MetaError> {
        RedisMeta::lookup(self, ctx, parent, name).await
    }

    async fn get_attr(&self, ctx: &Ctx, ino: Ino) -> Result<Attr, MetaError> {
        RedisMeta::get_attr(self, ctx, ino).await
    }

    async fn set_attr(
        &self,
        ctx: &Ctx,
        ino: Ino,
        set: SetAttrMask,
        attr: &Attr,
    ) -> Result<Attr, MetaError> {
        RedisMeta::set_attr(self, ctx, ino, set, attr).await
    }

    async fn access(&self, ctx: &Ctx, ino: Ino, mask: u8) -> Result<(), MetaError> {
        RedisMeta::access(self, ctx, ino, mask).await
    }

    async fn truncate(&self, ctx: &Ctx, ino: Ino, length: u64) -> Result<Attr, MetaError> {
        RedisMeta::truncate(self, ctx, ino, length).await
    }

    async fn fallocate(
        &self,
        ctx: &Ctx,
        ino: Ino,
        mode: FallocFlags,
        off: u64,
        size: u64,
    ) -> Result<(), MetaError> {
        RedisMeta::fallocate(self, ctx, ino, mode, off, size).await
    }

    async fn read_link(&self, ctx: &Ctx, ino: Ino) -> Result<Bytes, MetaError> {
        RedisMeta::read_link(self, ctx, ino).await
    }

    async fn symlink(
        &self,
        ctx: &Ctx,
        parent: Ino,
        name: &str,
        target: &str,
    ) -> Result<(Ino, Attr), MetaError> {
        RedisMeta::symlink(self, ctx, parent, name, target).await
    }

    async fn mknod(
        &self,
        ctx: &Ctx,
        parent: Ino,
        name: &str,
        kind: FileKind,
        mode: u16,
        cumask: u16,
        rdev: u32,
    ) -> Result<(Ino, Attr), MetaError> {
        RedisMeta::mknod(self, ctx, parent, name, kind, mode, cumask, rdev).await
    }

    async fn mkdir(
        &self,
        ctx: &Ctx,
        parent: Ino,
        name: &str,
        mode: u16,
        cumask: u16,
    ) -> Result<(Ino, Attr), MetaError> {
        RedisMeta::mkdir(self, ctx, parent, name, mode, cumask).await
    }

    async fn create(
        &self,
        ctx: &Ctx,
        parent: Ino,
        name: &str,
        mode: u16,
        cumask: u16,
    ) -> Result<(Ino, Attr), MetaError> {
        RedisMeta::create(self, ctx, parent, name, mode, cumask).await
    }

    async fn link(&self, ctx: &Ctx, ino: Ino, parent: Ino, name: &str) -> Result<Attr, MetaError> {
        RedisMeta::link(self, ctx, ino, parent, name).await
    }

    async fn unlink(&self, ctx: &Ctx, parent: Ino, name: &str) -> Result<(), MetaError> {
        RedisMeta::unlink(self, ctx, parent, name).await
    }

    async fn rmdir(&self, ctx: &Ctx, parent: Ino, name: &str) -> Result<(), MetaError> {
        RedisMeta::rmdir(self, ctx, parent, name).await
    }

    async fn rename(
        &self,
        ctx: &Ctx,
        parent_src: Ino,
        name_src: &str,
        parent_dst: Ino,
        name_dst: &str,
    ) -> Result<(Ino, Attr), MetaError> {
        RedisMeta::rename(self, ctx, parent_src, name_src, parent_dst, name_dst).await
    }

    async fn readdir(&self, ctx: &Ctx, ino: Ino, plus: bool) -> Result<Vec<Entry>, MetaError> {
        RedisMeta::readdir(self, ctx, ino, plus).await
    }

    async fn remove_all(&self, ctx: &Ctx, parent: Ino, name: &str) -> Result<(), MetaError> {
        RedisMeta::remove_all(self, ctx, parent, name).await
    }

    async fn open(&self, ctx: &Ctx, ino: Ino) -> Result<Attr, MetaError> {
        RedisMeta::open_file(self, ctx, ino).await
    }

    async fn close(&self, ctx: &Ctx, ino: Ino) -> Result<(), MetaError> {
        RedisMeta::close(self, ctx, ino).await
    }

    async fn read(&self, ctx: &Ctx, ino: Ino, index: u32) -> Result<Vec<Slice>, MetaError> {
        RedisMeta::read(self, ctx, ino, index).await
    }

    async fn new_chunk(&self, ctx: &Ctx) -> Result<u64, MetaError> {
        RedisMeta::new_chunk(self, ctx).await
    }

    async fn write(
        &self,
        ctx: &Ctx,
        ino: Ino,
        index: u32,
        off: u32,
        slice: Slice,
    ) -> Result<(), MetaError> {
        RedisMeta::write(self, ctx, ino, index, off, slice).await
    }

    async fn copy_file_range(
        &self,
        ctx: &Ctx,
        src: Ino,
        off_in: u64,
        dst: Ino,
        off_out: u64,
        size: u64,
        flags: u32,
    ) -> Result<u64, MetaError> {
        RedisMeta::copy_file_range(self, ctx, src, off_in, dst, off_out, size, flags).await
    }

    async fn list_slices(&self, ctx: &Ctx) -> Result<Vec<Slice>, MetaError> {
        RedisMeta::list_slices(self, ctx).await
    }

    async fn get_xattr(&self, ctx: &Ctx, ino: Ino, name: &str) -> Result<Vec<u8>, MetaError> {
        RedisMeta::get_xattr(self, ctx, ino, name).await
    }

    async fn list_xattr(&self, ctx: &Ctx, ino: Ino) -> Result<Vec<u8>, MetaError> {
        RedisMeta::list_xattr(self, ctx, ino).await
    }

    async fn set_xattr(
        &self,
        ctx: &Ctx,
        ino: Ino,
        name: &str,
        value: &[u8],
    ) -> Result<(), MetaError> {
        RedisMeta::set_xattr(self, ctx, ino, name, value).await
    }

    async fn remove_xattr(&self, ctx: &Ctx, ino: Ino, name: &str) -> Result<(), MetaError> {
        RedisMeta::remove_xattr(self, ctx, ino, name).await
    }

    async fn flock(
        &self,
        ctx: &Ctx,
        ino: Ino,
        owner: u64,
        kind: FlockKind,
    ) -> Result<(), MetaError> {
        RedisMeta::flock(self, ctx, ino, owner, kind).await
    }

    async fn get_plock(
        &self,
        ctx: &Ctx,
        ino: Ino,
        owner: u64,
        record: PlockRecord,
    ) -> Result<Option<PlockRecord>, MetaError> {
        RedisMeta::get_plock(self, ctx, ino, owner, record).await
    }

    async fn set_plock(
        &self,
        ctx: &Ctx,
        ino: Ino,
        owner: u64,
        record: PlockRecord,
    ) -> Result<(), MetaError> {
        RedisMeta::set_plock(self, ctx, ino, owner, record).await
    }
}
