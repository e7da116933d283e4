//! Value types shared across the metadata engine.

use bitflags::bitflags;
use std::time::{Duration, Instant};

use crate::meta::error::MetaError;

/// Inode number. The root directory is always inode 1.
pub type Ino = u64;

pub const ROOT_INO: Ino = 1;

/// Default chunk size when the volume format does not carry one.
pub const CHUNK_SIZE: u64 = 1 << 26;

/// Filesystem object kinds. The numeric values are part of the on-disk
/// entry/attribute encoding and must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FileKind {
    #[default]
    Regular = 1,
    Directory = 2,
    Symlink = 3,
    Fifo = 4,
    BlockDev = 5,
    CharDev = 6,
    Socket = 7,
}

impl FileKind {
    pub fn from_u8(value: u8) -> Result<Self, MetaError> {
        match value {
            1 => Ok(FileKind::Regular),
            2 => Ok(FileKind::Directory),
            3 => Ok(FileKind::Symlink),
            4 => Ok(FileKind::Fifo),
            5 => Ok(FileKind::BlockDev),
            6 => Ok(FileKind::CharDev),
            7 => Ok(FileKind::Socket),
            _ => Err(MetaError::Io(format!("unknown file kind {value}"))),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FileKind::Directory)
    }
}

/// Inode attributes as persisted under the `i{ino}` key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Attr {
    pub flags: u8,
    pub kind: FileKind,
    /// Permission bits only (the kind is packed separately on the wire).
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub atime_ns: u32,
    pub mtime: i64,
    pub mtime_ns: u32,
    pub ctime: i64,
    pub ctime_ns: u32,
    pub nlink: u32,
    pub length: u64,
    pub rdev: u32,
    /// Directory hint: the parent at creation time, updated on rename.
    pub parent: Ino,
}

impl Attr {
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Stamp both mtime and ctime with `now`.
    pub fn touch_mtime(&mut self, now: Timestamp) {
        self.mtime = now.secs;
        self.mtime_ns = now.nanos;
        self.ctime = now.secs;
        self.ctime_ns = now.nanos;
    }

    /// Stamp ctime only; every metadata mutation does at least this.
    pub fn touch_ctime(&mut self, now: Timestamp) {
        self.ctime = now.secs;
        self.ctime_ns = now.nanos;
    }
}

/// Wall-clock second/nanosecond pair used for inode timestamps.
#[derive(Clone, Copy, Debug)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self {
            secs: now.timestamp(),
            nanos: now.timestamp_subsec_nanos(),
        }
    }
}

/// One readdir entry. `attr` is fully hydrated only in readdir-plus mode;
/// otherwise just the kind is filled from the entry record.
#[derive(Clone, Debug)]
pub struct Entry {
    pub ino: Ino,
    pub name: String,
    pub attr: Attr,
}

/// A contiguous byte range within a chunk, sourced from one data-plane
/// object. `id` 0 denotes a zero-filled hole of `len` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Slice {
    pub id: u64,
    /// Declared size of the backing object.
    pub size: u32,
    /// Offset of the visible range within the backing object.
    pub off: u32,
    /// Visible length in bytes.
    pub len: u32,
}

/// Recursive directory usage accounting returned by `summary`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub length: u64,
    pub size: u64,
    pub files: u64,
    pub dirs: u64,
}

/// statfs snapshot. `used_space` is a drift-tolerant hint, not an audit.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsStat {
    pub total_space: u64,
    pub avail_space: u64,
    pub used_inodes: u64,
    pub avail_inodes: u64,
}

bitflags! {
    /// Which fields of a `set_attr` request are to be applied.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SetAttrMask: u16 {
        const MODE      = 1 << 0;
        const UID       = 1 << 1;
        const GID       = 1 << 2;
        const ATIME     = 1 << 4;
        const MTIME     = 1 << 5;
        const ATIME_NOW = 1 << 7;
        const MTIME_NOW = 1 << 8;
    }
}

bitflags! {
    /// fallocate(2) mode bits understood by the engine.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FallocFlags: u8 {
        const KEEP_SIZE      = 0x01;
        const PUNCH_HOLE     = 0x02;
        const COLLAPSE_RANGE = 0x08;
        const ZERO_RANGE     = 0x10;
        const INSERT_RANGE   = 0x20;
    }
}

/// Whole-file advisory lock request kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlockKind {
    Shared,
    Exclusive,
    Unlock,
}

/// Caller-tagged compatibility behavior. Hadoop clients expect rename to
/// refuse overwrites and new inodes to inherit the parent gid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Behavior {
    #[default]
    Posix,
    Hadoop,
}

/// Per-call context: caller identity plus an optional deadline observed at
/// every transaction attempt.
#[derive(Clone, Debug, Default)]
pub struct Ctx {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub behavior: Behavior,
    deadline: Option<Instant>,
}

impl Ctx {
    pub fn new(uid: u32, gid: u32, pid: u32) -> Self {
        Self {
            uid,
            gid,
            pid,
            ..Default::default()
        }
    }

    /// Context for engine-internal background work: root identity, no
    /// deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn is_hadoop(&self) -> bool {
        self.behavior == Behavior::Hadoop
    }

    /// Fails with EINTR once the deadline has passed.
    pub fn check_deadline(&self) -> Result<(), MetaError> {
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(MetaError::Interrupted),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_roundtrip() {
        for kind in [
            FileKind::Regular,
            FileKind::Directory,
            FileKind::Symlink,
            FileKind::Fifo,
            FileKind::BlockDev,
            FileKind::CharDev,
            FileKind::Socket,
        ] {
            assert_eq!(FileKind::from_u8(kind as u8).unwrap(), kind);
        }
        assert!(FileKind::from_u8(0).is_err());
        assert!(FileKind::from_u8(8).is_err());
    }

    #[test]
    fn deadline_expiry() {
        let ctx = Ctx::new(1000, 1000, 1);
        assert!(ctx.check_deadline().is_ok());

        let expired = ctx.clone().with_timeout(Duration::from_secs(0));
        assert!(matches!(
            expired.check_deadline(),
            Err(MetaError::Interrupted)
        ));
    }
}
