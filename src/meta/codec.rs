//! Fixed-width big-endian encoding of the records stored in the KV store.
//!
//! The formats are deliberately schema-free so that server-side scripts can
//! parse them and so a whole attribute blob fits one round trip:
//!
//! ```text
//! attr  (71 B): flags u8 | kind<<12|mode u16 | uid u32 | gid u32
//!               | atime u64 | atime_ns u32 | mtime u64 | mtime_ns u32
//!               | ctime u64 | ctime_ns u32 | nlink u32 | length u64
//!               | rdev u32 | parent u64
//! entry  (9 B): kind u8 | child ino u64
//! slice (24 B): in-chunk pos u32 | chunk id u64 | size u32 | off u32 | len u32
//! ```
//!
//! The parent field is optional on decode so blobs written before it existed
//! still parse.

use bytes::{Buf, BufMut};

use crate::meta::error::MetaError;
use crate::meta::types::{Attr, FileKind, Ino};

/// One record of a chunk's slice log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SliceRec {
    /// Offset of the write within the chunk.
    pub pos: u32,
    /// Backing object id; 0 denotes a hole.
    pub id: u64,
    /// Declared size of the backing object.
    pub size: u32,
    /// Offset within the backing object.
    pub off: u32,
    /// Length of the written range.
    pub len: u32,
}

pub const SLICE_REC_BYTES: usize = 24;
pub const ENTRY_BYTES: usize = 9;

pub fn encode_attr(attr: &Attr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(71);
    buf.put_u8(attr.flags);
    buf.put_u16(((attr.kind as u16) << 12) | (attr.mode & 0o7777));
    buf.put_u32(attr.uid);
    buf.put_u32(attr.gid);
    buf.put_u64(attr.atime as u64);
    buf.put_u32(attr.atime_ns);
    buf.put_u64(attr.mtime as u64);
    buf.put_u32(attr.mtime_ns);
    buf.put_u64(attr.ctime as u64);
    buf.put_u32(attr.ctime_ns);
    buf.put_u32(attr.nlink);
    buf.put_u64(attr.length);
    buf.put_u32(attr.rdev);
    buf.put_u64(attr.parent);
    buf
}

pub fn decode_attr(mut buf: &[u8]) -> Result<Attr, MetaError> {
    // 63 bytes of fixed fields, then the optional parent.
    if buf.len() < 63 {
        return Err(MetaError::Io(format!("attr blob too short: {}", buf.len())));
    }
    let mut attr = Attr {
        flags: buf.get_u8(),
        ..Default::default()
    };
    let packed = buf.get_u16();
    attr.kind = FileKind::from_u8((packed >> 12) as u8)?;
    attr.mode = packed & 0o7777;
    attr.uid = buf.get_u32();
    attr.gid = buf.get_u32();
    attr.atime = buf.get_u64() as i64;
    attr.atime_ns = buf.get_u32();
    attr.mtime = buf.get_u64() as i64;
    attr.mtime_ns = buf.get_u32();
    attr.ctime = buf.get_u64() as i64;
    attr.ctime_ns = buf.get_u32();
    attr.nlink = buf.get_u32();
    attr.length = buf.get_u64();
    attr.rdev = buf.get_u32();
    if buf.remaining() >= 8 {
        attr.parent = buf.get_u64();
    }
    Ok(attr)
}

pub fn encode_entry(kind: FileKind, ino: Ino) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ENTRY_BYTES);
    buf.put_u8(kind as u8);
    buf.put_u64(ino);
    buf
}

pub fn decode_entry(mut buf: &[u8]) -> Result<(FileKind, Ino), MetaError> {
    if buf.len() != ENTRY_BYTES {
        return Err(MetaError::Io(format!(
            "invalid entry record of {} bytes",
            buf.len()
        )));
    }
    let kind = FileKind::from_u8(buf.get_u8())?;
    Ok((kind, buf.get_u64()))
}

impl SliceRec {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SLICE_REC_BYTES);
        buf.put_u32(self.pos);
        buf.put_u64(self.id);
        buf.put_u32(self.size);
        buf.put_u32(self.off);
        buf.put_u32(self.len);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, MetaError> {
        if buf.len() != SLICE_REC_BYTES {
            return Err(MetaError::Io(format!(
                "invalid slice record of {} bytes",
                buf.len()
            )));
        }
        Ok(SliceRec {
            pos: buf.get_u32(),
            id: buf.get_u64(),
            size: buf.get_u32(),
            off: buf.get_u32(),
            len: buf.get_u32(),
        })
    }
}

/// Decode a chunk log as fetched by LRANGE; records that fail to parse are
/// skipped so one corrupt entry cannot wedge reads of the whole chunk.
pub fn decode_slice_log(raw: &[Vec<u8>]) -> Vec<SliceRec> {
    raw.iter()
        .filter_map(|buf| SliceRec::decode(buf).ok())
        .collect()
}

/// Space accounting granularity: file lengths rounded up to 4 KiB.
pub fn align4k(length: u64) -> i64 {
    if length == 0 {
        return 0;
    }
    ((((length - 1) >> 12) + 1) << 12) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_roundtrip() {
        let attr = Attr {
            flags: 3,
            kind: FileKind::Regular,
            mode: 0o4755,
            uid: 1000,
            gid: 100,
            atime: 1_700_000_000,
            atime_ns: 12,
            mtime: 1_700_000_001,
            mtime_ns: 34,
            ctime: 1_700_000_002,
            ctime_ns: 56,
            nlink: 2,
            length: 4096,
            rdev: 0,
            parent: 7,
        };
        let buf = encode_attr(&attr);
        assert_eq!(buf.len(), 71);
        assert_eq!(decode_attr(&buf).unwrap(), attr);
    }

    #[test]
    fn attr_without_parent_still_parses() {
        let attr = Attr {
            kind: FileKind::Directory,
            mode: 0o755,
            nlink: 2,
            parent: 9,
            ..Default::default()
        };
        let buf = encode_attr(&attr);
        let decoded = decode_attr(&buf[..63]).unwrap();
        assert_eq!(decoded.parent, 0);
        assert_eq!(decoded.kind, FileKind::Directory);
        assert_eq!(decoded.mode, 0o755);
    }

    #[test]
    fn entry_roundtrip() {
        let buf = encode_entry(FileKind::Symlink, 42);
        assert_eq!(buf.len(), ENTRY_BYTES);
        assert_eq!(decode_entry(&buf).unwrap(), (FileKind::Symlink, 42));
        assert!(decode_entry(&buf[..8]).is_err());
    }

    #[test]
    fn slice_rec_roundtrip() {
        let rec = SliceRec {
            pos: 8192,
            id: 100,
            size: 65536,
            off: 4096,
            len: 61440,
        };
        let buf = rec.encode();
        assert_eq!(buf.len(), SLICE_REC_BYTES);
        assert_eq!(SliceRec::decode(&buf).unwrap(), rec);
    }

    #[test]
    fn corrupt_log_entries_are_skipped() {
        let good = SliceRec {
            pos: 0,
            id: 1,
            size: 10,
            off: 0,
            len: 10,
        };
        let raw = vec![good.encode(), vec![1, 2, 3]];
        assert_eq!(decode_slice_log(&raw), vec![good]);
    }

    #[test]
    fn align4k_rounds_up() {
        assert_eq!(align4k(0), 0);
        assert_eq!(align4k(1), 4096);
        assert_eq!(align4k(4096), 4096);
        assert_eq!(align4k(4097), 8192);
        assert_eq!(align4k(10 << 20), 10 << 20);
    }
}
