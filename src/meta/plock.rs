//! POSIX byte-range lock arithmetic.
//!
//! Each lock owner stores one ordered list of non-overlapping records in the
//! `lockp{ino}` hash. Applying a new lock replaces whatever the owner held
//! over that range, splitting survivors at the edges and merging adjacent
//! same-type runs, which is exactly the fcntl(2) upgrade/downgrade/unlock
//! semantics. An end of `u64::MAX` means "to end of file".

use bytes::{Buf, BufMut};

use crate::meta::error::MetaError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PlockType {
    Read = libc::F_RDLCK as u32,
    Write = libc::F_WRLCK as u32,
    Unlock = libc::F_UNLCK as u32,
}

impl PlockType {
    pub fn from_u32(value: u32) -> Result<Self, MetaError> {
        match value {
            x if x == PlockType::Read as u32 => Ok(PlockType::Read),
            x if x == PlockType::Write as u32 => Ok(PlockType::Write),
            x if x == PlockType::Unlock as u32 => Ok(PlockType::Unlock),
            _ => Err(MetaError::Invalid),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlockRecord {
    pub kind: PlockType,
    pub pid: u32,
    pub start: u64,
    /// Exclusive; `u64::MAX` means end of file.
    pub end: u64,
}

const PLOCK_REC_BYTES: usize = 24;

impl PlockRecord {
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.end > start && self.start < end
    }

    pub fn encode_list(records: &[PlockRecord]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(records.len() * PLOCK_REC_BYTES);
        for r in records {
            buf.put_u32(r.kind as u32);
            buf.put_u32(r.pid);
            buf.put_u64(r.start);
            buf.put_u64(r.end);
        }
        buf
    }

    pub fn decode_list(mut buf: &[u8]) -> Result<Vec<PlockRecord>, MetaError> {
        if buf.len() % PLOCK_REC_BYTES != 0 {
            return Err(MetaError::Io(format!(
                "invalid lock record list of {} bytes",
                buf.len()
            )));
        }
        let mut records = Vec::with_capacity(buf.len() / PLOCK_REC_BYTES);
        while buf.has_remaining() {
            records.push(PlockRecord {
                kind: PlockType::from_u32(buf.get_u32())?,
                pid: buf.get_u32(),
                start: buf.get_u64(),
                end: buf.get_u64(),
            });
        }
        Ok(records)
    }
}

/// Apply `nl` to one owner's lock list, returning the new list. The new
/// lock's range unconditionally replaces the owner's previous state there;
/// an Unlock record simply leaves the range uncovered.
pub fn update_locks(ls: &[PlockRecord], nl: PlockRecord) -> Vec<PlockRecord> {
    let mut out: Vec<PlockRecord> = Vec::with_capacity(ls.len() + 2);
    for l in ls {
        if l.end <= nl.start || l.start >= nl.end {
            out.push(*l);
            continue;
        }
        if l.start < nl.start {
            out.push(PlockRecord { end: nl.start, ..*l });
        }
        if l.end > nl.end {
            out.push(PlockRecord {
                start: nl.end,
                ..*l
            });
        }
    }
    if nl.kind != PlockType::Unlock && nl.start < nl.end {
        out.push(nl);
    }
    out.sort_by_key(|r| r.start);

    let mut merged: Vec<PlockRecord> = Vec::with_capacity(out.len());
    for r in out {
        if let Some(last) = merged.last_mut()
            && last.kind == r.kind
            && last.pid == r.pid
            && last.end == r.start
        {
            last.end = r.end;
            continue;
        }
        merged.push(r);
    }
    merged
}

/// Would a lock of `kind` over `[start, end)` conflict with another owner's
/// records? Two read locks never conflict.
pub fn conflicts(kind: PlockType, start: u64, end: u64, others: &[PlockRecord]) -> bool {
    others.iter().any(|l| {
        (kind == PlockType::Write || l.kind == PlockType::Write) && l.overlaps(start, end)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(kind: PlockType, start: u64, end: u64) -> PlockRecord {
        PlockRecord {
            kind,
            pid: 7,
            start,
            end,
        }
    }

    #[test]
    fn unlock_middle_splits() {
        let held = vec![rec(PlockType::Write, 0, 100)];
        let after = update_locks(&held, rec(PlockType::Unlock, 40, 60));
        assert_eq!(
            after,
            vec![rec(PlockType::Write, 0, 40), rec(PlockType::Write, 60, 100)]
        );
    }

    #[test]
    fn downgrade_overlap() {
        let held = vec![rec(PlockType::Write, 0, 100)];
        let after = update_locks(&held, rec(PlockType::Read, 50, 150));
        assert_eq!(
            after,
            vec![rec(PlockType::Write, 0, 50), rec(PlockType::Read, 50, 150)]
        );
    }

    #[test]
    fn adjacent_same_type_merges() {
        let held = vec![rec(PlockType::Read, 0, 50)];
        let after = update_locks(&held, rec(PlockType::Read, 50, 100));
        assert_eq!(after, vec![rec(PlockType::Read, 0, 100)]);
    }

    #[test]
    fn unlock_everything_empties_list() {
        let held = vec![rec(PlockType::Read, 0, 10), rec(PlockType::Write, 20, 30)];
        let after = update_locks(&held, rec(PlockType::Unlock, 0, u64::MAX));
        assert!(after.is_empty());
    }

    #[test]
    fn read_read_is_compatible() {
        let others = vec![rec(PlockType::Read, 0, 100)];
        assert!(!conflicts(PlockType::Read, 50, 80, &others));
        assert!(conflicts(PlockType::Write, 50, 80, &others));
        assert!(conflicts(PlockType::Read, 50, 80, &[rec(PlockType::Write, 0, 100)]));
        assert!(!conflicts(PlockType::Write, 100, 200, &others));
    }

    #[test]
    fn record_list_roundtrip() {
        let list = vec![rec(PlockType::Read, 0, 10), rec(PlockType::Write, 10, u64::MAX)];
        let buf = PlockRecord::encode_list(&list);
        assert_eq!(buf.len(), 2 * PLOCK_REC_BYTES);
        assert_eq!(PlockRecord::decode_list(&buf).unwrap(), list);
        assert!(PlockRecord::decode_list(&buf[..10]).is_err());
    }
}
