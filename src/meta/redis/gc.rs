//! Reference-counted reclamation: slice deletion, chunk log teardown and
//! the background sweepers.
//!
//! A slice's refcount key is absent while exactly one inode references it,
//! so a decrement that drives the value negative means "was 1, now 0": the
//! backing object is garbage. Failed data-plane deletions leave the negative
//! key in place for the orphan sweeper to retry.

use redis::AsyncCommands;
use std::sync::Weak;
use std::time::Duration;
use tracing::{debug, warn};

use crate::meta::codec::{align4k, decode_attr, decode_slice_log};
use crate::meta::error::MetaError;
use crate::meta::redis::{RedisMeta, DELFILES, USED_SPACE};
use crate::meta::store::Msg;
use crate::meta::types::{Ctx, Ino, Timestamp};

/// Chunk-log entries dereferenced per delete_chunk transaction.
const DELETE_BATCH: usize = 100;
/// Delfiles entries drained per sweeper pass.
const DELFILES_SWEEP_LIMIT: usize = 1000;
/// Age before a delfiles entry is eligible for physical deletion.
const DELFILES_SWEEP_AGE: i64 = 3600;
const DELFILES_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SLICE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
/// Grace period before the leaked-chunk scan after session start.
const LEAKED_SCAN_WARMUP: Duration = Duration::from_secs(10);

/// Parse a delfiles member "ino:length". Malformed lengths fall back to a
/// generous bound so the chunk walk still covers the file.
pub(crate) fn parse_del_tracking(member: &str) -> Option<(Ino, u64)> {
    let mut parts = member.split(':');
    let ino = parts.next()?.parse::<u64>().ok()?;
    let length = parts
        .next()
        .and_then(|l| l.parse::<u64>().ok())
        .unwrap_or(1 << 30);
    Some((ino, length))
}

/// Parse a refcount key "k{chunkid}_{size}".
pub(crate) fn parse_slice_key(key: &str) -> Option<(u64, u32)> {
    let rest = key.strip_prefix('k')?;
    let (id, size) = rest.split_once('_')?;
    Some((id.parse().ok()?, size.parse().ok()?))
}

/// Parse a chunk-log key "c{ino}_{index}".
pub(crate) fn parse_chunk_key(key: &str) -> Option<(Ino, u32)> {
    let rest = key.strip_prefix('c')?;
    let (ino, index) = rest.split_once('_')?;
    Some((ino.parse().ok()?, index.parse().ok()?))
}

impl RedisMeta {
    /// Physically remove one data-plane object and its refcount key. On
    /// message failure the key stays, and the orphan sweeper retries.
    pub(crate) async fn delete_slice(&self, chunk_id: u64, size: u32) {
        if chunk_id == 0 {
            return;
        }
        match self.send_msg(Msg::DeleteChunk { chunk_id, size }).await {
            Ok(()) => {
                let mut con = self.shared();
                let _: Result<i64, _> = con.del(self.slice_key(chunk_id, size)).await;
            }
            Err(err) => warn!("delete chunk {chunk_id} ({size} bytes): {err}"),
        }
    }

    /// Tear down one chunk log, dereferencing every slice it records.
    pub(crate) async fn delete_chunk(&self, ino: Ino, index: u32) -> Result<(), MetaError> {
        let chunk_key = self.chunk_key(ino, index);
        loop {
            let (garbage, fetched) = self
                .txn(&Ctx::background(), std::slice::from_ref(&chunk_key), |mut tx| {
                    let chunk_key = chunk_key.clone();
                    async move {
                        let raw = tx.lrange(&chunk_key, 0, DELETE_BATCH as isize - 1).await?;
                        if raw.is_empty() {
                            return Ok(Some((Vec::new(), 0)));
                        }
                        let targets: Vec<(u64, u32)> = decode_slice_log(&raw)
                            .iter()
                            .filter(|r| r.id > 0)
                            .map(|r| (r.id, r.size))
                            .collect();

                        let mut pipe = redis::pipe();
                        pipe.atomic();
                        for _ in 0..raw.len() {
                            pipe.cmd("LPOP").arg(&chunk_key).ignore();
                        }
                        for (id, size) in &targets {
                            pipe.cmd("DECR").arg(self.slice_key(*id, *size));
                        }
                        Ok(tx.commit::<Vec<i64>>(&pipe).await?.map(|decrs| {
                            let garbage: Vec<(u64, u32)> = targets
                                .iter()
                                .zip(decrs)
                                .filter(|(_, refs)| *refs < 0)
                                .map(|(t, _)| *t)
                                .collect();
                            (garbage, raw.len())
                        }))
                    }
                })
                .await?;

            for (id, size) in garbage {
                self.delete_slice(id, size).await;
            }
            if fetched < DELETE_BATCH {
                return Ok(());
            }
        }
    }

    /// Delete every chunk of a removed file, then drop its delfiles entry.
    pub(crate) async fn delete_file(&self, ino: Ino, length: u64, tracking: Option<String>) {
        let chunk_size = self.chunk_size();
        let mut con = self.shared();
        let mut index: u64 = 0;
        while index * chunk_size < length {
            let mut batch = Vec::new();
            let mut pipe = redis::pipe();
            while index * chunk_size < length && batch.len() < 1000 {
                pipe.cmd("LLEN").arg(self.chunk_key(ino, index as u32));
                batch.push(index as u32);
                index += 1;
            }
            let lens: Vec<i64> = match pipe.query_async(&mut con).await {
                Ok(lens) => lens,
                Err(err) => {
                    warn!("delete chunks of inode {ino}: {err}");
                    return;
                }
            };
            for (chunk_index, len) in batch.into_iter().zip(lens) {
                if len == 0 {
                    continue;
                }
                if let Err(err) = self.delete_chunk(ino, chunk_index).await {
                    warn!("delete chunk c{ino}_{chunk_index}: {err}, retry later");
                    return;
                }
            }
        }
        let tracking = tracking.unwrap_or_else(|| self.del_tracking(ino, length));
        let _: Result<i64, _> = con.zrem(DELFILES, tracking).await;
    }

    pub(crate) fn spawn_delete_file(&self, ino: Ino, length: u64, tracking: Option<String>) {
        if let Some(me) = self.me.upgrade() {
            tokio::spawn(async move {
                me.delete_file(ino, length, tracking).await;
            });
        }
    }

    /// Move an unlinked inode's record into the delfiles queue and start
    /// deleting its chunks. Used when a sustained inode is finally closed or
    /// its session dies.
    pub(crate) async fn delete_inode(&self, ino: Ino) -> Result<(), MetaError> {
        let mut con = self.shared();
        let buf: Option<Vec<u8>> = con.get(self.inode_key(ino)).await?;
        let Some(buf) = buf else {
            return Ok(());
        };
        let attr = decode_attr(&buf)?;
        let now = Timestamp::now();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("ZADD")
            .arg(DELFILES)
            .arg(now.secs)
            .arg(self.del_tracking(ino, attr.length))
            .ignore();
        pipe.del(self.inode_key(ino)).ignore();
        pipe.incr(USED_SPACE, -align4k(attr.length)).ignore();
        let _: () = pipe.query_async(&mut con).await?;

        self.spawn_delete_file(ino, attr.length, None);
        Ok(())
    }

    /// Every minute, physically delete files that have sat in the delayed
    /// queue for over an hour.
    pub(crate) async fn cleanup_deleted_files_loop(me: Weak<RedisMeta>) {
        loop {
            tokio::time::sleep(DELFILES_SWEEP_INTERVAL).await;
            let Some(me) = me.upgrade() else {
                return;
            };
            let cutoff = chrono::Utc::now().timestamp() - DELFILES_SWEEP_AGE;
            let mut con = me.shared();
            let members: Vec<String> = match redis::cmd("ZRANGEBYSCORE")
                .arg(DELFILES)
                .arg(0)
                .arg(cutoff)
                .arg("LIMIT")
                .arg(0)
                .arg(DELFILES_SWEEP_LIMIT)
                .query_async(&mut con)
                .await
            {
                Ok(members) => members,
                Err(err) => {
                    warn!("scan delfiles: {err}");
                    continue;
                }
            };
            for member in members {
                let Some((ino, length)) = parse_del_tracking(&member) else {
                    warn!("invalid delfiles member {member:?}");
                    continue;
                };
                debug!("cleanup chunks of inode {ino} with {length} bytes ({member})");
                me.delete_file(ino, length, Some(member)).await;
            }
        }
    }

    /// Hourly: physically delete slices whose refcount went negative while
    /// the owning client was unable to.
    pub(crate) async fn cleanup_slices_loop(me: Weak<RedisMeta>) {
        loop {
            tokio::time::sleep(SLICE_SWEEP_INTERVAL).await;
            let Some(me) = me.upgrade() else {
                return;
            };
            me.sweep_orphan_slices().await;
        }
    }

    async fn sweep_orphan_slices(&self) {
        let mut con = self.shared();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = match redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("k*")
                .arg("COUNT")
                .arg(1000)
                .query_async(&mut con)
                .await
            {
                Ok(reply) => reply,
                Err(err) => {
                    warn!("scan slices: {err}");
                    return;
                }
            };
            if !keys.is_empty() {
                let mut cmd = redis::cmd("MGET");
                for key in &keys {
                    cmd.arg(key);
                }
                let values: Vec<Option<String>> = match cmd.query_async(&mut con).await {
                    Ok(values) => values,
                    Err(err) => {
                        warn!("mget slices: {err}");
                        continue;
                    }
                };
                for (key, value) in keys.iter().zip(values) {
                    if let Some(value) = value
                        && value.starts_with('-')
                        && let Some((chunk_id, size)) = parse_slice_key(key)
                        && chunk_id > 0
                        && size > 0
                    {
                        self.delete_slice(chunk_id, size).await;
                    }
                }
            }
            if next == 0 {
                return;
            }
            cursor = next;
        }
    }

    /// One pass per session: find chunk logs whose inode is gone (crash
    /// between the inode delete and the chunk teardown) and reclaim them.
    pub(crate) async fn cleanup_leaked_chunks(me: Weak<RedisMeta>) {
        tokio::time::sleep(LEAKED_SCAN_WARMUP).await;
        let Some(me) = me.upgrade() else {
            return;
        };
        let mut con = me.shared();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = match redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("c*")
                .arg("COUNT")
                .arg(1000)
                .query_async(&mut con)
                .await
            {
                Ok(reply) => reply,
                Err(err) => {
                    warn!("scan all chunks: {err}");
                    return;
                }
            };

            let mut chunks = Vec::new();
            let mut pipe = redis::pipe();
            for key in &keys {
                if let Some((ino, index)) = parse_chunk_key(key) {
                    pipe.cmd("EXISTS").arg(me.inode_key(ino));
                    chunks.push((ino, index));
                }
            }
            if !chunks.is_empty() {
                let exists: Vec<i64> = match pipe.query_async(&mut con).await {
                    Ok(exists) => exists,
                    Err(err) => {
                        warn!("check inodes: {err}");
                        return;
                    }
                };
                for ((ino, index), alive) in chunks.into_iter().zip(exists) {
                    if alive == 0 {
                        debug!("found leaked chunk c{ino}_{index}");
                        let _ = me.delete_chunk(ino, index).await;
                    }
                }
            }
            if next == 0 {
                return;
            }
            cursor = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn del_tracking_parsing() {
        assert_eq!(parse_del_tracking("42:4096"), Some((42, 4096)));
        assert_eq!(parse_del_tracking("42"), Some((42, 1 << 30)));
        assert_eq!(parse_del_tracking("42:bogus"), Some((42, 1 << 30)));
        assert_eq!(parse_del_tracking("nope"), None);
    }

    #[test]
    fn slice_key_parsing() {
        assert_eq!(parse_slice_key("k100_4096"), Some((100, 4096)));
        assert_eq!(parse_slice_key("k100"), None);
        assert_eq!(parse_slice_key("c100_1"), None);
    }

    #[test]
    fn chunk_key_parsing() {
        assert_eq!(parse_chunk_key("c7_3"), Some((7, 3)));
        assert_eq!(parse_chunk_key("c7"), None);
        assert_eq!(parse_chunk_key("k7_3"), None);
    }
}
