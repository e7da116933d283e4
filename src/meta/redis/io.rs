//! Chunk/slice log operations: write-path appends, read-side resolution,
//! copy_file_range reprojection and background compaction.

use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, warn};

use crate::meta::codec::{align4k, decode_attr, decode_slice_log, encode_attr, SliceRec};
use crate::meta::error::MetaError;
use crate::meta::overlay::build_slices;
use crate::meta::redis::{RedisMeta, NEXT_CHUNK, USED_SPACE};
use crate::meta::store::Msg;
use crate::meta::types::{Ctx, FileKind, Ino, Slice, Timestamp};

/// Upper bound on log entries considered by one read.
const READ_LOG_LIMIT: isize = 1_000_000;
/// Log entries folded by one compaction pass.
const COMPACT_BATCH: isize = 200;
/// Reads seeing this many raw entries schedule a compaction.
const COMPACT_READ_THRESHOLD: usize = 5;
/// Every Nth append on a chunk schedules a compaction.
const COMPACT_APPEND_EVERY: i64 = 20;
/// Concurrent compactions per engine instance.
const COMPACT_MAX_INFLIGHT: usize = 10;

enum CompactOutcome {
    Done,
    /// The log kept growing while we compacted; go around again.
    Rerun,
}

impl RedisMeta {
    pub async fn read(&self, ctx: &Ctx, ino: Ino, index: u32) -> Result<Vec<Slice>, MetaError> {
        ctx.check_deadline()?;
        let mut con = self.shared();
        let raw: Vec<Vec<u8>> = con
            .lrange(self.chunk_key(ino, index), 0, READ_LOG_LIMIT)
            .await?;
        let slices = build_slices(&decode_slice_log(&raw));
        if raw.len() >= COMPACT_READ_THRESHOLD {
            self.schedule_compact(ino, index);
        }
        Ok(slices)
    }

    pub async fn new_chunk(&self, ctx: &Ctx) -> Result<u64, MetaError> {
        ctx.check_deadline()?;
        let mut con = self.shared();
        let chunk_id: u64 = con.incr(NEXT_CHUNK, 1).await?;
        Ok(chunk_id)
    }

    pub async fn write(
        &self,
        ctx: &Ctx,
        ino: Ino,
        index: u32,
        off: u32,
        slice: Slice,
    ) -> Result<(), MetaError> {
        let inode_key = self.inode_key(ino);
        let chunk_size = self.chunk_size();
        let appended = self
            .txn(ctx, std::slice::from_ref(&inode_key), |mut tx| {
                let inode_key = inode_key.clone();
                async move {
                    let buf = tx.get(&inode_key).await?.ok_or(MetaError::NotFound)?;
                    let mut attr = decode_attr(&buf)?;
                    if attr.kind != FileKind::Regular {
                        return Err(MetaError::NotPermitted);
                    }
                    let new_len = u64::from(index) * chunk_size + u64::from(off) + u64::from(slice.len);
                    let mut added = 0i64;
                    if new_len > attr.length {
                        added = align4k(new_len) - align4k(attr.length);
                        attr.length = new_len;
                    }
                    attr.touch_mtime(Timestamp::now());

                    let rec = SliceRec {
                        pos: off,
                        id: slice.id,
                        size: slice.size,
                        off: slice.off,
                        len: slice.len,
                    };
                    let mut pipe = redis::pipe();
                    pipe.atomic();
                    pipe.rpush(self.chunk_key(ino, index), rec.encode());
                    pipe.set(&inode_key, encode_attr(&attr)).ignore();
                    if added > 0 {
                        pipe.incr(USED_SPACE, added).ignore();
                    }
                    Ok(tx.commit::<(i64,)>(&pipe).await?.map(|(count,)| count))
                }
            })
            .await?;

        if appended % COMPACT_APPEND_EVERY == 0 {
            self.schedule_compact(ino, index);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn copy_file_range(
        &self,
        ctx: &Ctx,
        src: Ino,
        off_in: u64,
        dst: Ino,
        off_out: u64,
        size: u64,
        _flags: u32,
    ) -> Result<u64, MetaError> {
        let keys = [self.inode_key(dst), self.inode_key(src)];
        let chunk_size = self.chunk_size();
        self.txn(ctx, &keys, |mut tx| async move {
            let attrs = tx.mget(&[self.inode_key(src), self.inode_key(dst)]).await?;
            let (Some(sbuf), Some(dbuf)) = (&attrs[0], &attrs[1]) else {
                return Err(MetaError::NotFound);
            };
            let sattr = decode_attr(sbuf)?;
            if sattr.kind != FileKind::Regular {
                return Err(MetaError::Invalid);
            }
            if off_in >= sattr.length {
                return Ok(Some(0));
            }
            let size = size.min(sattr.length - off_in);

            let mut dattr = decode_attr(dbuf)?;
            if dattr.kind != FileKind::Regular {
                return Err(MetaError::Invalid);
            }
            let new_len = off_out + size;
            let mut added = 0i64;
            if new_len > dattr.length {
                added = align4k(new_len) - align4k(dattr.length);
                dattr.length = new_len;
            }
            dattr.touch_mtime(Timestamp::now());

            let mut read_pipe = redis::pipe();
            for index in off_in / chunk_size..=(off_in + size) / chunk_size {
                read_pipe
                    .cmd("LRANGE")
                    .arg(self.chunk_key(src, index as u32))
                    .arg(0)
                    .arg(READ_LOG_LIMIT);
            }
            let logs: Vec<Vec<Vec<u8>>> = tx.query(&read_pipe).await?;

            let mut pipe = redis::pipe();
            pipe.atomic();
            let mut coff = off_in / chunk_size * chunk_size;
            for raw in &logs {
                // Seed with a chunk-wide hole so uncovered source ranges
                // appear as explicit zero slices in the destination.
                let mut recs = vec![SliceRec {
                    len: chunk_size as u32,
                    ..Default::default()
                }];
                recs.extend(decode_slice_log(raw));

                let mut tpos: u32 = 0;
                for mut s in build_slices(&recs) {
                    let mut pos = tpos;
                    tpos += s.len;
                    let abs = coff + u64::from(pos);
                    if abs >= off_in + size || abs + u64::from(s.len) <= off_in {
                        continue;
                    }
                    if abs < off_in {
                        let cut = (off_in - abs) as u32;
                        s.off += cut;
                        pos += cut;
                        s.len -= cut;
                    }
                    let abs = coff + u64::from(pos);
                    if abs + u64::from(s.len) > off_in + size {
                        s.len -= (abs + u64::from(s.len) - (off_in + size)) as u32;
                    }

                    let doff = abs - off_in + off_out;
                    let index = (doff / chunk_size) as u32;
                    let dpos = (doff % chunk_size) as u32;
                    if u64::from(dpos) + u64::from(s.len) > chunk_size {
                        // The projected slice straddles a destination chunk
                        // boundary; store it as two records.
                        let head = chunk_size as u32 - dpos;
                        let first = SliceRec {
                            pos: dpos,
                            id: s.id,
                            size: s.size,
                            off: s.off,
                            len: head,
                        };
                        pipe.rpush(self.chunk_key(dst, index), first.encode()).ignore();
                        if s.id > 0 {
                            pipe.incr(self.slice_key(s.id, s.size), 1).ignore();
                        }
                        let rest = SliceRec {
                            pos: 0,
                            id: s.id,
                            size: s.size,
                            off: s.off + head,
                            len: s.len - head,
                        };
                        pipe.rpush(self.chunk_key(dst, index + 1), rest.encode()).ignore();
                        if s.id > 0 {
                            pipe.incr(self.slice_key(s.id, s.size), 1).ignore();
                        }
                    } else {
                        let rec = SliceRec {
                            pos: dpos,
                            id: s.id,
                            size: s.size,
                            off: s.off,
                            len: s.len,
                        };
                        pipe.rpush(self.chunk_key(dst, index), rec.encode()).ignore();
                        if s.id > 0 {
                            pipe.incr(self.slice_key(s.id, s.size), 1).ignore();
                        }
                    }
                }
                coff += chunk_size;
            }
            pipe.set(self.inode_key(dst), encode_attr(&dattr)).ignore();
            if added > 0 {
                pipe.incr(USED_SPACE, added).ignore();
            }
            Ok(tx.commit::<()>(&pipe).await?.map(|_| size))
        })
        .await
    }

    pub async fn list_slices(&self, ctx: &Ctx) -> Result<Vec<Slice>, MetaError> {
        ctx.check_deadline()?;
        let mut con = self.shared();
        let mut out = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("c*_*")
                .arg("COUNT")
                .arg(10_000)
                .query_async(&mut con)
                .await?;
            if !keys.is_empty() {
                let mut pipe = redis::pipe();
                for key in &keys {
                    pipe.cmd("LRANGE").arg(key).arg(0).arg(READ_LOG_LIMIT);
                }
                let logs: Vec<Vec<Vec<u8>>> = pipe.query_async(&mut con).await?;
                for raw in &logs {
                    for rec in decode_slice_log(raw) {
                        if rec.id > 0 {
                            out.push(Slice {
                                id: rec.id,
                                size: rec.size,
                                off: 0,
                                len: 0,
                            });
                        }
                    }
                }
            }
            if next == 0 {
                return Ok(out);
            }
            cursor = next;
        }
    }

    /// Queue a background compaction of one chunk.
    pub(crate) fn schedule_compact(&self, ino: Ino, index: u32) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            me.compact_chunk(ino, index).await;
        });
    }

    /// Fold the head of a chunk's log into one consolidated slice. Bounded
    /// to a few concurrent chunks and deduplicated per (inode, index).
    ///
    /// Boxed to break the recursive `impl Future` type this would otherwise
    /// form via the rerun path below.
    pub(crate) fn compact_chunk(
        &self,
        ino: Ino,
        index: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let token = ino.wrapping_add(u64::from(index) << 32);
            {
                let mut compacting = self.compacting.lock();
                if compacting.len() > COMPACT_MAX_INFLIGHT || compacting.contains(&token) {
                    return;
                }
                compacting.insert(token);
            }
            let outcome = self.do_compact(ino, index).await;
            self.compacting.lock().remove(&token);

            if matches!(outcome, CompactOutcome::Rerun)
                && let Some(me) = self.me.upgrade()
            {
                tokio::spawn(async move {
                    // Let the in-flight appends settle before the next pass.
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    me.compact_chunk(ino, index).await;
                });
            }
        })
    }

    async fn do_compact(&self, ino: Ino, index: u32) -> CompactOutcome {
        let chunk_key = self.chunk_key(ino, index);
        let mut con = self.shared();
        let raw: Vec<Vec<u8>> = match con.lrange(&chunk_key, 0, COMPACT_BATCH).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!("compact {chunk_key}: {err}");
                return CompactOutcome::Done;
            }
        };
        if raw.len() < 2 {
            return CompactOutcome::Done;
        }
        let chunk_id: u64 = match con.incr(NEXT_CHUNK, 1).await {
            Ok(id) => id,
            Err(err) => {
                warn!("allocate chunk id: {err}");
                return CompactOutcome::Done;
            }
        };

        let recs = decode_slice_log(&raw);
        let slices = build_slices(&recs);
        let size: u32 = slices.iter().map(|s| s.len).sum();
        let superseded: Vec<(u64, u32)> = recs
            .iter()
            .filter(|r| r.id > 0)
            .map(|r| (r.id, r.size))
            .collect();
        debug!(ino, index, entries = raw.len(), slices = slices.len(), "compacting chunk");

        if let Err(err) = self
            .send_msg(Msg::CompactChunk {
                slices,
                chunk_id,
            })
            .await
        {
            warn!("compact {ino}:{index} with {} entries: {err}", raw.len());
            return CompactOutcome::Done;
        }

        let new_slice_key = self.slice_key(chunk_id, size);
        let raw_ref = &raw;
        let superseded_ref = &superseded;
        let outcome = self
            .txn(&Ctx::background(), std::slice::from_ref(&chunk_key), |mut tx| {
                let chunk_key = chunk_key.clone();
                let new_slice_key = new_slice_key.clone();
                async move {
                    // Another client may have compacted the same prefix in
                    // the meantime; appends are fine, rewrites are not.
                    let current = tx.lrange(&chunk_key, 0, raw_ref.len() as isize - 1).await?;
                    if current != *raw_ref {
                        return Err(MetaError::Invalid);
                    }

                    let rec = SliceRec {
                        pos: 0,
                        id: chunk_id,
                        size,
                        off: 0,
                        len: size,
                    };
                    let mut pipe = redis::pipe();
                    pipe.atomic();
                    pipe.cmd("LTRIM")
                        .arg(&chunk_key)
                        .arg(raw_ref.len() as isize)
                        .arg(-1)
                        .ignore();
                    pipe.lpush(&chunk_key, rec.encode()).ignore();
                    // Materialize the refcount key so the new chunk is tracked.
                    pipe.incr(&new_slice_key, 0).ignore();
                    for (id, sz) in superseded_ref {
                        pipe.cmd("DECR").arg(self.slice_key(*id, *sz));
                    }
                    tx.commit::<Vec<i64>>(&pipe).await
                }
            })
            .await;

        match outcome {
            Ok(decrs) => {
                for ((id, sz), refs) in superseded.iter().zip(decrs) {
                    if refs < 0 {
                        self.delete_slice(*id, *sz).await;
                    }
                }
                let remaining: i64 = con.llen(&chunk_key).await.unwrap_or(0);
                if remaining > COMPACT_READ_THRESHOLD as i64 {
                    return CompactOutcome::Rerun;
                }
            }
            Err(MetaError::Invalid) => {
                // Lost the race: our coalesced object is unreferenced.
                let _: Result<i64, _> = con.decr(&new_slice_key, 1).await;
                self.delete_slice(chunk_id, size).await;
            }
            Err(err) => {
                // The commit may have applied before the connection died;
                // the refcount key only exists if it did.
                match con.get::<_, Option<Vec<u8>>>(&new_slice_key).await {
                    Ok(Some(_)) => {
                        debug!("compaction of {chunk_key} committed despite: {err}");
                        // Superseded refcounts were decremented server-side;
                        // any that went negative are settled by the sweeper.
                    }
                    Ok(None) => {
                        let _: Result<i64, _> = con.decr(&new_slice_key, 1).await;
                        self.delete_slice(chunk_id, size).await;
                    }
                    Err(err2) => warn!("compact double-check {chunk_key}: {err2}"),
                }
            }
        }
        CompactOutcome::Done
    }
}
