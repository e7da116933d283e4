//! Directory tree operations: lookup, the create family, link/unlink,
//! rmdir, rename, readdir and recursive remove.

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use crate::meta::codec::{align4k, decode_attr, decode_entry, encode_attr, encode_entry};
use crate::meta::error::MetaError;
use crate::meta::redis::{RedisMeta, DELFILES, TOTAL_INODES, USED_SPACE};
use crate::meta::types::{Attr, Ctx, Entry, FileKind, Ino, Timestamp};

/// Attribute hydration batch size for readdir-plus.
const READDIR_BATCH: usize = 4096;
/// Concurrent attribute fetchers for readdir-plus.
const READDIR_FETCHERS: usize = 2;
/// Concurrently removed subtrees in remove_all.
const RMR_CONCURRENCY: usize = 50;

impl RedisMeta {
    pub async fn lookup(&self, ctx: &Ctx, parent: Ino, name: &str) -> Result<(Ino, Attr), MetaError> {
        ctx.check_deadline()?;
        let entry_key = self.entry_key(parent);

        // Server-side fast path: entry and child attribute in one round trip.
        let script = self.lookup_script.lock().clone();
        if let Some(script) = script {
            let mut con = self.shared();
            let reply: Result<Option<(u64, Option<Vec<u8>>)>, redis::RedisError> = script
                .key(&entry_key)
                .key(name)
                .invoke_async(&mut con)
                .await;
            match reply {
                Ok(None) => return Err(MetaError::NotFound),
                Ok(Some((ino, Some(buf)))) => return Ok((ino, decode_attr(&buf)?)),
                Ok(Some((_, None))) => return Err(MetaError::NotFound),
                Err(err) => {
                    // Server restarted without the script, or scripting is
                    // unavailable: drop the fast path for this session.
                    warn!("lookup script failed, falling back to plain path: {err}");
                    *self.lookup_script.lock() = None;
                }
            }
        }

        let mut con = self.shared();
        let buf: Option<Vec<u8>> = con.hget(&entry_key, name).await?;
        let (_, ino) = decode_entry(&buf.ok_or(MetaError::NotFound)?)?;
        let abuf: Option<Vec<u8>> = con.get(self.inode_key(ino)).await?;
        let attr = decode_attr(&abuf.ok_or(MetaError::NotFound)?)?;
        Ok((ino, attr))
    }

    pub async fn mknod(
        &self,
        ctx: &Ctx,
        parent: Ino,
        name: &str,
        kind: FileKind,
        mode: u16,
        cumask: u16,
        rdev: u32,
    ) -> Result<(Ino, Attr), MetaError> {
        self.mknod_inner(ctx, parent, name, kind, mode, cumask, rdev, "")
            .await
    }

    pub async fn mkdir(
        &self,
        ctx: &Ctx,
        parent: Ino,
        name: &str,
        mode: u16,
        cumask: u16,
    ) -> Result<(Ino, Attr), MetaError> {
        self.mknod(ctx, parent, name, FileKind::Directory, mode, cumask, 0)
            .await
    }

    pub async fn create(
        &self,
        ctx: &Ctx,
        parent: Ino,
        name: &str,
        mode: u16,
        cumask: u16,
    ) -> Result<(Ino, Attr), MetaError> {
        let created = self
            .mknod(ctx, parent, name, FileKind::Regular, mode, cumask, 0)
            .await?;
        self.open_files.lock().counts.insert(created.0, 1);
        Ok(created)
    }

    pub async fn symlink(
        &self,
        ctx: &Ctx,
        parent: Ino,
        name: &str,
        target: &str,
    ) -> Result<(Ino, Attr), MetaError> {
        self.mknod_inner(
            ctx,
            parent,
            name,
            FileKind::Symlink,
            0o644,
            0o022,
            0,
            target,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn mknod_inner(
        &self,
        ctx: &Ctx,
        parent: Ino,
        name: &str,
        kind: FileKind,
        mode: u16,
        cumask: u16,
        rdev: u32,
        target: &str,
    ) -> Result<(Ino, Attr), MetaError> {
        if name == "." || name == ".." {
            return Err(MetaError::Exists);
        }
        let ino = self.next_inode().await?;
        let mut attr = Attr {
            kind,
            mode: mode & !cumask,
            uid: ctx.uid,
            gid: ctx.gid,
            parent,
            ..Default::default()
        };
        match kind {
            FileKind::Directory => {
                attr.nlink = 2;
                attr.length = 4 << 10;
            }
            FileKind::Symlink => {
                attr.nlink = 1;
                attr.length = target.len() as u64;
            }
            _ => {
                attr.nlink = 1;
                attr.rdev = rdev;
            }
        }

        let parent_key = self.inode_key(parent);
        let entry_key = self.entry_key(parent);
        let keys = [parent_key.clone(), entry_key.clone()];
        self.txn(ctx, &keys, |mut tx| {
            let parent_key = parent_key.clone();
            let entry_key = entry_key.clone();
            async move {
                let pbuf = tx.get(&parent_key).await?.ok_or(MetaError::NotFound)?;
                let mut pattr = decode_attr(&pbuf)?;
                if !pattr.is_dir() {
                    return Err(MetaError::NotDirectory);
                }
                if tx.hget(&entry_key, name).await?.is_some() {
                    return Err(MetaError::Exists);
                }

                let now = Timestamp::now();
                let mut attr = attr;
                if kind.is_dir() {
                    pattr.nlink += 1;
                }
                pattr.touch_mtime(now);
                attr.atime = now.secs;
                attr.atime_ns = now.nanos;
                attr.touch_mtime(now);
                if ctx.is_hadoop() {
                    attr.gid = pattr.gid;
                }

                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.hset(&entry_key, name, encode_entry(kind, ino)).ignore();
                pipe.set(&parent_key, encode_attr(&pattr)).ignore();
                pipe.set(self.inode_key(ino), encode_attr(&attr)).ignore();
                if kind == FileKind::Symlink {
                    pipe.set(self.sym_key(ino), target).ignore();
                }
                pipe.incr(TOTAL_INODES, 1).ignore();
                Ok(tx.commit::<()>(&pipe).await?.map(|_| (ino, attr)))
            }
        })
        .await
    }

    pub async fn link(&self, ctx: &Ctx, ino: Ino, parent: Ino, name: &str) -> Result<Attr, MetaError> {
        let inode_key = self.inode_key(ino);
        let parent_key = self.inode_key(parent);
        let entry_key = self.entry_key(parent);
        let keys = [inode_key.clone(), entry_key.clone(), parent_key.clone()];
        self.txn(ctx, &keys, |mut tx| {
            let inode_key = inode_key.clone();
            let parent_key = parent_key.clone();
            let entry_key = entry_key.clone();
            async move {
                let attrs = tx.mget(&[parent_key.clone(), inode_key.clone()]).await?;
                let (Some(pbuf), Some(ibuf)) = (&attrs[0], &attrs[1]) else {
                    return Err(MetaError::NotFound);
                };
                let mut pattr = decode_attr(pbuf)?;
                if !pattr.is_dir() {
                    return Err(MetaError::NotDirectory);
                }
                let mut iattr = decode_attr(ibuf)?;
                if iattr.is_dir() {
                    return Err(MetaError::NotPermitted);
                }
                let now = Timestamp::now();
                pattr.touch_mtime(now);
                iattr.touch_ctime(now);
                iattr.nlink += 1;

                if tx.hget(&entry_key, name).await?.is_some() {
                    return Err(MetaError::Exists);
                }

                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.hset(&entry_key, name, encode_entry(iattr.kind, ino))
                    .ignore();
                pipe.set(&parent_key, encode_attr(&pattr)).ignore();
                pipe.set(&inode_key, encode_attr(&iattr)).ignore();
                Ok(tx.commit::<()>(&pipe).await?.map(|_| iattr))
            }
        })
        .await
    }

    pub async fn unlink(&self, ctx: &Ctx, parent: Ino, name: &str) -> Result<(), MetaError> {
        let mut con = self.shared();
        let entry_key = self.entry_key(parent);
        let buf: Option<Vec<u8>> = con.hget(&entry_key, name).await?;
        let (kind, ino) = decode_entry(&buf.ok_or(MetaError::NotFound)?)?;
        if kind == FileKind::Directory {
            return Err(MetaError::NotPermitted);
        }

        let parent_key = self.inode_key(parent);
        let inode_key = self.inode_key(ino);
        let keys = [entry_key.clone(), parent_key.clone(), inode_key.clone()];
        let (attr, opened) = self
            .txn(ctx, &keys, |mut tx| {
                let entry_key = entry_key.clone();
                let parent_key = parent_key.clone();
                let inode_key = inode_key.clone();
                async move {
                    let attrs = tx.mget(&[parent_key.clone(), inode_key.clone()]).await?;
                    let (Some(pbuf), Some(ibuf)) = (&attrs[0], &attrs[1]) else {
                        return Err(MetaError::NotFound);
                    };
                    let mut pattr = decode_attr(pbuf)?;
                    if !pattr.is_dir() {
                        return Err(MetaError::NotDirectory);
                    }
                    let now = Timestamp::now();
                    pattr.touch_mtime(now);
                    let mut attr = decode_attr(ibuf)?;
                    attr.touch_ctime(now);

                    // The entry may have been replaced since the pre-read.
                    let buf = tx.hget(&entry_key, name).await?.ok_or(MetaError::NotFound)?;
                    let (kind2, ino2) = decode_entry(&buf)?;
                    if kind2 != kind || ino2 != ino {
                        return Err(MetaError::Again);
                    }

                    attr.nlink -= 1;
                    let opened = kind == FileKind::Regular
                        && attr.nlink == 0
                        && self
                            .open_files
                            .lock()
                            .counts
                            .get(&ino)
                            .copied()
                            .unwrap_or(0)
                            > 0;

                    let mut pipe = redis::pipe();
                    pipe.atomic();
                    pipe.hdel(&entry_key, name).ignore();
                    pipe.set(&parent_key, encode_attr(&pattr)).ignore();
                    pipe.del(self.xattr_key(ino)).ignore();
                    if attr.nlink > 0 {
                        pipe.set(&inode_key, encode_attr(&attr)).ignore();
                    } else {
                        match kind {
                            FileKind::Symlink => {
                                pipe.del(self.sym_key(ino)).ignore();
                                pipe.del(&inode_key).ignore();
                            }
                            FileKind::Regular => {
                                if opened {
                                    // Kept alive until the last close.
                                    pipe.set(&inode_key, encode_attr(&attr)).ignore();
                                    pipe.sadd(self.session_key(self.sid()), ino).ignore();
                                } else {
                                    pipe.cmd("ZADD")
                                        .arg(DELFILES)
                                        .arg(now.secs)
                                        .arg(self.del_tracking(ino, attr.length))
                                        .ignore();
                                    pipe.del(&inode_key).ignore();
                                    pipe.incr(USED_SPACE, -align4k(attr.length)).ignore();
                                }
                            }
                            _ => {
                                pipe.del(&inode_key).ignore();
                            }
                        }
                        pipe.incr(TOTAL_INODES, -1).ignore();
                    }
                    Ok(tx.commit::<()>(&pipe).await?.map(|_| (attr, opened)))
                }
            })
            .await?;

        if kind == FileKind::Regular && attr.nlink == 0 {
            if opened {
                self.open_files.lock().removed.insert(ino);
            } else {
                self.spawn_delete_file(ino, attr.length, None);
            }
        }
        Ok(())
    }

    pub async fn rmdir(&self, ctx: &Ctx, parent: Ino, name: &str) -> Result<(), MetaError> {
        if name == "." {
            return Err(MetaError::Invalid);
        }
        if name == ".." {
            return Err(MetaError::NotEmpty);
        }
        let mut con = self.shared();
        let entry_key = self.entry_key(parent);
        let buf: Option<Vec<u8>> = con.hget(&entry_key, name).await?;
        let (kind, ino) = decode_entry(&buf.ok_or(MetaError::NotFound)?)?;
        if kind != FileKind::Directory {
            return Err(MetaError::NotDirectory);
        }

        let parent_key = self.inode_key(parent);
        let inode_key = self.inode_key(ino);
        let child_entries = self.entry_key(ino);
        let keys = [
            parent_key.clone(),
            entry_key.clone(),
            inode_key.clone(),
            child_entries.clone(),
        ];
        self.txn(ctx, &keys, |mut tx| {
            let entry_key = entry_key.clone();
            let parent_key = parent_key.clone();
            let inode_key = inode_key.clone();
            let child_entries = child_entries.clone();
            async move {
                let pbuf = tx.get(&parent_key).await?.ok_or(MetaError::NotFound)?;
                let mut pattr = decode_attr(&pbuf)?;
                if !pattr.is_dir() {
                    return Err(MetaError::NotDirectory);
                }
                pattr.nlink -= 1;
                pattr.touch_mtime(Timestamp::now());

                let buf = tx.hget(&entry_key, name).await?.ok_or(MetaError::NotFound)?;
                let (kind2, ino2) = decode_entry(&buf)?;
                if kind2 != FileKind::Directory {
                    return Err(MetaError::NotDirectory);
                }
                if ino2 != ino {
                    return Err(MetaError::Again);
                }
                if tx.hlen(&child_entries).await? > 0 {
                    return Err(MetaError::NotEmpty);
                }

                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.hdel(&entry_key, name).ignore();
                pipe.set(&parent_key, encode_attr(&pattr)).ignore();
                pipe.del(&inode_key).ignore();
                pipe.del(self.xattr_key(ino)).ignore();
                pipe.incr(TOTAL_INODES, -1).ignore();
                Ok(tx.commit::<()>(&pipe).await?.map(|_| ()))
            }
        })
        .await
    }

    pub async fn rename(
        &self,
        ctx: &Ctx,
        parent_src: Ino,
        name_src: &str,
        parent_dst: Ino,
        name_dst: &str,
    ) -> Result<(Ino, Attr), MetaError> {
        let mut con = self.shared();
        let entry_src = self.entry_key(parent_src);
        let entry_dst = self.entry_key(parent_dst);

        let buf: Option<Vec<u8>> = con.hget(&entry_src, name_src).await?;
        let (kind, ino) = decode_entry(&buf.ok_or(MetaError::NotFound)?)?;
        if parent_src == parent_dst && name_src == name_dst {
            let attr = self.get_attr(ctx, ino).await?;
            return Ok((ino, attr));
        }

        let dbuf: Option<Vec<u8>> = con.hget(&entry_dst, name_dst).await?;
        let pre_dst = match &dbuf {
            Some(buf) => Some(decode_entry(buf)?),
            None => None,
        };

        let mut keys = vec![
            entry_src.clone(),
            self.inode_key(parent_src),
            self.inode_key(ino),
            entry_dst.clone(),
            self.inode_key(parent_dst),
        ];
        if let Some((dkind, dino)) = pre_dst {
            keys.push(self.inode_key(dino));
            if dkind == FileKind::Directory {
                keys.push(self.entry_key(dino));
            }
        }

        let (iattr, removed) = self
            .txn(ctx, &keys, |mut tx| {
                let entry_src = entry_src.clone();
                let entry_dst = entry_dst.clone();
                async move {
                    // Replacement target, re-validated under WATCH.
                    let dbuf = tx.hget(&entry_dst, name_dst).await?;
                    let mut target: Option<(FileKind, Ino, Attr)> = None;
                    let mut opened = false;
                    match dbuf {
                        Some(buf) => {
                            if ctx.is_hadoop() {
                                return Err(MetaError::Exists);
                            }
                            let (dkind, dino) = decode_entry(&buf)?;
                            if pre_dst != Some((dkind, dino)) {
                                return Err(MetaError::Again);
                            }
                            if dkind == FileKind::Directory {
                                if tx.hlen(&self.entry_key(dino)).await? > 0 {
                                    return Err(MetaError::NotEmpty);
                                }
                                target = Some((dkind, dino, Attr::default()));
                            } else {
                                let tbuf = tx
                                    .get(&self.inode_key(dino))
                                    .await?
                                    .ok_or(MetaError::NotFound)?;
                                let mut tattr = decode_attr(&tbuf)?;
                                tattr.nlink -= 1;
                                if tattr.nlink > 0 {
                                    tattr.touch_ctime(Timestamp::now());
                                } else if dkind == FileKind::Regular {
                                    opened = self
                                        .open_files
                                        .lock()
                                        .counts
                                        .get(&dino)
                                        .copied()
                                        .unwrap_or(0)
                                        > 0;
                                }
                                target = Some((dkind, dino, tattr));
                            }
                        }
                        None => {
                            // A pre-read target that has vanished is fine;
                            // there is simply nothing to replace anymore.
                        }
                    }

                    let sbuf = tx.hget(&entry_src, name_src).await?.ok_or(MetaError::NotFound)?;
                    let (_, ino2) = decode_entry(&sbuf)?;
                    if ino2 != ino {
                        return Err(MetaError::Again);
                    }

                    let attrs = tx
                        .mget(&[
                            self.inode_key(parent_src),
                            self.inode_key(parent_dst),
                            self.inode_key(ino),
                        ])
                        .await?;
                    let (Some(sbuf), Some(dbuf), Some(ibuf)) = (&attrs[0], &attrs[1], &attrs[2])
                    else {
                        return Err(MetaError::NotFound);
                    };
                    let mut sattr = decode_attr(sbuf)?;
                    if !sattr.is_dir() {
                        return Err(MetaError::NotDirectory);
                    }
                    let mut dattr = decode_attr(dbuf)?;
                    if !dattr.is_dir() {
                        return Err(MetaError::NotDirectory);
                    }
                    let now = Timestamp::now();
                    sattr.touch_mtime(now);
                    dattr.touch_mtime(now);
                    let mut iattr = decode_attr(ibuf)?;
                    iattr.parent = parent_dst;
                    iattr.touch_ctime(now);
                    if kind == FileKind::Directory && parent_src != parent_dst {
                        sattr.nlink -= 1;
                        dattr.nlink += 1;
                    }

                    // Decide the target's fate before encoding the parents:
                    // removing a directory also drops its ".." link.
                    let mut removed: Option<(FileKind, Ino, Attr, bool)> = None;
                    if let Some((dkind, dino, tattr)) = target {
                        if dkind != FileKind::Directory && tattr.nlink > 0 {
                            // survives as a plain hard link
                        } else if dkind == FileKind::Directory {
                            dattr.nlink -= 1;
                            if parent_src == parent_dst {
                                // only sattr is written for same-parent renames
                                sattr.nlink -= 1;
                            }
                        }
                        removed = Some((dkind, dino, tattr, opened));
                    }

                    let mut pipe = redis::pipe();
                    pipe.atomic();
                    pipe.hdel(&entry_src, name_src).ignore();
                    pipe.set(self.inode_key(parent_src), encode_attr(&sattr)).ignore();
                    if let Some((dkind, dino, tattr, opened)) = &removed {
                        if *dkind != FileKind::Directory && tattr.nlink > 0 {
                            pipe.set(self.inode_key(*dino), encode_attr(tattr)).ignore();
                        } else {
                            match dkind {
                                FileKind::Directory => {
                                    pipe.del(self.inode_key(*dino)).ignore();
                                }
                                FileKind::Symlink => {
                                    pipe.del(self.sym_key(*dino)).ignore();
                                    pipe.del(self.inode_key(*dino)).ignore();
                                }
                                FileKind::Regular => {
                                    if *opened {
                                        pipe.set(self.inode_key(*dino), encode_attr(tattr)).ignore();
                                        pipe.sadd(self.session_key(self.sid()), *dino).ignore();
                                    } else {
                                        pipe.cmd("ZADD")
                                            .arg(DELFILES)
                                            .arg(now.secs)
                                            .arg(self.del_tracking(*dino, tattr.length))
                                            .ignore();
                                        pipe.del(self.inode_key(*dino)).ignore();
                                        pipe.incr(USED_SPACE, -align4k(tattr.length)).ignore();
                                    }
                                }
                                _ => {
                                    pipe.del(self.inode_key(*dino)).ignore();
                                }
                            }
                            pipe.incr(TOTAL_INODES, -1).ignore();
                            pipe.del(self.xattr_key(*dino)).ignore();
                        }
                        pipe.hdel(&entry_dst, name_dst).ignore();
                    }
                    pipe.hset(&entry_dst, name_dst, encode_entry(kind, ino)).ignore();
                    if parent_dst != parent_src {
                        pipe.set(self.inode_key(parent_dst), encode_attr(&dattr)).ignore();
                    }
                    pipe.set(self.inode_key(ino), encode_attr(&iattr)).ignore();
                    Ok(tx.commit::<()>(&pipe).await?.map(|_| (iattr, removed)))
                }
            })
            .await?;

        if let Some((FileKind::Regular, dino, tattr, opened)) = removed
            && tattr.nlink == 0
        {
            if opened {
                self.open_files.lock().removed.insert(dino);
            } else {
                self.spawn_delete_file(dino, tattr.length, None);
            }
        }
        Ok((ino, iattr))
    }

    pub async fn readdir(&self, ctx: &Ctx, ino: Ino, plus: bool) -> Result<Vec<Entry>, MetaError> {
        let attr = self.get_attr(ctx, ino).await?;
        let mut entries = vec![Entry {
            ino,
            name: ".".to_string(),
            attr: Attr {
                kind: FileKind::Directory,
                ..Default::default()
            },
        }];
        if attr.parent > 0 {
            entries.push(Entry {
                ino: attr.parent,
                name: "..".to_string(),
                attr: Attr {
                    kind: FileKind::Directory,
                    ..Default::default()
                },
            });
        }

        let mut con = self.shared();
        let entry_key = self.entry_key(ino);
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<(String, Vec<u8>)>) = redis::cmd("HSCAN")
                .arg(&entry_key)
                .arg(cursor)
                .arg("COUNT")
                .arg(10_000)
                .query_async(&mut con)
                .await?;
            for (name, buf) in batch {
                let (kind, child) = decode_entry(&buf)?;
                entries.push(Entry {
                    ino: child,
                    name,
                    attr: Attr {
                        kind,
                        ..Default::default()
                    },
                });
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        if plus {
            let mut fetches = Vec::new();
            for start in (0..entries.len()).step_by(READDIR_BATCH) {
                let end = (start + READDIR_BATCH).min(entries.len());
                let keys: Vec<String> =
                    entries[start..end].iter().map(|e| self.inode_key(e.ino)).collect();
                let mut con = self.shared();
                fetches.push(async move {
                    let mut cmd = redis::cmd("MGET");
                    for key in &keys {
                        cmd.arg(key);
                    }
                    let values: Vec<Option<Vec<u8>>> = cmd.query_async(&mut con).await?;
                    Ok::<_, MetaError>((start, values))
                });
            }
            let hydrated: Vec<(usize, Vec<Option<Vec<u8>>>)> = stream::iter(fetches)
                .buffered(READDIR_FETCHERS)
                .try_collect()
                .await?;
            for (start, values) in hydrated {
                for (i, value) in values.into_iter().enumerate() {
                    if let Some(buf) = value
                        && let Ok(attr) = decode_attr(&buf)
                    {
                        entries[start + i].attr = attr;
                    }
                }
            }
        }
        Ok(entries)
    }

    pub async fn remove_all(&self, ctx: &Ctx, parent: Ino, name: &str) -> Result<(), MetaError> {
        self.access(ctx, parent, 0b011).await?;
        let (ino, attr) = self.lookup(ctx, parent, name).await?;
        if !attr.is_dir() {
            return self.unlink(ctx, parent, name).await;
        }
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| MetaError::Io("engine is shutting down".into()))?;
        let sem = Arc::new(Semaphore::new(RMR_CONCURRENCY));
        me.empty_entry(ctx.clone(), parent, name.to_string(), ino, sem)
            .await
    }

    fn empty_entry(
        self: Arc<Self>,
        ctx: Ctx,
        parent: Ino,
        name: String,
        ino: Ino,
        sem: Arc<Semaphore>,
    ) -> BoxFuture<'static, Result<(), MetaError>> {
        Box::pin(async move {
            self.clone().empty_dir(ctx.clone(), ino, sem.clone()).await?;
            match self.rmdir(&ctx, parent, &name).await {
                // Someone recreated entries under us; take another pass.
                Err(MetaError::NotEmpty) => self.clone().empty_entry(ctx, parent, name, ino, sem).await,
                other => other,
            }
        })
    }

    fn empty_dir(
        self: Arc<Self>,
        ctx: Ctx,
        ino: Ino,
        sem: Arc<Semaphore>,
    ) -> BoxFuture<'static, Result<(), MetaError>> {
        Box::pin(async move {
            self.access(&ctx, ino, 0b011).await?;
            let entries = self.readdir(&ctx, ino, false).await?;
            let mut subtrees = JoinSet::new();
            let mut failed: Option<MetaError> = None;
            for entry in entries {
                if entry.name == "." || entry.name == ".." {
                    continue;
                }
                if entry.attr.is_dir() {
                    if let Ok(permit) = sem.clone().try_acquire_owned() {
                        let me = self.clone();
                        let ctx = ctx.clone();
                        let sem = sem.clone();
                        subtrees.spawn(async move {
                            let result = me.empty_entry(ctx, ino, entry.name, entry.ino, sem).await;
                            drop(permit);
                            result
                        });
                    } else if let Err(err) = self
                        .clone()
                        .empty_entry(ctx.clone(), ino, entry.name, entry.ino, sem.clone())
                        .await
                    {
                        failed = Some(err);
                        break;
                    }
                } else if let Err(err) = self.unlink(&ctx, ino, &entry.name).await {
                    failed = Some(err);
                    break;
                }
            }
            while let Some(joined) = subtrees.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => failed = Some(err),
                    Err(err) => failed = Some(MetaError::Io(err.to_string())),
                }
            }
            match failed {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }
}
