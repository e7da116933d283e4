//! Volume format bootstrap, client sessions and open-handle tracking.
//!
//! A session is one mounted client. Its liveness is a heartbeat score in
//! the `sessions` zset; its `session{sid}` set holds inodes that were
//! unlinked while this client still had them open. Stale sessions are
//! reclaimed cooperatively by whichever client notices them.

use redis::AsyncCommands;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::meta::codec::encode_attr;
use crate::meta::error::MetaError;
use crate::meta::format::Format;
use crate::meta::redis::{RedisMeta, ALL_SESSIONS, LOOKUP_SCRIPT, NEXT_SESSION, SETTING};
use crate::meta::store::{MsgCallback, MsgKind};
use crate::meta::types::{Attr, Ctx, FileKind, Ino, Timestamp, ROOT_INO};

/// Heartbeat age after which a session's sustained inodes are reclaimed.
const SESSION_DEAD_AFTER: i64 = 600;
/// Heartbeat age after which a session's lock entries are dropped.
const SESSION_LOCKS_DEAD_AFTER: i64 = 180;
/// Stale sessions handled per cleanup pass.
const SESSION_SWEEP_LIMIT: usize = 100;

impl RedisMeta {
    pub async fn init(&self, format: Format, force: bool) -> Result<(), MetaError> {
        let mut con = self.shared();
        let body: Option<Vec<u8>> = con.get(SETTING).await?;
        let mut format = match body {
            Some(body) => {
                let old: Format = serde_json::from_slice(&body)
                    .map_err(|err| MetaError::BadFormat(format!("existing format is broken: {err}")))?;
                if force {
                    warn!("existing volume will be overwritten: {:?}", old.redacted());
                    format
                } else {
                    format.merge_existing(&old)?
                }
            }
            None => format,
        };
        if format.uuid.is_empty() {
            format.uuid = uuid::Uuid::new_v4().to_string();
        }
        self.chunk_size.store(format.chunk_size(), Ordering::Relaxed);

        let data = serde_json::to_vec(&format)
            .map_err(|err| MetaError::BadFormat(format!("json: {err}")))?;
        let _: () = con.set(SETTING, data).await?;

        let now = Timestamp::now();
        let mut root = Attr {
            kind: FileKind::Directory,
            mode: 0o777,
            nlink: 2,
            length: 4 << 10,
            parent: ROOT_INO,
            ..Default::default()
        };
        root.atime = now.secs;
        root.atime_ns = now.nanos;
        root.touch_mtime(now);
        let _: () = con.set(self.inode_key(ROOT_INO), encode_attr(&root)).await?;
        Ok(())
    }

    pub async fn load(&self) -> Result<Format, MetaError> {
        let mut con = self.shared();
        let body: Option<Vec<u8>> = con.get(SETTING).await?;
        let body = body.ok_or_else(|| MetaError::BadFormat("no volume found, run format first".into()))?;
        let format: Format = serde_json::from_slice(&body)
            .map_err(|err| MetaError::BadFormat(format!("json: {err}")))?;
        self.chunk_size.store(format.chunk_size(), Ordering::Relaxed);
        Ok(format)
    }

    pub async fn new_session(&self) -> Result<(), MetaError> {
        let mut con = self.shared();
        let sid: u64 = con
            .incr(NEXT_SESSION, 1)
            .await
            .map_err(|err| MetaError::Io(format!("create session: {err}")))?;
        self.sid.store(sid, Ordering::Relaxed);
        debug!("session id is {sid}");

        let _: Result<i64, _> = redis::cmd("ZADD")
            .arg(ALL_SESSIONS)
            .arg(chrono::Utc::now().timestamp())
            .arg(sid)
            .query_async(&mut con)
            .await;

        let load: Result<String, redis::RedisError> = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(LOOKUP_SCRIPT)
            .query_async(&mut con)
            .await;
        match load {
            Ok(_) => *self.lookup_script.lock() = Some(Arc::new(redis::Script::new(LOOKUP_SCRIPT))),
            Err(err) => {
                warn!("load lookup script: {err}");
                *self.lookup_script.lock() = None;
            }
        }

        // The sweepers hold only a weak handle so dropping the engine stops
        // them at their next iteration boundary.
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(RedisMeta::refresh_session_loop(self.me.clone())));
        tasks.push(tokio::spawn(RedisMeta::cleanup_deleted_files_loop(self.me.clone())));
        tasks.push(tokio::spawn(RedisMeta::cleanup_slices_loop(self.me.clone())));
        tasks.push(tokio::spawn(RedisMeta::cleanup_leaked_chunks(self.me.clone())));
        Ok(())
    }

    pub fn on_msg(&self, kind: MsgKind, cb: MsgCallback) {
        self.callbacks.lock().insert(kind, cb);
    }

    pub async fn open_file(&self, ctx: &Ctx, ino: Ino) -> Result<Attr, MetaError> {
        let attr = self.get_attr(ctx, ino).await?;
        let mut files = self.open_files.lock();
        *files.counts.entry(ino).or_insert(0) += 1;
        Ok(attr)
    }

    pub async fn close(&self, _ctx: &Ctx, ino: Ino) -> Result<(), MetaError> {
        let delete_now = {
            let mut files = self.open_files.lock();
            let refs = files.counts.get(&ino).copied().unwrap_or(0);
            if refs <= 1 {
                files.counts.remove(&ino);
                files.removed.take(&ino).is_some()
            } else {
                files.counts.insert(ino, refs - 1);
                false
            }
        };
        if delete_now
            && let Some(me) = self.me.upgrade()
        {
            tokio::spawn(async move {
                if me.delete_inode(ino).await.is_ok() {
                    let mut con = me.shared();
                    let _: Result<i64, _> = con.srem(me.session_key(me.sid()), ino).await;
                }
            });
        }
        Ok(())
    }

    pub(crate) async fn refresh_session_loop(me: Weak<RedisMeta>) {
        loop {
            let interval = match me.upgrade() {
                Some(engine) => engine.conf.heartbeat,
                None => return,
            };
            tokio::time::sleep(interval).await;
            let Some(engine) = me.upgrade() else {
                return;
            };
            let mut con = engine.shared();
            let _: Result<i64, _> = redis::cmd("ZADD")
                .arg(ALL_SESSIONS)
                .arg(chrono::Utc::now().timestamp())
                .arg(engine.sid())
                .query_async(&mut con)
                .await;
            let sweeper = engine.clone();
            tokio::spawn(async move {
                sweeper.clean_stale_sessions().await;
            });
        }
    }

    /// Reclaim sessions whose heartbeat went silent. Driven by the
    /// heartbeat loop; public so admin tooling can force a pass.
    pub async fn clean_stale_sessions(&self) {
        let mut con = self.shared();
        let now = chrono::Utc::now().timestamp();

        let dead: Vec<String> = match redis::cmd("ZRANGEBYSCORE")
            .arg(ALL_SESSIONS)
            .arg("-inf")
            .arg(now - SESSION_DEAD_AFTER)
            .arg("LIMIT")
            .arg(0)
            .arg(SESSION_SWEEP_LIMIT)
            .query_async(&mut con)
            .await
        {
            Ok(dead) => dead,
            Err(_) => return,
        };
        for sid in dead {
            if let Ok(sid) = sid.parse::<u64>() {
                self.clean_stale_session(sid).await;
            }
        }

        // Locks go earlier than sustained inodes: a silent client cannot be
        // holding them correctly anymore.
        let dead: Vec<String> = match redis::cmd("ZRANGEBYSCORE")
            .arg(ALL_SESSIONS)
            .arg("-inf")
            .arg(now - SESSION_LOCKS_DEAD_AFTER)
            .arg("LIMIT")
            .arg(0)
            .arg(SESSION_SWEEP_LIMIT)
            .query_async(&mut con)
            .await
        {
            Ok(dead) => dead,
            Err(_) => return,
        };
        if dead.is_empty() {
            return;
        }
        let sids: HashSet<String> = dead.into_iter().collect();

        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = match redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("lock*")
                .arg("COUNT")
                .arg(1000)
                .query_async(&mut con)
                .await
            {
                Ok(reply) => reply,
                Err(_) => return,
            };
            for key in keys {
                let owners: Vec<String> = match con.hkeys(&key).await {
                    Ok(owners) => owners,
                    Err(_) => continue,
                };
                for owner in owners {
                    if let Some((sid, _)) = owner.split_once('_')
                        && sids.contains(sid)
                    {
                        let removed: Result<i64, _> = con.hdel(&key, &owner).await;
                        info!("cleanup lock on {key} from session {sid}: {removed:?}");
                    }
                }
            }
            if next == 0 {
                return;
            }
            cursor = next;
        }
    }

    async fn clean_stale_session(&self, sid: u64) {
        let mut con = self.shared();
        let skey = self.session_key(sid);
        let sustained: Vec<u64> = match con.smembers(&skey).await {
            Ok(sustained) => sustained,
            Err(_) => return,
        };
        for ino in &sustained {
            match self.delete_inode(*ino).await {
                Ok(()) => {
                    let _: Result<i64, _> = con.srem(&skey, *ino).await;
                }
                Err(err) => warn!("failed to delete inode {ino}: {err}"),
            }
        }
        if sustained.is_empty() {
            let _: Result<i64, _> = con.del(&skey).await;
            let _: Result<i64, _> = con.zrem(ALL_SESSIONS, sid).await;
        }
    }
}
