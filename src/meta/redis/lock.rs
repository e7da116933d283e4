//! Advisory locks: whole-file flocks and POSIX byte-range locks.
//!
//! Lock state lives in per-inode hashes keyed by `{sid}_{owner}`, so a dead
//! session's entries can be swept without parsing the values. Conflicts are
//! reported as EAGAIN; blocking-lock retries are the bridge's business.

use redis::AsyncCommands;

use crate::meta::error::MetaError;
use crate::meta::plock::{conflicts, update_locks, PlockRecord, PlockType};
use crate::meta::redis::RedisMeta;
use crate::meta::types::{Ctx, FlockKind, Ino};

impl RedisMeta {
    pub async fn flock(
        &self,
        ctx: &Ctx,
        ino: Ino,
        owner: u64,
        kind: FlockKind,
    ) -> Result<(), MetaError> {
        let lock_key = self.flock_key(ino);
        let field = self.owner_field(owner);
        self.txn(ctx, std::slice::from_ref(&lock_key), |mut tx| {
            let lock_key = lock_key.clone();
            let field = field.clone();
            async move {
                let owners = tx.hgetall(&lock_key).await?;
                let mut pipe = redis::pipe();
                pipe.atomic();
                match kind {
                    FlockKind::Unlock => {
                        pipe.hdel(&lock_key, &field).ignore();
                    }
                    FlockKind::Shared => {
                        if owners
                            .iter()
                            .any(|(holder, state)| holder != &field && state.as_slice() == b"W")
                        {
                            return Err(MetaError::Again);
                        }
                        pipe.hset(&lock_key, &field, "R").ignore();
                    }
                    FlockKind::Exclusive => {
                        if owners.iter().any(|(holder, _)| holder != &field) {
                            return Err(MetaError::Again);
                        }
                        pipe.hset(&lock_key, &field, "W").ignore();
                    }
                }
                Ok(tx.commit::<()>(&pipe).await?.map(|_| ()))
            }
        })
        .await
    }

    pub async fn get_plock(
        &self,
        ctx: &Ctx,
        ino: Ino,
        owner: u64,
        record: PlockRecord,
    ) -> Result<Option<PlockRecord>, MetaError> {
        ctx.check_deadline()?;
        let mut con = self.shared();
        let owners: Vec<(String, Vec<u8>)> = con.hgetall(self.plock_key(ino)).await?;
        let field = self.owner_field(owner);
        let my_sid = self.sid().to_string();
        for (holder, buf) in owners {
            if holder == field {
                continue;
            }
            for held in PlockRecord::decode_list(&buf)? {
                let blocked = (record.kind == PlockType::Write || held.kind == PlockType::Write)
                    && held.overlaps(record.start, record.end);
                if blocked {
                    // A pid only means something inside the session it came from.
                    let same_session = holder
                        .split_once('_')
                        .is_some_and(|(sid, _)| sid == my_sid);
                    return Ok(Some(PlockRecord {
                        pid: if same_session { held.pid } else { 0 },
                        ..held
                    }));
                }
            }
        }
        Ok(None)
    }

    pub async fn set_plock(
        &self,
        ctx: &Ctx,
        ino: Ino,
        owner: u64,
        record: PlockRecord,
    ) -> Result<(), MetaError> {
        if record.kind != PlockType::Unlock && record.start >= record.end {
            return Err(MetaError::Invalid);
        }
        let lock_key = self.plock_key(ino);
        let field = self.owner_field(owner);
        self.txn(ctx, std::slice::from_ref(&lock_key), |mut tx| {
            let lock_key = lock_key.clone();
            let field = field.clone();
            async move {
                let owners = tx.hgetall(&lock_key).await?;
                if record.kind != PlockType::Unlock {
                    for (holder, buf) in &owners {
                        if holder == &field {
                            continue;
                        }
                        let theirs = PlockRecord::decode_list(buf)?;
                        if conflicts(record.kind, record.start, record.end, &theirs) {
                            return Err(MetaError::Again);
                        }
                    }
                }

                let mine = owners
                    .iter()
                    .find(|(holder, _)| holder == &field)
                    .map(|(_, buf)| PlockRecord::decode_list(buf))
                    .transpose()?
                    .unwrap_or_default();
                let updated = update_locks(&mine, record);

                let mut pipe = redis::pipe();
                pipe.atomic();
                if updated.is_empty() {
                    pipe.hdel(&lock_key, &field).ignore();
                } else {
                    pipe.hset(&lock_key, &field, PlockRecord::encode_list(&updated))
                        .ignore();
                }
                Ok(tx.commit::<()>(&pipe).await?.map(|_| ()))
            }
        })
        .await
    }
}
