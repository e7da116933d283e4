//! Extended attributes, one hash per inode.

use redis::AsyncCommands;

use crate::meta::error::MetaError;
use crate::meta::redis::RedisMeta;
use crate::meta::types::{Ctx, Ino};

impl RedisMeta {
    pub async fn get_xattr(&self, ctx: &Ctx, ino: Ino, name: &str) -> Result<Vec<u8>, MetaError> {
        ctx.check_deadline()?;
        let mut con = self.shared();
        let value: Option<Vec<u8>> = con.hget(self.xattr_key(ino), name).await?;
        value.ok_or(MetaError::NoAttr)
    }

    pub async fn list_xattr(&self, ctx: &Ctx, ino: Ino) -> Result<Vec<u8>, MetaError> {
        ctx.check_deadline()?;
        let mut con = self.shared();
        let names: Vec<String> = con.hkeys(self.xattr_key(ino)).await?;
        let mut out = Vec::new();
        for name in names {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        Ok(out)
    }

    pub async fn set_xattr(
        &self,
        ctx: &Ctx,
        ino: Ino,
        name: &str,
        value: &[u8],
    ) -> Result<(), MetaError> {
        ctx.check_deadline()?;
        let mut con = self.shared();
        let _: i64 = con.hset(self.xattr_key(ino), name, value).await?;
        Ok(())
    }

    pub async fn remove_xattr(&self, ctx: &Ctx, ino: Ino, name: &str) -> Result<(), MetaError> {
        ctx.check_deadline()?;
        let mut con = self.shared();
        let removed: i64 = con.hdel(self.xattr_key(ino), name).await?;
        if removed == 0 {
            return Err(MetaError::NoAttr);
        }
        Ok(())
    }
}
