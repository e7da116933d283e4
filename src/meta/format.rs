//! The persisted volume format record.
//!
//! Written once under the fixed `setting` key when the volume is formatted.
//! A re-format needs an explicit force flag; without it only the object
//! storage credentials may change, everything else must match the existing
//! record.

use serde::{Deserialize, Serialize};

use crate::meta::error::MetaError;
use crate::meta::types::CHUNK_SIZE;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Format {
    pub name: String,
    pub uuid: String,
    /// Object storage scheme, e.g. "s3".
    pub storage: String,
    /// Object storage endpoint or bucket URL.
    pub bucket: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    /// Chunk size in bytes; 0 falls back to the engine default.
    #[serde(default)]
    pub chunk_size: u64,
    #[serde(default)]
    pub compression: String,
    #[serde(default)]
    pub encrypt_key: String,
}

impl Format {
    pub fn chunk_size(&self) -> u64 {
        if self.chunk_size == 0 {
            CHUNK_SIZE
        } else {
            self.chunk_size
        }
    }

    /// Validate an update against the existing record. Only the object
    /// storage credentials may change; the UUID is always kept.
    pub fn merge_existing(mut self, old: &Format) -> Result<Format, MetaError> {
        self.uuid = old.uuid.clone();
        let mut comparable = old.clone();
        comparable.access_key = self.access_key.clone();
        comparable.secret_key = self.secret_key.clone();
        if comparable != self {
            return Err(MetaError::BadFormat(format!(
                "cannot update volume {} without force: only credentials may change",
                old.name
            )));
        }
        Ok(self)
    }

    /// Redacted copy safe for logging.
    pub fn redacted(&self) -> Format {
        let mut copy = self.clone();
        if !copy.secret_key.is_empty() {
            copy.secret_key = "removed".into();
        }
        if !copy.encrypt_key.is_empty() {
            copy.encrypt_key = "removed".into();
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Format {
        Format {
            name: "vol".into(),
            uuid: "2f0a6f8e".into(),
            storage: "s3".into(),
            bucket: "http://bucket.local".into(),
            access_key: "ak".into(),
            secret_key: "sk".into(),
            chunk_size: 1 << 26,
            compression: "lz4".into(),
            encrypt_key: String::new(),
        }
    }

    #[test]
    fn credentials_may_change() {
        let old = base();
        let mut new = base();
        new.access_key = "ak2".into();
        new.secret_key = "sk2".into();
        new.uuid = "ignored".into();

        let merged = new.merge_existing(&old).unwrap();
        assert_eq!(merged.uuid, old.uuid);
        assert_eq!(merged.access_key, "ak2");
    }

    #[test]
    fn other_fields_may_not_change() {
        let old = base();
        let mut new = base();
        new.bucket = "http://elsewhere".into();
        assert!(matches!(
            new.merge_existing(&old),
            Err(MetaError::BadFormat(_))
        ));
    }

    #[test]
    fn chunk_size_defaults() {
        let mut f = base();
        f.chunk_size = 0;
        assert_eq!(f.chunk_size(), CHUNK_SIZE);
        f.chunk_size = 4 << 20;
        assert_eq!(f.chunk_size(), 4 << 20);
    }

    #[test]
    fn redaction_hides_secrets() {
        let f = base().redacted();
        assert_eq!(f.secret_key, "removed");
        assert_eq!(f.access_key, "ak");
    }

    #[test]
    fn json_roundtrip() {
        let f = base();
        let body = serde_json::to_vec(&f).unwrap();
        let parsed: Format = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed, f);
    }
}
