//! Metadata engine and schema.
//!
//! Responsibilities:
//! - Record every filesystem entity (directory tree, inode attributes,
//!   chunk/slice mapping, xattrs, advisory locks, client sessions) in a
//!   Redis-compatible KV store under a flat, prefix-reserved key namespace.
//! - Expose safe, atomic POSIX operations through the [`store::Meta`] trait;
//!   every mutation is one optimistic WATCH/MULTI/EXEC transaction.
//! - Run the background reclamation loops (delayed file deletion, orphan
//!   slices, leaked chunks, stale sessions) that keep the object store and
//!   the metadata in agreement.
//!
//! Submodules:
//! - `types`: inode/attr/slice/session value types shared across the crate
//! - `codec`: fixed-width big-endian encoding of attrs, entries and slices
//! - `overlay`: read-side slice resolution (later writes occlude earlier)
//! - `plock`: POSIX byte-range lock arithmetic
//! - `store`: the `Meta` trait and data-plane message contracts
//! - `config`: engine tuning knobs and the Redis URL conventions
//! - `format`: the persisted volume format record
//! - `metrics`: transaction duration/restart counters for the collector
//! - `redis`: the Redis-backed engine implementation

pub mod codec;
pub mod config;
pub mod error;
pub mod format;
pub mod metrics;
pub mod overlay;
pub mod plock;
pub mod redis;
pub mod store;
pub mod types;

pub use error::MetaError;
pub use self::redis::RedisMeta;
pub use store::Meta;
