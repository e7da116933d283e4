//! End-to-end tests of the metadata engine against a real Redis.
//!
//! All tests are ignored by default; run them with a local server:
//!
//! ```text
//! CORALFS_TEST_REDIS_URL=redis://127.0.0.1 cargo test -- --ignored
//! ```
//!
//! Each test uses its own database index so they can run concurrently.

use std::sync::Arc;
use std::time::Duration;

use coralfs_meta::{
    Ctx, FileKind, Format, MetaConfig, MetaError, Msg, MsgKind, RedisMeta, Slice, ROOT_INO,
};

const MIB: u64 = 1 << 20;

fn base_url() -> String {
    std::env::var("CORALFS_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1".to_string())
}

async fn engine(db: u8, chunk_size: u64) -> Arc<RedisMeta> {
    let url = format!("{}/{db}", base_url());
    flush_db(&url).await;
    let meta = RedisMeta::open(&url, MetaConfig::default())
        .await
        .expect("connect to redis");
    meta.init(
        Format {
            name: "test-vol".into(),
            storage: "file".into(),
            bucket: "/tmp/coralfs-test".into(),
            chunk_size,
            ..Default::default()
        },
        true,
    )
    .await
    .expect("format volume");
    meta.new_session().await.expect("register session");
    register_noop_data_plane(&meta);
    meta
}

async fn flush_db(url: &str) {
    let client = redis::Client::open(url).expect("parse url");
    let mut con = client
        .get_multiplexed_async_connection()
        .await
        .expect("connect");
    let _: () = redis::cmd("FLUSHDB").query_async(&mut con).await.unwrap();
}

/// The engine only records metadata; pretend object deletions/compactions
/// always succeed so reclamation paths can run to completion.
fn register_noop_data_plane(meta: &Arc<RedisMeta>) {
    meta.on_msg(
        MsgKind::DeleteChunk,
        Arc::new(|_msg: Msg| Box::pin(async { Ok::<(), anyhow::Error>(()) })),
    );
    meta.on_msg(
        MsgKind::CompactChunk,
        Arc::new(|_msg: Msg| Box::pin(async { Ok::<(), anyhow::Error>(()) })),
    );
}

async fn raw(url: &str) -> redis::aio::MultiplexedConnection {
    redis::Client::open(url)
        .expect("parse url")
        .get_multiplexed_async_connection()
        .await
        .expect("connect")
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn mkdir_write_read_chain() {
    let meta = engine(2, 64 * MIB).await;
    let ctx = Ctx::new(0, 0, 1);

    let (a, _) = meta.mkdir(&ctx, ROOT_INO, "a", 0o755, 0).await.unwrap();
    let (b, _) = meta.mkdir(&ctx, a, "b", 0o755, 0).await.unwrap();
    let (f, _) = meta.create(&ctx, b, "f", 0o644, 0o022).await.unwrap();

    meta.write(
        &ctx,
        f,
        0,
        0,
        Slice {
            id: 100,
            size: 4096,
            off: 0,
            len: 4096,
        },
    )
    .await
    .unwrap();

    let slices = meta.read(&ctx, f, 0).await.unwrap();
    assert_eq!(slices.len(), 1);
    assert_eq!(slices[0].id, 100);
    assert_eq!(slices[0].len, 4096);

    let attr = meta.get_attr(&ctx, f).await.unwrap();
    assert_eq!(attr.length, 4096);
    assert_eq!(attr.kind, FileKind::Regular);

    // directory nlink law: root gained one subdirectory
    let root = meta.get_attr(&ctx, ROOT_INO).await.unwrap();
    assert_eq!(root.nlink, 3);
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn link_unlink_nlink_accounting() {
    let meta = engine(3, 64 * MIB).await;
    let ctx = Ctx::new(0, 0, 1);

    let (x, _) = meta.create(&ctx, ROOT_INO, "x", 0o644, 0).await.unwrap();
    meta.close(&ctx, x).await.unwrap();

    let attr = meta.link(&ctx, x, ROOT_INO, "y").await.unwrap();
    assert_eq!(attr.nlink, 2);

    meta.unlink(&ctx, ROOT_INO, "x").await.unwrap();
    assert_eq!(meta.get_attr(&ctx, x).await.unwrap().nlink, 1);

    meta.unlink(&ctx, ROOT_INO, "y").await.unwrap();
    assert!(matches!(
        meta.get_attr(&ctx, x).await,
        Err(MetaError::NotFound)
    ));

    // idempotence: unlinking an absent name reports ENOENT
    assert!(matches!(
        meta.unlink(&ctx, ROOT_INO, "x").await,
        Err(MetaError::NotFound)
    ));
    // and a second close of an already-closed handle is a no-op
    meta.close(&ctx, x).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn sparse_truncate_materializes_edge_chunks_only() {
    let meta = engine(4, 4 * MIB).await;
    let ctx = Ctx::new(0, 0, 1);

    let (f, _) = meta.create(&ctx, ROOT_INO, "sparse", 0o644, 0).await.unwrap();
    meta.truncate(&ctx, f, 10 * MIB).await.unwrap();

    let head = meta.read(&ctx, f, 0).await.unwrap();
    assert_eq!(head.len(), 1);
    assert_eq!(head[0].id, 0);
    assert_eq!(head[0].len as u64, 4 * MIB);

    // the fully-spanned middle chunk is never materialized
    assert!(meta.read(&ctx, f, 1).await.unwrap().is_empty());

    let tail = meta.read(&ctx, f, 2).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].id, 0);
    assert_eq!(tail[0].len as u64, 2 * MIB);

    assert_eq!(meta.get_attr(&ctx, f).await.unwrap().length, 10 * MIB);
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn concurrent_renames_have_one_winner() {
    let meta = engine(5, 64 * MIB).await;
    let ctx = Ctx::new(0, 0, 1);

    let (p, _) = meta.mkdir(&ctx, ROOT_INO, "p", 0o755, 0).await.unwrap();
    meta.create(&ctx, p, "a", 0o644, 0).await.unwrap();

    let m1 = meta.clone();
    let m2 = meta.clone();
    let c1 = ctx.clone();
    let c2 = ctx.clone();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { m1.rename(&c1, p, "a", p, "b").await }),
        tokio::spawn(async move { m2.rename(&c2, p, "a", p, "c").await }),
    );
    let outcomes = [r1.unwrap(), r2.unwrap()];
    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one rename must commit: {outcomes:?}");
    let loser = outcomes.iter().find(|r| r.is_err()).unwrap();
    assert!(matches!(
        loser,
        Err(MetaError::NotFound) | Err(MetaError::Again)
    ));

    // no observer may see both names, nor neither
    let mut found = 0;
    for name in ["b", "c"] {
        if meta.lookup(&ctx, p, name).await.is_ok() {
            found += 1;
        }
    }
    assert_eq!(found, 1);
    assert!(meta.lookup(&ctx, p, "a").await.is_err());
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn copy_file_range_shares_chunks() {
    let db = 6;
    let meta = engine(db, 4 * MIB).await;
    let ctx = Ctx::new(0, 0, 1);

    let (src, _) = meta.create(&ctx, ROOT_INO, "src", 0o644, 0).await.unwrap();
    let (dst, _) = meta.create(&ctx, ROOT_INO, "dst", 0o644, 0).await.unwrap();

    let chunk_id = meta.new_chunk(&ctx).await.unwrap();
    let size = (4 * MIB) as u32;
    meta.write(
        &ctx,
        src,
        0,
        0,
        Slice {
            id: chunk_id,
            size,
            off: 0,
            len: size,
        },
    )
    .await
    .unwrap();

    let copied = meta
        .copy_file_range(&ctx, src, MIB, dst, 0, 3 * MIB, 0)
        .await
        .unwrap();
    assert_eq!(copied, 3 * MIB);

    let slices = meta.read(&ctx, dst, 0).await.unwrap();
    let shared: Vec<&Slice> = slices.iter().filter(|s| s.id == chunk_id).collect();
    assert!(!shared.is_empty(), "destination must reference the source object");
    assert_eq!(shared[0].off as u64, MIB);
    assert_eq!(shared[0].len as u64, 3 * MIB);
    assert_eq!(meta.get_attr(&ctx, dst).await.unwrap().length, 3 * MIB);

    // the share bumped the refcount key from implicit-1 to stored 1
    let url = format!("{}/{db}", base_url());
    let mut con = raw(&url).await;
    let refs: i64 = redis::cmd("GET")
        .arg(format!("k{chunk_id}_{size}"))
        .query_async(&mut con)
        .await
        .unwrap();
    assert_eq!(refs, 1);
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn dead_session_is_reclaimed() {
    let db = 7;
    let url = format!("{}/{db}", base_url());
    let meta_a = engine(db, 64 * MIB).await;
    let ctx = Ctx::new(0, 0, 1);

    // A holds an unlinked file open and an exclusive flock.
    let (f, _) = meta_a.create(&ctx, ROOT_INO, "held", 0o644, 0).await.unwrap();
    meta_a.flock(&ctx, f, 7, coralfs_meta::FlockKind::Exclusive).await.unwrap();
    meta_a.unlink(&ctx, ROOT_INO, "held").await.unwrap();
    assert!(meta_a.get_attr(&ctx, f).await.is_ok(), "sustained while open");

    // Silence A's heartbeat far enough into the past.
    let sid = meta_a.session_id();
    let mut con = raw(&url).await;
    let stale = chrono::Utc::now().timestamp() - 700;
    let _: i64 = redis::cmd("ZADD")
        .arg("sessions")
        .arg(stale)
        .arg(sid)
        .query_async(&mut con)
        .await
        .unwrap();

    // Another client notices and reclaims.
    let meta_b = RedisMeta::open(&url, MetaConfig::default()).await.unwrap();
    register_noop_data_plane(&meta_b);
    meta_b.new_session().await.unwrap();
    meta_b.clean_stale_sessions().await;

    assert!(matches!(
        meta_b.get_attr(&ctx, f).await,
        Err(MetaError::NotFound)
    ));
    let flock_owners: i64 = redis::cmd("HLEN")
        .arg(format!("lockf{f}"))
        .query_async(&mut con)
        .await
        .unwrap();
    assert_eq!(flock_owners, 0, "dead session's lock entries are gone");
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn xattr_and_symlink_round_trips() {
    let meta = engine(8, 64 * MIB).await;
    let ctx = Ctx::new(0, 0, 1);

    let (f, _) = meta.create(&ctx, ROOT_INO, "f", 0o644, 0).await.unwrap();
    meta.set_xattr(&ctx, f, "user.tag", b"blue").await.unwrap();
    assert_eq!(meta.get_xattr(&ctx, f, "user.tag").await.unwrap(), b"blue");
    assert_eq!(meta.list_xattr(&ctx, f).await.unwrap(), b"user.tag\0");
    meta.remove_xattr(&ctx, f, "user.tag").await.unwrap();
    assert!(matches!(
        meta.get_xattr(&ctx, f, "user.tag").await,
        Err(MetaError::NoAttr)
    ));
    assert!(matches!(
        meta.remove_xattr(&ctx, f, "user.tag").await,
        Err(MetaError::NoAttr)
    ));

    let (s, attr) = meta
        .symlink(&ctx, ROOT_INO, "ln", "../target/path")
        .await
        .unwrap();
    assert_eq!(attr.kind, FileKind::Symlink);
    assert_eq!(attr.length, "../target/path".len() as u64);
    assert_eq!(&meta.read_link(&ctx, s).await.unwrap()[..], b"../target/path");
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn mkdir_rmdir_restores_parent() {
    let meta = engine(9, 64 * MIB).await;
    let ctx = Ctx::new(0, 0, 1);

    let before = meta.get_attr(&ctx, ROOT_INO).await.unwrap();
    let (d, _) = meta.mkdir(&ctx, ROOT_INO, "d", 0o755, 0).await.unwrap();
    assert_eq!(
        meta.get_attr(&ctx, ROOT_INO).await.unwrap().nlink,
        before.nlink + 1
    );

    // a non-empty directory refuses rmdir
    meta.create(&ctx, d, "f", 0o644, 0).await.unwrap();
    assert!(matches!(
        meta.rmdir(&ctx, ROOT_INO, "d").await,
        Err(MetaError::NotEmpty)
    ));
    meta.unlink(&ctx, d, "f").await.unwrap();

    meta.rmdir(&ctx, ROOT_INO, "d").await.unwrap();
    assert_eq!(
        meta.get_attr(&ctx, ROOT_INO).await.unwrap().nlink,
        before.nlink
    );
    assert!(matches!(
        meta.lookup(&ctx, ROOT_INO, "d").await,
        Err(MetaError::NotFound)
    ));
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn overwrite_read_reflects_overlay() {
    let meta = engine(10, 64 * MIB).await;
    let ctx = Ctx::new(0, 0, 1);

    let (f, _) = meta.create(&ctx, ROOT_INO, "f", 0o644, 0).await.unwrap();
    meta.write(&ctx, f, 0, 0, Slice { id: 11, size: 100, off: 0, len: 100 })
        .await
        .unwrap();
    meta.write(&ctx, f, 0, 50, Slice { id: 12, size: 100, off: 0, len: 100 })
        .await
        .unwrap();

    let slices = meta.read(&ctx, f, 0).await.unwrap();
    let layout: Vec<(u64, u32, u32)> = slices.iter().map(|s| (s.id, s.off, s.len)).collect();
    assert_eq!(layout, vec![(11, 0, 50), (12, 0, 100)]);
    assert_eq!(meta.get_attr(&ctx, f).await.unwrap().length, 150);
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn remove_all_clears_subtree() {
    let meta = engine(11, 64 * MIB).await;
    let ctx = Ctx::new(0, 0, 1);

    let (top, _) = meta.mkdir(&ctx, ROOT_INO, "top", 0o755, 0).await.unwrap();
    let (sub, _) = meta.mkdir(&ctx, top, "sub", 0o755, 0).await.unwrap();
    meta.create(&ctx, top, "f1", 0o644, 0).await.unwrap();
    meta.create(&ctx, sub, "f2", 0o644, 0).await.unwrap();

    meta.remove_all(&ctx, ROOT_INO, "top").await.unwrap();
    assert!(matches!(
        meta.lookup(&ctx, ROOT_INO, "top").await,
        Err(MetaError::NotFound)
    ));

    // give the spawned chunk deletions a moment before the engine drops
    tokio::time::sleep(Duration::from_millis(100)).await;
}
