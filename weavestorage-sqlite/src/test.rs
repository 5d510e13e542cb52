use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use weaveserver_common::{BlockingThreadpool, Metrics};
use weavestorage_db_common::{
    error::DbErrorIntrospect, params, util::SyncTimestamp, Db, Sorting, UserIdentifier,
    FIRST_CUSTOM_COLLECTION_ID,
};
use weavestorage_settings::Settings;

use crate::{pool::run_embedded_migrations, DbError, SqliteDbPool};

static DB_SEQ: AtomicU32 = AtomicU32::new(0);

/// Build a Db against a fresh shared-cache in-memory database.
///
/// The pooled connection inside the returned Db keeps the shared cache
/// alive, so migrations can run on a second short-lived connection.
async fn db() -> Result<Box<dyn Db<Error = DbError>>, DbError> {
    let _ = env_logger::try_init();
    let seq = DB_SEQ.fetch_add(1, Ordering::SeqCst);
    let mut settings = Settings::default();
    settings.database_url = format!(
        "file:weavestorage_test_{}_{}?mode=memory&cache=shared",
        std::process::id(),
        seq
    );
    settings.database_pool_max_size = 1;

    let pool = SqliteDbPool::new_without_migrations(
        &settings,
        &Metrics::noop(),
        Arc::new(BlockingThreadpool::default()),
    )?;
    let db = pool.get_sync()?;
    run_embedded_migrations(&settings.database_url)?;
    Ok(Box::new(db))
}

fn uid(n: u64) -> UserIdentifier {
    UserIdentifier {
        legacy_id: n,
        ..Default::default()
    }
}

fn pbso(
    user: u64,
    coll: &str,
    id: &str,
    payload: Option<&str>,
    sortindex: Option<i32>,
    ttl: Option<u32>,
) -> params::PutBso {
    params::PutBso {
        user_id: uid(user),
        collection: coll.to_owned(),
        id: id.to_owned(),
        payload: payload.map(ToOwned::to_owned),
        sortindex,
        ttl,
    }
}

fn gbso(user: u64, coll: &str, id: &str) -> params::GetBso {
    params::GetBso {
        user_id: uid(user),
        collection: coll.to_owned(),
        id: id.to_owned(),
    }
}

fn ts(seconds: f64) -> SyncTimestamp {
    SyncTimestamp::from_seconds(seconds)
}

#[tokio::test]
async fn bso_round_trip() -> Result<(), DbError> {
    let mut db = db().await?;
    db.set_timestamp(ts(100.00));
    db.put_bso(pbso(1, "bookmarks", "b0", Some("hello"), Some(12), None))
        .await?;

    let bso = db
        .get_bso(gbso(1, "bookmarks", "b0"))
        .await?
        .expect("bso should exist");
    assert_eq!(bso.payload, "hello");
    assert_eq!(bso.sortindex, Some(12));
    assert_eq!(bso.modified, ts(100.00));
    Ok(())
}

#[tokio::test]
async fn ttl_only_update_leaves_modified_alone() -> Result<(), DbError> {
    let mut db = db().await?;
    db.set_timestamp(ts(100.00));
    db.put_bso(pbso(1, "bookmarks", "b0", Some("hello"), None, None))
        .await?;

    db.set_timestamp(ts(200.00));
    db.put_bso(pbso(1, "bookmarks", "b0", None, None, Some(3600)))
        .await?;
    let bso = db.get_bso(gbso(1, "bookmarks", "b0")).await?.unwrap();
    assert_eq!(bso.modified, ts(100.00));
    assert_eq!(bso.payload, "hello");

    // but a payload change does advance it
    db.set_timestamp(ts(300.00));
    db.put_bso(pbso(1, "bookmarks", "b0", Some("world"), None, None))
        .await?;
    let bso = db.get_bso(gbso(1, "bookmarks", "b0")).await?.unwrap();
    assert_eq!(bso.modified, ts(300.00));
    assert_eq!(bso.payload, "world");
    Ok(())
}

#[tokio::test]
async fn zero_ttl_expires_immediately_but_can_be_rewritten() -> Result<(), DbError> {
    let mut db = db().await?;
    db.set_timestamp(ts(100.00));
    db.put_bso(pbso(1, "tabs", "t0", Some("gone"), None, Some(0)))
        .await?;
    assert!(db.get_bso(gbso(1, "tabs", "t0")).await?.is_none());

    db.set_timestamp(ts(101.00));
    db.put_bso(pbso(1, "tabs", "t0", Some("back"), None, Some(60)))
        .await?;
    let bso = db.get_bso(gbso(1, "tabs", "t0")).await?.unwrap();
    assert_eq!(bso.payload, "back");
    assert_eq!(bso.modified, ts(101.00));
    Ok(())
}

#[tokio::test]
async fn expired_bsos_are_invisible_to_reads() -> Result<(), DbError> {
    let mut db = db().await?;
    db.set_timestamp(ts(100.00));
    db.put_bso(pbso(1, "history", "h0", Some("x"), None, Some(10)))
        .await?;
    db.put_bso(pbso(1, "history", "h1", Some("y"), None, Some(10_000)))
        .await?;

    db.set_timestamp(ts(200.00));
    let result = db
        .get_bsos(params::GetBsos {
            user_id: uid(1),
            collection: "history".to_owned(),
            newer: None,
            older: None,
            sort: Sorting::Newest,
            limit: None,
            offset: None,
            ids: vec![],
            full: true,
        })
        .await?;
    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0].id, "h1");

    let counts = db.get_collection_counts(uid(1)).await?;
    assert_eq!(counts.get("history"), Some(&1));
    Ok(())
}

fn get_bsos_params(
    user: u64,
    coll: &str,
    newer: Option<SyncTimestamp>,
    sort: Sorting,
    limit: Option<u32>,
    offset: Option<params::Offset>,
) -> params::GetBsos {
    params::GetBsos {
        user_id: uid(user),
        collection: coll.to_owned(),
        newer,
        older: None,
        sort,
        limit,
        offset,
        ids: vec![],
        full: true,
    }
}

#[tokio::test]
async fn pagination_cursor_never_repeats_or_skips() -> Result<(), DbError> {
    let mut db = db().await?;
    // Three groups of four, written at t1 < t2 < t3
    for (group, seconds) in [(0u32, 100.00), (1, 200.00), (2, 300.00)] {
        db.set_timestamp(ts(seconds));
        for i in 0..4u32 {
            let id = format!("{:02}", group * 4 + i);
            db.put_bso(pbso(1, "bookmarks", &id, Some("payload"), None, None))
                .await?;
        }
    }

    // newer=t1 excludes the first group entirely
    let page1 = db
        .get_bsos(get_bsos_params(
            1,
            "bookmarks",
            Some(ts(100.00)),
            Sorting::Oldest,
            Some(5),
            None,
        ))
        .await?;
    let ids: Vec<&str> = page1.items.iter().map(|b| b.id.as_str()).collect();
    assert_eq!(ids, vec!["04", "05", "06", "07", "08"]);
    let mut last = ts(0.0);
    for item in &page1.items {
        assert!(item.modified >= last);
        last = item.modified;
    }

    let cursor = params::Offset::from_str(&page1.offset.expect("cursor expected"))
        .expect("cursor should parse");
    assert_eq!(cursor.timestamp, Some(ts(300.00)));
    assert_eq!(cursor.offset, 1);

    let page2 = db
        .get_bsos(get_bsos_params(
            1,
            "bookmarks",
            Some(ts(100.00)),
            Sorting::Oldest,
            Some(5),
            Some(cursor),
        ))
        .await?;
    let ids: Vec<&str> = page2.items.iter().map(|b| b.id.as_str()).collect();
    assert_eq!(ids, vec!["09", "10", "11"]);
    assert!(page2.offset.is_none());
    Ok(())
}

#[tokio::test]
async fn pagination_cursor_walks_a_same_timestamp_group() -> Result<(), DbError> {
    let mut db = db().await?;
    db.set_timestamp(ts(100.00));
    for i in 0..7u32 {
        db.put_bso(pbso(1, "tabs", &format!("{:02}", i), Some("x"), None, None))
            .await?;
    }

    let mut seen = vec![];
    let mut offset = None;
    loop {
        let page = db
            .get_bsos(get_bsos_params(1, "tabs", None, Sorting::Oldest, Some(3), offset))
            .await?;
        seen.extend(page.items.iter().map(|b| b.id.clone()));
        match page.offset {
            Some(cursor) => offset = Some(params::Offset::from_str(&cursor).unwrap()),
            None => break,
        }
    }
    assert_eq!(
        seen,
        (0..7).map(|i| format!("{:02}", i)).collect::<Vec<_>>()
    );
    Ok(())
}

#[tokio::test]
async fn quota_rejects_writes_that_would_overflow() -> Result<(), DbError> {
    let mut db = db().await?;
    db.set_quota(true, 1024, true);
    db.set_timestamp(ts(100.00));
    db.put_bso(pbso(1, "history", "big", Some(&"x".repeat(900)), None, None))
        .await?;

    db.set_timestamp(ts(200.00));
    let err = db
        .put_bso(pbso(1, "history", "straw", Some(&"y".repeat(200)), None, None))
        .await
        .expect_err("expected quota rejection");
    assert!(err.is_quota());

    // the prior BSO is untouched
    let bso = db.get_bso(gbso(1, "history", "big")).await?.unwrap();
    assert_eq!(bso.payload.len(), 900);
    assert_eq!(bso.modified, ts(100.00));
    Ok(())
}

#[tokio::test]
async fn batch_commit_materializes_all_items_at_commit_time() -> Result<(), DbError> {
    let mut db = db().await?;
    db.set_timestamp(ts(100.00));
    let new_batch = db
        .create_batch(params::CreateBatch {
            user_id: uid(1),
            collection: "bookmarks".to_owned(),
            bsos: vec![
                params::PostCollectionBso {
                    id: "a".to_owned(),
                    sortindex: None,
                    payload: Some("A".to_owned()),
                    ttl: None,
                },
                params::PostCollectionBso {
                    id: "b".to_owned(),
                    sortindex: None,
                    payload: Some("B".to_owned()),
                    ttl: None,
                },
            ],
        })
        .await?;

    // nothing is visible until the commit
    assert!(db.get_bso(gbso(1, "bookmarks", "a")).await?.is_none());

    db.set_timestamp(ts(150.00));
    db.append_to_batch(params::AppendToBatch {
        user_id: uid(1),
        collection: "bookmarks".to_owned(),
        batch: new_batch.clone(),
        bsos: vec![params::PostCollectionBso {
            id: "c".to_owned(),
            sortindex: None,
            payload: Some("C".to_owned()),
            ttl: None,
        }],
    })
    .await?;

    db.set_timestamp(ts(200.00));
    let batch = db
        .get_batch(params::GetBatch {
            user_id: uid(1),
            collection: "bookmarks".to_owned(),
            id: new_batch.id.clone(),
        })
        .await?
        .expect("batch should validate");
    let modified = db
        .commit_batch(params::CommitBatch {
            user_id: uid(1),
            collection: "bookmarks".to_owned(),
            batch,
        })
        .await?;
    assert_eq!(modified, ts(200.00));

    for id in ["a", "b", "c"] {
        let bso = db.get_bso(gbso(1, "bookmarks", id)).await?.unwrap();
        assert_eq!(bso.modified, ts(200.00));
    }

    // a committed batch id must not be resurrectable
    let valid = db
        .validate_batch(params::ValidateBatch {
            user_id: uid(1),
            collection: "bookmarks".to_owned(),
            id: new_batch.id,
        })
        .await?;
    assert!(!valid);
    Ok(())
}

#[tokio::test]
async fn batch_append_is_last_write_wins() -> Result<(), DbError> {
    let mut db = db().await?;
    db.set_timestamp(ts(100.00));
    let new_batch = db
        .create_batch(params::CreateBatch {
            user_id: uid(1),
            collection: "tabs".to_owned(),
            bsos: vec![params::PostCollectionBso {
                id: "dup".to_owned(),
                sortindex: None,
                payload: Some("first".to_owned()),
                ttl: None,
            }],
        })
        .await?;
    db.append_to_batch(params::AppendToBatch {
        user_id: uid(1),
        collection: "tabs".to_owned(),
        batch: new_batch.clone(),
        bsos: vec![params::PostCollectionBso {
            id: "dup".to_owned(),
            sortindex: None,
            payload: Some("second".to_owned()),
            ttl: None,
        }],
    })
    .await?;

    db.set_timestamp(ts(110.00));
    let batch = db
        .get_batch(params::GetBatch {
            user_id: uid(1),
            collection: "tabs".to_owned(),
            id: new_batch.id,
        })
        .await?
        .unwrap();
    db.commit_batch(params::CommitBatch {
        user_id: uid(1),
        collection: "tabs".to_owned(),
        batch,
    })
    .await?;

    let bso = db.get_bso(gbso(1, "tabs", "dup")).await?.unwrap();
    assert_eq!(bso.payload, "second");
    Ok(())
}

#[tokio::test]
async fn collection_registry_ids() -> Result<(), DbError> {
    let mut db = db().await?;
    assert_eq!(db.get_collection_id("bookmarks").await?, 7);
    let custom = db.create_collection("custom-stuff").await?;
    assert!(custom >= FIRST_CUSTOM_COLLECTION_ID);
    // creating again is a no-op returning the same id
    assert_eq!(db.create_collection("custom-stuff").await?, custom);
    Ok(())
}

#[tokio::test]
async fn delete_semantics() -> Result<(), DbError> {
    let mut db = db().await?;
    db.set_timestamp(ts(100.00));
    db.put_bso(pbso(1, "bookmarks", "b0", Some("x"), None, None))
        .await?;

    // deleting a bso that isn't there is a 404-level error
    let err = db
        .delete_bso(params::DeleteBso {
            user_id: uid(1),
            collection: "bookmarks".to_owned(),
            id: "nope".to_owned(),
        })
        .await
        .expect_err("expected missing bso error");
    assert!(err.is_bso_not_found());

    db.set_timestamp(ts(200.00));
    db.delete_bso(params::DeleteBso {
        user_id: uid(1),
        collection: "bookmarks".to_owned(),
        id: "b0".to_owned(),
    })
    .await?;
    assert!(db.get_bso(gbso(1, "bookmarks", "b0")).await?.is_none());

    // deleting the whole collection removes it from /info/collections but
    // advances the storage-level timestamp via the tombstone
    db.set_timestamp(ts(300.00));
    db.delete_collection(params::DeleteCollection {
        user_id: uid(1),
        collection: "bookmarks".to_owned(),
    })
    .await?;
    let timestamps = db.get_collection_timestamps(uid(1)).await?;
    assert!(!timestamps.contains_key("bookmarks"));
    assert_eq!(db.get_storage_timestamp(uid(1)).await?, ts(300.00));
    Ok(())
}

#[tokio::test]
async fn write_lock_detects_conflicting_timestamps() -> Result<(), DbError> {
    let mut db = db().await?;
    db.set_timestamp(ts(200.00));
    db.put_bso(pbso(1, "bookmarks", "b0", Some("x"), None, None))
        .await?;

    // A writer whose timestamp isn't beyond the collection's current
    // modified must be refused
    db.set_timestamp(ts(150.00));
    let err = db
        .lock_for_write(params::LockCollection {
            user_id: uid(1),
            collection: "bookmarks".to_owned(),
        })
        .await
        .expect_err("expected conflict");
    assert!(err.is_conflict());
    db.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn collection_usage_is_in_bytes() -> Result<(), DbError> {
    let mut db = db().await?;
    db.set_timestamp(ts(100.00));
    db.put_bso(pbso(1, "history", "h0", Some(&"x".repeat(100)), None, None))
        .await?;
    db.put_bso(pbso(1, "history", "h1", Some(&"y".repeat(50)), None, None))
        .await?;

    let usage = db.get_collection_usage(uid(1)).await?;
    assert_eq!(usage.get("history"), Some(&150));
    assert_eq!(db.get_storage_usage(uid(1)).await?, 150);
    Ok(())
}
