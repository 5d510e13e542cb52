use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use weaveserver_common::{BlockingThreadpool, Metrics};

use crate::pool::run_embedded_migrations;
use crate::{params, results, Db, DbResult, TokenserverPool, MAX_GENERATION};
use tokenserver_settings::Settings;

static DB_SEQ: AtomicU32 = AtomicU32::new(0);

/// Build a Db against a fresh shared-cache in-memory database. The pool's
/// eagerly-opened connection keeps the shared cache alive while migrations
/// run on a second short-lived connection.
fn test_settings() -> Settings {
    let seq = DB_SEQ.fetch_add(1, Ordering::SeqCst);
    Settings {
        database_url: format!(
            "file:tokenserver_test_{}_{}?mode=memory&cache=shared",
            std::process::id(),
            seq
        ),
        database_pool_max_size: 1,
        run_migrations: false,
        ..Default::default()
    }
}

fn db_with_settings(settings: &Settings) -> DbResult<Box<dyn Db>> {
    let _ = env_logger::try_init();
    let pool = TokenserverPool::new(
        settings,
        &Metrics::noop(),
        Arc::new(BlockingThreadpool::default()),
    )?;
    let db = pool.get_sync()?;
    run_embedded_migrations(&settings.database_url)?;
    Ok(Box::new(db))
}

fn db() -> DbResult<Box<dyn Db>> {
    db_with_settings(&test_settings())
}

async fn sync_service_id(db: &mut Box<dyn Db>) -> DbResult<i32> {
    Ok(db
        .get_service_id(params::GetServiceId {
            service: "sync-1.5".to_owned(),
        })
        .await?
        .id)
}

async fn add_node(db: &mut Box<dyn Db>, service_id: i32, node: &str, capacity: i32) -> DbResult<i64> {
    Ok(db
        .post_node(params::PostNode {
            service_id,
            node: node.to_owned(),
            available: capacity,
            current_load: 0,
            capacity,
            downed: 0,
            backoff: 0,
        })
        .await?
        .id)
}

#[tokio::test]
async fn generation_is_monotonic() -> DbResult<()> {
    let mut db = db()?;
    let service_id = sync_service_id(&mut db).await?;
    let node_id = add_node(&mut db, service_id, "https://node1", 10).await?;

    let email = "test_user";
    let uid = db
        .post_user(params::PostUser {
            service_id,
            node_id,
            email: email.to_owned(),
            created_at: 1_000,
            ..Default::default()
        })
        .await?
        .uid;

    let user = db.get_user(params::GetUser { id: uid }).await?;
    assert_eq!(user.generation, 0);
    assert_eq!(user.client_state, "");

    // Changing generation should leave other properties unchanged.
    db.put_user(params::PutUser {
        email: email.to_owned(),
        service_id,
        generation: 42,
        keys_changed_at: user.keys_changed_at,
    })
    .await?;
    let user = db.get_user(params::GetUser { id: uid }).await?;
    assert_eq!(user.generation, 42);
    assert_eq!(user.client_state, "");

    // It's not possible to move the generation number backwards.
    db.put_user(params::PutUser {
        email: email.to_owned(),
        service_id,
        generation: 17,
        keys_changed_at: user.keys_changed_at,
    })
    .await?;
    let user = db.get_user(params::GetUser { id: uid }).await?;
    assert_eq!(user.generation, 42);
    Ok(())
}

#[tokio::test]
async fn keys_changed_at_is_monotonic() -> DbResult<()> {
    let mut db = db()?;
    let service_id = sync_service_id(&mut db).await?;
    let node_id = add_node(&mut db, service_id, "https://node1", 10).await?;

    let email = "test_user";
    let uid = db
        .post_user(params::PostUser {
            service_id,
            node_id,
            email: email.to_owned(),
            created_at: 1_000,
            ..Default::default()
        })
        .await?
        .uid;

    let user = db.get_user(params::GetUser { id: uid }).await?;
    assert_eq!(user.keys_changed_at, None);

    // A NULL keys_changed_at may move to a value...
    db.put_user(params::PutUser {
        email: email.to_owned(),
        service_id,
        generation: user.generation,
        keys_changed_at: Some(42),
    })
    .await?;
    let user = db.get_user(params::GetUser { id: uid }).await?;
    assert_eq!(user.keys_changed_at, Some(42));

    // ...but not backwards.
    db.put_user(params::PutUser {
        email: email.to_owned(),
        service_id,
        generation: user.generation,
        keys_changed_at: Some(17),
    })
    .await?;
    let user = db.get_user(params::GetUser { id: uid }).await?;
    assert_eq!(user.keys_changed_at, Some(42));
    Ok(())
}

#[tokio::test]
async fn replace_users_marks_only_older_unreplaced_rows() -> DbResult<()> {
    const MILLISECONDS_IN_AN_HOUR: i64 = 60 * 60 * 1000;

    let mut db = db()?;
    let service_id = sync_service_id(&mut db).await?;
    let node_id = add_node(&mut db, service_id, "https://node1", 10).await?;
    let now = crate::now_millis();
    let an_hour_ago = now - MILLISECONDS_IN_AN_HOUR;

    let email1 = "test_user_1";
    let email2 = "test_user_2";

    // An old record that should be replaced
    let uid1 = db
        .post_user(params::PostUser {
            service_id,
            node_id,
            email: email1.to_owned(),
            created_at: an_hour_ago,
            ..Default::default()
        })
        .await?
        .uid;

    // A record that has already been replaced; replaced_at stays put
    let uid2 = db
        .post_user(params::PostUser {
            service_id,
            node_id,
            email: email1.to_owned(),
            created_at: an_hour_ago,
            ..Default::default()
        })
        .await?
        .uid;
    db.set_user_replaced_at(params::SetUserReplacedAt {
        uid: uid2,
        replaced_at: an_hour_ago + 60_000,
    })
    .await?;

    // A record created too recently to be caught
    db.post_user(params::PostUser {
        service_id,
        node_id,
        email: email1.to_owned(),
        created_at: now + MILLISECONDS_IN_AN_HOUR,
        ..Default::default()
    })
    .await?;

    // A record with a different email
    db.post_user(params::PostUser {
        service_id,
        node_id,
        email: email2.to_owned(),
        created_at: an_hour_ago,
        ..Default::default()
    })
    .await?;

    db.replace_users(params::ReplaceUsers {
        service_id,
        email: email1.to_owned(),
        replaced_at: now,
    })
    .await?;

    let mut users = db
        .get_users(params::GetUsers {
            service_id,
            email: email1.to_owned(),
        })
        .await?;
    users.extend(
        db.get_users(params::GetUsers {
            service_id,
            email: email2.to_owned(),
        })
        .await?,
    );

    let mut replaced_uids: Vec<i64> = users
        .iter()
        .filter(|user| user.replaced_at.is_some())
        .map(|user| user.uid)
        .collect();
    replaced_uids.sort_unstable();

    let mut expected = vec![uid1, uid2];
    expected.sort_unstable();
    assert_eq!(replaced_uids, expected);
    Ok(())
}

#[tokio::test]
async fn allocation_prefers_least_loaded_node() -> DbResult<()> {
    let mut db = db()?;
    let service_id = sync_service_id(&mut db).await?;
    add_node(&mut db, service_id, "https://node1", 100).await?;
    let node2 = add_node(&mut db, service_id, "https://node2", 100).await?;

    // Pre-load node1
    for _ in 0..10 {
        db.add_user_to_node(params::AddUserToNode {
            service_id,
            node: "https://node1".to_owned(),
        })
        .await?;
    }

    let user = db
        .allocate_user(params::AllocateUser {
            service_id,
            email: "fresh_user".to_owned(),
            generation: 0,
            client_state: "aa".to_owned(),
            keys_changed_at: None,
            capacity_release_rate: None,
        })
        .await?;
    assert_eq!(user.node, "https://node2");

    let node = db.get_node(params::GetNode { id: node2 }).await?;
    assert_eq!(node.current_load, 1);
    assert_eq!(node.available, 99);
    Ok(())
}

#[tokio::test]
async fn exhausted_nodes_release_capacity() -> DbResult<()> {
    let mut db = db()?;
    let service_id = sync_service_id(&mut db).await?;
    // A node with spare capacity but nothing released
    let node_id = db
        .post_node(params::PostNode {
            service_id,
            node: "https://node1".to_owned(),
            available: 0,
            current_load: 50,
            capacity: 100,
            downed: 0,
            backoff: 0,
        })
        .await?
        .id;

    let best = db
        .get_best_node(params::GetBestNode {
            service_id,
            capacity_release_rate: Some(0.1),
        })
        .await?;
    assert_eq!(best.id, node_id);

    // 10% of capacity was released
    let node = db.get_node(params::GetNode { id: node_id }).await?;
    assert_eq!(node.available, 10);
    Ok(())
}

#[tokio::test]
async fn allocation_fails_when_no_node_is_eligible() -> DbResult<()> {
    let mut db = db()?;
    let service_id = sync_service_id(&mut db).await?;
    // A downed node is never eligible and never releases capacity
    db.post_node(params::PostNode {
        service_id,
        node: "https://node1".to_owned(),
        available: 0,
        current_load: 0,
        capacity: 100,
        downed: 1,
        backoff: 0,
    })
    .await?;

    let result = db
        .get_best_node(params::GetBestNode {
            service_id,
            capacity_release_rate: None,
        })
        .await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn dedicated_node_skips_load_accounting() -> DbResult<()> {
    let mut settings = test_settings();
    // The first handle keeps the shared-cache database alive while a second
    // pool with the dedicated-node override connects to it.
    let mut setup_db = db_with_settings(&settings)?;
    let service_id = sync_service_id(&mut setup_db).await?;
    let node_id = add_node(&mut setup_db, service_id, "https://only-node", 5).await?;

    settings.dedicated_node_id = Some(node_id as i32);
    let mut db = db_with_settings(&settings)?;
    let best = db
        .get_best_node(params::GetBestNode {
            service_id,
            capacity_release_rate: None,
        })
        .await?;
    assert_eq!(best.node, "https://only-node");

    db.add_user_to_node(params::AddUserToNode {
        service_id,
        node: "https://only-node".to_owned(),
    })
    .await?;
    let node = db.get_node(params::GetNode { id: node_id }).await?;
    // load is tracked but `available` is left alone
    assert_eq!(node.current_load, 1);
    assert_eq!(node.available, 5);
    Ok(())
}

#[tokio::test]
async fn get_or_create_user_allocates_and_reuses() -> DbResult<()> {
    let mut db = db()?;
    let service_id = sync_service_id(&mut db).await?;
    add_node(&mut db, service_id, "https://node1", 10).await?;

    let first = db
        .get_or_create_user(params::GetOrCreateUser {
            service_id,
            email: "user@example.com".to_owned(),
            generation: 1,
            client_state: "aa".to_owned(),
            keys_changed_at: Some(1),
            capacity_release_rate: None,
        })
        .await?;
    assert_eq!(first.node, "https://node1");
    assert!(first.old_client_states.is_empty());
    assert_eq!(first.first_seen_at, first.created_at);

    // A second request resolves to the same record
    let second = db
        .get_or_create_user(params::GetOrCreateUser {
            service_id,
            email: "user@example.com".to_owned(),
            generation: 1,
            client_state: "aa".to_owned(),
            keys_changed_at: Some(1),
            capacity_release_rate: None,
        })
        .await?;
    assert_eq!(second.uid, first.uid);
    assert_eq!(second.first_seen_at, first.first_seen_at);
    Ok(())
}

#[tokio::test]
async fn key_rotation_creates_new_uid_but_keeps_first_seen_at() -> DbResult<()> {
    let mut db = db()?;
    let service_id = sync_service_id(&mut db).await?;
    let node_id = add_node(&mut db, service_id, "https://node1", 10).await?;

    let email = "user@example.com";
    let first = db
        .get_or_create_user(params::GetOrCreateUser {
            service_id,
            email: email.to_owned(),
            generation: 1,
            client_state: "aa".to_owned(),
            keys_changed_at: Some(1),
            capacity_release_rate: None,
        })
        .await?;

    // Emulate what the token issuance handler does on a client-state
    // change: insert the replacement record, then retire the older rows.
    let created_at = first.created_at + 10;
    db.post_user(params::PostUser {
        service_id,
        email: email.to_owned(),
        generation: 2,
        client_state: "bb".to_owned(),
        created_at,
        node_id,
        keys_changed_at: Some(2),
    })
    .await?;
    db.replace_users(params::ReplaceUsers {
        service_id,
        email: email.to_owned(),
        replaced_at: created_at,
    })
    .await?;

    let rotated = db
        .get_or_create_user(params::GetOrCreateUser {
            service_id,
            email: email.to_owned(),
            generation: 2,
            client_state: "bb".to_owned(),
            keys_changed_at: Some(2),
            capacity_release_rate: None,
        })
        .await?;

    assert_ne!(rotated.uid, first.uid);
    assert_eq!(rotated.client_state, "bb");
    assert_eq!(rotated.first_seen_at, first.created_at);
    assert_eq!(rotated.old_client_states, vec!["aa".to_owned()]);
    Ok(())
}

#[tokio::test]
async fn retired_users_keep_the_max_generation() -> DbResult<()> {
    let mut db = db()?;
    let service_id = sync_service_id(&mut db).await?;
    add_node(&mut db, service_id, "https://node1", 10).await?;

    let email = "user@example.com";
    db.get_or_create_user(params::GetOrCreateUser {
        service_id,
        email: email.to_owned(),
        generation: 1,
        client_state: "aa".to_owned(),
        keys_changed_at: Some(1),
        capacity_release_rate: None,
    })
    .await?;

    db.retire_user(params::RetireUser {
        service_id,
        email: email.to_owned(),
    })
    .await?;

    let users = db
        .get_users(params::GetUsers {
            service_id,
            email: email.to_owned(),
        })
        .await?;
    assert!(users
        .iter()
        .all(|user| user.generation == MAX_GENERATION && user.replaced_at.is_some()));
    Ok(())
}

#[tokio::test]
async fn removing_a_node_clears_assignments() -> DbResult<()> {
    let mut db = db()?;
    let service_id = sync_service_id(&mut db).await?;
    let node_id = add_node(&mut db, service_id, "https://node1", 10).await?;

    let email = "user@example.com";
    db.get_or_create_user(params::GetOrCreateUser {
        service_id,
        email: email.to_owned(),
        generation: 1,
        client_state: "aa".to_owned(),
        keys_changed_at: Some(1),
        capacity_release_rate: None,
    })
    .await?;

    db.remove_node(params::RemoveNode { node_id }).await?;

    let users = db
        .get_users(params::GetUsers {
            service_id,
            email: email.to_owned(),
        })
        .await?;
    assert!(users
        .iter()
        .all(|user| user.node.is_none() && user.replaced_at.is_some()));
    Ok(())
}

#[tokio::test]
async fn mock_pool_hands_out_dbs() -> DbResult<()> {
    use crate::{mock::MockDbPool, DbPool};

    let pool = MockDbPool::new();
    let mut db = pool.get().await?;
    assert!(db.check().await?);

    let user = db
        .get_or_create_user(params::GetOrCreateUser::default())
        .await?;
    assert_eq!(user, results::GetOrCreateUser::default());
    Ok(())
}
