use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use diesel::{
    delete,
    dsl::{max, sql},
    r2d2::{ConnectionManager, PooledConnection},
    sql_query,
    sql_types::{BigInt, Integer, Nullable, Text},
    sqlite::SqliteConnection,
    ExpressionMethods, OptionalExtension, QueryDsl, RunQueryDsl,
};
use weaveserver_common::{BlockingThreadpool, Metrics};
use weavestorage_db_common::{
    error::DbErrorIntrospect, params, results, util::SyncTimestamp, BatchDb, Db, Sorting,
    UserIdentifier, DEFAULT_BSO_TTL,
};
use weavestorage_settings::{Quota, DEFAULT_MAX_TOTAL_RECORDS};

use super::{
    batch,
    pool::CollectionCache,
    schema::{bso, collections, user_collections},
    DbError, DbResult,
};

pub(super) type Conn = PooledConnection<ConnectionManager<SqliteConnection>>;

// the max number of records a single GET may return.
static DEFAULT_LIMIT: u32 = DEFAULT_MAX_TOTAL_RECORDS;

/// Deleting a whole collection leaves this marker row behind so the
/// storage-level timestamp still advances.
const TOMBSTONE: i32 = 0;

#[derive(Debug)]
enum CollectionLock {
    Read,
    Write,
}

/// Per session Db metadata
#[derive(Debug, Default)]
struct SqliteDbSession {
    /// The "current time" on the server used for this session's operations
    timestamp: SyncTimestamp,
    /// Cache of collection modified timestamps per (user_id, collection_id)
    coll_modified_cache: HashMap<(u64, i32), SyncTimestamp>,
    /// Currently locked collections
    coll_locks: HashMap<(u64, i32), CollectionLock>,
    /// Whether a transaction was started (begin() called)
    in_transaction: bool,
    in_write_transaction: bool,
}

#[derive(Clone)]
pub struct SqliteDb {
    inner: Arc<DbInner>,
    /// Pool level cache of collection_ids and their names
    coll_cache: Arc<CollectionCache>,
    metrics: Metrics,
    quota: Quota,
    blocking_threadpool: Arc<BlockingThreadpool>,
}

/// The connection and session state, shared between the clones a request's
/// blocking closures take. Requests use their Db serially, so the mutexes
/// are uncontended.
struct DbInner {
    conn: Mutex<Conn>,
    session: Mutex<SqliteDbSession>,
}

impl fmt::Debug for SqliteDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteDb")
            .field("coll_cache", &self.coll_cache)
            .field("quota", &self.quota)
            .finish()
    }
}

impl SqliteDb {
    pub(super) fn new(
        conn: Conn,
        coll_cache: Arc<CollectionCache>,
        metrics: &Metrics,
        quota: &Quota,
        blocking_threadpool: Arc<BlockingThreadpool>,
    ) -> Self {
        SqliteDb {
            inner: Arc::new(DbInner {
                conn: Mutex::new(conn),
                session: Mutex::new(Default::default()),
            }),
            coll_cache,
            metrics: metrics.clone(),
            quota: *quota,
            blocking_threadpool,
        }
    }

    pub(super) fn conn(&self) -> DbResult<MutexGuard<'_, Conn>> {
        self.inner
            .conn
            .lock()
            .map_err(|e| DbError::internal(format!("conn lock poisoned: {}", e)))
    }

    fn session(&self) -> DbResult<MutexGuard<'_, SqliteDbSession>> {
        self.inner
            .session
            .lock()
            .map_err(|e| DbError::internal(format!("session lock poisoned: {}", e)))
    }

    /// Run a blocking model method on the blocking threadpool.
    async fn run<F, T>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(SqliteDb) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        self.blocking_threadpool.spawn(move || f(db)).await
    }

    pub(super) fn timestamp(&self) -> SyncTimestamp {
        self.inner.session.lock().expect("session lock").timestamp
    }

    /// APIs for collection-level locking
    ///
    /// SQLite takes a whole-database write lock, so a "collection write
    /// lock" is a `BEGIN IMMEDIATE` transaction plus a conflict check
    /// against the collection's current timestamp. Read locks stay on a
    /// plain deferred transaction.
    fn lock_for_read_sync(&self, params: params::LockCollection) -> DbResult<()> {
        let user_id = params.user_id.legacy_id;
        let collection_id = self
            .get_collection_id_sync(&params.collection)
            .or_else(|e| {
                if e.is_collection_not_found() {
                    // If the collection doesn't exist, we still want to start
                    // a transaction so it will continue to not exist.
                    Ok(0)
                } else {
                    Err(e)
                }
            })?;
        // If we already have a read or write lock then it's safe to
        // use it as-is.
        if self
            .session()?
            .coll_locks
            .contains_key(&(user_id, collection_id))
        {
            return Ok(());
        }

        self.begin_sync(false)?;
        let modified = {
            let mut conn = self.conn()?;
            user_collections::table
                .select(user_collections::modified)
                .filter(user_collections::user_id.eq(user_id as i64))
                .filter(user_collections::collection_id.eq(collection_id))
                .first::<i64>(&mut *conn)
                .optional()?
        };
        let mut session = self.session()?;
        if let Some(modified) = modified {
            let modified = SyncTimestamp::from_i64(modified)?;
            session
                .coll_modified_cache
                .insert((user_id, collection_id), modified);
        }
        session
            .coll_locks
            .insert((user_id, collection_id), CollectionLock::Read);
        Ok(())
    }

    fn lock_for_write_sync(&self, params: params::LockCollection) -> DbResult<()> {
        let user_id = params.user_id.legacy_id;
        let collection_id = self.get_or_create_collection_id_sync(&params.collection)?;
        if let Some(CollectionLock::Read) =
            self.session()?.coll_locks.get(&(user_id, collection_id))
        {
            return Err(DbError::internal(
                "Can't escalate read-lock to write-lock".to_owned(),
            ));
        }

        self.begin_sync(true)?;
        let modified = {
            let mut conn = self.conn()?;
            user_collections::table
                .select(user_collections::modified)
                .filter(user_collections::user_id.eq(user_id as i64))
                .filter(user_collections::collection_id.eq(collection_id))
                .first::<i64>(&mut *conn)
                .optional()?
        };
        let timestamp = self.timestamp();
        let mut session = self.session()?;
        if let Some(modified) = modified {
            let modified = SyncTimestamp::from_i64(modified)?;
            // Forbid the write if it would not properly incr the timestamp
            if modified >= timestamp {
                return Err(DbError::conflict());
            }
            session
                .coll_modified_cache
                .insert((user_id, collection_id), modified);
        }
        session
            .coll_locks
            .insert((user_id, collection_id), CollectionLock::Write);
        Ok(())
    }

    pub(super) fn begin_sync(&self, for_write: bool) -> DbResult<()> {
        {
            let mut conn = self.conn()?;
            if for_write {
                sql_query("BEGIN IMMEDIATE").execute(&mut *conn)?;
            } else {
                sql_query("BEGIN").execute(&mut *conn)?;
            }
        }
        let mut session = self.session()?;
        session.in_transaction = true;
        if for_write {
            session.in_write_transaction = true;
        }
        Ok(())
    }

    fn commit_sync(&self) -> DbResult<()> {
        if self.session()?.in_transaction {
            sql_query("COMMIT").execute(&mut *self.conn()?)?;
            let mut session = self.session()?;
            session.in_transaction = false;
            session.in_write_transaction = false;
        }
        Ok(())
    }

    fn rollback_sync(&self) -> DbResult<()> {
        if self.session()?.in_transaction {
            sql_query("ROLLBACK").execute(&mut *self.conn()?)?;
            let mut session = self.session()?;
            session.in_transaction = false;
            session.in_write_transaction = false;
        }
        Ok(())
    }

    fn erect_tombstone(&self, user_id: i64) -> DbResult<()> {
        sql_query(
            "INSERT INTO user_collections (userid, collection, last_modified)
             VALUES (?, ?, ?)
                 ON CONFLICT (userid, collection) DO UPDATE SET
                    last_modified = excluded.last_modified",
        )
        .bind::<BigInt, _>(user_id)
        .bind::<Integer, _>(TOMBSTONE)
        .bind::<BigInt, _>(self.timestamp().as_i64())
        .execute(&mut *self.conn()?)?;
        Ok(())
    }

    fn delete_storage_sync(&self, user_id: UserIdentifier) -> DbResult<()> {
        let user_id = user_id.legacy_id as i64;
        let mut conn = self.conn()?;
        // Delete user data.
        delete(bso::table)
            .filter(bso::user_id.eq(user_id))
            .execute(&mut *conn)?;
        // Delete user collections.
        delete(user_collections::table)
            .filter(user_collections::user_id.eq(user_id))
            .execute(&mut *conn)?;
        Ok(())
    }

    // Deleting the collection should result in:
    //  - collection does not appear in /info/collections
    //  - X-Last-Modified timestamp at the storage level changing
    fn delete_collection_sync(&self, params: params::DeleteCollection) -> DbResult<SyncTimestamp> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self.get_collection_id_sync(&params.collection)?;
        let mut count = {
            let mut conn = self.conn()?;
            let mut count = delete(bso::table)
                .filter(bso::user_id.eq(user_id))
                .filter(bso::collection_id.eq(&collection_id))
                .execute(&mut *conn)?;
            count += delete(user_collections::table)
                .filter(user_collections::user_id.eq(user_id))
                .filter(user_collections::collection_id.eq(&collection_id))
                .execute(&mut *conn)?;
            count
        };
        if count == 0 {
            return Err(DbError::collection_not_found());
        } else {
            self.erect_tombstone(user_id)?;
        }
        self.get_storage_timestamp_sync(params.user_id)
    }

    pub(super) fn get_or_create_collection_id_sync(&self, name: &str) -> DbResult<i32> {
        if let Some(id) = self.coll_cache.get_id(name)? {
            return Ok(id);
        }

        let id = {
            let mut conn = self.conn()?;
            diesel::insert_or_ignore_into(collections::table)
                .values(collections::name.eq(name))
                .execute(&mut *conn)?;

            collections::table
                .select(collections::id)
                .filter(collections::name.eq(name))
                .first(&mut *conn)?
        };

        if !self.session()?.in_write_transaction {
            self.coll_cache.put(id, name.to_owned())?;
        }

        Ok(id)
    }

    pub(super) fn get_collection_id_sync(&self, name: &str) -> DbResult<i32> {
        if let Some(id) = self.coll_cache.get_id(name)? {
            return Ok(id);
        }

        let id = sql_query("SELECT id FROM collections WHERE name = ?")
            .bind::<Text, _>(name)
            .get_result::<IdResult>(&mut *self.conn()?)
            .optional()?
            .ok_or_else(DbError::collection_not_found)?
            .id;
        if !self.session()?.in_write_transaction {
            self.coll_cache.put(id, name.to_owned())?;
        }
        Ok(id)
    }

    pub(super) fn put_bso_sync(&self, bso: params::PutBso) -> DbResult<results::PutBso> {
        let collection_id = self.get_or_create_collection_id_sync(&bso.collection)?;
        let user_id = bso.user_id.legacy_id;
        let timestamp = self.timestamp().as_i64();

        if self.quota.enabled {
            let usage = self.get_quota_usage_sync(params::GetQuotaUsage {
                user_id: bso.user_id.clone(),
                collection: bso.collection.clone(),
                collection_id,
            })?;
            let incoming = bso.payload.as_ref().map_or(0, |p| p.len());
            if usage.total_bytes + incoming > self.quota.size {
                let mut tags = HashMap::default();
                tags.insert("collection".to_owned(), bso.collection.clone());
                self.metrics.incr_with_tags("storage.quota.at_limit", tags);
                if self.quota.enforced {
                    return Err(DbError::quota());
                } else {
                    warn!("Quota at limit for user's collection ({} bytes)", usage.total_bytes; "collection" => bso.collection.clone());
                }
            }
        }

        let payload = bso.payload.as_deref().unwrap_or_default();
        let sortindex = bso.sortindex;
        let ttl = bso.ttl.map_or(DEFAULT_BSO_TTL, |ttl| ttl);

        // Omitted fields preserve their prior values, and only "real"
        // changes (payload or sortindex) advance `modified`.
        let mut updates: Vec<&str> = Vec::new();
        if bso.sortindex.is_some() {
            updates.push("sortindex = excluded.sortindex");
        }
        if bso.payload.is_some() {
            updates.push("payload = excluded.payload");
        }
        if bso.payload.is_some() || bso.sortindex.is_some() {
            updates.push("modified = excluded.modified");
        }
        if bso.ttl.is_some() {
            updates.push("ttl = excluded.ttl");
        }
        let q = format!(
            "INSERT INTO bso (userid, collection, id, sortindex, payload, modified, ttl)
             VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (userid, collection, id) DO {}",
            if updates.is_empty() {
                "NOTHING".to_owned()
            } else {
                format!("UPDATE SET {}", updates.join(", "))
            },
        );
        sql_query(q)
            .bind::<BigInt, _>(user_id as i64)
            .bind::<Integer, _>(&collection_id)
            .bind::<Text, _>(&bso.id)
            .bind::<Nullable<Integer>, _>(sortindex)
            .bind::<Text, _>(payload)
            .bind::<BigInt, _>(timestamp)
            .bind::<BigInt, _>(timestamp + (i64::from(ttl) * 1000))
            .execute(&mut *self.conn()?)?;
        self.update_collection_sync(user_id, collection_id)
    }

    fn get_bsos_sync(&self, params: params::GetBsos) -> DbResult<results::GetBsos> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self.get_collection_id_sync(&params.collection)?;
        let now = self.timestamp().as_i64();
        let mut query = bso::table
            .select((
                bso::id,
                bso::modified,
                bso::payload,
                bso::sortindex,
                bso::expiry,
            ))
            .filter(bso::user_id.eq(user_id))
            .filter(bso::collection_id.eq(collection_id))
            .filter(bso::expiry.gt(now))
            .into_boxed();

        if let Some(older) = params.older {
            query = query.filter(bso::modified.lt(older.as_i64()));
        }
        if let Some(newer) = params.newer {
            query = query.filter(bso::modified.gt(newer.as_i64()));
        }

        if !params.ids.is_empty() {
            query = query.filter(bso::id.eq_any(params.ids.clone()));
        }

        // Two BSOs can share a `modified`, so the id is always a secondary
        // sort to keep the ordering stable across paginated fetches.
        query = match params.sort {
            Sorting::Index => query.order((bso::sortindex.desc(), bso::id.asc())),
            Sorting::Newest => query.order((bso::modified.desc(), bso::id.desc())),
            Sorting::Oldest => query.order((bso::modified.asc(), bso::id.asc())),
            _ => query,
        };

        let limit = params
            .limit
            .map(i64::from)
            .unwrap_or(DEFAULT_LIMIT as i64)
            .max(0);
        // fetch an extra row to detect if there are more rows that
        // match the query conditions
        query = query.limit(if limit > 0 { limit + 1 } else { limit });

        let numeric_offset = params
            .offset
            .as_ref()
            .map_or(0, |offset| offset.offset as i64);
        if let Some(timestamp) = params.offset.as_ref().and_then(|offset| offset.timestamp) {
            // The cursor's timestamp bounds the scan to rows at or beyond
            // the last page's final row, so the numeric offset stays small
            // and rows written after the first page can't shift the window.
            match params.sort {
                Sorting::Newest => query = query.filter(bso::modified.le(timestamp.as_i64())),
                Sorting::Oldest => query = query.filter(bso::modified.ge(timestamp.as_i64())),
                _ => (),
            }
        }
        if numeric_offset > 0 {
            query = query.offset(numeric_offset);
        }
        let mut bsos = query.load::<results::GetBso>(&mut *self.conn()?)?;

        let next_offset = if limit >= 0 && bsos.len() > limit as usize {
            bsos.pop();
            next_offset(params.sort, &bsos, numeric_offset as u64, limit as u64, &params.offset)
        } else if limit == 0 {
            // an explicit "limit=0" returns an offset of "0" so the client
            // can pick up from the start
            Some(0.to_string())
        } else {
            None
        };

        Ok(results::GetBsos {
            items: bsos,
            offset: next_offset,
        })
    }

    fn get_bso_ids_sync(&self, params: params::GetBsos) -> DbResult<results::GetBsoIds> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self.get_collection_id_sync(&params.collection)?;
        let mut query = bso::table
            .select((bso::id, bso::modified))
            .filter(bso::user_id.eq(user_id))
            .filter(bso::collection_id.eq(collection_id))
            .filter(bso::expiry.gt(self.timestamp().as_i64()))
            .into_boxed();

        if let Some(older) = params.older {
            query = query.filter(bso::modified.lt(older.as_i64()));
        }
        if let Some(newer) = params.newer {
            query = query.filter(bso::modified.gt(newer.as_i64()));
        }

        if !params.ids.is_empty() {
            query = query.filter(bso::id.eq_any(params.ids.clone()));
        }

        query = match params.sort {
            Sorting::Index => query.order((bso::sortindex.desc(), bso::id.asc())),
            Sorting::Newest => query.order((bso::modified.desc(), bso::id.desc())),
            Sorting::Oldest => query.order((bso::modified.asc(), bso::id.asc())),
            _ => query,
        };

        let limit = params
            .limit
            .map(i64::from)
            .unwrap_or(DEFAULT_LIMIT as i64)
            .max(0);
        query = query.limit(if limit > 0 { limit + 1 } else { limit });

        let numeric_offset = params
            .offset
            .as_ref()
            .map_or(0, |offset| offset.offset as i64);
        if let Some(timestamp) = params.offset.as_ref().and_then(|offset| offset.timestamp) {
            match params.sort {
                Sorting::Newest => query = query.filter(bso::modified.le(timestamp.as_i64())),
                Sorting::Oldest => query = query.filter(bso::modified.ge(timestamp.as_i64())),
                _ => (),
            }
        }
        if numeric_offset > 0 {
            query = query.offset(numeric_offset);
        }
        let mut rows = query.load::<(String, SyncTimestamp)>(&mut *self.conn()?)?;

        let next_offset = if limit >= 0 && rows.len() > limit as usize {
            rows.pop();
            next_offset_for_rows(
                params.sort,
                &rows,
                numeric_offset as u64,
                limit as u64,
                &params.offset,
            )
        } else {
            None
        };

        Ok(results::GetBsoIds {
            items: rows.into_iter().map(|(id, _)| id).collect(),
            offset: next_offset,
        })
    }

    fn get_bso_sync(&self, params: params::GetBso) -> DbResult<Option<results::GetBso>> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self.get_collection_id_sync(&params.collection)?;
        Ok(bso::table
            .select((
                bso::id,
                bso::modified,
                bso::payload,
                bso::sortindex,
                bso::expiry,
            ))
            .filter(bso::user_id.eq(user_id))
            .filter(bso::collection_id.eq(&collection_id))
            .filter(bso::id.eq(&params.id))
            .filter(bso::expiry.gt(self.timestamp().as_i64()))
            .get_result::<results::GetBso>(&mut *self.conn()?)
            .optional()?)
    }

    fn delete_bso_sync(&self, params: params::DeleteBso) -> DbResult<results::DeleteBso> {
        let user_id = params.user_id.legacy_id;
        let collection_id = self.get_collection_id_sync(&params.collection)?;
        let affected_rows = delete(bso::table)
            .filter(bso::user_id.eq(user_id as i64))
            .filter(bso::collection_id.eq(&collection_id))
            .filter(bso::id.eq(params.id))
            .filter(bso::expiry.gt(&self.timestamp().as_i64()))
            .execute(&mut *self.conn()?)?;
        if affected_rows == 0 {
            return Err(DbError::bso_not_found());
        }
        self.update_collection_sync(user_id, collection_id)
    }

    fn delete_bsos_sync(&self, params: params::DeleteBsos) -> DbResult<results::DeleteBsos> {
        let user_id = params.user_id.legacy_id;
        let collection_id = self.get_collection_id_sync(&params.collection)?;
        delete(bso::table)
            .filter(bso::user_id.eq(user_id as i64))
            .filter(bso::collection_id.eq(&collection_id))
            .filter(bso::id.eq_any(params.ids))
            .execute(&mut *self.conn()?)?;
        self.update_collection_sync(user_id, collection_id)
    }

    fn post_bsos_sync(&self, input: params::PostBsos) -> DbResult<SyncTimestamp> {
        let collection_id = self.get_or_create_collection_id_sync(&input.collection)?;
        let modified = self.timestamp();

        for pbso in input.bsos {
            self.put_bso_sync(params::PutBso {
                user_id: input.user_id.clone(),
                collection: input.collection.clone(),
                id: pbso.id,
                payload: pbso.payload,
                sortindex: pbso.sortindex,
                ttl: pbso.ttl,
            })?;
        }
        self.update_collection_sync(input.user_id.legacy_id, collection_id)?;

        Ok(modified)
    }

    fn get_storage_timestamp_sync(&self, user_id: UserIdentifier) -> DbResult<SyncTimestamp> {
        let user_id = user_id.legacy_id as i64;
        let modified = user_collections::table
            .select(max(user_collections::modified))
            .filter(user_collections::user_id.eq(user_id))
            .first::<Option<i64>>(&mut *self.conn()?)?
            .unwrap_or_default();
        SyncTimestamp::from_i64(modified)
    }

    fn get_collection_timestamp_sync(
        &self,
        params: params::GetCollectionTimestamp,
    ) -> DbResult<SyncTimestamp> {
        let user_id = params.user_id.legacy_id;
        let collection_id = self.get_collection_id_sync(&params.collection)?;
        if let Some(modified) = self
            .session()?
            .coll_modified_cache
            .get(&(user_id, collection_id))
        {
            return Ok(*modified);
        }
        user_collections::table
            .select(user_collections::modified)
            .filter(user_collections::user_id.eq(user_id as i64))
            .filter(user_collections::collection_id.eq(collection_id))
            .first::<i64>(&mut *self.conn()?)
            .optional()?
            .map(SyncTimestamp::from_i64)
            .transpose()?
            .ok_or_else(DbError::collection_not_found)
    }

    fn get_bso_timestamp_sync(&self, params: params::GetBsoTimestamp) -> DbResult<SyncTimestamp> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self.get_collection_id_sync(&params.collection)?;
        let modified = bso::table
            .select(bso::modified)
            .filter(bso::user_id.eq(user_id))
            .filter(bso::collection_id.eq(&collection_id))
            .filter(bso::id.eq(&params.id))
            .first::<i64>(&mut *self.conn()?)
            .optional()?
            .unwrap_or_default();
        SyncTimestamp::from_i64(modified)
    }

    fn get_collection_timestamps_sync(
        &self,
        user_id: UserIdentifier,
    ) -> DbResult<results::GetCollectionTimestamps> {
        let modifieds = sql_query(
            "SELECT collection, last_modified
               FROM user_collections
              WHERE userid = ?
                AND collection != ?",
        )
        .bind::<BigInt, _>(user_id.legacy_id as i64)
        .bind::<Integer, _>(TOMBSTONE)
        .load::<UserCollectionsResult>(&mut *self.conn()?)?
        .into_iter()
        .map(|cr| SyncTimestamp::from_i64(cr.last_modified).map(|ts| (cr.collection, ts)))
        .collect::<DbResult<HashMap<_, _>>>()?;
        self.map_collection_names(modifieds)
    }

    fn check_sync(&self) -> DbResult<results::Check> {
        sql_query("SELECT 1").execute(&mut *self.conn()?)?;
        Ok(true)
    }

    fn map_collection_names<T>(&self, by_id: HashMap<i32, T>) -> DbResult<HashMap<String, T>> {
        let mut names = self.load_collection_names(by_id.keys())?;
        by_id
            .into_iter()
            .map(|(id, value)| {
                names.remove(&id).map(|name| (name, value)).ok_or_else(|| {
                    DbError::internal("load_collection_names unknown collection id".to_owned())
                })
            })
            .collect()
    }

    fn load_collection_names<'a>(
        &self,
        collection_ids: impl Iterator<Item = &'a i32>,
    ) -> DbResult<HashMap<i32, String>> {
        let mut names = HashMap::new();
        let mut uncached = Vec::new();
        for &id in collection_ids {
            if let Some(name) = self.coll_cache.get_name(id)? {
                names.insert(id, name);
            } else {
                uncached.push(id);
            }
        }

        if !uncached.is_empty() {
            let result = collections::table
                .select((collections::id, collections::name))
                .filter(collections::id.eq_any(uncached))
                .load::<(i32, String)>(&mut *self.conn()?)?;

            let in_write_transaction = self.session()?.in_write_transaction;
            for (id, name) in result {
                names.insert(id, name.clone());
                if !in_write_transaction {
                    self.coll_cache.put(id, name)?;
                }
            }
        }

        Ok(names)
    }

    pub(super) fn update_collection_sync(
        &self,
        user_id: u64,
        collection_id: i32,
    ) -> DbResult<SyncTimestamp> {
        let quota = if self.quota.enabled {
            self.calc_quota_usage_sync(user_id, collection_id)?
        } else {
            results::GetQuotaUsage {
                count: 0,
                total_bytes: 0,
            }
        };
        let total_bytes = quota.total_bytes as i64;
        let timestamp = self.timestamp().as_i64();
        sql_query(
            "INSERT INTO user_collections (userid, collection, last_modified, total_bytes, count)
             VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (userid, collection) DO UPDATE SET
                    last_modified = excluded.last_modified,
                    total_bytes = excluded.total_bytes,
                    count = excluded.count",
        )
        .bind::<BigInt, _>(user_id as i64)
        .bind::<Integer, _>(&collection_id)
        .bind::<BigInt, _>(&timestamp)
        .bind::<BigInt, _>(&total_bytes)
        .bind::<Integer, _>(&quota.count)
        .execute(&mut *self.conn()?)?;
        Ok(self.timestamp())
    }

    // Perform a lighter weight "read only" storage size check
    fn get_storage_usage_sync(&self, user_id: UserIdentifier) -> DbResult<results::GetStorageUsage> {
        let uid = user_id.legacy_id as i64;
        let total_bytes = bso::table
            .select(sql::<Nullable<BigInt>>("SUM(LENGTH(payload))"))
            .filter(bso::user_id.eq(uid))
            .filter(bso::expiry.gt(self.timestamp().as_i64()))
            .get_result::<Option<i64>>(&mut *self.conn()?)?;
        Ok(total_bytes.unwrap_or_default() as u64)
    }

    // Perform a lighter weight "read only" quota storage check
    fn get_quota_usage_sync(
        &self,
        params: params::GetQuotaUsage,
    ) -> DbResult<results::GetQuotaUsage> {
        let uid = params.user_id.legacy_id as i64;
        let (total_bytes, count): (i64, i32) = user_collections::table
            .select((
                sql::<BigInt>("COALESCE(SUM(COALESCE(total_bytes, 0)), 0)"),
                sql::<Integer>("COALESCE(SUM(COALESCE(count, 0)), 0)"),
            ))
            .filter(user_collections::user_id.eq(uid))
            .filter(user_collections::collection_id.eq(params.collection_id))
            .get_result(&mut *self.conn()?)
            .optional()?
            .unwrap_or_default();
        Ok(results::GetQuotaUsage {
            total_bytes: total_bytes as usize,
            count,
        })
    }

    // perform a heavier weight quota calculation
    fn calc_quota_usage_sync(
        &self,
        user_id: u64,
        collection_id: i32,
    ) -> DbResult<results::GetQuotaUsage> {
        let (total_bytes, count): (i64, i32) = bso::table
            .select((
                sql::<BigInt>("COALESCE(SUM(LENGTH(COALESCE(payload, ''))), 0)"),
                sql::<Integer>("COALESCE(COUNT(*), 0)"),
            ))
            .filter(bso::user_id.eq(user_id as i64))
            .filter(bso::expiry.gt(self.timestamp().as_i64()))
            .filter(bso::collection_id.eq(collection_id))
            .get_result(&mut *self.conn()?)
            .optional()?
            .unwrap_or_default();
        Ok(results::GetQuotaUsage {
            total_bytes: total_bytes as usize,
            count,
        })
    }

    fn get_collection_usage_sync(
        &self,
        user_id: UserIdentifier,
    ) -> DbResult<results::GetCollectionUsage> {
        let counts = bso::table
            .filter(bso::user_id.eq(user_id.legacy_id as i64))
            .filter(bso::expiry.gt(self.timestamp().as_i64()))
            .group_by(bso::collection_id)
            .select((bso::collection_id, sql::<BigInt>("SUM(LENGTH(payload))")))
            .load(&mut *self.conn()?)?
            .into_iter()
            .collect();
        self.map_collection_names(counts)
    }

    fn get_collection_counts_sync(
        &self,
        user_id: UserIdentifier,
    ) -> DbResult<results::GetCollectionCounts> {
        let counts = bso::table
            .filter(bso::user_id.eq(user_id.legacy_id as i64))
            .filter(bso::expiry.gt(self.timestamp().as_i64()))
            .group_by(bso::collection_id)
            .select((bso::collection_id, sql::<BigInt>("COUNT(collection)")))
            .load(&mut *self.conn()?)?
            .into_iter()
            .collect();
        self.map_collection_names(counts)
    }
}

/// Compute the cursor for the next page: for time-ordered sorts the
/// boundary timestamp plus the count of rows already returned at it,
/// otherwise a plain numeric offset.
fn next_offset(
    sort: Sorting,
    items: &[results::GetBso],
    numeric_offset: u64,
    limit: u64,
    prev: &Option<params::Offset>,
) -> Option<String> {
    match (sort, items.last()) {
        (Sorting::Newest, Some(last)) | (Sorting::Oldest, Some(last)) => {
            let boundary = last.modified;
            let mut at_boundary = items
                .iter()
                .rev()
                .take_while(|b| b.modified == boundary)
                .count() as u64;
            if let Some(prev) = prev {
                if prev.timestamp == Some(boundary) {
                    at_boundary += prev.offset;
                }
            }
            Some(format!("{}:{}", boundary.as_i64(), at_boundary))
        }
        _ => Some((limit + numeric_offset).to_string()),
    }
}

fn next_offset_for_rows(
    sort: Sorting,
    rows: &[(String, SyncTimestamp)],
    numeric_offset: u64,
    limit: u64,
    prev: &Option<params::Offset>,
) -> Option<String> {
    match (sort, rows.last()) {
        (Sorting::Newest, Some((_, boundary))) | (Sorting::Oldest, Some((_, boundary))) => {
            let boundary = *boundary;
            let mut at_boundary = rows
                .iter()
                .rev()
                .take_while(|(_, modified)| *modified == boundary)
                .count() as u64;
            if let Some(prev) = prev {
                if prev.timestamp == Some(boundary) {
                    at_boundary += prev.offset;
                }
            }
            Some(format!("{}:{}", boundary.as_i64(), at_boundary))
        }
        _ => Some((limit + numeric_offset).to_string()),
    }
}

#[async_trait(?Send)]
impl Db for SqliteDb {
    async fn commit(&mut self) -> DbResult<()> {
        self.run(move |db| db.commit_sync()).await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.run(move |db| db.rollback_sync()).await
    }

    async fn begin(&mut self, for_write: bool) -> DbResult<()> {
        self.run(move |db| db.begin_sync(for_write)).await
    }

    async fn check(&mut self) -> DbResult<results::Check> {
        self.run(move |db| db.check_sync()).await
    }

    async fn lock_for_read(&mut self, params: params::LockCollection) -> DbResult<()> {
        self.run(move |db| db.lock_for_read_sync(params)).await
    }

    async fn lock_for_write(&mut self, params: params::LockCollection) -> DbResult<()> {
        self.run(move |db| db.lock_for_write_sync(params)).await
    }

    async fn get_collection_timestamps(
        &mut self,
        params: params::GetCollectionTimestamps,
    ) -> DbResult<results::GetCollectionTimestamps> {
        self.run(move |db| db.get_collection_timestamps_sync(params))
            .await
    }

    async fn get_collection_timestamp(
        &mut self,
        params: params::GetCollectionTimestamp,
    ) -> DbResult<results::GetCollectionTimestamp> {
        self.run(move |db| db.get_collection_timestamp_sync(params))
            .await
    }

    async fn get_collection_counts(
        &mut self,
        params: params::GetCollectionCounts,
    ) -> DbResult<results::GetCollectionCounts> {
        self.run(move |db| db.get_collection_counts_sync(params))
            .await
    }

    async fn get_collection_usage(
        &mut self,
        params: params::GetCollectionUsage,
    ) -> DbResult<results::GetCollectionUsage> {
        self.run(move |db| db.get_collection_usage_sync(params))
            .await
    }

    async fn get_storage_timestamp(
        &mut self,
        params: params::GetStorageTimestamp,
    ) -> DbResult<results::GetStorageTimestamp> {
        self.run(move |db| db.get_storage_timestamp_sync(params))
            .await
    }

    async fn get_storage_usage(
        &mut self,
        params: params::GetStorageUsage,
    ) -> DbResult<results::GetStorageUsage> {
        self.run(move |db| db.get_storage_usage_sync(params)).await
    }

    async fn get_quota_usage(
        &mut self,
        params: params::GetQuotaUsage,
    ) -> DbResult<results::GetQuotaUsage> {
        self.run(move |db| db.get_quota_usage_sync(params)).await
    }

    async fn delete_storage(
        &mut self,
        params: params::DeleteStorage,
    ) -> DbResult<results::DeleteStorage> {
        self.run(move |db| db.delete_storage_sync(params)).await
    }

    async fn delete_collection(
        &mut self,
        params: params::DeleteCollection,
    ) -> DbResult<results::DeleteCollection> {
        self.run(move |db| db.delete_collection_sync(params)).await
    }

    async fn delete_bsos(&mut self, params: params::DeleteBsos) -> DbResult<results::DeleteBsos> {
        self.run(move |db| db.delete_bsos_sync(params)).await
    }

    async fn get_bsos(&mut self, params: params::GetBsos) -> DbResult<results::GetBsos> {
        self.run(move |db| db.get_bsos_sync(params)).await
    }

    async fn get_bso_ids(&mut self, params: params::GetBsos) -> DbResult<results::GetBsoIds> {
        self.run(move |db| db.get_bso_ids_sync(params)).await
    }

    async fn post_bsos(&mut self, params: params::PostBsos) -> DbResult<SyncTimestamp> {
        self.run(move |db| db.post_bsos_sync(params)).await
    }

    async fn delete_bso(&mut self, params: params::DeleteBso) -> DbResult<results::DeleteBso> {
        self.run(move |db| db.delete_bso_sync(params)).await
    }

    async fn get_bso(&mut self, params: params::GetBso) -> DbResult<Option<results::GetBso>> {
        self.run(move |db| db.get_bso_sync(params)).await
    }

    async fn get_bso_timestamp(
        &mut self,
        params: params::GetBsoTimestamp,
    ) -> DbResult<results::GetBsoTimestamp> {
        self.run(move |db| db.get_bso_timestamp_sync(params)).await
    }

    async fn put_bso(&mut self, params: params::PutBso) -> DbResult<results::PutBso> {
        self.run(move |db| db.put_bso_sync(params)).await
    }

    async fn get_collection_id(&mut self, name: &str) -> DbResult<i32> {
        let name = name.to_owned();
        self.run(move |db| db.get_collection_id_sync(&name)).await
    }

    async fn create_collection(&mut self, name: &str) -> DbResult<i32> {
        let name = name.to_owned();
        self.run(move |db| db.get_or_create_collection_id_sync(&name))
            .await
    }

    async fn update_collection(
        &mut self,
        params: params::UpdateCollection,
    ) -> DbResult<SyncTimestamp> {
        self.run(move |db| {
            db.update_collection_sync(params.user_id.legacy_id, params.collection_id)
        })
        .await
    }

    fn timestamp(&self) -> SyncTimestamp {
        SqliteDb::timestamp(self)
    }

    fn set_timestamp(&mut self, timestamp: SyncTimestamp) {
        self.inner.session.lock().expect("session lock").timestamp = timestamp;
    }

    async fn clear_coll_cache(&mut self) -> DbResult<()> {
        self.coll_cache.clear();
        Ok(())
    }

    fn set_quota(&mut self, enabled: bool, limit: usize, enforced: bool) {
        self.quota = Quota {
            size: limit,
            enabled,
            enforced,
        }
    }
}

#[async_trait(?Send)]
impl BatchDb for SqliteDb {
    type Error = DbError;

    async fn create_batch(
        &mut self,
        params: params::CreateBatch,
    ) -> DbResult<results::CreateBatch> {
        self.run(move |db| batch::create(&db, params)).await
    }

    async fn validate_batch(
        &mut self,
        params: params::ValidateBatch,
    ) -> DbResult<results::ValidateBatch> {
        self.run(move |db| batch::validate(&db, params)).await
    }

    async fn append_to_batch(
        &mut self,
        params: params::AppendToBatch,
    ) -> DbResult<results::AppendToBatch> {
        self.run(move |db| batch::append(&db, params)).await
    }

    async fn get_batch(&mut self, params: params::GetBatch) -> DbResult<Option<results::GetBatch>> {
        self.run(move |db| batch::get(&db, params)).await
    }

    async fn commit_batch(
        &mut self,
        params: params::CommitBatch,
    ) -> DbResult<results::CommitBatch> {
        self.run(move |db| batch::commit(&db, params)).await
    }

    async fn delete_batch(&mut self, params: params::DeleteBatch) -> DbResult<()> {
        self.run(move |db| batch::delete(&db, params)).await
    }
}

#[derive(Debug, QueryableByName)]
struct IdResult {
    #[diesel(sql_type = Integer)]
    id: i32,
}

#[derive(Debug, QueryableByName)]
struct UserCollectionsResult {
    #[diesel(sql_type = Integer)]
    collection: i32,
    #[diesel(sql_type = BigInt)]
    last_modified: i64,
}
