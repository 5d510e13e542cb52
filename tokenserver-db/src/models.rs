use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use diesel::{
    r2d2::{ConnectionManager, PooledConnection},
    sql_query,
    sql_types::{BigInt, Float, Integer, Nullable, Text},
    sqlite::SqliteConnection,
    OptionalExtension, RunQueryDsl,
};
use weaveserver_common::{BlockingThreadpool, Metrics};

use super::{now_millis, params, results, Db, DbError, DbResult, MAX_GENERATION};

pub(super) type Conn = PooledConnection<ConnectionManager<SqliteConnection>>;

#[derive(Clone)]
pub struct TokenserverDb {
    inner: Arc<Mutex<Conn>>,
    metrics: Metrics,
    service_id: Option<i32>,
    dedicated_node_id: Option<i32>,
    timeout: Option<Duration>,
    blocking_threadpool: Arc<BlockingThreadpool>,
}

impl TokenserverDb {
    // Note that this only works because an instance of `TokenserverDb` has
    // *exclusive access* to its pooled connection for its lifetime.
    // `last_insert_rowid()` is scoped to a connection; if connections were
    // shared across requests this would race.
    const LAST_INSERT_ID_QUERY: &'static str = "SELECT last_insert_rowid() AS id";
    const LAST_INSERT_UID_QUERY: &'static str = "SELECT last_insert_rowid() AS uid";

    pub fn new(
        conn: Conn,
        metrics: &Metrics,
        service_id: Option<i32>,
        dedicated_node_id: Option<i32>,
        timeout: Option<Duration>,
        blocking_threadpool: Arc<BlockingThreadpool>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conn)),
            metrics: metrics.clone(),
            service_id,
            dedicated_node_id,
            timeout,
            blocking_threadpool,
        }
    }

    fn conn(&self) -> DbResult<MutexGuard<'_, Conn>> {
        self.inner
            .lock()
            .map_err(|e| DbError::internal(format!("conn lock poisoned: {}", e)))
    }

    async fn run<F, T>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(TokenserverDb) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        self.blocking_threadpool.spawn(move || f(db)).await
    }

    fn get_node_id_sync(&self, params: params::GetNodeId) -> DbResult<results::GetNodeId> {
        const QUERY: &str = r#"
            SELECT id
              FROM nodes
             WHERE service = ?
               AND node = ?
        "#;

        if let Some(id) = self.dedicated_node_id {
            Ok(results::GetNodeId { id: id as i64 })
        } else {
            let mut metrics = self.metrics.clone();
            metrics.start_timer("storage.get_node_id", None);

            sql_query(QUERY)
                .bind::<Integer, _>(params.service_id)
                .bind::<Text, _>(&params.node)
                .get_result(&mut *self.conn()?)
                .map_err(Into::into)
        }
    }

    /// Mark users matching the given email and service ID as replaced.
    fn replace_users_sync(&self, params: params::ReplaceUsers) -> DbResult<results::ReplaceUsers> {
        const QUERY: &str = r#"
            UPDATE users
               SET replaced_at = ?
             WHERE service = ?
               AND email = ?
               AND replaced_at IS NULL
               AND created_at < ?
        "#;

        let mut metrics = self.metrics.clone();
        metrics.start_timer("storage.replace_users", None);

        sql_query(QUERY)
            .bind::<BigInt, _>(params.replaced_at)
            .bind::<Integer, _>(params.service_id)
            .bind::<Text, _>(&params.email)
            .bind::<BigInt, _>(params.replaced_at)
            .execute(&mut *self.conn()?)?;
        Ok(())
    }

    /// Mark the user with the given uid and service ID as being replaced.
    fn replace_user_sync(&self, params: params::ReplaceUser) -> DbResult<results::ReplaceUser> {
        const QUERY: &str = r#"
            UPDATE users
               SET replaced_at = ?
             WHERE service = ?
               AND uid = ?
        "#;

        sql_query(QUERY)
            .bind::<BigInt, _>(params.replaced_at)
            .bind::<Integer, _>(params.service_id)
            .bind::<BigInt, _>(params.uid)
            .execute(&mut *self.conn()?)?;
        Ok(())
    }

    /// Update the user with the given email and service ID with the given
    /// `generation` and `keys_changed_at`.
    fn put_user_sync(&self, params: params::PutUser) -> DbResult<results::PutUser> {
        // The `where` clause is an extra layer of protection ensuring that
        // concurrent updates can't move the timestamp fields backwards in
        // time. `keys_changed_at` additionally treats its default `NULL` as
        // zero.
        const QUERY: &str = r#"
            UPDATE users
               SET generation = ?,
                   keys_changed_at = ?
             WHERE service = ?
               AND email = ?
               AND generation <= ?
               AND COALESCE(keys_changed_at, 0) <= COALESCE(?, keys_changed_at, 0)
               AND replaced_at IS NULL
        "#;

        let mut metrics = self.metrics.clone();
        metrics.start_timer("storage.put_user", None);

        sql_query(QUERY)
            .bind::<BigInt, _>(params.generation)
            .bind::<Nullable<BigInt>, _>(params.keys_changed_at)
            .bind::<Integer, _>(params.service_id)
            .bind::<Text, _>(&params.email)
            .bind::<BigInt, _>(params.generation)
            .bind::<Nullable<BigInt>, _>(params.keys_changed_at)
            .execute(&mut *self.conn()?)?;
        Ok(())
    }

    /// Tombstone the user's records with the maximum generation so no later
    /// request can be accepted for them.
    fn retire_user_sync(&self, params: params::RetireUser) -> DbResult<results::RetireUser> {
        const QUERY: &str = r#"
            UPDATE users
               SET generation = ?,
                   replaced_at = ?
             WHERE service = ?
               AND email = ?
        "#;

        let mut metrics = self.metrics.clone();
        metrics.start_timer("storage.retire_user", None);

        sql_query(QUERY)
            .bind::<BigInt, _>(MAX_GENERATION)
            .bind::<BigInt, _>(now_millis())
            .bind::<Integer, _>(params.service_id)
            .bind::<Text, _>(&params.email)
            .execute(&mut *self.conn()?)?;
        Ok(())
    }

    /// Create a new user.
    fn post_user_sync(&self, user: params::PostUser) -> DbResult<results::PostUser> {
        const QUERY: &str = r#"
            INSERT INTO users (service, email, generation, client_state, created_at, nodeid, keys_changed_at, replaced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL)
        "#;

        let mut metrics = self.metrics.clone();
        metrics.start_timer("storage.post_user", None);

        let mut conn = self.conn()?;
        sql_query(QUERY)
            .bind::<Integer, _>(user.service_id)
            .bind::<Text, _>(&user.email)
            .bind::<BigInt, _>(user.generation)
            .bind::<Text, _>(&user.client_state)
            .bind::<BigInt, _>(user.created_at)
            .bind::<BigInt, _>(user.node_id)
            .bind::<Nullable<BigInt>, _>(user.keys_changed_at)
            .execute(&mut *conn)?;

        sql_query(Self::LAST_INSERT_UID_QUERY)
            .get_result::<results::PostUser>(&mut *conn)
            .map_err(Into::into)
    }

    fn check_sync(&self) -> DbResult<results::Check> {
        sql_query("SELECT 1").execute(&mut *self.conn()?)?;
        Ok(true)
    }

    /// Gets the least-loaded node that has available slots.
    fn get_best_node_sync(&self, params: params::GetBestNode) -> DbResult<results::GetBestNode> {
        const DEFAULT_CAPACITY_RELEASE_RATE: f32 = 0.1;
        const GET_BEST_NODE_QUERY: &str = r#"
              SELECT id, node
                FROM nodes
               WHERE service = ?
                 AND available > 0
                 AND capacity > current_load
                 AND downed = 0
                 AND backoff = 0
            ORDER BY LOG(current_load) / LOG(capacity)
               LIMIT 1
        "#;
        const RELEASE_CAPACITY_QUERY: &str = r#"
            UPDATE nodes
               SET available = MIN(CAST(capacity * ? AS INTEGER), capacity - current_load)
             WHERE service = ?
               AND available <= 0
               AND capacity > current_load
               AND downed = 0
        "#;
        const DEDICATED_NODE_QUERY: &str = r#"
              SELECT id, node
                FROM nodes
               WHERE id = ?
               LIMIT 1
        "#;

        let mut metrics = self.metrics.clone();
        metrics.start_timer("storage.get_best_node", None);

        if let Some(dedicated_node_id) = self.dedicated_node_id {
            return sql_query(DEDICATED_NODE_QUERY)
                .bind::<Integer, _>(dedicated_node_id)
                .get_result::<results::GetBestNode>(&mut *self.conn()?)
                .map_err(|e| {
                    DbError::unavailable(format!("unable to get the dedicated node: {}", e))
                });
        }

        // We may have to retry the query after releasing more capacity.
        // This loop allows a maximum of five retries before bailing out.
        for _ in 0..5 {
            let maybe_result = sql_query(GET_BEST_NODE_QUERY)
                .bind::<Integer, _>(params.service_id)
                .get_result::<results::GetBestNode>(&mut *self.conn()?)
                .optional()?;

            if let Some(result) = maybe_result {
                return Ok(result);
            }

            // There were no available nodes. Try to release additional
            // capacity from any nodes that are not fully occupied.
            let affected_rows = sql_query(RELEASE_CAPACITY_QUERY)
                .bind::<Float, _>(
                    params
                        .capacity_release_rate
                        .unwrap_or(DEFAULT_CAPACITY_RELEASE_RATE),
                )
                .bind::<Integer, _>(params.service_id)
                .execute(&mut *self.conn()?)?;

            // If no nodes were affected by the last query, give up.
            if affected_rows == 0 {
                break;
            }
        }

        Err(DbError::unavailable("unable to get a node".to_owned()))
    }

    fn add_user_to_node_sync(
        &self,
        params: params::AddUserToNode,
    ) -> DbResult<results::AddUserToNode> {
        const QUERY: &str = r#"
            UPDATE nodes
               SET current_load = current_load + 1,
                   available = MAX(available - 1, 0)
             WHERE service = ?
               AND node = ?
        "#;
        const DEDICATED_NODE_QUERY: &str = r#"
            UPDATE nodes
               SET current_load = current_load + 1
             WHERE service = ?
               AND node = ?
        "#;

        let mut metrics = self.metrics.clone();
        metrics.start_timer("storage.add_user_to_node", None);

        let query = if self.dedicated_node_id.is_some() {
            DEDICATED_NODE_QUERY
        } else {
            QUERY
        };

        sql_query(query)
            .bind::<Integer, _>(params.service_id)
            .bind::<Text, _>(&params.node)
            .execute(&mut *self.conn()?)?;
        Ok(())
    }

    fn get_users_sync(&self, params: params::GetUsers) -> DbResult<results::GetUsers> {
        const QUERY: &str = r#"
                     SELECT uid, nodes.node, generation, keys_changed_at, client_state,
                            created_at, replaced_at
                       FROM users
            LEFT OUTER JOIN nodes ON users.nodeid = nodes.id
                      WHERE email = ?
                        AND users.service = ?
                   ORDER BY created_at DESC, uid DESC
                      LIMIT 20
        "#;

        let mut metrics = self.metrics.clone();
        metrics.start_timer("storage.get_users", None);

        sql_query(QUERY)
            .bind::<Text, _>(&params.email)
            .bind::<Integer, _>(params.service_id)
            .load::<results::GetRawUser>(&mut *self.conn()?)
            .map_err(Into::into)
    }

    fn get_service_id_sync(&self, params: params::GetServiceId) -> DbResult<results::GetServiceId> {
        const QUERY: &str = r#"
            SELECT id
              FROM services
             WHERE service = ?
        "#;

        if let Some(id) = self.service_id {
            Ok(results::GetServiceId { id })
        } else {
            sql_query(QUERY)
                .bind::<Text, _>(&params.service)
                .get_result::<results::GetServiceId>(&mut *self.conn()?)
                .map_err(Into::into)
        }
    }

    fn post_node_sync(&self, params: params::PostNode) -> DbResult<results::PostNode> {
        const QUERY: &str = r#"
            INSERT INTO nodes (service, node, available, current_load, capacity, downed, backoff)
            VALUES (?, ?, ?, ?, ?, ?, ?)
        "#;

        let mut conn = self.conn()?;
        sql_query(QUERY)
            .bind::<Integer, _>(params.service_id)
            .bind::<Text, _>(&params.node)
            .bind::<Integer, _>(params.available)
            .bind::<Integer, _>(params.current_load)
            .bind::<Integer, _>(params.capacity)
            .bind::<Integer, _>(params.downed)
            .bind::<Integer, _>(params.backoff)
            .execute(&mut *conn)?;

        sql_query(Self::LAST_INSERT_ID_QUERY)
            .get_result::<results::PostNode>(&mut *conn)
            .map_err(Into::into)
    }

    fn get_node_sync(&self, params: params::GetNode) -> DbResult<results::GetNode> {
        const QUERY: &str = r#"
            SELECT *
              FROM nodes
             WHERE id = ?
        "#;

        sql_query(QUERY)
            .bind::<BigInt, _>(params.id)
            .get_result::<results::GetNode>(&mut *self.conn()?)
            .map_err(Into::into)
    }

    fn unassign_node_sync(&self, params: params::UnassignNode) -> DbResult<results::UnassignNode> {
        const QUERY: &str = r#"
            UPDATE users
               SET replaced_at = ?
             WHERE nodeid = ?
               AND replaced_at IS NULL
        "#;

        sql_query(QUERY)
            .bind::<BigInt, _>(now_millis())
            .bind::<BigInt, _>(params.node_id)
            .execute(&mut *self.conn()?)?;
        Ok(())
    }

    fn remove_node_sync(&self, params: params::RemoveNode) -> DbResult<results::RemoveNode> {
        // Users on the node lose their assignment so their next request
        // allocates a fresh record elsewhere.
        const CLEAR_USERS_QUERY: &str = r#"
            UPDATE users
               SET replaced_at = ?,
                   nodeid = NULL
             WHERE nodeid = ?
        "#;
        const DELETE_NODE_QUERY: &str = "DELETE FROM nodes WHERE id = ?";

        let mut conn = self.conn()?;
        sql_query(CLEAR_USERS_QUERY)
            .bind::<BigInt, _>(now_millis())
            .bind::<BigInt, _>(params.node_id)
            .execute(&mut *conn)?;
        sql_query(DELETE_NODE_QUERY)
            .bind::<BigInt, _>(params.node_id)
            .execute(&mut *conn)?;
        Ok(())
    }

    fn post_service_sync(&self, params: params::PostService) -> DbResult<results::PostService> {
        const QUERY: &str = r#"
            INSERT INTO services (service, pattern)
            VALUES (?, ?)
        "#;

        let mut conn = self.conn()?;
        sql_query(QUERY)
            .bind::<Text, _>(&params.service)
            .bind::<Text, _>(&params.pattern)
            .execute(&mut *conn)?;

        sql_query(Self::LAST_INSERT_ID_QUERY)
            .get_result::<results::GetNodeId>(&mut *conn)
            .map(|result| results::PostService {
                id: result.id as i32,
            })
            .map_err(Into::into)
    }

    #[cfg(debug_assertions)]
    fn set_user_created_at_sync(
        &self,
        params: params::SetUserCreatedAt,
    ) -> DbResult<results::SetUserCreatedAt> {
        const QUERY: &str = r#"
            UPDATE users
               SET created_at = ?
             WHERE uid = ?
        "#;
        sql_query(QUERY)
            .bind::<BigInt, _>(params.created_at)
            .bind::<BigInt, _>(params.uid)
            .execute(&mut *self.conn()?)?;
        Ok(())
    }

    #[cfg(debug_assertions)]
    fn set_user_replaced_at_sync(
        &self,
        params: params::SetUserReplacedAt,
    ) -> DbResult<results::SetUserReplacedAt> {
        const QUERY: &str = r#"
            UPDATE users
               SET replaced_at = ?
             WHERE uid = ?
        "#;
        sql_query(QUERY)
            .bind::<BigInt, _>(params.replaced_at)
            .bind::<BigInt, _>(params.uid)
            .execute(&mut *self.conn()?)?;
        Ok(())
    }

    #[cfg(debug_assertions)]
    fn get_user_sync(&self, params: params::GetUser) -> DbResult<results::GetUser> {
        const QUERY: &str = r#"
            SELECT service, email, generation, client_state, replaced_at, nodeid, keys_changed_at
              FROM users
             WHERE uid = ?
        "#;

        sql_query(QUERY)
            .bind::<BigInt, _>(params.id)
            .get_result::<results::GetUser>(&mut *self.conn()?)
            .map_err(Into::into)
    }
}

#[async_trait(?Send)]
impl Db for TokenserverDb {
    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn replace_user(
        &mut self,
        params: params::ReplaceUser,
    ) -> DbResult<results::ReplaceUser> {
        self.run(move |db| db.replace_user_sync(params)).await
    }

    async fn replace_users(
        &mut self,
        params: params::ReplaceUsers,
    ) -> DbResult<results::ReplaceUsers> {
        self.run(move |db| db.replace_users_sync(params)).await
    }

    async fn post_user(&mut self, params: params::PostUser) -> DbResult<results::PostUser> {
        self.run(move |db| db.post_user_sync(params)).await
    }

    async fn put_user(&mut self, params: params::PutUser) -> DbResult<results::PutUser> {
        self.run(move |db| db.put_user_sync(params)).await
    }

    async fn retire_user(&mut self, params: params::RetireUser) -> DbResult<results::RetireUser> {
        self.run(move |db| db.retire_user_sync(params)).await
    }

    async fn check(&mut self) -> DbResult<results::Check> {
        self.run(move |db| db.check_sync()).await
    }

    async fn get_node_id(&mut self, params: params::GetNodeId) -> DbResult<results::GetNodeId> {
        self.run(move |db| db.get_node_id_sync(params)).await
    }

    async fn get_best_node(
        &mut self,
        params: params::GetBestNode,
    ) -> DbResult<results::GetBestNode> {
        self.run(move |db| db.get_best_node_sync(params)).await
    }

    async fn add_user_to_node(
        &mut self,
        params: params::AddUserToNode,
    ) -> DbResult<results::AddUserToNode> {
        self.run(move |db| db.add_user_to_node_sync(params)).await
    }

    async fn get_users(&mut self, params: params::GetUsers) -> DbResult<results::GetUsers> {
        self.run(move |db| db.get_users_sync(params)).await
    }

    async fn get_service_id(
        &mut self,
        params: params::GetServiceId,
    ) -> DbResult<results::GetServiceId> {
        self.run(move |db| db.get_service_id_sync(params)).await
    }

    async fn post_node(&mut self, params: params::PostNode) -> DbResult<results::PostNode> {
        self.run(move |db| db.post_node_sync(params)).await
    }

    async fn get_node(&mut self, params: params::GetNode) -> DbResult<results::GetNode> {
        self.run(move |db| db.get_node_sync(params)).await
    }

    async fn unassign_node(
        &mut self,
        params: params::UnassignNode,
    ) -> DbResult<results::UnassignNode> {
        self.run(move |db| db.unassign_node_sync(params)).await
    }

    async fn remove_node(&mut self, params: params::RemoveNode) -> DbResult<results::RemoveNode> {
        self.run(move |db| db.remove_node_sync(params)).await
    }

    async fn post_service(
        &mut self,
        params: params::PostService,
    ) -> DbResult<results::PostService> {
        self.run(move |db| db.post_service_sync(params)).await
    }

    fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    #[cfg(debug_assertions)]
    async fn set_user_created_at(
        &mut self,
        params: params::SetUserCreatedAt,
    ) -> DbResult<results::SetUserCreatedAt> {
        self.run(move |db| db.set_user_created_at_sync(params)).await
    }

    #[cfg(debug_assertions)]
    async fn set_user_replaced_at(
        &mut self,
        params: params::SetUserReplacedAt,
    ) -> DbResult<results::SetUserReplacedAt> {
        self.run(move |db| db.set_user_replaced_at_sync(params))
            .await
    }

    #[cfg(debug_assertions)]
    async fn get_user(&mut self, params: params::GetUser) -> DbResult<results::GetUser> {
        self.run(move |db| db.get_user_sync(params)).await
    }
}
