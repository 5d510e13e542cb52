use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use diesel::{
    r2d2::{ConnectionManager, Pool},
    sqlite::SqliteConnection,
    Connection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tokenserver_settings::Settings;
use weaveserver_common::{BlockingThreadpool, Metrics};
use weaveserver_db_common::{GetPoolState, PoolState};

use super::{models::TokenserverDb, params, Db, DbError, DbPool, DbResult};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

/// Run the diesel embedded migrations
///
/// SQLite DDL statements implicitly commit, so this runs on its own
/// short-lived connection.
pub(crate) fn run_embedded_migrations(database_url: &str) -> DbResult<()> {
    let mut conn = SqliteConnection::establish(database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| DbError::internal(format!("Couldn't run migrations: {}", e)))?;
    Ok(())
}

#[derive(Clone)]
pub struct TokenserverPool {
    /// Pool of db connections
    inner: Pool<ConnectionManager<SqliteConnection>>,
    metrics: Metrics,
    // This field is public so the service ID can be set after the pool is
    // created
    pub service_id: Option<i32>,
    dedicated_node_id: Option<i32>,
    pub timeout: Option<Duration>,
    run_migrations: bool,
    database_url: String,
    blocking_threadpool: Arc<BlockingThreadpool>,
}

impl TokenserverPool {
    pub fn new(
        settings: &Settings,
        metrics: &Metrics,
        blocking_threadpool: Arc<BlockingThreadpool>,
    ) -> DbResult<Self> {
        let manager = ConnectionManager::<SqliteConnection>::new(settings.database_url.clone());
        let pool = Pool::builder()
            .max_size(settings.database_pool_max_size)
            .connection_timeout(Duration::from_secs(
                settings.database_pool_connection_timeout.unwrap_or(30) as u64,
            ))
            .build(manager)?;

        let timeout = settings
            .database_request_timeout
            .map(|v| Duration::from_secs(v as u64));

        Ok(Self {
            inner: pool,
            metrics: metrics.clone(),
            service_id: None,
            dedicated_node_id: settings.dedicated_node_id,
            timeout,
            run_migrations: settings.run_migrations,
            database_url: settings.database_url.clone(),
            blocking_threadpool,
        })
    }

    pub fn get_sync(&self) -> DbResult<TokenserverDb> {
        Ok(TokenserverDb::new(
            self.inner.get()?,
            &self.metrics,
            self.service_id,
            self.dedicated_node_id,
            self.timeout,
            self.blocking_threadpool.clone(),
        ))
    }

    /// Cache the common "sync-1.5" service_id
    async fn init_service_id(&mut self) -> DbResult<()> {
        let service_id = self
            .get()
            .await?
            .get_service_id(params::GetServiceId {
                service: "sync-1.5".to_owned(),
            })
            .await?;
        self.service_id = Some(service_id.id);
        Ok(())
    }
}

#[async_trait(?Send)]
impl DbPool for TokenserverPool {
    async fn init(&mut self) -> DbResult<()> {
        if self.run_migrations {
            let database_url = self.database_url.clone();
            self.blocking_threadpool
                .spawn(move || run_embedded_migrations(&database_url))
                .await?;
        }

        // Provided there's a "sync-1.5" service record in the database, it
        // is highly unlikely for this query to fail outside of network
        // failures or other random errors
        let _ = self.init_service_id().await;
        Ok(())
    }

    async fn get(&self) -> DbResult<Box<dyn Db>> {
        let mut metrics = self.metrics.clone();
        metrics.start_timer("storage.get_pool", None);

        let pool = self.clone();
        self.blocking_threadpool
            .spawn(move || pool.get_sync())
            .await
            .map(|db| Box::new(db) as Box<dyn Db>)
    }

    fn box_clone(&self) -> Box<dyn DbPool> {
        Box::new(self.clone())
    }
}

impl GetPoolState for TokenserverPool {
    fn state(&self) -> PoolState {
        self.inner.state().into()
    }
}

/// Build the tokenserver database pool for the configured backend.
pub fn pool_from_settings(
    settings: &Settings,
    metrics: &Metrics,
    blocking_threadpool: Arc<BlockingThreadpool>,
) -> DbResult<Box<dyn DbPool>> {
    Ok(Box::new(TokenserverPool::new(
        settings,
        metrics,
        blocking_threadpool,
    )?))
}
