//! Storage db facade over the active backend.

pub mod mock;

use std::sync::Arc;

use weaveserver_common::{BlockingThreadpool, Metrics};
use weavestorage_settings::Settings;

pub type DbPoolImpl = weavestorage_sqlite::SqliteDbPool;
pub use weavestorage_sqlite::DbError;
pub type DbImpl = weavestorage_sqlite::SqliteDb;

pub use weaveserver_db_common::{GetPoolState, PoolState};
pub use weavestorage_db_common::error::DbErrorIntrospect;

pub use weavestorage_db_common::{
    params, results,
    util::SyncTimestamp,
    Db, DbPool, Sorting, UserIdentifier,
};

/// Build the database pool for the configured backend.
pub fn pool_from_settings(
    settings: &Settings,
    metrics: &Metrics,
    blocking_threadpool: Arc<BlockingThreadpool>,
) -> Result<Box<dyn DbPool<Error = DbError>>, DbError> {
    Ok(Box::new(DbPoolImpl::new(
        settings,
        metrics,
        blocking_threadpool,
    )?))
}
