#[macro_use]
extern crate diesel;
#[macro_use]
extern crate slog_scope;

mod batch;
mod models;
mod pool;
mod schema;
#[cfg(test)]
mod test;
mod wal;

pub use models::SqliteDb;
pub use pool::SqliteDbPool;
pub use weavestorage_db_common::error::DbError;

pub(crate) type DbResult<T> = Result<T, DbError>;
