use diesel::{
    connection::SimpleConnection,
    r2d2::{CustomizeConnection, Error as PoolError},
    sqlite::SqliteConnection,
};

/// Puts file-backed databases into WAL mode and applies the pragmas every
/// connection needs. All pragmas are harmless no-ops on in-memory databases.
#[derive(Debug)]
pub struct WalCustomizer;

impl CustomizeConnection<SqliteConnection, PoolError> for WalCustomizer {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), PoolError> {
        (|| {
            conn.batch_execute("PRAGMA journal_mode = WAL;")?;
            conn.batch_execute("PRAGMA synchronous = NORMAL;")?;
            conn.batch_execute("PRAGMA foreign_keys = ON;")?;
            conn.batch_execute("PRAGMA busy_timeout = 10000;")?;
            Ok(())
        })()
        .map_err(PoolError::QueryError)
    }
}
