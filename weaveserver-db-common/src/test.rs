use diesel::{
    r2d2::CustomizeConnection, sqlite::SqliteConnection, Connection,
};

/// Wraps each pooled connection in a never-committed transaction, so unit
/// tests can't see each other's writes.
#[derive(Debug)]
pub struct TestTransactionCustomizer;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for TestTransactionCustomizer {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.begin_test_transaction()
            .map_err(diesel::r2d2::Error::QueryError)
    }
}
