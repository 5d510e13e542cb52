use std::fmt;

use backtrace::Backtrace;
use http::StatusCode;
use thiserror::Error;
use tokenserver_common::TokenserverError;
use weaveserver_common::{impl_fmt_display, InternalError, ReportableError};

/// Errors from the tokenserver database layer.
#[derive(Debug)]
pub struct DbError {
    kind: DbErrorKind,
    pub status: StatusCode,
    pub backtrace: Backtrace,
}

#[derive(Debug, Error)]
enum DbErrorKind {
    #[error("Unexpected error: {}", _0)]
    Internal(String),
}

impl DbError {
    pub fn internal(msg: String) -> Self {
        DbErrorKind::Internal(msg).into()
    }

    /// An internal error surfaced to clients as a retryable 503; used when
    /// node allocation is exhausted.
    pub fn unavailable(msg: String) -> Self {
        let mut error: Self = DbErrorKind::Internal(msg).into();
        error.status = StatusCode::SERVICE_UNAVAILABLE;
        error
    }
}

impl From<DbErrorKind> for DbError {
    fn from(kind: DbErrorKind) -> Self {
        Self {
            kind,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            backtrace: Backtrace::new(),
        }
    }
}

impl From<diesel::result::Error> for DbError {
    fn from(e: diesel::result::Error) -> Self {
        DbError::internal(format!("diesel error: {}", e))
    }
}

impl From<diesel::result::ConnectionError> for DbError {
    fn from(e: diesel::result::ConnectionError) -> Self {
        DbError::internal(format!("diesel connection error: {}", e))
    }
}

impl From<diesel::r2d2::PoolError> for DbError {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        DbError::internal(format!("db pool error: {}", e))
    }
}

impl From<DbError> for TokenserverError {
    fn from(db_error: DbError) -> Self {
        TokenserverError {
            context: db_error.to_string(),
            backtrace: Box::new(db_error.backtrace),
            ..if db_error.status == StatusCode::SERVICE_UNAVAILABLE {
                TokenserverError::resource_unavailable()
            } else {
                TokenserverError::internal_error()
            }
        }
    }
}

impl InternalError for DbError {
    fn internal_error(message: String) -> Self {
        DbError::internal(message)
    }
}

impl ReportableError for DbError {
    fn backtrace(&self) -> Option<&Backtrace> {
        Some(&self.backtrace)
    }
}

impl_fmt_display!(DbError, DbErrorKind);
