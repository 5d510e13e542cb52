use std::fmt;

use backtrace::Backtrace;
use http::StatusCode;
use thiserror::Error;
use weaveserver_common::{impl_fmt_display, InternalError, ReportableError};

/// Errors the storage layer reports to the web layer. Application-level
/// conditions (missing collection, conflict, quota) get their own kinds so
/// the handlers can map them to protocol responses; everything the database
/// driver throws collapses into `Internal`.
#[derive(Debug)]
pub struct DbError {
    kind: DbErrorKind,
    pub status: StatusCode,
    pub backtrace: Box<Backtrace>,
}

#[derive(Debug, Error)]
enum DbErrorKind {
    #[error("Specified collection does not exist")]
    CollectionNotFound,

    #[error("Specified bso does not exist")]
    BsoNotFound,

    #[error("Specified batch does not exist")]
    BatchNotFound,

    #[error("An attempt at a conflicting write")]
    Conflict,

    #[error("User over quota")]
    Quota,

    #[error("Unexpected error: {}", _0)]
    Internal(String),
}

impl DbError {
    pub fn batch_not_found() -> Self {
        DbErrorKind::BatchNotFound.into()
    }

    pub fn bso_not_found() -> Self {
        DbErrorKind::BsoNotFound.into()
    }

    pub fn collection_not_found() -> Self {
        DbErrorKind::CollectionNotFound.into()
    }

    pub fn conflict() -> Self {
        DbErrorKind::Conflict.into()
    }

    pub fn internal(msg: String) -> Self {
        DbErrorKind::Internal(msg).into()
    }

    pub fn quota() -> Self {
        DbErrorKind::Quota.into()
    }
}

/// Predicates the web layer uses to translate db errors without matching on
/// the (private) kind.
pub trait DbErrorIntrospect {
    fn is_sentry_event(&self) -> bool;
    fn metric_label(&self) -> Option<&'static str>;
    fn is_collection_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
    fn is_quota(&self) -> bool;
    fn is_bso_not_found(&self) -> bool;
    fn is_batch_not_found(&self) -> bool;
}

impl DbErrorIntrospect for DbError {
    fn is_sentry_event(&self) -> bool {
        !matches!(&self.kind, DbErrorKind::Conflict)
    }

    fn metric_label(&self) -> Option<&'static str> {
        match &self.kind {
            DbErrorKind::Conflict => Some("storage.conflict"),
            _ => None,
        }
    }

    fn is_collection_not_found(&self) -> bool {
        matches!(self.kind, DbErrorKind::CollectionNotFound)
    }

    fn is_conflict(&self) -> bool {
        matches!(self.kind, DbErrorKind::Conflict)
    }

    fn is_quota(&self) -> bool {
        matches!(self.kind, DbErrorKind::Quota)
    }

    fn is_bso_not_found(&self) -> bool {
        matches!(self.kind, DbErrorKind::BsoNotFound)
    }

    fn is_batch_not_found(&self) -> bool {
        matches!(self.kind, DbErrorKind::BatchNotFound)
    }
}

impl From<DbErrorKind> for DbError {
    fn from(kind: DbErrorKind) -> Self {
        let status = match kind {
            DbErrorKind::CollectionNotFound | DbErrorKind::BsoNotFound => StatusCode::NOT_FOUND,
            // Matches the python server (a 400 vs 404)
            DbErrorKind::BatchNotFound => StatusCode::BAD_REQUEST,
            // NOTE: the protocol specification calls for a "409 Conflict"
            // here, but desktop and android clients do not handle that
            // response well, so report a retryable 503 instead
            DbErrorKind::Conflict => StatusCode::SERVICE_UNAVAILABLE,
            DbErrorKind::Quota => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        Self {
            kind,
            status,
            backtrace: Box::new(Backtrace::new()),
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

impl InternalError for DbError {
    fn internal_error(message: String) -> Self {
        DbError::internal(message)
    }
}

impl ReportableError for DbError {
    fn is_sentry_event(&self) -> bool {
        DbErrorIntrospect::is_sentry_event(self)
    }

    fn metric_label(&self) -> Option<&'static str> {
        DbErrorIntrospect::metric_label(self)
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        Some(&self.backtrace)
    }
}

impl_fmt_display!(DbError, DbErrorKind);
