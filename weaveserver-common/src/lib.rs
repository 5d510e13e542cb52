#[macro_use]
extern crate slog_scope;

mod metrics;
pub mod middleware;
mod tags;

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use actix_web::web;
use backtrace::Backtrace;
use hkdf::Hkdf;
use sha2::Sha256;

pub use metrics::{metrics_from_opts, MetricError, Metrics};
pub use tags::Taggable;

// Header names must be lower case, numbers and symbols per the RFC spec.
pub static X_LAST_MODIFIED: &str = "x-last-modified";
pub static X_WEAVE_TIMESTAMP: &str = "x-weave-timestamp";
pub static X_WEAVE_NEXT_OFFSET: &str = "x-weave-next-offset";
pub static X_WEAVE_RECORDS: &str = "x-weave-records";
pub static X_WEAVE_BYTES: &str = "x-weave-bytes";
pub static X_WEAVE_TOTAL_RECORDS: &str = "x-weave-total-records";
pub static X_WEAVE_TOTAL_BYTES: &str = "x-weave-total-bytes";
pub static X_WEAVE_QUOTA_REMAINING: &str = "x-weave-quota-remaining";

/// Helper function for [HKDF](https://tools.ietf.org/html/rfc5869) expansion to 32 bytes.
pub fn hkdf_expand_32(info: &[u8], salt: Option<&[u8]>, key: &[u8]) -> Result<[u8; 32], String> {
    let mut result = [0u8; 32];
    let hkdf = Hkdf::<Sha256>::new(salt, key);
    hkdf.expand(info, &mut result)
        .map_err(|e| format!("HKDF Error: {:?}", e))?;
    Ok(result)
}

#[macro_export]
macro_rules! from_error {
    ($from:ty, $to:ty, $to_kind:expr) => {
        impl From<$from> for $to {
            fn from(inner: $from) -> $to {
                $to_kind(inner).into()
            }
        }
    };
}

#[macro_export]
macro_rules! impl_fmt_display {
    ($error:ty, $kind:ty) => {
        impl fmt::Display for $error {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.kind, formatter)
            }
        }
    };
}

/// Errors that can be reported to Sentry and/or emitted as metrics.
pub trait ReportableError: fmt::Debug + fmt::Display {
    /// Like [std::error::Error::source] but returns a `ReportableError`
    /// so the reporter can walk the chain for backtraces and tags.
    fn reportable_source(&self) -> Option<&(dyn ReportableError + 'static)> {
        None
    }

    /// Whether this error should be reported to Sentry.
    fn is_sentry_event(&self) -> bool {
        true
    }

    /// A metric label to emit instead of (or alongside) a Sentry event.
    fn metric_label(&self) -> Option<&'static str> {
        None
    }

    /// The error's backtrace, if it captured one.
    fn backtrace(&self) -> Option<&Backtrace> {
        None
    }

    /// Low-cardinality tags to attach to the event or metric.
    fn tags(&self) -> Vec<(&str, String)> {
        vec![]
    }
}

/// Types that can represent internal errors, used by generic plumbing (e.g.
/// the blocking threadpool) that needs to conjure an error of the caller's
/// type.
pub trait InternalError {
    fn internal_error(message: String) -> Self;
}

/// A threadpool on which callers can spawn non-CPU-bound tasks that block
/// their thread (mostly I/O). `BlockingThreadpool` intentionally does not
/// implement `Clone`: instantiate it once and share `Arc<BlockingThreadpool>`s
/// so the active-thread count stays accurate.
#[derive(Debug, Default)]
pub struct BlockingThreadpool {
    spawned_tasks: AtomicU64,
}

impl BlockingThreadpool {
    /// Runs a function as a task on the blocking threadpool.
    ///
    /// WARNING: spawning blocking work through any other means will result
    /// in inaccurate threadpool metrics being reported.
    pub async fn spawn<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: fmt::Debug + Send + InternalError + 'static,
    {
        self.spawned_tasks.fetch_add(1, Ordering::Relaxed);
        let _guard = scopeguard::guard((), |_| {
            self.spawned_tasks.fetch_sub(1, Ordering::Relaxed);
        });

        web::block(f).await.unwrap_or_else(|_| {
            Err(E::internal_error(
                "Blocking threadpool operation canceled".to_owned(),
            ))
        })
    }

    pub fn active_threads(&self) -> u64 {
        self.spawned_tasks.load(Ordering::Relaxed)
    }
}
