use actix_web::{dev::Payload, web::Data, Error, FromRequest, HttpRequest};
use futures::future::{self, Ready};

use weaveserver_common::{Metrics, Taggable};

use crate::server::ServerState;
use crate::tokenserver::ServerState as TokenserverState;

/// A newtype so `Metrics` can be extracted from requests against either
/// application state.
pub struct MetricsWrapper(pub Metrics);

impl FromRequest for MetricsWrapper {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    /// This extractor never fails: requests with no state produce a
    /// client-less `Metrics` that drops everything on the floor.
    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let client = req
            .app_data::<Data<ServerState>>()
            .map(|state| state.metrics.clone())
            .or_else(|| {
                req.app_data::<Data<TokenserverState>>()
                    .map(|state| state.metrics.clone())
            });

        if client.is_none() {
            warn!("⚠️ metric error: No App State");
        }

        future::ready(Ok(MetricsWrapper(Metrics {
            client,
            tags: req.get_tags(),
            timer: None,
        })))
    }
}
