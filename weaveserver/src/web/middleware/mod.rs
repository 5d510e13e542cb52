//! Web middleware, matching the legacy server's tweens.
pub mod weave;

use std::future::Future;

use actix_web::{
    dev::{Service, ServiceRequest, ServiceResponse},
    web::Data,
    Error,
};
use weaveserver_common::Metrics;

use crate::error::{ApiError, ApiErrorKind};
use crate::server::ServerState;

/// Count responses per status-code class.
pub fn emit_http_status<B>(
    req: ServiceRequest,
    srv: &impl Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
) -> impl Future<Output = Result<ServiceResponse<B>, Error>> {
    let fut = srv.call(req);

    async move {
        let res = fut.await?;
        let req = res.request();
        let metrics = {
            let statsd_client = req
                .app_data::<Data<ServerState>>()
                .map(|state| state.metrics.clone())
                .ok_or_else(|| ApiError::from(ApiErrorKind::NoServerState))?;

            Metrics::from(&statsd_client)
        };

        if res.status().is_informational() {
            metrics.incr("http_1XX");
        } else if res.status().is_success() {
            metrics.incr("http_2XX");
        } else if res.status().is_redirection() {
            metrics.incr("http_3XX");
        } else if res.status().is_client_error() {
            metrics.incr("http_4XX");
        } else if res.status().is_server_error() {
            metrics.incr("http_5XX");
        }

        Ok(res)
    }
}
