use actix_web::{
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use futures::future::{self, LocalBoxFuture, Ready, TryFutureExt};

use super::LogItems;

/// Emits one log line per tokenserver request, carrying the items the
/// extractors accumulated (hashed uid, token type, UA fields).
#[derive(Default)]
pub struct LoggingWrapper;

impl LoggingWrapper {
    pub fn new() -> Self {
        LoggingWrapper::default()
    }
}

impl<S, B> Transform<S, ServiceRequest> for LoggingWrapper
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = LoggingWrapperMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        future::ready(Ok(LoggingWrapperMiddleware { service }))
    }
}

pub struct LoggingWrapperMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for LoggingWrapperMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    actix_web::dev::forward_ready!(service);

    fn call(&self, sreq: ServiceRequest) -> Self::Future {
        // Only tokenserver requests accumulate log items
        let is_tokenserver_request = sreq.uri().path().starts_with("/1.0/");

        Box::pin(self.service.call(sreq).and_then(move |resp| {
            if is_tokenserver_request {
                let items = resp
                    .request()
                    .extensions()
                    .get::<LogItems>()
                    .cloned()
                    .unwrap_or_else(|| LogItems::from(resp.request().head()));
                info!("{}", items);
            }
            future::ok(resp)
        }))
    }
}
