use std::{collections::BTreeMap, marker::PhantomData, rc::Rc, sync::Arc};

use actix_web::{
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use cadence::{CountedExt, StatsdClient};
use futures::{future::LocalBoxFuture, FutureExt};
use futures_util::future::{ok, Ready};
use sentry::{protocol::Event, Hub};

use crate::{ReportableError, Taggable};

/// Reports errors to Sentry, or emits a metric instead for error kinds that
/// carry a metric label and aren't worth an event.
pub struct SentryWrapper<E> {
    metrics: Arc<StatsdClient>,
    phantom: PhantomData<E>,
}

impl<E> SentryWrapper<E> {
    pub fn new(metrics: Arc<StatsdClient>) -> Self {
        Self {
            metrics,
            phantom: PhantomData,
        }
    }
}

impl<S, B, E> Transform<S, ServiceRequest> for SentryWrapper<E>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    E: ReportableError + actix_web::ResponseError + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = SentryWrapperMiddleware<S, E>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(SentryWrapperMiddleware {
            service: Rc::new(service),
            metrics: self.metrics.clone(),
            phantom: PhantomData,
        })
    }
}

pub struct SentryWrapperMiddleware<S, E> {
    service: Rc<S>,
    metrics: Arc<StatsdClient>,
    phantom: PhantomData<E>,
}

impl<S, B, E> Service<ServiceRequest> for SentryWrapperMiddleware<S, E>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    E: ReportableError + actix_web::ResponseError + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    actix_web::dev::forward_ready!(service);

    fn call(&self, sreq: ServiceRequest) -> Self::Future {
        // Set up the hub so request data can be attached to events
        let hub = Hub::new_from_top(Hub::main());
        let _ = hub.push_scope();
        let sentry_request = sentry_request_from_http(&sreq);
        hub.configure_scope(|scope| {
            scope.add_event_processor(Box::new(move |event| process_event(event, &sentry_request)))
        });

        let metrics = self.metrics.clone();
        let tags = sreq.get_tags();
        let extras = sreq.get_extras();

        let fut = self.service.call(sreq);

        async move {
            let response: Self::Response = match fut.await {
                Ok(response) => response,
                Err(error) => {
                    if let Some(reportable_err) = error.as_error::<E>() {
                        if !reportable_err.is_sentry_event() {
                            maybe_emit_metrics(&metrics, reportable_err);
                            debug!("Sentry: Not reporting error (service error): {:?}", error);
                            return Err(error);
                        }
                    };
                    debug!("Reporting error to Sentry (service error): {}", error);
                    let mut event = event_from_actix_error::<E>(&error);
                    event.tags.extend(tags);
                    event.extra.extend(extras);
                    let event_id = hub.capture_event(event);
                    trace!("event_id = {}", event_id);
                    return Err(error);
                }
            };
            // Errors can also ride inside an otherwise-Ok response
            if let Some(error) = response.response().error() {
                if let Some(reportable_err) = error.as_error::<E>() {
                    if !reportable_err.is_sentry_event() {
                        maybe_emit_metrics(&metrics, reportable_err);
                        debug!("Sentry: Not reporting error (response error): {:?}", error);
                        return Ok(response);
                    }
                }
                debug!("Reporting error to Sentry (response error): {}", error);
                let mut event = event_from_actix_error::<E>(error);
                event.tags.extend(tags);
                event.extra.extend(extras);
                let event_id = hub.capture_event(event);
                trace!("event_id = {}", event_id);
            }
            Ok(response)
        }
        .boxed_local()
    }
}

/// Emit a metric when [ReportableError::metric_label] is set
fn maybe_emit_metrics<E>(metrics: &StatsdClient, err: &E)
where
    E: ReportableError,
{
    let Some(label) = err.metric_label() else {
        return;
    };
    debug!("Sending error to metrics: {:?}", err);
    let mut builder = metrics.incr_with_tags(label);
    let tags = err.tags();
    for (key, val) in &tags {
        builder = builder.with_tag(key, val);
    }
    builder.send();
}

/// Build a Sentry request struct from the HTTP request
fn sentry_request_from_http(request: &ServiceRequest) -> sentry::protocol::Request {
    sentry::protocol::Request {
        url: format!(
            "{}://{}{}",
            request.connection_info().scheme(),
            request.connection_info().host(),
            request.uri()
        )
        .parse()
        .ok(),
        method: Some(request.method().to_string()),
        headers: request
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect(),
        ..Default::default()
    }
}

/// Add request data to a Sentry event
#[allow(clippy::unnecessary_wraps)]
fn process_event(
    mut event: Event<'static>,
    request: &sentry::protocol::Request,
) -> Option<Event<'static>> {
    if event.request.is_none() {
        event.request = Some(request.clone());
    }
    Some(event)
}

/// Convert Actix errors into a Sentry event. `ReportableError` is handled
/// explicitly so the event can include a backtrace and source error chain.
fn event_from_actix_error<E>(error: &actix_web::Error) -> Event<'static>
where
    E: ReportableError + actix_web::ResponseError + 'static,
{
    // Actix errors don't support source/cause; downcast for more detail.
    if let Some(reportable_err) = error.as_error::<E>() {
        event_from_error(reportable_err)
    } else {
        sentry::event_from_error(error)
    }
}

/// Custom `sentry::event_from_error` for `ReportableError`
///
/// `std::error::Error` doesn't expose backtraces, so this walks the
/// `reportable_source` chain instead to extract them.
pub fn event_from_error(mut reportable_err: &dyn ReportableError) -> Event<'static> {
    let mut exceptions = vec![];
    let mut tags = BTreeMap::new();

    loop {
        exceptions.push(exception_from_reportable_error(reportable_err));
        for (k, v) in reportable_err.tags() {
            tags.insert(k.to_owned(), v);
        }
        reportable_err = match reportable_err.reportable_source() {
            Some(reportable_err) => reportable_err,
            None => break,
        };
    }

    exceptions.reverse();
    Event {
        exception: exceptions.into(),
        level: sentry::protocol::Level::Error,
        tags,
        ..Default::default()
    }
}

fn exception_from_reportable_error(err: &dyn ReportableError) -> sentry::protocol::Exception {
    let dbg = format!("{:?}", &err);
    sentry::protocol::Exception {
        ty: sentry::parse_type_from_debug(&dbg).to_owned(),
        value: Some(err.to_string()),
        stacktrace: err
            .backtrace()
            .map(sentry_backtrace::backtrace_to_stacktrace)
            .unwrap_or_default(),
        ..Default::default()
    }
}
