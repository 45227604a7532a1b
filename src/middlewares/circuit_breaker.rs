//! # Circuit Breaker Middleware
//!
//! Runs every request through a [`CircuitBreaker`]. The wrapped service is the
//! guarded operation: an error or a 5xx response counts as a failure and is
//! passed back unchanged. While the circuit is open the wrapped service is not
//! called and the client gets `503 Service Unavailable`, or whatever response
//! the breaker's fallback produces.
//!
//! ## Example
//!
//! ```rust,no_run
//! use lighter_breaker::config::CircuitBreakerConfig;
//! use lighter_breaker::CircuitBreakerMiddleware;
//! use actix_web::{App, HttpServer};
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let middleware = CircuitBreakerMiddleware::new("upstream", &CircuitBreakerConfig::default())
//!         .expect("valid circuit breaker config");
//!
//!     HttpServer::new(move || {
//!         App::new()
//!             .wrap(middleware.clone())
//!             // ... your routes
//!     })
//!     .bind("0.0.0.0:8080")?
//!     .run()
//!     .await
//! }
//! ```

use std::cell::Cell;
use std::future::{Ready, ready};
use std::rc::Rc;

use actix_web::{
    Error, HttpRequest, HttpResponse,
    body::{BoxBody, MessageBody},
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
    http::header,
};
use futures_util::future::LocalBoxFuture;

use crate::config::CircuitBreakerConfig;
use crate::error::{BreakerError, CircuitBreakerError, CircuitOpenError};
use crate::resilience::CircuitBreaker;

/// Default response for a rejected request
///
/// `Retry-After` is the remaining Open time, rounded up to whole seconds. It is
/// left out when the breaker cannot tell, e.g. while a HalfOpen probe is running.
pub fn circuit_open_response(err: &CircuitOpenError) -> HttpResponse {
    let mut response = HttpResponse::ServiceUnavailable();

    if !err.retry_in.is_zero() {
        let retry_after = err.retry_in.as_secs() + u64::from(err.retry_in.subsec_nanos() > 0);
        response.insert_header((header::RETRY_AFTER, retry_after.to_string()));
    }

    response.content_type("text/plain").body("Service Unavailable")
}

/// Circuit breaker middleware for actix-web
#[derive(Clone)]
pub struct CircuitBreakerMiddleware {
    /// `None` when the breaker is disabled in configuration
    breaker: Option<CircuitBreaker<HttpResponse>>,
}

impl CircuitBreakerMiddleware {
    /// Create the middleware from configuration; a disabled breaker passes requests straight through
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Result<Self, BreakerError> {
        let name = name.into();

        if !config.enabled {
            tracing::info!(circuit_breaker = %name, "Circuit breaker disabled, passing requests through");
            return Ok(Self { breaker: None });
        }

        Ok(Self {
            breaker: Some(CircuitBreaker::with_config(name, config)?),
        })
    }

    /// Wrap an existing breaker, e.g. one shared with other call sites or with a custom fallback
    pub fn with_breaker(breaker: CircuitBreaker<HttpResponse>) -> Self {
        Self {
            breaker: Some(breaker),
        }
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker<HttpResponse>> {
        self.breaker.as_ref()
    }
}

impl<S, B> Transform<S, ServiceRequest> for CircuitBreakerMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type InitError = ();
    type Transform = CircuitBreakerMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(CircuitBreakerMiddlewareService {
            service: Rc::new(service),
            breaker: self.breaker.clone(),
        }))
    }
}

/// A failed request, kept whole so it can be handed back to the client
enum UpstreamFailure {
    Error(Error),
    ServerError(ServiceResponse<BoxBody>),
}

/// Circuit breaker middleware service
pub struct CircuitBreakerMiddlewareService<S> {
    service: Rc<S>,
    breaker: Option<CircuitBreaker<HttpResponse>>,
}

impl<S, B> Service<ServiceRequest> for CircuitBreakerMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);

        let Some(breaker) = self.breaker.clone() else {
            return Box::pin(async move {
                let res = service.call(req).await?;
                Ok(res.map_into_boxed_body())
            });
        };

        // The request stays parked until the breaker admits the call, so the
        // router downstream still holds the only reference to it.
        let parked = Rc::new(Cell::new(Some(req)));
        let admitted = Rc::clone(&parked);
        let served = Rc::new(Cell::new(None::<HttpRequest>));
        let served_by_upstream = Rc::clone(&served);

        Box::pin(async move {
            let outcome = breaker
                .call(async move {
                    let Some(req) = admitted.take() else {
                        return Err(UpstreamFailure::Error(request_consumed()));
                    };

                    match service.call(req).await {
                        Ok(res) if res.status().is_server_error() => {
                            Err(UpstreamFailure::ServerError(res.map_into_boxed_body()))
                        }
                        Ok(res) => {
                            let (http_req, response) = res.map_into_boxed_body().into_parts();
                            served_by_upstream.set(Some(http_req));
                            Ok(response)
                        }
                        Err(err) => Err(UpstreamFailure::Error(err)),
                    }
                })
                .await;

            match outcome {
                Ok(response) => match served.take() {
                    Some(http_req) => Ok(ServiceResponse::new(http_req, response)),
                    // Fallback answered in place of the upstream
                    None => answer_parked(&parked, response),
                },
                Err(CircuitBreakerError::Inner(UpstreamFailure::ServerError(res))) => Ok(res),
                Err(CircuitBreakerError::Inner(UpstreamFailure::Error(err))) => Err(err),
                Err(CircuitBreakerError::Open(err)) => {
                    tracing::warn!(
                        circuit_breaker = %err.name,
                        retry_in_ms = err.retry_in.as_millis() as u64,
                        "Circuit open, returning 503"
                    );
                    answer_parked(&parked, circuit_open_response(&err))
                }
            }
        })
    }
}

fn request_consumed() -> Error {
    actix_web::error::ErrorInternalServerError("request already handed to the upstream service")
}

/// Answer a request the upstream service never saw
fn answer_parked(
    parked: &Cell<Option<ServiceRequest>>,
    response: HttpResponse,
) -> Result<ServiceResponse<BoxBody>, Error> {
    let req = parked.take().ok_or_else(request_consumed)?;
    tracing::debug!(path = %req.path(), status = %response.status(), "Answered without upstream");
    Ok(req.into_response(response))
}
