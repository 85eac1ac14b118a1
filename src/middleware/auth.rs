use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    error::ErrorUnauthorized,
    Error, HttpMessage, HttpRequest,
};
use futures_util::future::LocalBoxFuture;
use std::future::{ready, Ready};

/// Owner identity extracted from the `x-user-id` header, stashed in request
/// extensions by [`AuthMiddleware`].
#[derive(Debug, Clone)]
pub struct OwnerId(pub String);

pub struct AuthMiddleware;

impl<S, B> Transform<S, ServiceRequest> for AuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = AuthMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthMiddlewareService { service }))
    }
}

pub struct AuthMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for AuthMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        // Liveness stays open.
        if req.path() == "/health" {
            let fut = self.service.call(req);
            return Box::pin(async move { fut.await });
        }

        let owner = req
            .headers()
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        match owner {
            Some(owner) => {
                req.extensions_mut().insert(OwnerId(owner));
                let fut = self.service.call(req);
                Box::pin(async move { fut.await })
            }
            None => Box::pin(ready(Err(ErrorUnauthorized(
                serde_json::json!({"error": "x-user-id header is required"}).to_string(),
            )))),
        }
    }
}

pub fn owner_id(req: &HttpRequest) -> Result<String, Error> {
    req.extensions()
        .get::<OwnerId>()
        .map(|owner| owner.0.clone())
        .ok_or_else(|| {
            ErrorUnauthorized(serde_json::json!({"error": "x-user-id header is required"}).to_string())
        })
}
