// Bearer-token guard for the admin routes.

use actix_web::{
    body::{BoxBody, EitherBody},
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpResponse,
};
use futures::future::LocalBoxFuture;
use std::future::{ready, Ready};
use std::rc::Rc;

/// Requires `Authorization: Bearer <secret>` on every path under `prefix`.
/// Other paths pass through untouched.
pub struct Auth {
    secret: Rc<str>,
    prefix: Rc<str>,
}

impl Auth {
    pub fn new(secret: String) -> Self {
        Self {
            secret: secret.into(),
            prefix: "/admin".into(),
        }
    }

    pub fn protecting(mut self, prefix: &str) -> Self {
        self.prefix = prefix.into();
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for Auth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B, BoxBody>>;
    type Error = Error;
    type InitError = ();
    type Transform = AuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthMiddleware {
            service,
            secret: self.secret.clone(),
            prefix: self.prefix.clone(),
        }))
    }
}

pub struct AuthMiddleware<S> {
    service: S,
    secret: Rc<str>,
    prefix: Rc<str>,
}

impl<S> AuthMiddleware<S> {
    fn authorized(&self, req: &ServiceRequest) -> bool {
        if !req.path().starts_with(&*self.prefix) {
            return true;
        }
        let token = req
            .headers()
            .get("Authorization")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "));
        matches!(token, Some(t) if !self.secret.is_empty() && t == &*self.secret)
    }
}

impl<S, B> Service<ServiceRequest> for AuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B, BoxBody>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        if self.authorized(&req) {
            let fut = self.service.call(req);
            return Box::pin(async move {
                let res = fut.await?;
                Ok(res.map_into_left_body())
            });
        }

        tracing::warn!(path = %req.path(), "rejected request without a valid bearer token");
        Box::pin(async move {
            let response = HttpResponse::Unauthorized()
                .json(serde_json::json!({
                    "success": false,
                    "error": "Invalid or missing authentication token"
                }))
                .map_into_right_body();
            Ok(req.into_response(response))
        })
    }
}
