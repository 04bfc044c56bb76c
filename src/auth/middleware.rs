use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header,
    web, Error, HttpMessage, ResponseError,
};
use futures::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;
use uuid::Uuid;

use super::{AuthService, AuthenticatedUserId};
use crate::error::AppError;

/// Requires a valid access token in `Authorization: Bearer <token>`.
///
/// Only wrapped around bearer routes; which routes those are is decided by the route
/// table, not here. The token's session is looked up on every request, so a token
/// stops working as soon as its session is revoked. Rejections are answered directly
/// with a 401 response.
pub struct AuthMiddleware;

impl<S, B> Transform<S, ServiceRequest> for AuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = AuthMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthMiddlewareService {
            service: Rc::new(service),
        }))
    }
}

pub struct AuthMiddlewareService<S> {
    service: Rc<S>,
}

async fn authenticate(req: &ServiceRequest) -> Result<Uuid, AppError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Missing token".into()))?;

    let auth = req.app_data::<web::Data<AuthService>>().ok_or_else(|| {
        log::error!("AuthService is not registered as app data");
        AppError::InternalServerError("Internal server error".into())
    })?;

    Ok(auth.authenticate(token).await?)
}

impl<S, B> Service<ServiceRequest> for AuthMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        Box::pin(async move {
            match authenticate(&req).await {
                Ok(user_id) => {
                    req.extensions_mut().insert(AuthenticatedUserId(user_id));
                    service
                        .call(req)
                        .await
                        .map(ServiceResponse::map_into_left_body)
                }
                Err(app_err) => {
                    log::debug!("Rejected bearer request to {}: {}", req.path(), app_err);
                    let response = req.into_response(app_err.error_response());
                    Ok(response.map_into_right_body())
                }
            }
        })
    }
}
