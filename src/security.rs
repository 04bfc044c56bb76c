//! Request screening that applies before routing.

use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header,
    Error, ResponseError,
};
use futures::future::{ready, LocalBoxFuture, Ready};
use regex::Regex;
use std::sync::Arc;

use crate::error::AppError;

/// Rejects requests whose `User-Agent` matches any of the configured patterns with 403.
/// Requests without the header are let through.
#[derive(Debug, Clone)]
pub struct UserAgentFilter {
    patterns: Arc<Vec<Regex>>,
}

impl UserAgentFilter {
    pub fn new<I, P>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns: Arc::new(patterns),
        })
    }

    pub fn is_banned(&self, user_agent: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(user_agent))
    }
}

impl<S, B> Transform<S, ServiceRequest> for UserAgentFilter
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = UserAgentFilterService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(UserAgentFilterService {
            service,
            filter: self.clone(),
        }))
    }
}

pub struct UserAgentFilterService<S> {
    service: S,
    filter: UserAgentFilter,
}

impl<S, B> Service<ServiceRequest> for UserAgentFilterService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let banned = req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map_or(false, |agent| self.filter.is_banned(agent));

        if banned {
            log::info!("Blocked banned user agent on {}", req.path());
            let response =
                req.into_response(AppError::Forbidden("User agent is banned".into()).error_response());
            return Box::pin(async move { Ok(response.map_into_right_body()) });
        }

        let fut = self.service.call(req);
        Box::pin(async move { fut.await.map(ServiceResponse::map_into_left_body) })
    }
}
