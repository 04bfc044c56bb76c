//! The HTTP surface, declared as a single table.
//!
//! Every endpoint appears exactly once in [`ROUTES`] with its method, path and access
//! level. [`validate_routes`] checks the table at startup and [`config`] turns it into
//! actix resources, one per distinct path.

pub mod auth;
pub mod health;
pub mod users;

use actix_web::{http::Method, web, Route};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::auth::AuthMiddleware;
use crate::error::json_error_handler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_method(self) -> Method {
        match self {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    /// Requires `Authorization: Bearer <access token>`.
    Bearer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Health,
    HealthChecker,
    Signup,
    Login,
    Refresh,
    Logout,
    ConfirmEmail,
    ResendVerification,
    RequestPasswordReset,
    ResetPassword,
    CurrentUser,
    ChangePassword,
    Deactivate,
}

#[derive(Debug, Clone, Copy)]
pub struct RouteEntry {
    pub method: HttpMethod,
    pub path: &'static str,
    pub access: Access,
    pub endpoint: Endpoint,
}

const fn entry(
    method: HttpMethod,
    path: &'static str,
    access: Access,
    endpoint: Endpoint,
) -> RouteEntry {
    RouteEntry {
        method,
        path,
        access,
        endpoint,
    }
}

use Access::{Bearer, Public};
use HttpMethod::{Delete, Get, Post, Put};

pub const ROUTES: &[RouteEntry] = &[
    entry(Get, "/health", Public, Endpoint::Health),
    entry(Get, "/api/healthchecker", Public, Endpoint::HealthChecker),
    entry(Post, "/api/auth/signup", Public, Endpoint::Signup),
    entry(Post, "/api/auth/login", Public, Endpoint::Login),
    entry(Post, "/api/auth/refresh", Public, Endpoint::Refresh),
    entry(Post, "/api/auth/logout", Public, Endpoint::Logout),
    entry(Get, "/api/auth/confirmed_email/{token}", Public, Endpoint::ConfirmEmail),
    entry(Post, "/api/auth/request_email", Public, Endpoint::ResendVerification),
    entry(Post, "/api/auth/request_password_reset", Public, Endpoint::RequestPasswordReset),
    entry(Post, "/api/auth/reset_password", Public, Endpoint::ResetPassword),
    entry(Get, "/api/users/me", Bearer, Endpoint::CurrentUser),
    entry(Put, "/api/users/me/password", Bearer, Endpoint::ChangePassword),
    entry(Delete, "/api/users/me", Bearer, Endpoint::Deactivate),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteTableError {
    #[error("route path {0:?} must start with '/'")]
    MissingLeadingSlash(&'static str),
    #[error("route {method:?} {path} is declared more than once")]
    Duplicate {
        method: HttpMethod,
        path: &'static str,
    },
    #[error("routes on {0} disagree on access level")]
    MixedAccess(&'static str),
}

/// Rejects tables with malformed paths, duplicate (method, path) pairs, or a path whose
/// methods disagree on access. The last rule keeps one middleware stack per resource.
pub fn validate_routes(routes: &[RouteEntry]) -> Result<(), RouteTableError> {
    let mut seen: HashSet<(HttpMethod, &str)> = HashSet::new();
    let mut access_by_path: HashMap<&str, Access> = HashMap::new();

    for route in routes {
        if !route.path.starts_with('/') {
            return Err(RouteTableError::MissingLeadingSlash(route.path));
        }
        if !seen.insert((route.method, route.path)) {
            return Err(RouteTableError::Duplicate {
                method: route.method,
                path: route.path,
            });
        }
        let access = *access_by_path.entry(route.path).or_insert(route.access);
        if access != route.access {
            return Err(RouteTableError::MixedAccess(route.path));
        }
    }
    Ok(())
}

fn handler(entry: &RouteEntry) -> Route {
    let route = web::method(entry.method.as_method());
    match entry.endpoint {
        Endpoint::Health => route.to(health::health),
        Endpoint::HealthChecker => route.to(health::health_checker),
        Endpoint::Signup => route.to(auth::signup),
        Endpoint::Login => route.to(auth::login),
        Endpoint::Refresh => route.to(auth::refresh),
        Endpoint::Logout => route.to(auth::logout),
        Endpoint::ConfirmEmail => route.to(auth::confirm_email),
        Endpoint::ResendVerification => route.to(auth::resend_verification),
        Endpoint::RequestPasswordReset => route.to(auth::request_password_reset),
        Endpoint::ResetPassword => route.to(auth::reset_password),
        Endpoint::CurrentUser => route.to(users::me),
        Endpoint::ChangePassword => route.to(users::change_password),
        Endpoint::Deactivate => route.to(users::deactivate),
    }
}

/// Registers a route table. Paths keep the order of their first appearance.
pub fn register(cfg: &mut web::ServiceConfig, routes: &[RouteEntry]) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler));

    let mut paths: Vec<&'static str> = Vec::new();
    for route in routes {
        if !paths.contains(&route.path) {
            paths.push(route.path);
        }
    }

    for path in paths {
        let entries: Vec<&RouteEntry> = routes.iter().filter(|r| r.path == path).collect();
        let mut resource = web::resource(path);
        for entry in &entries {
            resource = resource.route(handler(entry));
        }
        if entries.iter().any(|e| e.access == Access::Bearer) {
            cfg.service(resource.wrap(AuthMiddleware));
        } else {
            cfg.service(resource);
        }
    }
}

/// Registers [`ROUTES`].
pub fn config(cfg: &mut web::ServiceConfig) {
    register(cfg, ROUTES);
}
