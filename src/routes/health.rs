use actix_web::{web, HttpResponse, Responder};
use chrono::Utc;
use serde_json::json;

use crate::{auth::AuthService, error::AppError};

/// Liveness check
///
/// Returns the current status of the API and timestamp without touching storage.
pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "timestamp": Utc::now()
    }))
}

/// Readiness check: 503 while the credential store is unreachable.
pub async fn health_checker(auth: web::Data<AuthService>) -> Result<HttpResponse, AppError> {
    auth.health_check().await?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "ok",
        "message": "Authentication service is healthy"
    })))
}
