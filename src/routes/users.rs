use crate::{
    auth::{AuthService, AuthenticatedUserId, ChangePasswordRequest},
    error::AppError,
    models::UserResponse,
};
use actix_web::{web, HttpResponse};
use validator::Validate;

/// Returns the profile of the caller.
pub async fn me(
    auth: web::Data<AuthService>,
    user_id: AuthenticatedUserId,
) -> Result<HttpResponse, AppError> {
    let user = auth.current_user(user_id.0).await?;
    Ok(HttpResponse::Ok().json(UserResponse::from(&user)))
}

/// Changes the caller's password. Every refresh token of the account stops working.
pub async fn change_password(
    auth: web::Data<AuthService>,
    user_id: AuthenticatedUserId,
    body: web::Json<ChangePasswordRequest>,
) -> Result<HttpResponse, AppError> {
    body.validate()?;

    auth.change_password(user_id.0, &body.current_password, &body.new_password)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn deactivate(
    auth: web::Data<AuthService>,
    user_id: AuthenticatedUserId,
) -> Result<HttpResponse, AppError> {
    auth.deactivate(user_id.0).await?;
    Ok(HttpResponse::NoContent().finish())
}
