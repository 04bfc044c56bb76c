use crate::{
    auth::{
        AuthService, EmailRequest, LoginRequest, MessageResponse, RefreshRequest,
        ResetPasswordRequest, SignupRequest, VerificationOutcome,
    },
    error::AppError,
    models::UserResponse,
};
use actix_web::{web, HttpResponse};
use validator::Validate;

/// Register a new user
///
/// Creates an unverified account and sends the verification email.
pub async fn signup(
    auth: web::Data<AuthService>,
    signup_data: web::Json<SignupRequest>,
) -> Result<HttpResponse, AppError> {
    signup_data.validate()?;

    let user = auth
        .register(&signup_data.username, &signup_data.email, &signup_data.password)
        .await?;

    Ok(HttpResponse::Created().json(UserResponse::from(&user)))
}

/// Login user
///
/// Checks the credentials and returns an access/refresh token pair.
pub async fn login(
    auth: web::Data<AuthService>,
    login_data: web::Json<LoginRequest>,
) -> Result<HttpResponse, AppError> {
    login_data.validate()?;

    let pair = auth.login(&login_data.email, &login_data.password).await?;
    Ok(HttpResponse::Ok().json(pair))
}

pub async fn refresh(
    auth: web::Data<AuthService>,
    body: web::Json<RefreshRequest>,
) -> Result<HttpResponse, AppError> {
    body.validate()?;

    let pair = auth.refresh(&body.refresh_token).await?;
    Ok(HttpResponse::Ok().json(pair))
}

pub async fn logout(
    auth: web::Data<AuthService>,
    body: web::Json<RefreshRequest>,
) -> Result<HttpResponse, AppError> {
    body.validate()?;

    auth.logout(&body.refresh_token).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// Target of the link in the verification email.
pub async fn confirm_email(
    auth: web::Data<AuthService>,
    token: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let message = match auth.verify_email(&token).await? {
        VerificationOutcome::Verified => "Email confirmed",
        VerificationOutcome::AlreadyVerified => "Email already confirmed",
    };
    Ok(HttpResponse::Ok().json(MessageResponse::new(message)))
}

pub async fn resend_verification(
    auth: web::Data<AuthService>,
    body: web::Json<EmailRequest>,
) -> Result<HttpResponse, AppError> {
    body.validate()?;

    auth.resend_verification(&body.email).await?;
    Ok(HttpResponse::Ok().json(MessageResponse::new(
        "If the account exists and is not yet confirmed, a verification email has been sent",
    )))
}

pub async fn request_password_reset(
    auth: web::Data<AuthService>,
    body: web::Json<EmailRequest>,
) -> Result<HttpResponse, AppError> {
    body.validate()?;

    auth.request_password_reset(&body.email).await?;
    Ok(HttpResponse::Ok().json(MessageResponse::new(
        "If the account exists, a password reset email has been sent",
    )))
}

pub async fn reset_password(
    auth: web::Data<AuthService>,
    body: web::Json<ResetPasswordRequest>,
) -> Result<HttpResponse, AppError> {
    body.validate()?;

    auth.reset_password(&body.token, &body.new_password).await?;
    Ok(HttpResponse::Ok().json(MessageResponse::new("Password has been reset")))
}
