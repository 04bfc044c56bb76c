#![allow(dead_code)]

use actix_web::{
    body::MessageBody,
    dev::{Service, ServiceResponse},
    http::StatusCode,
    test, web, App, Error,
};
use chrono::Utc;
use jsonwebtoken::Algorithm;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use contacts_auth::auth::{AuthPolicy, AuthService, KeyRing, TokenService, TokenTtls};
use contacts_auth::clock::ManualClock;
use contacts_auth::models::TokenPair;
use contacts_auth::notify::{ChannelNotifier, SentEmail};
use contacts_auth::routes;
use contacts_auth::security::UserAgentFilter;
use contacts_auth::store::{InMemoryCredentialStore, InMemoryRefreshTokenStore};

pub const PASSWORD: &str = "Password123!";

pub struct TestContext {
    pub auth: web::Data<AuthService>,
    pub clock: Arc<ManualClock>,
    pub mail: UnboundedReceiver<SentEmail>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_policy(AuthPolicy {
            bcrypt_cost: 4,
            ..AuthPolicy::default()
        })
    }

    pub fn with_policy(policy: AuthPolicy) -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tokens = TokenService::new(
            KeyRing::new(Algorithm::HS256, b"integration_test_secret", None)
                .expect("valid key ring"),
            Arc::new(InMemoryRefreshTokenStore::new()),
            clock.clone(),
            TokenTtls::default(),
        );
        let (notifier, mail) = ChannelNotifier::new();
        let auth = AuthService::new(
            Arc::new(InMemoryCredentialStore::new()),
            Arc::new(tokens),
            Arc::new(notifier),
            policy,
        )
        .expect("auth service");
        Self {
            auth: web::Data::new(auth),
            clock,
            mail,
        }
    }

    /// Waits for the next outgoing email.
    pub async fn next_mail(&mut self) -> SentEmail {
        tokio::time::timeout(Duration::from_secs(5), self.mail.recv())
            .await
            .expect("timed out waiting for an email")
            .expect("mail channel closed")
    }
}

pub async fn init_app(
    auth: web::Data<AuthService>,
) -> impl Service<actix_http::Request, Response = ServiceResponse<impl MessageBody>, Error = Error> {
    test::init_service(
        App::new()
            .app_data(auth)
            .wrap(
                UserAgentFilter::new(["bot-Yandex", "Python-urllib", "Googlebot"])
                    .expect("valid patterns"),
            )
            .configure(routes::config),
    )
    .await
}

/// Sends a request and returns the status with the parsed JSON body (`Null` when empty).
pub async fn send(
    app: &impl Service<actix_http::Request, Response = ServiceResponse<impl MessageBody>, Error = Error>,
    req: test::TestRequest,
) -> (StatusCode, Value) {
    let resp = test::call_service(app, req.to_request()).await;
    let status = resp.status();
    let body = test::read_body(resp).await;
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|_| {
            panic!("non-JSON body: {}", String::from_utf8_lossy(&body))
        })
    };
    (status, json)
}

pub fn bearer(token: &str) -> (&'static str, String) {
    ("Authorization", format!("Bearer {}", token))
}

pub async fn signup(
    app: &impl Service<actix_http::Request, Response = ServiceResponse<impl MessageBody>, Error = Error>,
    username: &str,
    email: &str,
) -> (StatusCode, Value) {
    send(
        app,
        test::TestRequest::post()
            .uri("/api/auth/signup")
            .set_json(json!({
                "username": username,
                "email": email,
                "password": PASSWORD
            })),
    )
    .await
}

pub async fn login(
    app: &impl Service<actix_http::Request, Response = ServiceResponse<impl MessageBody>, Error = Error>,
    email: &str,
    password: &str,
) -> (StatusCode, Value) {
    send(
        app,
        test::TestRequest::post()
            .uri("/api/auth/login")
            .set_json(json!({ "email": email, "password": password })),
    )
    .await
}

/// Follows the link from a verification email.
pub async fn confirm(
    app: &impl Service<actix_http::Request, Response = ServiceResponse<impl MessageBody>, Error = Error>,
    email: &SentEmail,
) -> (StatusCode, Value) {
    send(
        app,
        test::TestRequest::get().uri(&format!("/api/auth/confirmed_email/{}", email.token())),
    )
    .await
}

/// Signs up, confirms the email and logs in.
pub async fn signed_in_user(
    ctx: &mut TestContext,
    app: &impl Service<actix_http::Request, Response = ServiceResponse<impl MessageBody>, Error = Error>,
    username: &str,
    email: &str,
) -> TokenPair {
    let (status, body) = signup(app, username, email).await;
    assert_eq!(status, StatusCode::CREATED, "signup failed: {}", body);
    let mail = ctx.next_mail().await;
    let (status, body) = confirm(app, &mail).await;
    assert_eq!(status, StatusCode::OK, "confirmation failed: {}", body);
    let (status, body) = login(app, email, PASSWORD).await;
    assert_eq!(status, StatusCode::OK, "login failed: {}", body);
    serde_json::from_value(body).expect("token pair")
}
