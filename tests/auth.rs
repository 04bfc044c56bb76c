mod common;

use actix_web::{http::header, http::StatusCode, test};
use chrono::Duration;
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{bearer, confirm, init_app, login, send, signed_in_user, signup, TestContext, PASSWORD};
use contacts_auth::auth::AuthPolicy;
use contacts_auth::notify::SentEmail;

#[test_log::test(actix_rt::test)]
async fn test_register_confirm_and_login_flow() {
    let mut ctx = TestContext::new();
    let app = init_app(ctx.auth.clone()).await;

    let (status, body) = signup(&app, "integration_user", "Integration@Example.com").await;
    assert_eq!(status, StatusCode::CREATED, "Registration failed: {}", body);
    assert_eq!(body["email"], "integration@example.com");
    assert_eq!(body["username"], "integration_user");
    assert_eq!(body["verified"], false);
    assert_eq!(body["state"], "registered");
    assert!(body.get("password_hash").is_none());

    // Verification is mandatory: the right password is not enough yet.
    let (status, body) = login(&app, "integration@example.com", PASSWORD).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, json!({ "error": "Email not confirmed" }));

    let mail = ctx.next_mail().await;
    assert!(matches!(mail, SentEmail::Verification { .. }));
    assert_eq!(mail.email(), "integration@example.com");
    assert!(mail
        .link()
        .starts_with("http://127.0.0.1:8080/api/auth/confirmed_email/"));

    let (status, body) = confirm(&app, &mail).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Email confirmed");
    let (status, body) = confirm(&app, &mail).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Email already confirmed");

    let (status, body) = login(&app, "INTEGRATION@example.com", PASSWORD).await;
    assert_eq!(status, StatusCode::OK, "Login failed: {}", body);
    assert_eq!(body["token_type"], "bearer");
    let access_token = body["access_token"].as_str().unwrap();
    assert!(!access_token.is_empty());
    assert!(!body["refresh_token"].as_str().unwrap().is_empty());

    let (status, body) = send(
        &app,
        test::TestRequest::get()
            .uri("/api/users/me")
            .insert_header(bearer(access_token)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["email"], "integration@example.com");
    assert_eq!(body["state"], "verified");
}

#[actix_rt::test]
async fn test_login_without_mandatory_verification() {
    let ctx = TestContext::with_policy(AuthPolicy {
        bcrypt_cost: 4,
        require_verification: false,
        ..AuthPolicy::default()
    });
    let app = init_app(ctx.auth.clone()).await;

    signup(&app, "relaxed", "relaxed@example.com").await;
    let (status, _) = login(&app, "relaxed@example.com", PASSWORD).await;
    assert_eq!(status, StatusCode::OK);
}

#[actix_rt::test]
async fn test_duplicate_registration_conflicts() {
    let ctx = TestContext::new();
    let app = init_app(ctx.auth.clone()).await;

    let (status, _) = signup(&app, "first_user", "dup@example.com").await;
    assert_eq!(status, StatusCode::CREATED);

    for variant in [
        "dup@example.com",
        "DUP@Example.COM",
        "  dup@example.com",
        "dup@example.com\t",
    ] {
        let (status, body) = signup(&app, "second_user", variant).await;
        assert_eq!(status, StatusCode::CONFLICT, "{} was accepted", variant);
        assert_eq!(body, json!({ "error": "Email already registered" }));
    }
}

#[actix_rt::test]
async fn test_malformed_and_invalid_bodies() {
    let ctx = TestContext::new();
    let app = init_app(ctx.auth.clone()).await;

    // Not JSON at all
    let (status, body) = send(
        &app,
        test::TestRequest::post()
            .uri("/api/auth/signup")
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .set_payload("{not json"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    // Missing field
    let (status, _) = send(
        &app,
        test::TestRequest::post()
            .uri("/api/auth/login")
            .set_json(json!({ "email": "a@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Well-formed but invalid
    let invalid_signups = [
        json!({ "username": "ok_name", "email": "not-an-email", "password": PASSWORD }),
        json!({ "username": "no spaces!", "email": "a@example.com", "password": PASSWORD }),
        json!({ "username": "ok_name", "email": "a@example.com", "password": "short" }),
    ];
    for payload in invalid_signups {
        let (status, body) = send(
            &app,
            test::TestRequest::post()
                .uri("/api/auth/signup")
                .set_json(&payload),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{} was accepted", payload);
        assert!(body["error"].is_string());
    }
}

#[actix_rt::test]
async fn test_wrong_password_and_unknown_email_look_identical() {
    let mut ctx = TestContext::new();
    let app = init_app(ctx.auth.clone()).await;
    signed_in_user(&mut ctx, &app, "known", "known@example.com").await;

    let wrong_password = login(&app, "known@example.com", "WrongPassword1").await;
    let unknown_email = login(&app, "unknown@example.com", PASSWORD).await;

    assert_eq!(wrong_password.0, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong_password, unknown_email);
    assert_eq!(wrong_password.1, json!({ "error": "Invalid credentials" }));
}

#[actix_rt::test]
async fn test_refresh_rotation_and_logout() {
    let mut ctx = TestContext::new();
    let app = init_app(ctx.auth.clone()).await;
    let pair = signed_in_user(&mut ctx, &app, "rotator", "rotator@example.com").await;

    let refresh = |token: &str| {
        test::TestRequest::post()
            .uri("/api/auth/refresh")
            .set_json(json!({ "refresh_token": token }))
    };
    let logout = |token: &str| {
        test::TestRequest::post()
            .uri("/api/auth/logout")
            .set_json(json!({ "refresh_token": token }))
    };

    let (status, body) = send(&app, refresh(&pair.refresh_token)).await;
    assert_eq!(status, StatusCode::OK);
    let next_refresh = body["refresh_token"].as_str().unwrap().to_string();
    assert_ne!(next_refresh, pair.refresh_token);

    // The first token was consumed; presenting it again is reuse and ends the session.
    let (status, body) = send(&app, refresh(&pair.refresh_token)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "error": "Refresh token already used" }));
    let (status, _) = send(&app, refresh(&next_refresh)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // A fresh session can be logged out, twice.
    let (_, body) = login(&app, "rotator@example.com", PASSWORD).await;
    let session = body["refresh_token"].as_str().unwrap().to_string();
    let (status, body) = send(&app, logout(&session)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, serde_json::Value::Null);
    let (status, _) = send(&app, logout(&session)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, refresh(&session)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Logout also ends the access token issued with the session.
    let (_, body) = login(&app, "rotator@example.com", PASSWORD).await;
    let access = body["access_token"].as_str().unwrap().to_string();
    let session = body["refresh_token"].as_str().unwrap().to_string();
    let me = || {
        test::TestRequest::get()
            .uri("/api/users/me")
            .insert_header(bearer(&access))
    };
    let (status, _) = send(&app, me()).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, logout(&session)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(&app, me()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "error": "Invalid token" }));

    // Forged tokens are rejected by both.
    let (status, _) = send(&app, logout("not.a.token")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app, refresh("not.a.token")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[actix_rt::test]
async fn test_expired_refresh_token() {
    let mut ctx = TestContext::new();
    let app = init_app(ctx.auth.clone()).await;
    let pair = signed_in_user(&mut ctx, &app, "sleeper", "sleeper@example.com").await;

    ctx.clock.advance(Duration::days(7));
    let (status, body) = send(
        &app,
        test::TestRequest::post()
            .uri("/api/auth/refresh")
            .set_json(json!({ "refresh_token": pair.refresh_token })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "error": "Token expired" }));

    // Logging out with an expired token still succeeds.
    let (status, _) = send(
        &app,
        test::TestRequest::post()
            .uri("/api/auth/logout")
            .set_json(json!({ "refresh_token": pair.refresh_token })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[actix_rt::test]
async fn test_resend_verification() {
    let mut ctx = TestContext::new();
    let app = init_app(ctx.auth.clone()).await;
    signup(&app, "forgetful", "forgetful@example.com").await;
    let _original = ctx.next_mail().await;

    let request_email = |email: &str| {
        test::TestRequest::post()
            .uri("/api/auth/request_email")
            .set_json(json!({ "email": email }))
    };

    let (status, known) = send(&app, request_email("forgetful@example.com")).await;
    assert_eq!(status, StatusCode::OK);
    let resent = ctx.next_mail().await;
    assert_eq!(resent.email(), "forgetful@example.com");

    // Unknown addresses get the very same answer.
    let (status, unknown) = send(&app, request_email("stranger@example.com")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(known, unknown);

    let (status, _) = confirm(&app, &resent).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        test::TestRequest::get().uri("/api/auth/confirmed_email/garbage"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[actix_rt::test]
async fn test_password_reset_flow() {
    let mut ctx = TestContext::new();
    let app = init_app(ctx.auth.clone()).await;
    let pair = signed_in_user(&mut ctx, &app, "resetter", "resetter@example.com").await;

    // The clock stays put: a link requested in the same instant as signup works.
    let (status, known) = send(
        &app,
        test::TestRequest::post()
            .uri("/api/auth/request_password_reset")
            .set_json(json!({ "email": "resetter@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, unknown) = send(
        &app,
        test::TestRequest::post()
            .uri("/api/auth/request_password_reset")
            .set_json(json!({ "email": "nobody@example.com" })),
    )
    .await;
    assert_eq!(known, unknown);

    let mail = ctx.next_mail().await;
    assert!(matches!(mail, SentEmail::PasswordReset { .. }));
    assert!(mail.link().contains("/api/auth/reset_password?token="));

    let reset = |password: &str| {
        test::TestRequest::post()
            .uri("/api/auth/reset_password")
            .set_json(json!({ "token": mail.token(), "new_password": password }))
    };
    let (status, body) = send(&app, reset("NewPassword456")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Password has been reset");

    // Single use
    let (status, _) = send(&app, reset("ThirdPassword789")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = login(&app, "resetter@example.com", PASSWORD).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = login(&app, "resetter@example.com", "NewPassword456").await;
    assert_eq!(status, StatusCode::OK);

    // Sessions opened before the reset are revoked, access tokens included.
    let (status, _) = send(
        &app,
        test::TestRequest::post()
            .uri("/api/auth/refresh")
            .set_json(json!({ "refresh_token": pair.refresh_token })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(
        &app,
        test::TestRequest::get()
            .uri("/api/users/me")
            .insert_header(bearer(&pair.access_token)),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[actix_rt::test]
async fn test_banned_user_agent_is_forbidden() {
    let ctx = TestContext::new();
    let app = init_app(ctx.auth.clone()).await;

    let (status, body) = send(
        &app,
        test::TestRequest::get()
            .uri("/health")
            .insert_header((header::USER_AGENT, "Mozilla/5.0 (compatible; Googlebot/2.1)")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, json!({ "error": "User agent is banned" }));
}

#[actix_rt::test]
async fn test_health_endpoints() {
    let ctx = TestContext::new();
    let app = init_app(ctx.auth.clone()).await;

    let (status, body) = send(&app, test::TestRequest::get().uri("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&app, test::TestRequest::get().uri("/api/healthchecker")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
