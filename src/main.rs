use actix_cors::Cors;
use actix_web::{middleware::Logger, rt, web, App, HttpServer};
use sqlx::postgres::PgPoolOptions;
use std::io;
use std::sync::Arc;

use contacts_auth::auth::{AuthService, TokenService};
use contacts_auth::clock::SystemClock;
use contacts_auth::config::Config;
use contacts_auth::notify::{HttpMailNotifier, LogNotifier, Notifier};
use contacts_auth::routes::{self, ROUTES};
use contacts_auth::security::UserAgentFilter;
use contacts_auth::store::{
    run_migrations, CredentialStore, InMemoryCredentialStore, InMemoryRefreshTokenStore,
    PgCredentialStore, PgRefreshTokenStore, RefreshTokenStore,
};

fn startup_error(context: &str, error: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{}: {}", context, error))
}

/// Deletes expired refresh token records on a fixed interval for the life of the process.
async fn purge_expired_sessions(tokens: Arc<TokenService>, every: std::time::Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match tokens.purge_expired_sessions().await {
            Ok(0) => {}
            Ok(purged) => log::info!("Purged {} expired refresh token record(s)", purged),
            Err(e) => log::warn!("Failed to purge expired refresh tokens: {}", e),
        }
    }
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = Config::from_env().map_err(|e| startup_error("Invalid configuration", e))?;
    routes::validate_routes(ROUTES).map_err(|e| startup_error("Invalid route table", e))?;

    let (credentials, refresh_tokens): (Arc<dyn CredentialStore>, Arc<dyn RefreshTokenStore>) =
        match &config.database_url {
            Some(database_url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .connect(database_url)
                    .await
                    .map_err(|e| startup_error("Failed to connect to database", e))?;
                run_migrations(&pool)
                    .await
                    .map_err(|e| startup_error("Failed to run migrations", e))?;
                log::info!("Using Postgres storage");
                let credentials: Arc<dyn CredentialStore> =
                    Arc::new(PgCredentialStore::new(pool.clone()));
                let refresh_tokens: Arc<dyn RefreshTokenStore> =
                    Arc::new(PgRefreshTokenStore::new(pool));
                (credentials, refresh_tokens)
            }
            None => {
                log::warn!("DATABASE_URL not set; accounts and sessions are kept in memory only");
                let credentials: Arc<dyn CredentialStore> = Arc::new(InMemoryCredentialStore::new());
                let refresh_tokens: Arc<dyn RefreshTokenStore> =
                    Arc::new(InMemoryRefreshTokenStore::new());
                (credentials, refresh_tokens)
            }
        };

    let notifier: Arc<dyn Notifier> = match &config.mail_api_url {
        Some(url) => Arc::new(HttpMailNotifier::new(url.clone())),
        None => {
            log::warn!("MAIL_API_URL not set; account emails are written to the log");
            Arc::new(LogNotifier)
        }
    };

    let key_ring = config
        .jwt
        .key_ring()
        .map_err(|e| startup_error("Invalid signing key", e))?;
    let tokens = TokenService::new(
        key_ring,
        refresh_tokens,
        Arc::new(SystemClock),
        config.jwt.ttls,
    );
    let auth = AuthService::new(credentials, Arc::new(tokens), notifier, config.auth_policy())
        .map_err(|e| startup_error("Failed to initialise auth service", e))?;
    let auth = web::Data::new(auth);

    let purge_every = config
        .session_purge_interval
        .to_std()
        .map_err(|e| startup_error("Invalid SESSION_PURGE_INTERVAL_SECS", e))?;
    rt::spawn(purge_expired_sessions(Arc::clone(auth.tokens()), purge_every));

    let user_agent_filter = UserAgentFilter::new(&config.banned_user_agents)
        .map_err(|e| startup_error("Invalid BANNED_USER_AGENTS pattern", e))?;

    log::info!("Starting contacts auth server at {}", config.server_url());
    HttpServer::new(move || {
        App::new()
            .app_data(auth.clone())
            .wrap(user_agent_filter.clone())
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )
            .wrap(Logger::default())
            .configure(routes::config)
    })
    .bind((config.server_host.as_str(), config.server_port))?
    .run()
    .await
}
