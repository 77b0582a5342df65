mod auth;
mod credentials;

use anyhow::{Context, Result, bail};
use auth::{CodeStore, CredentialStore};
use axum::{Router, middleware};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::catch_panic::CatchPanicLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// upper bounds on configured lifetimes; also keeps chrono arithmetic in range
const MAX_ACCESS_TOKEN_EXP_MINUTES: u32 = 24 * 60;
const MAX_REFRESH_TOKEN_EXP_DAYS: u32 = 365;
const MAX_AUTH_CODE_EXP_MINUTES: u32 = 60;
const MAX_ACCOUNT_CODE_EXP_HOURS: u32 = 7 * 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CodeStoreKind {
    /// In-process; codes and revocations are lost on restart
    Memory,
    Redis,
}

#[derive(Parser, Debug)]
#[command(name = "authkeep")]
#[command(about = "authorization code + PKCE token server with per-client signing keys")]
struct Args {
    /// Host to bind to
    #[arg(long, env = "SERVER_HOST", default_value = "localhost")]
    host: String,

    /// Port to bind to
    #[arg(short, long, env = "SERVER_PORT", default_value = "8080")]
    port: u16,

    /// Version segment of the route prefix, /api/{version}/authorization-server
    #[arg(long, env = "API_VERSION", default_value = "v1")]
    api_version: String,

    /// HS256 secret for refresh tokens
    #[arg(long, env = "JWT_SECRET")]
    jwt_secret: Option<String>,

    #[arg(long, env = "ACCESS_TOKEN_EXP_MINUTES", default_value = "15")]
    access_token_exp_minutes: u32,

    #[arg(long, env = "REFRESH_TOKEN_EXP_DAYS", default_value = "7")]
    refresh_token_exp_days: u32,

    #[arg(long, env = "AUTH_CODE_EXP_MINUTES", default_value = "5")]
    auth_code_exp_minutes: u32,

    /// Lifetime of email verification codes
    #[arg(long, env = "VERIFICATION_EXP_HOURS", default_value = "24")]
    verification_exp_hours: u32,

    /// Lifetime of password reset codes
    #[arg(long, env = "PASSWORD_RESET_EXP_HOURS", default_value = "24")]
    password_reset_exp_hours: u32,

    /// Where authorization codes and revoked refresh tokens live
    #[arg(long, value_enum, env = "CODE_STORE", default_value = "memory")]
    code_store: CodeStoreKind,

    /// Redis URL, required with --code-store redis
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// JSON file of users and clients to load at startup
    #[arg(long, env = "SEED_FILE")]
    seed_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "authkeep=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = auth_config(&args)?;
    let clock: Arc<dyn auth::Clock> = Arc::new(auth::SystemClock);
    let secrets = Arc::new(auth::Argon2Secrets::new());

    let users_and_clients = Arc::new(credentials::MemoryCredentialStore::new());
    if let Some(path) = &args.seed_file {
        credentials::load_seed_file(path, users_and_clients.as_ref(), secrets.as_ref()).await?;
        tracing::info!("Loaded seed data from {}", path.display());
    } else {
        tracing::warn!("No SEED_FILE given, starting with no clients registered");
    }

    let code_store: Arc<dyn CodeStore + Send + Sync> = match args.code_store {
        CodeStoreKind::Memory => {
            let store = auth::MemoryCodeStore::new(clock.clone());
            tokio::spawn({
                let store = store.clone();
                async move {
                    loop {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        store.cleanup_expired().await;
                    }
                }
            });
            Arc::new(store)
        }
        CodeStoreKind::Redis => {
            // checked in auth_config
            let url = args.redis_url.as_deref().unwrap_or_default();
            tracing::info!("Connecting to Redis code store");
            Arc::new(auth::RedisCodeStore::connect(url).await?)
        }
    };

    let credential_store: Arc<dyn CredentialStore + Send + Sync> = users_and_clients;
    let oauth_service = Arc::new(auth::OAuthService::new(
        config,
        credential_store,
        code_store,
        secrets,
        clock,
        auth::Integrations {
            email: Arc::new(auth::LogEmailSender),
            keys: Arc::new(auth::RsaKeyPairGenerator::new()),
        },
    ));

    run_server(&args, auth::OAuthAppState { oauth_service }).await
}

fn auth_config(args: &Args) -> Result<auth::AuthConfig> {
    let jwt_secret = args
        .jwt_secret
        .clone()
        .filter(|secret| !secret.is_empty())
        .ok_or_else(|| anyhow::anyhow!("JWT_SECRET is required"))?;

    for (name, value, max) in [
        (
            "ACCESS_TOKEN_EXP_MINUTES",
            args.access_token_exp_minutes,
            MAX_ACCESS_TOKEN_EXP_MINUTES,
        ),
        (
            "REFRESH_TOKEN_EXP_DAYS",
            args.refresh_token_exp_days,
            MAX_REFRESH_TOKEN_EXP_DAYS,
        ),
        (
            "AUTH_CODE_EXP_MINUTES",
            args.auth_code_exp_minutes,
            MAX_AUTH_CODE_EXP_MINUTES,
        ),
        (
            "VERIFICATION_EXP_HOURS",
            args.verification_exp_hours,
            MAX_ACCOUNT_CODE_EXP_HOURS,
        ),
        (
            "PASSWORD_RESET_EXP_HOURS",
            args.password_reset_exp_hours,
            MAX_ACCOUNT_CODE_EXP_HOURS,
        ),
    ] {
        if value == 0 {
            bail!("{} must be greater than zero", name);
        }
        if value > max {
            bail!("{} must be at most {}, got {}", name, max, value);
        }
    }
    if args.code_store == CodeStoreKind::Redis && args.redis_url.is_none() {
        bail!("REDIS_URL required when CODE_STORE is redis");
    }

    Ok(auth::AuthConfig {
        jwt_secret,
        access_token_exp: chrono::Duration::minutes(args.access_token_exp_minutes.into()),
        refresh_token_exp: chrono::Duration::days(args.refresh_token_exp_days.into()),
        auth_code_exp: Duration::from_secs(u64::from(args.auth_code_exp_minutes) * 60),
        verification_exp: Duration::from_secs(u64::from(args.verification_exp_hours) * 3600),
        password_reset_exp: Duration::from_secs(u64::from(args.password_reset_exp_hours) * 3600),
    })
}

async fn run_server(args: &Args, state: auth::OAuthAppState) -> Result<()> {
    // we pass this to TcpListener::bind() which accepts ToSocketAddrs,
    // so hostnames like "localhost" get resolved properly (unlike SocketAddr::parse)
    let bind_addr = format!("{}:{}", args.host, args.port);
    let prefix = format!("/api/{}/authorization-server", args.api_version);

    // SmartIpKeyExtractor checks x-forwarded-for and friends before falling back to peer ip
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(SmartIpKeyExtractor)
            .per_second(10)
            .burst_size(30)
            .finish()
            .context("failed to build rate limiter config")?,
    );
    let governor_limiter = governor_conf.limiter().clone();
    let rate_limit_layer = GovernorLayer::new(governor_conf);

    // Stricter for anything that takes a password or client secret
    let auth_governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(SmartIpKeyExtractor)
            .per_second(5)
            .burst_size(10)
            .finish()
            .context("failed to build auth rate limiter config")?,
    );
    let auth_governor_limiter = auth_governor_conf.limiter().clone();
    let auth_rate_limit_layer = GovernorLayer::new(auth_governor_conf);

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            governor_limiter.retain_recent();
            auth_governor_limiter.retain_recent();
        }
    });

    let api = auth::credential_routes(state.clone())
        .layer(auth_rate_limit_layer)
        .merge(auth::resource_routes(state).layer(rate_limit_layer));

    let app = Router::new()
        .nest(&prefix, api)
        .layer(CatchPanicLayer::new())
        .layer(middleware::from_fn(auth::trace_id_middleware));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Listening on http://{}{}", bind_addr, prefix);

    // into_make_service_with_connect_info gives us the peer ip for rate limiting fallback
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["authkeep", "--jwt-secret", "s3cret"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_auth_config_defaults() {
        let config = auth_config(&args(&[
            "--access-token-exp-minutes",
            "15",
            "--refresh-token-exp-days",
            "7",
            "--auth-code-exp-minutes",
            "5",
        ]))
        .unwrap();
        assert_eq!(config.access_token_exp, chrono::Duration::minutes(15));
        assert_eq!(config.refresh_token_exp, chrono::Duration::days(7));
        assert_eq!(config.auth_code_exp, Duration::from_secs(300));
        assert_eq!(config.verification_exp, Duration::from_secs(24 * 3600));
        assert_eq!(config.password_reset_exp, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_auth_config_caps_lifetimes() {
        // u32::MAX days would overflow chrono::Duration::days
        let huge = u32::MAX.to_string();
        assert!(auth_config(&args(&["--refresh-token-exp-days", &huge])).is_err());
        assert!(auth_config(&args(&["--access-token-exp-minutes", &huge])).is_err());
        assert!(auth_config(&args(&["--refresh-token-exp-days", "366"])).is_err());
        assert!(auth_config(&args(&["--auth-code-exp-minutes", "61"])).is_err());
        assert!(auth_config(&args(&["--password-reset-exp-hours", "169"])).is_err());

        let config = auth_config(&args(&[
            "--refresh-token-exp-days",
            "365",
            "--access-token-exp-minutes",
            "1440",
            "--verification-exp-hours",
            "168",
        ]))
        .unwrap();
        assert_eq!(config.refresh_token_exp, chrono::Duration::days(365));
        assert_eq!(config.access_token_exp, chrono::Duration::hours(24));
    }

    #[test]
    fn test_auth_config_rejects_zero_lifetimes() {
        assert!(auth_config(&args(&["--access-token-exp-minutes", "0"])).is_err());
        assert!(auth_config(&args(&["--auth-code-exp-minutes", "0"])).is_err());
        assert!(auth_config(&args(&["--verification-exp-hours", "0"])).is_err());
    }

    #[test]
    fn test_redis_store_needs_url() {
        let mut a = args(&["--code-store", "redis"]);
        a.redis_url = None;
        assert!(auth_config(&a).is_err());

        a.redis_url = Some("redis://localhost:6379".to_string());
        assert!(auth_config(&a).is_ok());
    }

    #[test]
    fn test_empty_secret_is_rejected() {
        let mut a = args(&[]);
        a.jwt_secret = Some(String::new());
        assert!(auth_config(&a).is_err());
    }
}
