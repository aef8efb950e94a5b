use anyhow::{Context, Result};
use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "prod" | "production" => Self::Prod,
            "staging" => Self::Staging,
            _ => Self::Dev,
        }
    }

    pub fn is_dev(&self) -> bool {
        matches!(self, Self::Dev)
    }

    #[allow(dead_code)]
    pub fn is_prod(&self) -> bool {
        matches!(self, Self::Prod)
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Settings {
    pub env: Environment,
    pub server_addr: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Redis
    pub redis_url: String,
    pub redis_cache_ttl_seconds: u64,

    // CORS
    pub cors_allow_origins: Vec<String>,

    // Auth (JWT via identity provider JWKS)
    pub auth_jwks_url: String,
    pub auth_jwt_issuer: String,
    pub auth_jwt_audience: String,
    pub jwks_cache_ttl_seconds: u64,

    // Vendor dispatch network (iGo protocol)
    pub vendor_api_url: String,
    pub vendor_agent_id: String,
    pub vendor_agent_password: String,
    pub vendor_timeout_seconds: u64,
    /// When true, vendor calls are served by the built-in mock instead of the
    /// live network. For environments without vendor credentials.
    pub vendor_mock_mode: bool,

    // Pricing
    pub markup_rate: f64,
    pub commission_rate: f64,

    // Payment service
    pub payment_service_url: String,
    pub payment_service_token: String,
    pub payment_timeout_seconds: u64,

    // Settlement
    pub settlement_report_dir: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let env = Environment::from_str(&env::var("ENV").unwrap_or_else(|_| "dev".to_string()));
        let server_addr = env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        // Database
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        // Redis
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://redis:6379/0".to_string());
        let redis_cache_ttl_seconds = env::var("REDIS_CACHE_TTL_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3600); // 1 hour default

        // CORS
        let cors_allow_origins = env::var("CORS_ALLOW_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        // Auth
        let auth_jwks_url = env::var("AUTH_JWKS_URL").context("AUTH_JWKS_URL must be set")?;
        let auth_jwt_issuer = env::var("AUTH_JWT_ISSUER").context("AUTH_JWT_ISSUER must be set")?;
        let auth_jwt_audience =
            env::var("AUTH_JWT_AUDIENCE").unwrap_or_else(|_| "authenticated".to_string());
        let jwks_cache_ttl_seconds = env::var("JWKS_CACHE_TTL_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1800); // 30 minutes default

        // Vendor dispatch network
        let vendor_mock_mode = env::var("VENDOR_MOCK_MODE")
            .map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let vendor_api_url =
            env::var("VENDOR_API_URL").unwrap_or_else(|_| "http://vendor-gateway:9000".to_string());
        let (vendor_agent_id, vendor_agent_password) = if vendor_mock_mode {
            (
                env::var("VENDOR_AGENT_ID").unwrap_or_else(|_| "mock-agent".to_string()),
                env::var("VENDOR_AGENT_PASSWORD").unwrap_or_else(|_| "mock-password".to_string()),
            )
        } else {
            (
                env::var("VENDOR_AGENT_ID").context("VENDOR_AGENT_ID must be set")?,
                env::var("VENDOR_AGENT_PASSWORD").context("VENDOR_AGENT_PASSWORD must be set")?,
            )
        };
        let vendor_timeout_seconds = env::var("VENDOR_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30); // the vendor protocol allows slow responses

        // Pricing
        let markup_rate = env::var("MARKUP_RATE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.25);
        let commission_rate = env::var("COMMISSION_RATE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.20);

        // Payment service
        let payment_service_url = env::var("PAYMENT_SERVICE_URL")
            .unwrap_or_else(|_| "http://payment-service:8100".to_string());
        let payment_service_token =
            env::var("PAYMENT_SERVICE_TOKEN").unwrap_or_else(|_| "dev-token".to_string());
        let payment_timeout_seconds = env::var("PAYMENT_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        // Settlement
        let settlement_report_dir =
            env::var("SETTLEMENT_REPORT_DIR").unwrap_or_else(|_| "./settlement-reports".to_string());

        Ok(Settings {
            env,
            server_addr,
            database_url,
            database_max_connections,
            redis_url,
            redis_cache_ttl_seconds,
            cors_allow_origins,
            auth_jwks_url,
            auth_jwt_issuer,
            auth_jwt_audience,
            jwks_cache_ttl_seconds,
            vendor_api_url,
            vendor_agent_id,
            vendor_agent_password,
            vendor_timeout_seconds,
            vendor_mock_mode,
            markup_rate,
            commission_rate,
            payment_service_url,
            payment_service_token,
            payment_timeout_seconds,
            settlement_report_dir,
        })
    }
}
