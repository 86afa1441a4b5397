//! Application Configuration
//!
//! Environment-based configuration with validation. Misconfiguration of a
//! required option fails loud at startup rather than degrading at runtime.

use std::env;
use std::time::Duration;

use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app: AppSettings,
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub cache: CacheSettings,
    pub jwt: JwtSettings,
    pub auth: AuthSettings,
    pub health: HealthSettings,
    pub cors: CorsSettings,
    pub email: EmailSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    pub name: String,
    pub env: String,
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Connection-pool settings. `pool_size` is the steady-state pool;
/// `max_overflow` is the burst headroom on top of it.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
    pub max_overflow: u32,
    pub pool_timeout_secs: u64,
    pub pool_recycle_secs: u64,
    pub connect_timeout_secs: u64,
    pub statement_timeout_ms: u64,
    pub idle_in_transaction_timeout_ms: u64,
    pub echo: bool,
}

impl DatabaseSettings {
    /// Hard cap on concurrent connections: pool plus overflow.
    pub fn max_connections(&self) -> u32 {
        self.pool_size + self.max_overflow
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_timeout_secs)
    }

    pub fn pool_recycle(&self) -> Duration {
        Duration::from_secs(self.pool_recycle_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub db: u8,
    pub password: Option<String>,
}

impl RedisSettings {
    /// REDIS_URL wins; otherwise the URL is assembled from host/port/db.
    pub fn effective_url(&self) -> String {
        if let Some(ref url) = self.url {
            return url.clone();
        }
        match &self.password {
            Some(pw) => format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Default TTL for cached query results (DB_CACHE_TTL).
    pub query_ttl_secs: u64,
    /// Bound on the in-memory query-cache fallback (DB_CACHE_MAX_MEMORY).
    pub max_memory_entries: usize,
    /// Queries slower than this are counted and logged (DB_SLOW_QUERY_THRESHOLD).
    pub slow_query_threshold_secs: f64,
    pub l1_max_entries: usize,
    pub l1_max_memory_mb: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtSettings {
    pub secret: String,
    pub access_expire_hours: f64,
    pub refresh_expire_days: i64,
    pub clock_skew_leeway_secs: u64,
    pub issuer: String,
    pub kid: String,
    /// Remote JWKS endpoint for RS256-verified tokens; absent means
    /// HS256-only verification.
    pub jwks_url: Option<String>,
}

impl JwtSettings {
    pub fn access_ttl_secs(&self) -> i64 {
        (self.access_expire_hours * 3600.0) as i64
    }

    pub fn refresh_ttl_secs(&self) -> i64 {
        self.refresh_expire_days * 86_400
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    pub bcrypt_rounds: u32,
    pub max_failed_attempts: i32,
    pub lockout_minutes: i64,
    pub webauthn_enabled: bool,
    pub webauthn_mock: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthSettings {
    pub check_interval_secs: u64,
    pub max_response_time_ms: f64,
    pub max_failed_connections: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsSettings {
    pub allowed_origins: Vec<String>,
    pub max_age: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailSettings {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub from_email: String,
    pub from_name: String,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret = env::var("JWT_SECRET_KEY")
            .or_else(|_| env::var("JWT_SECRET"))
            .map_err(|_| anyhow::anyhow!("JWT_SECRET_KEY (or JWT_SECRET) must be set"))?;

        Ok(Self {
            app: AppSettings {
                name: env::var("APP_NAME").unwrap_or_else(|_| "Kehilla Directory API".to_string()),
                env: env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
                debug: env_flag("APP_DEBUG", false),
            },
            server: ServerSettings {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_parse("PORT", 8080),
            },
            database: DatabaseSettings {
                url: env::var("DATABASE_URL")
                    .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
                pool_size: env_parse("DB_POOL_SIZE", 10),
                max_overflow: env_parse("DB_MAX_OVERFLOW", 20),
                pool_timeout_secs: env_parse("DB_POOL_TIMEOUT", 30),
                pool_recycle_secs: env_parse("DB_POOL_RECYCLE", 3600),
                connect_timeout_secs: env_parse("DB_CONNECT_TIMEOUT", 10),
                statement_timeout_ms: env_parse("DB_STATEMENT_TIMEOUT_MS", 60_000),
                idle_in_transaction_timeout_ms: env_parse(
                    "DB_IDLE_IN_TRANSACTION_TIMEOUT_MS",
                    300_000,
                ),
                echo: env_flag("DB_ECHO", false),
            },
            redis: RedisSettings {
                url: env::var("REDIS_URL").ok(),
                host: env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env_parse("REDIS_PORT", 6379),
                db: env_parse("REDIS_DB", 0),
                password: env::var("REDIS_PASSWORD").ok(),
            },
            cache: CacheSettings {
                query_ttl_secs: env_parse("DB_CACHE_TTL", 300),
                max_memory_entries: env_parse("DB_CACHE_MAX_MEMORY", 1000),
                slow_query_threshold_secs: env_parse("DB_SLOW_QUERY_THRESHOLD", 1.0),
                l1_max_entries: env_parse("CACHE_L1_MAX_ENTRIES", 1000),
                l1_max_memory_mb: env_parse("CACHE_L1_MAX_MEMORY_MB", 100),
            },
            jwt: JwtSettings {
                secret: jwt_secret,
                access_expire_hours: env_parse("JWT_ACCESS_EXPIRE_HOURS", 0.25),
                refresh_expire_days: env_parse("JWT_REFRESH_EXPIRE_DAYS", 30),
                clock_skew_leeway_secs: env_parse("JWT_CLOCK_SKEW_LEEWAY", 30),
                issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "kehilla-directory".to_string()),
                kid: env::var("JWT_KID").unwrap_or_else(|_| "primary".to_string()),
                jwks_url: env::var("JWKS_URL").ok(),
            },
            auth: AuthSettings {
                bcrypt_rounds: env_parse("BCRYPT_ROUNDS", 10),
                max_failed_attempts: env_parse("MAX_FAILED_LOGIN_ATTEMPTS", 5),
                lockout_minutes: env_parse("ACCOUNT_LOCKOUT_MINUTES", 15),
                webauthn_enabled: env_flag("WEBAUTHN_ENABLED", false),
                webauthn_mock: env_flag("WEBAUTHN_MOCK", false),
            },
            health: HealthSettings {
                check_interval_secs: env_parse("DB_HEALTH_CHECK_INTERVAL", 30),
                max_response_time_ms: env_parse("DB_MAX_RESPONSE_TIME_MS", 1000.0),
                max_failed_connections: env_parse("DB_MAX_FAILED_CONNECTIONS", 5),
            },
            cors: CorsSettings {
                allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| "http://localhost:5173".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
                max_age: env_parse("CORS_MAX_AGE", 3600),
            },
            email: EmailSettings {
                smtp_host: env::var("SMTP_HOST")
                    .unwrap_or_else(|_| "smtp.postmarkapp.com".to_string()),
                smtp_port: env_parse("SMTP_PORT", 587),
                smtp_username: env::var("SMTP_USERNAME").unwrap_or_default(),
                smtp_password: env::var("SMTP_PASSWORD").unwrap_or_default(),
                from_email: env::var("SMTP_FROM_EMAIL")
                    .unwrap_or_else(|_| "noreply@kehilla.app".to_string()),
                from_name: env::var("SMTP_FROM_NAME")
                    .unwrap_or_else(|_| "Kehilla Directory".to_string()),
            },
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.app.env == "production"
    }

    /// Check if running in development
    pub fn is_development(&self) -> bool {
        self.app.env == "development"
    }

    /// Effective bcrypt cost: reduced by two in development, never below 8;
    /// never below 10 anywhere else.
    pub fn effective_bcrypt_rounds(&self) -> u32 {
        if self.is_development() {
            self.auth.bcrypt_rounds.saturating_sub(2).max(8)
        } else {
            self.auth.bcrypt_rounds.max(10)
        }
    }
}
