use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Unset means the in-memory stores are wired (single-process dev mode).
    pub database_url: Option<String>,
    pub bind_address: String,
    pub rail_base_url: String,
    pub rail_api_key: String,
    pub oracle_base_url: String,
    /// Price cache TTL in milliseconds
    pub price_ttl_ms: u64,
    /// Markdown applied on top of oracle prices (fraction, e.g. 0.01 = 1%)
    pub price_markdown: Decimal,
    /// Fee taken on every operation, in basis points
    pub fee_bps: u32,
    /// Minimum fee floor, expressed in USD
    pub min_fee_usd: Decimal,
    /// Operations stuck in SUBMITTED longer than this are reconciled
    pub reconcile_after_secs: u64,
    pub reconcile_interval_secs: u64,
    /// Idempotency record TTL in seconds
    pub idempotency_ttl_secs: u64,
    pub limit_service_url: Option<String>,
    pub auth_service_url: Option<String>,
    pub notify_api_key: Option<String>,
    pub notify_from_email: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            rail_base_url: std::env::var("RAIL_BASE_URL")
                .unwrap_or_else(|_| "https://api.payout-rail.example".to_string()),
            rail_api_key: std::env::var("RAIL_API_KEY").unwrap_or_default(),
            oracle_base_url: std::env::var("ORACLE_BASE_URL")
                .unwrap_or_else(|_| "https://prices.payout-rail.example".to_string()),
            price_ttl_ms: env_parsed("PRICE_TTL_MS", 5_000),
            price_markdown: env_decimal("PRICE_MARKDOWN", "0.01"),
            fee_bps: env_parsed("FEE_BPS", 25),
            min_fee_usd: env_decimal("MIN_FEE_USD", "0.50"),
            reconcile_after_secs: env_parsed("RECONCILE_AFTER_SECS", 120),
            reconcile_interval_secs: env_parsed("RECONCILE_INTERVAL_SECS", 60),
            idempotency_ttl_secs: env_parsed("IDEMPOTENCY_TTL_SECS", 86_400),
            limit_service_url: std::env::var("LIMIT_SERVICE_URL").ok(),
            auth_service_url: std::env::var("AUTH_SERVICE_URL").ok(),
            notify_api_key: std::env::var("NOTIFY_API_KEY").ok(),
            notify_from_email: std::env::var("NOTIFY_FROM_EMAIL")
                .unwrap_or_else(|_| "settlements@payrail.example".to_string()),
        })
    }
}

fn env_parsed<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: &str) -> Decimal {
    std::env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str(&v).ok())
        .unwrap_or_else(|| Decimal::from_str(default).expect("valid default decimal"))
}
