use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::{
    api::handler::AppState,
    audit::{AuditLog, AuditSink, MemoryAuditSink, PgAuditSink},
    config::Config,
    error::AppResult,
    idempotency::{IdempotencyStore, MemoryIdempotencyStore, PgIdempotencyStore},
    ledger::{LedgerStore, MemoryLedger, PgLedger},
    locks::{DistributedMutex, MemoryMutex, PgMutex},
    notify::{EmailNotifier, NoopNotifier, NotificationDispatcher},
    oracle::{CachedPriceOracle, HttpPriceOracle, PriceOracle},
    rail::HttpRailAdapter,
    risk::{
        AuthValidator, HttpAuthValidator, HttpLimitChecker, LimitChecker,
        PermissiveAuth, PermissiveLimits,
    },
    settlement::{engine::EngineConfig, reconciler::Reconciler, SettlementEngine},
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    // Shared stores: Postgres when configured, in-memory for single-process
    // development. A process-local idempotency map breaks correctness the
    // moment a second instance runs, so production always sets DATABASE_URL.
    let pool = match &config.database_url {
        Some(url) => Some(initialize_database(url).await?),
        None => {
            warn!("⚠️  DATABASE_URL not set - using in-memory stores (single process only)");
            None
        }
    };

    let (ledger, idempotency, mutex, audit_sink): (
        Arc<dyn LedgerStore>,
        Arc<dyn IdempotencyStore>,
        Arc<dyn DistributedMutex>,
        Arc<dyn AuditSink>,
    ) = match &pool {
        Some(pool) => (
            Arc::new(PgLedger::new(pool.clone())),
            Arc::new(PgIdempotencyStore::new(
                pool.clone(),
                config.idempotency_ttl_secs,
            )),
            Arc::new(PgMutex::new(pool.clone())),
            Arc::new(PgAuditSink::new(pool.clone())),
        ),
        None => (
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryIdempotencyStore::new(config.idempotency_ttl_secs)),
            Arc::new(MemoryMutex::new()),
            Arc::new(MemoryAuditSink::new()),
        ),
    };
    let audit = AuditLog::spawn(audit_sink);
    info!("✅ Ledger, idempotency store, mutex and audit log initialized");

    // Price oracle with TTL cache and markdown overlay
    let spot_oracle = Arc::new(HttpPriceOracle::new(config.oracle_base_url.clone()));
    let oracle: Arc<dyn PriceOracle> = Arc::new(CachedPriceOracle::new(
        spot_oracle,
        config.price_ttl_ms,
        config.price_markdown,
    ));
    info!(
        "✅ Price oracle initialized (ttl {}ms, markdown {})",
        config.price_ttl_ms, config.price_markdown
    );

    // External rail adapter
    let rail = Arc::new(HttpRailAdapter::new(
        config.rail_base_url.clone(),
        config.rail_api_key.clone(),
    ));
    info!("✅ Rail adapter initialized for {}", config.rail_base_url);

    // Guard collaborators: HTTP services when configured, loudly permissive
    // stubs otherwise
    let limits: Arc<dyn LimitChecker> = match &config.limit_service_url {
        Some(url) => {
            info!("✅ Limit service: {}", url);
            Arc::new(HttpLimitChecker::new(url.clone()))
        }
        None => {
            warn!("⚠️  LIMIT_SERVICE_URL not set - limit checks are permissive");
            Arc::new(PermissiveLimits)
        }
    };
    let auth: Arc<dyn AuthValidator> = match &config.auth_service_url {
        Some(url) => {
            info!("✅ Auth validator: {}", url);
            Arc::new(HttpAuthValidator::new(url.clone()))
        }
        None => {
            warn!("⚠️  AUTH_SERVICE_URL not set - factor checks are permissive");
            Arc::new(PermissiveAuth)
        }
    };

    let notifier: Arc<dyn NotificationDispatcher> = match &config.notify_api_key {
        Some(api_key) => {
            info!("✅ Email notifier initialized");
            Arc::new(EmailNotifier::new(
                api_key.clone(),
                config.notify_from_email.clone(),
            ))
        }
        None => {
            warn!("⚠️  NOTIFY_API_KEY not set - notifications are logged only");
            Arc::new(NoopNotifier)
        }
    };

    let engine = Arc::new(SettlementEngine::new(
        ledger,
        idempotency.clone(),
        rail,
        mutex,
        oracle,
        limits,
        auth,
        notifier,
        audit,
        EngineConfig {
            fee_bps: config.fee_bps,
            min_fee_usd: config.min_fee_usd,
            reconcile_after_secs: config.reconcile_after_secs,
            ..EngineConfig::default()
        },
    ));
    info!("✅ Settlement engine initialized");

    // Background reconciliation of ambiguous rail outcomes
    Reconciler::new(engine.clone(), config.reconcile_interval_secs).start();
    info!(
        "✅ Reconciler started (every {}s, submitted > {}s)",
        config.reconcile_interval_secs, config.reconcile_after_secs
    );

    // Hourly idempotency TTL sweep
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;

            match idempotency.purge_expired().await {
                Ok(count) => {
                    if count > 0 {
                        info!("🗑️  Purged {} expired idempotency record(s)", count);
                    }
                }
                Err(e) => warn!("Idempotency purge failed: {:?}", e),
            }
        }
    });
    info!("✅ Idempotency purge task started (hourly)");

    Ok(AppState { engine })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
