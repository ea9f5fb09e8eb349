use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::ledger::models::AssetCode;

/// Read-only price feed contract. Consumed for fee floors and swap rates;
/// nothing here mutates ledger state.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn usd_price(&self, asset: AssetCode) -> AppResult<Decimal>;
}

/// Spot price fetcher against the upstream price service.
pub struct HttpPriceOracle {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    usd_price: String,
}

impl HttpPriceOracle {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn usd_price(&self, asset: AssetCode) -> AppResult<Decimal> {
        // The dollar needs no feed
        if asset == AssetCode::Usd {
            return Ok(Decimal::ONE);
        }

        let response = self
            .client
            .get(format!("{}/v1/prices/{}", self.base_url, asset.as_str()))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::ExternalError(format!(
                "Price service returned HTTP {} for {}",
                response.status(),
                asset
            )));
        }

        let body: PriceResponse = response.json().await?;
        let price: Decimal = body
            .usd_price
            .parse()
            .map_err(|_| AppError::ExternalError(format!("Unparseable price for {}", asset)))?;

        if price <= Decimal::ZERO {
            return Err(AppError::ExternalError(format!(
                "Non-positive price for {}: {}",
                asset, price
            )));
        }

        Ok(price)
    }
}

#[derive(Debug, Clone)]
struct CachedPrice {
    price: Decimal,
    fetched_at: DateTime<Utc>,
}

/// Caching decorator over any oracle: holds prices for a short TTL and
/// applies the configured markdown overlay, so every consumer sees the same
/// conservatively-adjusted rate.
pub struct CachedPriceOracle {
    inner: Arc<dyn PriceOracle>,
    cache: RwLock<HashMap<AssetCode, CachedPrice>>,
    ttl_ms: u64,
    markdown: Decimal,
}

impl CachedPriceOracle {
    pub fn new(inner: Arc<dyn PriceOracle>, ttl_ms: u64, markdown: Decimal) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
            ttl_ms,
            markdown,
        }
    }

    fn is_fresh(&self, entry: &CachedPrice) -> bool {
        let age = Utc::now() - entry.fetched_at;
        age.num_milliseconds() < self.ttl_ms as i64
    }
}

#[async_trait]
impl PriceOracle for CachedPriceOracle {
    async fn usd_price(&self, asset: AssetCode) -> AppResult<Decimal> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&asset) {
                if self.is_fresh(entry) {
                    debug!("Price cache hit: {}", asset);
                    return Ok(entry.price);
                }
            }
        }

        let spot = self.inner.usd_price(asset).await?;
        let marked_down = spot * (Decimal::ONE - self.markdown);

        let mut cache = self.cache.write().await;
        cache.insert(
            asset,
            CachedPrice {
                price: marked_down,
                fetched_at: Utc::now(),
            },
        );

        debug!("Cached {} at {} (markdown applied)", asset, marked_down);
        Ok(marked_down)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedOracle {
        price: Decimal,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PriceOracle for FixedOracle {
        async fn usd_price(&self, _asset: AssetCode) -> AppResult<Decimal> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.price)
        }
    }

    #[tokio::test]
    async fn test_markdown_overlay_applied_once() {
        let upstream = Arc::new(FixedOracle {
            price: dec!(100),
            calls: AtomicUsize::new(0),
        });
        let oracle = CachedPriceOracle::new(upstream.clone(), 5_000, dec!(0.01));

        assert_eq!(oracle.usd_price(AssetCode::Btc).await.unwrap(), dec!(99));
        // Second read is served from cache, still marked down exactly once
        assert_eq!(oracle.usd_price(AssetCode::Btc).await.unwrap(), dec!(99));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_expires_after_ttl() {
        let upstream = Arc::new(FixedOracle {
            price: dec!(50),
            calls: AtomicUsize::new(0),
        });
        let oracle = CachedPriceOracle::new(upstream.clone(), 50, Decimal::ZERO);

        oracle.usd_price(AssetCode::Eth).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        oracle.usd_price(AssetCode::Eth).await.unwrap();

        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_assets_cached_independently() {
        let upstream = Arc::new(FixedOracle {
            price: dec!(10),
            calls: AtomicUsize::new(0),
        });
        let oracle = CachedPriceOracle::new(upstream.clone(), 5_000, Decimal::ZERO);

        oracle.usd_price(AssetCode::Btc).await.unwrap();
        oracle.usd_price(AssetCode::Sol).await.unwrap();
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }
}
