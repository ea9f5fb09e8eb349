use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Closed set of assets the ledger can hold. An unsupported asset fails to
/// parse at the boundary instead of silently skipping a balance mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssetCode {
    Btc,
    Eth,
    Sol,
    Usdt,
    Usd,
}

impl fmt::Display for AssetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl AssetCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetCode::Btc => "BTC",
            AssetCode::Eth => "ETH",
            AssetCode::Sol => "SOL",
            AssetCode::Usdt => "USDT",
            AssetCode::Usd => "USD",
        }
    }

    /// Return all supported assets
    pub fn all() -> Vec<AssetCode> {
        vec![
            AssetCode::Btc,
            AssetCode::Eth,
            AssetCode::Sol,
            AssetCode::Usdt,
            AssetCode::Usd,
        ]
    }

    /// Decimal places carried on the rail for this asset
    pub fn scale(&self) -> u32 {
        match self {
            AssetCode::Usd => 2,
            _ => 8,
        }
    }

    /// Truncate an amount to the asset's rail precision
    pub fn quantize(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(
            self.scale(),
            rust_decimal::RoundingStrategy::ToZero,
        )
    }
}

impl FromStr for AssetCode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BTC" => Ok(AssetCode::Btc),
            "ETH" => Ok(AssetCode::Eth),
            "SOL" => Ok(AssetCode::Sol),
            "USDT" => Ok(AssetCode::Usdt),
            "USD" => Ok(AssetCode::Usd),
            other => Err(AppError::InvalidInput(format!(
                "Unsupported asset: {}",
                other
            ))),
        }
    }
}

/// Balance entity (per user, per asset)
///
/// INVARIANT: available >= 0 and pending >= 0 at all times. Both fields move
/// only through ledger primitives, never by direct assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub user_id: Uuid,
    pub asset: AssetCode,

    #[serde(with = "rust_decimal::serde::float")]
    pub available: Decimal,

    #[serde(with = "rust_decimal::serde::float")]
    pub pending: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl AccountBalance {
    pub fn new(user_id: Uuid, asset: AssetCode) -> Self {
        Self {
            user_id,
            asset,
            available: Decimal::ZERO,
            pending: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    pub fn has_available(&self, required: Decimal) -> bool {
        self.available >= required
    }

    /// Total funds attributable to the user on this asset
    pub fn total(&self) -> Decimal {
        self.available + self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_asset_round_trip() {
        for asset in AssetCode::all() {
            assert_eq!(asset.as_str().parse::<AssetCode>().unwrap(), asset);
        }
        assert!("DOGE".parse::<AssetCode>().is_err());
        assert_eq!("usdt".parse::<AssetCode>().unwrap(), AssetCode::Usdt);
    }

    #[test]
    fn test_quantize_truncates_toward_zero() {
        assert_eq!(
            AssetCode::Btc.quantize(dec!(0.123456789999)),
            dec!(0.12345678)
        );
        assert_eq!(AssetCode::Usd.quantize(dec!(10.999)), dec!(10.99));
    }

    #[test]
    fn test_balance_helpers() {
        let mut balance = AccountBalance::new(Uuid::new_v4(), AssetCode::Btc);
        balance.available = dec!(100);
        balance.pending = dec!(40);

        assert!(balance.has_available(dec!(100)));
        assert!(!balance.has_available(dec!(101)));
        assert_eq!(balance.total(), dec!(140));
    }
}
