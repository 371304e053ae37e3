//! Spot price advisor
//!
//! Quotes come from a [`PricingSource`] when one is configured and answering,
//! are cached per `(region, instance_type)` for the configured TTL, and fall
//! back to a deterministic estimate otherwise:
//!
//! ```text
//! cache hit            -> cached
//! live quote           -> live
//! on-demand * (1 - d)  -> estimated   (source or built-in catalog)
//! fallback_spot_price  -> default
//! ```

use crate::config::DeploymentConfig;
use crate::error::{PricingError, Result};
use crate::provider::PricingSource;
use crate::settings::PricingSettings;
use crate::state::{CostSnapshot, PriceSource};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// On-demand prices (USD/h) used when the source cannot answer
const ON_DEMAND_CATALOG: &[(&str, f64)] = &[
    ("t3.medium", 0.0416),
    ("t3.large", 0.0832),
    ("t3.xlarge", 0.1664),
    ("t3.2xlarge", 0.3328),
    ("m5.large", 0.096),
    ("m5.xlarge", 0.192),
    ("g4dn.xlarge", 0.526),
    ("g4dn.2xlarge", 0.752),
    ("g5.xlarge", 1.006),
];

fn catalog_price(instance_type: &str) -> Option<f64> {
    ON_DEMAND_CATALOG
        .iter()
        .find(|(name, _)| *name == instance_type)
        .map(|(_, price)| *price)
}

/// A spot price and where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct SpotQuote {
    pub instance_type: String,
    pub region: String,
    /// USD per hour
    pub price: f64,
    pub source: PriceSource,
}

impl SpotQuote {
    pub fn is_degraded(&self) -> bool {
        self.source.is_degraded()
    }
}

/// Purchase decision for the compute stage
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseDecision {
    pub use_spot: bool,
    /// Spot bid cap; `None` bids at market price or buys on-demand
    pub max_price: Option<f64>,
    pub quote: Option<SpotQuote>,
}

type CacheKey = (String, String);

pub struct PricingAdvisor {
    source: Option<Arc<dyn PricingSource>>,
    settings: PricingSettings,
    cache: Mutex<HashMap<CacheKey, (f64, Instant)>>,
}

impl PricingAdvisor {
    pub fn new(source: Option<Arc<dyn PricingSource>>, settings: PricingSettings) -> Self {
        Self {
            source,
            settings,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Spot price for an instance type in a region.
    pub async fn get_spot_price(&self, instance_type: &str, region: &str) -> SpotQuote {
        let key = (region.to_string(), instance_type.to_string());
        let quote = |price, source| SpotQuote {
            instance_type: instance_type.to_string(),
            region: region.to_string(),
            price,
            source,
        };

        {
            let cache = self.cache.lock().await;
            if let Some((price, at)) = cache.get(&key)
                && at.elapsed() < self.settings.cache_ttl()
            {
                return quote(*price, PriceSource::Cached);
            }
        }

        let live = match &self.source {
            Some(source) => source.spot_price(instance_type, region).await,
            None => Err(PricingError::Unavailable("no pricing source configured".to_string())),
        };

        match live {
            Ok(price) => {
                self.cache.lock().await.insert(key, (price, Instant::now()));
                tracing::debug!(instance_type, region, price, "Live spot price");
                quote(price, PriceSource::Live)
            }
            Err(e) => match self.on_demand_price(instance_type, region).await {
                Ok(on_demand) => {
                    let price = on_demand * (1.0 - self.settings.spot_discount);
                    tracing::warn!(
                        instance_type,
                        region,
                        "Spot price unavailable ({}); estimating {:.5}/h from on-demand {:.4}/h",
                        e,
                        price,
                        on_demand
                    );
                    quote(price, PriceSource::Estimated)
                }
                Err(_) => {
                    tracing::warn!(
                        instance_type,
                        region,
                        "Spot price unavailable ({}) and no on-demand price known; using default {:.4}/h",
                        e,
                        self.settings.fallback_spot_price
                    );
                    quote(self.settings.fallback_spot_price, PriceSource::Default)
                }
            },
        }
    }

    /// On-demand price from the source, else the built-in catalog.
    pub async fn on_demand_price(&self, instance_type: &str, region: &str) -> Result<f64> {
        if let Some(source) = &self.source {
            match source.on_demand_price(instance_type, region).await {
                Ok(price) => return Ok(price),
                Err(e) => tracing::debug!(instance_type, region, "On-demand lookup failed: {}", e),
            }
        }
        catalog_price(instance_type).ok_or_else(|| {
            PricingError::NoPrice {
                instance_type: instance_type.to_string(),
                region: region.to_string(),
            }
            .into()
        })
    }

    /// Decide between spot and on-demand for the compute stage.
    ///
    /// The bid is capped by `max_spot_price`, or by the on-demand price when no
    /// cap is configured. A quote above the cap falls back to on-demand.
    pub async fn decide(&self, config: &DeploymentConfig) -> PurchaseDecision {
        if !config.use_spot {
            return PurchaseDecision {
                use_spot: false,
                max_price: None,
                quote: None,
            };
        }

        let quote = self
            .get_spot_price(&config.instance_type, &config.region)
            .await;
        let cap = match config.max_spot_price {
            Some(cap) => Some(cap),
            None => self
                .on_demand_price(&config.instance_type, &config.region)
                .await
                .ok(),
        };

        match cap {
            Some(cap) if quote.price > cap => {
                tracing::warn!(
                    stack_id = %config.stack_id,
                    "Spot price {:.4}/h for {} exceeds cap {:.4}/h; using on-demand",
                    quote.price,
                    config.instance_type,
                    cap
                );
                PurchaseDecision {
                    use_spot: false,
                    max_price: None,
                    quote: Some(quote),
                }
            }
            cap => PurchaseDecision {
                use_spot: true,
                max_price: cap,
                quote: Some(quote),
            },
        }
    }

    /// Cost estimate for a deployment, accrued since `running_since`.
    pub async fn estimate_cost(
        &self,
        config: &DeploymentConfig,
        running_since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> CostSnapshot {
        let quote = self
            .get_spot_price(&config.instance_type, &config.region)
            .await;
        let on_demand = self
            .on_demand_price(&config.instance_type, &config.region)
            .await
            .unwrap_or(quote.price);

        let compute_hourly = if config.use_spot {
            quote.price
        } else {
            on_demand
        };
        let storage_hourly = config.volume_size_gb as f64 * self.settings.storage_price_gb_month
            / CostSnapshot::HOURS_PER_MONTH;
        let hourly = compute_hourly + storage_hourly;

        let mut snapshot = CostSnapshot {
            instance_type: config.instance_type.clone(),
            use_spot: config.use_spot,
            spot_price: quote.price,
            on_demand_price: on_demand,
            storage_price_gb_month: self.settings.storage_price_gb_month,
            volume_size_gb: config.volume_size_gb,
            price_source: quote.source,
            hourly,
            monthly: hourly * CostSnapshot::HOURS_PER_MONTH,
            runtime_hours: 0.0,
            accrued: 0.0,
            computed_at: now,
        };
        if let Some(since) = running_since {
            snapshot.refresh_runtime(since, now);
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedSource {
        price: Option<f64>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PricingSource for FixedSource {
        async fn spot_price(&self, _instance_type: &str, _region: &str) -> std::result::Result<f64, PricingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.price
                .ok_or_else(|| PricingError::Unavailable("throttled".to_string()))
        }
    }

    fn advisor(price: Option<f64>) -> (PricingAdvisor, Arc<FixedSource>) {
        let source = Arc::new(FixedSource {
            price,
            calls: AtomicUsize::new(0),
        });
        let advisor = PricingAdvisor::new(Some(source.clone()), PricingSettings::default());
        (advisor, source)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_within_ttl() {
        let (advisor, source) = advisor(Some(0.0125));

        let first = advisor.get_spot_price("t3.medium", "us-east-1").await;
        assert_eq!(first.source, PriceSource::Live);

        tokio::time::advance(Duration::from_secs(14 * 60)).await;
        let second = advisor.get_spot_price("t3.medium", "us-east-1").await;
        assert_eq!(second.source, PriceSource::Cached);
        assert_eq!(second.price, 0.0125);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        let third = advisor.get_spot_price("t3.medium", "us-east-1").await;
        assert_eq!(third.source, PriceSource::Live);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_keyed_by_region() {
        let (advisor, source) = advisor(Some(0.02));
        advisor.get_spot_price("t3.medium", "us-east-1").await;
        advisor.get_spot_price("t3.medium", "eu-west-1").await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fallback_to_discounted_on_demand() {
        let (advisor, _) = advisor(None);
        let quote = advisor.get_spot_price("t3.medium", "us-east-1").await;
        assert_eq!(quote.source, PriceSource::Estimated);
        assert!(quote.is_degraded());
        assert!((quote.price - 0.01248).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fallback_to_default_price() {
        let advisor = PricingAdvisor::new(None, PricingSettings::default());
        let quote = advisor.get_spot_price("x9.huge", "us-east-1").await;
        assert_eq!(quote.source, PriceSource::Default);
        assert_eq!(quote.price, 0.05);
    }

    #[tokio::test]
    async fn test_degraded_quotes_not_cached() {
        let (advisor, source) = advisor(None);
        advisor.get_spot_price("t3.medium", "us-east-1").await;
        advisor.get_spot_price("t3.medium", "us-east-1").await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_decide_caps_bid_at_on_demand() {
        let (advisor, _) = advisor(Some(0.015));
        let config = DeploymentConfig::new("demo", TierKind::Dev, "us-east-1");
        let decision = advisor.decide(&config).await;
        assert!(decision.use_spot);
        assert_eq!(decision.max_price, Some(0.0416));
    }

    #[tokio::test]
    async fn test_decide_falls_back_above_cap() {
        let (advisor, _) = advisor(Some(0.03));
        let config =
            DeploymentConfig::new("demo", TierKind::Dev, "us-east-1").with_max_spot_price(0.02);
        let decision = advisor.decide(&config).await;
        assert!(!decision.use_spot);
        assert_eq!(decision.max_price, None);
    }

    #[tokio::test]
    async fn test_estimate_cost() {
        let (advisor, _) = advisor(Some(0.0125));
        let config = DeploymentConfig::new("demo", TierKind::Dev, "us-east-1").with_volume_size(73);
        let now = Utc::now();
        let snapshot = advisor
            .estimate_cost(&config, Some(now - chrono::Duration::hours(2)), now)
            .await;

        // 73 GiB * 0.08 / 730 h = 0.008 / h
        assert!((snapshot.hourly - 0.0205).abs() < 1e-9);
        assert!((snapshot.monthly - 0.0205 * 730.0).abs() < 1e-6);
        assert!((snapshot.runtime_hours - 2.0).abs() < 1e-9);
        assert!((snapshot.accrued - 0.041).abs() < 1e-9);
        assert_eq!(snapshot.on_demand_price, 0.0416);
    }
}
