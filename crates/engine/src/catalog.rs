//! Research API endpoint catalog and cost estimation
//!
//! Nominal prices are for display and planning only. What a call actually
//! costs is whatever the server quotes in its 402 response.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::api::research::DiscoveryDocument;
use crate::types::Endpoint;

pub const TOKEN: &str = "token";
pub const TRENDING: &str = "trending";
pub const SENTIMENT: &str = "sentiment";
pub const SEARCH: &str = "search";
pub const DEEP: &str = "deep";

/// USDC has 6 decimals
const ATOMIC_SCALE: u32 = 6;
const SECS_PER_DAY: f64 = 86_400.0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unknown endpoint {0:?}")]
    Unknown(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Catalog {
    endpoints: Vec<Endpoint>,
}

impl Catalog {
    /// The research API's priced endpoints with advertised prices
    pub fn standard() -> Self {
        let entry = |name: &str, price: u64, timeout_secs: u64| {
            Endpoint::get(name, format!("/alpha/{}", name))
                .with_nominal_price(price)
                .with_timeout(Duration::from_secs(timeout_secs))
        };
        Self {
            endpoints: vec![
                entry(TOKEN, 20_000, 30),
                entry(TRENDING, 20_000, 30),
                entry(SENTIMENT, 80_000, 45),
                entry(SEARCH, 30_000, 45),
                entry(DEEP, 150_000, 120),
            ],
        }
    }

    pub fn get(&self, name: &str) -> Result<&Endpoint, CatalogError> {
        self.endpoints
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name) || e.path == name)
            .ok_or_else(|| CatalogError::Unknown(name.to_string()))
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Override nominal prices with those advertised in the discovery
    /// document. Returns how many endpoints were updated.
    pub fn apply_discovery(&mut self, doc: &DiscoveryDocument) -> usize {
        let mut updated = 0;
        for resource in &doc.resources {
            let Some(price) = resource.price_usd.and_then(usd_to_atomic) else {
                continue;
            };
            if let Some(endpoint) = self.endpoints.iter_mut().find(|e| e.path == resource.path) {
                if endpoint.nominal_price_atomic != Some(price) {
                    debug!(path = %endpoint.path, price, "Nominal price updated from discovery");
                    endpoint.nominal_price_atomic = Some(price);
                    updated += 1;
                }
            }
        }
        updated
    }

    fn price(&self, name: &str) -> Result<u64, CatalogError> {
        Ok(self.get(name)?.nominal_price_atomic.unwrap_or(0))
    }

    /// Sentiment check for every symbol on every cycle
    pub fn estimate_monitor(&self, symbols: usize, interval: Duration) -> Result<MonitorEstimate, CatalogError> {
        let per_cycle_atomic = self.price(SENTIMENT)?.saturating_mul(symbols as u64);
        let cycles_per_day = SECS_PER_DAY / interval.as_secs_f64().max(1.0);
        Ok(MonitorEstimate {
            per_cycle_atomic,
            cycles_per_day,
            daily_atomic: (per_cycle_atomic as f64 * cycles_per_day).round() as u64,
        })
    }

    /// Scan plus sentiment for `top_k` subjects; deep research only for
    /// subjects with conviction, so the worst case assumes all of them.
    pub fn estimate_decision_cycle(&self, top_k: usize) -> Result<DecisionEstimate, CatalogError> {
        let k = top_k as u64;
        let best_case_atomic = self
            .price(TRENDING)?
            .saturating_add(self.price(SENTIMENT)?.saturating_mul(k));
        let worst_case_atomic = best_case_atomic.saturating_add(self.price(DEEP)?.saturating_mul(k));
        Ok(DecisionEstimate {
            top_k,
            best_case_atomic,
            worst_case_atomic,
        })
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorEstimate {
    pub per_cycle_atomic: u64,
    pub cycles_per_day: f64,
    pub daily_atomic: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionEstimate {
    pub top_k: usize,
    pub best_case_atomic: u64,
    pub worst_case_atomic: u64,
}

pub fn atomic_to_usd(amount_atomic: u64) -> Decimal {
    Decimal::from_i128_with_scale(amount_atomic as i128, ATOMIC_SCALE)
}

/// `None` for negative or unrepresentable amounts
pub fn usd_to_atomic(usd: Decimal) -> Option<u64> {
    usd.checked_mul(Decimal::from(10u64.pow(ATOMIC_SCALE)))?
        .round()
        .to_u64()
}
