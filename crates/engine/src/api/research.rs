//! Research API payloads and its free endpoints (health, discovery document)
//!
//! Payload structs mirror the server's JSON loosely: every field is optional so
//! a missing section degrades to `None` instead of failing the whole call.

use anyhow::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::transport::{HttpRequest, Transport};
use crate::types::Method;

pub const DEFAULT_BASE_URL: &str = "https://x402.911fund.io";
pub const HEALTH_PATH: &str = "/health";
pub const DISCOVERY_PATH: &str = "/.well-known/x402.json";

const FREE_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Deserialization structs
// ---------------------------------------------------------------------------

/// `GET /.well-known/x402.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    #[serde(default)]
    pub resources: Vec<DiscoveredResource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredResource {
    pub path: String,
    #[serde(rename = "priceUSD", default)]
    pub price_usd: Option<Decimal>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendingToken {
    pub symbol: Option<String>,
    pub price: Option<f64>,
    pub volume_change: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendingData {
    #[serde(default)]
    pub coingecko: Vec<TrendingToken>,
    pub narrative_summary: Option<String>,
}

/// `GET /alpha/trending`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendingResponse {
    pub data: TrendingData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentimentData {
    pub sentiment_analysis: Option<String>,
    pub tweets_analyzed: Option<u64>,
    pub total_likes: Option<u64>,
    pub total_retweets: Option<u64>,
}

/// `GET /alpha/sentiment`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentResponse {
    pub query: Option<String>,
    pub data: SentimentData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    pub price: Option<f64>,
    #[serde(rename = "volume24h")]
    pub volume_24h: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    pub coingecko: Option<MarketSnapshot>,
    pub dexscreener: Option<MarketSnapshot>,
    pub grok_analysis: Option<String>,
}

impl TokenData {
    /// CoinGecko first, DexScreener as fallback
    pub fn price(&self) -> Option<f64> {
        self.coingecko
            .as_ref()
            .and_then(|m| m.price)
            .or_else(|| self.dexscreener.as_ref().and_then(|m| m.price))
    }

    pub fn volume_24h(&self) -> Option<f64> {
        self.coingecko
            .as_ref()
            .and_then(|m| m.volume_24h)
            .or_else(|| self.dexscreener.as_ref().and_then(|m| m.volume_24h))
    }
}

/// `GET /alpha/token`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub data: TokenData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExaResults {
    pub results_found: Option<u64>,
    #[serde(default)]
    pub results: Vec<SearchHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchData {
    pub summary: Option<String>,
    pub exa: Option<ExaResults>,
}

/// `GET /alpha/search`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub data: SearchData,
}

/// `GET /alpha/deep`: the research body has no fixed shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepResearchResponse {
    pub query: Option<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Free endpoints
// ---------------------------------------------------------------------------

/// Client for the unpriced parts of the research API
#[derive(Clone)]
pub struct ResearchApi {
    transport: Arc<dyn Transport>,
    base_url: String,
}

impl ResearchApi {
    pub fn new(transport: Arc<dyn Transport>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// GET /health
    pub async fn health(&self) -> Result<serde_json::Value> {
        self.get_json(HEALTH_PATH).await
    }

    /// GET /.well-known/x402.json: advertised resources and nominal prices
    pub async fn discovery(&self) -> Result<DiscoveryDocument> {
        let value = self.get_json(DISCOVERY_PATH).await?;
        let doc: DiscoveryDocument = serde_json::from_value(value)?;
        debug!(count = doc.resources.len(), "Discovery document fetched");
        Ok(doc)
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let request = HttpRequest::new(Method::Get, url, FREE_ENDPOINT_TIMEOUT);
        let resp = self.transport.request(request).await?;
        if !resp.is_success() {
            let body = String::from_utf8_lossy(&resp.body).into_owned();
            anyhow::bail!("Research API error {} on {}: {}", resp.status, path, body);
        }
        Ok(serde_json::from_slice(&resp.body)?)
    }
}
