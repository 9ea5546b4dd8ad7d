//! Multi-endpoint token intelligence
//!
//! Token data, web research and sentiment for one symbol, fetched
//! concurrently. Each section fails on its own; the others still report.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::research::{SearchResponse, SentimentResponse, TokenResponse};
use crate::catalog::{Catalog, CatalogError, SEARCH, SENTIMENT, TOKEN};
use crate::client::PaidHttpClient;
use crate::types::CallOutcome;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Section<T> {
    Ready(T),
    Failed(String),
}

impl<T> Section<T> {
    pub fn ready(&self) -> Option<&T> {
        match self {
            Self::Ready(v) => Some(v),
            Self::Failed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenSummary {
    pub price: Option<f64>,
    pub volume_24h: Option<f64>,
    pub analysis: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResearchSummary {
    pub sources: Option<u64>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SentimentSummary {
    pub tweets_analyzed: Option<u64>,
    pub analysis: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenIntelligence {
    pub symbol: String,
    pub token: Section<TokenSummary>,
    pub research: Section<ResearchSummary>,
    pub sentiment: Section<SentimentSummary>,
    pub spent_atomic: u64,
}

pub async fn gather_intelligence(
    client: &PaidHttpClient,
    catalog: &Catalog,
    symbol: &str,
) -> Result<TokenIntelligence, CatalogError> {
    let symbol = symbol.trim().trim_start_matches('$').to_uppercase();
    let token_ep = catalog.get(TOKEN)?;
    let search_ep = catalog.get(SEARCH)?;
    let sentiment_ep = catalog.get(SENTIMENT)?;

    let token_params = vec![("symbol".to_string(), symbol.clone())];
    let search_params = vec![("query".to_string(), format!("{} crypto analysis", symbol))];
    let sentiment_params = vec![("query".to_string(), format!("${}", symbol))];

    let (token, search, sentiment) = tokio::join!(
        client.call(token_ep, &token_params),
        client.call(search_ep, &search_params),
        client.call(sentiment_ep, &sentiment_params),
    );

    let spent_atomic = token.amount_spent() + search.amount_spent() + sentiment.amount_spent();
    tracing::info!(symbol = %symbol, spent = spent_atomic, "Intelligence gathered");

    Ok(TokenIntelligence {
        token: section(&token, |r: TokenResponse| TokenSummary {
            price: r.data.price(),
            volume_24h: r.data.volume_24h(),
            analysis: r.data.grok_analysis,
        }),
        research: section(&search, |r: SearchResponse| ResearchSummary {
            sources: r.data.exa.and_then(|e| e.results_found),
            summary: r.data.summary,
        }),
        sentiment: section(&sentiment, |r: SentimentResponse| SentimentSummary {
            tweets_analyzed: r.data.tweets_analyzed,
            analysis: r.data.sentiment_analysis,
        }),
        symbol,
        spent_atomic,
    })
}

fn section<R, T>(outcome: &CallOutcome, summarize: impl FnOnce(R) -> T) -> Section<T>
where
    R: DeserializeOwned,
{
    match outcome {
        CallOutcome::Paid { payload, .. } => match payload.parse::<R>() {
            Ok(parsed) => Section::Ready(summarize(parsed)),
            Err(e) => Section::Failed(format!("unexpected payload: {}", e)),
        },
        other => Section::Failed(other.to_string()),
    }
}
