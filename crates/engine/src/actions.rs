//! Free-text requests routed to a single research endpoint
//!
//! "what's trending?" → trending, "deep dive on Farcaster" → deep research,
//! anything else about a ticker → token analysis.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use crate::catalog::{DEEP, SEARCH, SENTIMENT, TOKEN, TRENDING};
use crate::types::Params;

const DEFAULT_SYMBOL: &str = "BTC";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    TokenAnalysis { symbol: String },
    Trending,
    Sentiment { query: String },
    Search { query: String },
    DeepResearch { query: String },
}

impl Action {
    /// Catalog name of the endpoint serving this action
    pub fn endpoint_name(&self) -> &'static str {
        match self {
            Self::TokenAnalysis { .. } => TOKEN,
            Self::Trending => TRENDING,
            Self::Sentiment { .. } => SENTIMENT,
            Self::Search { .. } => SEARCH,
            Self::DeepResearch { .. } => DEEP,
        }
    }

    pub fn params(&self) -> Params {
        let pair = |k: &str, v: &str| (k.to_string(), v.to_string());
        match self {
            Self::TokenAnalysis { symbol } => vec![pair("symbol", symbol.as_str()), pair("twitter", "true")],
            Self::Trending => vec![pair("twitter", "true")],
            Self::Sentiment { query } | Self::Search { query } | Self::DeepResearch { query } => {
                vec![pair("query", query.as_str())]
            }
        }
    }
}

fn dollar_ticker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$([A-Za-z]+)").expect("static regex"))
}

fn known_ticker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(SOL|ETH|BTC|WIF|PEPE|VIRTUAL|DOGE)\b").expect("static regex")
    })
}

fn research_verb() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(research|search|analyze|look up|find)\s+").expect("static regex"))
}

/// `$TICKER` first, then a well-known ticker, else BTC
pub fn extract_symbol(text: &str) -> String {
    dollar_ticker()
        .captures(text)
        .or_else(|| known_ticker().captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_uppercase())
        .unwrap_or_else(|| DEFAULT_SYMBOL.to_string())
}

/// Text with a leading research verb removed
pub fn extract_query(text: &str) -> String {
    research_verb().replace(text.trim(), "").trim().to_string()
}

pub fn route(text: &str) -> Action {
    let lower = text.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(*w));

    if has(&["deep dive", "deep research", "full research"]) {
        Action::DeepResearch {
            query: extract_query(text),
        }
    } else if has(&["trending", "top movers", "movers"]) {
        Action::Trending
    } else if has(&["sentiment", "twitter", "saying about", "tweets"]) {
        Action::Sentiment {
            query: extract_query(text),
        }
    } else if research_verb().is_match(text.trim()) && !lower.trim_start().starts_with("analyze") {
        Action::Search {
            query: extract_query(text),
        }
    } else {
        Action::TokenAnalysis {
            symbol: extract_symbol(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_symbol() {
        assert_eq!(extract_symbol("what's the signal on $wif?"), "WIF");
        assert_eq!(extract_symbol("analyze sol for me"), "SOL");
        assert_eq!(extract_symbol("solana ecosystem"), "BTC");
        assert_eq!(extract_symbol("$PEPE vs ETH"), "PEPE");
    }

    #[test]
    fn test_extract_query() {
        assert_eq!(extract_query("research Jupiter DEX"), "Jupiter DEX");
        assert_eq!(extract_query("Look up   Eigenlayer restaking "), "Eigenlayer restaking");
        assert_eq!(extract_query("deep dive on Farcaster"), "deep dive on Farcaster");
    }

    #[test]
    fn test_route() {
        assert_eq!(
            route("analyze SOL for me"),
            Action::TokenAnalysis { symbol: "SOL".into() }
        );
        assert_eq!(route("what's trending in crypto?"), Action::Trending);
        assert_eq!(route("top movers today"), Action::Trending);
        assert!(matches!(route("what's Twitter saying about Solana?"), Action::Sentiment { .. }));
        assert_eq!(
            route("search for Eigenlayer restaking"),
            Action::Search { query: "for Eigenlayer restaking".into() }
        );
        assert_eq!(
            route("full research on Base L2 growth"),
            Action::DeepResearch { query: "full research on Base L2 growth".into() }
        );
    }

    #[test]
    fn test_action_params() {
        let action = route("check ETH price and analysis");
        assert_eq!(action.endpoint_name(), TOKEN);
        assert_eq!(
            action.params(),
            vec![
                ("symbol".to_string(), "ETH".to_string()),
                ("twitter".to_string(), "true".to_string())
            ]
        );
        assert_eq!(
            Action::Search { query: "x".into() }.params(),
            vec![("query".to_string(), "x".to_string())]
        );
    }
}
