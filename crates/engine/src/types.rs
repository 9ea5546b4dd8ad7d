//! Types shared by the paid client, the budget guard and the research pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Query parameters, in the order they are sent
pub type Params = Vec<(String, String)>;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// A resource exposed by the research API. Defined by the API surface, not the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub path: String,
    pub method: Method,
    /// Transport timeout for a single request to this endpoint
    pub timeout_ms: u64,
    /// Advertised price in atomic units (display and estimation only)
    pub nominal_price_atomic: Option<u64>,
}

impl Endpoint {
    pub fn get(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            method: Method::Get,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            nominal_price_atomic: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1);
        self
    }

    pub fn with_nominal_price(mut self, amount_atomic: u64) -> Self {
        self.nominal_price_atomic = Some(amount_atomic);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Quotes and proofs
// ---------------------------------------------------------------------------

/// Price and payment target stated by the server for one call.
///
/// Quotes come from a 402 response and are consumed by exactly one paid call;
/// they are never cached because price and target can change per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub scheme: String,
    pub network: String,
    pub amount_atomic: u64,
    pub currency: String,
    pub asset: String,
    pub pay_to: String,
    pub resource: String,
    pub expiry: Option<DateTime<Utc>>,
    /// Requirement object exactly as offered, handed to the signer untouched
    pub raw: serde_json::Value,
}

impl PriceQuote {
    /// SHA-256 over the fields that identify what is being paid, to whom, where.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for part in [
            self.scheme.as_str(),
            self.network.as_str(),
            self.asset.as_str(),
            self.pay_to.as_str(),
            self.resource.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.amount_atomic.to_be_bytes());
        if let Some(expiry) = self.expiry {
            hasher.update(expiry.timestamp().to_be_bytes());
        }
        hasher.finalize().into()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.map(|e| now >= e).unwrap_or(false)
    }
}

/// Signed payment token bound to exactly one [`PriceQuote`].
///
/// Single use: not `Clone` or `Serialize`, and `Debug` only shows a prefix.
pub struct PaymentProof {
    token: String,
    quote_digest: [u8; 32],
}

impl PaymentProof {
    pub fn for_quote(quote: &PriceQuote, token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            quote_digest: quote.digest(),
        }
    }

    pub fn is_bound_to(&self, quote: &PriceQuote) -> bool {
        self.quote_digest == quote.digest()
    }

    /// Value for the `X-PAYMENT` request header; spends the proof
    pub fn into_header_value(self) -> String {
        self.token
    }
}

impl fmt::Debug for PaymentProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.token.chars().take(6).collect();
        f.debug_struct("PaymentProof")
            .field("token", &format_args!("{}…", prefix))
            .field("quote", &hex::encode(&self.quote_digest[..4]))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Call outcomes
// ---------------------------------------------------------------------------

/// Response body of a successful call
#[derive(Debug, Clone)]
pub struct Payload {
    pub status: u16,
    pub body: Vec<u8>,
    /// `X-PAYMENT-RESPONSE` settlement receipt, when the server sends one
    pub settlement: Option<String>,
}

impl Payload {
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Local refusal: the call never reached the signer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("budget exceeded: requested {requested} atomic, {remaining} remaining")]
    BudgetExceeded { requested: u64, remaining: u64 },
    #[error("invalid payment requirements: {0}")]
    Validation(String),
}

/// Failure after the request left the client; the caller may start a fresh call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("server rejected the payment proof")]
    ProofRejected,
    #[error("payment signing failed: {0}")]
    Signing(String),
    #[error("call cancelled before completion")]
    Cancelled,
}

impl FailureReason {
    /// Whether a scheduler may simply try again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout | Self::ProofRejected)
    }
}

/// Result of one logical call against a priced endpoint
#[derive(Debug, Clone)]
pub enum CallOutcome {
    /// Payment required and no signer configured; offered quotes attached
    Unauthenticated { quotes: Vec<PriceQuote> },
    /// Payload received; `amount_atomic` is what was actually spent (0 for free resources)
    Paid {
        payload: Payload,
        amount_atomic: u64,
        quote: Option<PriceQuote>,
    },
    Rejected(RejectReason),
    TransportFailed(FailureReason),
    ServerError { status: u16, body: String },
}

impl CallOutcome {
    pub fn amount_spent(&self) -> u64 {
        match self {
            Self::Paid { amount_atomic, .. } => *amount_atomic,
            _ => 0,
        }
    }

    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Paid { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated { .. } => "unauthenticated",
            Self::Paid { .. } => "paid",
            Self::Rejected(_) => "rejected",
            Self::TransportFailed(_) => "transport_failed",
            Self::ServerError { .. } => "server_error",
        }
    }
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated { quotes } => {
                write!(f, "payment required ({} option(s)), no signer configured", quotes.len())
            }
            Self::Paid { amount_atomic, .. } => write!(f, "paid {} atomic", amount_atomic),
            Self::Rejected(reason) => write!(f, "rejected: {}", reason),
            Self::TransportFailed(reason) => write!(f, "failed: {}", reason),
            Self::ServerError { status, .. } => write!(f, "server error {}", status),
        }
    }
}

// ---------------------------------------------------------------------------
// Budget snapshot
// ---------------------------------------------------------------------------

/// Snapshot of a [`crate::budget::BudgetGuard`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetState {
    pub spent_atomic: u64,
    /// Held by calls that were admitted but have not completed yet
    pub reserved_atomic: u64,
    pub ceiling_atomic: u64,
    pub window_start: DateTime<Utc>,
    /// `None` for a guard that never rolls over (per-cycle budgets)
    pub window_duration_secs: Option<u64>,
}

impl BudgetState {
    pub fn remaining(&self) -> u64 {
        self.ceiling_atomic
            .saturating_sub(self.spent_atomic)
            .saturating_sub(self.reserved_atomic)
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Classification {
    Bullish,
    Bearish,
    Neutral,
    Hold,
    Buy,
    Sell,
}

impl Classification {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Bullish => "BULLISH",
            Self::Bearish => "BEARISH",
            Self::Neutral => "NEUTRAL",
            Self::Hold => "HOLD",
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// Bullish or bearish: strong enough to justify further spend
    pub fn has_conviction(&self) -> bool {
        matches!(self, Self::Bullish | Self::Bearish)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Final, immutable output for one subject
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub subject: String,
    pub classification: Classification,
    /// Always within [0, 1]
    pub confidence: f64,
    pub rationale: String,
}

impl Signal {
    pub fn new(
        subject: impl Into<String>,
        classification: Classification,
        confidence: f64,
        rationale: impl Into<String>,
    ) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            subject: subject.into(),
            classification,
            confidence,
            rationale: rationale.into(),
        }
    }
}
