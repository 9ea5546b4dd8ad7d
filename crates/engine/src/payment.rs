//! Payment requirements, quote selection and the proof-provider boundary
//!
//! A priced endpoint answers an unpaid request with `402 Payment Required` and
//! a body listing the payment options it accepts:
//!
//! ```json
//! { "x402Version": 1, "error": "X-PAYMENT header is required",
//!   "accepts": [ { "scheme": "exact", "network": "base",
//!                  "maxAmountRequired": "80000", "payTo": "0x…",
//!                  "asset": "0x…", "resource": "https://…/alpha/sentiment",
//!                  "maxTimeoutSeconds": 60, "extra": { "name": "USD Coin" } } ] }
//! ```
//!
//! Signing is never done here. A [`PaymentProofProvider`] turns one quote into
//! one proof; [`CommandSigner`] delegates to an external signer process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::types::{PaymentProof, PriceQuote};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuoteError {
    #[error("payment requirements are not valid JSON: {0}")]
    Malformed(String),

    #[error("server offered no payment options")]
    Empty,

    #[error("invalid amount {0:?}")]
    InvalidAmount(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("signing rejected: {0}")]
    Rejected(String),

    #[error("signer unavailable: {0}")]
    Unavailable(String),

    #[error("signer timed out after {0:?}")]
    Timeout(Duration),
}

// ---------------------------------------------------------------------------
// 402 body
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequiredBody {
    #[serde(default)]
    accepts: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequirement {
    #[serde(default = "default_scheme")]
    scheme: String,
    network: String,
    max_amount_required: AmountField,
    pay_to: String,
    #[serde(default)]
    asset: String,
    #[serde(default)]
    resource: String,
    max_timeout_seconds: Option<u64>,
    extra: Option<serde_json::Value>,
}

/// Servers send the amount as a decimal string; tolerate a bare integer too
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AmountField {
    Text(String),
    Number(u64),
}

fn default_scheme() -> String {
    "exact".to_string()
}

/// Parse a 402 response body into the quotes it offers, in server order.
pub fn parse_payment_required(body: &[u8], now: DateTime<Utc>) -> Result<Vec<PriceQuote>, QuoteError> {
    let parsed: PaymentRequiredBody =
        serde_json::from_slice(body).map_err(|e| QuoteError::Malformed(e.to_string()))?;

    if parsed.accepts.is_empty() {
        return Err(QuoteError::Empty);
    }

    parsed
        .accepts
        .into_iter()
        .map(|raw| {
            let req: PaymentRequirement = serde_json::from_value(raw.clone())
                .map_err(|e| QuoteError::Malformed(e.to_string()))?;
            let amount_atomic = match &req.max_amount_required {
                AmountField::Number(n) => *n,
                AmountField::Text(s) => s
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| QuoteError::InvalidAmount(s.clone()))?,
            };
            let currency = req
                .extra
                .as_ref()
                .and_then(|e| e.get("name"))
                .and_then(|n| n.as_str())
                .map(currency_symbol)
                .unwrap_or_else(|| req.asset.clone());
            // Unrepresentable timeouts are treated as no expiry
            let expiry = req
                .max_timeout_seconds
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(chrono::Duration::try_seconds)
                .and_then(|d| now.checked_add_signed(d));

            Ok(PriceQuote {
                scheme: req.scheme,
                network: req.network,
                amount_atomic,
                currency,
                asset: req.asset,
                pay_to: req.pay_to,
                resource: req.resource,
                expiry,
                raw,
            })
        })
        .collect()
}

fn currency_symbol(name: &str) -> String {
    match name {
        "USD Coin" | "USDC" => "USDC".to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Quote selection
// ---------------------------------------------------------------------------

/// Picks which of the offered quotes to pay
pub trait QuoteSelector: Send + Sync {
    fn select<'a>(&self, quotes: &'a [PriceQuote]) -> Option<&'a PriceQuote>;
}

/// Default: the first option the server lists
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstListed;

impl QuoteSelector for FirstListed {
    fn select<'a>(&self, quotes: &'a [PriceQuote]) -> Option<&'a PriceQuote> {
        quotes.first()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Cheapest;

impl QuoteSelector for Cheapest {
    fn select<'a>(&self, quotes: &'a [PriceQuote]) -> Option<&'a PriceQuote> {
        quotes.iter().min_by_key(|q| q.amount_atomic)
    }
}

/// Restricts another selector to quotes on the given networks
#[derive(Debug, Clone)]
pub struct NetworkAllowlist<S> {
    pub networks: Vec<String>,
    pub inner: S,
}

impl<S: QuoteSelector> QuoteSelector for NetworkAllowlist<S> {
    fn select<'a>(&self, quotes: &'a [PriceQuote]) -> Option<&'a PriceQuote> {
        let allowed: Vec<PriceQuote> = quotes
            .iter()
            .filter(|q| self.networks.iter().any(|n| n.eq_ignore_ascii_case(&q.network)))
            .cloned()
            .collect();
        let chosen = self.inner.select(&allowed)?;
        quotes.iter().find(|q| *q == chosen)
    }
}

// ---------------------------------------------------------------------------
// Proof provider
// ---------------------------------------------------------------------------

/// Produces a signed proof for exactly one quote
#[async_trait]
pub trait PaymentProofProvider: Send + Sync {
    async fn sign(&self, quote: &PriceQuote) -> Result<PaymentProof, SigningError>;
}

/// Runs an external signer: the quote's requirement JSON goes to stdin, the
/// encoded `X-PAYMENT` value is read from stdout.
#[derive(Debug, Clone)]
pub struct CommandSigner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSigner {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn run(&self, input: Vec<u8>) -> Result<std::process::Output, SigningError> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SigningError::Unavailable(format!("{}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|e| SigningError::Unavailable(e.to_string()))?;
        }

        child
            .wait_with_output()
            .await
            .map_err(|e| SigningError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl PaymentProofProvider for CommandSigner {
    async fn sign(&self, quote: &PriceQuote) -> Result<PaymentProof, SigningError> {
        let input = serde_json::to_vec(&quote.raw)
            .map_err(|e| SigningError::Rejected(format!("unserializable quote: {}", e)))?;

        debug!(program = %self.program, network = %quote.network, amount = quote.amount_atomic, "Invoking signer");

        let output = tokio::time::timeout(self.timeout, self.run(input))
            .await
            .map_err(|_| SigningError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(status = ?output.status.code(), "Signer refused quote");
            return Err(if stderr.to_lowercase().contains("insufficient") {
                SigningError::InsufficientFunds(stderr)
            } else {
                SigningError::Rejected(stderr)
            });
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(SigningError::Rejected("signer produced an empty proof".into()));
        }
        Ok(PaymentProof::for_quote(quote, token))
    }
}
