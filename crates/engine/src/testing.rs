//! Scripted transport and signer used by the unit tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::api::transport::{HttpRequest, HttpResponse, Transport, TransportError, PAYMENT_HEADER};
use crate::payment::{PaymentProofProvider, SigningError};
use crate::types::{PaymentProof, PriceQuote};

pub(crate) fn quote(amount: u64, pay_to: &str) -> PriceQuote {
    PriceQuote {
        scheme: "exact".into(),
        network: "base".into(),
        amount_atomic: amount,
        currency: "USDC".into(),
        asset: "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913".into(),
        pay_to: pay_to.into(),
        resource: "https://api.test/alpha/sentiment".into(),
        expiry: None,
        raw: serde_json::json!({ "payTo": pay_to, "maxAmountRequired": amount.to_string() }),
    }
}

/// A 402 body offering one quote per `(amount, pay_to)` pair
pub(crate) fn payment_required_body(options: &[(u64, &str)]) -> String {
    let accepts: Vec<serde_json::Value> = options
        .iter()
        .map(|(amount, pay_to)| {
            serde_json::json!({
                "scheme": "exact",
                "network": "base",
                "maxAmountRequired": amount.to_string(),
                "resource": "https://api.test/alpha",
                "description": "priced resource",
                "mimeType": "application/json",
                "payTo": pay_to,
                "maxTimeoutSeconds": 60,
                "asset": "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913",
                "extra": { "name": "USD Coin", "version": "2" }
            })
        })
        .collect();
    serde_json::json!({
        "x402Version": 1,
        "error": "X-PAYMENT header is required",
        "accepts": accepts,
    })
    .to_string()
}

type Handler = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub path: String,
    pub payment: Option<String>,
    pub query: Vec<(String, String)>,
}

/// Routes requests by URL path to scripted handlers and records every call
#[derive(Default)]
pub(crate) struct MockTransport {
    routes: Mutex<HashMap<String, Handler>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle<F>(&self, path: &str, handler: F)
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), Box::new(handler));
    }

    /// Same response regardless of payment
    pub fn respond(&self, path: &str, response: HttpResponse) {
        self.handle(path, move |_| Ok(response.clone()));
    }

    /// 402 with one quote until a request carries `X-PAYMENT`, then `payload`
    pub fn priced(&self, path: &str, amount: u64, payload: serde_json::Value) {
        let body = payment_required_body(&[(amount, "0xresearch")]);
        let payload = payload.to_string();
        self.handle(path, move |req| {
            if req.header(PAYMENT_HEADER).is_some() {
                Ok(HttpResponse::new(200, payload.clone()).with_header("X-PAYMENT-RESPONSE", "settled"))
            } else {
                Ok(HttpResponse::new(402, body.clone()))
            }
        });
    }

    /// 402 even when a proof is attached
    pub fn always_payment_required(&self, path: &str, amount: u64) {
        let body = payment_required_body(&[(amount, "0xresearch")]);
        self.handle(path, move |_| Ok(HttpResponse::new(402, body.clone())));
    }

    pub fn fail(&self, path: &str, error: TransportError) {
        self.handle(path, move |_| Err(error.clone()));
    }

    pub fn delay(&self, path: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(path.to_string(), delay);
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.path == path)
            .count()
    }

    pub fn paid_calls_to(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.path == path && c.payment.is_some())
            .count()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

fn path_of(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    match rest.find('/') {
        Some(i) => rest[i..].split('?').next().unwrap_or("/").to_string(),
        None => "/".to_string(),
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let path = path_of(&request.url);
        self.calls.lock().unwrap().push(RecordedCall {
            path: path.clone(),
            payment: request.header(PAYMENT_HEADER).map(str::to_string),
            query: request.query.clone(),
        });

        let delay = self.delays.lock().unwrap().get(&path).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let routes = self.routes.lock().unwrap();
        match routes.get(&path) {
            Some(handler) => handler(&request),
            None => Ok(HttpResponse::new(404, "not found")),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum SignerMode {
    Valid,
    Fail(SigningError),
    /// Returns a proof bound to some other quote
    WrongQuote,
}

pub(crate) struct MockSigner {
    mode: SignerMode,
    calls: AtomicUsize,
}

impl MockSigner {
    pub fn new(mode: SignerMode) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn valid() -> Self {
        Self::new(SignerMode::Valid)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentProofProvider for MockSigner {
    async fn sign(&self, quote: &PriceQuote) -> Result<PaymentProof, SigningError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.mode {
            SignerMode::Valid => Ok(PaymentProof::for_quote(quote, format!("proof-{}", n))),
            SignerMode::Fail(err) => Err(err.clone()),
            SignerMode::WrongQuote => {
                let mut other = quote.clone();
                other.pay_to = "0xattacker".into();
                Ok(PaymentProof::for_quote(&other, format!("proof-{}", n)))
            }
        }
    }
}
