//! Paid HTTP client: one logical request against a priced endpoint
//!
//! Flow per call:
//! 1. unpaid request; 2xx is a free resource and returns `Paid` with amount 0
//! 2. 402 → parse quotes, select one, reserve it against every budget in scope
//! 3. sign the selected quote, check the proof is bound to it
//! 4. one authorized retry carrying `X-PAYMENT`
//! 5. 2xx commits the reservations; anything else drops them
//!
//! The client never retries past step 4 and never returns an error: every
//! path ends in a [`CallOutcome`] variant.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::transport::{
    HttpRequest, HttpResponse, Transport, TransportError, PAYMENT_HEADER, PAYMENT_RESPONSE_HEADER,
};
use crate::budget::{BudgetGuard, Clock, SystemClock};
use crate::payment::{parse_payment_required, FirstListed, PaymentProofProvider, QuoteSelector};
use crate::types::{CallOutcome, Endpoint, FailureReason, Payload, PriceQuote, RejectReason};

/// Per-call extras layered on top of the client's global budget
#[derive(Clone, Copy, Default)]
pub struct CallOptions<'a> {
    /// Additional guard the amount must also fit (per-cycle budget)
    pub cycle_budget: Option<&'a BudgetGuard>,
    /// Abandons the call before it commits spend
    pub cancel: Option<&'a CancellationToken>,
}

#[derive(Clone)]
pub struct PaidHttpClient {
    transport: Arc<dyn Transport>,
    base_url: String,
    budget: Arc<BudgetGuard>,
    signer: Option<Arc<dyn PaymentProofProvider>>,
    selector: Arc<dyn QuoteSelector>,
    clock: Arc<dyn Clock>,
}

impl PaidHttpClient {
    /// Client without a signer: priced endpoints come back `Unauthenticated`
    pub fn new(transport: Arc<dyn Transport>, base_url: impl Into<String>, budget: Arc<BudgetGuard>) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            budget,
            signer: None,
            selector: Arc::new(FirstListed),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn PaymentProofProvider>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn QuoteSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn budget(&self) -> &Arc<BudgetGuard> {
        &self.budget
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_signer(&self) -> bool {
        self.signer.is_some()
    }

    pub async fn call(&self, endpoint: &Endpoint, params: &[(String, String)]) -> CallOutcome {
        self.call_with(endpoint, params, CallOptions::default()).await
    }

    /// Unpaid request only: reports the quotes a priced endpoint offers
    /// without admitting, signing or spending anything.
    pub async fn probe(&self, endpoint: &Endpoint, params: &[(String, String)]) -> CallOutcome {
        let resp = match self.send(self.request(endpoint, params), None).await {
            Ok(resp) => resp,
            Err(reason) => return CallOutcome::TransportFailed(reason),
        };
        match self.classify_unpaid(endpoint, resp) {
            Unpaid::Done(outcome) => outcome,
            Unpaid::Quotes(quotes) => CallOutcome::Unauthenticated { quotes },
        }
    }

    pub async fn call_with(
        &self,
        endpoint: &Endpoint,
        params: &[(String, String)],
        opts: CallOptions<'_>,
    ) -> CallOutcome {
        let resp = match self.send(self.request(endpoint, params), opts.cancel).await {
            Ok(resp) => resp,
            Err(reason) => return CallOutcome::TransportFailed(reason),
        };
        let quotes = match self.classify_unpaid(endpoint, resp) {
            Unpaid::Done(outcome) => return outcome,
            Unpaid::Quotes(quotes) => quotes,
        };

        let signer = match &self.signer {
            Some(signer) => signer,
            None => {
                debug!(endpoint = %endpoint.name, "Payment required but no signer configured");
                return CallOutcome::Unauthenticated { quotes };
            }
        };

        let quote = match self.selector.select(&quotes) {
            Some(quote) => quote.clone(),
            None => {
                return CallOutcome::Rejected(RejectReason::Validation(
                    "no acceptable payment option offered".into(),
                ))
            }
        };
        if quote.is_expired(self.clock.now()) {
            return CallOutcome::Rejected(RejectReason::Validation(format!(
                "quote for {} expired before payment",
                endpoint.path
            )));
        }

        // Held until the authorized retry succeeds; dropped on every other path
        let amount = quote.amount_atomic;
        let Some(global) = self.budget.reserve(amount) else {
            warn!(endpoint = %endpoint.name, amount, remaining = self.budget.remaining(), "Call exceeds budget");
            return CallOutcome::Rejected(RejectReason::BudgetExceeded {
                requested: amount,
                remaining: self.budget.remaining(),
            });
        };
        let cycle = match opts.cycle_budget {
            Some(guard) => match guard.reserve(amount) {
                Some(r) => Some(r),
                None => {
                    warn!(endpoint = %endpoint.name, amount, remaining = guard.remaining(), "Call exceeds cycle budget");
                    return CallOutcome::Rejected(RejectReason::BudgetExceeded {
                        requested: amount,
                        remaining: guard.remaining(),
                    });
                }
            },
            None => None,
        };

        let signed = match opts.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return CallOutcome::TransportFailed(FailureReason::Cancelled),
                signed = signer.sign(&quote) => signed,
            },
            None => signer.sign(&quote).await,
        };
        let proof = match signed {
            Ok(proof) => proof,
            Err(e) => {
                warn!(endpoint = %endpoint.name, error = %e, "Signing failed");
                return CallOutcome::TransportFailed(FailureReason::Signing(e.to_string()));
            }
        };
        if !proof.is_bound_to(&quote) {
            warn!(endpoint = %endpoint.name, "Signer returned a proof for a different quote");
            return CallOutcome::TransportFailed(FailureReason::Signing(
                "proof is bound to a different quote".into(),
            ));
        }

        let header = proof.into_header_value();
        let paid_request = self.request(endpoint, params).with_header(PAYMENT_HEADER, &header);

        let resp = match self.send(paid_request, opts.cancel).await {
            Ok(resp) => resp,
            Err(reason) => {
                warn!(endpoint = %endpoint.name, %reason, "Authorized retry failed");
                return CallOutcome::TransportFailed(reason);
            }
        };

        if resp.is_payment_required() {
            warn!(endpoint = %endpoint.name, amount, "Server rejected payment proof");
            return CallOutcome::TransportFailed(FailureReason::ProofRejected);
        }
        if !resp.is_success() {
            return server_error(resp);
        }

        global.commit();
        if let Some(cycle) = cycle {
            cycle.commit();
        }
        info!(
            endpoint = %endpoint.name,
            amount,
            network = %quote.network,
            spent = self.budget.current_state().spent_atomic,
            "Paid call completed"
        );

        CallOutcome::Paid {
            payload: payload(resp),
            amount_atomic: amount,
            quote: Some(quote),
        }
    }

    fn request(&self, endpoint: &Endpoint, params: &[(String, String)]) -> HttpRequest {
        let url = format!("{}{}", self.base_url, endpoint.path);
        HttpRequest::new(endpoint.method, url, endpoint.timeout()).with_query(params)
    }

    /// Transport call bounded by the request timeout and raced against `cancel`
    async fn send(
        &self,
        request: HttpRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<HttpResponse, FailureReason> {
        let timeout = request.timeout;
        let bounded = tokio::time::timeout(timeout, self.transport.request(request));
        let result = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(FailureReason::Cancelled),
                r = bounded => r,
            },
            None => bounded.await,
        };
        match result {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(failure_from_transport(e)),
            Err(_) => Err(FailureReason::Timeout),
        }
    }

    fn classify_unpaid(&self, endpoint: &Endpoint, resp: HttpResponse) -> Unpaid {
        if resp.is_success() {
            debug!(endpoint = %endpoint.name, "Free resource");
            return Unpaid::Done(CallOutcome::Paid {
                payload: payload(resp),
                amount_atomic: 0,
                quote: None,
            });
        }
        if !resp.is_payment_required() {
            return Unpaid::Done(server_error(resp));
        }
        match parse_payment_required(&resp.body, self.clock.now()) {
            Ok(quotes) => {
                debug!(endpoint = %endpoint.name, offered = quotes.len(), "Payment required");
                Unpaid::Quotes(quotes)
            }
            Err(e) => Unpaid::Done(CallOutcome::Rejected(RejectReason::Validation(e.to_string()))),
        }
    }
}

enum Unpaid {
    Done(CallOutcome),
    Quotes(Vec<PriceQuote>),
}

fn failure_from_transport(err: TransportError) -> FailureReason {
    match err {
        TransportError::Timeout(_) => FailureReason::Timeout,
        other => FailureReason::Transport(other.to_string()),
    }
}

fn payload(resp: HttpResponse) -> Payload {
    let settlement = resp.header(PAYMENT_RESPONSE_HEADER).map(str::to_string);
    Payload {
        status: resp.status,
        body: resp.body,
        settlement,
    }
}

fn server_error(resp: HttpResponse) -> CallOutcome {
    CallOutcome::ServerError {
        status: resp.status,
        body: String::from_utf8_lossy(&resp.body).into_owned(),
    }
}
