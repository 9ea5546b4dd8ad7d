//! Research pipeline: priced endpoints chained into a signal per subject
//!
//! A cycle optionally starts with a scan stage that picks up to `top_k`
//! subjects. Each subject then walks an ordered list of [`StageSpec`]s as a
//! small state machine:
//!
//! ```text
//! Init → StageDone(0) → StageDone(1) → … → Complete(Signal)
//!   ╰──────────────┴──────────────┴────→ Aborted(PipelineAborted)
//! ```
//!
//! A stage gated on conviction only runs when the latest classification was
//! bullish or bearish; otherwise the subject short-circuits to a Hold/Neutral
//! signal without further spend. A failed call aborts that subject only.

use futures_util::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::budget::BudgetGuard;
use crate::catalog::{Catalog, CatalogError, DEEP, SENTIMENT, TRENDING};
use crate::client::{CallOptions, PaidHttpClient};
use crate::evaluator::{Assessment, Classifier, KeywordClassifier, Thresholds};
use crate::types::{CallOutcome, Classification, Endpoint, FailureReason, Params, RejectReason, Signal};

/// Subject name used when the scan stage itself fails
pub const SCAN_SUBJECT: &str = "*";
const SYMBOL_PLACEHOLDER: &str = "{symbol}";
const EXCERPT_CHARS: usize = 120;

const BUY_CONFIDENCE: f64 = 0.7;
const SELL_CONFIDENCE: f64 = 0.6;
const HOLD_CONFIDENCE: f64 = 0.5;
const AGREEMENT_BONUS: f64 = 0.1;
const CONTRADICTION_PENALTY: f64 = 0.2;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Stage that selects the subjects of a cycle
#[derive(Debug, Clone)]
pub struct ScanSpec {
    pub endpoint: Endpoint,
    pub params: Params,
    /// JSON pointer to the array of candidates
    pub subjects_pointer: String,
    /// Field of each candidate holding its symbol
    pub symbol_field: String,
    pub top_k: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageGate {
    Always,
    /// Only when the latest classification is bullish or bearish
    OnConviction,
}

#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: String,
    pub endpoint: Endpoint,
    /// Query parameters; `{symbol}` is replaced by the subject
    pub params: Params,
    pub gate: StageGate,
    /// JSON pointer to the text to classify; `None` leaves the stage unclassified
    pub text_pointer: Option<String>,
    /// `(label, pointer)` pairs copied into the rationale
    pub annotations: Vec<(String, String)>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, endpoint: Endpoint, params: &[(&str, &str)]) -> Self {
        Self {
            name: name.into(),
            endpoint,
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            gate: StageGate::Always,
            text_pointer: None,
            annotations: Vec::new(),
        }
    }

    pub fn gated(mut self, gate: StageGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn classify_at(mut self, pointer: impl Into<String>) -> Self {
        self.text_pointer = Some(pointer.into());
        self
    }

    pub fn annotate(mut self, label: impl Into<String>, pointer: impl Into<String>) -> Self {
        self.annotations.push((label.into(), pointer.into()));
        self
    }

    fn render(&self, subject: &str) -> Params {
        self.params
            .iter()
            .map(|(k, v)| (k.clone(), v.replace(SYMBOL_PLACEHOLDER, subject)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalMode {
    /// Buy / Sell / Hold
    Decision,
    /// Bullish / Bearish / Neutral
    Alert,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub scan: Option<ScanSpec>,
    pub stages: Vec<StageSpec>,
    pub mode: SignalMode,
    pub thresholds: Thresholds,
    /// Subjects used when there is neither a scan stage nor an explicit symbol
    pub watchlist: Vec<String>,
    /// Subjects processed concurrently
    pub parallelism: usize,
    /// Delay between consecutive calls for one subject
    pub pace: Duration,
}

impl PipelineConfig {
    /// trending → sentiment → deep research (only with conviction) → Buy/Sell/Hold
    pub fn decision_chain(catalog: &Catalog, top_k: usize) -> Result<Self, CatalogError> {
        Ok(Self {
            scan: Some(ScanSpec {
                endpoint: catalog.get(TRENDING)?.clone(),
                params: vec![("twitter".into(), "true".into())],
                subjects_pointer: "/data/coingecko".into(),
                symbol_field: "symbol".into(),
                top_k,
            }),
            stages: vec![
                StageSpec::new(SENTIMENT, catalog.get(SENTIMENT)?.clone(), &[("query", "${symbol}")])
                    .classify_at("/data/sentimentAnalysis"),
                StageSpec::new(
                    DEEP,
                    catalog.get(DEEP)?.clone(),
                    &[("query", "{symbol} investment thesis")],
                )
                .gated(StageGate::OnConviction)
                .classify_at("/data"),
            ],
            mode: SignalMode::Decision,
            thresholds: Thresholds::any_mention(),
            watchlist: Vec::new(),
            parallelism: 1,
            pace: Duration::from_millis(200),
        })
    }

    /// Sentiment per watchlist symbol → Bullish/Bearish/Neutral alert
    pub fn sentiment_monitor(catalog: &Catalog, watchlist: Vec<String>) -> Result<Self, CatalogError> {
        Ok(Self {
            scan: None,
            stages: vec![
                StageSpec::new(SENTIMENT, catalog.get(SENTIMENT)?.clone(), &[("query", "${symbol}")])
                    .classify_at("/data/sentimentAnalysis")
                    .annotate("tweets", "/data/tweetsAnalyzed")
                    .annotate("likes", "/data/totalLikes")
                    .annotate("retweets", "/data/totalRetweets"),
            ],
            mode: SignalMode::Alert,
            thresholds: Thresholds::default(),
            watchlist,
            parallelism: 1,
            pace: Duration::from_millis(200),
        })
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    #[error("payment required but no signer configured")]
    Unauthenticated,
    #[error(transparent)]
    Rejected(RejectReason),
    #[error(transparent)]
    Failed(FailureReason),
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("unexpected payload: {0}")]
    InvalidPayload(String),
}

/// A subject's chain stopped at `stage`; sibling subjects are unaffected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{subject}: stage {stage} aborted: {reason}")]
pub struct PipelineAborted {
    pub subject: String,
    pub stage: String,
    pub reason: AbortReason,
}

#[derive(Debug, Clone)]
pub enum SubjectOutcome {
    Signal(Signal),
    Aborted(PipelineAborted),
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    /// In subject order
    pub subjects: Vec<SubjectOutcome>,
    pub scan_failure: Option<PipelineAborted>,
    pub spent_atomic: u64,
}

impl CycleReport {
    pub fn signals(&self) -> impl Iterator<Item = &Signal> {
        self.subjects.iter().filter_map(|o| match o {
            SubjectOutcome::Signal(s) => Some(s),
            SubjectOutcome::Aborted(_) => None,
        })
    }

    /// No signal came out of the cycle: the scan failed or every subject aborted
    pub fn is_failed(&self) -> bool {
        self.scan_failure.is_some()
            || (!self.subjects.is_empty()
                && self.subjects.iter().all(|o| matches!(o, SubjectOutcome::Aborted(_))))
    }

    pub fn aborted(&self) -> impl Iterator<Item = &PipelineAborted> {
        self.scan_failure.iter().chain(self.subjects.iter().filter_map(|o| match o {
            SubjectOutcome::Aborted(a) => Some(a),
            SubjectOutcome::Signal(_) => None,
        }))
    }
}

// ---------------------------------------------------------------------------
// Per-subject state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct StageRecord {
    stage: String,
    assessment: Option<Assessment>,
    excerpt: String,
    annotations: Vec<String>,
}

/// Intermediate results for one subject within one cycle
#[derive(Debug)]
struct PipelineContext {
    subject: String,
    records: Vec<StageRecord>,
}

impl PipelineContext {
    fn latest_classification(&self) -> Option<Classification> {
        self.records
            .iter()
            .rev()
            .find_map(|r| r.assessment.map(|a| a.classification))
    }
}

#[derive(Debug)]
enum SubjectState {
    Init,
    StageDone(usize),
    Complete(Signal),
    Aborted(PipelineAborted),
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct ResearchPipeline {
    client: PaidHttpClient,
    config: PipelineConfig,
    classifier: Arc<dyn Classifier>,
}

impl ResearchPipeline {
    pub fn new(client: PaidHttpClient, config: PipelineConfig) -> Self {
        let classifier = Arc::new(KeywordClassifier::new(config.thresholds));
        Self {
            client,
            config,
            classifier,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn client(&self) -> &PaidHttpClient {
        &self.client
    }

    pub async fn run_cycle(&self, symbol: Option<&str>, budget_per_cycle: u64) -> CycleReport {
        self.run(symbol, budget_per_cycle, None).await
    }

    /// Like [`Self::run_cycle`], abandoning in-flight calls once `cancel` fires
    pub async fn run_cycle_with_cancel(
        &self,
        symbol: Option<&str>,
        budget_per_cycle: u64,
        cancel: &CancellationToken,
    ) -> CycleReport {
        self.run(symbol, budget_per_cycle, Some(cancel)).await
    }

    async fn run(&self, symbol: Option<&str>, budget_per_cycle: u64, cancel: Option<&CancellationToken>) -> CycleReport {
        let cycle_budget = BudgetGuard::per_cycle(budget_per_cycle);

        let subjects = match (symbol, &self.config.scan) {
            (Some(symbol), _) => vec![symbol.trim().trim_start_matches('$').to_uppercase()],
            (None, Some(scan)) => match self.scan(scan, &cycle_budget, cancel).await {
                Ok(subjects) => subjects,
                Err(aborted) => {
                    warn!(error = %aborted, "Scan stage aborted");
                    return CycleReport {
                        subjects: Vec::new(),
                        scan_failure: Some(aborted),
                        spent_atomic: cycle_budget.current_state().spent_atomic,
                    };
                }
            },
            (None, None) => self.config.watchlist.clone(),
        };
        info!(subjects = ?subjects, budget = budget_per_cycle, "Pipeline cycle starting");

        // Batches of `parallelism` subjects; outcomes stay in subject order
        let mut outcomes: Vec<SubjectOutcome> = Vec::with_capacity(subjects.len());
        for batch in subjects.chunks(self.config.parallelism.max(1)) {
            let running: Vec<_> = batch
                .iter()
                .map(|subject| self.run_subject(subject.clone(), &cycle_budget, cancel))
                .collect();
            outcomes.extend(join_all(running).await);
        }

        let spent_atomic = cycle_budget.current_state().spent_atomic;
        info!(
            signals = outcomes.iter().filter(|o| matches!(o, SubjectOutcome::Signal(_))).count(),
            aborted = outcomes.iter().filter(|o| matches!(o, SubjectOutcome::Aborted(_))).count(),
            spent = spent_atomic,
            "Pipeline cycle finished"
        );

        CycleReport {
            subjects: outcomes,
            scan_failure: None,
            spent_atomic,
        }
    }

    async fn scan(
        &self,
        scan: &ScanSpec,
        cycle_budget: &BudgetGuard,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<String>, PipelineAborted> {
        if scan.top_k == 0 {
            return Ok(Vec::new());
        }
        let abort = |reason: AbortReason| PipelineAborted {
            subject: SCAN_SUBJECT.to_string(),
            stage: scan.endpoint.name.clone(),
            reason,
        };
        let opts = CallOptions {
            cycle_budget: Some(cycle_budget),
            cancel,
        };
        let outcome = self.client.call_with(&scan.endpoint, &scan.params, opts).await;
        let value = paid_json(outcome).map_err(abort)?;

        let candidates = value
            .pointer(&scan.subjects_pointer)
            .and_then(Value::as_array)
            .ok_or_else(|| abort(AbortReason::InvalidPayload(format!("no array at {}", scan.subjects_pointer))))?;

        let mut subjects: Vec<String> = Vec::new();
        for symbol in candidates
            .iter()
            .filter_map(|c| c.get(&scan.symbol_field).and_then(Value::as_str))
        {
            if subjects.len() >= scan.top_k {
                break;
            }
            let symbol = symbol.trim().to_uppercase();
            if !symbol.is_empty() && !subjects.contains(&symbol) {
                subjects.push(symbol);
            }
        }
        debug!(count = subjects.len(), "Scan selected subjects");
        Ok(subjects)
    }

    async fn run_subject(
        &self,
        subject: String,
        cycle_budget: &BudgetGuard,
        cancel: Option<&CancellationToken>,
    ) -> SubjectOutcome {
        let mut ctx = PipelineContext {
            subject,
            records: Vec::new(),
        };
        let mut state = SubjectState::Init;

        loop {
            state = match state {
                SubjectState::Init => self.advance(0, &mut ctx, cycle_budget, cancel).await,
                SubjectState::StageDone(index) => self.advance(index + 1, &mut ctx, cycle_budget, cancel).await,
                SubjectState::Complete(signal) => {
                    debug!(subject = %signal.subject, classification = %signal.classification, "Subject complete");
                    return SubjectOutcome::Signal(signal);
                }
                SubjectState::Aborted(aborted) => {
                    warn!(error = %aborted, "Subject aborted");
                    return SubjectOutcome::Aborted(aborted);
                }
            };
        }
    }

    /// Run stage `index` for the subject, or conclude when there is none left
    async fn advance(
        &self,
        index: usize,
        ctx: &mut PipelineContext,
        cycle_budget: &BudgetGuard,
        cancel: Option<&CancellationToken>,
    ) -> SubjectState {
        let Some(stage) = self.config.stages.get(index) else {
            return SubjectState::Complete(self.conclude(ctx));
        };

        if stage.gate == StageGate::OnConviction
            && !ctx.latest_classification().map(|c| c.has_conviction()).unwrap_or(false)
        {
            debug!(subject = %ctx.subject, stage = %stage.name, "No conviction, skipping remaining stages");
            return SubjectState::Complete(self.short_circuit(ctx));
        }

        if index > 0 && !self.config.pace.is_zero() {
            match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(self.config.pace) => {}
                },
                None => tokio::time::sleep(self.config.pace).await,
            }
        }

        let params = stage.render(&ctx.subject);
        let opts = CallOptions {
            cycle_budget: Some(cycle_budget),
            cancel,
        };
        let outcome = self.client.call_with(&stage.endpoint, &params, opts).await;

        let value = match paid_json(outcome) {
            Ok(value) => value,
            Err(reason) => {
                return SubjectState::Aborted(PipelineAborted {
                    subject: ctx.subject.clone(),
                    stage: stage.name.clone(),
                    reason,
                })
            }
        };

        let text = stage.text_pointer.as_deref().map(|p| text_at(&value, p));
        let assessment = text.as_deref().map(|t| self.classifier.assess(t));
        let annotations = stage
            .annotations
            .iter()
            .filter_map(|(label, pointer)| value.pointer(pointer).map(|v| format!("{}: {}", label, plain(v))))
            .collect();
        ctx.records.push(StageRecord {
            stage: stage.name.clone(),
            assessment,
            excerpt: text.as_deref().map(excerpt).unwrap_or_default(),
            annotations,
        });

        SubjectState::StageDone(index)
    }

    fn conclude(&self, ctx: &PipelineContext) -> Signal {
        let mut classified = ctx
            .records
            .iter()
            .filter_map(|r| r.assessment.map(|a| (r, a)));
        let Some((primary, assessment)) = classified.next() else {
            return self.short_circuit(ctx);
        };

        match self.config.mode {
            SignalMode::Alert => Signal::new(
                &ctx.subject,
                assessment.classification,
                assessment.confidence(),
                rationale(primary),
            ),
            SignalMode::Decision => {
                let (action, mut confidence) = match assessment.classification {
                    Classification::Bullish => (Classification::Buy, BUY_CONFIDENCE),
                    Classification::Bearish => (Classification::Sell, SELL_CONFIDENCE),
                    _ => return self.short_circuit(ctx),
                };
                let mut text = rationale(primary);
                for (record, later) in classified {
                    if later.classification == assessment.classification {
                        confidence += AGREEMENT_BONUS;
                    } else if later.classification.has_conviction() {
                        confidence -= CONTRADICTION_PENALTY;
                    }
                    text.push_str(&format!("; {}: {}", record.stage, later.classification));
                    if !record.excerpt.is_empty() {
                        text.push_str(" | ");
                        text.push_str(&record.excerpt);
                    }
                }
                Signal::new(&ctx.subject, action, confidence, text)
            }
        }
    }

    /// Signal for a subject that stopped without conviction
    fn short_circuit(&self, ctx: &PipelineContext) -> Signal {
        let detail = ctx
            .records
            .iter()
            .find(|r| r.assessment.is_some())
            .map(rationale)
            .unwrap_or_else(|| "no classified stage output".to_string());
        match self.config.mode {
            SignalMode::Decision => Signal::new(
                &ctx.subject,
                Classification::Hold,
                HOLD_CONFIDENCE,
                format!("Mixed sentiment. {}", detail),
            ),
            SignalMode::Alert => Signal::new(&ctx.subject, Classification::Neutral, HOLD_CONFIDENCE, detail),
        }
    }
}

/// JSON body of a successful call, or why the subject has to stop
fn paid_json(outcome: CallOutcome) -> Result<Value, AbortReason> {
    match outcome {
        CallOutcome::Paid { payload, .. } => payload
            .json()
            .map_err(|e| AbortReason::InvalidPayload(e.to_string())),
        CallOutcome::Unauthenticated { .. } => Err(AbortReason::Unauthenticated),
        CallOutcome::Rejected(reason) => Err(AbortReason::Rejected(reason)),
        CallOutcome::TransportFailed(reason) => Err(AbortReason::Failed(reason)),
        CallOutcome::ServerError { status, body } => Err(AbortReason::ServerError { status, body }),
    }
}

fn text_at(value: &Value, pointer: &str) -> String {
    value.pointer(pointer).map(plain).unwrap_or_default()
}

/// Strings without quotes, everything else as compact JSON
fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn excerpt(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= EXCERPT_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(EXCERPT_CHARS).collect();
    format!("{}...", cut.trim_end())
}

fn rationale(record: &StageRecord) -> String {
    let mut text = format!("{}: {}", capitalize(&record.stage), record.excerpt);
    if !record.annotations.is_empty() {
        text.push_str(" | ");
        text.push_str(&record.annotations.join(" | "));
    }
    text
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::{HttpRequest, HttpResponse, TransportError, PAYMENT_HEADER};
    use crate::testing::{payment_required_body, MockSigner, MockTransport};
    use serde_json::json;

    const TRENDING_PATH: &str = "/alpha/trending";
    const SENTIMENT_PATH: &str = "/alpha/sentiment";
    const DEEP_PATH: &str = "/alpha/deep";

    fn query_of(req: &HttpRequest) -> String {
        req.query
            .iter()
            .find(|(k, _)| k == "query")
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    /// Priced route whose payload depends on the `query` parameter
    fn priced_by_query<F>(transport: &MockTransport, path: &str, amount: u64, payload: F)
    where
        F: Fn(&str) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        let required = payment_required_body(&[(amount, "0xresearch")]);
        transport.handle(path, move |req| {
            if req.header(PAYMENT_HEADER).is_none() {
                return Ok(HttpResponse::new(402, required.clone()));
            }
            payload(&query_of(req))
        });
    }

    fn trending(transport: &MockTransport, symbols: &[&str]) {
        let tokens: Vec<_> = symbols.iter().map(|s| json!({"symbol": s.to_lowercase(), "price": 1.0})).collect();
        transport.priced(TRENDING_PATH, 20_000, json!({"data": {"coingecko": tokens}}));
    }

    fn sentiment_json(analysis: &str) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse::new(
            200,
            json!({"query": "", "data": {"sentimentAnalysis": analysis, "tweetsAnalyzed": 40, "totalLikes": 900, "totalRetweets": 120}})
                .to_string(),
        ))
    }

    fn pipeline(transport: &Arc<MockTransport>, config: PipelineConfig) -> ResearchPipeline {
        let client = PaidHttpClient::new(
            transport.clone(),
            "https://api.test",
            Arc::new(BudgetGuard::per_cycle(10_000_000)),
        )
        .with_signer(Arc::new(MockSigner::valid()));
        ResearchPipeline::new(client, config)
    }

    fn decision_config(top_k: usize) -> PipelineConfig {
        let mut config = PipelineConfig::decision_chain(&Catalog::standard(), top_k).unwrap();
        config.pace = Duration::ZERO;
        config
    }

    fn signal(outcome: &SubjectOutcome) -> &Signal {
        match outcome {
            SubjectOutcome::Signal(s) => s,
            SubjectOutcome::Aborted(a) => panic!("unexpected abort: {}", a),
        }
    }

    #[tokio::test]
    async fn test_neutral_sentiment_skips_deep_research() {
        let transport = Arc::new(MockTransport::new());
        trending(&transport, &["SOL"]);
        priced_by_query(&transport, SENTIMENT_PATH, 80_000, |_| sentiment_json("flat market, nothing notable"));
        transport.priced(DEEP_PATH, 150_000, json!({"data": {}}));
        let pipeline = pipeline(&transport, decision_config(3));

        let report = pipeline.run_cycle(None, 1_000_000).await;

        assert_eq!(report.subjects.len(), 1);
        let s = signal(&report.subjects[0]);
        assert_eq!(s.subject, "SOL");
        assert_eq!(s.classification, Classification::Hold);
        assert_eq!(s.confidence, 0.5);
        assert_eq!(transport.calls_to(DEEP_PATH), 0);
        assert_eq!(report.spent_atomic, 100_000);
    }

    #[tokio::test]
    async fn test_conviction_runs_deep_research_and_decides() {
        let transport = Arc::new(MockTransport::new());
        trending(&transport, &["SOL", "WIF", "PEPE"]);
        priced_by_query(&transport, SENTIMENT_PATH, 80_000, |q| match q {
            "$SOL" => sentiment_json("Strongly bullish community"),
            "$WIF" => sentiment_json("bearish, whales exiting"),
            _ => sentiment_json("quiet"),
        });
        priced_by_query(&transport, DEEP_PATH, 150_000, |q| {
            let data = if q.starts_with("SOL") {
                json!({"thesis": "bullish on fee growth"})
            } else {
                json!({"thesis": "mixed"})
            };
            Ok(HttpResponse::new(200, json!({"query": q, "sources": ["exa"], "data": data}).to_string()))
        });
        let pipeline = pipeline(&transport, decision_config(3));

        let report = pipeline.run_cycle(None, 1_000_000).await;

        let sol = signal(&report.subjects[0]);
        assert_eq!(sol.subject, "SOL");
        assert_eq!(sol.classification, Classification::Buy);
        assert!((sol.confidence - 0.8).abs() < 1e-9);
        assert!(sol.rationale.starts_with("Sentiment: Strongly bullish"));

        let wif = signal(&report.subjects[1]);
        assert_eq!(wif.classification, Classification::Sell);
        assert!((wif.confidence - 0.6).abs() < 1e-9);

        let pepe = signal(&report.subjects[2]);
        assert_eq!(pepe.classification, Classification::Hold);

        assert_eq!(transport.paid_calls_to(DEEP_PATH), 2);
        let deep_queries: Vec<_> = transport
            .calls()
            .into_iter()
            .filter(|c| c.path == DEEP_PATH && c.payment.is_some())
            .map(|c| c.query[0].1.clone())
            .collect();
        assert_eq!(deep_queries, vec!["SOL investment thesis", "WIF investment thesis"]);
        assert_eq!(report.spent_atomic, 20_000 + 3 * 80_000 + 2 * 150_000);
    }

    #[tokio::test]
    async fn test_contradicting_deep_research_lowers_confidence() {
        let transport = Arc::new(MockTransport::new());
        priced_by_query(&transport, SENTIMENT_PATH, 80_000, |_| sentiment_json("bullish"));
        transport.priced(DEEP_PATH, 150_000, json!({"data": {"verdict": "bearish outlook"}}));
        let pipeline = pipeline(&transport, decision_config(1));

        let report = pipeline.run_cycle(Some("$eth"), 1_000_000).await;

        let eth = signal(&report.subjects[0]);
        assert_eq!(eth.subject, "ETH");
        assert_eq!(eth.classification, Classification::Buy);
        assert!((eth.confidence - 0.5).abs() < 1e-9);
        assert!(eth.rationale.contains("; deep: BEARISH | "), "{}", eth.rationale);
        assert!(eth.rationale.contains("bearish outlook"));
    }

    #[tokio::test]
    async fn test_explicit_symbol_skips_scan() {
        let transport = Arc::new(MockTransport::new());
        trending(&transport, &["SOL"]);
        priced_by_query(&transport, SENTIMENT_PATH, 80_000, |_| sentiment_json("meh"));
        let pipeline = pipeline(&transport, decision_config(3));

        let report = pipeline.run_cycle(Some("virtual"), 1_000_000).await;

        assert_eq!(transport.calls_to(TRENDING_PATH), 0);
        assert_eq!(signal(&report.subjects[0]).subject, "VIRTUAL");
        assert_eq!(transport.calls()[1].query, vec![("query".to_string(), "$VIRTUAL".to_string())]);
    }

    #[tokio::test]
    async fn test_failed_subject_does_not_affect_siblings() {
        let transport = Arc::new(MockTransport::new());
        trending(&transport, &["SOL", "WIF"]);
        priced_by_query(&transport, SENTIMENT_PATH, 80_000, |q| match q {
            "$SOL" => Ok(HttpResponse::new(500, "upstream error")),
            _ => sentiment_json("nothing"),
        });
        let mut config = decision_config(2);
        config.parallelism = 2;
        let pipeline = pipeline(&transport, config);

        let report = pipeline.run_cycle(None, 1_000_000).await;

        match &report.subjects[0] {
            SubjectOutcome::Aborted(a) => {
                assert_eq!(a.subject, "SOL");
                assert_eq!(a.stage, SENTIMENT);
                assert!(matches!(a.reason, AbortReason::ServerError { status: 500, .. }));
            }
            other => panic!("expected abort, got {:?}", other),
        }
        assert_eq!(signal(&report.subjects[1]).subject, "WIF");
        assert_eq!(report.signals().count(), 1);
        assert_eq!(report.aborted().count(), 1);
        assert_eq!(report.spent_atomic, 20_000 + 80_000);
    }

    #[tokio::test]
    async fn test_cycle_budget_bounds_spend() {
        let transport = Arc::new(MockTransport::new());
        trending(&transport, &["SOL", "WIF"]);
        priced_by_query(&transport, SENTIMENT_PATH, 80_000, |_| sentiment_json("bullish"));
        transport.priced(DEEP_PATH, 150_000, json!({"data": {}}));
        let pipeline = pipeline(&transport, decision_config(2));

        // trending + 2 sentiment + 1 deep = 330_000; the second deep call does not fit
        let report = pipeline.run_cycle(None, 400_000).await;

        assert_eq!(signal(&report.subjects[0]).classification, Classification::Buy);
        match &report.subjects[1] {
            SubjectOutcome::Aborted(a) => {
                assert_eq!(a.stage, DEEP);
                assert_eq!(
                    a.reason,
                    AbortReason::Rejected(RejectReason::BudgetExceeded {
                        requested: 150_000,
                        remaining: 70_000
                    })
                );
            }
            other => panic!("expected abort, got {:?}", other),
        }
        assert_eq!(report.spent_atomic, 330_000);
        assert_eq!(transport.paid_calls_to(DEEP_PATH), 1);
    }

    #[tokio::test]
    async fn test_zero_top_k_selects_nothing() {
        let transport = Arc::new(MockTransport::new());
        trending(&transport, &["SOL", "WIF"]);
        priced_by_query(&transport, SENTIMENT_PATH, 80_000, |_| sentiment_json("bullish"));
        let pipeline = pipeline(&transport, decision_config(0));

        let report = pipeline.run_cycle(None, 1_000_000).await;

        assert!(report.subjects.is_empty());
        assert!(report.scan_failure.is_none());
        assert!(!report.is_failed());
        assert_eq!(report.spent_atomic, 0);
        assert_eq!(transport.calls_to(SENTIMENT_PATH), 0);
    }

    #[tokio::test]
    async fn test_every_subject_aborted_fails_cycle() {
        let transport = Arc::new(MockTransport::new());
        transport.fail(SENTIMENT_PATH, TransportError::Connection("refused".into()));
        let mut config =
            PipelineConfig::sentiment_monitor(&Catalog::standard(), vec!["SOL".into(), "ETH".into()]).unwrap();
        config.pace = Duration::ZERO;
        let pipeline = pipeline(&transport, config);

        let report = pipeline.run_cycle(None, 1_000_000).await;

        assert_eq!(report.aborted().count(), 2);
        assert!(report.scan_failure.is_none());
        assert!(report.is_failed());
    }

    #[tokio::test]
    async fn test_scan_failure_reported() {
        let transport = Arc::new(MockTransport::new());
        transport.fail(TRENDING_PATH, TransportError::Connection("reset".into()));
        let pipeline = pipeline(&transport, decision_config(3));

        let report = pipeline.run_cycle(None, 1_000_000).await;

        assert!(report.subjects.is_empty());
        assert!(report.is_failed());
        let failure = report.scan_failure.expect("scan failure");
        assert_eq!(failure.subject, SCAN_SUBJECT);
        assert!(matches!(failure.reason, AbortReason::Failed(FailureReason::Transport(_))));
        assert_eq!(transport.calls_to(SENTIMENT_PATH), 0);
    }

    #[tokio::test]
    async fn test_missing_signer_aborts_subject() {
        let transport = Arc::new(MockTransport::new());
        transport.priced(SENTIMENT_PATH, 80_000, json!({}));
        let client = PaidHttpClient::new(
            transport.clone(),
            "https://api.test",
            Arc::new(BudgetGuard::per_cycle(1_000_000)),
        );
        let pipeline = ResearchPipeline::new(client, decision_config(1));

        let report = pipeline.run_cycle(Some("SOL"), 1_000_000).await;

        assert!(matches!(
            &report.subjects[0],
            SubjectOutcome::Aborted(PipelineAborted { reason: AbortReason::Unauthenticated, .. })
        ));
        assert_eq!(report.spent_atomic, 0);
    }

    #[tokio::test]
    async fn test_sentiment_monitor_alerts() {
        let transport = Arc::new(MockTransport::new());
        priced_by_query(&transport, SENTIMENT_PATH, 80_000, |q| match q {
            "$SOL" => sentiment_json(&"bullish ".repeat(7)),
            "$ETH" => sentiment_json("bearish bearish bearish"),
            _ => sentiment_json("bullish but also bearish"),
        });
        let mut config = PipelineConfig::sentiment_monitor(
            &Catalog::standard(),
            vec!["SOL".into(), "ETH".into(), "WIF".into()],
        )
        .unwrap();
        config.pace = Duration::ZERO;
        let pipeline = pipeline(&transport, config);

        let report = pipeline.run_cycle(None, 1_000_000).await;

        let classes: Vec<_> = report.signals().map(|s| s.classification).collect();
        assert_eq!(
            classes,
            vec![Classification::Bullish, Classification::Bearish, Classification::Neutral]
        );
        let sol = signal(&report.subjects[0]);
        assert_eq!(sol.confidence, 1.0);
        assert!(sol.rationale.contains("tweets: 40 | likes: 900 | retweets: 120"));
        assert_eq!(report.spent_atomic, 240_000);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_spends_nothing() {
        let transport = Arc::new(MockTransport::new());
        trending(&transport, &["SOL"]);
        let pipeline = pipeline(&transport, decision_config(1));
        let token = CancellationToken::new();
        token.cancel();

        let report = pipeline.run_cycle_with_cancel(None, 1_000_000, &token).await;

        let failure = report.scan_failure.expect("scan aborted");
        assert_eq!(failure.reason, AbortReason::Failed(FailureReason::Cancelled));
        assert_eq!(report.spent_atomic, 0);
        assert_eq!(transport.calls_to(TRENDING_PATH), 0);
    }

    #[test]
    fn test_stage_params_rendered_per_subject() {
        let stage = StageSpec::new(
            "deep",
            Endpoint::get("deep", DEEP_PATH),
            &[("query", "{symbol} investment thesis"), ("limit", "5")],
        );
        assert_eq!(
            stage.render("SOL"),
            vec![
                ("query".to_string(), "SOL investment thesis".to_string()),
                ("limit".to_string(), "5".to_string())
            ]
        );
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(200);
        let cut = excerpt(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), EXCERPT_CHARS + 3);
        assert_eq!(excerpt("  short  "), "short");
    }
}
