//! Alpha-Agent: budgeted research agent for x402 payment-gated APIs
//!
//! Usage:
//!   alpha-agent catalog                     - Endpoints, prices, cost estimates
//!   alpha-agent call sentiment -p query=$SOL - One paid call
//!   alpha-agent monitor --symbols SOL,ETH   - Sentiment alerts every 15 minutes
//!   alpha-agent trade --top-k 3             - Trending → sentiment → deep research
//!   alpha-agent serve --mode trade          - Background loop with a status API

mod status;

use alpha_engine::api::{ResearchApi, ReqwestTransport};
use alpha_engine::scheduler::{self, Backoff};
use alpha_engine::{
    atomic_to_usd, gather_intelligence, route, AgentConfig, BudgetGuard, CallOutcome, Catalog,
    CycleContext, CycleEvent, CycleReport, PaidHttpClient, PipelineConfig, PriceQuote,
    ResearchPipeline, RunSummary, ScheduleOptions, SchedulerHandle, SubjectOutcome,
};
use axum::Router;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use status::{AppState, LoopProgress};

pub(crate) const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

const MONITOR_INTERVAL_MINS: u64 = 15;
const TRADE_INTERVAL_MINS: u64 = 60;
const MAX_JITTER: Duration = Duration::from_secs(30);
const RATIONALE_WIDTH: usize = 90;

#[derive(Parser)]
#[command(name = "alpha-agent")]
#[command(about = "Budgeted research agent for x402 payment-gated APIs", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Research API base URL (overrides ALPHA_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Spend ceiling per budget window, atomic USDC units (overrides ALPHA_BUDGET_CEILING_ATOMIC)
    #[arg(long, global = true)]
    budget: Option<u64>,

    /// External signer command (overrides ALPHA_SIGNER_CMD)
    #[arg(long, global = true)]
    signer_cmd: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the research API's free endpoints
    Health,
    /// List priced endpoints with nominal prices and cost estimates
    Catalog {
        /// Refresh nominal prices from the discovery document
        #[arg(long)]
        discover: bool,
        /// Watchlist size assumed by the monitor estimate
        #[arg(long, default_value_t = 5)]
        symbols: usize,
        /// Monitor interval assumed by the estimate, in minutes
        #[arg(long, default_value_t = MONITOR_INTERVAL_MINS)]
        interval_mins: u64,
        /// Subjects per trade cycle assumed by the estimate
        #[arg(long, default_value_t = 3)]
        top_k: usize,
    },
    /// Show what an endpoint charges without paying
    Quote {
        /// Endpoint name or path (e.g. sentiment, /alpha/deep)
        endpoint: String,
        /// Query parameter, repeatable
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Call one priced endpoint, paying if a signer is configured
    Call {
        /// Endpoint name or path
        endpoint: String,
        /// Query parameter, repeatable
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Sentiment alerts for a watchlist on a fixed interval
    Monitor {
        /// Symbols to watch (comma-separated)
        #[arg(long, value_delimiter = ',', default_value = "SOL,ETH,BTC")]
        symbols: Vec<String>,
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
    /// Trending scan, sentiment and deep research into Buy/Sell/Hold signals
    Trade {
        /// Analyze this symbol instead of scanning trending tokens
        #[arg(long)]
        symbol: Option<String>,
        /// Trending tokens analyzed per cycle
        #[arg(long, default_value_t = 3)]
        top_k: usize,
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
    /// Token data, web research and sentiment for one symbol, in parallel
    Intel {
        symbol: String,
    },
    /// Route a free-text request to the matching endpoint
    Ask {
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Run a monitor or trade loop in the background with a local status API
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3402)]
        port: u16,
        #[arg(long, value_enum, default_value_t = LoopMode::Monitor)]
        mode: LoopMode,
        /// Monitor watchlist (comma-separated)
        #[arg(long, value_delimiter = ',', default_value = "SOL,ETH,BTC")]
        symbols: Vec<String>,
        /// Trade mode: analyze this symbol instead of scanning
        #[arg(long)]
        symbol: Option<String>,
        /// Trade mode: trending tokens analyzed per cycle
        #[arg(long, default_value_t = 3)]
        top_k: usize,
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
}

#[derive(Args, Clone, Debug)]
struct ScheduleArgs {
    /// Minutes between cycles
    #[arg(long)]
    interval_mins: Option<u64>,
    /// Stop after this many cycles
    #[arg(long)]
    max_cycles: Option<u64>,
    /// Spend cap per cycle, atomic USDC units (default: catalog estimate)
    #[arg(long)]
    cycle_budget: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LoopMode {
    Monitor,
    Trade,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug,alpha_engine=debug,alpha_agent=debug,hyper=info,reqwest=info")
        } else {
            EnvFilter::new("info,alpha_engine=info,alpha_agent=info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {:?}", s))
}

fn load_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let mut config = AgentConfig::from_env()?;
    if let Some(url) = &cli.api_url {
        config.api_url = url.trim_end_matches('/').to_string();
    }
    if let Some(ceiling) = cli.budget {
        config.budget_ceiling_atomic = ceiling;
    }
    if let Some(cmd) = &cli.signer_cmd {
        config.signer_cmd = Some(cmd.clone());
    }
    Ok(config)
}

fn build_client(config: &AgentConfig) -> anyhow::Result<PaidHttpClient> {
    let transport = Arc::new(ReqwestTransport::new()?);
    let budget = Arc::new(BudgetGuard::new(config.budget_ceiling_atomic, config.budget_window));
    let client = PaidHttpClient::new(transport, &config.api_url, budget).with_selector(config.selector());

    Ok(match config.signer() {
        Some(signer) => client.with_signer(Arc::new(signer)),
        None => {
            warn!("ALPHA_SIGNER_CMD not set: probe-only mode, priced calls will not be paid");
            client
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    let config = load_config(&cli)?;
    info!(
        api = %config.api_url,
        ceiling = config.budget_ceiling_atomic,
        window_secs = config.budget_window.as_secs(),
        "Alpha-Agent v{}",
        APP_VERSION
    );
    let catalog = Catalog::standard();

    match cli.command {
        Commands::Health => cmd_health(&config).await?,
        Commands::Catalog {
            discover,
            symbols,
            interval_mins,
            top_k,
        } => cmd_catalog(&config, discover, symbols, interval_mins, top_k).await?,
        Commands::Quote { endpoint, params } => {
            let client = build_client(&config)?;
            let outcome = client.probe(catalog.get(&endpoint)?, &params).await;
            print_outcome(&outcome)?;
        }
        Commands::Call { endpoint, params } => {
            let client = build_client(&config)?;
            let outcome = client.call(catalog.get(&endpoint)?, &params).await;
            print_outcome(&outcome)?;
            print_budget(client.budget());
        }
        Commands::Monitor { symbols, schedule } => {
            let plan = plan_monitor(build_client(&config)?, &catalog, symbols, &schedule)?;
            cmd_loop(plan).await?;
        }
        Commands::Trade {
            symbol,
            top_k,
            schedule,
        } => {
            let plan = plan_trade(build_client(&config)?, &catalog, symbol, top_k, &schedule)?;
            cmd_loop(plan).await?;
        }
        Commands::Intel { symbol } => {
            let client = build_client(&config)?;
            let intel = gather_intelligence(&client, &catalog, &symbol).await?;
            println!("{}", serde_json::to_string_pretty(&intel)?);
            println!("\n  Spent {} USDC", atomic_to_usd(intel.spent_atomic));
        }
        Commands::Ask { text } => {
            let text = text.join(" ");
            let action = route(&text);
            println!("  Routed to {}: {}", action.endpoint_name(), serde_json::to_string(&action)?);
            let client = build_client(&config)?;
            let outcome = client.call(catalog.get(action.endpoint_name())?, &action.params()).await;
            print_outcome(&outcome)?;
        }
        Commands::Serve {
            host,
            port,
            mode,
            symbols,
            symbol,
            top_k,
            schedule,
        } => {
            let client = build_client(&config)?;
            let plan = match mode {
                LoopMode::Monitor => plan_monitor(client, &catalog, symbols, &schedule)?,
                LoopMode::Trade => plan_trade(client, &catalog, symbol, top_k, &schedule)?,
            };
            cmd_serve(&host, port, plan).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Free endpoints and catalog
// ============================================================================

async fn cmd_health(config: &AgentConfig) -> anyhow::Result<()> {
    let api = ResearchApi::new(Arc::new(ReqwestTransport::new()?), &config.api_url);
    let health = api.health().await?;
    println!("{}", serde_json::to_string_pretty(&health)?);

    match api.discovery().await {
        Ok(doc) => {
            println!("\n{} priced resource(s) advertised:", doc.resources.len());
            for r in &doc.resources {
                println!(
                    "  {:<22} {:>8}  {}",
                    r.path,
                    r.price_usd.map(|p| format!("${}", p)).unwrap_or_else(|| "-".into()),
                    r.description.as_deref().unwrap_or("")
                );
            }
        }
        Err(e) => warn!("Discovery document unavailable: {}", e),
    }
    Ok(())
}

async fn cmd_catalog(
    config: &AgentConfig,
    discover: bool,
    symbols: usize,
    interval_mins: u64,
    top_k: usize,
) -> anyhow::Result<()> {
    let mut catalog = Catalog::standard();
    if discover {
        let api = ResearchApi::new(Arc::new(ReqwestTransport::new()?), &config.api_url);
        match api.discovery().await {
            Ok(doc) => {
                let updated = catalog.apply_discovery(&doc);
                info!(updated, "Applied advertised prices");
            }
            Err(e) => warn!("Discovery document unavailable, using nominal prices: {}", e),
        }
    }

    println!("\nEndpoints ({}):", config.api_url);
    println!("  {:<12} {:<20} {:>10} {:>9}", "Name", "Path", "USDC", "Timeout");
    println!("  {}", "-".repeat(54));
    for e in catalog.endpoints() {
        println!(
            "  {:<12} {:<20} {:>10} {:>8}s",
            e.name,
            e.path,
            e.nominal_price_atomic
                .map(|p| atomic_to_usd(p).to_string())
                .unwrap_or_else(|| "-".into()),
            e.timeout().as_secs()
        );
    }

    let monitor = catalog.estimate_monitor(symbols, Duration::from_secs(interval_mins * 60))?;
    let decision = catalog.estimate_decision_cycle(top_k)?;
    println!("\nEstimates:");
    println!(
        "  Monitor, {} symbol(s) every {} min: {} USDC/cycle, {:.1} cycles/day, {} USDC/day",
        symbols,
        interval_mins,
        atomic_to_usd(monitor.per_cycle_atomic),
        monitor.cycles_per_day,
        atomic_to_usd(monitor.daily_atomic)
    );
    println!(
        "  Trade cycle, top {}: {} USDC best case, {} USDC worst case",
        top_k,
        atomic_to_usd(decision.best_case_atomic),
        atomic_to_usd(decision.worst_case_atomic)
    );
    println!(
        "\n  Budget: {} USDC per {}h window",
        atomic_to_usd(config.budget_ceiling_atomic),
        config.budget_window.as_secs() / 3600
    );
    Ok(())
}

// ============================================================================
// Scheduled loops
// ============================================================================

struct LoopPlan {
    mode: &'static str,
    pipeline: Arc<ResearchPipeline>,
    symbol: Option<String>,
    interval: Duration,
    options: ScheduleOptions,
    cycle_budget: u64,
}

fn schedule_options(interval: Duration, args: &ScheduleArgs) -> ScheduleOptions {
    ScheduleOptions {
        max_cycles: args.max_cycles,
        backoff: Some(Backoff {
            after_failures: 3,
            factor: 2.0,
            max_interval: interval * 4,
        }),
        jitter: (interval / 20).min(MAX_JITTER),
    }
}

fn plan_monitor(
    client: PaidHttpClient,
    catalog: &Catalog,
    symbols: Vec<String>,
    args: &ScheduleArgs,
) -> anyhow::Result<LoopPlan> {
    let symbols: Vec<String> = symbols
        .iter()
        .map(|s| s.trim().trim_start_matches('$').to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    anyhow::ensure!(!symbols.is_empty(), "monitor needs at least one symbol");

    let interval = Duration::from_secs(args.interval_mins.unwrap_or(MONITOR_INTERVAL_MINS).max(1) * 60);
    let estimate = catalog.estimate_monitor(symbols.len(), interval)?;
    let cycle_budget = args.cycle_budget.unwrap_or(estimate.per_cycle_atomic);
    println!(
        "\n  Watching {} every {} min: ~{} USDC/cycle, ~{} USDC/day",
        symbols.join(", "),
        interval.as_secs() / 60,
        atomic_to_usd(estimate.per_cycle_atomic),
        atomic_to_usd(estimate.daily_atomic)
    );

    let config = PipelineConfig::sentiment_monitor(catalog, symbols)?;
    Ok(LoopPlan {
        mode: "monitor",
        pipeline: Arc::new(ResearchPipeline::new(client, config)),
        symbol: None,
        interval,
        options: schedule_options(interval, args),
        cycle_budget,
    })
}

fn plan_trade(
    client: PaidHttpClient,
    catalog: &Catalog,
    symbol: Option<String>,
    top_k: usize,
    args: &ScheduleArgs,
) -> anyhow::Result<LoopPlan> {
    anyhow::ensure!(top_k > 0, "top-k must be at least 1");
    let interval = Duration::from_secs(args.interval_mins.unwrap_or(TRADE_INTERVAL_MINS).max(1) * 60);
    let subjects = if symbol.is_some() { 1 } else { top_k };
    let estimate = catalog.estimate_decision_cycle(subjects)?;
    let cycle_budget = args.cycle_budget.unwrap_or(estimate.worst_case_atomic);
    println!(
        "\n  Trade loop every {} min ({}): {} to {} USDC/cycle, cap {} USDC",
        interval.as_secs() / 60,
        symbol.as_deref().unwrap_or("trending scan"),
        atomic_to_usd(estimate.best_case_atomic),
        atomic_to_usd(estimate.worst_case_atomic),
        atomic_to_usd(cycle_budget)
    );

    let config = PipelineConfig::decision_chain(catalog, top_k)?;
    Ok(LoopPlan {
        mode: "trade",
        pipeline: Arc::new(ResearchPipeline::new(client, config)),
        symbol,
        interval,
        options: schedule_options(interval, args),
        cycle_budget,
    })
}

fn start_loop(plan: &LoopPlan) -> SchedulerHandle<CycleReport> {
    let pipeline = plan.pipeline.clone();
    let symbol = plan.symbol.clone();
    let cycle_budget = plan.cycle_budget;

    scheduler::run(
        move |ctx: CycleContext| {
            let pipeline = pipeline.clone();
            let symbol = symbol.clone();
            async move {
                let report = pipeline
                    .run_cycle_with_cancel(symbol.as_deref(), cycle_budget, &ctx.cancel)
                    .await;
                checked_report(report)
            }
        },
        plan.interval,
        plan.options.clone(),
    )
}

/// Failed cycles surface as errors so the scheduler backs off
fn checked_report(report: CycleReport) -> anyhow::Result<CycleReport> {
    if !report.is_failed() {
        return Ok(report);
    }
    match report.aborted().next() {
        Some(first) if report.scan_failure.is_none() => {
            anyhow::bail!("all {} subject(s) aborted, first: {}", report.subjects.len(), first)
        }
        Some(first) => anyhow::bail!("{}", first),
        None => anyhow::bail!("cycle produced no signals"),
    }
}

async fn cmd_loop(plan: LoopPlan) -> anyhow::Result<()> {
    let mut handle = start_loop(&plan);

    // Ctrl+C handler: stop after the in-flight cycle is abandoned
    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n  Stopping...");
            cancel.cancel();
        }
    });
    println!("  Press Ctrl+C to stop\n");

    if let Some(mut events) = handle.take_events() {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    }

    let summary = handle.join().await?;
    print_summary(&summary);
    print_budget(plan.pipeline.client().budget());
    Ok(())
}

async fn cmd_serve(host: &str, port: u16, plan: LoopPlan) -> anyhow::Result<()> {
    info!("Alpha-Agent v{} starting {} loop...", APP_VERSION, plan.mode);

    let progress = Arc::new(LoopProgress::new(plan.mode));
    let mut handle = start_loop(&plan);
    let state = AppState {
        progress: progress.clone(),
        budget: plan.pipeline.client().budget().clone(),
        cancel: handle.cancel_token(),
    };

    if let Some(mut events) = handle.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log_event(&event);
                progress.record(&event);
            }
        });
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", status::router(state))
        .layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Alpha-Agent v{} ===", APP_VERSION);
    println!("Research loop: {}", plan.mode);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health   - Loop status and version");
    println!("  GET  /api/budget   - Spend window");
    println!("  GET  /api/signals  - Latest signals");
    println!("  GET  /api/events   - Failures and aborted subjects");
    println!("  POST /api/cancel   - Stop the loop");
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    handle.cancel();
    let summary = handle.join().await?;
    print_summary(&summary);
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn print_event(event: &CycleEvent<CycleReport>) {
    match event {
        CycleEvent::Completed { cycle, output } => print_report(*cycle, output),
        CycleEvent::Failed {
            cycle,
            error,
            consecutive_failures,
        } => println!(
            "\nCycle {} failed ({} in a row): {}",
            cycle, consecutive_failures, error
        ),
        CycleEvent::Stopped(_) => {}
    }
}

fn log_event(event: &CycleEvent<CycleReport>) {
    match event {
        CycleEvent::Completed { cycle, output } => {
            for s in output.signals() {
                info!(
                    cycle,
                    subject = %s.subject,
                    classification = %s.classification,
                    confidence = s.confidence,
                    "Signal"
                );
            }
            for a in output.aborted() {
                warn!(cycle, subject = %a.subject, stage = %a.stage, reason = %a.reason, "Subject aborted");
            }
        }
        CycleEvent::Failed { cycle, error, .. } => warn!(cycle, error = %error, "Cycle failed"),
        CycleEvent::Stopped(summary) => info!(cycles = summary.cycles, stop = ?summary.stop, "Loop stopped"),
    }
}

fn print_report(cycle: u64, report: &CycleReport) {
    println!(
        "\nCycle {}: {} subject(s), spent {} USDC",
        cycle,
        report.subjects.len(),
        atomic_to_usd(report.spent_atomic)
    );
    println!("  {:<10} {:<8} {:>5}  {}", "Subject", "Signal", "Conf", "Rationale");
    println!("  {}", "-".repeat(80));
    for outcome in &report.subjects {
        match outcome {
            SubjectOutcome::Signal(s) => println!(
                "  {:<10} {:<8} {:>5.2}  {}",
                s.subject,
                s.classification,
                s.confidence,
                truncate(&s.rationale, RATIONALE_WIDTH)
            ),
            SubjectOutcome::Aborted(a) => println!(
                "  {:<10} {:<8} {:>5}  {}: {}",
                a.subject, "ABORTED", "-", a.stage, a.reason
            ),
        }
    }
}

fn print_outcome(outcome: &CallOutcome) -> anyhow::Result<()> {
    match outcome {
        CallOutcome::Paid {
            payload,
            amount_atomic,
            ..
        } => {
            match payload.json() {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Err(_) => println!("{}", payload.text()),
            }
            if *amount_atomic > 0 {
                println!("\n  Paid {} USDC", atomic_to_usd(*amount_atomic));
            }
            if let Some(receipt) = &payload.settlement {
                println!("  Settlement: {}", receipt);
            }
            Ok(())
        }
        CallOutcome::Unauthenticated { quotes } => {
            print_quotes(quotes);
            println!("\n  No payment made. Set ALPHA_SIGNER_CMD to pay for priced calls.");
            Ok(())
        }
        CallOutcome::ServerError { status, body } => {
            anyhow::bail!("Research API error {}: {}", status, truncate(body, 300))
        }
        other => anyhow::bail!("Call {}", other),
    }
}

fn print_quotes(quotes: &[PriceQuote]) {
    println!("\nPayment required, {} option(s):", quotes.len());
    println!(
        "  {:>3}  {:<14} {:>10}  {:<44} {}",
        "#", "Network", "USDC", "Pay to", "Expires"
    );
    for (i, q) in quotes.iter().enumerate() {
        println!(
            "  {:>3}  {:<14} {:>10}  {:<44} {}",
            i + 1,
            q.network,
            atomic_to_usd(q.amount_atomic),
            q.pay_to,
            q.expiry
                .map(|e| e.format("%H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "-".into())
        );
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "\nStopped ({:?}) after {} cycle(s), {} failed",
        summary.stop, summary.cycles, summary.failures
    );
}

fn print_budget(budget: &BudgetGuard) {
    let state = budget.current_state();
    println!(
        "  Budget: {} of {} USDC spent, {} remaining",
        atomic_to_usd(state.spent_atomic),
        atomic_to_usd(state.ceiling_atomic),
        atomic_to_usd(state.remaining())
    );
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut)
}
