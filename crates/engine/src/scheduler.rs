//! Periodic, cancellable task driver
//!
//! Runs a task once immediately and then every `interval` until cancelled or
//! a cycle limit is reached. Each cycle is isolated: an `Err` or a panic is
//! reported on the event channel and the next cycle still runs.

use futures_util::FutureExt;
use rand::Rng;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handed to the task on every cycle
#[derive(Debug, Clone)]
pub struct CycleContext {
    /// 1-based cycle number
    pub cycle: u64,
    /// Child of the scheduler's token; cancelled together with the handle
    pub cancel: CancellationToken,
}

/// Stretch the interval after repeated failures
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Consecutive failures before the interval starts growing
    pub after_failures: u32,
    pub factor: f64,
    pub max_interval: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub max_cycles: Option<u64>,
    pub backoff: Option<Backoff>,
    /// Upper bound of a random delay added to every wait
    pub jitter: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum StopReason {
    Cancelled,
    MaxCycles,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RunSummary {
    pub cycles: u64,
    pub failures: u64,
    pub stop: StopReason,
}

#[derive(Debug)]
pub enum CycleEvent<T> {
    Completed {
        cycle: u64,
        output: T,
    },
    Failed {
        cycle: u64,
        error: String,
        consecutive_failures: u32,
    },
    Stopped(RunSummary),
}

pub struct SchedulerHandle<T> {
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedReceiver<CycleEvent<T>>>,
    join: JoinHandle<RunSummary>,
}

impl<T> SchedulerHandle<T> {
    /// Stop after the current cycle; interrupts the inter-cycle wait and
    /// cancels the in-flight cycle's token.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Event stream; can be taken once
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<CycleEvent<T>>> {
        self.events.take()
    }

    pub async fn join(self) -> anyhow::Result<RunSummary> {
        Ok(self.join.await?)
    }
}

/// Spawn the scheduling loop on the current tokio runtime
pub fn run<T, F, Fut>(task: F, interval: Duration, options: ScheduleOptions) -> SchedulerHandle<T>
where
    T: Send + 'static,
    F: FnMut(CycleContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let join = tokio::spawn(drive(task, interval, options, cancel.clone(), tx));
    SchedulerHandle {
        cancel,
        events: Some(rx),
        join,
    }
}

async fn drive<T, F, Fut>(
    mut task: F,
    interval: Duration,
    options: ScheduleOptions,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<CycleEvent<T>>,
) -> RunSummary
where
    F: FnMut(CycleContext) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut cycles = 0u64;
    let mut failures = 0u64;
    let mut consecutive = 0u32;
    let reached_limit = |cycles: u64| options.max_cycles.map(|max| cycles >= max).unwrap_or(false);

    info!(interval_secs = interval.as_secs_f64(), max_cycles = ?options.max_cycles, "Scheduler starting");

    let stop = loop {
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }
        if reached_limit(cycles) {
            break StopReason::MaxCycles;
        }

        cycles += 1;
        let ctx = CycleContext {
            cycle: cycles,
            cancel: cancel.child_token(),
        };
        let task = &mut task;
        let result = AssertUnwindSafe(async move { task(ctx).await })
            .catch_unwind()
            .await;

        let error = match result {
            Ok(Ok(output)) => {
                consecutive = 0;
                debug!(cycle = cycles, "Cycle completed");
                let _ = events.send(CycleEvent::Completed {
                    cycle: cycles,
                    output,
                });
                None
            }
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(panic) => Some(format!("cycle panicked: {}", panic_message(panic.as_ref()))),
        };
        if let Some(error) = error {
            consecutive = consecutive.saturating_add(1);
            failures += 1;
            warn!(cycle = cycles, consecutive, error = %error, "Cycle failed");
            let _ = events.send(CycleEvent::Failed {
                cycle: cycles,
                error,
                consecutive_failures: consecutive,
            });
        }

        if reached_limit(cycles) {
            break StopReason::MaxCycles;
        }

        let wait = next_interval(interval, consecutive, options.backoff.as_ref()) + jitter(options.jitter);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break StopReason::Cancelled,
            _ = tokio::time::sleep(wait) => {}
        }
    };

    let summary = RunSummary {
        cycles,
        failures,
        stop,
    };
    info!(cycles, failures, stop = ?stop, "Scheduler stopped");
    let _ = events.send(CycleEvent::Stopped(summary.clone()));
    summary
}

/// Interval to wait after a cycle that left `consecutive` failures in a row
pub fn next_interval(base: Duration, consecutive: u32, backoff: Option<&Backoff>) -> Duration {
    let Some(backoff) = backoff else {
        return base;
    };
    if consecutive == 0 || consecutive < backoff.after_failures {
        return base;
    }
    let steps = (consecutive - backoff.after_failures.min(consecutive)) as i32 + 1;
    let cap = backoff.max_interval.max(base);
    Duration::try_from_secs_f64(base.as_secs_f64() * backoff.factor.powi(steps))
        .map(|d| d.min(cap))
        .unwrap_or(cap)
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetGuard;
    use crate::client::{CallOptions, PaidHttpClient};
    use crate::testing::{MockSigner, MockTransport};
    use crate::types::{CallOutcome, Endpoint, FailureReason};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn drain<T>(rx: &mut mpsc::UnboundedReceiver<CycleEvent<T>>) -> Vec<CycleEvent<T>> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_immediately_then_every_interval() {
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let start = Instant::now();

        let handle = run(
            move |ctx: CycleContext| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(ctx.cycle)
                }
            },
            Duration::from_secs(300),
            ScheduleOptions {
                max_cycles: Some(3),
                ..Default::default()
            },
        );
        let summary = handle.join().await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(
            summary,
            RunSummary {
                cycles: 3,
                failures: 0,
                stop: StopReason::MaxCycles
            }
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(600));
        assert!(elapsed < Duration::from_secs(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_and_panics_are_isolated() {
        let mut handle = run(
            |ctx: CycleContext| async move {
                match ctx.cycle {
                    2 => anyhow::bail!("upstream 503"),
                    3 => panic!("bad payload"),
                    n => Ok(n),
                }
            },
            Duration::from_secs(1),
            ScheduleOptions {
                max_cycles: Some(4),
                ..Default::default()
            },
        );
        let mut rx = handle.take_events().unwrap();
        let summary = handle.join().await.unwrap();

        assert_eq!(summary.cycles, 4);
        assert_eq!(summary.failures, 2);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 5);
        assert!(matches!(events[0], CycleEvent::Completed { cycle: 1, output: 1 }));
        match &events[1] {
            CycleEvent::Failed { cycle, error, consecutive_failures } => {
                assert_eq!(*cycle, 2);
                assert!(error.contains("upstream 503"));
                assert_eq!(*consecutive_failures, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &events[2] {
            CycleEvent::Failed { error, consecutive_failures, .. } => {
                assert!(error.contains("bad payload"));
                assert_eq!(*consecutive_failures, 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(events[3], CycleEvent::Completed { cycle: 4, output: 4 }));
        assert!(matches!(events[4], CycleEvent::Stopped(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_wait_stops_invocations() {
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let handle = run(
            move |_ctx: CycleContext| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            Duration::from_secs(60),
            ScheduleOptions::default(),
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        handle.cancel();
        assert!(handle.is_cancelled());
        let summary = handle.join().await.unwrap();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(summary.stop, StopReason::Cancelled);
        assert_eq!(summary.cycles, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_reaches_in_flight_call_before_commit() {
        let transport = Arc::new(MockTransport::new());
        transport.priced("/alpha/deep", 150_000, serde_json::json!({"data": {}}));
        transport.delay("/alpha/deep", Duration::from_secs(10));
        let client = Arc::new(
            PaidHttpClient::new(
                transport.clone(),
                "https://api.test",
                Arc::new(BudgetGuard::per_cycle(1_000_000)),
            )
            .with_signer(Arc::new(MockSigner::valid())),
        );

        let task_client = client.clone();
        let mut handle = run(
            move |ctx: CycleContext| {
                let client = task_client.clone();
                async move {
                    let endpoint = Endpoint::get("deep", "/alpha/deep")
                        .with_timeout(Duration::from_secs(120));
                    let opts = CallOptions {
                        cycle_budget: None,
                        cancel: Some(&ctx.cancel),
                    };
                    Ok(client.call_with(&endpoint, &[], opts).await)
                }
            },
            Duration::from_secs(300),
            ScheduleOptions::default(),
        );
        let mut rx = handle.take_events().unwrap();

        // Probe returns at 10s; cancel while the authorized retry is in flight
        tokio::time::sleep(Duration::from_secs(15)).await;
        handle.cancel();
        handle.join().await.unwrap();

        let events = drain(&mut rx);
        match &events[0] {
            CycleEvent::Completed { output, .. } => assert!(matches!(
                output,
                CallOutcome::TransportFailed(FailureReason::Cancelled)
            )),
            other => panic!("unexpected event {:?}", other),
        }
        let state = client.budget().current_state();
        assert_eq!(state.spent_atomic, 0);
        assert_eq!(state.reserved_atomic, 0);
        assert_eq!(transport.calls_to("/alpha/deep"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_stretches_wait_and_resets() {
        let start = Instant::now();
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = stamps.clone();
        let handle = run(
            move |ctx: CycleContext| {
                recorder.lock().unwrap().push(start.elapsed().as_secs());
                async move {
                    if ctx.cycle <= 3 {
                        anyhow::bail!("down");
                    }
                    Ok(())
                }
            },
            Duration::from_secs(10),
            ScheduleOptions {
                max_cycles: Some(5),
                backoff: Some(Backoff {
                    after_failures: 2,
                    factor: 2.0,
                    max_interval: Duration::from_secs(30),
                }),
                jitter: Duration::ZERO,
            },
        );
        handle.join().await.unwrap();

        // waits: 10 (1 failure), 20 (2), 30 capped (3), 10 after success
        assert_eq!(*stamps.lock().unwrap(), vec![0, 10, 30, 60, 70]);
    }

    #[test]
    fn test_next_interval() {
        let base = Duration::from_secs(60);
        let backoff = Backoff {
            after_failures: 1,
            factor: 2.0,
            max_interval: Duration::from_secs(600),
        };
        assert_eq!(next_interval(base, 5, None), base);
        assert_eq!(next_interval(base, 0, Some(&backoff)), base);
        assert_eq!(next_interval(base, 1, Some(&backoff)), Duration::from_secs(120));
        assert_eq!(next_interval(base, 3, Some(&backoff)), Duration::from_secs(480));
        assert_eq!(next_interval(base, 40, Some(&backoff)), Duration::from_secs(600));

        let explosive = Backoff {
            after_failures: 1,
            factor: f64::MAX,
            max_interval: Duration::from_secs(600),
        };
        assert_eq!(next_interval(base, 9, Some(&explosive)), Duration::from_secs(600));
    }

    #[test]
    fn test_jitter_bounded() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..50 {
            assert!(jitter(Duration::from_millis(250)) <= Duration::from_millis(250));
        }
    }
}
