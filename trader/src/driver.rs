//! Long-running driver for `trader loop`.
//!
//! Each cycle classifies the current instant, runs the cycle step on the
//! blocking pool when admitted, and sleeps for the configured interval. A
//! shutdown signal stops the loop at the next suspension point; an in-flight
//! cycle is always allowed to finish so its ledger lock is released normally.

use std::future::Future;
use std::ops::AddAssign;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument};

use crate::core::calendar::Clock;
use crate::core::markets::MarketId;
use crate::core::scheduler::MarketScheduler;
use crate::cycle::CycleStep;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    pub market: MarketId,
    pub interval: Duration,
    /// Skip cycles outside trading sessions (including weekends).
    pub only_trading_hours: bool,
    /// Stop after this many cycles; `None` runs until shutdown.
    pub max_cycles: Option<u64>,
}

/// Counters reported when the driver stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverSummary {
    pub cycles: u64,
    pub sessions_run: u64,
    pub sessions_failed: u64,
    pub skipped: u64,
}

impl AddAssign for DriverSummary {
    fn add_assign(&mut self, other: Self) {
        self.cycles += other.cycles;
        self.sessions_run += other.sessions_run;
        self.sessions_failed += other.sessions_failed;
        self.skipped += other.skipped;
    }
}

/// Run cycles until `shutdown` resolves or `max_cycles` is reached.
///
/// Cycle failures (including panics) are logged and counted; they never end the
/// loop. Only an unknown market, which validated config rules out, is returned
/// as an error.
#[instrument(skip_all, fields(market = %config.market, interval_secs = config.interval.as_secs()))]
pub async fn run_driver<C, K, F>(
    config: &DriverConfig,
    scheduler: &MarketScheduler,
    clock: &K,
    step: C,
    shutdown: F,
) -> Result<DriverSummary>
where
    C: CycleStep,
    K: Clock + ?Sized,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut step = Some(step);
    let mut summary = DriverSummary::default();
    let mut stopping = false;

    loop {
        summary.cycles += 1;
        let session = scheduler.classify(&config.market, clock.now())?;

        if config.only_trading_hours && !session.is_trading {
            summary.skipped += 1;
            debug!(
                cycle = summary.cycles,
                session = %session.session_name,
                local_time = %session.local_time,
                "outside trading hours, skipping"
            );
        } else {
            info!(cycle = summary.cycles, session = %session.session_name, "starting cycle");
            let mut current = step
                .take()
                .ok_or_else(|| anyhow!("cycle step unavailable"))?;
            let mut handle = tokio::task::spawn_blocking(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| current.run_cycle(&session)))
                    .unwrap_or_else(|_| Err(anyhow!("cycle panicked")));
                (current, result)
            });

            let joined = tokio::select! {
                joined = &mut handle => joined,
                () = &mut shutdown, if !stopping => {
                    stopping = true;
                    info!("shutdown requested, waiting for the current cycle to finish");
                    (&mut handle).await
                }
            };
            let (returned, result) = joined.context("join cycle task")?;
            step = Some(returned);

            match result {
                Ok(()) => summary.sessions_run += 1,
                Err(err) => {
                    summary.sessions_failed += 1;
                    error!(cycle = summary.cycles, err = %format!("{err:#}"), "cycle failed");
                }
            }
        }

        if stopping || config.max_cycles.is_some_and(|max| summary.cycles >= max) {
            break;
        }

        tokio::select! {
            () = tokio::time::sleep(config.interval) => {}
            () = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
        }
    }

    info!(
        cycles = summary.cycles,
        sessions_run = summary.sessions_run,
        sessions_failed = summary.sessions_failed,
        skipped = summary.skipped,
        "driver stopped"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::markets::MarketTable;
    use crate::core::scheduler::MarketSession;
    use crate::test_support::FixedClock;
    use chrono::{TimeZone, Utc};
    use std::future;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    /// Cycle step that counts calls and fails or panics on chosen calls.
    struct CountingCycle {
        calls: Arc<AtomicU64>,
        fail_on: Option<u64>,
        panic_on: Option<u64>,
        work: Duration,
    }

    impl CountingCycle {
        fn new(calls: &Arc<AtomicU64>) -> Self {
            Self {
                calls: Arc::clone(calls),
                fail_on: None,
                panic_on: None,
                work: Duration::ZERO,
            }
        }
    }

    impl CycleStep for CountingCycle {
        fn run_cycle(&mut self, _session: &MarketSession) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            thread::sleep(self.work);
            if self.panic_on == Some(call) {
                panic!("scripted panic");
            }
            if self.fail_on == Some(call) {
                return Err(anyhow!("scripted failure"));
            }
            Ok(())
        }
    }

    fn config(max_cycles: Option<u64>, interval: Duration) -> DriverConfig {
        DriverConfig {
            market: MarketId::new("HK").unwrap(),
            interval,
            only_trading_hours: true,
            max_cycles,
        }
    }

    fn scheduler() -> MarketScheduler {
        MarketScheduler::new(MarketTable::builtin())
    }

    /// Monday 2024-03-04 10:00 Hong Kong.
    fn trading_clock() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2024, 3, 4, 2, 0, 0).unwrap())
    }

    /// Saturday 2024-03-02 10:00 Hong Kong.
    fn weekend_clock() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2024, 3, 2, 2, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn runs_admitted_cycles() {
        let calls = Arc::new(AtomicU64::new(0));
        let summary = run_driver(
            &config(Some(3), Duration::from_millis(1)),
            &scheduler(),
            &trading_clock(),
            CountingCycle::new(&calls),
            future::pending(),
        )
        .await
        .expect("driver");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            summary,
            DriverSummary {
                cycles: 3,
                sessions_run: 3,
                sessions_failed: 0,
                skipped: 0,
            }
        );
    }

    #[tokio::test]
    async fn weekend_cycles_are_skipped() {
        let calls = Arc::new(AtomicU64::new(0));
        let summary = run_driver(
            &config(Some(2), Duration::from_millis(1)),
            &scheduler(),
            &weekend_clock(),
            CountingCycle::new(&calls),
            future::pending(),
        )
        .await
        .expect("driver");

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.skipped, 2);
    }

    #[tokio::test]
    async fn all_hours_runs_on_weekends() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut config = config(Some(1), Duration::from_millis(1));
        config.only_trading_hours = false;

        run_driver(
            &config,
            &scheduler(),
            &weekend_clock(),
            CountingCycle::new(&calls),
            future::pending(),
        )
        .await
        .expect("driver");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_and_panics_do_not_stop_the_loop() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut counting = CountingCycle::new(&calls);
        counting.fail_on = Some(1);
        counting.panic_on = Some(2);

        let summary = run_driver(
            &config(Some(4), Duration::from_millis(1)),
            &scheduler(),
            &trading_clock(),
            counting,
            future::pending(),
        )
        .await
        .expect("driver");

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(summary.sessions_failed, 2);
        assert_eq!(summary.sessions_run, 2);
    }

    #[tokio::test]
    async fn shutdown_during_sleep_ends_the_loop() {
        let calls = Arc::new(AtomicU64::new(0));
        let summary = run_driver(
            &config(None, Duration::from_secs(3600)),
            &scheduler(),
            &trading_clock(),
            CountingCycle::new(&calls),
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await
        .expect("driver");

        assert_eq!(summary.cycles, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_during_a_cycle_lets_it_finish() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut counting = CountingCycle::new(&calls);
        counting.work = Duration::from_millis(200);

        let summary = run_driver(
            &config(None, Duration::from_secs(3600)),
            &scheduler(),
            &trading_clock(),
            counting,
            tokio::time::sleep(Duration::from_millis(20)),
        )
        .await
        .expect("driver");

        assert_eq!(summary.cycles, 1);
        assert_eq!(summary.sessions_run, 1);
    }
}
