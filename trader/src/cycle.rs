//! What the driver runs on each admitted cycle.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::{error, info, instrument, warn};

use crate::core::conversation::Conversation;
use crate::core::markets::MarketSpec;
use crate::core::positions::PositionSnapshot;
use crate::core::scheduler::MarketSession;
use crate::core::types::{Account, SessionState};
use crate::io::broker::bare_symbol;
use crate::io::decision::DecisionStep;
use crate::io::ledger::{LedgerStore, Registration};
use crate::io::prompt::{PromptInputs, PromptRenderer};
use crate::io::transcript::TranscriptLog;
use crate::retry::Sleeper;
use crate::session::{SessionConfig, SessionOutcome, run_session};

const ANALYSIS_PREFIX: &str = "analysis_";

/// Work performed once per admitted driver cycle.
///
/// Runs on the blocking pool, so it must own everything it touches.
pub trait CycleStep: Send + 'static {
    fn run_cycle(&mut self, session: &MarketSession) -> Result<()>;
}

/// Register (idempotent), run one trading session, then log the position summary.
pub struct TradingCycle<D, S> {
    account: Account,
    spec: MarketSpec,
    symbols: Vec<String>,
    initial_cash: Decimal,
    store: LedgerStore,
    session: SessionConfig,
    prompts: PromptRenderer,
    decision: D,
    sleeper: S,
}

impl<D, S> TradingCycle<D, S>
where
    D: DecisionStep,
    S: Sleeper,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account: Account,
        spec: MarketSpec,
        symbols: &[String],
        initial_cash: Decimal,
        store: LedgerStore,
        session: SessionConfig,
        decision: D,
        sleeper: S,
    ) -> Result<Self> {
        let symbols = symbols
            .iter()
            .map(|symbol| bare_symbol(&spec, symbol))
            .collect();
        Ok(Self {
            account,
            spec,
            symbols,
            initial_cash,
            store,
            session,
            prompts: PromptRenderer::new()?,
            decision,
            sleeper,
        })
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Start the ledger with the configured cash and zero of every tracked symbol.
    pub fn register(&self) -> Result<Registration> {
        let initial = PositionSnapshot::initial(self.initial_cash, &self.symbols);
        Ok(self.store.register(&self.account, initial)?)
    }

    fn inputs<'a>(&'a self, session: &'a MarketSession) -> PromptInputs<'a> {
        PromptInputs {
            account: &self.account,
            spec: &self.spec,
            symbols: &self.symbols,
            stop_token: &self.session.stop_token,
            session,
        }
    }

    /// One trading session for the current market session.
    #[instrument(skip_all, fields(signature = %self.account.signature, market = %self.account.market, session = %session.session_name))]
    pub fn trade(&self, session: &MarketSession) -> Result<SessionOutcome> {
        self.register()?;

        let inputs = self.inputs(session);
        let system = self.prompts.trading_system(&inputs)?;
        let task = self.prompts.trading_task(&inputs)?;
        let paths = self.store.paths(&self.account.signature);
        let mut transcript = TranscriptLog::create(&paths.log_dir, "", &self.account)?;

        let outcome = run_session(
            Conversation::seeded(Some(system), &task),
            &self.session,
            &self.decision,
            &self.sleeper,
            &mut transcript,
        )?;
        info!(
            session_id = %outcome.session_id,
            state = ?outcome.state,
            steps = outcome.steps,
            "trading session finished"
        );
        if outcome.state == SessionState::StoppedByStepLimit {
            warn!(max_steps = self.session.max_steps, "session ended without a stop token");
        }
        self.log_positions()?;
        Ok(outcome)
    }

    /// One analysis-only session answering `query`. Never touches the ledger.
    #[instrument(skip_all, fields(signature = %self.account.signature, market = %self.account.market))]
    pub fn analyze(&self, query: &str, session: &MarketSession) -> Result<SessionOutcome> {
        let system = self.prompts.analysis_system(&self.inputs(session))?;
        let paths = self.store.paths(&self.account.signature);
        let mut transcript = TranscriptLog::create(&paths.log_dir, ANALYSIS_PREFIX, &self.account)?;
        run_session(
            Conversation::seeded(Some(system), query),
            &self.session,
            &self.decision,
            &self.sleeper,
            &mut transcript,
        )
        .context("analysis session")
    }

    fn log_positions(&self) -> Result<()> {
        let summary = self.store.summary(&self.account.signature)?;
        let held: Vec<String> = summary
            .latest
            .positions
            .holdings
            .iter()
            .filter(|(_, qty)| **qty != 0)
            .map(|(symbol, qty)| format!("{symbol}={qty}"))
            .collect();
        info!(
            cash = %summary.latest.positions.cash,
            holdings = %held.join(","),
            records = summary.total_records,
            as_of = %summary.latest.timestamp,
            "position summary"
        );
        Ok(())
    }
}

impl<D, S> CycleStep for TradingCycle<D, S>
where
    D: DecisionStep + Send + 'static,
    S: Sleeper + Send + 'static,
{
    fn run_cycle(&mut self, session: &MarketSession) -> Result<()> {
        self.trade(session).map(|_| ())
    }
}

/// Run `work` for every `(signature, item)` pair in order.
///
/// A failing account is logged and the remaining accounts still run. The first
/// failure is returned once every account has had its turn.
pub fn for_each_account<'a, T, I, F>(accounts: I, mut work: F) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, T)>,
    F: FnMut(T) -> Result<()>,
{
    let mut first_failure = None;
    let mut failed = 0usize;
    for (signature, item) in accounts {
        if let Err(err) = work(item) {
            failed += 1;
            error!(signature, err = %format!("{err:#}"), "account failed");
            first_failure.get_or_insert_with(|| err.context(format!("account {signature}")));
        }
    }
    match first_failure {
        None => Ok(()),
        Some(err) if failed == 1 => Err(err),
        Some(err) => Err(err.context(format!("{failed} accounts failed"))),
    }
}

/// Trading cycles for several accounts on the same market.
pub struct AccountFleet<D, S> {
    cycles: Vec<TradingCycle<D, S>>,
}

impl<D, S> AccountFleet<D, S>
where
    D: DecisionStep,
    S: Sleeper,
{
    pub fn new(cycles: Vec<TradingCycle<D, S>>) -> Self {
        Self { cycles }
    }

    pub fn cycles(&self) -> &[TradingCycle<D, S>] {
        &self.cycles
    }

    /// One trading session per account; a failing account does not stop the rest.
    pub fn trade_all(&self, session: &MarketSession) -> Result<()> {
        for_each_account(
            self.cycles
                .iter()
                .map(|cycle| (cycle.account.signature.as_str(), cycle)),
            |cycle| cycle.trade(session).map(|_| ()),
        )
    }
}

impl<D, S> CycleStep for AccountFleet<D, S>
where
    D: DecisionStep + Send + 'static,
    S: Sleeper + Send + 'static,
{
    fn run_cycle(&mut self, session: &MarketSession) -> Result<()> {
        self.trade_all(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conversation::StepResponse;
    use crate::core::markets::{MarketId, MarketTable};
    use crate::core::scheduler::MarketScheduler;
    use crate::core::types::TradeEnv;
    use crate::io::transcript::read_transcript;
    use crate::test_support::{RecordingSleeper, ScriptedDecisionStep};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn cycle(
        data_dir: &std::path::Path,
        decision: ScriptedDecisionStep,
    ) -> (TradingCycle<ScriptedDecisionStep, RecordingSleeper>, MarketSession) {
        named_cycle("gpt-us", data_dir, decision)
    }

    fn named_cycle(
        signature: &str,
        data_dir: &std::path::Path,
        decision: ScriptedDecisionStep,
    ) -> (TradingCycle<ScriptedDecisionStep, RecordingSleeper>, MarketSession) {
        let account = Account {
            signature: signature.to_string(),
            market: MarketId::new("US").unwrap(),
            trade_env: TradeEnv::Simulate,
        };
        let scheduler = MarketScheduler::new(MarketTable::builtin());
        // Monday 2024-03-04 15:00 UTC is 10:00 in New York.
        let session = scheduler
            .classify(&account.market, Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap())
            .unwrap();
        let spec = scheduler.table().get(&account.market).unwrap().clone();
        let cycle = TradingCycle::new(
            account,
            spec,
            &["aapl".to_string(), "US.msft".to_string()],
            dec!(5000),
            LedgerStore::new(data_dir),
            SessionConfig::default(),
            decision,
            RecordingSleeper::default(),
        )
        .unwrap();
        (cycle, session)
    }

    #[test]
    fn cycle_registers_then_runs_a_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut cycle, session) = cycle(
            temp.path(),
            ScriptedDecisionStep::new([Ok(StepResponse::text("hold <FINISH_SIGNAL>"))]),
        );

        cycle.run_cycle(&session).expect("cycle");
        cycle.run_cycle(&session).expect_err("script exhausted");

        let store = LedgerStore::new(temp.path());
        let entries = store.read_all("gpt-us").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].positions.cash, dec!(5000));
        assert_eq!(entries[0].positions.holdings.get("AAPL"), Some(&0));
        assert_eq!(entries[0].positions.holdings.get("MSFT"), Some(&0));

        let sessions: Vec<_> = std::fs::read_dir(store.paths("gpt-us").log_dir)
            .unwrap()
            .collect();
        assert_eq!(sessions.len(), 2);
    }

    #[test]
    fn transcript_starts_with_the_task_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (cycle, session) = cycle(
            temp.path(),
            ScriptedDecisionStep::new([Ok(StepResponse::text("<FINISH_SIGNAL>"))]),
        );

        let outcome = cycle.trade(&session).expect("trade");
        let path = LedgerStore::new(temp.path())
            .paths("gpt-us")
            .transcript_dir(&outcome.session_id)
            .join("log.jsonl");
        let entries = read_transcript(&path).unwrap();
        assert!(entries[0].messages[0].content.contains("REGULAR"));
        assert_eq!(entries[0].account.market.as_str(), "US");
        let system = outcome.conversation.system_prompt.expect("system prompt");
        assert!(system.contains("US.AAPL"));
    }

    #[test]
    fn analysis_does_not_register() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (cycle, session) = cycle(
            temp.path(),
            ScriptedDecisionStep::new([Ok(StepResponse::text("bullish <FINISH_SIGNAL>"))]),
        );

        let outcome = cycle.analyze("How is AAPL?", &session).expect("analyze");
        assert_eq!(outcome.final_text.as_deref(), Some("bullish"));
        assert!(outcome.session_id.starts_with("analysis_"));
        assert!(
            LedgerStore::new(temp.path())
                .read_all("gpt-us")
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn failing_account_does_not_stop_the_next() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (broken, session) =
            named_cycle("broken-us", temp.path(), ScriptedDecisionStep::default());
        let (healthy, _) = named_cycle(
            "healthy-us",
            temp.path(),
            ScriptedDecisionStep::new([Ok(StepResponse::text("hold <FINISH_SIGNAL>"))]),
        );
        let mut fleet = AccountFleet::new(vec![broken, healthy]);

        let err = fleet.run_cycle(&session).unwrap_err();
        assert!(format!("{err:#}").contains("account broken-us"), "{err:#}");

        let store = LedgerStore::new(temp.path());
        assert_eq!(store.read_all("healthy-us").unwrap().len(), 1);
        let sessions: Vec<_> = std::fs::read_dir(store.paths("healthy-us").log_dir)
            .unwrap()
            .collect();
        assert_eq!(sessions.len(), 1);
        assert_eq!(fleet.cycles()[1].decision.calls(), 1);
    }

    #[test]
    fn every_failure_is_counted() {
        let outcome = for_each_account([("a", 1), ("b", 2), ("c", 3)], |n| {
            if n == 2 {
                Ok(())
            } else {
                Err(anyhow::anyhow!("boom {n}"))
            }
        });
        let message = format!("{:#}", outcome.unwrap_err());
        assert!(message.starts_with("2 accounts failed"), "{message}");
        assert!(message.contains("account a"));
        assert!(message.contains("boom 1"));
    }
}
