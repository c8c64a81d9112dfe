//! Test-only collaborators: scripted decisions, recorded sleeps, in-memory
//! transcripts, a fixed clock and a registered account in a temp directory.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::core::calendar::Clock;
use crate::core::conversation::{Conversation, Message, StepResponse};
use crate::core::markets::MarketId;
use crate::core::positions::PositionSnapshot;
use crate::core::types::{Account, TradeEnv};
use crate::io::decision::DecisionStep;
use crate::io::ledger::LedgerStore;
use crate::io::transcript::TranscriptSink;
use crate::retry::Sleeper;

/// Decision step that replays a script; `Err` entries become transient failures.
///
/// Once the script runs out it fails every call, unless built with
/// [`ScriptedDecisionStep::repeating`].
#[derive(Debug, Default)]
pub struct ScriptedDecisionStep {
    script: Mutex<VecDeque<Result<StepResponse, String>>>,
    repeat: Option<StepResponse>,
    calls: AtomicUsize,
}

impl ScriptedDecisionStep {
    pub fn new(script: impl IntoIterator<Item = Result<StepResponse, String>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            repeat: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn repeating(response: StepResponse) -> Self {
        Self {
            repeat: Some(response),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DecisionStep for ScriptedDecisionStep {
    fn step(&self, _conversation: &Conversation) -> Result<StepResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("script lock poisoned"))?
            .pop_front();
        match (next, &self.repeat) {
            (Some(Ok(response)), _) => Ok(response),
            (Some(Err(message)), _) => Err(anyhow!(message)),
            (None, Some(response)) => Ok(response.clone()),
            (None, None) => Err(anyhow!("decision script exhausted")),
        }
    }
}

/// Sleeper that records requested durations instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .map(|slept| slept.clone())
            .unwrap_or_default()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
    }
}

/// Transcript kept in memory, one batch per `append`.
#[derive(Debug, Clone, Default)]
pub struct MemoryTranscript {
    session_id: String,
    batches: Vec<Vec<Message>>,
}

impl MemoryTranscript {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            batches: Vec::new(),
        }
    }

    pub fn batches(&self) -> &[Vec<Message>] {
        &self.batches
    }
}

impl TranscriptSink for MemoryTranscript {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn append(&mut self, messages: &[Message]) -> Result<()> {
        self.batches.push(messages.to_vec());
        Ok(())
    }
}

/// Clock stuck at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Registered account in a temporary data directory.
pub struct TestAccount {
    pub dir: tempfile::TempDir,
    pub store: LedgerStore,
    pub account: Account,
}

impl TestAccount {
    /// Register `signature` on `market` with `cash` and zero of each symbol.
    pub fn register(signature: &str, market: &str, cash: Decimal, symbols: &[&str]) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let store = LedgerStore::new(dir.path());
        let account = Account {
            signature: signature.to_string(),
            market: MarketId::new(market)?,
            trade_env: TradeEnv::Simulate,
        };
        store.register(&account, PositionSnapshot::initial(cash, symbols))?;
        Ok(Self {
            dir,
            store,
            account,
        })
    }
}
