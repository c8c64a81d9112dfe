//! System and task prompts rendered from templates.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::markets::MarketSpec;
use crate::core::scheduler::MarketSession;
use crate::core::types::Account;

const TRADING_TEMPLATE: &str = include_str!("prompts/trading.md");
const ANALYSIS_TEMPLATE: &str = include_str!("prompts/analysis.md");
const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

/// Symbols shown in a prompt; the full list still goes to the ledger.
pub const WATCH_LIST_LIMIT: usize = 20;

/// Everything a prompt needs to know about the account and the moment.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub account: &'a Account,
    pub spec: &'a MarketSpec,
    pub symbols: &'a [String],
    pub stop_token: &'a str,
    pub session: &'a MarketSession,
}

impl PromptInputs<'_> {
    fn watch_list(&self) -> Vec<String> {
        self.symbols
            .iter()
            .take(WATCH_LIST_LIMIT)
            .map(|symbol| self.spec.qualify_symbol(symbol))
            .collect()
    }

    fn current_time(&self) -> String {
        self.session.local_time.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptRenderer {
    env: Environment<'static>,
}

impl PromptRenderer {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("trading", TRADING_TEMPLATE)
            .context("load trading template")?;
        env.add_template("analysis", ANALYSIS_TEMPLATE)
            .context("load analysis template")?;
        env.add_template("task", TASK_TEMPLATE)
            .context("load task template")?;
        Ok(Self { env })
    }

    /// System prompt for a trading session.
    pub fn trading_system(&self, input: &PromptInputs<'_>) -> Result<String> {
        let watch_list = input.watch_list();
        let windows: Vec<String> = input.spec.windows.iter().map(ToString::to_string).collect();
        let rendered = self
            .env
            .get_template("trading")?
            .render(context! {
                market => input.account.market.as_str(),
                signature => &input.account.signature,
                trade_env => input.account.trade_env.as_str(),
                timezone => input.spec.zone.name(),
                windows => windows,
                current_time => input.current_time(),
                example_symbol => watch_list.first().cloned().unwrap_or_default(),
                watch_list => watch_list,
                symbol_count => input.symbols.len(),
                stop_token => input.stop_token,
            })
            .context("render trading prompt")?;
        debug!(bytes = rendered.len(), "rendered trading prompt");
        Ok(rendered)
    }

    /// Initial user turn for a trading session.
    pub fn trading_task(&self, input: &PromptInputs<'_>) -> Result<String> {
        let rendered = self
            .env
            .get_template("task")?
            .render(context! {
                market => input.account.market.as_str(),
                session_name => &input.session.session_name,
                local_time => input.current_time(),
                timezone => input.spec.zone.name(),
            })
            .context("render task prompt")?;
        Ok(rendered.trim().to_string())
    }

    /// System prompt for an analysis-only session.
    pub fn analysis_system(&self, input: &PromptInputs<'_>) -> Result<String> {
        self.env
            .get_template("analysis")?
            .render(context! {
                market => input.account.market.as_str(),
                timezone => input.spec.zone.name(),
                current_time => input.current_time(),
                watch_list => input.watch_list(),
                stop_token => input.stop_token,
            })
            .context("render analysis prompt")
    }
}
