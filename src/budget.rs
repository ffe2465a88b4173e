use serde::{Deserialize, Serialize};

use crate::types::ChatMessage;

fn default_tokens() -> u64 {
    10_000
}

fn default_turns() -> usize {
    20
}

/// Limits applied to one trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_tokens")]
    pub tokens: u64,
    #[serde(default = "default_turns")]
    pub turns: usize,
    /// Tool-call rounds consume a conversational turn as well.
    #[serde(default)]
    pub count_tool_turns: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            tokens: default_tokens(),
            turns: default_turns(),
            count_tool_turns: false,
        }
    }
}

impl BudgetConfig {
    pub fn new(tokens: u64, turns: usize) -> Self {
        Self {
            tokens,
            turns,
            count_tool_turns: false,
        }
    }
}

/// Point-in-time copy of a trial's budget, stored with every trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub token_limit: u64,
    pub turn_limit: usize,
    pub tokens_used: u64,
    pub turns_used: usize,
    pub tool_calls: usize,
}

impl BudgetSnapshot {
    pub fn within_limits(&self) -> bool {
        self.tokens_used <= self.token_limit && self.turns_used <= self.turn_limit
    }
}

/// Live budget owned by the runner for the duration of one trial.
///
/// Consumption is checked before it is accepted, so `tokens_used <=
/// token_limit` and `turns_used <= turn_limit` hold after every call.
#[derive(Debug, Clone)]
pub struct Budget {
    config: BudgetConfig,
    tokens_used: u64,
    turns_used: usize,
    tool_calls: usize,
}

impl Budget {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            tokens_used: 0,
            turns_used: 0,
            tool_calls: 0,
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used
    }

    pub fn turns_used(&self) -> usize {
        self.turns_used
    }

    pub fn turns_exhausted(&self) -> bool {
        self.turns_used >= self.config.turns
    }

    pub fn fits(&self, tokens: u64, consumes_turn: bool) -> bool {
        let tokens_ok = self
            .tokens_used
            .checked_add(tokens)
            .is_some_and(|total| total <= self.config.tokens);
        let turns_ok = !consumes_turn || self.turns_used < self.config.turns;
        tokens_ok && turns_ok
    }

    /// Accepts the consumption if it fits; returns `false` and leaves the
    /// budget untouched otherwise.
    pub fn try_accept(&mut self, tokens: u64, consumes_turn: bool) -> bool {
        if !self.fits(tokens, consumes_turn) {
            return false;
        }
        self.tokens_used += tokens;
        if consumes_turn {
            self.turns_used += 1;
        }
        true
    }

    pub fn record_tool_calls(&mut self, count: usize) {
        self.tool_calls += count;
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            token_limit: self.config.tokens,
            turn_limit: self.config.turns,
            tokens_used: self.tokens_used,
            turns_used: self.turns_used,
            tool_calls: self.tool_calls,
        }
    }
}

/// Rough token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Tokens charged for an assistant message: its text plus the argument
/// payload of any tool calls it carries.
pub fn estimate_message_tokens(message: &ChatMessage) -> u64 {
    let text = estimate_tokens(message.text().unwrap_or_default());
    let calls: u64 = message
        .tool_calls
        .iter()
        .map(|call| {
            estimate_tokens(&call.function.name) + estimate_tokens(&call.function.canonical_arguments())
        })
        .sum();
    text + calls
}
