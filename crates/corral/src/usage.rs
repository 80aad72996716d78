// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session token accounting.
//!
//! Counters only move forward; every update path validates against the
//! session and per-update ceilings before touching state, so a garbled
//! status line can never corrupt the totals.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{MAX_SESSION_TOKENS, MAX_TOKENS_PER_MESSAGE, MAX_TOKEN_DELTA};

/// Why a counter update was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageRejection {
    /// Update would push input+output past the session ceiling.
    SessionCeiling,
    /// A single message claimed more tokens than the per-message ceiling.
    PerMessageCeiling,
    /// A status-line delta exceeded the per-update ceiling.
    DeltaCeiling,
    /// Status-line total was not strictly greater than the current total.
    Stale,
    /// Restored values were negative or above the session ceiling.
    InvalidRestore,
}

/// Cumulative token counters and cost for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost_usd: f64,
}

impl TokenTotals {
    pub fn combined(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Validated accumulator over [`TokenTotals`].
#[derive(Debug, Default)]
pub struct TokenCounters {
    totals: TokenTotals,
}

impl TokenCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> &TokenTotals {
        &self.totals
    }

    pub fn combined(&self) -> u64 {
        self.totals.combined()
    }

    /// Apply a per-message usage delta (one-shot assistant messages).
    ///
    /// A message claiming more than the per-message ceiling on either side
    /// contributes nothing; an update that would cross the session ceiling
    /// is rejected whole.
    pub fn apply_message(&mut self, input: u64, output: u64) -> Result<(), UsageRejection> {
        if input > MAX_TOKENS_PER_MESSAGE || output > MAX_TOKENS_PER_MESSAGE {
            warn!(input, output, "dropping message usage above per-message ceiling");
            return Err(UsageRejection::PerMessageCeiling);
        }
        let next = self.totals.combined().saturating_add(input).saturating_add(output);
        if next > MAX_SESSION_TOKENS {
            warn!(next, "rejecting usage update above session ceiling");
            return Err(UsageRejection::SessionCeiling);
        }
        self.totals.input_tokens += input;
        self.totals.output_tokens += output;
        Ok(())
    }

    /// Apply a status-line total parsed from the terminal.
    ///
    /// Only totals strictly greater than the current combined count apply;
    /// the implied delta is capped; the total is distributed 60/40 across
    /// input/output (the status line reports a single number).
    pub fn apply_status_total(&mut self, total: u64) -> Result<(), UsageRejection> {
        let current = self.totals.combined();
        if total <= current {
            return Err(UsageRejection::Stale);
        }
        let delta = total - current;
        if delta > MAX_TOKEN_DELTA {
            warn!(delta, "rejecting status-line delta above per-update ceiling");
            return Err(UsageRejection::DeltaCeiling);
        }
        if total > MAX_SESSION_TOKENS {
            warn!(total, "rejecting status-line total above session ceiling");
            return Err(UsageRejection::SessionCeiling);
        }
        self.totals.input_tokens = (total as f64 * 0.6).round() as u64;
        self.totals.output_tokens = total - self.totals.input_tokens;
        Ok(())
    }

    /// Accumulate cost; negative deltas saturate to no-op.
    pub fn add_cost(&mut self, delta: f64) {
        if delta.is_finite() && delta > 0.0 {
            self.totals.total_cost_usd += delta;
        }
    }

    /// Zero the token counters (context cleared). Cost is preserved.
    pub fn reset_tokens(&mut self) {
        self.totals.input_tokens = 0;
        self.totals.output_tokens = 0;
    }

    /// Restore persisted counters, rejecting negatives and above-ceiling
    /// values. On rejection the counters are unchanged.
    pub fn restore(
        &mut self,
        input_tokens: i64,
        output_tokens: i64,
        total_cost_usd: f64,
    ) -> Result<(), UsageRejection> {
        if input_tokens < 0 || output_tokens < 0 {
            warn!(input_tokens, output_tokens, "rejecting negative restored counters");
            return Err(UsageRejection::InvalidRestore);
        }
        let (input, output) = (input_tokens as u64, output_tokens as u64);
        if input > MAX_SESSION_TOKENS || output > MAX_SESSION_TOKENS {
            warn!(input, output, "rejecting restored counters above session ceiling");
            return Err(UsageRejection::InvalidRestore);
        }
        if !total_cost_usd.is_finite() || total_cost_usd < 0.0 {
            warn!(total_cost_usd, "rejecting invalid restored cost");
            return Err(UsageRejection::InvalidRestore);
        }
        self.totals =
            TokenTotals { input_tokens: input, output_tokens: output, total_cost_usd };
        Ok(())
    }
}

#[cfg(test)]
#[path = "usage_tests.rs"]
mod tests;
