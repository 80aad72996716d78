// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token-threshold context policies: auto-compact and auto-clear.
//!
//! Both fire after counter updates, wait for the child to go idle, send the
//! provider command through the preferred write path, and then hold a
//! post-send guard so one threshold crossing produces one intervention.

use std::time::{Duration, Instant};

use crate::event::SessionEvent;

/// Guard after sending /compact.
pub const COMPACT_GUARD: Duration = Duration::from_secs(10);
/// Guard after sending /clear.
pub const CLEAR_GUARD: Duration = Duration::from_secs(5);

/// Which policy arm fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Compact,
    Clear,
}

/// What the session loop should do for a policy decision.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub kind: PolicyKind,
    /// Command to send, with any configured prompt appended.
    pub command: String,
    /// Zero the token counters after sending.
    pub resets_tokens: bool,
}

impl PolicyDecision {
    /// The event broadcast alongside this decision.
    pub fn event(&self) -> SessionEvent {
        match self.kind {
            PolicyKind::Compact => SessionEvent::AutoCompact,
            PolicyKind::Clear => SessionEvent::AutoClear,
        }
    }
}

/// One threshold-triggered arm (compact or clear).
#[derive(Debug, Clone)]
pub struct PolicyArm {
    pub enabled: bool,
    pub threshold: u64,
    /// Optional prompt appended to the command (compact only).
    pub prompt: Option<String>,
}

impl PolicyArm {
    pub fn disabled() -> Self {
        Self { enabled: false, threshold: 0, prompt: None }
    }
}

/// Combined policy state for one session.
#[derive(Debug)]
pub struct ContextPolicy {
    compact: PolicyArm,
    clear: PolicyArm,
    /// A send is pending: the threshold tripped and we are waiting for idle.
    pending: Option<PolicyKind>,
    guard_until: Option<Instant>,
}

impl ContextPolicy {
    pub fn new(compact: PolicyArm, clear: PolicyArm) -> Self {
        Self { compact, clear, pending: None, guard_until: None }
    }

    pub fn compact_arm(&self) -> &PolicyArm {
        &self.compact
    }

    pub fn clear_arm(&self) -> &PolicyArm {
        &self.clear
    }

    pub fn set_compact(&mut self, arm: PolicyArm) {
        self.compact = arm;
    }

    pub fn set_clear(&mut self, arm: PolicyArm) {
        self.clear = arm;
    }

    /// Whether an intervention is armed and waiting for idle.
    pub fn in_progress(&self) -> bool {
        self.pending.is_some()
    }

    /// Evaluate after a counter update. Arms at most one pending
    /// intervention; auto-clear wins when both thresholds are crossed
    /// (clearing makes compaction moot).
    pub fn on_tokens(&mut self, combined: u64, now: Instant) {
        if self.pending.is_some() {
            return;
        }
        if let Some(until) = self.guard_until {
            if now < until {
                return;
            }
        }
        if self.clear.enabled && self.clear.threshold > 0 && combined >= self.clear.threshold {
            self.pending = Some(PolicyKind::Clear);
        } else if self.compact.enabled
            && self.compact.threshold > 0
            && combined >= self.compact.threshold
        {
            self.pending = Some(PolicyKind::Compact);
        }
    }

    /// Poll a pending intervention. Returns a decision once the child is
    /// idle; the caller sends the command and reports via `sent`.
    pub fn poll(&mut self, idle: bool, stopped: bool, now: Instant) -> Option<PolicyDecision> {
        if stopped {
            self.pending = None;
            return None;
        }
        if let Some(until) = self.guard_until {
            if now < until {
                return None;
            }
        }
        let kind = self.pending?;
        if !idle {
            return None;
        }
        Some(match kind {
            PolicyKind::Compact => {
                let command = match self.compact.prompt.as_deref() {
                    Some(prompt) if !prompt.is_empty() => format!("/compact {prompt}"),
                    _ => "/compact".to_owned(),
                };
                PolicyDecision { kind, command, resets_tokens: false }
            }
            PolicyKind::Clear => {
                PolicyDecision { kind, command: "/clear".to_owned(), resets_tokens: true }
            }
        })
    }

    /// The decision's command was written; start the post-send guard.
    pub fn sent(&mut self, kind: PolicyKind, now: Instant) {
        self.pending = None;
        let guard = match kind {
            PolicyKind::Compact => COMPACT_GUARD,
            PolicyKind::Clear => CLEAR_GUARD,
        };
        self.guard_until = Some(now + guard);
    }

    /// Drop any pending intervention (session stopping).
    pub fn cancel(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
#[path = "policy_tests.rs"]
mod tests;
