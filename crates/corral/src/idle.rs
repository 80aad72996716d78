// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Multi-signal idle detection.
//!
//! Decides when the child has finished a conversational turn. Signals, in
//! rising order of confidence: quiet stream, completion message, stop hook,
//! idle prompt. The first three pass through a short confirmation window
//! (canceled by working patterns or substantial output); the idle-prompt
//! hook bypasses confirmation and the AI gate entirely.
//!
//! Pure synchronous state: every method takes `now` so the session loop owns
//! all timing and tests are deterministic.

use std::time::{Duration, Instant};

/// Printable characters above which a chunk counts as substantial output.
const SUBSTANTIAL_PRINTABLE: usize = 2;

/// What kicked off an idle confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleTrigger {
    CompletionMessage,
    StopHook,
    QuietStream,
    IdlePrompt,
}

impl IdleTrigger {
    /// Confidence reported with a confirmation. Hook signals are 100;
    /// consumers may only rely on the 100-vs-lower distinction.
    pub fn confidence(&self) -> u8 {
        match self {
            Self::IdlePrompt | Self::StopHook => 100,
            Self::CompletionMessage => 70,
            Self::QuietStream => 60,
        }
    }

    /// Hook-driven triggers skip the AI gate.
    pub fn bypasses_ai(&self) -> bool {
        matches!(self, Self::IdlePrompt)
    }
}

/// AI confirmation gate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiGateStatus {
    Ready,
    Checking,
    Cooldown,
    Disabled,
}

/// Result of polling the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePoll {
    /// No confirmation pending.
    Watching,
    /// Confirmation window running; poll again after `remaining`.
    Confirming { remaining: Duration },
    /// Window expired and the AI gate is open — caller must run the
    /// classifier and report back via `ai_result` / `ai_timeout`.
    StartAiCheck { trigger: IdleTrigger },
    /// A classifier invocation is in flight.
    AiChecking,
    /// The child is confidently idle.
    ConfirmedIdle { trigger: IdleTrigger, confidence: u8 },
}

/// Tunables for the detector.
#[derive(Debug, Clone)]
pub struct IdleSettings {
    pub completion_confirm: Duration,
    pub no_output_timeout: Duration,
    pub ai_enabled: bool,
    pub ai_cooldown: Duration,
}

/// Per-session idle detector state.
#[derive(Debug)]
pub struct IdleDetector {
    settings: IdleSettings,
    last_output: Option<Instant>,
    last_working: Option<Instant>,
    last_completion_message: Option<Instant>,
    /// Pending confirmation window: start time and its trigger.
    confirm: Option<(Instant, IdleTrigger)>,
    /// The current silence already produced a quiet-stream window; don't
    /// open another until fresh output arrives.
    quiet_latched: bool,
    /// Idle-prompt hook fired; reported on the next poll.
    forced: bool,
    ai_checking: Option<IdleTrigger>,
    ai_cooldown_until: Option<Instant>,
    stop_hook_seen: bool,
    idle_prompt_seen: bool,
}

impl IdleDetector {
    pub fn new(settings: IdleSettings) -> Self {
        Self {
            settings,
            last_output: None,
            last_working: None,
            last_completion_message: None,
            confirm: None,
            quiet_latched: false,
            forced: false,
            ai_checking: None,
            ai_cooldown_until: None,
            stop_hook_seen: false,
            idle_prompt_seen: false,
        }
    }

    /// Record a chunk of output. Substantial output (more than 2 printable
    /// characters) cancels a pending confirmation.
    pub fn note_output(&mut self, now: Instant, printable: usize) {
        self.last_output = Some(now);
        self.quiet_latched = false;
        if printable > SUBSTANTIAL_PRINTABLE {
            self.confirm = None;
        }
    }

    /// Record a working pattern: cancels confirmation outright.
    pub fn note_working(&mut self, now: Instant) {
        self.last_working = Some(now);
        self.confirm = None;
        self.forced = false;
    }

    /// Record a completion message and open a confirmation window.
    pub fn note_completion_message(&mut self, now: Instant) {
        self.last_completion_message = Some(now);
        if self.confirm.is_none() {
            self.confirm = Some((now, IdleTrigger::CompletionMessage));
        }
    }

    /// External stop-hook assertion (strong). Restarts the window under the
    /// stronger trigger even if a heuristic confirmation is pending.
    pub fn signal_stop_hook(&mut self, now: Instant) {
        self.stop_hook_seen = true;
        self.confirm = Some((now, IdleTrigger::StopHook));
    }

    /// External idle-prompt assertion (strongest): bypasses confirmation
    /// and the AI gate.
    pub fn signal_idle_prompt(&mut self) {
        self.idle_prompt_seen = true;
        self.forced = true;
        self.confirm = None;
    }

    /// Time since the last byte of output, if any was ever seen.
    pub fn quiet_for(&self, now: Instant) -> Option<Duration> {
        self.last_output.map(|at| now.duration_since(at))
    }

    pub fn last_completion_message(&self) -> Option<Instant> {
        self.last_completion_message
    }

    pub fn last_working(&self) -> Option<Instant> {
        self.last_working
    }

    pub fn stop_hook_seen(&self) -> bool {
        self.stop_hook_seen
    }

    pub fn idle_prompt_seen(&self) -> bool {
        self.idle_prompt_seen
    }

    pub fn ai_gate(&self, now: Instant) -> AiGateStatus {
        if !self.settings.ai_enabled {
            return AiGateStatus::Disabled;
        }
        if self.ai_checking.is_some() {
            return AiGateStatus::Checking;
        }
        match self.ai_cooldown_until {
            Some(until) if now < until => AiGateStatus::Cooldown,
            _ => AiGateStatus::Ready,
        }
    }

    /// Drop any pending confirmation and hook force (fresh watch phase).
    pub fn clear(&mut self) {
        self.confirm = None;
        self.forced = false;
        self.ai_checking = None;
    }

    /// Advance the detector. The session loop calls this whenever a timer
    /// fires or a signal lands, and acts on the returned verdict.
    pub fn poll(&mut self, now: Instant) -> IdlePoll {
        if self.forced {
            self.forced = false;
            self.confirm = None;
            let trigger = IdleTrigger::IdlePrompt;
            return IdlePoll::ConfirmedIdle { trigger, confidence: trigger.confidence() };
        }

        if self.ai_checking.is_some() {
            return IdlePoll::AiChecking;
        }

        // Quiet stream opens a (low-confidence) confirmation window, at
        // most once per silence.
        if self.confirm.is_none() && !self.quiet_latched {
            if let Some(quiet) = self.quiet_for(now) {
                if quiet >= self.settings.no_output_timeout {
                    self.quiet_latched = true;
                    self.confirm = Some((now, IdleTrigger::QuietStream));
                }
            }
        }

        let Some((started, trigger)) = self.confirm else {
            return IdlePoll::Watching;
        };

        let elapsed = now.duration_since(started);
        if elapsed < self.settings.completion_confirm {
            return IdlePoll::Confirming {
                remaining: self.settings.completion_confirm - elapsed,
            };
        }

        // Window expired.
        self.confirm = None;
        if !trigger.bypasses_ai() && self.ai_gate(now) == AiGateStatus::Ready {
            self.ai_checking = Some(trigger);
            return IdlePoll::StartAiCheck { trigger };
        }
        IdlePoll::ConfirmedIdle { trigger, confidence: trigger.confidence() }
    }

    /// Report the classifier verdict. `idle == true` confirms; either way
    /// the gate enters cooldown. Returns the confirmation, if any.
    pub fn ai_result(&mut self, now: Instant, idle: bool) -> Option<IdlePoll> {
        let trigger = self.ai_checking.take()?;
        self.ai_cooldown_until = Some(now + self.settings.ai_cooldown);
        if idle {
            Some(IdlePoll::ConfirmedIdle { trigger, confidence: trigger.confidence() })
        } else {
            None
        }
    }

    /// Classifier deadline elapsed: conservative, back to watching, cooldown.
    pub fn ai_timeout(&mut self, now: Instant) {
        self.ai_checking = None;
        self.ai_cooldown_until = Some(now + self.settings.ai_cooldown);
    }

    /// Earliest instant at which `poll` could change its answer, for timer
    /// scheduling. `None` means nothing is pending.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        if self.forced {
            return Some(now);
        }
        if let Some((started, _)) = self.confirm {
            return Some(started + self.settings.completion_confirm);
        }
        if self.ai_checking.is_some() || self.quiet_latched {
            return None;
        }
        self.last_output.map(|at| at + self.settings.no_output_timeout)
    }
}

#[cfg(test)]
#[path = "idle_tests.rs"]
mod tests;
