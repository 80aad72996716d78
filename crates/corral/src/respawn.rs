// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Respawn controller: drives a maintenance cycle (update → clear → init)
//! each time the idle detector confirms the child has finished a turn.
//!
//! Pure synchronous state machine. The session loop feeds it signals and
//! executes the actions it returns (writes, event broadcasts, counter
//! resets); all timing flows through explicit `now` arguments.

use std::time::{Duration, Instant};

use crate::event::{RespawnState, RespawnStep};

/// Controller tunables.
#[derive(Debug, Clone)]
pub struct RespawnSettings {
    /// Prompt sent by the update step.
    pub update_prompt: String,
    /// Send the provider clear command after the update step.
    pub send_clear: bool,
    /// Send the init command after the clear step.
    pub send_init: bool,
    pub clear_command: String,
    pub init_command: String,
    /// Bound on each waiting-* state, governed by the quiet-stream window.
    pub step_timeout: Duration,
    /// Pause between steps.
    pub inter_step_delay: Duration,
}

impl Default for RespawnSettings {
    fn default() -> Self {
        Self {
            update_prompt: "update all the docs".to_owned(),
            send_clear: true,
            send_init: false,
            clear_command: "/clear".to_owned(),
            init_command: "/init".to_owned(),
            step_timeout: Duration::from_secs(30),
            inter_step_delay: Duration::from_secs(1),
        }
    }
}

/// Side effects the session loop must carry out, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum RespawnAction {
    /// Broadcast a state change. `prev` is always the previously
    /// broadcast state — transitions are never skipped.
    Transition { next: RespawnState, prev: RespawnState },
    CycleStarted(u64),
    /// Write `input` (plus a trailing carriage return) via the preferred
    /// path, then report back with `step_sent`.
    SendStep { step: RespawnStep, input: String },
    /// The clear step was dispatched; token counters must be zeroed.
    ResetTokens,
    StepCompleted(RespawnStep),
    CycleCompleted,
    Log(String),
}

/// Why a waiting-* state ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEnd {
    Idle,
    Timeout,
}

/// The maintenance-cycle state machine.
#[derive(Debug)]
pub struct RespawnController {
    state: RespawnState,
    settings: RespawnSettings,
    cycle: u64,
    paused: bool,
    /// Deadline for the current waiting-* state.
    wait_deadline: Option<Instant>,
    /// A step queued behind the inter-step delay.
    pending_send: Option<(Instant, RespawnStep)>,
}

impl RespawnController {
    pub fn new(settings: RespawnSettings) -> Self {
        Self {
            state: RespawnState::Stopped,
            settings,
            cycle: 0,
            paused: false,
            wait_deadline: None,
            pending_send: None,
        }
    }

    pub fn state(&self) -> RespawnState {
        self.state
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Replace the settings; resets the cycle counter (explicit
    /// reconfiguration is the only thing that does).
    pub fn configure(&mut self, settings: RespawnSettings) {
        self.settings = settings;
        self.cycle = 0;
    }

    /// Begin watching. Only valid from stopped; otherwise a no-op.
    pub fn start(&mut self) -> Vec<RespawnAction> {
        if self.state != RespawnState::Stopped {
            return vec![];
        }
        vec![self.goto(RespawnState::Watching)]
    }

    /// Stop from any state: all deadlines cleared, no further actions.
    pub fn stop(&mut self) -> Vec<RespawnAction> {
        self.wait_deadline = None;
        self.pending_send = None;
        self.paused = false;
        if self.state == RespawnState::Stopped {
            return vec![];
        }
        vec![self.goto(RespawnState::Stopped)]
    }

    /// Freeze the machine in place.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Unfreeze. Only effective while watching; otherwise a no-op.
    pub fn resume(&mut self) {
        if self.state == RespawnState::Watching {
            self.paused = false;
        }
    }

    /// The idle detector opened a confirmation window.
    pub fn idle_confirming(&mut self) -> Vec<RespawnAction> {
        if self.paused || self.state != RespawnState::Watching {
            return vec![];
        }
        vec![self.goto(RespawnState::ConfirmingIdle)]
    }

    /// The idle detector handed the check to the AI classifier.
    pub fn ai_checking(&mut self) -> Vec<RespawnAction> {
        if self.paused || self.state != RespawnState::ConfirmingIdle {
            return vec![];
        }
        vec![self.goto(RespawnState::AiChecking)]
    }

    /// The idle detector confirmed idle.
    ///
    /// In watching/confirming/ai-checking this starts a new cycle; in a
    /// waiting-* state it completes the current step.
    pub fn confirmed_idle(&mut self, now: Instant) -> Vec<RespawnAction> {
        if self.paused {
            return vec![];
        }
        match self.state {
            RespawnState::Watching
            | RespawnState::ConfirmingIdle
            | RespawnState::AiChecking => {
                let mut actions = Vec::new();
                // A bypassing trigger (idle-prompt hook) can confirm straight
                // from watching; the machine still passes through
                // confirming_idle so observers never see a skipped state.
                if self.state == RespawnState::Watching {
                    actions.push(self.goto(RespawnState::ConfirmingIdle));
                }
                self.cycle += 1;
                actions.push(RespawnAction::CycleStarted(self.cycle));
                actions.push(RespawnAction::Log(format!(
                    "starting respawn cycle #{}",
                    self.cycle
                )));
                actions.push(self.goto(RespawnState::SendingUpdate));
                actions.push(RespawnAction::SendStep {
                    step: RespawnStep::Update,
                    input: self.settings.update_prompt.clone(),
                });
                actions
            }
            RespawnState::WaitingUpdate
            | RespawnState::WaitingClear
            | RespawnState::WaitingInit => self.finish_wait(now, StepEnd::Idle),
            _ => vec![],
        }
    }

    /// The session finished writing the current step's input.
    pub fn step_sent(&mut self, now: Instant) -> Vec<RespawnAction> {
        let next = match self.state {
            RespawnState::SendingUpdate => RespawnState::WaitingUpdate,
            RespawnState::SendingClear => RespawnState::WaitingClear,
            RespawnState::SendingInit => RespawnState::WaitingInit,
            _ => return vec![],
        };
        self.wait_deadline = Some(now + self.settings.step_timeout);
        vec![self.goto(next)]
    }

    /// A working pattern was observed.
    ///
    /// During idle confirmation this cancels back to watching. During a
    /// waiting-* state the child is expected to be working — the wait
    /// deadline is pushed out instead.
    pub fn working_detected(&mut self, now: Instant) -> Vec<RespawnAction> {
        match self.state {
            RespawnState::ConfirmingIdle | RespawnState::AiChecking => {
                vec![
                    RespawnAction::Log("working pattern during idle confirmation".to_owned()),
                    self.goto(RespawnState::Watching),
                ]
            }
            RespawnState::WaitingUpdate
            | RespawnState::WaitingClear
            | RespawnState::WaitingInit => {
                self.wait_deadline = Some(now + self.settings.step_timeout);
                vec![]
            }
            _ => vec![],
        }
    }

    /// Advance time: fire due step sends and expire wait deadlines.
    pub fn tick(&mut self, now: Instant) -> Vec<RespawnAction> {
        if self.paused {
            return vec![];
        }
        if let Some((due, step)) = self.pending_send {
            if now >= due {
                self.pending_send = None;
                return self.dispatch_step(step);
            }
        }
        if let Some(deadline) = self.wait_deadline {
            if now >= deadline {
                let step = self.current_wait_step();
                let mut actions = vec![RespawnAction::Log(format!(
                    "step {} timed out, treating as complete",
                    step.map(|s| s.as_str()).unwrap_or("?")
                ))];
                actions.extend(self.finish_wait(now, StepEnd::Timeout));
                return actions;
            }
        }
        vec![]
    }

    /// Earliest instant `tick` could act on, for timer scheduling.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.paused {
            return None;
        }
        match (self.pending_send.map(|(at, _)| at), self.wait_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }

    fn current_wait_step(&self) -> Option<RespawnStep> {
        match self.state {
            RespawnState::WaitingUpdate => Some(RespawnStep::Update),
            RespawnState::WaitingClear => Some(RespawnStep::Clear),
            RespawnState::WaitingInit => Some(RespawnStep::Init),
            _ => None,
        }
    }

    /// Complete the current waiting-* step and queue the next one (or close
    /// out the cycle).
    fn finish_wait(&mut self, now: Instant, _end: StepEnd) -> Vec<RespawnAction> {
        self.wait_deadline = None;
        let Some(step) = self.current_wait_step() else {
            return vec![];
        };
        let mut actions = vec![RespawnAction::StepCompleted(step)];

        let next_step = match step {
            RespawnStep::Update if self.settings.send_clear => Some(RespawnStep::Clear),
            RespawnStep::Update if self.settings.send_init => Some(RespawnStep::Init),
            RespawnStep::Clear if self.settings.send_init => Some(RespawnStep::Init),
            _ => None,
        };

        match next_step {
            Some(next) => {
                self.pending_send = Some((now + self.settings.inter_step_delay, next));
                actions.push(self.goto(sending_state(next)));
            }
            None => {
                actions.push(RespawnAction::CycleCompleted);
                actions.push(RespawnAction::Log(format!(
                    "respawn cycle #{} completed",
                    self.cycle
                )));
                actions.push(self.goto(RespawnState::Watching));
            }
        }
        actions
    }

    /// Emit the send action for a queued step.
    fn dispatch_step(&mut self, step: RespawnStep) -> Vec<RespawnAction> {
        let mut actions = Vec::new();
        let input = match step {
            RespawnStep::Update => self.settings.update_prompt.clone(),
            RespawnStep::Clear => {
                actions.push(RespawnAction::ResetTokens);
                self.settings.clear_command.clone()
            }
            RespawnStep::Init => self.settings.init_command.clone(),
        };
        actions.push(RespawnAction::SendStep { step, input });
        actions
    }

    fn goto(&mut self, next: RespawnState) -> RespawnAction {
        let prev = self.state;
        self.state = next;
        RespawnAction::Transition { next, prev }
    }
}

fn sending_state(step: RespawnStep) -> RespawnState {
    match step {
        RespawnStep::Update => RespawnState::SendingUpdate,
        RespawnStep::Clear => RespawnState::SendingClear,
        RespawnStep::Init => RespawnState::SendingInit,
    }
}

#[cfg(test)]
#[path = "respawn_tests.rs"]
mod tests;
