// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::messages::AgentMessage;
use crate::parser::TodoItem;
use crate::pty::ExitStatus;

/// Operational mode of a supervised session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    AgentInteractive,
    AgentOneShot,
    Shell,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentInteractive => "agent_interactive",
            Self::AgentOneShot => "agent_oneshot",
            Self::Shell => "shell",
        }
    }
}

/// Observable status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Busy,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States of the respawn maintenance cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RespawnState {
    Stopped,
    Watching,
    ConfirmingIdle,
    AiChecking,
    SendingUpdate,
    WaitingUpdate,
    SendingClear,
    WaitingClear,
    SendingInit,
    WaitingInit,
}

impl RespawnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Watching => "watching",
            Self::ConfirmingIdle => "confirming_idle",
            Self::AiChecking => "ai_checking",
            Self::SendingUpdate => "sending_update",
            Self::WaitingUpdate => "waiting_update",
            Self::SendingClear => "sending_clear",
            Self::WaitingClear => "waiting_clear",
            Self::SendingInit => "sending_init",
            Self::WaitingInit => "waiting_init",
        }
    }
}

impl std::fmt::Display for RespawnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of the maintenance cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RespawnStep {
    Update,
    Clear,
    Init,
}

impl RespawnStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Clear => "clear",
            Self::Init => "init",
        }
    }
}

/// Events emitted by the respawn controller.
#[derive(Debug, Clone, PartialEq)]
pub enum RespawnEvent {
    StateChanged { next: RespawnState, prev: RespawnState },
    CycleStarted(u64),
    CycleCompleted,
    StepSent(RespawnStep),
    StepCompleted(RespawnStep),
    AiCheckStarted,
    PlanCheckStarted,
    AutoAcceptSent,
    Log(String),
}

/// Everything a session broadcasts to its subscribers.
///
/// Late subscribers are not replayed; all subscriptions end with the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Processed (ANSI-approximation-stripped) text.
    Output(String),
    /// Raw bytes exactly as read from the PTY.
    Terminal(Bytes),
    /// Parsed structured message (one-shot mode).
    Message(AgentMessage),
    Error(String),
    Exit(ExitStatus),
    /// One-shot run finished cleanly.
    Completion { result: String, cost: f64 },
    /// A `<promise>…</promise>` sentinel matched in the stream.
    CompletionPhrase(String),
    /// Clients should drop their rendered scrollback.
    ClearTerminal,
    AutoClear,
    AutoCompact,
    Status { prev: SessionStatus, next: SessionStatus, seq: u64 },
    TodosUpdated(Vec<TodoItem>),
    Respawn(RespawnEvent),
}
