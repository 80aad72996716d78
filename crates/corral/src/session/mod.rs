// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session supervisor: owns one PTY child (optionally wrapped in a
//! detachable multiplexer session), its buffers, parsers, and policies.

mod oneshot;
pub mod run;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::accum::BoundedAccumulator;
use crate::classify::Classifier;
use crate::config::Config;
use crate::event::{SessionEvent, SessionMode, SessionStatus};
use crate::messages::MessageLog;
use crate::mux::ScreenMux;
use crate::parser::{RecentTools, TodoItem};
use crate::policy::{ContextPolicy, PolicyArm};
use crate::pty::spawn::{terminate, NativePty};
use crate::pty::{env::child_env, Backend, BackendInput};
use crate::respawn::RespawnSettings;
use crate::usage::{TokenCounters, UsageRejection};

pub use oneshot::{OneShotOptions, OneShotOutcome};

/// Capacity of the session event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Inbound hook assertions and control signals for the session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopSignal {
    StopHook,
    IdlePrompt,
    Elicitation,
    RespawnPause,
    RespawnResume,
    RespawnStop,
}

/// Construction-time knobs for a session.
pub struct SessionConfig {
    pub id: String,
    pub cwd: PathBuf,
    pub config: Config,
    /// Multiplexer adapter; `None` disables wrapping outright.
    pub mux: Option<ScreenMux>,
    /// AI classifier for idle confirmation and menu checks.
    pub classifier: Option<Arc<dyn Classifier>>,
    /// Respawn cycle settings; `None` leaves the controller stopped.
    pub respawn: Option<RespawnSettings>,
    /// Match `<promise>…</promise>` completion phrases (loop policy).
    pub completion_phrases: bool,
    pub auto_compact: PolicyArm,
    pub auto_clear: PolicyArm,
    /// Extra environment variables for the child (e.g. the hook pipe path).
    pub extra_env: Vec<(String, String)>,
}

impl SessionConfig {
    pub fn new(cwd: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            cwd: cwd.into(),
            config,
            mux: None,
            classifier: None,
            respawn: None,
            completion_phrases: false,
            auto_compact: PolicyArm::disabled(),
            auto_clear: PolicyArm::disabled(),
            extra_env: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_mux(mut self, mux: ScreenMux) -> Self {
        self.mux = Some(mux);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_respawn(mut self, settings: RespawnSettings) -> Self {
        self.respawn = Some(settings);
        self
    }

    pub fn with_completion_phrases(mut self) -> Self {
        self.completion_phrases = true;
        self
    }

    pub fn with_auto_compact(mut self, arm: PolicyArm) -> Self {
        self.auto_compact = arm;
        self
    }

    pub fn with_auto_clear(mut self, arm: PolicyArm) -> Self {
        self.auto_clear = arm;
        self
    }

    pub fn with_extra_env(mut self, vars: Vec<(String, String)>) -> Self {
        self.extra_env = vars;
        self
    }
}

/// State shared between the public handle and the session loop.
pub(crate) struct SessionShared {
    pub(crate) id: String,
    pub(crate) cwd: PathBuf,
    pub(crate) created_at: SystemTime,
    pub(crate) config: Config,
    pub(crate) mux: Option<ScreenMux>,
    pub(crate) classifier: Option<Arc<dyn Classifier>>,
    pub(crate) respawn_settings: Option<RespawnSettings>,
    pub(crate) completion_phrases: bool,
    pub(crate) extra_env: Vec<(String, String)>,

    pub(crate) events: broadcast::Sender<SessionEvent>,
    pub(crate) status: Mutex<SessionStatus>,
    pub(crate) status_seq: AtomicU64,
    pub(crate) mode: Mutex<Option<SessionMode>>,
    pub(crate) stopped: AtomicBool,
    pub(crate) shutdown: CancellationToken,
    pub(crate) child_pid: AtomicU32,

    pub(crate) raw_buf: Mutex<BoundedAccumulator>,
    pub(crate) text_buf: Mutex<BoundedAccumulator>,
    pub(crate) err_buf: Mutex<BoundedAccumulator>,
    pub(crate) messages: Mutex<MessageLog>,
    pub(crate) counters: Mutex<TokenCounters>,
    pub(crate) policy: Mutex<ContextPolicy>,
    pub(crate) recent_tools: Mutex<RecentTools>,
    pub(crate) todos: Mutex<Vec<TodoItem>>,
    pub(crate) last_activity: Mutex<Option<SystemTime>>,
    /// Reported child session id (one-shot `system` message, else our id).
    pub(crate) child_session_id: Mutex<Option<String>>,

    pub(crate) input_tx: Mutex<Option<mpsc::Sender<BackendInput>>>,
    pub(crate) resize_tx: Mutex<Option<mpsc::Sender<(u16, u16)>>>,
    pub(crate) signal_tx: Mutex<Option<mpsc::UnboundedSender<LoopSignal>>>,
    pub(crate) oneshot_latch: Mutex<Option<tokio::sync::oneshot::Sender<anyhow::Result<OneShotOutcome>>>>,

    /// Multiplexer wrap requested but creation failed this attach.
    pub(crate) mux_fallback: AtomicBool,
    /// Currently attached through the multiplexer.
    pub(crate) mux_attached: AtomicBool,

    // Bookkeeping surfaced through the persisted record.
    pub(crate) name: Mutex<Option<String>>,
    pub(crate) task_id: Mutex<Option<String>>,
    pub(crate) parent_id: Mutex<Option<String>>,
    pub(crate) child_id: Mutex<Option<String>>,
    pub(crate) priority: Mutex<Option<u8>>,
    pub(crate) color: Mutex<Option<String>>,
}

impl SessionShared {
    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Transition status, broadcasting with a sequence number. `prev` in the
    /// event is always the last observed status.
    pub(crate) fn set_status(&self, next: SessionStatus) {
        let prev = {
            let mut status = self.status.lock();
            let prev = *status;
            if prev == next {
                return;
            }
            *status = next;
            prev
        };
        let seq = self.status_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.emit(SessionEvent::Status { prev, next, seq });
    }

    pub(crate) fn touch_activity(&self) {
        *self.last_activity.lock() = Some(SystemTime::now());
    }

    /// Take the one-shot latch and resolve it exactly once.
    pub(crate) fn resolve_latch(&self, outcome: anyhow::Result<OneShotOutcome>) {
        if let Some(latch) = self.oneshot_latch.lock().take() {
            let _ = latch.send(outcome);
        }
    }
}

/// Persisted view of a session for higher layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub pid: Option<u32>,
    pub status: SessionStatus,
    pub cwd: PathBuf,
    pub task_id: Option<String>,
    pub created_at_epoch_ms: u64,
    pub last_activity_epoch_ms: Option<u64>,
    pub name: Option<String>,
    pub mode: Option<SessionMode>,
    pub auto_clear_enabled: bool,
    pub auto_clear_threshold: u64,
    pub auto_compact_enabled: bool,
    pub auto_compact_threshold: u64,
    pub auto_compact_prompt: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost_usd: f64,
    pub parent_id: Option<String>,
    pub child_id: Option<String>,
    pub priority: Option<u8>,
    pub color: Option<String>,
    /// Name of the reattachable external session, when one exists.
    pub mux_session: Option<String>,
}

/// Public handle to a supervised session.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let SessionConfig {
            id,
            cwd,
            config,
            mux,
            classifier,
            respawn,
            completion_phrases,
            auto_compact,
            auto_clear,
            extra_env,
        } = config;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let raw_buf =
            BoundedAccumulator::new(config.max_terminal_buffer, config.trim_terminal_size);
        let text_buf =
            BoundedAccumulator::new(config.max_terminal_buffer, config.trim_terminal_size);
        let err_buf = BoundedAccumulator::new(
            config.max_error_buffer,
            config.max_error_buffer.saturating_sub(1).max(1) / 2,
        );
        let messages = MessageLog::new(config.max_messages);

        let shared = Arc::new(SessionShared {
            id,
            cwd,
            created_at: SystemTime::now(),
            mux,
            classifier,
            respawn_settings: respawn,
            completion_phrases,
            extra_env,
            events,
            status: Mutex::new(SessionStatus::Idle),
            status_seq: AtomicU64::new(0),
            mode: Mutex::new(None),
            stopped: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            child_pid: AtomicU32::new(0),
            raw_buf: Mutex::new(raw_buf),
            text_buf: Mutex::new(text_buf),
            err_buf: Mutex::new(err_buf),
            messages: Mutex::new(messages),
            counters: Mutex::new(TokenCounters::new()),
            policy: Mutex::new(ContextPolicy::new(auto_compact, auto_clear)),
            recent_tools: Mutex::new(RecentTools::default()),
            todos: Mutex::new(Vec::new()),
            last_activity: Mutex::new(None),
            child_session_id: Mutex::new(None),
            input_tx: Mutex::new(None),
            resize_tx: Mutex::new(None),
            signal_tx: Mutex::new(None),
            oneshot_latch: Mutex::new(None),
            mux_fallback: AtomicBool::new(false),
            mux_attached: AtomicBool::new(false),
            name: Mutex::new(None),
            task_id: Mutex::new(None),
            parent_id: Mutex::new(None),
            child_id: Mutex::new(None),
            priority: Mutex::new(None),
            color: Mutex::new(None),
            config,
        });

        Self { shared }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn status(&self) -> SessionStatus {
        *self.shared.status.lock()
    }

    pub fn mode(&self) -> Option<SessionMode> {
        *self.shared.mode.lock()
    }

    pub fn is_attached(&self) -> bool {
        self.shared.input_tx.lock().is_some()
    }

    pub fn child_pid(&self) -> Option<u32> {
        match self.shared.child_pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Subscribe to the session's event stream. No replay for late joiners.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Current processed-text buffer contents.
    pub fn text_buffer(&self) -> String {
        self.shared.text_buf.lock().value().to_owned()
    }

    /// Current raw terminal buffer contents.
    pub fn raw_buffer(&self) -> String {
        self.shared.raw_buf.lock().value().to_owned()
    }

    pub fn todos(&self) -> Vec<TodoItem> {
        self.shared.todos.lock().clone()
    }

    /// The tool-invocation description recorded closest to `t`, within
    /// `window`. Higher layers use this to label subagent transcripts.
    pub fn tool_description_near(
        &self,
        t: std::time::Instant,
        window: std::time::Duration,
    ) -> Option<String> {
        self.shared.recent_tools.lock().near(t, window).map(str::to_owned)
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.shared.name.lock() = Some(name.into());
    }

    pub fn set_task_id(&self, task_id: Option<String>) {
        *self.shared.task_id.lock() = task_id;
    }

    pub fn set_parent_id(&self, parent: Option<String>) {
        *self.shared.parent_id.lock() = parent;
    }

    pub fn set_child_id(&self, child: Option<String>) {
        *self.shared.child_id.lock() = child;
    }

    pub fn set_priority(&self, priority: Option<u8>) {
        *self.shared.priority.lock() = priority;
    }

    pub fn set_color(&self, color: Option<String>) {
        *self.shared.color.lock() = color;
    }

    /// Write raw bytes to the child's stdin. Dropped (returns `false`) when
    /// no child is attached or the session is stopped.
    pub async fn write(&self, bytes: impl Into<Bytes>) -> bool {
        if self.shared.stopped.load(Ordering::Acquire) {
            return false;
        }
        let tx = self.shared.input_tx.lock().clone();
        match tx {
            Some(tx) => tx.send(BackendInput::Write(bytes.into())).await.is_ok(),
            None => false,
        }
    }

    /// Write through the multiplexer when attached through one — far more
    /// reliable for full-screen TUIs. Falls back to the PTY path, and
    /// returns `false` when neither is available.
    pub async fn write_via_mux(&self, bytes: impl Into<Bytes>) -> bool {
        let bytes = bytes.into();
        if self.shared.stopped.load(Ordering::Acquire) {
            return false;
        }
        if self.shared.mux_attached.load(Ordering::Acquire) {
            if let Some(ref mux) = self.shared.mux {
                if mux.send_input(&self.shared.id, &bytes).await.is_ok() {
                    return true;
                }
                warn!("multiplexer write failed, falling back to PTY");
            }
        }
        self.write(bytes).await
    }

    /// Resize the PTY.
    pub fn resize(&self, cols: u16, rows: u16) {
        let tx = self.shared.resize_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.try_send((cols, rows));
        }
    }

    /// Inbound hook: the child's stop hook fired (strong idle assertion).
    pub fn signal_stop_hook(&self) {
        self.send_signal(LoopSignal::StopHook);
    }

    /// Inbound hook: the child rendered its idle prompt (strongest).
    pub fn signal_idle_prompt(&self) {
        self.send_signal(LoopSignal::IdlePrompt);
    }

    /// Inbound hook: an elicitation dialog is active; auto-accept must
    /// stand down.
    pub fn signal_elicitation(&self) {
        self.send_signal(LoopSignal::Elicitation);
    }

    pub fn pause_respawn(&self) {
        self.send_signal(LoopSignal::RespawnPause);
    }

    pub fn resume_respawn(&self) {
        self.send_signal(LoopSignal::RespawnResume);
    }

    pub fn stop_respawn(&self) {
        self.send_signal(LoopSignal::RespawnStop);
    }

    fn send_signal(&self, signal: LoopSignal) {
        let tx = self.shared.signal_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(signal);
        }
    }

    /// Persisted view for higher layers.
    pub fn snapshot(&self) -> SessionRecord {
        let shared = &self.shared;
        let counters = shared.counters.lock();
        let totals = counters.totals().clone();
        drop(counters);
        let policy = shared.policy.lock();
        let compact = policy.compact_arm().clone();
        let clear = policy.clear_arm().clone();
        drop(policy);
        let mux_session = (shared.mux.is_some()
            && !shared.mux_fallback.load(Ordering::Acquire))
        .then(|| ScreenMux::session_name(&shared.id));

        SessionRecord {
            id: shared.id.clone(),
            pid: self.child_pid(),
            status: *shared.status.lock(),
            cwd: shared.cwd.clone(),
            task_id: shared.task_id.lock().clone(),
            created_at_epoch_ms: epoch_ms(shared.created_at),
            last_activity_epoch_ms: shared.last_activity.lock().map(epoch_ms),
            name: shared.name.lock().clone(),
            mode: *shared.mode.lock(),
            auto_clear_enabled: clear.enabled,
            auto_clear_threshold: clear.threshold,
            auto_compact_enabled: compact.enabled,
            auto_compact_threshold: compact.threshold,
            auto_compact_prompt: compact.prompt,
            input_tokens: totals.input_tokens,
            output_tokens: totals.output_tokens,
            total_cost_usd: totals.total_cost_usd,
            parent_id: shared.parent_id.lock().clone(),
            child_id: shared.child_id.lock().clone(),
            priority: *shared.priority.lock(),
            color: shared.color.lock().clone(),
            mux_session,
        }
    }

    /// Restore persisted token counters (validated; see `TokenCounters`).
    pub fn restore_tokens(
        &self,
        input_tokens: i64,
        output_tokens: i64,
        total_cost_usd: f64,
    ) -> Result<(), UsageRejection> {
        self.shared.counters.lock().restore(input_tokens, output_tokens, total_cost_usd)
    }

    /// Start the agent in interactive mode.
    pub async fn start_interactive(&self) -> anyhow::Result<()> {
        let command = vec![
            self.shared.config.agent_bin.clone(),
            "--dangerously-skip-permissions".to_owned(),
            "--session-id".to_owned(),
            self.shared.id.clone(),
        ];
        self.start_attached(SessionMode::AgentInteractive, command).await
    }

    /// Start the user's default interactive shell.
    pub async fn start_shell(&self) -> anyhow::Result<()> {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_owned());
        self.start_attached(SessionMode::Shell, vec![shell]).await
    }

    /// Common attach path for interactive and shell modes.
    async fn start_attached(
        &self,
        mode: SessionMode,
        command: Vec<String>,
    ) -> anyhow::Result<()> {
        let shared = &self.shared;
        if shared.stopped.load(Ordering::Acquire) {
            anyhow::bail!("session is stopped");
        }
        if shared.input_tx.lock().is_some() {
            anyhow::bail!("session already started");
        }

        let mut env =
            child_env(&shared.id, &shared.config.api_url, &shared.config.agent_bin);
        env.extend(shared.extra_env.iter().cloned());
        let (cols, rows) = (shared.config.cols, shared.config.rows);

        // Prefer the multiplexer wrap; fall back to a bare PTY on any
        // failure without changing public behavior.
        let mut fresh_mux = false;
        let mut attached_via_mux = false;
        let spawn_command = if shared.config.mux_enabled() {
            match shared.mux {
                Some(ref mux) if mux.is_available() => {
                    let exists = mux.session_exists(&shared.id).await;
                    if exists {
                        attached_via_mux = true;
                        mux.attach_command(&shared.id)
                    } else {
                        match mux.create_session(&shared.id, &shared.cwd, &command, &env).await {
                            Ok(()) => {
                                fresh_mux = true;
                                attached_via_mux = true;
                                mux.attach_command(&shared.id)
                            }
                            Err(e) => {
                                warn!("multiplexer creation failed, using bare PTY: {e:#}");
                                shared.mux_fallback.store(true, Ordering::Release);
                                command.clone()
                            }
                        }
                    }
                }
                _ => {
                    shared.mux_fallback.store(true, Ordering::Release);
                    command.clone()
                }
            }
        } else {
            command.clone()
        };

        let backend = match NativePty::spawn(&spawn_command, &shared.cwd, cols, rows, &env) {
            Ok(backend) => backend,
            Err(e) => {
                shared.set_status(SessionStatus::Error);
                shared.emit(SessionEvent::Error(format!("spawn failed: {e:#}")));
                return Err(e).context("spawning PTY child");
            }
        };
        shared.mux_attached.store(attached_via_mux, Ordering::Release);

        let kind = match mode {
            SessionMode::Shell => run::AttachKind::Shell,
            _ => run::AttachKind::Interactive { fresh_mux },
        };
        self.attach_backend(backend, mode, kind);
        Ok(())
    }

    /// Wire a spawned backend into the session loop.
    pub(crate) fn attach_backend(
        &self,
        mut backend: NativePty,
        mode: SessionMode,
        kind: run::AttachKind,
    ) {
        let shared = Arc::clone(&self.shared);
        if let Some(pid) = Backend::child_pid(&backend) {
            shared.child_pid.store(pid, Ordering::Release);
        }
        *shared.child_session_id.lock() = Some(shared.id.clone());

        let (output_tx, output_rx) = mpsc::channel(256);
        let (input_tx, input_rx) = mpsc::channel(256);
        let (resize_tx, resize_rx) = mpsc::channel(4);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        *shared.input_tx.lock() = Some(input_tx);
        *shared.resize_tx.lock() = Some(resize_tx);
        *shared.signal_tx.lock() = Some(signal_tx);
        *shared.mode.lock() = Some(mode);
        shared.set_status(SessionStatus::Busy);

        let backend_handle =
            tokio::spawn(async move { backend.run(output_tx, input_rx, resize_rx).await });

        tokio::spawn(run::run_loop(shared, mode, kind, output_rx, signal_rx, backend_handle));
    }

    /// Stop the session: idempotent, cancels every timer, rejects any
    /// pending one-shot, and tears the child down hard.
    pub async fn stop(&self, kill_mux_session: bool) {
        let shared = &self.shared;
        if shared.stopped.swap(true, Ordering::AcqRel) {
            debug!(id = %shared.id, "stop: already stopped");
            return;
        }

        // Reject a pending one-shot before the lengthy termination path.
        shared.resolve_latch(Err(anyhow::anyhow!("Session stopped")));

        // Flipping the token wakes the loop, which stops scheduling work.
        shared.shutdown.cancel();

        // Graceful-then-forceful termination of the leader and its group.
        let pid = shared.child_pid.load(Ordering::Acquire);
        if pid != 0 {
            terminate(nix::unistd::Pid::from_raw(pid as i32)).await;
        }

        // The multiplexer kill is additional, never a substitute.
        if shared.mux_attached.swap(false, Ordering::AcqRel) && kill_mux_session {
            if let Some(ref mux) = shared.mux {
                if let Err(e) = mux.kill_session(&shared.id).await {
                    debug!("multiplexer kill failed: {e:#}");
                }
            }
        }

        *shared.input_tx.lock() = None;
        *shared.resize_tx.lock() = None;
        *shared.signal_tx.lock() = None;
        shared.set_status(SessionStatus::Stopped);
    }
}

fn epoch_ms(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
#[path = "../session_tests.rs"]
mod tests;
