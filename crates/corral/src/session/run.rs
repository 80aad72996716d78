// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The per-session select loop.
//!
//! One cooperative task owns the child's byte stream, the parsers, the idle
//! detector, the respawn controller, auto-accept, and the context policies.
//! Nothing here blocks: timer work is deadline-scheduled and classifier
//! invocations run as tracked side tasks whose results re-enter the loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::autoaccept::{AcceptPoll, AcceptSettings, AutoAcceptGate, MENU_EXCERPT_BYTES};
use crate::classify::{IdleVerdict, MenuVerdict};
use crate::event::{RespawnEvent, RespawnState, SessionEvent, SessionMode, SessionStatus};
use crate::idle::{IdleDetector, IdlePoll, IdleSettings};
use crate::messages::{parse_message, AgentMessage};
use crate::parser::{ParserEvent, TerminalParser};
use crate::patterns::{printable_len, PatternSet};
use crate::policy::PolicyKind;
use crate::pty::{BackendInput, ExitStatus};
use crate::respawn::{RespawnAction, RespawnController};
use crate::stream::{LineSplitter, StreamFilter, Utf8Assembler};
use crate::timeout::with_timeout;

use super::{LoopSignal, OneShotOutcome, SessionShared};

/// Confirmation window after the prompt character appears before the
/// session reports idle.
const PROMPT_IDLE_CONFIRM: Duration = Duration::from_millis(2_000);

/// Shell sessions report idle after this fixed ready delay.
const SHELL_READY_DELAY: Duration = Duration::from_millis(500);

/// Window for the fresh-multiplexer prompt probe.
const FRESH_PROMPT_PROBE: Duration = Duration::from_secs(5);

/// Excerpt handed to the idle classifier.
const IDLE_EXCERPT_BYTES: usize = 16 * 1024;

/// How the backend was attached, for mode-specific loop behavior.
#[derive(Debug, Clone, Copy)]
pub(crate) enum AttachKind {
    Interactive { fresh_mux: bool },
    Shell,
    OneShot,
}

/// Which classifier invocation is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAi {
    IdleCheck,
    MenuCheck,
}

/// Loop-local mutable state.
struct LoopState {
    mode: SessionMode,
    filter: StreamFilter,
    utf8: Utf8Assembler,
    splitter: LineSplitter,
    parser: TerminalParser,
    idle: IdleDetector,
    respawn: Option<RespawnController>,
    accept: AutoAcceptGate,
    prompt_idle_at: Option<Instant>,
    shell_ready_at: Option<Instant>,
    fresh_probe_until: Option<Instant>,
    last_chunk_at: Option<Instant>,
    accept_check_after: Option<Instant>,
    policy_poll_at: Option<Instant>,
    /// A classifier task was requested by `tick`; the loop picks it up.
    ai_wanted: Option<PendingAi>,
    /// A classifier task is currently in flight.
    ai_running: bool,
    // One-shot accumulation.
    pending_result: Option<String>,
    pending_cost: f64,
    result_is_error: bool,
}

/// Run `f` against the respawn controller, if any.
fn with_respawn(
    state: &mut LoopState,
    f: impl FnOnce(&mut RespawnController) -> Vec<RespawnAction>,
) -> Vec<RespawnAction> {
    match state.respawn.as_mut() {
        Some(controller) => f(controller),
        None => Vec::new(),
    }
}

pub(crate) async fn run_loop(
    shared: Arc<SessionShared>,
    mode: SessionMode,
    kind: AttachKind,
    mut output_rx: mpsc::Receiver<Bytes>,
    mut signal_rx: mpsc::UnboundedReceiver<LoopSignal>,
    mut backend_handle: JoinHandle<anyhow::Result<ExitStatus>>,
) {
    let patterns = match PatternSet::new() {
        Ok(p) => p,
        Err(e) => {
            shared.set_status(SessionStatus::Error);
            shared.emit(SessionEvent::Error(format!("pattern compilation failed: {e:#}")));
            return;
        }
    };

    let config = &shared.config;
    let now = Instant::now();
    let mut state = LoopState {
        mode,
        filter: StreamFilter::new(matches!(mode, SessionMode::AgentInteractive)),
        utf8: Utf8Assembler::new(),
        splitter: LineSplitter::default(),
        parser: TerminalParser::new(patterns)
            .with_completion_phrases(shared.completion_phrases),
        idle: IdleDetector::new(IdleSettings {
            completion_confirm: config.completion_confirm(),
            no_output_timeout: config.no_output_timeout(),
            ai_enabled: config.ai_confirm && shared.classifier.is_some(),
            ai_cooldown: config.ai_cooldown(),
        }),
        respawn: None,
        accept: AutoAcceptGate::new(AcceptSettings {
            delay: config.auto_accept_delay(),
            ai_enabled: config.ai_menu_check && shared.classifier.is_some(),
            ai_cooldown: config.ai_cooldown(),
        }),
        prompt_idle_at: None,
        shell_ready_at: matches!(kind, AttachKind::Shell).then(|| now + SHELL_READY_DELAY),
        fresh_probe_until: matches!(kind, AttachKind::Interactive { fresh_mux: true })
            .then(|| now + FRESH_PROMPT_PROBE),
        last_chunk_at: None,
        accept_check_after: None,
        policy_poll_at: None,
        ai_wanted: None,
        ai_running: false,
        pending_result: None,
        pending_cost: 0.0,
        result_is_error: false,
    };

    // Respawn controller enters watching as soon as the session attaches.
    // One-shot children run to completion on their own; no cycles there.
    if !matches!(kind, AttachKind::OneShot) {
        if let Some(settings) = shared.respawn_settings.clone() {
            let mut controller = RespawnController::new(settings);
            let actions = controller.start();
            state.respawn = Some(controller);
            execute_respawn_actions(&shared, &mut state, actions).await;
        }
    }

    let mut output_open = true;
    // The in-flight classifier task lives outside `state` so the select
    // branch borrowing it stays disjoint from the handlers.
    let mut ai_task: Option<(PendingAi, JoinHandle<anyhow::Result<bool>>)> = None;
    let exit_status: ExitStatus;

    loop {
        let wake = next_wake(&shared, &state, Instant::now());

        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                debug!(id = %shared.id, "session loop: shutdown");
                // Stop path: the handle's stop() owns teardown; just make
                // sure the respawn machine reports its final transition.
                let actions = with_respawn(&mut state, RespawnController::stop);
                emit_respawn_transitions(&shared, actions);
                if let Some((_, handle)) = ai_task.take() {
                    handle.abort();
                }
                backend_handle.abort();
                return;
            }

            chunk = output_rx.recv(), if output_open => {
                match chunk {
                    Some(bytes) => process_chunk(&shared, &mut state, bytes, Instant::now()).await,
                    None => output_open = false,
                }
            }

            signal = signal_rx.recv() => {
                if let Some(signal) = signal {
                    handle_signal(&shared, &mut state, signal, Instant::now());
                }
            }

            joined = &mut backend_handle => {
                // Drain whatever output is still queued before finalizing.
                while let Ok(bytes) = output_rx.try_recv() {
                    process_chunk(&shared, &mut state, bytes, Instant::now()).await;
                }
                exit_status = match joined {
                    Ok(Ok(status)) => status,
                    Ok(Err(e)) => {
                        warn!("backend error: {e:#}");
                        shared.err_buf.lock().append(&format!("{e:#}\n"));
                        shared.emit(SessionEvent::Error(format!("{e:#}")));
                        ExitStatus { code: Some(1), signal: None }
                    }
                    Err(e) => {
                        warn!("backend task panicked: {e}");
                        ExitStatus { code: Some(1), signal: None }
                    }
                };
                break;
            }

            verdict = poll_ai_task(&mut ai_task) => {
                state.ai_running = false;
                handle_ai_verdict(&shared, &mut state, verdict, Instant::now()).await;
            }

            _ = sleep_until_opt(wake), if wake.is_some() => {}
        }

        tick(&shared, &mut state, Instant::now()).await;

        // Launch any classifier invocation tick requested, one at a time.
        if let Some(kind) = state.ai_wanted.take() {
            if !state.ai_running {
                if let Some(handle) = spawn_ai_task(&shared, &mut state, kind) {
                    ai_task = Some((kind, handle));
                    state.ai_running = true;
                }
            }
        }
    }

    if let Some((_, handle)) = ai_task.take() {
        handle.abort();
    }
    finalize(&shared, &mut state, exit_status).await;
}

/// Await the in-flight classifier task, or pend forever when none is.
async fn poll_ai_task(
    task: &mut Option<(PendingAi, JoinHandle<anyhow::Result<bool>>)>,
) -> (PendingAi, anyhow::Result<bool>) {
    match task {
        Some((kind, handle)) => {
            let kind = *kind;
            let joined = handle.await;
            *task = None;
            let result = match joined {
                Ok(inner) => inner,
                Err(e) => Err(anyhow::anyhow!("classifier task panicked: {e}")),
            };
            (kind, result)
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

/// Earliest deadline any component cares about.
fn next_wake(shared: &SessionShared, state: &LoopState, now: Instant) -> Option<Instant> {
    let mut wake: Option<Instant> = None;
    let mut consider = |candidate: Option<Instant>| {
        if let Some(at) = candidate {
            wake = Some(wake.map_or(at, |w| w.min(at)));
        }
    };

    consider(state.idle.next_deadline(now));
    consider(state.respawn.as_ref().and_then(RespawnController::next_deadline));
    consider(state.prompt_idle_at);
    consider(state.shell_ready_at);
    consider(state.accept_check_after);
    consider(state.policy_poll_at);
    if state.splitter.has_partial() {
        consider(state.last_chunk_at.map(|at| at + shared.config.line_flush_delay()));
    }
    wake
}

/// Write through the preferred path: multiplexer stuff when attached, PTY
/// otherwise. Returns false when neither path accepted the bytes.
async fn preferred_write(shared: &SessionShared, bytes: &[u8]) -> bool {
    if shared.mux_attached.load(Ordering::Acquire) {
        if let Some(ref mux) = shared.mux {
            if mux.send_input(&shared.id, bytes).await.is_ok() {
                return true;
            }
            warn!("multiplexer write failed, falling back to PTY");
        }
    }
    let tx = shared.input_tx.lock().clone();
    match tx {
        Some(tx) => tx.send(BackendInput::Write(Bytes::copy_from_slice(bytes))).await.is_ok(),
        None => false,
    }
}

async fn process_chunk(
    shared: &Arc<SessionShared>,
    state: &mut LoopState,
    bytes: Bytes,
    now: Instant,
) {
    shared.touch_activity();
    state.last_chunk_at = Some(now);
    shared.emit(SessionEvent::Terminal(bytes.clone()));
    shared.raw_buf.lock().append(&String::from_utf8_lossy(&bytes));

    let filtered = state.filter.feed(&bytes);
    if filtered.is_empty() {
        return;
    }
    let text = state.utf8.feed(&filtered);
    if text.is_empty() {
        return;
    }

    let printable = printable_len(&state.parser.patterns().strip_ansi(&text));
    state.idle.note_output(now, printable);
    state.accept.note_output(now);
    state.accept_check_after = Some(now + shared.config.auto_accept_delay());

    let events = state.parser.feed_chunk(&text, now);
    for event in events {
        handle_parser_event(shared, state, event, now).await;
    }

    let lines = state.splitter.feed(&text);
    for line in lines {
        process_line(shared, state, &line, true).await;
    }
}

async fn handle_parser_event(
    shared: &Arc<SessionShared>,
    state: &mut LoopState,
    event: ParserEvent,
    now: Instant,
) {
    match event {
        ParserEvent::StatusTokens(total) => {
            let combined = {
                let mut counters = shared.counters.lock();
                if counters.apply_status_total(total).is_err() {
                    return;
                }
                counters.combined()
            };
            shared.policy.lock().on_tokens(combined, now);
            state.policy_poll_at = Some(now);
        }
        ParserEvent::WorkingSeen => {
            state.idle.note_working(now);
            state.accept.note_working();
            state.prompt_idle_at = None;
            shared.set_status(SessionStatus::Busy);
            let actions = with_respawn(state, |c| c.working_detected(now));
            execute_respawn_actions(shared, state, actions).await;
        }
        ParserEvent::PromptSeen => {
            if let Some(until) = state.fresh_probe_until {
                if now <= until {
                    // First prompt on a freshly created multiplexer session:
                    // drop the startup noise so clients render from a clean
                    // baseline. Reattached sessions keep their scrollback.
                    let mut raw = shared.raw_buf.lock();
                    let cleaned =
                        state.parser.patterns().strip_leading_noise(raw.value()).to_owned();
                    raw.set(cleaned);
                    drop(raw);
                    shared.emit(SessionEvent::ClearTerminal);
                }
                state.fresh_probe_until = None;
            }
            if state.prompt_idle_at.is_none() {
                state.prompt_idle_at = Some(now + PROMPT_IDLE_CONFIRM);
            }
        }
        ParserEvent::CompletionMessage => {
            state.idle.note_completion_message(now);
        }
        ParserEvent::CompletionPhrase(phrase) => {
            shared.emit(SessionEvent::CompletionPhrase(phrase));
            // A completion phrase is the loop's end sentinel: whatever
            // maintenance cycle is running stands down.
            let actions = with_respawn(state, RespawnController::stop);
            emit_respawn_transitions(shared, actions);
        }
        ParserEvent::TodosUpdated => {
            let todos = state.parser.todos().to_vec();
            *shared.todos.lock() = todos.clone();
            shared.emit(SessionEvent::TodosUpdated(todos));
        }
        ParserEvent::ToolInvocation(description) => {
            shared.recent_tools.lock().insert(now, description);
        }
        ParserEvent::IterationUpdated { .. } | ParserEvent::CycleUpdated(_) => {}
    }
}

/// Route one completed (or force-flushed) line.
async fn process_line(
    shared: &Arc<SessionShared>,
    state: &mut LoopState,
    line: &str,
    completed: bool,
) {
    let stripped = state.parser.patterns().strip_ansi(line).into_owned();

    if matches!(state.mode, SessionMode::AgentOneShot) {
        if let Some(message) = parse_message(&stripped) {
            handle_oneshot_message(shared, state, &message);
            shared.messages.lock().push(message.clone());
            shared.emit(SessionEvent::Message(message));
            return;
        }
    }

    let mut text = stripped;
    if completed {
        text.push('\n');
    }
    shared.text_buf.lock().append(&text);
    shared.emit(SessionEvent::Output(text));
}

fn handle_oneshot_message(
    shared: &Arc<SessionShared>,
    state: &mut LoopState,
    message: &AgentMessage,
) {
    match message {
        AgentMessage::System { session_id, .. } => {
            if let Some(sid) = session_id {
                let mut child_sid = shared.child_session_id.lock();
                if child_sid.as_deref() == Some(shared.id.as_str()) || child_sid.is_none() {
                    *child_sid = Some(sid.clone());
                }
            }
        }
        AgentMessage::Assistant { text_blocks, input_tokens, output_tokens, .. } => {
            for block in text_blocks {
                let mut text = block.clone();
                text.push('\n');
                shared.text_buf.lock().append(&text);
                shared.emit(SessionEvent::Output(text));
            }
            let mut counters = shared.counters.lock();
            if counters.apply_message(*input_tokens, *output_tokens).is_err() {
                debug!("one-shot usage update rejected");
            }
        }
        AgentMessage::Result { result, is_error, total_cost_usd, .. } => {
            state.pending_result = result.clone();
            state.result_is_error = *is_error;
            state.pending_cost = total_cost_usd.unwrap_or(0.0);
        }
        AgentMessage::User { .. } | AgentMessage::Other { .. } => {}
    }
}

fn handle_signal(
    shared: &Arc<SessionShared>,
    state: &mut LoopState,
    signal: LoopSignal,
    now: Instant,
) {
    match signal {
        LoopSignal::StopHook => state.idle.signal_stop_hook(now),
        LoopSignal::IdlePrompt => state.idle.signal_idle_prompt(),
        LoopSignal::Elicitation => state.accept.signal_elicitation(),
        LoopSignal::RespawnPause => {
            if let Some(ref mut controller) = state.respawn {
                controller.pause();
            }
        }
        LoopSignal::RespawnResume => {
            if let Some(ref mut controller) = state.respawn {
                controller.resume();
            }
        }
        LoopSignal::RespawnStop => {
            let actions = with_respawn(state, RespawnController::stop);
            emit_respawn_transitions(shared, actions);
        }
    }
}

/// Deadline-driven work: runs after every loop wakeup.
async fn tick(shared: &Arc<SessionShared>, state: &mut LoopState, now: Instant) {
    // Shell ready delay.
    if let Some(at) = state.shell_ready_at {
        if now >= at {
            state.shell_ready_at = None;
            shared.set_status(SessionStatus::Idle);
        }
    }

    // Idle flush of a stuck partial line.
    if state.splitter.has_partial() {
        let flush_due = state
            .last_chunk_at
            .map(|at| now >= at + shared.config.line_flush_delay())
            .unwrap_or(false);
        if flush_due {
            if let Some(partial) = state.splitter.flush_partial() {
                process_line(shared, state, &partial, false).await;
            }
        }
    }

    // Prompt-driven idle confirmation.
    if let Some(at) = state.prompt_idle_at {
        if now >= at {
            state.prompt_idle_at = None;
            shared.set_status(SessionStatus::Idle);
        }
    }

    // Idle detector verdicts.
    match state.idle.poll(now) {
        IdlePoll::Watching | IdlePoll::AiChecking => {}
        IdlePoll::Confirming { .. } => {
            let actions = with_respawn(state, RespawnController::idle_confirming);
            execute_respawn_actions(shared, state, actions).await;
        }
        IdlePoll::StartAiCheck { .. } => {
            let actions = with_respawn(state, RespawnController::ai_checking);
            execute_respawn_actions(shared, state, actions).await;
            shared.emit(SessionEvent::Respawn(RespawnEvent::AiCheckStarted));
            state.ai_wanted = Some(PendingAi::IdleCheck);
        }
        IdlePoll::ConfirmedIdle { trigger, confidence } => {
            debug!(?trigger, confidence, "idle confirmed");
            shared.set_status(SessionStatus::Idle);
            let actions = with_respawn(state, |c| c.confirmed_idle(now));
            execute_respawn_actions(shared, state, actions).await;
        }
    }

    // Respawn deadlines (queued sends, step timeouts).
    let actions = with_respawn(state, |c| c.tick(now));
    execute_respawn_actions(shared, state, actions).await;

    // Auto-accept.
    if let Some(at) = state.accept_check_after {
        if now >= at {
            state.accept_check_after = None;
            let watching = state
                .respawn
                .as_ref()
                .map(|c| c.state() == RespawnState::Watching)
                .unwrap_or(true);
            let tail = shared.text_buf.lock().tail(MENU_EXCERPT_BYTES).to_owned();
            match state.accept.poll(&tail, state.parser.patterns(), watching, now) {
                AcceptPoll::Hold | AcceptPoll::AiChecking => {}
                AcceptPoll::StartAiCheck => {
                    shared.emit(SessionEvent::Respawn(RespawnEvent::PlanCheckStarted));
                    state.ai_wanted = Some(PendingAi::MenuCheck);
                }
                AcceptPoll::SendEnter => {
                    send_enter(shared, state).await;
                }
            }
        }
    }

    // Context policies.
    let policy_due = state.policy_poll_at.map(|at| now >= at).unwrap_or(false);
    if policy_due || shared.policy.lock().in_progress() {
        let idle = *shared.status.lock() == SessionStatus::Idle;
        let stopped = shared.stopped.load(Ordering::Acquire);
        let decision = shared.policy.lock().poll(idle, stopped, now);
        if let Some(decision) = decision {
            let mut input = decision.command.clone().into_bytes();
            input.push(b'\r');
            if preferred_write(shared, &input).await {
                shared.policy.lock().sent(decision.kind, now);
                if decision.resets_tokens {
                    shared.counters.lock().reset_tokens();
                }
                if decision.kind == PolicyKind::Clear {
                    shared.messages.lock().clear();
                }
                shared.emit(decision.event());
            }
        }
        state.policy_poll_at = shared
            .policy
            .lock()
            .in_progress()
            .then(|| now + shared.config.auto_retry_delay());
    }
}

/// Send a bare Enter through the preferred path (auto-accept).
async fn send_enter(shared: &Arc<SessionShared>, _state: &mut LoopState) {
    if preferred_write(shared, b"\r").await {
        shared.emit(SessionEvent::Respawn(RespawnEvent::AutoAcceptSent));
    }
}

/// Kick off a classifier invocation as a tracked side task.
fn spawn_ai_task(
    shared: &Arc<SessionShared>,
    state: &mut LoopState,
    kind: PendingAi,
) -> Option<JoinHandle<anyhow::Result<bool>>> {
    let Some(classifier) = shared.classifier.clone() else {
        // Gate misconfiguration; resolve conservatively right away.
        let now = Instant::now();
        match kind {
            PendingAi::IdleCheck => state.idle.ai_timeout(now),
            PendingAi::MenuCheck => state.accept.ai_timeout(now),
        }
        return None;
    };
    let deadline = shared.config.ai_deadline();
    let excerpt = match kind {
        PendingAi::IdleCheck => shared.text_buf.lock().tail(IDLE_EXCERPT_BYTES).to_owned(),
        PendingAi::MenuCheck => shared.text_buf.lock().tail(MENU_EXCERPT_BYTES).to_owned(),
    };
    let handle = tokio::spawn(async move {
        match kind {
            PendingAi::IdleCheck => {
                let verdict =
                    with_timeout(classifier.check_idle(excerpt), deadline, "idle classifier")
                        .await?;
                Ok(verdict == IdleVerdict::Idle)
            }
            PendingAi::MenuCheck => {
                let verdict =
                    with_timeout(classifier.check_menu(excerpt), deadline, "menu classifier")
                        .await?;
                Ok(verdict == MenuVerdict::Approve)
            }
        }
    });
    Some(handle)
}

async fn handle_ai_verdict(
    shared: &Arc<SessionShared>,
    state: &mut LoopState,
    (kind, result): (PendingAi, anyhow::Result<bool>),
    now: Instant,
) {
    match kind {
        PendingAi::IdleCheck => match result {
            Ok(idle) => {
                if let Some(IdlePoll::ConfirmedIdle { trigger, confidence }) =
                    state.idle.ai_result(now, idle)
                {
                    debug!(?trigger, confidence, "idle confirmed by classifier");
                    shared.set_status(SessionStatus::Idle);
                    let actions = with_respawn(state, |c| c.confirmed_idle(now));
                    execute_respawn_actions(shared, state, actions).await;
                } else {
                    // Working verdict: drop back to watching.
                    let actions = with_respawn(state, |c| c.working_detected(now));
                    execute_respawn_actions(shared, state, actions).await;
                }
            }
            Err(e) => {
                debug!("idle classifier failed: {e:#}");
                state.idle.ai_timeout(now);
                let actions = with_respawn(state, |c| c.working_detected(now));
                execute_respawn_actions(shared, state, actions).await;
            }
        },
        PendingAi::MenuCheck => match result {
            Ok(approve) => {
                if state.accept.ai_result(now, approve) == AcceptPoll::SendEnter {
                    send_enter(shared, state).await;
                }
            }
            Err(e) => {
                debug!("menu classifier failed: {e:#}");
                state.accept.ai_timeout(now);
            }
        },
    }
}

/// Execute controller actions in order: broadcasts, writes, counter resets.
async fn execute_respawn_actions(
    shared: &Arc<SessionShared>,
    state: &mut LoopState,
    actions: Vec<RespawnAction>,
) {
    let mut queue = actions;
    while !queue.is_empty() {
        let mut follow_ups = Vec::new();
        for action in queue {
            match action {
                RespawnAction::Transition { next, prev } => {
                    shared.emit(SessionEvent::Respawn(RespawnEvent::StateChanged {
                        next,
                        prev,
                    }));
                }
                RespawnAction::CycleStarted(n) => {
                    shared.emit(SessionEvent::Respawn(RespawnEvent::CycleStarted(n)));
                }
                RespawnAction::SendStep { step, input } => {
                    let mut bytes = input.into_bytes();
                    bytes.push(b'\r');
                    let now = Instant::now();
                    if preferred_write(shared, &bytes).await {
                        shared.emit(SessionEvent::Respawn(RespawnEvent::StepSent(step)));
                        // The step wait measures quiet time from the send.
                        state.idle.clear();
                        state.idle.note_output(now, 0);
                        if let Some(ref mut controller) = state.respawn {
                            follow_ups.extend(controller.step_sent(now));
                        }
                    } else {
                        warn!("respawn step write failed");
                        shared.emit(SessionEvent::Respawn(RespawnEvent::Log(format!(
                            "step {} write failed",
                            step.as_str()
                        ))));
                    }
                }
                RespawnAction::ResetTokens => {
                    shared.counters.lock().reset_tokens();
                }
                RespawnAction::StepCompleted(step) => {
                    shared.emit(SessionEvent::Respawn(RespawnEvent::StepCompleted(step)));
                }
                RespawnAction::CycleCompleted => {
                    shared.emit(SessionEvent::Respawn(RespawnEvent::CycleCompleted));
                }
                RespawnAction::Log(text) => {
                    shared.emit(SessionEvent::Respawn(RespawnEvent::Log(text)));
                }
            }
        }
        queue = follow_ups;
    }
}

/// Broadcast-only variant for teardown paths.
fn emit_respawn_transitions(shared: &Arc<SessionShared>, actions: Vec<RespawnAction>) {
    for action in actions {
        if let RespawnAction::Transition { next, prev } = action {
            shared.emit(SessionEvent::Respawn(RespawnEvent::StateChanged { next, prev }));
        }
    }
}

/// Child exited: settle buffers, resolve the one-shot latch, broadcast.
async fn finalize(shared: &Arc<SessionShared>, state: &mut LoopState, status: ExitStatus) {
    // Flush filter and splitter tails so the buffers are final.
    let tail = state.filter.finish();
    if !tail.is_empty() {
        let text = state.utf8.feed(&tail);
        if !text.is_empty() {
            let lines = state.splitter.feed(&text);
            for line in lines {
                process_line(shared, state, &line, true).await;
            }
        }
    }
    if let Some(partial) = state.splitter.flush_partial() {
        process_line(shared, state, &partial, false).await;
    }

    if let Some(ref mut controller) = state.respawn {
        let actions = controller.stop();
        emit_respawn_transitions(shared, actions);
    }

    // One-shot resolution: success requires a clean exit and a non-error
    // result message.
    if matches!(state.mode, SessionMode::AgentOneShot) {
        let outcome = if status.success() && !state.result_is_error {
            match state.pending_result.take() {
                Some(result) => {
                    shared.counters.lock().add_cost(state.pending_cost);
                    shared.emit(SessionEvent::Completion {
                        result: result.clone(),
                        cost: state.pending_cost,
                    });
                    Ok(OneShotOutcome { result, cost: state.pending_cost })
                }
                None => Err(anyhow::anyhow!("agent exited without a result")),
            }
        } else {
            let err_text = {
                let err = shared.err_buf.lock();
                if err.is_empty() {
                    "agent exited with error".to_owned()
                } else {
                    err.value().to_owned()
                }
            };
            Err(anyhow::anyhow!(err_text))
        };
        shared.resolve_latch(outcome);
    }

    // Detach bookkeeping before the exit broadcast, so subscribers observing
    // `exit` see a settled session: buffers final, nothing attached. The
    // multiplexer session (if any) stays alive for reattachment; an explicit
    // stop() kills it separately.
    shared.child_pid.store(0, Ordering::Release);
    shared.mux_attached.store(false, Ordering::Release);
    *shared.input_tx.lock() = None;
    *shared.resize_tx.lock() = None;
    *shared.signal_tx.lock() = None;
    *shared.mode.lock() = None;

    if shared.stopped.load(Ordering::Acquire) {
        shared.set_status(SessionStatus::Stopped);
    } else if status.success() || status.code.is_none() {
        shared.set_status(SessionStatus::Idle);
    } else if matches!(state.mode, SessionMode::AgentOneShot) {
        shared.set_status(SessionStatus::Error);
    } else {
        shared.set_status(SessionStatus::Idle);
    }

    shared.emit(SessionEvent::Exit(status));
}
