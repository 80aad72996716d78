// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::config::Config;
use crate::event::{RespawnEvent, RespawnStep, SessionEvent, SessionMode, SessionStatus};
use crate::policy::PolicyArm;
use crate::respawn::RespawnSettings;
use crate::session::{OneShotOptions, Session, SessionConfig};

fn test_config() -> Config {
    let mut config = Config::default();
    config.use_mux = Some(false);
    config.completion_confirm_ms = 50;
    config.auto_retry_delay_ms = 100;
    config
}

fn shell_session(config: Config) -> Session {
    Session::new(SessionConfig::new(std::env::temp_dir(), config))
}

fn respawn_settings() -> RespawnSettings {
    RespawnSettings {
        step_timeout: Duration::from_secs(5),
        inter_step_delay: Duration::from_millis(50),
        ..RespawnSettings::default()
    }
}

/// Wait (bounded) for an event matching `pred`.
async fn wait_for(
    rx: &mut broadcast::Receiver<SessionEvent>,
    wait: Duration,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> Option<SessionEvent> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        match timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) => {
                if pred(&event) {
                    return Some(event);
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            _ => return None,
        }
    }
}

/// Script a fake agent binary in a temp dir; returns (dir guard, path).
fn script_agent(body: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("fake-agent");
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("meta").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    (dir, path.display().to_string())
}

#[tokio::test]
async fn write_is_dropped_when_unattached() {
    let session = shell_session(test_config());
    assert!(!session.write("ls\n").await);
    assert!(!session.is_attached());
}

#[tokio::test]
async fn double_start_is_rejected() {
    let session = shell_session(test_config());
    session
        .start_attached(SessionMode::Shell, vec!["sleep".to_owned(), "10".to_owned()])
        .await
        .expect("first start");
    let second = session
        .start_attached(SessionMode::Shell, vec!["sleep".to_owned(), "10".to_owned()])
        .await;
    assert!(second.is_err());
    session.stop(true).await;
}

#[tokio::test]
async fn shell_reports_idle_after_ready_delay() {
    let session = shell_session(test_config());
    let mut events = session.subscribe();
    session
        .start_attached(SessionMode::Shell, vec!["sleep".to_owned(), "10".to_owned()])
        .await
        .expect("start");
    assert_eq!(session.status(), SessionStatus::Busy);

    let idled = wait_for(&mut events, Duration::from_secs(3), |e| {
        matches!(e, SessionEvent::Status { next: SessionStatus::Idle, .. })
    })
    .await;
    assert!(idled.is_some(), "expected idle after shell ready delay");
    session.stop(true).await;
}

#[tokio::test]
async fn exit_event_fires_on_child_exit() {
    let session = shell_session(test_config());
    let mut events = session.subscribe();
    session
        .start_attached(
            SessionMode::Shell,
            vec!["sh".to_owned(), "-c".to_owned(), "echo done".to_owned()],
        )
        .await
        .expect("start");

    let exited = wait_for(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SessionEvent::Exit(status) if status.code == Some(0))
    })
    .await;
    assert!(exited.is_some(), "expected exit(0)");
    assert!(!session.is_attached());
}

#[tokio::test]
async fn prompt_detection_leads_to_idle() {
    // Scenario: a green ❯ appears, then silence; after the confirmation
    // window the session reports idle.
    let session = shell_session(test_config());
    let mut events = session.subscribe();
    session
        .start_attached(
            SessionMode::AgentInteractive,
            vec![
                "sh".to_owned(),
                "-c".to_owned(),
                "printf '\\033[32m\\342\\235\\257\\033[0m '; sleep 10".to_owned(),
            ],
        )
        .await
        .expect("start");

    let idled = wait_for(&mut events, Duration::from_secs(4), |e| {
        matches!(e, SessionEvent::Status { next: SessionStatus::Idle, .. })
    })
    .await;
    assert!(idled.is_some(), "expected idle after prompt detection");
    session.stop(true).await;
}

#[tokio::test]
async fn completion_message_starts_respawn_cycle() {
    // Scenario: completion summary with AI confirmation disabled drives a
    // cycle whose update step goes out with a trailing carriage return.
    let config = test_config();
    let session = Session::new(
        SessionConfig::new(std::env::temp_dir(), config).with_respawn(respawn_settings()),
    );
    let mut events = session.subscribe();
    session
        .start_attached(
            SessionMode::AgentInteractive,
            vec![
                "sh".to_owned(),
                "-c".to_owned(),
                // cat keeps the child alive to receive the update prompt.
                "printf 'Worked for 2m 46s\\n'; cat >/dev/null".to_owned(),
            ],
        )
        .await
        .expect("start");

    let started = wait_for(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SessionEvent::Respawn(RespawnEvent::CycleStarted(1)))
    })
    .await;
    assert!(started.is_some(), "expected respawnCycleStarted(1)");

    let sent = wait_for(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SessionEvent::Respawn(RespawnEvent::StepSent(RespawnStep::Update)))
    })
    .await;
    assert!(sent.is_some(), "expected stepSent(update)");
    session.stop(true).await;
}

#[tokio::test]
async fn working_pattern_cancels_respawn_confirmation() {
    let mut config = test_config();
    // A wide confirmation window so the working pattern lands inside it.
    config.completion_confirm_ms = 1_000;
    let session = Session::new(
        SessionConfig::new(std::env::temp_dir(), config).with_respawn(respawn_settings()),
    );
    let mut events = session.subscribe();
    session
        .start_attached(
            SessionMode::AgentInteractive,
            vec![
                "sh".to_owned(),
                "-c".to_owned(),
                "printf 'Worked for 2m 46s\\n'; sleep 0.3; \
                 printf 'Thinking... \\342\\240\\213\\n'; sleep 10"
                    .to_owned(),
            ],
        )
        .await
        .expect("start");

    let started = wait_for(&mut events, Duration::from_secs(2), |e| {
        matches!(e, SessionEvent::Respawn(RespawnEvent::CycleStarted(_)))
    })
    .await;
    assert!(started.is_none(), "working pattern must cancel the cycle");
    session.stop(true).await;
}

#[tokio::test]
async fn token_status_feeds_counters_and_auto_compact() {
    let config = test_config();
    let session = Session::new(
        SessionConfig::new(std::env::temp_dir(), config).with_auto_compact(PolicyArm {
            enabled: true,
            threshold: 110_000,
            prompt: None,
        }),
    );
    let mut events = session.subscribe();
    session
        .start_attached(
            SessionMode::AgentInteractive,
            vec![
                "sh".to_owned(),
                "-c".to_owned(),
                "printf '\\033[2m 123.4k tokens \\033[0m\\n'; \
                 printf '\\342\\235\\257 '; cat >/dev/null"
                    .to_owned(),
            ],
        )
        .await
        .expect("start");

    let compacted = wait_for(&mut events, Duration::from_secs(6), |e| {
        matches!(e, SessionEvent::AutoCompact)
    })
    .await;
    assert!(compacted.is_some(), "expected autoCompact once idle");

    let record = session.snapshot();
    assert_eq!(record.input_tokens + record.output_tokens, 123_400);
    assert_eq!(record.input_tokens, 74_040);
    session.stop(true).await;
}

#[tokio::test]
async fn oneshot_resolves_result_and_cost() {
    let (_guard, agent) = script_agent(
        r#"echo '{"type":"system","session_id":"s1"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}],"usage":{"input_tokens":10,"output_tokens":2}}}'
echo '{"type":"result","result":"hi","total_cost_usd":0.0001}'
exit 0"#,
    );
    let mut config = test_config();
    config.agent_bin = agent;
    let session = shell_session(config);

    let outcome = session
        .start_oneshot("hello", OneShotOptions::default())
        .await
        .expect("one-shot success");
    assert_eq!(outcome.result, "hi");
    assert!((outcome.cost - 0.0001).abs() < 1e-9);

    let record = session.snapshot();
    assert_eq!(record.input_tokens, 10);
    assert_eq!(record.output_tokens, 2);
    assert!((record.total_cost_usd - 0.0001).abs() < 1e-9);
}

#[tokio::test]
async fn oneshot_error_exit_rejects() {
    let (_guard, agent) = script_agent("echo not json at all\nexit 3");
    let mut config = test_config();
    config.agent_bin = agent;
    let session = shell_session(config);

    let outcome = session.start_oneshot("hello", OneShotOptions::default()).await;
    assert!(outcome.is_err());
}

#[tokio::test]
async fn stop_rejects_pending_oneshot_and_is_idempotent() {
    let (_guard, agent) = script_agent("sleep 30");
    let mut config = test_config();
    config.agent_bin = agent;
    let session = std::sync::Arc::new(shell_session(config));

    let runner = std::sync::Arc::clone(&session);
    let pending =
        tokio::spawn(
            async move { runner.start_oneshot("hello", OneShotOptions::default()).await },
        );

    // Give the spawn a moment to attach, then stop.
    tokio::time::sleep(Duration::from_millis(300)).await;
    session.stop(true).await;

    let result = pending.await.expect("join");
    let err = match result {
        Err(e) => e.to_string(),
        Ok(v) => panic!("expected rejection, got {v:?}"),
    };
    assert!(err.contains("Session stopped"), "unexpected error: {err}");
    assert_eq!(session.status(), SessionStatus::Stopped);

    // Second stop is a no-op.
    session.stop(true).await;
    assert_eq!(session.status(), SessionStatus::Stopped);

    // Writes after stop are dropped.
    assert!(!session.write("x").await);
}

#[tokio::test]
async fn status_events_never_skip() {
    let session = shell_session(test_config());
    let mut events = session.subscribe();
    session
        .start_attached(
            SessionMode::Shell,
            vec!["sh".to_owned(), "-c".to_owned(), "echo hi".to_owned()],
        )
        .await
        .expect("start");

    let mut last: Option<SessionStatus> = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Ok(SessionEvent::Status { prev, next, .. })) => {
                if let Some(expected) = last {
                    assert_eq!(prev, expected, "skipped status transition");
                }
                last = Some(next);
            }
            Ok(Ok(SessionEvent::Exit(_))) => break,
            Ok(Ok(_)) => {}
            _ => {}
        }
    }
    assert!(last.is_some());
}

#[tokio::test]
async fn restore_tokens_round_trips_through_snapshot() {
    let session = shell_session(test_config());
    session.restore_tokens(300, 200, 0.5).expect("restore");
    let record = session.snapshot();
    assert_eq!(record.input_tokens, 300);
    assert_eq!(record.output_tokens, 200);
    assert!((record.total_cost_usd - 0.5).abs() < f64::EPSILON);

    // Restoring the snapshot back is the identity.
    session
        .restore_tokens(
            record.input_tokens as i64,
            record.output_tokens as i64,
            record.total_cost_usd,
        )
        .expect("identity restore");
    let again = session.snapshot();
    assert_eq!(again.input_tokens, record.input_tokens);
    assert_eq!(again.output_tokens, record.output_tokens);

    // Invalid restores leave counters unchanged.
    assert!(session.restore_tokens(-1, 0, 0.0).is_err());
    let unchanged = session.snapshot();
    assert_eq!(unchanged.input_tokens, 300);
}

#[tokio::test]
async fn completion_phrase_emitted_under_loop_policy() {
    let session = Session::new(
        SessionConfig::new(std::env::temp_dir(), test_config()).with_completion_phrases(),
    );
    let mut events = session.subscribe();
    session
        .start_attached(
            SessionMode::AgentInteractive,
            vec![
                "sh".to_owned(),
                "-c".to_owned(),
                "printf 'done <promise>ALL_TESTS_PASS</promise>\\n'; sleep 5".to_owned(),
            ],
        )
        .await
        .expect("start");

    let phrase = wait_for(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SessionEvent::CompletionPhrase(p) if p == "ALL_TESTS_PASS")
    })
    .await;
    assert!(phrase.is_some(), "expected completion phrase event");
    session.stop(true).await;
}

#[tokio::test]
async fn todo_lines_surface_through_the_session() {
    let session = shell_session(test_config());
    let mut events = session.subscribe();
    session
        .start_attached(
            SessionMode::AgentInteractive,
            vec![
                "sh".to_owned(),
                "-c".to_owned(),
                "printf '%s\\n' '- [ ] write docs' '- [x] ship it'; sleep 5".to_owned(),
            ],
        )
        .await
        .expect("start");

    let updated = wait_for(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SessionEvent::TodosUpdated(todos) if todos.len() == 2)
    })
    .await;
    assert!(updated.is_some(), "expected todo update event");
    let todos = session.todos();
    assert!(todos.iter().any(|t| t.content == "write docs"));
    session.stop(true).await;
}

#[tokio::test]
async fn stuck_partial_line_is_flushed_to_text_buffer() {
    let session = shell_session(test_config());
    session
        .start_attached(
            SessionMode::AgentInteractive,
            vec![
                "sh".to_owned(),
                "-c".to_owned(),
                // No trailing newline: the splitter holds a partial line
                // until the idle flush kicks in.
                "printf 'no newline here'; sleep 5".to_owned(),
            ],
        )
        .await
        .expect("start");

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(session.text_buffer().contains("no newline here"));
    session.stop(true).await;
}

#[tokio::test]
async fn hook_signals_are_dropped_when_unattached() {
    let session = shell_session(test_config());
    // Must not panic or wedge anything.
    session.signal_stop_hook();
    session.signal_idle_prompt();
    session.signal_elicitation();
}
