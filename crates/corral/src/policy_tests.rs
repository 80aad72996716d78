// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::{Duration, Instant};

use super::*;

fn policy(compact_at: u64, clear_at: u64) -> ContextPolicy {
    ContextPolicy::new(
        PolicyArm { enabled: compact_at > 0, threshold: compact_at, prompt: None },
        PolicyArm { enabled: clear_at > 0, threshold: clear_at, prompt: None },
    )
}

#[test]
fn compact_fires_at_threshold_once_idle() {
    let mut p = policy(110_000, 0);
    let t0 = Instant::now();

    p.on_tokens(100_000, t0);
    assert!(!p.in_progress());

    p.on_tokens(123_400, t0);
    assert!(p.in_progress());

    // Still working → no decision yet.
    assert!(p.poll(false, false, t0).is_none());

    let decision = p.poll(true, false, t0).expect("decision");
    assert_eq!(decision.kind, PolicyKind::Compact);
    assert_eq!(decision.command, "/compact");
    assert!(!decision.resets_tokens);
}

#[test]
fn compact_prompt_is_appended() {
    let mut p = ContextPolicy::new(
        PolicyArm {
            enabled: true,
            threshold: 10,
            prompt: Some("keep the task list".to_owned()),
        },
        PolicyArm::disabled(),
    );
    let t0 = Instant::now();
    p.on_tokens(11, t0);
    let decision = p.poll(true, false, t0).expect("decision");
    assert_eq!(decision.command, "/compact keep the task list");
}

#[test]
fn clear_wins_over_compact_and_resets() {
    let mut p = policy(100, 200);
    let t0 = Instant::now();
    p.on_tokens(250, t0);
    let decision = p.poll(true, false, t0).expect("decision");
    assert_eq!(decision.kind, PolicyKind::Clear);
    assert_eq!(decision.command, "/clear");
    assert!(decision.resets_tokens);
}

#[test]
fn guard_debounces_repeat_triggers() {
    let mut p = policy(100, 0);
    let t0 = Instant::now();
    p.on_tokens(150, t0);
    let decision = p.poll(true, false, t0).expect("decision");
    p.sent(decision.kind, t0);

    // Within the 10s guard nothing re-arms, even above threshold.
    p.on_tokens(180, t0 + Duration::from_secs(5));
    assert!(!p.in_progress());
    assert!(p.poll(true, false, t0 + Duration::from_secs(5)).is_none());

    // After the guard the arm can fire again.
    p.on_tokens(180, t0 + Duration::from_secs(11));
    assert!(p.in_progress());
}

#[test]
fn stopped_cancels_pending() {
    let mut p = policy(100, 0);
    let t0 = Instant::now();
    p.on_tokens(150, t0);
    assert!(p.in_progress());
    assert!(p.poll(true, true, t0).is_none());
    assert!(!p.in_progress());
}

#[test]
fn disabled_arms_never_fire() {
    let mut p = policy(0, 0);
    let t0 = Instant::now();
    p.on_tokens(u64::MAX, t0);
    assert!(!p.in_progress());
}

#[test]
fn events_match_kind() {
    let compact = PolicyDecision {
        kind: PolicyKind::Compact,
        command: "/compact".to_owned(),
        resets_tokens: false,
    };
    assert!(matches!(compact.event(), crate::event::SessionEvent::AutoCompact));
    let clear = PolicyDecision {
        kind: PolicyKind::Clear,
        command: "/clear".to_owned(),
        resets_tokens: true,
    };
    assert!(matches!(clear.event(), crate::event::SessionEvent::AutoClear));
}
