// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::{Duration, Instant};

use super::*;
use crate::event::{RespawnState, RespawnStep};

fn settings() -> RespawnSettings {
    RespawnSettings {
        update_prompt: "update all the docs".to_owned(),
        send_clear: true,
        send_init: false,
        clear_command: "/clear".to_owned(),
        init_command: "/init".to_owned(),
        step_timeout: Duration::from_secs(30),
        inter_step_delay: Duration::from_secs(1),
    }
}

fn controller() -> RespawnController {
    let mut c = RespawnController::new(settings());
    let _ = c.start();
    c
}

/// Collect the `next` states of every Transition action, in order.
fn transitions(actions: &[RespawnAction]) -> Vec<RespawnState> {
    actions
        .iter()
        .filter_map(|a| match a {
            RespawnAction::Transition { next, .. } => Some(*next),
            _ => None,
        })
        .collect()
}

#[test]
fn starts_in_stopped_then_watching() {
    let mut c = RespawnController::new(settings());
    assert_eq!(c.state(), RespawnState::Stopped);
    let actions = c.start();
    assert_eq!(transitions(&actions), vec![RespawnState::Watching]);
    // start is idempotent once watching.
    assert!(c.start().is_empty());
}

#[test]
fn watching_only_reaches_confirming_idle_first() {
    let mut c = controller();
    let actions = c.confirmed_idle(Instant::now());
    // Even a bypassing confirmation passes through confirming_idle.
    let states = transitions(&actions);
    assert_eq!(states[0], RespawnState::ConfirmingIdle);
    assert_eq!(states[1], RespawnState::SendingUpdate);
    assert!(actions.contains(&RespawnAction::CycleStarted(1)));
    assert!(actions.contains(&RespawnAction::SendStep {
        step: RespawnStep::Update,
        input: "update all the docs".to_owned(),
    }));
}

#[test]
fn transitions_carry_correct_prev() {
    let mut c = controller();
    let mut last = RespawnState::Watching;
    let mut all = c.idle_confirming();
    all.extend(c.ai_checking());
    all.extend(c.confirmed_idle(Instant::now()));
    for action in &all {
        if let RespawnAction::Transition { next, prev } = action {
            assert_eq!(*prev, last, "skipped transition before {next:?}");
            last = *next;
        }
    }
    assert_eq!(last, RespawnState::SendingUpdate);
}

#[test]
fn full_cycle_update_then_clear() {
    let mut c = controller();
    let t0 = Instant::now();

    let _ = c.idle_confirming();
    let actions = c.confirmed_idle(t0);
    assert_eq!(c.state(), RespawnState::SendingUpdate);
    assert!(actions.iter().any(|a| matches!(a, RespawnAction::SendStep { step: RespawnStep::Update, .. })));

    let actions = c.step_sent(t0);
    assert_eq!(transitions(&actions), vec![RespawnState::WaitingUpdate]);

    // Update finished (idle confirmed during the wait).
    let actions = c.confirmed_idle(t0 + Duration::from_secs(5));
    assert!(actions.contains(&RespawnAction::StepCompleted(RespawnStep::Update)));
    assert_eq!(c.state(), RespawnState::SendingClear);

    // Clear is queued behind the inter-step delay.
    assert!(c.tick(t0 + Duration::from_secs(5)).is_empty());
    let actions = c.tick(t0 + Duration::from_secs(7));
    assert!(actions.contains(&RespawnAction::ResetTokens));
    assert!(actions.iter().any(|a| matches!(
        a,
        RespawnAction::SendStep { step: RespawnStep::Clear, input } if input == "/clear"
    )));

    let _ = c.step_sent(t0 + Duration::from_secs(7));
    assert_eq!(c.state(), RespawnState::WaitingClear);

    // No init configured: the cycle closes out.
    let actions = c.confirmed_idle(t0 + Duration::from_secs(9));
    assert!(actions.contains(&RespawnAction::StepCompleted(RespawnStep::Clear)));
    assert!(actions.contains(&RespawnAction::CycleCompleted));
    assert_eq!(c.state(), RespawnState::Watching);
    assert_eq!(c.cycle(), 1);
}

#[test]
fn init_step_runs_when_configured() {
    let mut s = settings();
    s.send_init = true;
    let mut c = RespawnController::new(s);
    let _ = c.start();
    let t0 = Instant::now();

    let _ = c.confirmed_idle(t0);
    let _ = c.step_sent(t0);
    let _ = c.confirmed_idle(t0 + Duration::from_secs(1)); // update done → clear queued
    let _ = c.tick(t0 + Duration::from_secs(3));
    let _ = c.step_sent(t0 + Duration::from_secs(3));
    let _ = c.confirmed_idle(t0 + Duration::from_secs(4)); // clear done → init queued
    assert_eq!(c.state(), RespawnState::SendingInit);

    let actions = c.tick(t0 + Duration::from_secs(6));
    assert!(actions.iter().any(|a| matches!(
        a,
        RespawnAction::SendStep { step: RespawnStep::Init, input } if input == "/init"
    )));
    let _ = c.step_sent(t0 + Duration::from_secs(6));
    let actions = c.confirmed_idle(t0 + Duration::from_secs(8));
    assert!(actions.contains(&RespawnAction::CycleCompleted));
    assert_eq!(c.state(), RespawnState::Watching);
}

#[test]
fn step_timeout_advances_with_log() {
    let mut c = controller();
    let t0 = Instant::now();
    let _ = c.confirmed_idle(t0);
    let _ = c.step_sent(t0);
    assert_eq!(c.state(), RespawnState::WaitingUpdate);

    // Nothing before the deadline.
    assert!(c.tick(t0 + Duration::from_secs(29)).is_empty());

    let actions = c.tick(t0 + Duration::from_secs(31));
    assert!(actions.contains(&RespawnAction::StepCompleted(RespawnStep::Update)));
    assert!(actions.iter().any(|a| matches!(a, RespawnAction::Log(_))));
    assert_eq!(c.state(), RespawnState::SendingClear);
}

#[test]
fn working_during_confirmation_cancels_cycle() {
    let mut c = controller();
    let _ = c.idle_confirming();
    assert_eq!(c.state(), RespawnState::ConfirmingIdle);
    let actions = c.working_detected(Instant::now());
    assert_eq!(transitions(&actions), vec![RespawnState::Watching]);
    assert_eq!(c.cycle(), 0);
}

#[test]
fn working_during_wait_extends_deadline() {
    let mut c = controller();
    let t0 = Instant::now();
    let _ = c.confirmed_idle(t0);
    let _ = c.step_sent(t0);

    // Working at t0+20s pushes the deadline to t0+50s.
    assert!(c.working_detected(t0 + Duration::from_secs(20)).is_empty());
    assert_eq!(c.state(), RespawnState::WaitingUpdate);
    assert!(c.tick(t0 + Duration::from_secs(35)).is_empty());
    assert!(!c.tick(t0 + Duration::from_secs(51)).is_empty());
}

#[test]
fn stop_from_any_state_and_idempotent() {
    let mut c = controller();
    let t0 = Instant::now();
    let _ = c.confirmed_idle(t0);
    let _ = c.step_sent(t0);

    let actions = c.stop();
    assert_eq!(transitions(&actions), vec![RespawnState::Stopped]);
    assert!(c.next_deadline().is_none());
    // Second stop is a no-op.
    assert!(c.stop().is_empty());
    // Signals after stop do nothing.
    assert!(c.confirmed_idle(t0).is_empty());
    assert!(c.tick(t0 + Duration::from_secs(60)).is_empty());
}

#[test]
fn pause_freezes_and_resume_only_in_watching() {
    let mut c = controller();
    c.pause();
    assert!(c.confirmed_idle(Instant::now()).is_empty());
    assert_eq!(c.state(), RespawnState::Watching);

    c.resume();
    assert!(!c.is_paused());

    // Pause mid-cycle: resume is a no-op until back in watching.
    let t0 = Instant::now();
    let _ = c.confirmed_idle(t0);
    c.pause();
    c.resume();
    assert!(c.is_paused());
}

#[test]
fn cycle_counter_is_monotone_and_resets_on_configure() {
    let mut c = controller();
    let t0 = Instant::now();

    for i in 1..=3u64 {
        let actions = c.confirmed_idle(t0);
        assert!(actions.contains(&RespawnAction::CycleStarted(i)));
        let _ = c.step_sent(t0);
        let _ = c.confirmed_idle(t0); // update done
        let _ = c.tick(t0 + Duration::from_secs(2)); // send clear
        let _ = c.step_sent(t0);
        let _ = c.confirmed_idle(t0); // clear done → watching
        assert_eq!(c.state(), RespawnState::Watching);
    }
    assert_eq!(c.cycle(), 3);

    c.configure(settings());
    assert_eq!(c.cycle(), 0);
}

#[test]
fn next_deadline_prefers_earliest() {
    let mut c = controller();
    let t0 = Instant::now();
    let _ = c.confirmed_idle(t0);
    let _ = c.step_sent(t0);
    assert_eq!(c.next_deadline(), Some(t0 + Duration::from_secs(30)));
}
