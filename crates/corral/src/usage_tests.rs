// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn message_usage_accumulates() {
    let mut counters = TokenCounters::new();
    assert!(counters.apply_message(10, 2).is_ok());
    assert!(counters.apply_message(5, 1).is_ok());
    assert_eq!(counters.totals().input_tokens, 15);
    assert_eq!(counters.totals().output_tokens, 3);
}

#[test]
fn per_message_ceiling_drops_whole_message() {
    let mut counters = TokenCounters::new();
    let rejection = counters.apply_message(MAX_TOKENS_PER_MESSAGE + 1, 0);
    assert_eq!(rejection, Err(UsageRejection::PerMessageCeiling));
    assert_eq!(counters.combined(), 0);
}

#[test]
fn session_ceiling_rejects_crossing_update() {
    let mut counters = TokenCounters::new();
    for _ in 0..5 {
        assert!(counters.apply_message(MAX_TOKENS_PER_MESSAGE, 0).is_ok());
    }
    assert_eq!(counters.combined(), MAX_SESSION_TOKENS);
    assert_eq!(counters.apply_message(1, 0), Err(UsageRejection::SessionCeiling));
    assert_eq!(counters.combined(), MAX_SESSION_TOKENS);
}

#[test]
fn status_total_splits_sixty_forty() {
    let mut counters = TokenCounters::new();
    assert!(counters.apply_status_total(123_400).is_ok());
    assert_eq!(counters.combined(), 123_400);
    assert_eq!(counters.totals().input_tokens, 74_040);
    assert_eq!(counters.totals().output_tokens, 49_360);
}

#[test]
fn status_total_must_strictly_increase() {
    let mut counters = TokenCounters::new();
    assert!(counters.apply_status_total(1_000).is_ok());
    assert_eq!(counters.apply_status_total(1_000), Err(UsageRejection::Stale));
    assert_eq!(counters.apply_status_total(500), Err(UsageRejection::Stale));
    assert_eq!(counters.combined(), 1_000);
}

#[test]
fn status_delta_ceiling() {
    let mut counters = TokenCounters::new();
    assert_eq!(
        counters.apply_status_total(MAX_TOKEN_DELTA + 1),
        Err(UsageRejection::DeltaCeiling)
    );
    assert_eq!(counters.combined(), 0);
}

#[test]
fn reset_zeroes_tokens_but_keeps_cost() {
    let mut counters = TokenCounters::new();
    assert!(counters.apply_message(100, 50).is_ok());
    counters.add_cost(0.25);
    counters.reset_tokens();
    assert_eq!(counters.combined(), 0);
    assert!((counters.totals().total_cost_usd - 0.25).abs() < f64::EPSILON);
    // Counters move forward again from zero after a reset.
    assert!(counters.apply_status_total(10).is_ok());
}

#[test]
fn cost_ignores_negative_and_non_finite() {
    let mut counters = TokenCounters::new();
    counters.add_cost(-1.0);
    counters.add_cost(f64::NAN);
    counters.add_cost(0.0001);
    assert!((counters.totals().total_cost_usd - 0.0001).abs() < f64::EPSILON);
}

#[test]
fn restore_round_trip_is_identity() {
    let mut counters = TokenCounters::new();
    assert!(counters.apply_message(300, 200).is_ok());
    counters.add_cost(0.5);
    let saved = counters.totals().clone();

    let mut restored = TokenCounters::new();
    assert!(restored
        .restore(
            saved.input_tokens as i64,
            saved.output_tokens as i64,
            saved.total_cost_usd
        )
        .is_ok());
    assert_eq!(restored.totals(), &saved);
}

#[test]
fn restore_rejects_invalid_values() {
    let mut counters = TokenCounters::new();
    assert!(counters.apply_message(10, 10).is_ok());
    let before = counters.totals().clone();

    assert_eq!(counters.restore(-1, 0, 0.0), Err(UsageRejection::InvalidRestore));
    assert_eq!(
        counters.restore(MAX_SESSION_TOKENS as i64 + 1, 0, 0.0),
        Err(UsageRejection::InvalidRestore)
    );
    assert_eq!(counters.restore(1, 1, -0.5), Err(UsageRejection::InvalidRestore));
    assert_eq!(counters.totals(), &before);
}
