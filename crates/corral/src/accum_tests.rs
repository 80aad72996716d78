// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::BoundedAccumulator;

#[test]
fn append_and_read() {
    let mut acc = BoundedAccumulator::new(64, 32);
    acc.append("hello");
    acc.append(" world");
    assert_eq!(acc.value(), "hello world");
    assert_eq!(acc.len(), 11);
}

#[test]
fn trims_to_most_recent_tail() {
    let mut acc = BoundedAccumulator::new(10, 4);
    acc.append("abcdefgh");
    acc.append("ijkl"); // 12 bytes > max 10
    assert_eq!(acc.value(), "ijkl");
    assert_eq!(acc.len(), 4);
}

#[test]
fn trim_keeps_at_least_trim_size() {
    let mut acc = BoundedAccumulator::new(100, 80);
    let chunk = "x".repeat(30);
    for _ in 0..5 {
        acc.append(&chunk);
    }
    assert!(acc.len() <= 100);
    assert!(acc.len() >= 80);
}

#[test]
fn trim_respects_char_boundaries() {
    let mut acc = BoundedAccumulator::new(10, 4);
    // Multibyte content: each '❯' is 3 bytes. The cut backs up to a
    // boundary, so the tail is at least trim_size and always valid UTF-8.
    acc.append("❯❯❯❯"); // 12 bytes
    assert!(acc.value().chars().all(|c| c == '\u{276f}'));
    assert!(acc.len() >= 4);
    assert!(acc.len() <= 6);
}

#[test]
fn clear_and_set() {
    let mut acc = BoundedAccumulator::new(64, 32);
    acc.append("data");
    acc.clear();
    assert!(acc.is_empty());
    acc.set("replaced".to_owned());
    assert_eq!(acc.value(), "replaced");
}

#[test]
fn set_applies_cap() {
    let mut acc = BoundedAccumulator::new(8, 4);
    acc.set("abcdefghij".to_owned());
    assert_eq!(acc.value(), "ghij");
}

#[test]
fn tail_snaps_to_boundary() {
    let mut acc = BoundedAccumulator::new(64, 32);
    acc.append("ab❯cd");
    // A tail cut landing inside the 3-byte '❯' moves forward past it.
    let t = acc.tail(4);
    assert_eq!(t, "cd");
    assert_eq!(acc.tail(100), "ab❯cd");
}

#[test]
fn swapped_sizes_still_hold_invariant() {
    let mut acc = BoundedAccumulator::new(4, 10);
    acc.append("abcdefghijkl");
    assert!(acc.trim_size() < acc.max_size());
    assert!(acc.len() <= acc.max_size());
}
