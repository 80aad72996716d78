// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::io::Write;
use std::time::Duration;

use super::*;

#[test]
fn parse_hook_lines() {
    assert_eq!(super::parse_hook_line(r#"{"event":"stop"}"#), Some(HookSignal::Stop));
    assert_eq!(
        super::parse_hook_line(r#"{"event":"agent_stop","data":{}}"#),
        Some(HookSignal::Stop)
    );
    assert_eq!(
        super::parse_hook_line(r#"{"event":"idle_prompt"}"#),
        Some(HookSignal::IdlePrompt)
    );
    assert_eq!(
        super::parse_hook_line(r#"{"event":"elicitation"}"#),
        Some(HookSignal::Elicitation)
    );
    assert_eq!(super::parse_hook_line(r#"{"event":"tool_use"}"#), None);
    assert_eq!(super::parse_hook_line("not json"), None);
}

#[tokio::test]
async fn receiver_reads_signals_from_fifo() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pipe = dir.path().join("hooks.pipe");
    let mut receiver = HookReceiver::new(&pipe).expect("mkfifo");
    assert_eq!(receiver.pipe_path(), pipe.as_path());

    // Writer opens after the receiver created the FIFO.
    let writer_path = pipe.clone();
    let writer = tokio::task::spawn_blocking(move || {
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .open(&writer_path)
            .expect("open fifo for write");
        writeln!(f, "{}", r#"{"event":"unknown"}"#).expect("write");
        writeln!(f, "garbage line").expect("write");
        writeln!(f, "{}", r#"{"event":"stop"}"#).expect("write");
        writeln!(f, "{}", r#"{"event":"idle_prompt"}"#).expect("write");
    });

    let first = tokio::time::timeout(Duration::from_secs(5), receiver.next_signal())
        .await
        .expect("no timeout");
    assert_eq!(first, Some(HookSignal::Stop));

    let second = tokio::time::timeout(Duration::from_secs(5), receiver.next_signal())
        .await
        .expect("no timeout");
    assert_eq!(second, Some(HookSignal::IdlePrompt));

    writer.await.expect("writer join");
}

#[tokio::test]
async fn fifo_is_removed_on_drop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pipe = dir.path().join("hooks.pipe");
    {
        let _receiver = HookReceiver::new(&pipe).expect("mkfifo");
        assert!(pipe.exists());
    }
    assert!(!pipe.exists());
}
