// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn non_json_lines_fall_through() {
    assert!(parse_message("plain output").is_none());
    assert!(parse_message("{truncated").is_none());
    assert!(parse_message("{not json}").is_none());
    assert!(parse_message("[1,2,3]").is_none());
}

#[test]
fn system_message_carries_session_id() {
    let msg = parse_message(r#"{"type":"system","session_id":"s1"}"#);
    match msg {
        Some(AgentMessage::System { session_id, .. }) => {
            assert_eq!(session_id.as_deref(), Some("s1"));
        }
        other => panic!("expected System, got {other:?}"),
    }
}

#[test]
fn assistant_message_extracts_text_and_usage() {
    let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"},{"type":"tool_use","name":"Bash"},{"type":"text","text":"there"}],"usage":{"input_tokens":10,"output_tokens":2}}}"#;
    match parse_message(line) {
        Some(AgentMessage::Assistant { text_blocks, input_tokens, output_tokens, .. }) => {
            assert_eq!(text_blocks, vec!["hi".to_owned(), "there".to_owned()]);
            assert_eq!(input_tokens, 10);
            assert_eq!(output_tokens, 2);
        }
        other => panic!("expected Assistant, got {other:?}"),
    }
}

#[test]
fn result_message_fields() {
    let line = r#"{"type":"result","result":"hi","is_error":false,"total_cost_usd":0.0001}"#;
    match parse_message(line) {
        Some(AgentMessage::Result { result, is_error, total_cost_usd, .. }) => {
            assert_eq!(result.as_deref(), Some("hi"));
            assert!(!is_error);
            assert_eq!(total_cost_usd, Some(0.0001));
        }
        other => panic!("expected Result, got {other:?}"),
    }
}

#[test]
fn unknown_type_round_trips_as_other() {
    let msg = parse_message(r#"{"type":"telemetry","n":1}"#);
    match msg {
        Some(AgentMessage::Other { raw }) => {
            assert_eq!(raw.get("n").and_then(serde_json::Value::as_u64), Some(1));
        }
        other => panic!("expected Other, got {other:?}"),
    }
    // Missing type entirely is also Other.
    assert!(matches!(parse_message(r#"{"x":1}"#), Some(AgentMessage::Other { .. })));
}

#[test]
fn user_message_passes_through() {
    assert!(matches!(
        parse_message(r#"{"type":"user","message":{}}"#),
        Some(AgentMessage::User { .. })
    ));
}

#[test]
fn log_truncates_to_eighty_percent() {
    let mut log = MessageLog::new(10);
    for i in 0..11 {
        log.push(AgentMessage::Other { raw: serde_json::json!({ "i": i }) });
    }
    // 11 messages against cap 10 → keep the last 8.
    assert_eq!(log.len(), 8);
    let first = log.messages()[0].raw().get("i").and_then(serde_json::Value::as_u64);
    assert_eq!(first, Some(3));
}

#[test]
fn log_clear() {
    let mut log = MessageLog::new(4);
    log.push(AgentMessage::Other { raw: serde_json::json!({}) });
    assert!(!log.is_empty());
    log.clear();
    assert!(log.is_empty());
}
