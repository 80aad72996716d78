// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized recognizers for the terminal stream.
//!
//! Every regex the engine runs against child output is compiled here, once,
//! so each recognizer can be tested in isolation. Callers should do cheap
//! substring pre-checks (e.g. `contains("token")`) before handing a chunk
//! to a regex.

use std::borrow::Cow;

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Prompt indicator rendered by the agent's input line (U+276F).
pub const PROMPT_CHAR: char = '\u{276f}';

/// Case-sensitive substrings that mean the agent is mid-turn.
pub const WORKING_LEXEMES: &[&str] = &["Thinking", "Writing", "Reading", "Running"];

/// Braille spinner frames the agent animates while working.
pub const SPINNER_CHARS: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

/// Status of a todo line parsed from the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

impl TodoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

/// Compiled recognizer set. Construct once and share.
pub struct PatternSet {
    csi: Regex,
    focus: Regex,
    leading_noise: Regex,
    token_status: Regex,
    tool_call: Regex,
    completion_message: Regex,
    completion_phrase: Regex,
    todo_bracket: Regex,
    todo_glyph: Regex,
    todo_suffix: Regex,
    iteration: Regex,
    bracket_counter: Regex,
    cycle: Regex,
    elapsed_hours: Regex,
    menu_selector: Regex,
    menu_item: Regex,
}

impl std::fmt::Debug for PatternSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternSet").finish_non_exhaustive()
    }
}

impl PatternSet {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            // CSI: ESC [ optional '?' private marker, digit/; params, letter final.
            csi: Regex::new(r"\x1b\[\??[0-9;]*[A-Za-z]").context("csi pattern")?,
            // Focus reporting enable/disable plus focus-in/out reports.
            focus: Regex::new(r"\x1b\[\?1004[hl]|\x1b\[[IO]").context("focus pattern")?,
            // Run of CSI sequences and whitespace at the very start of a buffer.
            leading_noise: Regex::new(r"^(?:\x1b\[\??[0-9;]*[A-Za-z]|\s)+")
                .context("leading-noise pattern")?,
            token_status: Regex::new(r"(\d+(?:\.\d+)?)\s*([kKmM])?\s*tokens")
                .context("token-status pattern")?,
            tool_call: Regex::new(r"\b(Explore|Task|Bash|Plan|general-purpose)\(([^)]+)\)")
                .context("tool-call pattern")?,
            // Bare turn summary, e.g. "Worked for 2m 46s" or "Worked for 12s".
            completion_message: Regex::new(r"Worked for\s+(?:\d+m(?:\s+\d+s)?|\d+s)\b")
                .context("completion-message pattern")?,
            completion_phrase: Regex::new(r"<promise>([A-Z0-9_-]+)</promise>")
                .context("completion-phrase pattern")?,
            todo_bracket: Regex::new(r"^\s*[-*]\s*\[( |x|X)\]\s+(.+?)\s*$")
                .context("todo-bracket pattern")?,
            todo_glyph: Regex::new(r"^\s*(◐|☐|✓|✅|⏳)\s+(.+?)\s*$")
                .context("todo-glyph pattern")?,
            todo_suffix: Regex::new(r"^\s*(.+?)\s+\((pending|in_progress|completed)\)\s*$")
                .context("todo-suffix pattern")?,
            iteration: Regex::new(r"\bIteration\s+(\d+)(?:\s*/\s*(\d+))?")
                .context("iteration pattern")?,
            bracket_counter: Regex::new(r"\[(\d+)/(\d+)\]").context("bracket-counter pattern")?,
            cycle: Regex::new(r"(?i)cycle\s*#\s*(\d+)").context("cycle pattern")?,
            elapsed_hours: Regex::new(r"(?i)\b(\d+(?:\.\d+)?)\s*hours?\b")
                .context("elapsed pattern")?,
            // Numbered-list selector glyph on an approval menu: "❯ 1."
            menu_selector: Regex::new(r"\u{276f}\s*1\.").context("menu-selector pattern")?,
            menu_item: Regex::new(r"(?m)^\s*\u{276f}?\s*\d\.\s+\S").context("menu-item pattern")?,
        })
    }

    /// Strip ANSI CSI sequences. Borrows when the input has none.
    pub fn strip_ansi<'a>(&self, text: &'a str) -> Cow<'a, str> {
        self.csi.replace_all(text, "")
    }

    /// Strip the run of CSI sequences and whitespace at the start of `text`.
    pub fn strip_leading_noise<'a>(&self, text: &'a str) -> &'a str {
        match self.leading_noise.find(text) {
            Some(m) if m.start() == 0 => &text[m.end()..],
            _ => text,
        }
    }

    /// Remove focus-report sequences (enable/disable and in/out reports).
    pub fn strip_focus_reports<'a>(&self, text: &'a str) -> Cow<'a, str> {
        self.focus.replace_all(text, "")
    }

    /// Parse a status-line token count from ANSI-stripped text.
    ///
    /// Suffix `k`/`K` multiplies by 10³ and `m`/`M` by 10⁶, except that an
    /// `m` suffix is rejected when the base exceeds 0.5 — a status line
    /// claiming "1.0M tokens" is treated as a misparse.
    pub fn parse_token_status(&self, text: &str) -> Option<u64> {
        let caps = self.token_status.captures(text)?;
        let base: f64 = caps.get(1)?.as_str().parse().ok()?;
        if base < 0.0 {
            return None;
        }
        let multiplier = match caps.get(2).map(|m| m.as_str()) {
            Some("k") | Some("K") => 1_000.0,
            Some("m") | Some("M") => {
                if base > 0.5 {
                    return None;
                }
                1_000_000.0
            }
            _ => 1.0,
        };
        Some((base * multiplier).round() as u64)
    }

    /// All tool-invocation descriptions in ANSI-stripped text, e.g.
    /// `Bash(ls -la)` → `"Bash(ls -la)"`.
    pub fn tool_invocations<'a>(&self, text: &'a str) -> Vec<&'a str> {
        self.tool_call.find_iter(text).map(|m| m.as_str()).collect()
    }

    /// Whether ANSI-stripped text carries a working lexeme or spinner frame.
    pub fn has_working_pattern(&self, text: &str) -> bool {
        if WORKING_LEXEMES.iter().any(|lex| text.contains(lex)) {
            return true;
        }
        text.chars().any(|c| SPINNER_CHARS.contains(&c))
    }

    /// Whether text carries a completion summary ("Worked for 2m 46s").
    pub fn has_completion_message(&self, text: &str) -> bool {
        self.completion_message.is_match(text)
    }

    /// The sentinel phrase from a `<promise>…</promise>` marker, if any.
    pub fn completion_phrase<'a>(&self, line: &'a str) -> Option<&'a str> {
        self.completion_phrase.captures(line).and_then(|c| c.get(1)).map(|m| m.as_str())
    }

    /// Parse a todo line in any of its three stream forms.
    pub fn parse_todo(&self, line: &str) -> Option<(String, TodoStatus)> {
        if let Some(caps) = self.todo_bracket.captures(line) {
            let status = match caps.get(1).map(|m| m.as_str()) {
                Some("x") | Some("X") => TodoStatus::Completed,
                _ => TodoStatus::Pending,
            };
            return Some((caps.get(2)?.as_str().to_owned(), status));
        }
        if let Some(caps) = self.todo_glyph.captures(line) {
            let status = match caps.get(1).map(|m| m.as_str()) {
                Some("✓") | Some("✅") => TodoStatus::Completed,
                Some("◐") => TodoStatus::InProgress,
                _ => TodoStatus::Pending,
            };
            return Some((caps.get(2)?.as_str().to_owned(), status));
        }
        if let Some(caps) = self.todo_suffix.captures(line) {
            let status = match caps.get(2).map(|m| m.as_str()) {
                Some("completed") => TodoStatus::Completed,
                Some("in_progress") => TodoStatus::InProgress,
                _ => TodoStatus::Pending,
            };
            return Some((caps.get(1)?.as_str().to_owned(), status));
        }
        None
    }

    /// Parse `Iteration N[/M]` or `[N/M]` from ANSI-stripped text.
    pub fn parse_iteration(&self, text: &str) -> Option<(u64, Option<u64>)> {
        if let Some(caps) = self.iteration.captures(text) {
            let current: u64 = caps.get(1)?.as_str().parse().ok()?;
            let total = caps.get(2).and_then(|m| m.as_str().parse().ok());
            return Some((current, total));
        }
        let caps = self.bracket_counter.captures(text)?;
        let current: u64 = caps.get(1)?.as_str().parse().ok()?;
        let total: u64 = caps.get(2)?.as_str().parse().ok()?;
        Some((current, Some(total)))
    }

    /// Parse `cycle #N` (case-insensitive).
    pub fn parse_cycle(&self, text: &str) -> Option<u64> {
        self.cycle.captures(text).and_then(|c| c.get(1)).and_then(|m| m.as_str().parse().ok())
    }

    /// Parse `N[.M] hour(s)` (case-insensitive).
    pub fn parse_elapsed_hours(&self, text: &str) -> Option<f64> {
        self.elapsed_hours
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// Cheap pre-filter for a pending numbered approval menu: the tail must
    /// show the selector glyph on option 1 and a small numbered list, and
    /// must not show any working pattern.
    pub fn menu_pending(&self, tail: &str) -> bool {
        if !self.menu_selector.is_match(tail) {
            return false;
        }
        if !self.menu_item.is_match(tail) {
            return false;
        }
        !self.has_working_pattern(tail)
    }
}

/// Remove form-feed control characters from a chunk.
pub fn strip_form_feed(text: &str) -> Cow<'_, str> {
    if text.contains('\u{c}') {
        Cow::Owned(text.replace('\u{c}', ""))
    } else {
        Cow::Borrowed(text)
    }
}

/// Count printable (non-control, non-whitespace) characters.
pub fn printable_len(text: &str) -> usize {
    text.chars().filter(|c| !c.is_control() && !c.is_whitespace()).count()
}

#[cfg(test)]
#[path = "patterns_tests.rs"]
mod tests;
