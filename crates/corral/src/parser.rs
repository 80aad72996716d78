// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Heuristic terminal parser: turns raw chunks into typed observations.
//!
//! Runs on every chunk in addition to the line splitter. This is not a
//! terminal emulator; it strips escape sequences just enough to pattern
//! match reliably.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::patterns::{PatternSet, TodoStatus, PROMPT_CHAR};

/// Cap on tracked todos; oldest non-in-progress entries are dropped first.
const MAX_TODOS: usize = 50;

/// Default capacity of the recent tool-invocation map.
const RECENT_TOOLS_CAP: usize = 32;

/// Default maximum age of a recent tool-invocation entry.
const RECENT_TOOLS_MAX_AGE: Duration = Duration::from_secs(120);

/// A typed observation extracted from one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    /// A status-line token total (validation happens at the counters).
    StatusTokens(u64),
    /// A tool-invocation description, e.g. `Bash(ls -la)`.
    ToolInvocation(String),
    /// A working lexeme or spinner frame appeared.
    WorkingSeen,
    /// The prompt character appeared in the ANSI-bearing stream.
    PromptSeen,
    /// A turn summary ("Worked for 2m 46s") appeared.
    CompletionMessage,
    /// A `<promise>…</promise>` sentinel matched (loop policy only).
    CompletionPhrase(String),
    /// The todo list changed.
    TodosUpdated,
    IterationUpdated { current: u64, total: Option<u64> },
    CycleUpdated(u64),
}

/// One tracked todo entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
}

/// Bounded ordered map of recent tool-invocation descriptions.
#[derive(Debug)]
pub struct RecentTools {
    entries: VecDeque<(Instant, String)>,
    capacity: usize,
    max_age: Duration,
}

impl Default for RecentTools {
    fn default() -> Self {
        Self::new(RECENT_TOOLS_CAP, RECENT_TOOLS_MAX_AGE)
    }
}

impl RecentTools {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self { entries: VecDeque::new(), capacity: capacity.max(1), max_age }
    }

    /// Record a description at `now`, pruning stale and excess entries.
    pub fn insert(&mut self, now: Instant, description: String) {
        self.entries.push_back((now, description));
        self.prune(now);
    }

    /// Drop entries older than `max_age` and enforce the capacity.
    pub fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.entries.front() {
            if now.duration_since(*at) > self.max_age {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// The description recorded closest to `t`, within `window`.
    pub fn near(&self, t: Instant, window: Duration) -> Option<&str> {
        self.entries
            .iter()
            .filter_map(|(at, desc)| {
                let distance = if *at > t { *at - t } else { t - *at };
                (distance <= window).then_some((distance, desc))
            })
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, desc)| desc.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-session parser state.
pub struct TerminalParser {
    patterns: PatternSet,
    todos: Vec<TodoItem>,
    iteration: u64,
    iteration_total: Option<u64>,
    cycle: u64,
    /// Emit `CompletionPhrase` events (enabled under a loop policy).
    match_completion_phrases: bool,
}

impl TerminalParser {
    pub fn new(patterns: PatternSet) -> Self {
        Self {
            patterns,
            todos: Vec::new(),
            iteration: 0,
            iteration_total: None,
            cycle: 0,
            match_completion_phrases: false,
        }
    }

    pub fn with_completion_phrases(mut self, enabled: bool) -> Self {
        self.match_completion_phrases = enabled;
        self
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    pub fn todos(&self) -> &[TodoItem] {
        &self.todos
    }

    pub fn iteration(&self) -> (u64, Option<u64>) {
        (self.iteration, self.iteration_total)
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Process one scrubbed chunk, returning every observation it yielded.
    /// The caller records `ToolInvocation` observations into its own
    /// [`RecentTools`] map.
    pub fn feed_chunk(&mut self, chunk: &str, _now: Instant) -> Vec<ParserEvent> {
        let mut events = Vec::new();

        // Cheap substring pre-checks gate the regex passes.
        let stripped = if chunk.contains('\u{1b}') {
            Some(self.patterns.strip_ansi(chunk).into_owned())
        } else {
            None
        };
        let text: &str = stripped.as_deref().unwrap_or(chunk);

        if chunk.contains("token") {
            if let Some(total) = self.patterns.parse_token_status(text) {
                events.push(ParserEvent::StatusTokens(total));
            }
        }

        if chunk.contains('(') && chunk.contains(')') {
            for line in text.lines() {
                for invocation in self.patterns.tool_invocations(line) {
                    events.push(ParserEvent::ToolInvocation(invocation.to_owned()));
                }
            }
        }

        // Completion before working: when one chunk carries both, the
        // working signal must win (it cancels the confirmation the
        // completion message would open).
        if self.patterns.has_completion_message(text) {
            events.push(ParserEvent::CompletionMessage);
        }
        if self.patterns.has_working_pattern(text) {
            events.push(ParserEvent::WorkingSeen);
        }
        // The prompt glyph is matched against the ANSI-bearing stream.
        if chunk.contains(PROMPT_CHAR) {
            events.push(ParserEvent::PromptSeen);
        }

        let mut todos_changed = false;
        for line in text.lines() {
            if self.match_completion_phrases {
                if let Some(phrase) = self.patterns.completion_phrase(line) {
                    events.push(ParserEvent::CompletionPhrase(phrase.to_owned()));
                }
            }
            if let Some((content, status)) = self.patterns.parse_todo(line) {
                todos_changed |= self.upsert_todo(content, status);
            }
        }
        if todos_changed {
            events.push(ParserEvent::TodosUpdated);
        }

        if let Some((current, total)) = self.patterns.parse_iteration(text) {
            if current > self.iteration {
                self.iteration = current;
                self.iteration_total = total.or(self.iteration_total);
                events.push(ParserEvent::IterationUpdated { current, total: self.iteration_total });
            }
        }
        if let Some(cycle) = self.patterns.parse_cycle(text) {
            if cycle > self.cycle {
                self.cycle = cycle;
                events.push(ParserEvent::CycleUpdated(cycle));
            }
        }

        events
    }

    /// Upsert a todo by content; returns whether the list changed.
    fn upsert_todo(&mut self, content: String, status: TodoStatus) -> bool {
        if let Some(existing) = self.todos.iter_mut().find(|t| t.content == content) {
            if existing.status == status {
                return false;
            }
            existing.status = status;
            return true;
        }
        self.todos.push(TodoItem { content, status });
        if self.todos.len() > MAX_TODOS {
            // Drop the oldest entry that is not in progress; fall back to
            // the oldest entry outright if everything is in progress.
            let victim = self
                .todos
                .iter()
                .position(|t| t.status != TodoStatus::InProgress)
                .unwrap_or(0);
            self.todos.remove(victim);
        }
        true
    }
}

impl std::fmt::Debug for TerminalParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalParser")
            .field("todos", &self.todos.len())
            .field("iteration", &self.iteration)
            .field("cycle", &self.cycle)
            .finish()
    }
}

#[cfg(test)]
#[path = "parser_tests.rs"]
mod tests;
