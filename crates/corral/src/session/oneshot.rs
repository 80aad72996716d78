// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One-shot runs: spawn the agent with a prompt and its structured-output
//! flag, parse the JSONL stream, and resolve `{result, cost}` exactly once.

use std::sync::atomic::Ordering;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::event::{SessionEvent, SessionMode, SessionStatus};
use crate::pty::env::child_env;
use crate::pty::spawn::NativePty;

use super::run::AttachKind;
use super::Session;

/// Result of a successful one-shot run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneShotOutcome {
    pub result: String,
    pub cost: f64,
}

/// Options for a one-shot run.
#[derive(Debug, Clone, Default)]
pub struct OneShotOptions {
    pub model: Option<String>,
}

impl Session {
    /// Run the agent once with `prompt` and wait for its result.
    ///
    /// Resolves with the final result text and reported cost on a clean
    /// exit; rejects on an error exit, an error result, or `stop()`.
    pub async fn start_oneshot(
        &self,
        prompt: &str,
        options: OneShotOptions,
    ) -> anyhow::Result<OneShotOutcome> {
        let shared = &self.shared;
        if shared.stopped.load(Ordering::Acquire) {
            anyhow::bail!("session is stopped");
        }
        if shared.input_tx.lock().is_some() {
            anyhow::bail!("session already started");
        }

        let mut command = vec![
            shared.config.agent_bin.clone(),
            "-p".to_owned(),
            prompt.to_owned(),
            "--output-format".to_owned(),
            "stream-json".to_owned(),
            "--verbose".to_owned(),
            "--dangerously-skip-permissions".to_owned(),
            "--session-id".to_owned(),
            shared.id.clone(),
        ];
        if let Some(ref model) = options.model {
            command.push("--model".to_owned());
            command.push(model.clone());
        }

        let mut env =
            child_env(&shared.id, &shared.config.api_url, &shared.config.agent_bin);
        env.extend(shared.extra_env.iter().cloned());
        let backend = match NativePty::spawn(
            &command,
            &shared.cwd,
            shared.config.cols,
            shared.config.rows,
            &env,
        ) {
            Ok(backend) => backend,
            Err(e) => {
                shared.set_status(SessionStatus::Error);
                shared.emit(SessionEvent::Error(format!("spawn failed: {e:#}")));
                return Err(e).context("spawning one-shot child");
            }
        };

        // Install the latch before the loop starts so a fast exit still
        // resolves through it. Single-flip: whichever of the loop and
        // stop() fires first wins; the other finds the latch empty.
        let (latch_tx, latch_rx) = tokio::sync::oneshot::channel();
        *shared.oneshot_latch.lock() = Some(latch_tx);

        self.attach_backend(backend, SessionMode::AgentOneShot, AttachKind::OneShot);

        match latch_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow::anyhow!("one-shot run ended without a result")),
        }
    }
}
