// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! AI confirmation classifiers.
//!
//! Two narrow questions, each answered under a hard deadline: "is the agent
//! idle or still working?" (idle checker) and "is this a safe numbered
//! approval menu?" (plan checker). Callers treat any failure or deadline
//! overrun as the conservative verdict.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tracing::debug;

use crate::timeout::with_timeout;

/// Idle-checker verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleVerdict {
    Idle,
    Working,
}

/// Plan-checker verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuVerdict {
    /// A safe numbered approval menu — Enter may be synthesized.
    Approve,
    /// Anything else (elicitation, free-text question, unclear).
    Other,
}

/// A classifier over transcript excerpts.
///
/// Object-safe for use as `Arc<dyn Classifier>`.
pub trait Classifier: Send + Sync + 'static {
    fn check_idle(
        &self,
        excerpt: String,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<IdleVerdict>> + Send + '_>>;

    fn check_menu(
        &self,
        excerpt: String,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<MenuVerdict>> + Send + '_>>;
}

/// Production classifier: drives the agent binary itself in one-shot mode.
pub struct AgentClassifier {
    binary: String,
    model: Option<String>,
    deadline: Duration,
}

const IDLE_INSTRUCTION: &str = "You are looking at the tail of a coding agent's terminal \
     transcript. Answer with exactly one word: IDLE if the agent has finished its turn and \
     is waiting for input, WORKING if it is still producing output.\n\nTranscript:\n";

const MENU_INSTRUCTION: &str = "You are looking at the tail of a coding agent's terminal \
     transcript. Answer with exactly one word: APPROVE if it shows a small numbered menu \
     waiting for the user to confirm a routine action, OTHER for anything else (questions, \
     logins, free-text prompts).\n\nTranscript:\n";

impl AgentClassifier {
    pub fn new(binary: impl Into<String>, deadline: Duration) -> Self {
        Self { binary: binary.into(), model: None, deadline }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Run the agent one-shot with `prompt` and return its trimmed stdout.
    async fn ask(&self, prompt: String) -> anyhow::Result<String> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg("-p").arg(&prompt);
        if let Some(ref model) = self.model {
            cmd.args(["--model", model]);
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::null());
        cmd.kill_on_drop(true);

        let work = async {
            let output = cmd.output().await.context("spawning classifier child")?;
            if !output.status.success() {
                anyhow::bail!("classifier child exited with {}", output.status);
            }
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
        };
        with_timeout(work, self.deadline, "classifier").await
    }
}

impl Classifier for AgentClassifier {
    fn check_idle(
        &self,
        excerpt: String,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<IdleVerdict>> + Send + '_>> {
        Box::pin(async move {
            let answer = self.ask(format!("{IDLE_INSTRUCTION}{excerpt}")).await?;
            debug!(%answer, "idle classifier verdict");
            // Anything that is not a clean IDLE counts as working.
            if answer.to_uppercase().starts_with("IDLE") {
                Ok(IdleVerdict::Idle)
            } else {
                Ok(IdleVerdict::Working)
            }
        })
    }

    fn check_menu(
        &self,
        excerpt: String,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<MenuVerdict>> + Send + '_>> {
        Box::pin(async move {
            let answer = self.ask(format!("{MENU_INSTRUCTION}{excerpt}")).await?;
            debug!(%answer, "menu classifier verdict");
            if answer.to_uppercase().starts_with("APPROVE") {
                Ok(MenuVerdict::Approve)
            } else {
                Ok(MenuVerdict::Other)
            }
        })
    }
}

#[cfg(test)]
#[path = "classify_tests.rs"]
mod tests;
