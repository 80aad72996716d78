// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Detachable multiplexer adapter (GNU screen).
//!
//! Wrapping the child in a screen session lets it survive supervisor
//! restarts: session names are deterministic (`corral-<id>`), so a new
//! supervisor re-derives the name and reattaches. Input injection goes
//! through `screen -X stuff`, which is far more reliable than PTY writes
//! for full-screen TUIs.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context};
use tokio::process::Command;
use tracing::debug;

/// Multiplexer adapter driving the `screen` binary.
#[derive(Debug, Clone)]
pub struct ScreenMux {
    binary: String,
}

impl Default for ScreenMux {
    fn default() -> Self {
        Self::new("screen")
    }
}

impl ScreenMux {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Deterministic external session name for a supervisor session id.
    pub fn session_name(session_id: &str) -> String {
        format!("corral-{session_id}")
    }

    /// Whether the multiplexer binary is usable at all.
    pub fn is_available(&self) -> bool {
        std::process::Command::new(&self.binary)
            .arg("-v")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success() || s.code() == Some(1)) // `screen -v` exits 1 on some builds
            .unwrap_or(false)
    }

    /// Create a detached session named for `session_id`, running `command`
    /// in `cwd` with the given environment overrides.
    pub async fn create_session(
        &self,
        session_id: &str,
        cwd: &Path,
        command: &[String],
        env_vars: &[(String, String)],
    ) -> anyhow::Result<()> {
        if command.is_empty() {
            bail!("empty command for multiplexer session");
        }
        let name = Self::session_name(session_id);
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-dmS", &name]).args(command).current_dir(cwd);
        for (key, value) in env_vars {
            cmd.env(key, value);
        }
        let status = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("spawning screen failed")?;
        if !status.success() {
            bail!("screen -dmS {name} exited with {status}");
        }
        debug!(%name, "created multiplexer session");
        Ok(())
    }

    /// Whether the named session exists (`screen -ls` listing).
    pub async fn session_exists(&self, session_id: &str) -> bool {
        let name = Self::session_name(session_id);
        let output = Command::new(&self.binary)
            .arg("-ls")
            .stderr(Stdio::null())
            .output()
            .await;
        match output {
            Ok(out) => {
                let listing = String::from_utf8_lossy(&out.stdout);
                listing.lines().any(|line| {
                    line.split_whitespace()
                        .next()
                        .map(|field| field.ends_with(&format!(".{name}")))
                        .unwrap_or(false)
                })
            }
            Err(_) => false,
        }
    }

    /// Queue keystrokes into the session ("stuff"). More reliable than PTY
    /// writes for agent TUIs: the multiplexer delivers them as if typed.
    pub async fn send_input(&self, session_id: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let name = Self::session_name(session_id);
        let text = String::from_utf8_lossy(bytes).into_owned();
        let status = Command::new(&self.binary)
            .args(["-S", &name, "-X", "stuff", &text])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("screen stuff failed to spawn")?;
        if !status.success() {
            bail!("screen -S {name} -X stuff exited with {status}");
        }
        Ok(())
    }

    /// Kill the named session.
    pub async fn kill_session(&self, session_id: &str) -> anyhow::Result<()> {
        let name = Self::session_name(session_id);
        let status = Command::new(&self.binary)
            .args(["-S", &name, "-X", "quit"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("screen quit failed to spawn")?;
        if !status.success() {
            bail!("screen -S {name} -X quit exited with {status}");
        }
        debug!(%name, "killed multiplexer session");
        Ok(())
    }

    /// Command line for a secondary (mirror) attach. The supervisor spawns
    /// this on a PTY to read the screen while the primary stays alive.
    pub fn attach_command(&self, session_id: &str) -> Vec<String> {
        vec![self.binary.clone(), "-x".to_owned(), Self::session_name(session_id)]
    }
}

#[cfg(test)]
#[path = "mux_tests.rs"]
mod tests;
