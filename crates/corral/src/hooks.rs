// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inbound hook transport.
//!
//! The supervised agent's hook scripts write JSON lines to a named pipe
//! (FIFO); the receiver parses them into typed signals and forwards them to
//! the session's hook surface. This is how high-confidence idle assertions
//! (stop hook, idle prompt) and elicitation stand-downs reach the engine
//! without scraping the terminal.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use serde::Deserialize;
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session::Session;

/// Typed hook assertions from the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookSignal {
    /// The agent's stop hook fired: the turn is over (strong).
    Stop,
    /// The agent rendered its idle prompt (strongest, bypasses checks).
    IdlePrompt,
    /// An elicitation dialog is up; auto-accept must stand down.
    Elicitation,
}

/// Newtype for a FIFO file descriptor, for use with [`AsyncFd`].
struct FifoFd(OwnedFd);

impl AsRawFd for FifoFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for FifoFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// Receives hook signals from a named pipe.
///
/// Uses non-blocking I/O via [`AsyncFd`] so reads are cancellable by
/// `tokio::select!` and never leak a blocked thread on shutdown.
pub struct HookReceiver {
    pipe_path: PathBuf,
    async_fd: Option<AsyncFd<FifoFd>>,
    line_buf: Vec<u8>,
}

/// Intermediate type for parsing hook JSON from the pipe.
#[derive(Deserialize)]
struct RawHookJson {
    event: String,
}

impl HookReceiver {
    /// Create a new hook receiver, creating the named pipe at `pipe_path`.
    pub fn new(pipe_path: &Path) -> anyhow::Result<Self> {
        nix::unistd::mkfifo(pipe_path, Mode::from_bits_truncate(0o600))?;
        Ok(Self {
            pipe_path: pipe_path.to_path_buf(),
            async_fd: None,
            line_buf: Vec::with_capacity(4096),
        })
    }

    /// Path to the named pipe (exported to the child's environment).
    pub fn pipe_path(&self) -> &Path {
        &self.pipe_path
    }

    /// Read the next hook signal from the pipe.
    ///
    /// Returns `None` on EOF or unrecoverable error. Malformed and unknown
    /// lines are skipped.
    pub async fn next_signal(&mut self) -> Option<HookSignal> {
        self.ensure_fd().ok()?;

        loop {
            // Drain complete lines from the buffer first.
            if let Some(signal) = self.try_parse_line() {
                return Some(signal);
            }

            // Read more data from the pipe via non-blocking I/O.
            let afd = self.async_fd.as_ref()?;
            let mut guard = match afd.readable().await {
                Ok(g) => g,
                Err(_) => return None,
            };
            let mut buf = [0u8; 4096];
            match guard.try_io(|inner| {
                nix::unistd::read(inner.get_ref(), &mut buf)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            }) {
                Ok(Ok(0)) => return None, // EOF
                Ok(Ok(n)) => self.line_buf.extend_from_slice(&buf[..n]),
                Ok(Err(_)) => return None,
                Err(_would_block) => continue,
            }
        }
    }

    /// Try to extract a signal from complete lines in the buffer, draining
    /// malformed ones.
    fn try_parse_line(&mut self) -> Option<HookSignal> {
        loop {
            let pos = self.line_buf.iter().position(|&b| b == b'\n')?;
            let line = String::from_utf8_lossy(&self.line_buf[..pos]).to_string();
            self.line_buf.drain(..=pos);
            if let Some(signal) = parse_hook_line(line.trim()) {
                return Some(signal);
            }
        }
    }

    /// Ensure the pipe fd is open and registered with tokio.
    ///
    /// Opens with `O_RDWR | O_NONBLOCK`: `O_RDWR` prevents spurious EOF
    /// when the last writer closes; `O_NONBLOCK` enables event-driven reads
    /// through [`AsyncFd`].
    fn ensure_fd(&mut self) -> anyhow::Result<()> {
        if self.async_fd.is_none() {
            let std_file =
                std::fs::OpenOptions::new().read(true).write(true).open(&self.pipe_path)?;
            crate::pty::nbio::set_nonblocking(&std_file)?;
            let owned: OwnedFd = std_file.into();
            let async_fd = AsyncFd::new(FifoFd(owned))?;
            self.async_fd = Some(async_fd);
        }
        Ok(())
    }
}

impl Drop for HookReceiver {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.pipe_path);
    }
}

/// Parse a raw JSON line from the hook pipe into a [`HookSignal`].
fn parse_hook_line(line: &str) -> Option<HookSignal> {
    let raw: RawHookJson = serde_json::from_str(line).ok()?;
    match raw.event.as_str() {
        "stop" | "agent_stop" => Some(HookSignal::Stop),
        "idle_prompt" => Some(HookSignal::IdlePrompt),
        "elicitation" | "elicitation_dialog" => Some(HookSignal::Elicitation),
        _ => None,
    }
}

/// Forward hook signals from a receiver into a session until the pipe
/// closes or `shutdown` flips.
pub async fn forward(
    mut receiver: HookReceiver,
    session: &Session,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            signal = receiver.next_signal() => {
                match signal {
                    Some(HookSignal::Stop) => session.signal_stop_hook(),
                    Some(HookSignal::IdlePrompt) => session.signal_idle_prompt(),
                    Some(HookSignal::Elicitation) => session.signal_elicitation(),
                    None => break,
                }
            }
        }
    }
    debug!("hook forwarder finished");
}

#[cfg(test)]
#[path = "hooks_tests.rs"]
mod tests;
