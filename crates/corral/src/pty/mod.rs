// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod env;
pub mod nbio;
pub mod spawn;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Exit status of the child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Input sent to the PTY backend: raw bytes or a drain synchronization
/// point (all prior writes are complete when the drain ack fires).
#[derive(Debug)]
pub enum BackendInput {
    Write(Bytes),
    Drain(tokio::sync::oneshot::Sender<()>),
}

/// Terminal backend abstraction over a PTY child.
///
/// Object-safe for use as `Box<dyn Backend>`.
pub trait Backend: Send + 'static {
    /// Pump the child: deliver its output to `output_tx`, consume writes
    /// from `input_rx` and resizes from `resize_rx`, and resolve with the
    /// exit status exactly once.
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        input_rx: mpsc::Receiver<BackendInput>,
        resize_rx: mpsc::Receiver<(u16, u16)>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ExitStatus>> + Send + '_>>;

    fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()>;

    fn child_pid(&self) -> Option<u32>;
}

/// Conversion trait so both concrete backends and `Box<dyn Backend>` can be
/// passed without explicit boxing.
pub trait Boxed {
    fn boxed(self) -> Box<dyn Backend>;
}

impl<T: Backend> Boxed for T {
    fn boxed(self) -> Box<dyn Backend> {
        Box::new(self)
    }
}

impl Boxed for Box<dyn Backend> {
    fn boxed(self) -> Box<dyn Backend> {
        self
    }
}
