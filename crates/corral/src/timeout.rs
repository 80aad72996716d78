// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::future::Future;
use std::time::Duration;

/// Run `work` under a deadline.
///
/// Resolves with the work's result, or an error naming `op` if the deadline
/// elapses first. The timer is dropped as soon as the work settles.
pub async fn with_timeout<T>(
    work: impl Future<Output = anyhow::Result<T>>,
    deadline: Duration,
    op: &str,
) -> anyhow::Result<T> {
    match tokio::time::timeout(deadline, work).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!("{op} timed out after {deadline:?}"),
    }
}

#[cfg(test)]
#[path = "timeout_tests.rs"]
mod tests;
