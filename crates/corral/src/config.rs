// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use clap::Parser;

/// Default quiet-stream window before the child is considered idle.
pub const DEFAULT_NO_OUTPUT_TIMEOUT_MS: i64 = 30_000;
/// Default confirmation window after a completion signal.
pub const DEFAULT_COMPLETION_CONFIRM_MS: i64 = 3_000;
/// Default silence window before auto-accepting a menu.
pub const DEFAULT_AUTO_ACCEPT_DELAY_MS: i64 = 1_000;
/// Default delay between respawn steps.
pub const DEFAULT_INTER_STEP_DELAY_MS: i64 = 1_000;
/// Default partial-line flush delay.
pub const DEFAULT_LINE_FLUSH_DELAY_MS: i64 = 100;
/// Default policy wait-for-idle polling cadence.
pub const DEFAULT_AUTO_RETRY_DELAY_MS: i64 = 2_000;
/// Default AI classifier deadline.
pub const DEFAULT_AI_DEADLINE_MS: i64 = 15_000;
/// Default AI classifier cooldown after any verdict.
pub const DEFAULT_AI_COOLDOWN_MS: i64 = 30_000;

/// Ceiling on cumulative input+output tokens per session.
pub const MAX_SESSION_TOKENS: u64 = 500_000;
/// Ceiling on a single message's input or output token count.
pub const MAX_TOKENS_PER_MESSAGE: u64 = 100_000;
/// Ceiling on a single status-line counter delta.
pub const MAX_TOKEN_DELTA: u64 = 100_000;

/// Hard cap on an unterminated line before it is force-flushed.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Supervisor for AI coding agent CLI sessions.
#[derive(Debug, Clone, Parser)]
#[command(name = "corral", version, about)]
pub struct Config {
    /// Agent binary to supervise.
    #[arg(long, env = "CORRAL_AGENT_BIN", default_value = "claude")]
    pub agent_bin: String,

    /// Base URL the child can use to call back into the host.
    #[arg(long, env = "CORRAL_API_URL", default_value = "http://127.0.0.1:3790")]
    pub api_url: String,

    /// Terminal columns.
    #[arg(long, env = "CORRAL_COLS", default_value = "120")]
    pub cols: u16,

    /// Terminal rows.
    #[arg(long, env = "CORRAL_ROWS", default_value = "40")]
    pub rows: u16,

    /// Raw terminal buffer cap in bytes.
    #[arg(long, env = "CORRAL_MAX_TERMINAL_BUFFER", default_value = "500000")]
    pub max_terminal_buffer: usize,

    /// Raw terminal buffer retained tail after trim.
    #[arg(long, env = "CORRAL_TRIM_TERMINAL_SIZE", default_value = "400000")]
    pub trim_terminal_size: usize,

    /// Error buffer cap in bytes.
    #[arg(long, env = "CORRAL_MAX_ERROR_BUFFER", default_value = "16384")]
    pub max_error_buffer: usize,

    /// Parsed one-shot message list capacity.
    #[arg(long, env = "CORRAL_MAX_MESSAGES", default_value = "1000")]
    pub max_messages: usize,

    /// Wrap children in a detachable screen session when available.
    /// Defaults to true.
    #[arg(long, env = "CORRAL_USE_MUX")]
    pub use_mux: Option<bool>,

    /// Quiet-stream idle window in ms. Non-positive values use the default.
    #[arg(long, env = "CORRAL_NO_OUTPUT_TIMEOUT_MS", default_value = "30000",
          allow_hyphen_values = true)]
    pub no_output_timeout_ms: i64,

    /// Completion-signal confirmation window in ms.
    #[arg(long, env = "CORRAL_COMPLETION_CONFIRM_MS", default_value = "3000",
          allow_hyphen_values = true)]
    pub completion_confirm_ms: i64,

    /// Silence before auto-accepting a numbered menu, in ms. Zero means
    /// "immediate" and is explicitly allowed; negative values use the default.
    #[arg(long, env = "CORRAL_AUTO_ACCEPT_DELAY_MS", default_value = "1000",
          allow_hyphen_values = true)]
    pub auto_accept_delay_ms: i64,

    /// Delay between respawn steps in ms.
    #[arg(long, env = "CORRAL_INTER_STEP_DELAY_MS", default_value = "1000",
          allow_hyphen_values = true)]
    pub inter_step_delay_ms: i64,

    /// Partial-line flush delay in ms.
    #[arg(long, env = "CORRAL_LINE_FLUSH_DELAY_MS", default_value = "100",
          allow_hyphen_values = true)]
    pub line_flush_delay_ms: i64,

    /// Policy wait-for-idle polling cadence in ms.
    #[arg(long, env = "CORRAL_AUTO_RETRY_DELAY_MS", default_value = "2000",
          allow_hyphen_values = true)]
    pub auto_retry_delay_ms: i64,

    /// AI classifier deadline in ms.
    #[arg(long, env = "CORRAL_AI_DEADLINE_MS", default_value = "15000",
          allow_hyphen_values = true)]
    pub ai_deadline_ms: i64,

    /// AI classifier cooldown in ms.
    #[arg(long, env = "CORRAL_AI_COOLDOWN_MS", default_value = "30000",
          allow_hyphen_values = true)]
    pub ai_cooldown_ms: i64,

    /// Enable the AI idle-confirmation classifier.
    #[arg(long, env = "CORRAL_AI_CONFIRM")]
    pub ai_confirm: bool,

    /// Enable the AI menu classifier for auto-accept.
    #[arg(long, env = "CORRAL_AI_MENU_CHECK")]
    pub ai_menu_check: bool,

    /// Maintenance prompt sent by the respawn update step.
    #[arg(long, env = "CORRAL_UPDATE_PROMPT", default_value = "update all the docs")]
    pub update_prompt: String,

    /// Send the provider /clear command during respawn cycles.
    /// Defaults to true.
    #[arg(long, env = "CORRAL_SEND_CLEAR")]
    pub send_clear: Option<bool>,

    /// Send the provider /init command during respawn cycles.
    #[arg(long, env = "CORRAL_SEND_INIT")]
    pub send_init: bool,

    /// Kickstart prompt for the init step (defaults to the provider /init).
    #[arg(long, env = "CORRAL_INIT_PROMPT")]
    pub init_prompt: Option<String>,

    /// Log format (json or text).
    #[arg(long, env = "CORRAL_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CORRAL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from(["corral"])
    }
}

/// Clamp a millisecond knob: non-positive values fall back to the default.
fn clamp_ms(value: i64, default: i64) -> Duration {
    let ms = if value > 0 { value } else { default };
    Duration::from_millis(ms as u64)
}

impl Config {
    /// Quiet-stream window. Non-positive → default.
    pub fn no_output_timeout(&self) -> Duration {
        clamp_ms(self.no_output_timeout_ms, DEFAULT_NO_OUTPUT_TIMEOUT_MS)
    }

    /// Completion confirmation window, capped to the quiet-stream window.
    pub fn completion_confirm(&self) -> Duration {
        let confirm = clamp_ms(self.completion_confirm_ms, DEFAULT_COMPLETION_CONFIRM_MS);
        confirm.min(self.no_output_timeout())
    }

    /// Auto-accept silence window. Zero is allowed (immediate); negative
    /// values fall back to the default.
    pub fn auto_accept_delay(&self) -> Duration {
        if self.auto_accept_delay_ms >= 0 {
            Duration::from_millis(self.auto_accept_delay_ms as u64)
        } else {
            Duration::from_millis(DEFAULT_AUTO_ACCEPT_DELAY_MS as u64)
        }
    }

    pub fn inter_step_delay(&self) -> Duration {
        clamp_ms(self.inter_step_delay_ms, DEFAULT_INTER_STEP_DELAY_MS)
    }

    pub fn line_flush_delay(&self) -> Duration {
        clamp_ms(self.line_flush_delay_ms, DEFAULT_LINE_FLUSH_DELAY_MS)
    }

    pub fn auto_retry_delay(&self) -> Duration {
        clamp_ms(self.auto_retry_delay_ms, DEFAULT_AUTO_RETRY_DELAY_MS)
    }

    pub fn ai_deadline(&self) -> Duration {
        clamp_ms(self.ai_deadline_ms, DEFAULT_AI_DEADLINE_MS)
    }

    pub fn ai_cooldown(&self) -> Duration {
        clamp_ms(self.ai_cooldown_ms, DEFAULT_AI_COOLDOWN_MS)
    }

    /// Whether to wrap children in the multiplexer (default true).
    pub fn mux_enabled(&self) -> bool {
        self.use_mux.unwrap_or(true)
    }

    /// Whether respawn cycles send the clear step (default true).
    pub fn send_clear_enabled(&self) -> bool {
        self.send_clear.unwrap_or(true)
    }

    /// Validate non-duration fields after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.agent_bin.is_empty() {
            anyhow::bail!("--agent-bin cannot be empty");
        }
        if self.trim_terminal_size >= self.max_terminal_buffer {
            anyhow::bail!(
                "--trim-terminal-size ({}) must be below --max-terminal-buffer ({})",
                self.trim_terminal_size,
                self.max_terminal_buffer
            );
        }
        match self.log_format.as_str() {
            "json" | "text" => Ok(()),
            other => anyhow::bail!("invalid log format: {other}"),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
