// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use corral::config::Config;
use corral::event::SessionEvent;
use corral::hooks::{self, HookReceiver};
use corral::mux::ScreenMux;
use corral::policy::PolicyArm;
use corral::pty::env::hook_env;
use corral::respawn::RespawnSettings;
use corral::session::{Session, SessionConfig};

/// Initialize tracing/logging from config.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / CORRAL_LOG_LEVEL > RUST_LOG > default ("info").
    let filter = if std::env::var("CORRAL_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

#[tokio::main]
async fn main() {
    let config = Config::parse();
    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }
    init_tracing(&config);

    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("error: cannot determine working directory: {e}");
            std::process::exit(2);
        }
    };

    let respawn = RespawnSettings {
        update_prompt: config.update_prompt.clone(),
        send_clear: config.send_clear_enabled(),
        send_init: config.send_init,
        init_command: config
            .init_prompt
            .clone()
            .unwrap_or_else(|| "/init".to_owned()),
        step_timeout: config.no_output_timeout(),
        inter_step_delay: config.inter_step_delay(),
        ..RespawnSettings::default()
    };

    let session_id = uuid::Uuid::new_v4().to_string();

    // Hook pipe: the child's hook scripts write JSON lines here.
    let pipe_path = std::env::temp_dir().join(format!("corral-{session_id}.pipe"));
    let hook_receiver = match HookReceiver::new(&pipe_path) {
        Ok(r) => Some(r),
        Err(e) => {
            tracing::warn!("hook pipe unavailable, continuing without hooks: {e:#}");
            None
        }
    };
    let extra_env = match hook_receiver {
        Some(ref r) => vec![hook_env(r.pipe_path())],
        None => vec![],
    };

    let session_config = SessionConfig::new(cwd, config.clone())
        .with_id(session_id)
        .with_mux(ScreenMux::default())
        .with_respawn(respawn)
        .with_auto_compact(PolicyArm::disabled())
        .with_auto_clear(PolicyArm::disabled())
        .with_extra_env(extra_env);
    let session = std::sync::Arc::new(Session::new(session_config));

    let mut events = session.subscribe();
    if let Err(e) = session.start_interactive().await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }

    // Forward hook signals into the session for its lifetime.
    let hook_shutdown = tokio_util::sync::CancellationToken::new();
    if let Some(receiver) = hook_receiver {
        let session = std::sync::Arc::clone(&session);
        let shutdown = hook_shutdown.clone();
        tokio::spawn(async move {
            hooks::forward(receiver, &session, shutdown).await;
        });
    }

    // Mirror raw terminal output to stdout until the child exits.
    let code = loop {
        match events.recv().await {
            Ok(SessionEvent::Terminal(bytes)) => {
                use std::io::Write;
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(&bytes);
                let _ = stdout.flush();
            }
            Ok(SessionEvent::Exit(status)) => break status.code.unwrap_or(1),
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("event subscriber lagged by {n}");
            }
            Err(_) => break 1,
        }
    };

    hook_shutdown.cancel();
    session.stop(true).await;
    std::process::exit(code);
}
