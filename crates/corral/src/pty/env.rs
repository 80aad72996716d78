// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child environment assembly: TERM, self-identification variables, and a
//! PATH augmented so the agent binary resolves from non-login shells.

use std::path::{Path, PathBuf};

/// Environment variables for a supervised child.
///
/// The three `CORRAL_*` variables let the child (and its hook scripts)
/// identify the supervising session and call back into the host.
pub fn child_env(session_id: &str, api_url: &str, agent_bin: &str) -> Vec<(String, String)> {
    let mut vars = vec![
        ("TERM".to_owned(), "xterm-256color".to_owned()),
        ("CORRAL_SCREEN".to_owned(), "1".to_owned()),
        ("CORRAL_SESSION_ID".to_owned(), session_id.to_owned()),
        ("CORRAL_API_URL".to_owned(), api_url.to_owned()),
    ];
    if let Some(path) = augmented_path(agent_bin) {
        vars.push(("PATH".to_owned(), path));
    }
    vars
}

/// Environment variable pointing the child's hook scripts at the FIFO the
/// supervisor listens on.
pub fn hook_env(pipe_path: &Path) -> (String, String) {
    ("CORRAL_HOOK_PIPE".to_owned(), pipe_path.display().to_string())
}

/// Well-known agent install locations, tried after the PATH scan.
fn fallback_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(home) = std::env::var("HOME") {
        dirs.push(PathBuf::from(&home).join(".local/bin"));
        dirs.push(PathBuf::from(&home).join(".claude/local"));
    }
    dirs.push(PathBuf::from("/usr/local/bin"));
    dirs.push(PathBuf::from("/opt/homebrew/bin"));
    dirs
}

/// PATH with the agent binary's directory appended, when it can be found
/// and is not already on the PATH. `None` when the binary is nowhere to be
/// seen (the child inherits PATH unchanged).
pub fn augmented_path(agent_bin: &str) -> Option<String> {
    let current = std::env::var("PATH").unwrap_or_default();
    let dir = locate_binary_dir(agent_bin, &current)?;
    let dir_str = dir.to_string_lossy();
    if current.split(':').any(|entry| entry == dir_str) {
        return Some(current);
    }
    Some(format!("{current}:{dir_str}"))
}

/// `which`-equivalent lookup: scan PATH entries, then fixed fallbacks.
/// Returns the directory containing the binary.
fn locate_binary_dir(agent_bin: &str, path_var: &str) -> Option<PathBuf> {
    for entry in path_var.split(':').filter(|e| !e.is_empty()) {
        let candidate = Path::new(entry).join(agent_bin);
        if is_executable(&candidate) {
            return Some(PathBuf::from(entry));
        }
    }
    fallback_dirs()
        .into_iter()
        .find(|dir| is_executable(&dir.join(agent_bin)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
