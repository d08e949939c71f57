//! Shell and working-directory resolution.
//!
//! The shell is resolved once when the host starts; the working directory is
//! resolved per session and never fails.

use std::path::{Path, PathBuf};

/// Shells tried, in order, when neither an override nor `$SHELL` is usable.
pub const FALLBACK_SHELLS: &[&str] = &[
    "/bin/zsh",
    "/usr/bin/zsh",
    "/bin/bash",
    "/usr/bin/bash",
    "/usr/local/bin/fish",
    "/usr/bin/fish",
];

/// Last-resort POSIX shell.
pub const POSIX_SHELL: &str = "/bin/sh";

/// Resolves the interactive shell to launch for every session.
///
/// Preference order: the operator override, the user's login shell if it
/// exists on disk, the first existing [`FALLBACK_SHELLS`] entry, and finally
/// [`POSIX_SHELL`]. On Windows the platform shell is used.
pub fn resolve_shell(override_shell: Option<&str>) -> String {
    if let Some(shell) = override_shell.filter(|s| !s.trim().is_empty()) {
        if let Some(found) = locate(shell) {
            return found;
        }
        tracing::warn!(shell = %shell, "Configured shell not found, falling back");
    }

    if cfg!(windows) {
        return std::env::var("COMSPEC")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "powershell.exe".to_string());
    }

    let login_shell = std::env::var("SHELL").ok();
    pick_shell(login_shell.as_deref(), FALLBACK_SHELLS, |p| p.is_file())
}

/// Pure selection step of [`resolve_shell`], with the existence check
/// injected.
fn pick_shell(login_shell: Option<&str>, fallbacks: &[&str], exists: impl Fn(&Path) -> bool) -> String {
    if let Some(shell) = login_shell.filter(|s| !s.is_empty()) {
        if exists(Path::new(shell)) {
            return shell.to_string();
        }
    }

    fallbacks
        .iter()
        .find(|candidate| exists(Path::new(candidate)))
        .map(|s| s.to_string())
        .unwrap_or_else(|| POSIX_SHELL.to_string())
}

/// Finds a shell on disk, searching `PATH` for bare names.
fn locate(shell: &str) -> Option<String> {
    let path = Path::new(shell);
    if path.is_absolute() {
        return path.is_file().then(|| shell.to_string());
    }
    which::which(shell)
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

/// Returns the arguments passed to the shell.
///
/// POSIX shells are started as login shells when `login` is set so that the
/// user's profile (and with it `PATH`) is loaded.
pub fn shell_args(login: bool) -> Vec<String> {
    if login && !cfg!(windows) {
        vec!["-l".to_string()]
    } else {
        Vec::new()
    }
}

/// Returns the directory used when a requested cwd is unusable.
pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

/// Resolves the working directory for a session.
///
/// A missing request, a path that does not exist, or a path that is not a
/// directory all resolve to the home directory. A leading `~` is expanded.
pub fn resolve_cwd(requested: Option<&str>) -> PathBuf {
    let home = home_dir();

    let Some(requested) = requested.filter(|s| !s.is_empty()) else {
        return home;
    };

    let candidate = if requested == "~" {
        home.clone()
    } else if let Some(rest) = requested.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(requested)
    };

    if candidate.is_dir() {
        candidate
    } else {
        tracing::debug!(
            requested = %requested,
            fallback = %home.display(),
            "Requested cwd is not a directory, using home"
        );
        home
    }
}
