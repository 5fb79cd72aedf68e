//! Process environments for the two spawn modes.

use std::path::PathBuf;

pub const TERM: &str = "xterm-256color";
pub const COLORTERM: &str = "truecolor";
pub const TERM_PROGRAM: &str = "dash";

/// Credentials and proxy settings forwarded to the CLI on the direct path.
pub const PASSTHROUGH_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "GH_TOKEN",
    "GITHUB_TOKEN",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "http_proxy",
    "https_proxy",
    "no_proxy",
];

/// Set by the app bundle's launcher; an interactive shell must not see them.
pub const SCRUBBED_VARS: &[&str] = &["APPIMAGE", "APPDIR"];

/// Minimal environment for the direct CLI spawn. Nothing outside this
/// allow-list is taken from the ambient environment.
pub fn direct_env(
    lookup: impl Fn(&str) -> Option<String>,
    home: Option<PathBuf>,
) -> Vec<(String, String)> {
    let home = home
        .map(|h| h.to_string_lossy().to_string())
        .or_else(|| lookup("HOME"))
        .unwrap_or_default();
    let user = lookup("USER")
        .or_else(|| lookup("USERNAME"))
        .unwrap_or_default();

    let mut env = vec![
        ("TERM".to_string(), TERM.to_string()),
        ("COLORTERM".to_string(), COLORTERM.to_string()),
        ("TERM_PROGRAM".to_string(), TERM_PROGRAM.to_string()),
        ("HOME".to_string(), home),
        ("USER".to_string(), user),
        ("PATH".to_string(), lookup("PATH").unwrap_or_default()),
    ];
    for key in PASSTHROUGH_VARS {
        if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
            env.push((key.to_string(), value));
        }
    }
    env
}

/// CLI flags for the direct spawn path.
pub fn direct_cli_args(auto_approve: bool, resume: bool) -> Vec<String> {
    let mut args = Vec::new();
    if resume {
        args.push("-c".to_string());
        args.push("-r".to_string());
    }
    if auto_approve {
        args.push("--dangerously-skip-permissions".to_string());
    }
    args
}
