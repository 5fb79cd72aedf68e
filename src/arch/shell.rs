/// Used when neither the config nor `$SHELL` names a shell.
#[cfg(not(windows))]
pub const DEFAULT_SHELL: &str = "/bin/bash";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[cfg(windows)]
fn find_in_path(program: &str) -> Option<String> {
    which::which(program)
        .ok()
        .map(|p: std::path::PathBuf| p.to_string_lossy().to_string())
}

/// Interactive login shell for fallback terminals.
///
/// `configured` comes from the app config and wins over `$SHELL`.
pub fn login_shell_command(configured: Option<&str>) -> ShellCommand {
    resolve_login_shell(configured, std::env::var("SHELL").ok())
}

pub fn resolve_login_shell(configured: Option<&str>, env_shell: Option<String>) -> ShellCommand {
    let clean = |s: String| {
        let s = s.trim().to_string();
        (!s.is_empty()).then_some(s)
    };
    let chosen = configured
        .map(str::to_string)
        .and_then(clean)
        .or_else(|| env_shell.and_then(clean));

    #[cfg(windows)]
    {
        // PowerShell has no login mode; prefer PowerShell 7 when installed.
        if let Some(shell) = chosen {
            return ShellCommand::new(shell, vec!["-NoLogo".to_string()]);
        }
        let program = find_in_path("pwsh")
            .or_else(|| find_in_path("powershell"))
            .unwrap_or_else(|| "powershell".to_string());
        ShellCommand::new(program, vec!["-NoLogo".to_string()])
    }

    #[cfg(not(windows))]
    {
        let program = chosen.unwrap_or_else(|| DEFAULT_SHELL.to_string());
        // Login + interactive so the user's profile (PATH, aliases) is loaded.
        ShellCommand::new(program, vec!["-il".to_string()])
    }
}
