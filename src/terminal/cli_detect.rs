use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::arch::cli::CliLocator;
use crate::persistent::PersistentSession;

/// `--version` can hang on a half-installed CLI.
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether the CLI is installed, as shown in settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CliStatus {
    pub installed: bool,
    pub version: Option<String>,
    pub path: Option<String>,
}

/// Probe for the CLI. When the persistent session is up the probe runs inside
/// it (the CLI lives in that environment); otherwise on the host.
pub async fn detect_cli(locator: &CliLocator, session: &PersistentSession) -> CliStatus {
    if session.is_ready() {
        return detect_in_session(locator.program(), session).await;
    }
    detect_local(locator).await
}

async fn detect_in_session(program: &str, session: &PersistentSession) -> CliStatus {
    let quoted = shell_quote(program);
    let path = match session.exec(&format!("command -v {quoted}")).await {
        Ok(out) if out.exit_code == 0 && !out.stdout.is_empty() => out.stdout,
        Ok(_) => return CliStatus::default(),
        Err(e) => {
            debug!(error = %e, "cli probe in command session failed");
            return CliStatus::default();
        }
    };
    let version = match session.exec(&format!("{} --version", shell_quote(&path))).await {
        Ok(out) if out.exit_code == 0 => Some(out.stdout).filter(|v| !v.is_empty()),
        _ => None,
    };
    CliStatus {
        installed: true,
        version,
        path: Some(path),
    }
}

async fn detect_local(locator: &CliLocator) -> CliStatus {
    let Some(path) = locator.resolve() else {
        return CliStatus::default();
    };
    let run = tokio::process::Command::new(&path)
        .arg("--version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let version = match tokio::time::timeout(VERSION_TIMEOUT, run).await {
        Ok(Ok(out)) if out.status.success() => {
            Some(String::from_utf8_lossy(&out.stdout).trim().to_string()).filter(|v| !v.is_empty())
        }
        Ok(Ok(out)) => {
            debug!(status = ?out.status, "cli --version failed");
            None
        }
        Ok(Err(e)) => {
            debug!(error = %e, "cli --version could not run");
            None
        }
        Err(_) => {
            debug!("cli --version timed out");
            None
        }
    };
    CliStatus {
        installed: true,
        version,
        path: Some(path.to_string_lossy().to_string()),
    }
}

/// Single-quote for POSIX sh.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
