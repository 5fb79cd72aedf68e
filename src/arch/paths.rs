use std::path::{Path, PathBuf};

/// Directory name used when no Tauri path resolver is available.
const APP_DIR_NAME: &str = "dashterm";
const SNAPSHOTS_DIR_NAME: &str = "terminal-snapshots";

/// All filesystem paths should be resolved via Tauri app directories.
///
/// This keeps storage locations consistent and cross-platform.
#[cfg(feature = "desktop")]
pub fn app_data_dir(app: &tauri::AppHandle) -> tauri::Result<PathBuf> {
    use tauri::Manager;
    app.path().app_data_dir()
}

#[cfg(feature = "desktop")]
pub fn app_log_dir(app: &tauri::AppHandle) -> tauri::Result<PathBuf> {
    use tauri::Manager;
    app.path().app_log_dir()
}

/// Data directory for headless use (tests, tooling): the platform data dir,
/// falling back to the temp dir.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

pub fn snapshots_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(SNAPSHOTS_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_live_under_the_data_dir() {
        let base = Path::new("/data/app");
        assert_eq!(
            snapshots_dir(base),
            PathBuf::from("/data/app/terminal-snapshots")
        );
        assert!(default_data_dir().ends_with(APP_DIR_NAME));
    }
}
