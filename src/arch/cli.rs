use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Resolves the CLI binary launched on the direct spawn path.
///
/// The first successful lookup is cached for the life of the process; misses
/// are not, so installing the CLI while the app runs is picked up on the next
/// spawn.
#[derive(Debug)]
pub struct CliLocator {
    program: String,
    explicit: Option<PathBuf>,
    cached: Mutex<Option<PathBuf>>,
}

impl CliLocator {
    pub fn new(program: impl Into<String>, explicit: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            explicit,
            cached: Mutex::new(None),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn resolve(&self) -> Option<PathBuf> {
        let mut cached = self.cached.lock().expect("poisoned cli path lock");
        if let Some(path) = cached.as_ref() {
            return Some(path.clone());
        }
        let found = self.lookup()?;
        tracing::debug!(path = %found.display(), "resolved CLI binary");
        *cached = Some(found.clone());
        Some(found)
    }

    fn lookup(&self) -> Option<PathBuf> {
        if let Some(explicit) = &self.explicit {
            // An explicit path must exist; a bare name is still looked up on PATH.
            if is_path_like(explicit) {
                return explicit.exists().then(|| explicit.clone());
            }
            return which::which(explicit).ok();
        }
        which::which(&self.program).ok()
    }
}

fn is_path_like(p: &Path) -> bool {
    let s = p.to_string_lossy();
    s.contains('/') || s.contains('\\')
}
