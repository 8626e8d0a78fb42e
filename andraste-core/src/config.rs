use std::path::{Path, PathBuf};
use std::time::Duration;

/// The payload used when the caller does not name one, and the fallback
/// source for binding redirects.
pub const DEFAULT_FRAMEWORK_DLL: &str = "Andraste.Payload.Generic.dll";

pub const OUTPUT_LOG: &str = "output.log";
pub const ERROR_LOG: &str = "error.log";
pub const MODS_MANIFEST: &str = "mods.json";

/// Runtime settings shared by every session.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Directory holding the framework libraries and their `.config` files.
    pub base_dir: PathBuf,
    pub default_framework: String,
    pub log_poll_interval: Duration,
    /// Backoff while waiting for a log file to be created.
    pub log_create_backoff: Duration,
    pub discovery_interval: Duration,
    pub exit_poll_interval: Duration,
}

impl HostConfig {
    pub fn new<P: Into<PathBuf>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Resolves a framework library name against `base_dir`; absolute paths pass through.
    pub fn framework_path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.base_dir.join(name)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        let base_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            base_dir,
            default_framework: DEFAULT_FRAMEWORK_DLL.to_string(),
            log_poll_interval: Duration::from_millis(1000),
            log_create_backoff: Duration::from_millis(1000),
            discovery_interval: Duration::from_millis(100),
            exit_poll_interval: Duration::from_millis(250),
        }
    }
}
