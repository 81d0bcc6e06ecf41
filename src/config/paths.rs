//! Cross-platform application paths using the `dirs` crate.
//!
//! Layout:
//!
//! Config dir (settings):
//!   Windows: %APPDATA%\huntmaster\
//!   macOS:   ~/Library/Application Support/huntmaster/
//!   Linux:   ~/.config/huntmaster/
//!
//! Data dir (master calls, exported recordings):
//!   Windows: %LOCALAPPDATA%\huntmaster\
//!   macOS:   ~/Library/Application Support/huntmaster/
//!   Linux:   ~/.local/share/huntmaster/

use std::path::PathBuf;

/// Holds all resolved application directory/file paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Directory for `settings.toml`.
    pub config_dir: PathBuf,
    /// Full path to `settings.toml`.
    pub settings_file: PathBuf,
    /// Default master call directory for the WAV call source.
    pub calls_dir: PathBuf,
    /// Where exported recordings land.
    pub recordings_dir: PathBuf,
}

impl AppPaths {
    const APP_NAME: &'static str = "huntmaster";

    /// Resolves all paths using the `dirs` crate.
    ///
    /// Falls back to the current directory if the platform cannot provide a
    /// standard path.
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);

        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);

        Self {
            settings_file: config_dir.join("settings.toml"),
            config_dir,
            calls_dir: data_dir.join("calls"),
            recordings_dir: data_dir.join("recordings"),
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_live_under_the_app_directory() {
        let paths = AppPaths::new();
        assert!(paths
            .settings_file
            .file_name()
            .is_some_and(|n| n == "settings.toml"));
        assert!(paths.settings_file.starts_with(&paths.config_dir));
        assert!(paths.config_dir.ends_with("huntmaster"));
        assert!(paths.calls_dir.ends_with("calls"));
        assert!(paths.recordings_dir.ends_with("recordings"));
    }
}
