// ============================================================================
// ENGINE SETTINGS — persisted key=value configuration
// ============================================================================

use std::path::{Path, PathBuf};

/// Errors from reading or writing the settings file.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no settings location available on this platform")]
    NoLocation,
}

/// Engine settings that persist across sessions.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    /// Maximum number of undo steps kept by the history manager.
    pub max_undo_steps: usize,
    /// Memory budget for encoded history snapshots, in MiB.
    pub history_memory_mb: usize,
    /// JPEG quality (1–100) used for fully opaque layer snapshots.
    pub snapshot_jpeg_quality: u8,
    /// Same-label pushes within this window replace the current entry.
    /// 0 = disabled.
    pub history_coalesce_ms: u64,
    /// Maximum number of free surfaces the pool keeps around.
    pub pool_max_free: usize,
    /// In-use pixel memory above which the pool logs a warning, in MiB.
    pub pool_soft_limit_mb: usize,
    /// Filter worker threads (0 = auto).
    pub worker_threads: usize,
    /// Longest edge of generated asset thumbnails.
    pub thumbnail_edge: u32,
    /// Deduplicate asset saves by content hash.
    pub dedup_assets: bool,
    /// Directory of the on-disk asset store (empty = none configured).
    pub asset_store_dir: String,
    /// Session log file (empty = platform default).
    pub log_path: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_undo_steps: 50,
            history_memory_mb: 256,
            snapshot_jpeg_quality: 92,
            history_coalesce_ms: 0,
            pool_max_free: 16,
            pool_soft_limit_mb: 512,
            worker_threads: 0,
            thumbnail_edge: 128,
            dedup_assets: true,
            asset_store_dir: String::new(),
            log_path: String::new(),
        }
    }
}

impl EngineSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/tokenstudio/tokenstudio_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\TokenStudio\tokenstudio_settings.cfg
    /// On macOS:   ~/Library/Application Support/TokenStudio/tokenstudio_settings.cfg
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
                .ok()?
                .join("tokenstudio");
            return Some(config_dir.join("tokenstudio_settings.cfg"));
        }
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA")
                .or_else(|_| std::env::var("USERPROFILE"))
                .ok()?;
            return Some(
                PathBuf::from(appdata)
                    .join("TokenStudio")
                    .join("tokenstudio_settings.cfg"),
            );
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").ok()?;
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("TokenStudio")
                    .join("tokenstudio_settings.cfg"),
            );
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|d| d.join("tokenstudio_settings.cfg")))
        }
    }

    /// Load settings from the default location (defaults if missing or corrupt).
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load settings from `path` (defaults if missing or unreadable).
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    /// Save settings to the default location.
    pub fn save(&self) -> Result<(), SettingsError> {
        let path = Self::settings_path().ok_or(SettingsError::NoLocation)?;
        self.save_to(&path)
    }

    /// Save settings to `path`, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        let io_err = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, self.to_config_string()).map_err(io_err)
    }

    pub fn to_config_string(&self) -> String {
        format!(
            "max_undo_steps={}\n\
             history_memory_mb={}\n\
             snapshot_jpeg_quality={}\n\
             history_coalesce_ms={}\n\
             pool_max_free={}\n\
             pool_soft_limit_mb={}\n\
             worker_threads={}\n\
             thumbnail_edge={}\n\
             dedup_assets={}\n\
             asset_store_dir={}\n\
             log_path={}\n",
            self.max_undo_steps,
            self.history_memory_mb,
            self.snapshot_jpeg_quality,
            self.history_coalesce_ms,
            self.pool_max_free,
            self.pool_soft_limit_mb,
            self.worker_threads,
            self.thumbnail_edge,
            self.dedup_assets,
            self.asset_store_dir,
            self.log_path,
        )
    }

    /// Parse `key=value` lines.  Unknown keys are ignored; malformed values
    /// keep their default.
    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        let d = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let key = key.trim();
            let val = val.trim();
            match key {
                "max_undo_steps" => {
                    s.max_undo_steps = val.parse().unwrap_or(d.max_undo_steps).max(1);
                }
                "history_memory_mb" => {
                    s.history_memory_mb = val.parse().unwrap_or(d.history_memory_mb);
                }
                "snapshot_jpeg_quality" => {
                    s.snapshot_jpeg_quality = val
                        .parse::<u8>()
                        .unwrap_or(d.snapshot_jpeg_quality)
                        .clamp(1, 100);
                }
                "history_coalesce_ms" => {
                    s.history_coalesce_ms = val.parse().unwrap_or(d.history_coalesce_ms);
                }
                "pool_max_free" => {
                    s.pool_max_free = val.parse().unwrap_or(d.pool_max_free);
                }
                "pool_soft_limit_mb" => {
                    s.pool_soft_limit_mb = val.parse().unwrap_or(d.pool_soft_limit_mb);
                }
                "worker_threads" => {
                    s.worker_threads = val.parse().unwrap_or(d.worker_threads);
                }
                "thumbnail_edge" => {
                    s.thumbnail_edge = val.parse().unwrap_or(d.thumbnail_edge).max(1);
                }
                "dedup_assets" => {
                    s.dedup_assets = val != "false";
                }
                "asset_store_dir" => {
                    s.asset_store_dir = val.to_string();
                }
                "log_path" => {
                    s.log_path = val.to_string();
                }
                _ => {}
            }
        }
        s
    }

    /// Configured asset store directory, if any.
    pub fn asset_store_path(&self) -> Option<PathBuf> {
        (!self.asset_store_dir.is_empty()).then(|| PathBuf::from(&self.asset_store_dir))
    }
}
