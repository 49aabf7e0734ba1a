use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "TEST_DASHBOARD_CONFIG";
pub const BIND_ENV: &str = "TEST_DASHBOARD_BIND";
const DEFAULT_CONFIG_FILE: &str = "dashboard.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub bind: String,
    pub history_limit: usize,
    pub max_output_events_per_stream: usize,
    pub max_output_bytes_per_stream: usize,
    pub max_log_events: usize,
    pub max_line_length: usize,
    pub max_stream_buffer_bytes: usize,
    pub max_run_duration_secs: Option<u64>,
    pub kill_on_cancel: bool,
    pub cancel_grace_ms: u64,
    pub subscriber_buffer: usize,
    pub strip_ansi: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7357".to_string(),
            history_limit: 100,
            max_output_events_per_stream: 4_000,
            max_output_bytes_per_stream: 2 * 1024 * 1024,
            max_log_events: 1_000,
            max_line_length: 100_000,
            max_stream_buffer_bytes: 2_000_000,
            max_run_duration_secs: None,
            kill_on_cancel: true,
            cancel_grace_ms: 1_500,
            subscriber_buffer: 1_024,
            strip_ansi: true,
            log_dir: None,
        }
    }
}

impl DashboardConfig {
    pub fn from_yaml_str(raw: &str) -> AppResult<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            AppError::Config(format!("failed to read {}: {}", path.display(), error))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Explicit path from the environment, then `./dashboard.yaml`, then defaults.
    pub fn load() -> AppResult<Self> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::load_file(Path::new(&path))?,
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::load_file(fallback)?
                } else {
                    Self::default()
                }
            }
        };

        if let Ok(bind) = std::env::var(BIND_ENV) {
            if !bind.trim().is_empty() {
                config.bind = bind.trim().to_string();
            }
        }

        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.history_limit == 0 {
            return Err(AppError::Config("history_limit must be greater than zero".to_string()));
        }
        if self.subscriber_buffer == 0 {
            return Err(AppError::Config(
                "subscriber_buffer must be greater than zero".to_string(),
            ));
        }
        if self.max_output_events_per_stream == 0 {
            return Err(AppError::Config(
                "max_output_events_per_stream must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn buffer_limits(&self) -> BufferLimits {
        BufferLimits {
            max_output_events: self.max_output_events_per_stream,
            max_output_bytes: self.max_output_bytes_per_stream,
            max_log_events: self.max_log_events,
        }
    }
}

/// Per-run caps applied by every record the registry creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    pub max_output_events: usize,
    pub max_output_bytes: usize,
    pub max_log_events: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        DashboardConfig::default().buffer_limits()
    }
}

#[cfg(test)]
mod tests {
    use super::DashboardConfig;
    use crate::errors::AppError;
    use std::io::Write;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = DashboardConfig::from_yaml_str("history_limit: 5\nmax_run_duration_secs: 30\n")
            .expect("config");
        assert_eq!(config.history_limit, 5);
        assert_eq!(config.max_run_duration_secs, Some(30));
        assert_eq!(config.bind, DashboardConfig::default().bind);
        assert!(config.kill_on_cancel);
    }

    #[test]
    fn zero_history_limit_is_rejected() {
        let error = DashboardConfig::from_yaml_str("history_limit: 0\n").expect_err("invalid");
        assert!(matches!(error, AppError::Config(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "bind: 0.0.0.0:9000\nstrip_ansi: false").expect("write");
        let config = DashboardConfig::load_file(file.path()).expect("load");
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert!(!config.strip_ansi);
    }

    #[test]
    fn missing_file_is_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = DashboardConfig::load_file(&dir.path().join("absent.yaml")).expect_err("missing");
        assert!(matches!(error, AppError::Config(_)));
    }
}
