//! Run configuration.

use std::env;
use std::path::PathBuf;

/// Environment variable that forces serial execution for every run in
/// the process, whatever the per-run configuration says. Accepted values
/// are `yes`, `y`, `true` and `1`, case-insensitive.
pub const SERIAL_ENV: &str = "LOCKSTEP_SERIAL";

/// Configuration for one harness run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Label used in logs and the run report.
    pub name: String,
    /// Run workers on their own threads (default) or one after another.
    pub parallel: bool,
    /// When false, checkpoint calls inside workloads become no-ops.
    pub checkpoints: bool,
    /// Write the run summary as pretty JSON here after the run.
    pub report_path: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: "lockstep".to_owned(),
            parallel: true,
            checkpoints: true,
            report_path: None,
        }
    }
}

impl RunConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: bool) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn with_report_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = Some(path.into());
        self
    }

    /// Whether this run executes serially, honoring the environment
    /// override before the configured flag.
    pub fn serialized(&self) -> bool {
        env_serialized() || !self.parallel
    }
}

/// True when [`SERIAL_ENV`] forces serial execution.
pub fn env_serialized() -> bool {
    match env::var(SERIAL_ENV) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "yes" | "y" | "true" | "1"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.name, "lockstep");
        assert!(config.parallel);
        assert!(config.checkpoints);
        assert!(config.report_path.is_none());
    }

    #[test]
    fn test_chained_setters() {
        let config = RunConfig::new("nightly")
            .with_parallel(false)
            .with_checkpoints(false)
            .with_report_path("/tmp/nightly.json");
        assert_eq!(config.name, "nightly");
        assert!(!config.parallel);
        assert!(!config.checkpoints);
        assert_eq!(
            config.report_path.as_deref(),
            Some(std::path::Path::new("/tmp/nightly.json"))
        );
    }

    #[test]
    #[serial]
    fn test_env_override_forces_serial() {
        let config = RunConfig::default();
        for value in ["yes", "Y", "TRUE", "1"] {
            env::set_var(SERIAL_ENV, value);
            assert!(config.serialized(), "value {:?} should force serial", value);
        }
        for value in ["no", "0", "false", ""] {
            env::set_var(SERIAL_ENV, value);
            assert!(!config.serialized(), "value {:?} should not force serial", value);
        }
        env::remove_var(SERIAL_ENV);
        assert!(!config.serialized());
        assert!(RunConfig::default().with_parallel(false).serialized());
    }
}
