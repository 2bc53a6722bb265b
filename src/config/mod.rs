use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How the invoker treats bytes written by the engine to standard error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrPolicy {
    /// Any stderr output fails the analysis, whatever the exit code
    Fail,
    /// Stderr is logged as a warning; only the exit code decides
    Warn,
}

impl FromStr for StderrPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fail" | "fatal" | "strict" => Ok(StderrPolicy::Fail),
            "warn" | "warning" | "log" => Ok(StderrPolicy::Warn),
            other => Err(format!("unknown stderr policy '{}'", other)),
        }
    }
}

impl fmt::Display for StderrPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StderrPolicy::Fail => write!(f, "fail"),
            StderrPolicy::Warn => write!(f, "warn"),
        }
    }
}

/// Configuration for the upload-and-analyze pipeline
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Directory where uploads are staged (default: "uploads")
    pub upload_dir: PathBuf,

    /// Engine executable (default: "python")
    pub engine_program: String,

    /// Arguments placed before the staged file path (default: "model/run_model.py")
    pub engine_args: Vec<String>,

    /// Working directory for the engine process
    pub engine_working_dir: Option<PathBuf>,

    /// Hard limit on engine runtime in seconds (default: 120)
    pub engine_timeout_secs: u64,

    /// Stderr handling policy (default: fail)
    pub stderr_policy: StderrPolicy,

    /// Cap on captured stdout and stderr, each, in bytes (default: 4x max_file_size)
    pub engine_output_limit: u64,

    /// Echo engine diagnostics to the caller on failure (default: false)
    pub expose_engine_diagnostics: bool,

    /// Maximum dataset size in bytes (default: 16 MB)
    pub max_file_size: usize,

    /// Reject files whose extension is not in `allowed_extensions` (default: true)
    pub strict_extensions: bool,

    /// Recognized tabular extensions, lowercase and without the dot
    pub allowed_extensions: Vec<String>,

    /// Staged files older than this are swept, 0 disables the sweeper (default: 24)
    pub staging_cleanup_age_hours: u64,

    /// Interval between sweeps in seconds (default: 3600)
    pub staging_sweep_interval_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            engine_program: "python".to_string(),
            engine_args: vec!["model/run_model.py".to_string()],
            engine_working_dir: None,
            engine_timeout_secs: 120,
            stderr_policy: StderrPolicy::Fail,
            engine_output_limit: 4 * 16 * 1024 * 1024,
            expose_engine_diagnostics: false,
            max_file_size: 16 * 1024 * 1024, // 16 MB
            strict_extensions: true,
            allowed_extensions: vec!["csv".to_string(), "xlsx".to_string(), "xls".to_string()],
            staging_cleanup_age_hours: 24,
            staging_sweep_interval_secs: 3600,
        }
    }
}

impl AnalysisConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        let max_file_size = env::var("MAX_FILE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.max_file_size);

        Self {
            upload_dir: env::var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.upload_dir),

            engine_program: env::var("ENGINE_PROGRAM").unwrap_or(default.engine_program),

            engine_args: env::var("ENGINE_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or(default.engine_args),

            engine_working_dir: env::var("ENGINE_WORKDIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),

            engine_timeout_secs: env::var("ENGINE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.engine_timeout_secs),

            stderr_policy: env::var("ENGINE_STDERR_POLICY")
                .ok()
                .and_then(|v| match v.parse() {
                    Ok(policy) => Some(policy),
                    Err(e) => {
                        tracing::warn!("{}, falling back to '{}'", e, default.stderr_policy);
                        None
                    }
                })
                .unwrap_or(default.stderr_policy),

            engine_output_limit: env::var("ENGINE_OUTPUT_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| (max_file_size as u64).saturating_mul(4)),

            expose_engine_diagnostics: env::var("EXPOSE_ENGINE_DIAGNOSTICS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(default.expose_engine_diagnostics),

            max_file_size,

            strict_extensions: env::var("STRICT_EXTENSIONS")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(default.strict_extensions),

            allowed_extensions: env::var("ALLOWED_EXTENSIONS")
                .map(|v| parse_extension_list(&v))
                .unwrap_or(default.allowed_extensions),

            staging_cleanup_age_hours: env::var("STAGING_CLEANUP_AGE_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.staging_cleanup_age_hours),

            staging_sweep_interval_secs: env::var("STAGING_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.staging_sweep_interval_secs),
        }
    }

    /// Create config for development (any file type, diagnostics echoed)
    pub fn development() -> Self {
        Self {
            strict_extensions: false,
            expose_engine_diagnostics: true,
            engine_timeout_secs: 30,
            ..Self::default()
        }
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    pub fn staging_cleanup_age(&self) -> Option<Duration> {
        (self.staging_cleanup_age_hours > 0)
            .then(|| Duration::from_secs(self.staging_cleanup_age_hours.saturating_mul(3600)))
    }
}

fn parse_extension_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}
