//! Daemon configuration resolution.
//!
//! Precedence, lowest to highest: built-in defaults, an optional `ksi.toml`
//! (at `<home>/ksi.toml` or a path given explicitly), then environment
//! variables. The daemon home defaults to `~/.ksi` and is overridden by
//! `KSI_HOME`; everything else lives underneath it.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default per-attempt timeout ladder for completions, in seconds.
pub const DEFAULT_TIMEOUT_ATTEMPTS: [u64; 3] = [300, 900, 1800];

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct KsiConfig {
    /// Daemon home; all state lives under this directory.
    pub home_dir: PathBuf,
    /// Run directory: socket file, PID file, per-agent ephemera.
    pub run_dir: PathBuf,
    /// Embedded SQL database for the relational store.
    pub db_path: PathBuf,
    /// JSONL sink for the monitor journal.
    pub log_path: PathBuf,

    pub monitor: MonitorConfig,
    pub limits: LimitsConfig,
    pub completion: CompletionConfig,
}

/// Monitor journal sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Bound of the queryable in-memory window.
    pub max_entries: usize,
    /// Entries older than this are trimmed by the background sweep.
    pub max_age_secs: u64,
    /// JSONL file rotation threshold.
    pub file_max_bytes: u64,
    /// Rotated file count.
    pub file_max_files: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_age_secs: 24 * 60 * 60,
            file_max_bytes: 50 * 1024 * 1024,
            file_max_files: 5,
        }
    }
}

/// Startup values for the runtime-tunable resource limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Per-connection outbound queue depth.
    pub connection_queue_depth: u64,
    /// Per-agent message queue depth.
    pub agent_queue_depth: u64,
    /// Maximum transformer re-emission depth.
    pub max_route_depth: u64,
    /// Maximum graph traversal depth.
    pub max_traversal_depth: u64,
    /// Default wait for a correlated reply, in milliseconds.
    pub correlation_timeout_ms: u64,
    /// Client-side completion polling interval, in milliseconds.
    pub completion_poll_interval_ms: u64,
    /// Global completion worker pool size.
    pub completion_concurrency: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connection_queue_depth: 256,
            agent_queue_depth: 64,
            max_route_depth: 8,
            max_traversal_depth: 5,
            correlation_timeout_ms: 30_000,
            completion_poll_interval_ms: 2_000,
            completion_concurrency: 2,
        }
    }
}

/// Completion provider settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Provider binary; `claude` resolved from PATH unless overridden.
    pub claude_bin: PathBuf,
    /// Per-attempt timeout ladder, seconds.
    pub timeout_attempts: Vec<u64>,
    /// Kill the subprocess when it stays silent this long, seconds.
    pub progress_timeout_secs: u64,
    /// Pause between retry attempts, seconds.
    pub retry_backoff_secs: u64,
    /// Default model alias when a request names none.
    pub default_model: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            claude_bin: PathBuf::from("claude"),
            timeout_attempts: DEFAULT_TIMEOUT_ATTEMPTS.to_vec(),
            progress_timeout_secs: 300,
            retry_backoff_secs: 2,
            default_model: "sonnet".to_string(),
        }
    }
}

impl CompletionConfig {
    pub fn progress_timeout(&self) -> Duration {
        Duration::from_secs(self.progress_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

/// Partial configuration as parsed from `ksi.toml`. Any omitted section
/// falls back to its default.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    home: Option<PathBuf>,
    monitor: Option<MonitorConfig>,
    limits: Option<LimitsConfig>,
    completion: Option<CompletionConfig>,
}

impl KsiConfig {
    /// Resolve configuration from defaults, an optional config file, and the
    /// environment.
    ///
    /// # Arguments
    ///
    /// * `config_path` - Explicit `ksi.toml` path. When `None`, the file at
    ///   `<home>/ksi.toml` is used if present.
    pub fn resolve(config_path: Option<&Path>) -> Result<Self> {
        let home_dir = resolve_home()?;

        let file_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| home_dir.join("ksi.toml"));

        let file: FileConfig = if file_path.exists() {
            let raw = std::fs::read_to_string(&file_path)
                .with_context(|| format!("failed to read {}", file_path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("failed to parse {}", file_path.display()))?
        } else {
            FileConfig::default()
        };

        // The file may relocate the home; env wins over both.
        let home_dir = std::env::var("KSI_HOME")
            .map(PathBuf::from)
            .ok()
            .or(file.home)
            .unwrap_or(home_dir);

        let mut completion = file.completion.unwrap_or_default();
        if let Ok(bin) = std::env::var("KSI_CLAUDE_BIN") {
            completion.claude_bin = PathBuf::from(bin);
        }

        Ok(Self {
            run_dir: home_dir.join("run"),
            db_path: home_dir.join("ksi.db"),
            log_path: home_dir.join("events.jsonl"),
            home_dir,
            monitor: file.monitor.unwrap_or_default(),
            limits: file.limits.unwrap_or_default(),
            completion,
        })
    }

    /// Path of the daemon's Unix socket.
    pub fn socket_path(&self) -> PathBuf {
        self.run_dir.join("ksi.sock")
    }

    /// Path of the daemon's PID file.
    pub fn pid_path(&self) -> PathBuf {
        self.run_dir.join("ksi.pid")
    }

    /// Per-agent sandbox directory.
    pub fn sandbox_dir(&self, agent_id: &str) -> PathBuf {
        self.run_dir.join("sandbox").join(agent_id)
    }

    /// Per-agent MCP config file.
    pub fn mcp_config_path(&self, agent_id: &str) -> PathBuf {
        self.run_dir.join("mcp").join(format!("{agent_id}.json"))
    }

    /// Composition profiles directory.
    pub fn compositions_dir(&self) -> PathBuf {
        self.home_dir.join("compositions")
    }
}

fn resolve_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("KSI_HOME") {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|h| h.join(".ksi"))
        .context("could not determine home directory (set KSI_HOME)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_defaults_under_ksi_home() {
        let tmp = TempDir::new().unwrap();
        unsafe {
            std::env::set_var("KSI_HOME", tmp.path());
            std::env::remove_var("KSI_CLAUDE_BIN");
        }
        let cfg = KsiConfig::resolve(None).unwrap();
        assert_eq!(cfg.home_dir, tmp.path());
        assert_eq!(cfg.socket_path(), tmp.path().join("run/ksi.sock"));
        assert_eq!(cfg.db_path, tmp.path().join("ksi.db"));
        assert_eq!(cfg.limits.max_route_depth, 8);
        assert_eq!(cfg.limits.max_traversal_depth, 5);
        assert_eq!(cfg.completion.timeout_attempts, vec![300, 900, 1800]);
        assert_eq!(cfg.completion.progress_timeout_secs, 300);
    }

    #[test]
    #[serial]
    fn test_file_overrides_and_partial_sections() {
        let tmp = TempDir::new().unwrap();
        unsafe {
            std::env::set_var("KSI_HOME", tmp.path());
        }
        let toml_path = tmp.path().join("ksi.toml");
        std::fs::write(
            &toml_path,
            r#"
[limits]
max_route_depth = 4

[completion]
timeout_attempts = [1, 2]
default_model = "opus"
"#,
        )
        .unwrap();

        let cfg = KsiConfig::resolve(None).unwrap();
        assert_eq!(cfg.limits.max_route_depth, 4);
        // Unspecified keys in a present section keep defaults.
        assert_eq!(cfg.limits.correlation_timeout_ms, 30_000);
        assert_eq!(cfg.completion.timeout_attempts, vec![1, 2]);
        assert_eq!(cfg.completion.default_model, "opus");
        // Absent sections are fully defaulted.
        assert_eq!(cfg.monitor.max_entries, 10_000);
    }

    #[test]
    #[serial]
    fn test_env_overrides_provider_bin() {
        let tmp = TempDir::new().unwrap();
        unsafe {
            std::env::set_var("KSI_HOME", tmp.path());
            std::env::set_var("KSI_CLAUDE_BIN", "/opt/bin/claude-test");
        }
        let cfg = KsiConfig::resolve(None).unwrap();
        assert_eq!(
            cfg.completion.claude_bin,
            PathBuf::from("/opt/bin/claude-test")
        );
        unsafe {
            std::env::remove_var("KSI_CLAUDE_BIN");
        }
    }
}
