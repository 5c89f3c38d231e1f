//! Configuration for the modbridge debug adapter.
//!
//! The adapter reads an optional TOML file:
//!
//! ```toml
//! [logging]
//! level = "debug"          # or any `EnvFilter` directive string
//! json = false
//! stderr = true
//! file = "/tmp/modbridge.log"
//!
//! [adapter]
//! kill_grace_ms = 2000
//! hook_mod = "debugadapter"
//! ```
//!
//! Stdout carries DAP traffic, so it is never used as a log sink.

mod diagnostics;

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Once},
    time::Duration,
};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriter, MakeWriterExt},
    layer::SubscriberExt,
    Layer,
};

pub use diagnostics::{ConfigDiagnostics, ConfigWarning};

/// Environment variable naming a config file when `--config` is not given.
pub const CONFIG_ENV_VAR: &str = "MODBRIDGE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level for all modbridge crates.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    /// Mirror logs to stderr.
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to the given file path.
    ///
    /// If the file cannot be opened, file logging is disabled while other sinks
    /// remain active.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Capture and include backtraces in panic reports.
    #[serde(default)]
    pub include_backtrace: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            // Simple levels should be forgiving about casing and synonyms.
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            "off" | "none" => "off".to_owned(),
            // Anything else is treated as an `EnvFilter` directive string.
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// Create the effective `EnvFilter`.
    ///
    /// `level` may be either a simple level (`info`, `debug`, ...) or a full
    /// `tracing_subscriber::EnvFilter` directive string. If `RUST_LOG` is set,
    /// it is merged into the resulting filter.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
            include_backtrace: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// How long the target gets to exit after a terminate request before its
    /// process tree is killed.
    #[serde(default = "AdapterConfig::default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Longest target output line kept intact; longer lines are forwarded in
    /// chunks.
    #[serde(default = "AdapterConfig::default_max_output_line_bytes")]
    pub max_output_line_bytes: usize,

    /// Mod that carries the debug hook. It is always enabled at launch.
    #[serde(default = "AdapterConfig::default_hook_mod")]
    pub hook_mod: String,

    /// Mandatory base mod that may only be disabled with `allowDisableBaseMod`.
    #[serde(default = "AdapterConfig::default_base_mod")]
    pub base_mod: String,

    /// Rendered string values longer than this many characters are truncated.
    #[serde(default = "AdapterConfig::default_max_string_len")]
    pub max_string_len: usize,
}

impl AdapterConfig {
    fn default_kill_grace_ms() -> u64 {
        2_000
    }

    fn default_max_output_line_bytes() -> usize {
        4 * 1024 * 1024
    }

    fn default_hook_mod() -> String {
        "debugadapter".to_owned()
    }

    fn default_base_mod() -> String {
        "base".to_owned()
    }

    fn default_max_string_len() -> usize {
        1_000
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            kill_grace_ms: Self::default_kill_grace_ms(),
            max_output_line_bytes: Self::default_max_output_line_bytes(),
            hook_mod: Self::default_hook_mod(),
            base_mod: Self::default_base_mod(),
            max_string_len: Self::default_max_string_len(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // Keep just the message; the default `Display` includes a source
        // snippet of the file.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl BridgeConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_from_path_with_diagnostics(path).map(|(config, _)| config)
    }

    /// Load a config file and report unknown keys and replaced values.
    pub fn load_from_path_with_diagnostics(
        path: impl AsRef<Path>,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str_with_diagnostics(&text)
    }

    pub fn load_from_str_with_diagnostics(
        text: &str,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let (mut config, unknown_keys) =
            diagnostics::deserialize_toml_with_unknown_keys::<BridgeConfig>(text)?;
        let mut diagnostics = ConfigDiagnostics {
            unknown_keys,
            ..ConfigDiagnostics::default()
        };
        config.validate(&mut diagnostics);
        Ok((config, diagnostics))
    }

    /// Resolve which config file to use: an explicit path wins over
    /// [`CONFIG_ENV_VAR`].
    pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        explicit.map(Path::to_path_buf).or_else(|| {
            std::env::var_os(CONFIG_ENV_VAR)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
    }

    /// Replace out-of-range values with defaults, recording a warning for each.
    fn validate(&mut self, diagnostics: &mut ConfigDiagnostics) {
        let normalized = LoggingConfig::normalize_level_directives(&self.logging.level);
        if tracing_subscriber::EnvFilter::try_new(&normalized).is_err() {
            diagnostics.warnings.push(ConfigWarning::LoggingLevelInvalid {
                value: self.logging.level.clone(),
                normalized,
            });
            self.logging.level = LoggingConfig::default_level();
        }

        if self.adapter.max_output_line_bytes < 1024 {
            diagnostics.warnings.push(ConfigWarning::InvalidValue {
                toml_path: "adapter.max_output_line_bytes".to_owned(),
                message: format!(
                    "must be at least 1024 (got {})",
                    self.adapter.max_output_line_bytes
                ),
            });
            self.adapter.max_output_line_bytes = AdapterConfig::default_max_output_line_bytes();
        }

        if self.adapter.max_string_len == 0 {
            diagnostics.warnings.push(ConfigWarning::InvalidValue {
                toml_path: "adapter.max_string_len".to_owned(),
                message: "must be greater than 0".to_owned(),
            });
            self.adapter.max_string_len = AdapterConfig::default_max_string_len();
        }

        if self.adapter.hook_mod.trim().is_empty() {
            diagnostics.warnings.push(ConfigWarning::InvalidValue {
                toml_path: "adapter.hook_mod".to_owned(),
                message: "must not be empty".to_owned(),
            });
            self.adapter.hook_mod = AdapterConfig::default_hook_mod();
        }
    }
}

struct MutexFileMakeWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl<'a> MakeWriter<'a> for MutexFileMakeWriter {
    type Writer = MutexFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        MutexFileWriter {
            guard: self.file.lock(),
        }
    }
}

struct MutexFileWriter<'a> {
    guard: MutexGuard<'a, std::fs::File>,
}

impl Write for MutexFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

static TRACING_INIT: Once = Once::new();

/// Initializes structured `tracing` logging.
///
/// This function is safe to call multiple times; only the first call installs a
/// global subscriber.
pub fn init_tracing(logging: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = logging.env_filter();

        let file = logging
            .file
            .as_ref()
            .and_then(|path| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .ok()
            })
            .map(|file| Arc::new(Mutex::new(file)));
        let file_open_failed = logging.file.is_some() && file.is_none();

        let mut make_writer = BoxMakeWriter::new(io::sink);
        if logging.stderr {
            // `cargo test` output capture only works for the stdlib's `print!/eprint!`
            // macros. Using `TestWriter` in debug builds keeps unit tests quiet
            // while still providing real-time logs for `cargo run` workflows.
            if cfg!(debug_assertions) {
                make_writer = BoxMakeWriter::new(tracing_subscriber::fmt::writer::TestWriter::with_stderr);
            } else {
                make_writer = BoxMakeWriter::new(io::stderr);
            }
        }
        if let Some(file) = file {
            make_writer = BoxMakeWriter::new(make_writer.and(MutexFileMakeWriter { file }));
        }

        let layer: Box<dyn Layer<_> + Send + Sync> = if logging.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        if tracing::subscriber::set_global_default(subscriber).is_ok() && file_open_failed {
            if let Some(path) = logging.file.as_ref() {
                tracing::warn!(
                    target: "modbridge.config",
                    path = %path.display(),
                    "failed to open log file; file logging disabled"
                );
            }
        }
    });
}
