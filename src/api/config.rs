//! Allocator configuration.
//!
//! Besides the plain struct + builder interface, [`AllocConfig`] can be
//! parsed from an option string of `keyword:value` tokens (the format
//! the original debugging layer read from its environment). Parsing
//! returns a typed error; deciding whether a bad configuration is
//! fatal is the caller's business, never the library's.

use std::path::PathBuf;

use thiserror::Error;

use crate::api::modes::Mode;

/// Environment variable consulted by [`AllocConfig::from_env`].
pub const CONFIG_ENV_VAR: &str = "GUARDALLOC";

/// Configuration for a [`GuardAlloc`](crate::GuardAlloc) context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocConfig {
    /// Mode flags active at startup.
    pub initial_mode: Mode,

    /// Trace log destination; stderr when absent.
    pub trace_file: Option<PathBuf>,

    /// Capacity of the mode stack (default: 1000).
    pub mode_stack_depth: usize,

    /// How many released-block records are kept so double frees can be
    /// reported as `Released` rather than `NotFound` (default: 4096).
    pub tombstone_limit: usize,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            initial_mode: Mode::empty(),
            trace_file: None,
            mode_stack_depth: 1000,
            tombstone_limit: 4096,
        }
    }
}

impl AllocConfig {
    /// Builder pattern: set the startup mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.initial_mode = mode;
        self
    }

    /// Builder pattern: set the trace file path.
    pub fn with_trace_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace_file = Some(path.into());
        self
    }

    /// Builder pattern: set the mode stack capacity.
    pub fn with_mode_stack_depth(mut self, depth: usize) -> Self {
        self.mode_stack_depth = depth;
        self
    }

    /// Builder pattern: set the tombstone retention bound.
    pub fn with_tombstone_limit(mut self, limit: usize) -> Self {
        self.tombstone_limit = limit;
        self
    }

    /// Parse an option string of whitespace-separated tokens.
    ///
    /// Recognized tokens: `debug:y|n`, `trace:y|n`, `warning:y|n`,
    /// `continue:y|n`, `modify:y|n`, and `file:<path>`.
    pub fn from_spec(spec: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for token in spec.split_whitespace() {
            let (keyword, value) = token
                .split_once(':')
                .ok_or_else(|| ConfigError::MissingValue(token.to_string()))?;

            match keyword {
                "debug" => config.apply_flag(Mode::DEBUG, keyword, value)?,
                "trace" => config.apply_flag(Mode::TRACE, keyword, value)?,
                "warning" => config.apply_flag(Mode::WARNING, keyword, value)?,
                "continue" => config.apply_flag(Mode::CONTINUE, keyword, value)?,
                "modify" => config.apply_flag(Mode::MODIFY, keyword, value)?,
                "file" => {
                    if value.is_empty() {
                        return Err(ConfigError::MissingValue(token.to_string()));
                    }
                    config.trace_file = Some(PathBuf::from(value));
                }
                _ => return Err(ConfigError::UnknownKeyword(keyword.to_string())),
            }
        }

        Ok(config)
    }

    /// Read the configuration from the `GUARDALLOC` environment
    /// variable. An unset variable yields the default configuration.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(spec) => Self::from_spec(&spec),
            Err(_) => Ok(Self::default()),
        }
    }

    fn apply_flag(&mut self, flag: Mode, keyword: &str, value: &str) -> Result<(), ConfigError> {
        match value {
            "y" => self.initial_mode |= flag,
            "n" => self.initial_mode -= flag,
            _ => {
                return Err(ConfigError::BadValue {
                    keyword: keyword.to_string(),
                    value: value.to_string(),
                })
            }
        }
        Ok(())
    }
}

/// Option-string parse failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Token names a keyword this crate does not know.
    #[error("unknown configuration keyword `{0}`")]
    UnknownKeyword(String),

    /// Token has no `:value` part.
    #[error("configuration token `{0}` is missing a value")]
    MissingValue(String),

    /// Flag value is not `y` or `n`.
    #[error("bad value `{value}` for keyword `{keyword}` (expected y or n)")]
    BadValue { keyword: String, value: String },
}
