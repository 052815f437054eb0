//! Execution options
//!
//! Every public entry point takes an [`ExecutionOptions`]; there is no
//! process-wide switch. Options can be built in code or loaded from a JSON
//! file where every field is optional:
//!
//! ```json
//! { "force_fallback": false, "max_sql_stages": 32, "batch_size": 500 }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::observability::{log_event_with_fields, Event};

/// Errors loading or validating options
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read options file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid options JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid option: {0}")]
    Invalid(String),
}

/// Result type for option loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Per-execution options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Skip the SQL and staged tiers and run the interpreter directly
    #[serde(default)]
    pub force_fallback: bool,

    /// Route by expression complexity before trying the SQL tier
    #[serde(default = "default_true")]
    pub heuristic_tiering: bool,

    /// Run the cost-based reorderer before compiling
    #[serde(default = "default_true")]
    pub optimize: bool,

    /// Stage count above which the SQL tier declines
    #[serde(default = "default_max_sql_stages")]
    pub max_sql_stages: usize,

    /// Rows per batch when streaming stages through the interpreter
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seed for `$sample`; when set, sampling is reproducible
    #[serde(default)]
    pub sample_seed: Option<u64>,
}

fn default_true() -> bool {
    true
}
fn default_max_sql_stages() -> usize {
    32
}
fn default_batch_size() -> usize {
    500
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            force_fallback: false,
            heuristic_tiering: default_true(),
            optimize: default_true(),
            max_sql_stages: default_max_sql_stages(),
            batch_size: default_batch_size(),
            sample_seed: None,
        }
    }
}

impl ExecutionOptions {
    /// Options that run every pipeline through the interpreter
    pub fn interpreter_only() -> Self {
        Self {
            force_fallback: true,
            ..Self::default()
        }
    }

    /// Load options from a JSON file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path)?;
        let options = Self::from_json_str(&content)?;
        log_event_with_fields(
            Event::OptionsLoaded,
            &[("path", &path.display().to_string())],
        );
        Ok(options)
    }

    /// Parse and validate options from JSON text
    pub fn from_json_str(content: &str) -> ConfigResult<Self> {
        let options: ExecutionOptions = serde_json::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    /// Validate option ranges
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_sql_stages == 0 {
            return Err(ConfigError::Invalid("max_sql_stages must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be > 0".into()));
        }
        Ok(())
    }

    /// Builder: force the interpreter tier
    pub fn with_force_fallback(mut self, force: bool) -> Self {
        self.force_fallback = force;
        self
    }

    /// Builder: toggle heuristic routing
    pub fn with_heuristic_tiering(mut self, enabled: bool) -> Self {
        self.heuristic_tiering = enabled;
        self
    }

    /// Builder: toggle the optimizer
    pub fn with_optimize(mut self, enabled: bool) -> Self {
        self.optimize = enabled;
        self
    }

    /// Builder: set the SQL stage limit
    pub fn with_max_sql_stages(mut self, max: usize) -> Self {
        self.max_sql_stages = max;
        self
    }

    /// Builder: set the interpreter batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Builder: fix the `$sample` seed
    pub fn with_sample_seed(mut self, seed: u64) -> Self {
        self.sample_seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let options = ExecutionOptions::default();
        assert!(!options.force_fallback);
        assert!(options.heuristic_tiering);
        assert!(options.optimize);
        assert_eq!(options.max_sql_stages, 32);
        assert_eq!(options.batch_size, 500);
        assert_eq!(options.sample_seed, None);
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let options = ExecutionOptions::from_json_str("{}").unwrap();
        assert_eq!(options, ExecutionOptions::default());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let result = ExecutionOptions::from_json_str(r#"{"batch_size": 0}"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("aeropipe.json");
        let content = json!({"force_fallback": true, "sample_seed": 7});
        fs::write(&path, content.to_string()).unwrap();

        let options = ExecutionOptions::load(&path).unwrap();
        assert!(options.force_fallback);
        assert_eq!(options.sample_seed, Some(7));
        assert_eq!(options.max_sql_stages, 32);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let result = ExecutionOptions::load(&temp_dir.path().join("missing.json"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
