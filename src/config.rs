//! Runtime configuration.
//!
//! Configuration is read once at startup, before the model is initialized.
//! Files may be YAML or JSON:
//!
//! ```yaml
//! time:
//!   base_unit: minutes
//!
//! random:
//!   streams_per_run: 2000
//!   max_replications: 100
//!
//! data_collection:
//!   disable_elements: ["Teller*"]
//!   disable_datasets:
//!     - element: "*"
//!       dataset: "ProcessTime"
//!
//! trace:
//!   enabled: false
//! ```

use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::time::TimeUnit;

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    /// I/O failure while reading a configuration file.
    Io(std::io::Error),
    /// YAML syntax or structure error.
    Yaml(serde_yaml::Error),
    /// JSON syntax or structure error.
    Json(serde_json::Error),
    /// Structurally valid configuration with out-of-domain values.
    Validation(String),
    /// Configuration file with an unrecognized extension.
    UnknownFormat(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Yaml(e) => write!(f, "YAML parsing error: {e}"),
            Self::Json(e) => write!(f, "JSON parsing error: {e}"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::UnknownFormat(ext) => write!(f, "unknown configuration file format: {ext}"),
        }
    }
}

impl Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Simulated-time options.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TimeConfig {
    /// Unit assigned to unit-less time literals. `None` makes the model
    /// dimensionless, in which case dimensioned literals are rejected.
    #[serde(default)]
    pub base_unit: Option<TimeUnit>,
}

/// Random number generation options.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RandomConfig {
    /// Highest usable stream index (exclusive) within one replication.
    #[serde(default = "default_streams_per_run")]
    pub streams_per_run: u32,

    /// Highest usable replication index.
    #[serde(default = "default_max_replications")]
    pub max_replications: u32,
}

fn default_streams_per_run() -> u32 {
    2000
}

fn default_max_replications() -> u32 {
    100
}

impl Default for RandomConfig {
    fn default() -> Self {
        Self {
            streams_per_run: default_streams_per_run(),
            max_replications: default_max_replications(),
        }
    }
}

/// A per-dataset disable filter: both fields are wildcard patterns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatasetFilter {
    /// Element id pattern; defaults to every element.
    #[serde(default = "default_star")]
    pub element: String,
    /// Dataset name pattern.
    pub dataset: String,
}

fn default_star() -> String {
    "*".to_string()
}

/// Data collection options.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DataCollectionConfig {
    /// Wildcard patterns of element ids whose datasets are not emitted.
    #[serde(default)]
    pub disable_elements: Vec<String>,

    /// Per-dataset disable filters.
    #[serde(default)]
    pub disable_datasets: Vec<DatasetFilter>,
}

impl DataCollectionConfig {
    /// Returns `true` if the dataset should be emitted to the data sink.
    pub(crate) fn dataset_enabled(&self, element_id: &str, dataset: &str) -> bool {
        if self
            .disable_elements
            .iter()
            .any(|p| wildcard_match(p, element_id))
        {
            return false;
        }
        !self
            .disable_datasets
            .iter()
            .any(|f| wildcard_match(&f.element, element_id) && wildcard_match(&f.dataset, dataset))
    }
}

/// Event tracing knobs. The engine only counts traced events and forwards
/// them to the `tracing` subscriber, if any; formatting and persistence are
/// the subscriber's concern.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Master switch.
    #[serde(default)]
    pub enabled: bool,

    /// Stop tracing after this many events (0 means unlimited).
    #[serde(default)]
    pub max_events: u64,

    /// Trace format selector, passed through to the subscriber.
    #[serde(default)]
    pub trace_type: Option<String>,

    /// Trace destination, passed through to the subscriber.
    #[serde(default)]
    pub destination: Option<String>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_events: 0,
            trace_type: None,
            destination: None,
        }
    }
}

/// Complete engine configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SimConfig {
    /// Simulated-time options.
    #[serde(default)]
    pub time: TimeConfig,

    /// Random number generation options.
    #[serde(default)]
    pub random: RandomConfig,

    /// Data collection options.
    #[serde(default)]
    pub data_collection: DataCollectionConfig,

    /// Tracing knobs.
    #[serde(default)]
    pub trace: TraceConfig,
}

impl SimConfig {
    /// Creates a configuration with every option at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = serde_yaml::from_str(yaml).map_err(ConfigError::Yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = serde_json::from_str(json).map_err(ConfigError::Json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a file, auto-detecting the format from the
    /// extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext.to_lowercase().as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "json" => Self::from_json(&content),
            _ => Err(ConfigError::UnknownFormat(ext.to_string())),
        }
    }

    /// Validates option domains.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.random.streams_per_run == 0 {
            return Err(ConfigError::Validation(
                "random.streams_per_run must be > 0".into(),
            ));
        }
        if self.random.max_replications == 0 {
            return Err(ConfigError::Validation(
                "random.max_replications must be > 0".into(),
            ));
        }
        let mut seen = HashSet::new();
        for pattern in &self.data_collection.disable_elements {
            if !seen.insert(pattern.as_str()) {
                tracing::warn!(pattern, "duplicate disable_elements pattern");
            }
        }
        Ok(())
    }
}

/// Matches a `*`-wildcard pattern against a string. `*` matches any run of
/// characters (including none); all other characters match literally.
pub(crate) fn wildcard_match(pattern: &str, input: &str) -> bool {
    fn matches(p: &[u8], s: &[u8]) -> bool {
        match p.split_first() {
            None => s.is_empty(),
            Some((b'*', rest)) => {
                (0..=s.len()).any(|i| matches(rest, &s[i..]))
            }
            Some((c, rest)) => s.split_first().is_some_and(|(d, tail)| c == d && matches(rest, tail)),
        }
    }
    matches(pattern.as_bytes(), input.as_bytes())
}
