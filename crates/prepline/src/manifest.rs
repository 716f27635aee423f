//! Manifest schema and parsing.
//!
//! A manifest is a YAML (or JSON) document describing one pipeline run:
//! identification fields, a simulated flag, and an ordered list of step
//! descriptors. Descriptor `params` stay untyped at parse time; the resolver
//! deserializes them into the per-type param structs below so that one bad
//! descriptor never fails parsing of the rest of the document.

use crate::step::{ExecutionMode, MissingPolicy};
use crate::table::JoinType;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Supported manifest encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Yaml,
    Json,
}

impl ManifestFormat {
    /// Guess the format from a file extension. Anything but `.json` is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => ManifestFormat::Json,
            _ => ManifestFormat::Yaml,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse YAML manifest: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse JSON manifest: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level manifest document.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub manifest_id: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    /// Safety default: runs are simulated unless the manifest opts out.
    #[serde(default = "default_true")]
    pub simulated: bool,
    #[serde(default)]
    pub job_steps: Vec<StepDescriptor>,
}

impl Manifest {
    pub fn from_yaml(text: &str) -> Result<Self, ManifestError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_str_format(text: &str, format: ManifestFormat) -> Result<Self, ManifestError> {
        match format {
            ManifestFormat::Yaml => Self::from_yaml(text),
            ManifestFormat::Json => Self::from_json(text),
        }
    }

    /// Read and parse a manifest file, sniffing the format from the
    /// extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str_format(&text, ManifestFormat::from_path(path))
    }
}

/// One entry of `job_steps`. The `type` field stays a plain string so that an
/// unknown step type is a resolver-level skip, not a parse failure.
#[derive(Debug, Clone, Deserialize)]
pub struct StepDescriptor {
    pub step_name: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub params: serde_yaml::Value,
}

impl StepDescriptor {
    /// Deserialize `params` into a typed param struct.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, serde_yaml::Error> {
        serde_yaml::from_value(self.params.clone())
    }
}

/// `type = "load"` params.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadParams {
    pub output_source_name: String,
    pub mode: LoadMode,
    pub path: PathBuf,
    /// Discovery glob, relative to `path`.
    #[serde(default = "default_include")]
    pub include: String,
    #[serde(default)]
    pub recursive: bool,
    /// Discover directories instead of plain files.
    #[serde(default)]
    pub directory_mode: bool,
    /// Loader name for the discovery result column. `None` or `"default"`
    /// means no deferred loading.
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub columns: ColumnParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Discovery,
    CsvFile,
}

/// Column configuration shared by both load modes.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnParams {
    /// Discovery: name of the column holding the raw path.
    #[serde(default)]
    pub column_name: Option<String>,
    /// Discovery: named-capture regex applied to each basename.
    #[serde(default)]
    pub filename_to_columnname: Option<String>,
    /// CSV: first record is a header row.
    #[serde(default = "default_true")]
    pub header: bool,
    /// CSV: field delimiter, a single character.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

impl Default for ColumnParams {
    fn default() -> Self {
        Self {
            column_name: None,
            filename_to_columnname: None,
            header: true,
            delimiter: default_delimiter(),
        }
    }
}

/// `type = "join"` params.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinParams {
    pub left_source_name: String,
    pub right_source_name: String,
    pub left_key: String,
    pub right_key: String,
    #[serde(default = "default_join_type")]
    pub join_type: JoinType,
    #[serde(default = "default_missing_policy")]
    pub missing_policy: MissingPolicy,
    /// Defaults to `<left>_<right>_joined`.
    #[serde(default)]
    pub output_source_name: Option<String>,
}

/// `type = "custom_command"` params.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomCommandParams {
    pub command: String,
    #[serde(default)]
    pub input_source_name: Option<String>,
    #[serde(default = "default_execution_mode")]
    pub execution_mode: ExecutionMode,
}

fn default_true() -> bool {
    true
}

fn default_include() -> String {
    "*".to_string()
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_join_type() -> JoinType {
    JoinType::Inner
}

fn default_missing_policy() -> MissingPolicy {
    MissingPolicy::Keep
}

fn default_execution_mode() -> ExecutionMode {
    ExecutionMode::Once
}
