//! Sources and their acquisition strategies.
//!
//! A source is a named dataset inside one pipeline run, backed by a
//! [`LazyTable`]. Strategy-backed sources materialize eagerly when the source
//! is constructed; step-output sources start empty and are written exactly
//! once by their producing step. Acquisition never hard-fails: a bad path or
//! glob degrades to an empty table with a warning so that downstream steps
//! simply see zero rows.

use crate::loader::Loader;
use crate::table::LazyTable;
use crate::value::Value;
use indexmap::IndexMap;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Default name of the discovery column holding the raw file path.
pub const DEFAULT_RESULT_COLUMN: &str = "path";

/// Ordered map of sources by name, shared across one pipeline run.
pub type SourceMap = IndexMap<String, Source>;

/// How a source acquires its initial table.
#[derive(Clone)]
pub enum SourceStrategy {
    /// Eagerly parse a delimited file. All cells are strings; no loaders.
    CsvFile {
        path: PathBuf,
        delimiter: u8,
        header: bool,
    },
    /// List files matching a glob and extract columns from each filename.
    FileDiscovery {
        root: PathBuf,
        include: String,
        recursive: bool,
        /// Match directories instead of plain files.
        directory_mode: bool,
        /// Named capture groups become columns; a pattern without named
        /// groups yields a single `id` column from the whole match.
        id_pattern: Regex,
        /// Column holding the raw path, carrying the loader.
        result_column: String,
        /// Deferred loader for the result column, by registry name.
        loader: Option<(String, Arc<dyn Loader>)>,
    },
    /// Zero-row schema used to seed a join output before the join runs.
    PreCalculated { columns: Vec<String> },
}

impl std::fmt::Debug for SourceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceStrategy::CsvFile { path, .. } => {
                f.debug_struct("CsvFile").field("path", path).finish()
            }
            SourceStrategy::FileDiscovery { root, include, .. } => f
                .debug_struct("FileDiscovery")
                .field("root", root)
                .field("include", include)
                .finish(),
            SourceStrategy::PreCalculated { columns } => f
                .debug_struct("PreCalculated")
                .field("columns", columns)
                .finish(),
        }
    }
}

impl SourceStrategy {
    /// Short tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SourceStrategy::CsvFile { .. } => "csv_file",
            SourceStrategy::FileDiscovery { .. } => "discovery",
            SourceStrategy::PreCalculated { .. } => "pre_calculated",
        }
    }

    /// Produce the initial table. Infallible by design: acquisition problems
    /// degrade to an empty result with a warning.
    pub fn acquire(&self) -> LazyTable {
        match self {
            SourceStrategy::CsvFile {
                path,
                delimiter,
                header,
            } => acquire_csv(path, *delimiter, *header),
            SourceStrategy::FileDiscovery {
                root,
                include,
                recursive,
                directory_mode,
                id_pattern,
                result_column,
                loader,
            } => acquire_discovery(
                root,
                include,
                *recursive,
                *directory_mode,
                id_pattern,
                result_column,
                loader.as_ref(),
            ),
            SourceStrategy::PreCalculated { columns } => LazyTable::new(columns.clone()),
        }
    }
}

fn acquire_csv(path: &Path, delimiter: u8, header: bool) -> LazyTable {
    let mut reader = match csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(header)
        .from_path(path)
    {
        Ok(reader) => reader,
        Err(err) => {
            warn!("failed to open CSV file {}: {}", path.display(), err);
            return LazyTable::default();
        }
    };

    let mut columns: Vec<String> = Vec::new();
    if header {
        match reader.headers() {
            Ok(headers) => columns = headers.iter().map(str::to_string).collect(),
            Err(err) => {
                warn!("failed to read CSV header in {}: {}", path.display(), err);
                return LazyTable::default();
            }
        }
    }

    let mut rows: Vec<Vec<Value>> = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!("skipping malformed CSV record in {}: {}", path.display(), err);
                continue;
            }
        };
        if columns.is_empty() {
            // Headerless file: columns named by index, like positional labels.
            columns = (0..record.len()).map(|i| i.to_string()).collect();
        }
        rows.push(record.iter().map(Value::from).collect());
    }

    LazyTable::from_rows(columns, rows)
}

fn acquire_discovery(
    root: &Path,
    include: &str,
    recursive: bool,
    directory_mode: bool,
    id_pattern: &Regex,
    result_column: &str,
    loader: Option<&(String, Arc<dyn Loader>)>,
) -> LazyTable {
    let pattern = if recursive {
        root.join("**").join(include)
    } else {
        root.join(include)
    };
    let paths = match glob::glob(&pattern.to_string_lossy()) {
        Ok(paths) => paths,
        Err(err) => {
            warn!("invalid discovery pattern {}: {}", pattern.display(), err);
            return LazyTable::default();
        }
    };

    // Named groups become columns, in pattern order; the result column
    // holding the raw path comes last.
    let group_names: Vec<&str> = id_pattern.capture_names().flatten().collect();
    let mut columns: Vec<String> = if group_names.is_empty() {
        vec!["id".to_string()]
    } else {
        group_names.iter().map(|s| s.to_string()).collect()
    };
    columns.push(result_column.to_string());

    let mut rows: Vec<Vec<Value>> = Vec::new();
    for entry in paths {
        let path = match entry {
            Ok(path) => path,
            Err(err) => {
                warn!("unreadable path during discovery: {}", err);
                continue;
            }
        };
        if directory_mode != path.is_dir() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(caps) = id_pattern.captures(&name) else {
            warn!(
                "filename {} does not match pattern {}",
                name,
                id_pattern.as_str()
            );
            continue;
        };

        let mut row: Vec<Value> = Vec::with_capacity(columns.len());
        if group_names.is_empty() {
            row.push(Value::from(caps.get(0).map(|m| m.as_str()).unwrap_or("")));
        } else {
            for group in &group_names {
                row.push(match caps.name(group) {
                    Some(m) => Value::from(m.as_str()),
                    None => Value::Null,
                });
            }
        }
        row.push(Value::from(path.to_string_lossy().into_owned()));
        rows.push(row);
    }

    if rows.is_empty() {
        warn!(
            "discovery under {} with pattern '{}' found no matching entries",
            root.display(),
            include
        );
    }

    let mut table = LazyTable::from_rows(columns, rows);
    if let Some((_, loader)) = loader {
        table.set_loader(result_column, loader.clone());
    }
    table
}

/// A named dataset within one pipeline run.
pub struct Source {
    name: String,
    strategy: Option<SourceStrategy>,
    table: Option<LazyTable>,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .field("rows", &self.table.as_ref().map(LazyTable::len))
            .finish()
    }
}

impl Source {
    /// Create a strategy-backed source, acquiring its table immediately.
    pub fn with_strategy(name: impl Into<String>, strategy: SourceStrategy) -> Self {
        let name = name.into();
        let table = strategy.acquire();
        info!(
            "source '{}' loaded {} row(s) via '{}'",
            name,
            table.len(),
            strategy.kind()
        );
        Self {
            name,
            strategy: Some(strategy),
            table: Some(table),
        }
    }

    /// Create an empty source to be populated later by its producing step.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            strategy: None,
            table: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> Option<&SourceStrategy> {
        self.strategy.as_ref()
    }

    /// The current table, if populated.
    pub fn table(&self) -> Option<&LazyTable> {
        self.table.as_ref()
    }

    /// Write the table produced by this source's step. Called exactly once,
    /// with a fully computed result.
    pub fn set_table(&mut self, table: LazyTable) {
        self.table = Some(table);
    }

    /// Current schema; empty when the source has no table yet.
    pub fn column_names(&self) -> Vec<String> {
        self.table
            .as_ref()
            .map(|t| t.columns().to_vec())
            .unwrap_or_default()
    }
}
