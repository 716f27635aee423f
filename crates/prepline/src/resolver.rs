//! Manifest resolution: descriptors to sources and steps.
//!
//! A single left-to-right pass over `job_steps`. Each descriptor either
//! registers a source, appends a pipeline step, or both; a descriptor that
//! fails validation is logged and skipped without aborting the rest of the
//! manifest. Step inputs resolve against names registered by *earlier*
//! descriptors only, so forward references are rejected here rather than at
//! run time.

use crate::loader::LoaderRegistry;
use crate::manifest::{
    CustomCommandParams, JoinParams, LoadMode, LoadParams, Manifest, StepDescriptor,
};
use crate::pipeline::Pipeline;
use crate::source::{DEFAULT_RESULT_COLUMN, Source, SourceMap, SourceStrategy};
use crate::step::{CustomCommandStep, ExecutionMode, JoinStep, Step, placeholder_fields};
use regex::Regex;
use tracing::{debug, error, info, warn};

/// Output of manifest resolution: the registered sources and the step queue.
#[derive(Debug)]
pub struct Resolved {
    pub sources: SourceMap,
    pub pipeline: Pipeline,
}

/// Why one descriptor was skipped.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid params: {0}")]
    Params(#[from] serde_yaml::Error),

    #[error("unknown step type '{step_type}'")]
    UnknownStepType { step_type: String },

    #[error("source '{name}' is already declared")]
    DuplicateSource { name: String },

    #[error("source '{name}' is not declared by an earlier step")]
    UnknownSource { name: String },

    #[error("no loader registered under '{name}'")]
    UnknownLoader { name: String },

    #[error("delimiter '{delimiter}' must be a single byte")]
    BadDelimiter { delimiter: String },

    #[error("invalid filename pattern '{pattern}': {source}")]
    BadPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("per-row execution requires an input source")]
    MissingInputSource,
}

/// Resolve a manifest against a loader registry.
///
/// Never fails as a whole: invalid descriptors are skipped with an `error!`
/// and disabled ones with an `info!`.
pub fn resolve(manifest: &Manifest, registry: &LoaderRegistry) -> Resolved {
    info!(
        "resolving manifest {} (created by {} at {}, simulated: {})",
        manifest.manifest_id.as_deref().unwrap_or("<unnamed>"),
        manifest.created_by.as_deref().unwrap_or("<unknown>"),
        manifest.created_at.as_deref().unwrap_or("<unknown>"),
        manifest.simulated
    );

    let mut sources = SourceMap::new();
    let mut pipeline = Pipeline::new(manifest.simulated);
    for descriptor in &manifest.job_steps {
        if !descriptor.enabled {
            info!("step '{}' is disabled, skipping", descriptor.step_name);
            continue;
        }
        if let Err(err) = resolve_descriptor(descriptor, registry, &mut sources, &mut pipeline) {
            error!("skipping step '{}': {}", descriptor.step_name, err);
        }
    }
    Resolved { sources, pipeline }
}

fn resolve_descriptor(
    descriptor: &StepDescriptor,
    registry: &LoaderRegistry,
    sources: &mut SourceMap,
    pipeline: &mut Pipeline,
) -> Result<(), ResolveError> {
    match descriptor.step_type.as_str() {
        "load" => resolve_load(descriptor, registry, sources),
        "join" => resolve_join(descriptor, sources, pipeline),
        "custom_command" => resolve_custom_command(descriptor, sources, pipeline),
        other => Err(ResolveError::UnknownStepType {
            step_type: other.to_string(),
        }),
    }
}

fn resolve_load(
    descriptor: &StepDescriptor,
    registry: &LoaderRegistry,
    sources: &mut SourceMap,
) -> Result<(), ResolveError> {
    let params: LoadParams = descriptor.params_as()?;
    let name = params.output_source_name.clone();
    if sources.contains_key(&name) {
        return Err(ResolveError::DuplicateSource { name });
    }

    let strategy = match params.mode {
        LoadMode::CsvFile => {
            if let Some(file_type) = params.file_type.as_deref() {
                warn!(
                    "step '{}': file_type '{}' has no effect in csv_file mode",
                    descriptor.step_name, file_type
                );
            }
            SourceStrategy::CsvFile {
                path: params.path.clone(),
                delimiter: single_byte(&params.columns.delimiter)?,
                header: params.columns.header,
            }
        }
        LoadMode::Discovery => {
            let pattern = params
                .columns
                .filename_to_columnname
                .as_deref()
                .unwrap_or(".+");
            let id_pattern = Regex::new(pattern).map_err(|source| ResolveError::BadPattern {
                pattern: pattern.to_string(),
                source,
            })?;
            let loader = match params.file_type.as_deref() {
                None | Some("default") => None,
                Some(loader_name) => {
                    let loader =
                        registry
                            .get(loader_name)
                            .ok_or_else(|| ResolveError::UnknownLoader {
                                name: loader_name.to_string(),
                            })?;
                    Some((loader_name.to_string(), loader))
                }
            };
            SourceStrategy::FileDiscovery {
                root: params.path.clone(),
                include: params.include.clone(),
                recursive: params.recursive,
                directory_mode: params.directory_mode,
                id_pattern,
                result_column: params
                    .columns
                    .column_name
                    .clone()
                    .unwrap_or_else(|| DEFAULT_RESULT_COLUMN.to_string()),
                loader,
            }
        }
    };

    sources.insert(name.clone(), Source::with_strategy(name, strategy));
    Ok(())
}

fn resolve_join(
    descriptor: &StepDescriptor,
    sources: &mut SourceMap,
    pipeline: &mut Pipeline,
) -> Result<(), ResolveError> {
    let params: JoinParams = descriptor.params_as()?;
    let left = sources
        .get(&params.left_source_name)
        .ok_or_else(|| ResolveError::UnknownSource {
            name: params.left_source_name.clone(),
        })?;
    let right = sources
        .get(&params.right_source_name)
        .ok_or_else(|| ResolveError::UnknownSource {
            name: params.right_source_name.clone(),
        })?;

    // Seed the output with the deduplicated union of both schemas so column
    // queries and later descriptors can see it before the join runs.
    let mut columns = left.column_names();
    for column in right.column_names() {
        if !columns.contains(&column) {
            columns.push(column);
        }
    }

    let output = params.output_source_name.clone().unwrap_or_else(|| {
        format!(
            "{}_{}_joined",
            params.left_source_name, params.right_source_name
        )
    });
    if sources.contains_key(&output) {
        return Err(ResolveError::DuplicateSource { name: output });
    }
    sources.insert(
        output.clone(),
        Source::with_strategy(output.clone(), SourceStrategy::PreCalculated { columns }),
    );

    pipeline.push_step(Step::Join(JoinStep {
        step_name: descriptor.step_name.clone(),
        left_source: params.left_source_name,
        right_source: params.right_source_name,
        output_source: output,
        join_type: params.join_type,
        left_key: params.left_key,
        right_key: params.right_key,
        missing_policy: params.missing_policy,
    }));
    Ok(())
}

fn resolve_custom_command(
    descriptor: &StepDescriptor,
    sources: &SourceMap,
    pipeline: &mut Pipeline,
) -> Result<(), ResolveError> {
    let params: CustomCommandParams = descriptor.params_as()?;
    let fields = placeholder_fields(&params.command);
    debug!(
        "step '{}' references fields {:?}",
        descriptor.step_name, fields
    );

    if params.execution_mode == ExecutionMode::PerRow {
        let input = params
            .input_source_name
            .as_deref()
            .ok_or(ResolveError::MissingInputSource)?;
        if !sources.contains_key(input) {
            return Err(ResolveError::UnknownSource {
                name: input.to_string(),
            });
        }
    }

    pipeline.push_step(Step::CustomCommand(CustomCommandStep {
        step_name: descriptor.step_name.clone(),
        command: params.command,
        mode: params.execution_mode,
        input_source: params.input_source_name,
        simulated: false, // stamped by push_step
    }));
    Ok(())
}

fn single_byte(delimiter: &str) -> Result<u8, ResolveError> {
    match delimiter.as_bytes() {
        [byte] => Ok(*byte),
        _ => Err(ResolveError::BadDelimiter {
            delimiter: delimiter.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn resolve_yaml(yaml: &str) -> Resolved {
        let manifest = Manifest::from_yaml(yaml).unwrap();
        resolve(&manifest, &LoaderRegistry::with_builtins())
    }

    #[test]
    fn test_resolves_sources_and_steps_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.svs"), b"").unwrap();
        fs::write(dir.path().join("labels.csv"), "slide_id,label\na,cancer\n").unwrap();

        let yaml = format!(
            r#"
simulated: true
job_steps:
  - step_name: load_slides
    type: load
    params:
      output_source_name: slides
      mode: discovery
      path: {root}
      include: "*.svs"
      columns:
        filename_to_columnname: "^(?P<slide_id>[^.]+)"
  - step_name: load_labels
    type: load
    params:
      output_source_name: labels
      mode: csv_file
      path: {root}/labels.csv
  - step_name: join_labels
    type: join
    params:
      left_source_name: slides
      right_source_name: labels
      left_key: slide_id
      right_key: slide_id
  - step_name: convert
    type: custom_command
    params:
      command: "convert {{path}}"
      input_source_name: slides_labels_joined
      execution_mode: per_row
"#,
            root = dir.path().display()
        );
        let resolved = resolve_yaml(&yaml);

        assert_eq!(resolved.sources.len(), 3);
        assert_eq!(resolved.pipeline.len(), 2);
        assert_eq!(resolved.sources["slides"].table().unwrap().len(), 1);
        assert_eq!(resolved.sources["labels"].table().unwrap().len(), 1);

        // Join output pre-seeded with the deduplicated schema union.
        let joined = &resolved.sources["slides_labels_joined"];
        assert_eq!(joined.column_names(), vec!["slide_id", "path", "label"]);
        assert!(joined.table().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_source_is_skipped() {
        let resolved = resolve_yaml(
            r#"
job_steps:
  - step_name: first
    type: load
    params: {output_source_name: s, mode: csv_file, path: /no/such.csv}
  - step_name: second
    type: load
    params: {output_source_name: s, mode: csv_file, path: /no/such.csv}
"#,
        );
        assert_eq!(resolved.sources.len(), 1);
    }

    #[test]
    fn test_forward_reference_join_is_skipped() {
        let resolved = resolve_yaml(
            r#"
job_steps:
  - step_name: join_early
    type: join
    params:
      left_source_name: not_yet
      right_source_name: also_not_yet
      left_key: id
      right_key: id
"#,
        );
        assert!(resolved.sources.is_empty());
        assert!(resolved.pipeline.is_empty());
    }

    #[test]
    fn test_unknown_loader_is_skipped() {
        let resolved = resolve_yaml(
            r#"
job_steps:
  - step_name: load_slides
    type: load
    params:
      output_source_name: slides
      mode: discovery
      path: /no/such/dir
      file_type: wsi_patches
"#,
        );
        assert!(resolved.sources.is_empty());
    }

    #[test]
    fn test_unknown_type_and_disabled_are_skipped() {
        let resolved = resolve_yaml(
            r#"
job_steps:
  - step_name: mystery
    type: teleport
    params: {}
  - step_name: off
    type: custom_command
    enabled: false
    params: {command: "true"}
"#,
        );
        assert!(resolved.pipeline.is_empty());
    }

    #[test]
    fn test_per_row_without_input_is_skipped() {
        let resolved = resolve_yaml(
            r#"
job_steps:
  - step_name: convert
    type: custom_command
    params:
      command: "convert {path}"
      execution_mode: per_row
"#,
        );
        assert!(resolved.pipeline.is_empty());
    }

    #[test]
    fn test_bad_delimiter_is_skipped() {
        let resolved = resolve_yaml(
            r#"
job_steps:
  - step_name: load_labels
    type: load
    params:
      output_source_name: labels
      mode: csv_file
      path: /no/such.csv
      columns: {delimiter: "--"}
"#,
        );
        assert!(resolved.sources.is_empty());
    }

    #[test]
    fn test_csv_file_type_is_ignored_not_fatal() {
        // file_type only applies to discovery; a csv_file load still
        // registers its source.
        let resolved = resolve_yaml(
            r#"
job_steps:
  - step_name: load_labels
    type: load
    params:
      output_source_name: labels
      mode: csv_file
      path: /no/such.csv
      file_type: text
"#,
        );
        assert_eq!(resolved.sources.len(), 1);
    }

    #[test]
    fn test_invalid_missing_policy_is_skipped() {
        let resolved = resolve_yaml(
            r#"
job_steps:
  - step_name: load_a
    type: load
    params: {output_source_name: a, mode: csv_file, path: /no/such.csv}
  - step_name: join_a
    type: join
    params:
      left_source_name: a
      right_source_name: a
      left_key: id
      right_key: id
      missing_policy: ignore
"#,
        );
        assert!(resolved.pipeline.is_empty());
    }

    #[test]
    fn test_simulated_flag_reaches_pipeline() {
        let resolved = resolve_yaml("simulated: false\njob_steps: []");
        assert!(!resolved.pipeline.simulated());
        let resolved = resolve_yaml("job_steps: []");
        assert!(resolved.pipeline.simulated());
    }
}
