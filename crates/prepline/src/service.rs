//! The pipeline service: one manifest, one run.
//!
//! Ties manifest parsing, resolution and execution together. The service owns
//! the source map and the step queue; a run drains the queue front to back,
//! fails fast on the first step error, and checks the cancellation token
//! before each step. Sources written by steps that completed before a failure
//! stay inspectable afterwards.

use crate::cancel::CancelToken;
use crate::loader::LoaderRegistry;
use crate::manifest::{Manifest, ManifestError, ManifestFormat};
use crate::pipeline::Pipeline;
use crate::resolver::{Resolved, resolve};
use crate::source::{Source, SourceMap};
use crate::step::StepError;
use std::path::Path;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("run cancelled")]
    Cancelled,

    #[error("step '{step}' failed: {source}")]
    StepFailed { step: String, source: StepError },
}

/// An in-process pipeline run.
#[derive(Debug)]
pub struct PrepService {
    sources: SourceMap,
    pipeline: Pipeline,
    cancel: CancelToken,
}

impl PrepService {
    /// Resolve a parsed manifest into a ready-to-run service.
    pub fn from_manifest(manifest: &Manifest, registry: &LoaderRegistry) -> Self {
        let Resolved { sources, pipeline } = resolve(manifest, registry);
        Self {
            sources,
            pipeline,
            cancel: CancelToken::new(),
        }
    }

    pub fn from_manifest_str(
        text: &str,
        format: ManifestFormat,
        registry: &LoaderRegistry,
    ) -> Result<Self, ManifestError> {
        let manifest = Manifest::from_str_format(text, format)?;
        Ok(Self::from_manifest(&manifest, registry))
    }

    pub fn from_path(
        path: impl AsRef<Path>,
        registry: &LoaderRegistry,
    ) -> Result<Self, ManifestError> {
        let manifest = Manifest::from_path(path)?;
        Ok(Self::from_manifest(&manifest, registry))
    }

    /// Use an externally held token so another thread can cancel the run.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// A handle to this run's cancellation flag.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_simulated(&self) -> bool {
        self.pipeline.simulated()
    }

    /// Flip simulated mode for all steps not yet executed.
    pub fn set_simulated(&mut self, simulated: bool) {
        self.pipeline.set_simulated(simulated);
    }

    /// Steps still waiting to run.
    pub fn steps_remaining(&self) -> usize {
        self.pipeline.len()
    }

    pub fn source(&self, name: &str) -> Option<&Source> {
        self.sources.get(name)
    }

    pub fn sources(&self) -> &SourceMap {
        &self.sources
    }

    /// Current schema of a source; works before, during and after a run.
    pub fn get_source_columns(&self, name: &str) -> Option<Vec<String>> {
        self.sources.get(name).map(Source::column_names)
    }

    /// Drain the step queue. Fail-fast: the first step error ends the run
    /// with the remaining steps left queued and earlier outputs intact.
    pub fn run(&mut self) -> Result<(), RunError> {
        while self.pipeline.has_steps_left() {
            if self.cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }
            let label = self
                .pipeline
                .front()
                .map(|step| step.label().to_string())
                .unwrap_or_default();
            self.pipeline
                .run_next_step(&mut self.sources, &self.cancel)
                .map_err(|source| match source {
                    StepError::Cancelled => RunError::Cancelled,
                    source => RunError::StepFailed {
                        step: label,
                        source,
                    },
                })?;
        }
        info!("pipeline finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::fs;

    fn scenario_manifest(root: &Path, simulated: bool) -> String {
        format!(
            r#"
manifest_id: scenario
simulated: {simulated}
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
      right_key: id
      join_type: inner
  - step_name: announce
    type: custom_command
    params:
      command: "echo {{slide_id}}"
      input_source_name: slides_labels_joined
      execution_mode: per_row
"#,
            root = root.display()
        )
    }

    fn scenario_service(simulated: bool) -> (tempfile::TempDir, PrepService) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.svs"), b"").unwrap();
        fs::write(dir.path().join("b.svs"), b"").unwrap();
        fs::write(dir.path().join("labels.csv"), "id,label\na,cancer\n").unwrap();

        let manifest = scenario_manifest(dir.path(), simulated);
        let service = PrepService::from_manifest_str(
            &manifest,
            ManifestFormat::Yaml,
            &LoaderRegistry::with_builtins(),
        )
        .unwrap();
        (dir, service)
    }

    #[test]
    fn test_end_to_end_inner_join_run() {
        let (_dir, mut service) = scenario_service(true);
        assert!(service.is_simulated());
        assert_eq!(service.steps_remaining(), 2);

        service.run().unwrap();
        assert_eq!(service.steps_remaining(), 0);

        // Only the row present on both sides survives the inner join.
        let joined = service.source("slides_labels_joined").unwrap();
        let table = joined.table().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("slide_id", 0), Some(Value::from("a")));
        assert_eq!(table.get("label", 0), Some(Value::from("cancer")));
    }

    #[test]
    fn test_columns_queryable_before_run() {
        let (_dir, service) = scenario_service(true);
        assert_eq!(
            service.get_source_columns("slides"),
            Some(vec!["slide_id".to_string(), "path".to_string()])
        );
        assert_eq!(
            service.get_source_columns("slides_labels_joined"),
            Some(vec![
                "slide_id".to_string(),
                "path".to_string(),
                "id".to_string(),
                "label".to_string()
            ])
        );
        assert_eq!(service.get_source_columns("nonexistent"), None);
    }

    #[test]
    fn test_cancel_before_run() {
        let (_dir, mut service) = scenario_service(true);
        service.cancel_token().cancel();

        assert!(matches!(service.run(), Err(RunError::Cancelled)));
        // Nothing ran.
        assert_eq!(service.steps_remaining(), 2);
    }

    #[test]
    fn test_fail_fast_names_the_step_and_keeps_queue() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("labels.csv"), "id,label\na,x\n").unwrap();
        let manifest = format!(
            r#"
simulated: false
job_steps:
  - step_name: load_labels
    type: load
    params:
      output_source_name: labels
      mode: csv_file
      path: {root}/labels.csv
  - step_name: broken
    type: custom_command
    params:
      command: "/no/such/binary"
  - step_name: never_runs
    type: custom_command
    params:
      command: "echo done"
"#,
            root = dir.path().display()
        );
        let mut service = PrepService::from_manifest_str(
            &manifest,
            ManifestFormat::Yaml,
            &LoaderRegistry::new(),
        )
        .unwrap();

        let err = service.run().unwrap_err();
        match err {
            RunError::StepFailed { step, source } => {
                assert_eq!(step, "broken");
                assert!(matches!(source, StepError::CommandSpawn { .. }));
            }
            RunError::Cancelled => unreachable!(),
        }
        assert_eq!(service.steps_remaining(), 1);
        // The source loaded before the failure stays inspectable.
        assert_eq!(service.source("labels").unwrap().table().unwrap().len(), 1);
    }

    #[test]
    fn test_set_simulated_rescues_spawning_steps() {
        let manifest = r#"
simulated: false
job_steps:
  - step_name: broken
    type: custom_command
    params:
      command: "/no/such/binary"
"#;
        let mut service = PrepService::from_manifest_str(
            manifest,
            ManifestFormat::Yaml,
            &LoaderRegistry::new(),
        )
        .unwrap();
        assert!(!service.is_simulated());

        service.set_simulated(true);
        service.run().unwrap();
    }
}
