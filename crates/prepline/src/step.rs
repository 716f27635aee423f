//! Pipeline steps: joins and custom commands.
//!
//! Steps read their inputs from the shared source map by name and write their
//! result (if any) back into it. Execution is fallible and synchronous; a
//! per-row command step polls the cancellation token between rows and while
//! waiting on a child process.

use crate::cancel::CancelToken;
use crate::source::SourceMap;
use crate::table::{DEFAULT_SUFFIXES, JoinType, LazyRow, LazyTable, TableError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::process::{Child, Command, Stdio};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Interval between child-process liveness polls.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Grace period between a termination request and a forced kill.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// What to do with rows left incomplete by a non-inner join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingPolicy {
    /// Remove rows containing any null cell after the join.
    Drop,
    /// Keep null-filled rows as they are.
    Keep,
}

/// How a custom command step runs its command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Once,
    PerRow,
}

/// Errors from step execution.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("source '{name}' does not exist")]
    SourceMissing { name: String },

    #[error("source '{name}' has not been populated yet")]
    SourceUnpopulated { name: String },

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("row {row} has no field '{field}' for command substitution")]
    FieldSubstitution { field: String, row: usize },

    #[error("failed to parse command line '{command}': {source}")]
    CommandParse {
        command: String,
        source: shell_words::ParseError,
    },

    #[error("empty command line")]
    EmptyCommand,

    #[error("failed to spawn '{program}': {source}")]
    CommandSpawn {
        program: String,
        source: std::io::Error,
    },

    #[error("failed waiting on '{program}': {source}")]
    CommandWait {
        program: String,
        source: std::io::Error,
    },

    #[error("command '{program}' exited with {status}")]
    CommandFailed {
        program: String,
        status: std::process::ExitStatus,
    },

    #[error("per-row command step has no input source")]
    NoInputSource,

    #[error("cancelled")]
    Cancelled,
}

/// One executable unit of work in a pipeline.
#[derive(Debug, Clone)]
pub enum Step {
    Join(JoinStep),
    CustomCommand(CustomCommandStep),
}

impl Step {
    /// The step's manifest name, for logs and error reports.
    pub fn label(&self) -> &str {
        match self {
            Step::Join(step) => &step.step_name,
            Step::CustomCommand(step) => &step.step_name,
        }
    }

    /// One-line human description.
    pub fn describe(&self) -> String {
        match self {
            Step::Join(step) => format!(
                "join {}+{} -> {} ({} on {}={})",
                step.left_source,
                step.right_source,
                step.output_source,
                step.join_type,
                step.left_key,
                step.right_key
            ),
            Step::CustomCommand(step) => match step.mode {
                ExecutionMode::Once => format!("command (once): {}", step.command),
                ExecutionMode::PerRow => format!(
                    "command (per row of {}): {}",
                    step.input_source.as_deref().unwrap_or("?"),
                    step.command
                ),
            },
        }
    }

    /// Flip simulated mode. Only command steps care.
    pub fn set_simulated(&mut self, simulated: bool) {
        if let Step::CustomCommand(step) = self {
            step.simulated = simulated;
        }
    }

    pub fn execute(&self, sources: &mut SourceMap, cancel: &CancelToken) -> Result<(), StepError> {
        match self {
            Step::Join(step) => step.execute(sources),
            Step::CustomCommand(step) => step.execute(sources, cancel),
        }
    }
}

fn populated<'a>(sources: &'a SourceMap, name: &str) -> Result<&'a LazyTable, StepError> {
    let source = sources.get(name).ok_or_else(|| StepError::SourceMissing {
        name: name.to_string(),
    })?;
    source.table().ok_or_else(|| StepError::SourceUnpopulated {
        name: name.to_string(),
    })
}

/// Join two sources and write the result into a third.
#[derive(Debug, Clone)]
pub struct JoinStep {
    pub step_name: String,
    pub left_source: String,
    pub right_source: String,
    pub output_source: String,
    pub join_type: JoinType,
    pub left_key: String,
    pub right_key: String,
    pub missing_policy: MissingPolicy,
}

impl JoinStep {
    fn execute(&self, sources: &mut SourceMap) -> Result<(), StepError> {
        let left = populated(sources, &self.left_source)?;
        let right = populated(sources, &self.right_source)?;

        let mut merged = left.merge(
            right,
            self.join_type,
            &self.left_key,
            &self.right_key,
            DEFAULT_SUFFIXES,
        )?;
        if self.missing_policy == MissingPolicy::Drop {
            let (kept, dropped) = merged.drop_null_rows();
            if dropped > 0 {
                info!(
                    "step '{}': dropped {} row(s) with missing values",
                    self.step_name, dropped
                );
            }
            merged = kept;
        }
        info!(
            "step '{}': joined '{}' and '{}' into '{}' ({} row(s))",
            self.step_name,
            self.left_source,
            self.right_source,
            self.output_source,
            merged.len()
        );

        let output =
            sources
                .get_mut(&self.output_source)
                .ok_or_else(|| StepError::SourceMissing {
                    name: self.output_source.clone(),
                })?;
        output.set_table(merged);
        Ok(())
    }
}

/// Run an external command, either once or once per row of an input source.
#[derive(Debug, Clone)]
pub struct CustomCommandStep {
    pub step_name: String,
    pub command: String,
    pub mode: ExecutionMode,
    /// Source iterated in per-row mode. Unused for once mode.
    pub input_source: Option<String>,
    /// When set, commands are logged but never spawned.
    pub simulated: bool,
}

/// Field names referenced as `{name}` placeholders, unique, in first-use
/// order.
pub fn placeholder_fields(command: &str) -> Vec<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"\{(\w+)\}").unwrap());
    let mut fields: Vec<String> = Vec::new();
    for caps in pattern.captures_iter(command) {
        let field = &caps[1];
        if !fields.iter().any(|f| f == field) {
            fields.push(field.to_string());
        }
    }
    fields
}

impl CustomCommandStep {
    fn execute(&self, sources: &mut SourceMap, cancel: &CancelToken) -> Result<(), StepError> {
        match self.mode {
            ExecutionMode::Once => self.run_line(&self.command, cancel),
            ExecutionMode::PerRow => {
                let input = self.input_source.as_deref().ok_or(StepError::NoInputSource)?;
                let table = populated(sources, input)?;
                let fields = placeholder_fields(&self.command);
                for row in table.rows() {
                    if cancel.is_cancelled() {
                        return Err(StepError::Cancelled);
                    }
                    let line = self.substitute(&row, &fields)?;
                    self.run_line(&line, cancel)?;
                }
                Ok(())
            }
        }
    }

    fn substitute(&self, row: &LazyRow<'_>, fields: &[String]) -> Result<String, StepError> {
        let mut line = self.command.clone();
        for field in fields {
            let value = row.get(field).ok_or_else(|| StepError::FieldSubstitution {
                field: field.clone(),
                row: row.index(),
            })?;
            line = line.replace(&format!("{{{field}}}"), &value.to_string());
        }
        Ok(line)
    }

    fn run_line(&self, line: &str, cancel: &CancelToken) -> Result<(), StepError> {
        if self.simulated {
            info!("step '{}' (simulated): {}", self.step_name, line);
            return Ok(());
        }
        debug!("step '{}': running {}", self.step_name, line);

        let argv = shell_words::split(line).map_err(|source| StepError::CommandParse {
            command: line.to_string(),
            source,
        })?;
        let Some((program, args)) = argv.split_first() else {
            return Err(StepError::EmptyCommand);
        };

        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| StepError::CommandSpawn {
                program: program.clone(),
                source,
            })?;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if status.success() {
                        return Ok(());
                    }
                    return Err(StepError::CommandFailed {
                        program: program.clone(),
                        status,
                    });
                }
                Ok(None) => {
                    if cancel.is_cancelled() {
                        terminate(&mut child);
                        return Err(StepError::Cancelled);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(source) => {
                    return Err(StepError::CommandWait {
                        program: program.clone(),
                        source,
                    });
                }
            }
        }
    }
}

/// Stop a child process: ask politely, then kill after a grace period.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        // SAFETY: the pid belongs to a child we spawned and have not reaped.
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
        let deadline = Instant::now() + TERM_GRACE;
        while Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Loader;
    use crate::source::Source;
    use crate::value::Value;
    use std::sync::Arc;

    fn str_rows(rows: &[&[&str]]) -> Vec<Vec<Value>> {
        rows.iter()
            .map(|r| r.iter().map(|s| Value::from(*s)).collect())
            .collect()
    }

    fn source_with(name: &str, table: LazyTable) -> Source {
        let mut source = Source::empty(name);
        source.set_table(table);
        source
    }

    fn join_step(output: &str) -> JoinStep {
        JoinStep {
            step_name: "join_labels".into(),
            left_source: "slides".into(),
            right_source: "labels".into(),
            output_source: output.into(),
            join_type: JoinType::Inner,
            left_key: "id".into(),
            right_key: "id".into(),
            missing_policy: MissingPolicy::Keep,
        }
    }

    fn two_source_map() -> SourceMap {
        let mut sources = SourceMap::new();
        sources.insert(
            "slides".into(),
            source_with(
                "slides",
                LazyTable::from_rows(
                    vec!["id".into(), "path".into()],
                    str_rows(&[&["a", "/a.svs"], &["b", "/b.svs"]]),
                ),
            ),
        );
        sources.insert(
            "labels".into(),
            source_with(
                "labels",
                LazyTable::from_rows(
                    vec!["id".into(), "label".into()],
                    str_rows(&[&["a", "cancer"]]),
                ),
            ),
        );
        sources.insert("joined".into(), Source::empty("joined"));
        sources
    }

    #[test]
    fn test_join_step_populates_output() {
        let mut sources = two_source_map();
        let step = Step::Join(join_step("joined"));

        step.execute(&mut sources, &CancelToken::new()).unwrap();

        let table = sources["joined"].table().unwrap();
        assert_eq!(table.columns(), &["id", "path", "label"]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("label", 0), Some(Value::from("cancer")));
    }

    #[test]
    fn test_join_step_drop_policy_removes_null_rows() {
        let mut sources = two_source_map();
        let step = Step::Join(JoinStep {
            join_type: JoinType::Left,
            missing_policy: MissingPolicy::Drop,
            ..join_step("joined")
        });

        step.execute(&mut sources, &CancelToken::new()).unwrap();
        // "b" has no label and is dropped.
        assert_eq!(sources["joined"].table().unwrap().len(), 1);
    }

    #[test]
    fn test_join_step_missing_source_errors() {
        let mut sources = two_source_map();
        let step = Step::Join(JoinStep {
            left_source: "nope".into(),
            ..join_step("joined")
        });

        let err = step.execute(&mut sources, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, StepError::SourceMissing { name } if name == "nope"));
    }

    #[test]
    fn test_join_step_unpopulated_source_errors() {
        let mut sources = two_source_map();
        sources.insert("pending".into(), Source::empty("pending"));
        let step = Step::Join(JoinStep {
            right_source: "pending".into(),
            ..join_step("joined")
        });

        let err = step.execute(&mut sources, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, StepError::SourceUnpopulated { name } if name == "pending"));
    }

    #[test]
    fn test_placeholder_fields_unique_in_order() {
        let fields = placeholder_fields("convert {path} --out {out_dir}/{id} --ref {path}");
        assert_eq!(fields, vec!["path", "out_dir", "id"]);
        assert!(placeholder_fields("no placeholders here").is_empty());
    }

    #[test]
    fn test_simulated_once_never_spawns() {
        let step = Step::CustomCommand(CustomCommandStep {
            step_name: "notify".into(),
            command: "/no/such/binary --flag".into(),
            mode: ExecutionMode::Once,
            input_source: None,
            simulated: true,
        });
        let mut sources = SourceMap::new();
        step.execute(&mut sources, &CancelToken::new()).unwrap();
    }

    #[test]
    fn test_per_row_substitutes_every_row() {
        // Simulated mode still iterates and substitutes; a missing field in
        // any row aborts the whole step.
        let mut sources = two_source_map();
        let step = Step::CustomCommand(CustomCommandStep {
            step_name: "convert".into(),
            command: "convert {path}".into(),
            mode: ExecutionMode::PerRow,
            input_source: Some("slides".into()),
            simulated: true,
        });
        step.execute(&mut sources, &CancelToken::new()).unwrap();

        let bad = Step::CustomCommand(CustomCommandStep {
            step_name: "convert".into(),
            command: "convert {nonexistent}".into(),
            mode: ExecutionMode::PerRow,
            input_source: Some("slides".into()),
            simulated: true,
        });
        let err = bad.execute(&mut sources, &CancelToken::new()).unwrap_err();
        assert!(
            matches!(err, StepError::FieldSubstitution { field, row: 0 } if field == "nonexistent")
        );
    }

    #[test]
    fn test_per_row_checks_cancellation_between_rows() {
        // A loader that cancels the token while realizing the first row's
        // field makes the step stop before the second row.
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let loader: Arc<dyn Loader> = Arc::new(move |raw: &Value| {
            trigger.cancel();
            raw.clone()
        });

        let mut table = LazyTable::from_rows(
            vec!["path".into()],
            str_rows(&[&["/a.svs"], &["/b.svs"]]),
        );
        table.set_loader("path", loader);
        let mut sources = SourceMap::new();
        sources.insert("slides".into(), source_with("slides", table));

        let step = Step::CustomCommand(CustomCommandStep {
            step_name: "convert".into(),
            command: "convert {path}".into(),
            mode: ExecutionMode::PerRow,
            input_source: Some("slides".into()),
            simulated: true,
        });
        let err = step.execute(&mut sources, &cancel).unwrap_err();
        assert!(matches!(err, StepError::Cancelled));
    }

    #[test]
    fn test_set_simulated_only_touches_command_steps() {
        let mut join = Step::Join(join_step("joined"));
        join.set_simulated(true); // no-op

        let mut command = Step::CustomCommand(CustomCommandStep {
            step_name: "notify".into(),
            command: "true".into(),
            mode: ExecutionMode::Once,
            input_source: None,
            simulated: false,
        });
        command.set_simulated(true);
        match command {
            Step::CustomCommand(step) => assert!(step.simulated),
            Step::Join(_) => unreachable!(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_once_command_runs_and_reports_failure() {
        let mut sources = SourceMap::new();
        let ok = Step::CustomCommand(CustomCommandStep {
            step_name: "ok".into(),
            command: "true".into(),
            mode: ExecutionMode::Once,
            input_source: None,
            simulated: false,
        });
        ok.execute(&mut sources, &CancelToken::new()).unwrap();

        let failing = Step::CustomCommand(CustomCommandStep {
            step_name: "fail".into(),
            command: "false".into(),
            mode: ExecutionMode::Once,
            input_source: None,
            simulated: false,
        });
        let err = failing.execute(&mut sources, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, StepError::CommandFailed { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_cancel_while_child_runs_terminates_it() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(400));
            trigger.cancel();
        });

        let step = Step::CustomCommand(CustomCommandStep {
            step_name: "long".into(),
            command: "sleep 30".into(),
            mode: ExecutionMode::Once,
            input_source: None,
            simulated: false,
        });
        let started = Instant::now();
        let mut sources = SourceMap::new();
        let err = step.execute(&mut sources, &cancel).unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, StepError::Cancelled));
        // The child exits on SIGTERM, well within the grace period.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_program_is_a_spawn_error() {
        let mut sources = SourceMap::new();
        let step = Step::CustomCommand(CustomCommandStep {
            step_name: "gone".into(),
            command: "/no/such/binary --flag".into(),
            mode: ExecutionMode::Once,
            input_source: None,
            simulated: false,
        });
        let err = step.execute(&mut sources, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, StepError::CommandSpawn { .. }));
    }

    #[test]
    fn test_mode_and_policy_serde_spelling() {
        assert_eq!(
            serde_yaml::from_str::<ExecutionMode>("per_row").unwrap(),
            ExecutionMode::PerRow
        );
        assert_eq!(
            serde_yaml::from_str::<MissingPolicy>("drop").unwrap(),
            MissingPolicy::Drop
        );
        assert!(serde_yaml::from_str::<MissingPolicy>("ignore").is_err());
    }
}
