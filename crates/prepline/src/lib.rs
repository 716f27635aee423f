//! Prepline: manifest-driven dataset preparation pipelines
//!
//! Prepline turns a declarative manifest into named sources (lazily realized
//! tables acquired from CSV files or filesystem discovery), a queue of join
//! and custom-command steps, and a fail-fast runner with cooperative
//! cancellation.

mod cancel;
mod loader;
mod manifest;
mod pipeline;
mod resolver;
mod service;
mod source;
mod step;
mod table;
mod value;

pub use cancel::CancelToken;
pub use loader::{Loader, LoaderRegistry};
pub use manifest::{
    ColumnParams, CustomCommandParams, JoinParams, LoadMode, LoadParams, Manifest, ManifestError,
    ManifestFormat, StepDescriptor,
};
pub use pipeline::Pipeline;
pub use resolver::{Resolved, ResolveError, resolve};
pub use service::{PrepService, RunError};
pub use source::{DEFAULT_RESULT_COLUMN, Source, SourceMap, SourceStrategy};
pub use step::{
    CustomCommandStep, ExecutionMode, JoinStep, MissingPolicy, Step, StepError, placeholder_fields,
};
pub use table::{DEFAULT_SUFFIXES, JoinType, LazyRow, LazyTable, TableError};
pub use value::{Value, ValueKind};
