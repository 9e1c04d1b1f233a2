use std::path::PathBuf;
use thiserror::Error;

/// Invalid or ambiguous run definition. Raised before any task runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("strategy definition must be a mapping, found {0}")]
    NotAMapping(&'static str),
    #[error("no strategy defined")]
    NoStrategy,
    #[error("ambiguous strategy definition: pick one of [{}]", .0.join(", "))]
    AmbiguousStrategy(Vec<String>),
    #[error("strategy `{0}` is not defined")]
    MissingStrategy(String),
    #[error("unknown strategy `{0}`")]
    UnknownStrategy(String),
    #[error("invalid length: `{variant}` requires {} {expected} axis/axes, found {found}", if *.exact { "exactly" } else { "at least" })]
    AxisCount {
        variant: &'static str,
        expected: usize,
        exact: bool,
        found: usize,
    },
    #[error("axis `{0}` must list at least one value")]
    EmptyAxis(String),
    #[error("invalid axis path `{0}`")]
    InvalidAxisPath(String),
    #[error("axis `{0}` does not exist in defaults")]
    UnknownAxis(String),
    #[error("duplicate task id `{0}`")]
    DuplicateTask(String),
    #[error("unknown task `{0}`")]
    UnknownTask(String),
    #[error("legacy variation is missing `{0}`")]
    LegacyField(&'static str),
    #[error("missing or invalid section: {0}")]
    MissingSection(&'static str),
    #[error("invalid output settings: {0}")]
    Output(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A simulation unit that does not honor the calling contract.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("unknown simulation unit `{0}`")]
    UnknownUnit(String),
    #[error("simulation unit `{unit}` must return a mapping from `defaults`, found {found}")]
    DefaultsNotMapping { unit: String, found: &'static str },
    #[error("simulation unit `{0}` advertises restart but declares no result members")]
    RestartShape(String),
}

/// Failure inside a single task's `run` or `restart`.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{message}")]
    Simulation { kind: String, message: String },
    #[error("invalid parameter `{path}`: {message}")]
    InvalidParameter { path: String, message: String },
    #[error("simulation unit does not define restart")]
    RestartUnsupported,
    #[error("simulation panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn simulation(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Simulation {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Category name recorded in error entries.
    pub fn kind(&self) -> &str {
        match self {
            TaskError::Simulation { kind, .. } => kind,
            TaskError::InvalidParameter { .. } => "InvalidParameter",
            TaskError::RestartUnsupported => "RestartUnsupported",
            TaskError::Panicked(_) => "Panic",
        }
    }
}

/// Backend failure of an output store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot overwrite existing entry `{0}` (use force to override)")]
    EntryExists(String),
    #[error("cannot overwrite existing output `{}` (use force to override)", .0.display())]
    TargetExists(PathBuf),
    #[error("{backend} store does not support {operation}")]
    Unsupported {
        backend: &'static str,
        operation: String,
    },
    #[error("entry `{entry}` cannot be loaded: {reason}")]
    Incompatible { entry: String, reason: String },
    #[error("entry `{entry}` has two values for column `{column}`")]
    ColumnClash { entry: String, column: String },
    #[error("metadata has already been written")]
    AlreadyFinalized,
    #[error("unknown output format `{0}`")]
    UnknownFormat(String),
    #[error("corrupt output `{}`: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
}

/// Setup-level failure of a sweep; task failures never surface here.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
