use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Project,
    CompetencyQuestion,
    Microtheory,
    BatchJob,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Project => "project",
            EntityKind::CompetencyQuestion => "competency question",
            EntityKind::Microtheory => "microtheory",
            EntityKind::BatchJob => "batch job",
        })
    }
}

/// Errors surfaced to callers of the matrix builder and the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum CoverageError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("run record store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("config error: {0}")]
    Config(String),
}

impl CoverageError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        CoverageError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Caller-side faults (bad ids, policy conflicts, bad config) as opposed to infrastructure.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            CoverageError::NotFound { .. } | CoverageError::Conflict(_) | CoverageError::Config(_)
        )
    }
}

impl From<crate::storage::StoreError> for CoverageError {
    fn from(e: crate::storage::StoreError) -> Self {
        CoverageError::StoreUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoverageError>;

/// Why a single pair execution did not produce an executor verdict.
///
/// Never returned to API callers: the scheduler records it as a `fail` run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionFault {
    #[error("timeout")]
    Timeout,

    #[error("{0}")]
    Executor(String),

    #[error("executor panicked: {0}")]
    Panicked(String),
}

impl ExecutionFault {
    pub fn from_error(e: &anyhow::Error) -> Self {
        // `{:#}` keeps the context chain on one line.
        ExecutionFault::Executor(format!("{:#}", e))
    }

    pub fn reason(&self) -> String {
        self.to_string()
    }
}
