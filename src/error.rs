use thiserror::Error;

/// Engine-wide error taxonomy.
///
/// Statement-level errors unwind the operator tree and roll back the
/// in-progress transaction; fatal storage errors mark the database
/// read-refusing until repair.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt page {page_id}: {reason}")]
    CorruptPage { page_id: u64, reason: String },

    #[error("corrupt log: {0}")]
    CorruptLog(String),

    #[error("uniqueness violation on {index}: duplicate key {key}")]
    UniquenessViolation { index: String, key: String },

    #[error("NOT NULL violation: column {0}")]
    NotNullViolation(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transaction {0} aborted by wait-die deadlock avoidance")]
    ConstraintDeadlockAborted(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("timeout")]
    Timeout,

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("optimizer budget exhausted: {0}")]
    OptimizerBudgetExhausted(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Statement-level errors are safe to report to the session and retry;
    /// anything else refuses writes until a recovery pass.
    pub fn is_statement_level(&self) -> bool {
        !matches!(
            self,
            DbError::CorruptPage { .. } | DbError::CorruptLog(_) | DbError::Internal(_)
        )
    }
}

impl Clone for DbError {
    fn clone(&self) -> Self {
        match self {
            DbError::Io(e) => DbError::Storage(e.to_string()),
            DbError::CorruptPage { page_id, reason } => DbError::CorruptPage {
                page_id: *page_id,
                reason: reason.clone(),
            },
            DbError::CorruptLog(s) => DbError::CorruptLog(s.clone()),
            DbError::UniquenessViolation { index, key } => DbError::UniquenessViolation {
                index: index.clone(),
                key: key.clone(),
            },
            DbError::NotNullViolation(s) => DbError::NotNullViolation(s.clone()),
            DbError::TypeMismatch(s) => DbError::TypeMismatch(s.clone()),
            DbError::SchemaMismatch(s) => DbError::SchemaMismatch(s.clone()),
            DbError::NotFound(s) => DbError::NotFound(s.clone()),
            DbError::ConstraintDeadlockAborted(t) => DbError::ConstraintDeadlockAborted(*t),
            DbError::Cancelled => DbError::Cancelled,
            DbError::Timeout => DbError::Timeout,
            DbError::OutOfMemory(s) => DbError::OutOfMemory(s.clone()),
            DbError::OptimizerBudgetExhausted(s) => DbError::OptimizerBudgetExhausted(s.clone()),
            DbError::InvalidArgument(s) => DbError::InvalidArgument(s.clone()),
            DbError::Catalog(s) => DbError::Catalog(s.clone()),
            DbError::Storage(s) => DbError::Storage(s.clone()),
            DbError::Execution(s) => DbError::Execution(s.clone()),
            DbError::Transaction(s) => DbError::Transaction(s.clone()),
            DbError::Serialization(s) => DbError::Serialization(s.clone()),
            DbError::Internal(s) => DbError::Internal(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<bincode::error::EncodeError> for DbError {
    fn from(e: bincode::error::EncodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for DbError {
    fn from(e: bincode::error::DecodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}
