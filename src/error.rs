use std::path::PathBuf;

use crate::core::{SnapshotId, SnapshotState, StoreRef};

/// 内容存储侧错误
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("unknown store: {0}")]
    UnknownStore(StoreRef),

    #[error("store {store} has no snapshot {snapshot}")]
    UnknownSnapshot { store: StoreRef, snapshot: SnapshotId },

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

/// 索引状态机 / 后端错误
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// 快照必须严格按序应用：dst == src + 1 且 src == 当前 last-known
    #[error(
        "out of order snapshot for store {store}: last known {last_known}, requested {src} -> {dst}"
    )]
    OutOfOrderSnapshot {
        store: StoreRef,
        last_known: SnapshotId,
        src: SnapshotId,
        dst: SnapshotId,
    },

    #[error("failed to create index for store {store}: {reason}")]
    IndexCreation { store: StoreRef, reason: String },

    #[error("index for store {0} has not been created")]
    NotCreated(StoreRef),

    #[error("illegal transition for store {store} snapshot {snapshot}: {from:?} -> {to:?}")]
    IllegalTransition {
        store: StoreRef,
        snapshot: SnapshotId,
        from: Option<SnapshotState>,
        to: SnapshotState,
    },

    #[error("content store: {0}")]
    Content(#[from] ContentError),

    #[error("index backend: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 结果集访问错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResultSetError {
    #[error("row index {index} out of range (length {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("unsupported projection: {0}")]
    UnsupportedProjection(&'static str),

    #[error("result set has been closed")]
    Closed,

    #[error("result set is read-only: {0} is not supported")]
    ReadOnly(&'static str),
}

/// 查询路径错误
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("unknown query language: {0}")]
    UnknownLanguage(String),

    #[error("failed to parse query {expression:?}{}: {message}", fmt_position(.position))]
    Parse {
        expression: String,
        position: Option<usize>,
        message: String,
    },

    #[error("query execution failed ({language}): {message}")]
    Execution { language: String, message: String },

    #[error("query execution failed ({language}): no index for store {store}")]
    StoreNotIndexed { language: String, store: StoreRef },

    #[error(transparent)]
    ResultSet(#[from] ResultSetError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

fn fmt_position(position: &Option<usize>) -> String {
    match position {
        Some(p) => format!(" at {}", p),
        None => String::new(),
    }
}

impl QueryError {
    pub fn parse(expression: &str, position: Option<usize>, message: impl Into<String>) -> Self {
        QueryError::Parse {
            expression: expression.to_string(),
            position,
            message: message.into(),
        }
    }

    pub fn execution(language: &str, message: impl Into<String>) -> Self {
        QueryError::Execution {
            language: language.to_string(),
            message: message.into(),
        }
    }
}

/// 备份错误
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("invalid backup target {path:?}: {reason}")]
    Target { path: PathBuf, reason: String },

    #[error("backup IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Index(#[from] IndexError),
}

impl BackupError {
    pub fn target(path: &std::path::Path, reason: impl Into<String>) -> Self {
        BackupError::Target {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_reports_expression_and_position() {
        let e = QueryError::parse("a AND", Some(5), "unexpected end of query");
        let msg = e.to_string();
        assert!(msg.contains("\"a AND\""));
        assert!(msg.contains("at 5"));

        let e2 = QueryError::parse("(", None, "unbalanced");
        assert!(!e2.to_string().contains(" at "));
    }
}
