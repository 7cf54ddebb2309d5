use thiserror::Error;

use crate::core::status::Status;

/// 索引核心的错误分类；每个变体对应唯一的 [`Status`]
#[derive(Debug, Error)]
pub enum ViewError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("compile error ({language}): {message}")]
    Compile { language: String, message: String },

    /// 单文档 map 失败：只在 updater 内部记录，不会让整次更新失败
    #[error("map function failed on document {doc_id:?}: {message}")]
    MapEvaluation { doc_id: String, message: String },

    #[error("callback failed: {0}")]
    Callback(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("index update interrupted")]
    Interrupted,

    #[error("database {0:?} is closed")]
    DatabaseClosed(String),
}

impl ViewError {
    pub fn status(&self) -> Status {
        match self {
            ViewError::NotFound(_) => Status::NotFound,
            ViewError::InvalidName(_)
            | ViewError::InvalidConfiguration(_)
            | ViewError::BadRequest(_)
            | ViewError::Compile { .. } => Status::BadRequest,
            ViewError::MapEvaluation { .. } | ViewError::Callback(_) => Status::CallbackError,
            ViewError::Storage(_) | ViewError::Io(_) => Status::DbError,
            ViewError::Conflict(_) => Status::Conflict,
            ViewError::Forbidden(_) => Status::Forbidden,
            ViewError::Interrupted => Status::Unavailable,
            ViewError::DatabaseClosed(_) => Status::NotFound,
        }
    }

    pub fn compile(language: impl Into<String>, message: impl Into<String>) -> Self {
        ViewError::Compile {
            language: language.into(),
            message: message.into(),
        }
    }

    pub fn map_failed(doc_id: impl Into<String>, message: impl Into<String>) -> Self {
        ViewError::MapEvaluation {
            doc_id: doc_id.into(),
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        ViewError::Storage(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ViewError::BadRequest(message.into())
    }
}

impl From<bincode::Error> for ViewError {
    fn from(err: bincode::Error) -> Self {
        ViewError::storage(format!("bincode: {}", err))
    }
}

impl From<serde_json::Error> for ViewError {
    fn from(err: serde_json::Error) -> Self {
        ViewError::storage(format!("json: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, ViewError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_status_classes() {
        assert_eq!(ViewError::NotFound("v".into()).status(), Status::NotFound);
        assert_eq!(ViewError::InvalidName("".into()).status(), Status::BadRequest);
        assert_eq!(ViewError::compile("simple", "eof").status(), Status::BadRequest);
        assert_eq!(ViewError::storage("disk full").status(), Status::DbError);
        assert_eq!(ViewError::Conflict("map".into()).status(), Status::Conflict);
        assert_eq!(ViewError::Interrupted.status(), Status::Unavailable);
        assert!(ViewError::storage("x").status().is_server_error());
    }

    #[test]
    fn io_errors_convert_to_db_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "ro fs");
        let err: ViewError = io.into();
        assert_eq!(err.status(), Status::DbError);
        assert!(err.to_string().contains("ro fs"));
    }

    #[test]
    fn display_carries_context() {
        let err = ViewError::map_failed("doc-1", "boom");
        let msg = err.to_string();
        assert!(msg.contains("doc-1"));
        assert!(msg.contains("boom"));
    }
}
