use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Schema index error: {0}")]
    Schema(String),

    #[error("Term index error: {0}")]
    TermIndex(String),

    #[error("Reasoner error: {0}")]
    Reasoner(String),

    #[error("Intent error: {0}")]
    Intent(String),

    #[error("Relationship error: {0}")]
    Relationship(String),

    #[error("Assembly error: {0}")]
    Assembly(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Execution timed out after {0}ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
