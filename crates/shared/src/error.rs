use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("{kind} frame is missing `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("invalid {kind} frame: {source}")]
    Invalid {
        kind: &'static str,
        source: serde_json::Error,
    },
    #[error("unrecognized frame shape (keys: {keys})")]
    UnrecognizedShape { keys: String },
}
