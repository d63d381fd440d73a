use thiserror::Error;

/// An inbound frame that could not be turned into a message. The frame is
/// discarded and the current view-model stays as it was.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid {kind} payload: {source}")]
    InvalidField {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
