use crate::envelope::ErrorObject;
use parley_core::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection closed")]
    Closed,

    #[error("request {method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("remote error {}: {}", .0.code, .0.message)]
    Remote(ErrorObject),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("unexpected result for {method}: {detail}")]
    UnexpectedResult { method: String, detail: String },
}

impl RpcError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Closed => "closed",
            Self::Timeout { .. } => "timeout",
            Self::Remote(_) => "remote",
            Self::Protocol(_) => "protocol",
            Self::UnexpectedResult { .. } => "unexpected_result",
        }
    }
}
