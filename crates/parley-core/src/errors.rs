/// A wire message that is neither a request, a response nor a notification.
/// Fatal to the single exchange it belongs to, never to the connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("protocol error: {0}")]
pub struct ProtocolError(pub String);

/// Errors raised while discovering or invoking tools.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid provider id {0:?}: only letters, digits, '_' and '-' are allowed")]
    InvalidProviderId(String),
}

impl ToolError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "tool_not_found",
            Self::ResourceNotFound(_) => "resource_not_found",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::Execution(_) => "execution",
            Self::Transport(_) => "transport",
            Self::InvalidProviderId(_) => "invalid_provider_id",
        }
    }
}

/// Engine-level error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Double stream, stream without a session. Rejected before any mutation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool error: {0}")]
    Tool(ToolError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),
}

impl EngineError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::InvalidState(_) => "invalid_state",
            Self::ToolNotFound(_) => "tool_not_found",
            Self::Tool(_) => "tool",
            Self::Transport(_) => "transport",
            Self::Store(_) => "store",
            Self::SessionNotFound(_) => "session_not_found",
        }
    }
}

impl From<ToolError> for EngineError {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::NotFound(name) => Self::ToolNotFound(name),
            other => Self::Tool(other),
        }
    }
}
