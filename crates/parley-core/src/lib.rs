pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod ports;
pub mod session;
pub mod tools;
pub mod transport;

pub use errors::{EngineError, ProtocolError, ToolError};
pub use events::{StopReason, StreamEvent};
pub use ids::{MessageId, ServerId, SessionId};
pub use messages::{Artifact, ArtifactKind, Attachment, Message, Role, Segment};
pub use ports::{CredentialPort, PersistencePort};
pub use session::{
    Backend, ProviderConfig, ProviderType, ReasoningEffort, ServerConfig, ServerKind, Session,
};
pub use tools::{
    NoTools, RemoteResource, RemoteTool, ResourceDescriptor, ToolDescriptor, ToolInvoker,
    ToolProvider,
};
pub use transport::{BackendKind, EventSource, OpenRequest, Prompt, TransportAdapter};
