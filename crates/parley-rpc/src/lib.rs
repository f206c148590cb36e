pub mod acp;
pub mod adapter;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod notification;

pub use adapter::RemoteAgentAdapter;
pub use connection::{AcpConnection, ConnectionConfig, InboundNotification};
pub use envelope::{classify, decode, Envelope, ErrorObject, RequestId};
pub use error::RpcError;
pub use notification::classify_update;
