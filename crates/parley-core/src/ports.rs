//! Storage seams the engine depends on.
//!
//! Both traits are synchronous: implementations hold their own locks and never
//! block on network IO.

use crate::errors::EngineError;
use crate::ids::{ServerId, SessionId};
use crate::messages::Message;
use crate::session::{ServerConfig, Session};

/// Persistence for servers, sessions and transcripts.
pub trait PersistencePort: Send + Sync {
    fn load_servers(&self) -> Result<Vec<ServerConfig>, EngineError>;
    /// Insert or replace by id.
    fn save_server(&self, server: &ServerConfig) -> Result<(), EngineError>;
    /// Removes the server together with all its sessions and messages.
    fn delete_server(&self, server_id: &ServerId) -> Result<(), EngineError>;

    /// Most recently updated first.
    fn load_sessions(&self, server_id: &ServerId) -> Result<Vec<Session>, EngineError>;
    fn save_session(&self, session: &Session) -> Result<(), EngineError>;
    fn delete_session(&self, server_id: &ServerId, session_id: &SessionId)
        -> Result<(), EngineError>;

    fn load_messages(
        &self,
        server_id: &ServerId,
        session_id: &SessionId,
    ) -> Result<Vec<Message>, EngineError>;
    /// Replace the stored transcript with `messages`.
    fn save_messages(
        &self,
        server_id: &ServerId,
        session_id: &SessionId,
        messages: &[Message],
    ) -> Result<(), EngineError>;
    fn delete_messages(&self, server_id: &ServerId, session_id: &SessionId)
        -> Result<(), EngineError>;
}

/// Lookup of provider API keys by `<server_id>_<provider_type>`.
pub trait CredentialPort: Send + Sync {
    fn get_api_key(&self, key: &str) -> Option<String>;
}
