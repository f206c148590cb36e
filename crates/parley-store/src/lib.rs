pub mod credentials;
pub mod database;
pub mod error;
pub mod schema;
pub mod sqlite;

pub use credentials::MemoryCredentials;
pub use database::Database;
pub use error::StoreError;
pub use sqlite::SqliteStore;
