pub mod adapter;
pub mod anthropic;
pub mod catalog;
pub mod client;
pub mod error;
pub mod mock;
pub mod openai;
pub mod sse;

pub use adapter::{ClientFactory, HttpClientFactory, ProviderAdapter};
pub use catalog::{build_client, default_base_url, ClientOptions, ProviderFamily};
pub use client::{
    ChatTurn, FinishReason, ModelClient, ModelEvent, ModelRequest, ModelStream, ModelToolCall,
    ReasoningOptions,
};
pub use error::ProviderError;
pub use mock::{MockClientFactory, MockModelClient, MockResponse};
