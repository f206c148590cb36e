pub mod aggregator;
pub mod mcp;

pub use aggregator::{ConnectionState, ProviderStatus, RetryPolicy, ToolAggregator};
pub use mcp::{HttpMcpProvider, McpAuth, McpServerConfig};
