//! Aggregates tool providers into one namespaced tool catalogue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use parley_core::{
    ResourceDescriptor, ToolDescriptor, ToolError, ToolInvoker, ToolProvider,
};

/// Discovery retry policy, applied to each provider independently.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn delay_before(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(2)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProviderStatus {
    pub provider_id: String,
    pub name: String,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tool_count: usize,
    pub resource_count: usize,
}

struct Entry {
    provider: Arc<dyn ToolProvider>,
    state: ConnectionState,
    error: Option<String>,
    tools: Vec<ToolDescriptor>,
    resources: Vec<ResourceDescriptor>,
}

impl Entry {
    fn new(provider: Arc<dyn ToolProvider>) -> Self {
        Self {
            provider,
            state: ConnectionState::Connecting,
            error: None,
            tools: Vec::new(),
            resources: Vec::new(),
        }
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

struct Discovered {
    tools: Vec<ToolDescriptor>,
    resources: Vec<ResourceDescriptor>,
}

/// Registry of tool providers, constructed explicitly and shared by `Arc`.
///
/// The lock is never held across an await: provider handles are cloned out
/// before any network call, so invocations on different providers run
/// concurrently and an unregistered provider's in-flight calls finish on
/// their own.
pub struct ToolAggregator {
    entries: RwLock<Vec<Entry>>,
    retry: RetryPolicy,
}

impl Default for ToolAggregator {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl ToolAggregator {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            retry,
        }
    }

    /// Add a provider and run discovery. A provider with the same id is
    /// replaced. On failure the provider stays registered in `Error` state
    /// and can be retried with [`reconnect`](Self::reconnect).
    pub async fn register(&self, provider: Arc<dyn ToolProvider>) -> Result<(), ToolError> {
        let id = provider.id().to_string();
        if !is_valid_provider_id(&id) {
            return Err(ToolError::InvalidProviderId(id));
        }
        let previous = {
            let mut entries = self.entries.write();
            let previous = entries
                .iter()
                .position(|e| e.provider.id() == id)
                .map(|idx| entries.remove(idx));
            entries.push(Entry::new(provider.clone()));
            previous
        };
        if let Some(old) = previous {
            old.provider.disconnect().await;
        }
        self.discover(provider).await
    }

    /// Register several providers. Discovery runs concurrently, so one
    /// provider's retries never hold up another. Results follow input order.
    pub async fn register_all(
        &self,
        providers: Vec<Arc<dyn ToolProvider>>,
    ) -> Vec<Result<(), ToolError>> {
        futures::future::join_all(providers.into_iter().map(|p| self.register(p))).await
    }

    /// Remove a provider. Its tools disappear immediately.
    pub async fn unregister(&self, provider_id: &str) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            entries
                .iter()
                .position(|e| e.provider.id() == provider_id)
                .map(|idx| entries.remove(idx))
        };
        match removed {
            Some(entry) => {
                entry.provider.disconnect().await;
                info!(provider = provider_id, "tool provider removed");
                true
            }
            None => false,
        }
    }

    /// Disconnect and rediscover one provider.
    pub async fn reconnect(&self, provider_id: &str) -> Result<(), ToolError> {
        let provider = {
            let mut entries = self.entries.write();
            let entry = entries
                .iter_mut()
                .find(|e| e.provider.id() == provider_id)
                .ok_or_else(|| ToolError::ProviderUnavailable(provider_id.to_string()))?;
            entry.state = ConnectionState::Connecting;
            entry.error = None;
            entry.tools.clear();
            entry.resources.clear();
            entry.provider.clone()
        };
        provider.disconnect().await;
        self.discover(provider).await
    }

    /// Disconnect every provider. Registrations are kept in `Disconnected`
    /// state.
    pub async fn disconnect_all(&self) {
        let providers: Vec<Arc<dyn ToolProvider>> = {
            let mut entries = self.entries.write();
            entries
                .iter_mut()
                .map(|e| {
                    e.state = ConnectionState::Disconnected;
                    e.tools.clear();
                    e.resources.clear();
                    e.provider.clone()
                })
                .collect()
        };
        futures::future::join_all(providers.iter().map(|p| p.disconnect())).await;
    }

    /// Tools of every connected provider, in registration order.
    pub fn list_all(&self) -> Vec<ToolDescriptor> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.is_connected())
            .flat_map(|e| e.tools.iter().cloned())
            .collect()
    }

    pub fn list_resources(&self) -> Vec<ResourceDescriptor> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.is_connected())
            .flat_map(|e| e.resources.iter().cloned())
            .collect()
    }

    pub fn statuses(&self) -> Vec<ProviderStatus> {
        self.entries
            .read()
            .iter()
            .map(|e| ProviderStatus {
                provider_id: e.provider.id().to_string(),
                name: e.provider.name().to_string(),
                state: e.state,
                error: e.error.clone(),
                tool_count: e.tools.len(),
                resource_count: e.resources.len(),
            })
            .collect()
    }

    /// Call a tool by namespaced name, falling back to a bare tool name
    /// across connected providers.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<String, ToolError> {
        let (provider, tool_name) = self
            .resolve(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        debug!(tool = name, provider = provider.id(), "invoking tool");
        provider.call_tool(&tool_name, args).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<String, ToolError> {
        let provider = self
            .entries
            .read()
            .iter()
            .filter(|e| e.is_connected())
            .find(|e| e.resources.iter().any(|r| r.uri == uri))
            .map(|e| e.provider.clone())
            .ok_or_else(|| ToolError::ResourceNotFound(uri.to_string()))?;
        provider.read_resource(uri).await
    }

    fn resolve(&self, name: &str) -> Option<(Arc<dyn ToolProvider>, String)> {
        let entries = self.entries.read();
        let connected = || entries.iter().filter(|e| e.is_connected());

        connected()
            .find_map(|e| {
                e.tools
                    .iter()
                    .find(|t| t.name == name)
                    .map(|t| (e.provider.clone(), t.tool_name.clone()))
            })
            .or_else(|| {
                connected().find_map(|e| {
                    e.tools
                        .iter()
                        .find(|t| t.tool_name == name)
                        .map(|t| (e.provider.clone(), t.tool_name.clone()))
                })
            })
    }

    async fn discover(&self, provider: Arc<dyn ToolProvider>) -> Result<(), ToolError> {
        let id = provider.id().to_string();
        let attempts = self.retry.attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.retry.delay_before(attempt)).await;
            }
            match discover_once(provider.as_ref()).await {
                Ok(found) => {
                    info!(
                        provider = %id,
                        tools = found.tools.len(),
                        resources = found.resources.len(),
                        "tool provider connected"
                    );
                    self.update(&provider, |entry| {
                        entry.state = ConnectionState::Connected;
                        entry.error = None;
                        entry.tools = found.tools;
                        entry.resources = found.resources;
                    });
                    return Ok(());
                }
                Err(e) => {
                    warn!(provider = %id, attempt, attempts, error = %e, "tool discovery failed");
                    last_error = Some(e);
                }
            }
        }

        let message = last_error.map(|e| e.to_string()).unwrap_or_default();
        self.update(&provider, |entry| {
            entry.state = ConnectionState::Error;
            entry.error = Some(message.clone());
        });
        Err(ToolError::ProviderUnavailable(format!("{id}: {message}")))
    }

    /// Apply `f` to the entry still holding this exact provider instance.
    fn update(&self, provider: &Arc<dyn ToolProvider>, f: impl FnOnce(&mut Entry)) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| Arc::ptr_eq(&e.provider, provider))
        {
            f(entry);
        }
    }
}

/// Provider ids prefix tool names, which must stay within `[A-Za-z0-9_-]`.
fn is_valid_provider_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

async fn discover_once(provider: &dyn ToolProvider) -> Result<Discovered, ToolError> {
    provider.connect().await?;
    let id = provider.id();
    let tools = provider
        .list_tools()
        .await?
        .into_iter()
        .map(|t| ToolDescriptor::from_remote(id, t))
        .collect();
    // Resources are optional for a provider.
    let resources = match provider.list_resources().await {
        Ok(list) => list
            .into_iter()
            .map(|r| ResourceDescriptor::from_remote(id, r))
            .collect(),
        Err(e) => {
            debug!(provider = id, error = %e, "no resources");
            Vec::new()
        }
    };
    Ok(Discovered { tools, resources })
}

#[async_trait]
impl ToolInvoker for ToolAggregator {
    fn tools(&self) -> Vec<ToolDescriptor> {
        self.list_all()
    }

    async fn invoke(&self, name: &str, args: Value) -> Result<String, ToolError> {
        ToolAggregator::invoke(self, name, args).await
    }
}
