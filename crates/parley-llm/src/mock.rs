use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};

use parley_core::{ProviderConfig, ProviderType};

use crate::adapter::ClientFactory;
use crate::client::{
    FinishReason, ModelClient, ModelEvent, ModelRequest, ModelStream, ModelToolCall,
};
use crate::error::ProviderError;

/// Pre-programmed responses for deterministic testing without API calls.
pub enum MockResponse {
    /// Yield a sequence of items, then end.
    Stream(Vec<Result<ModelEvent, ProviderError>>),
    /// Return an error from the `stream()` call itself.
    Error(ProviderError),
    /// Yield the items, then stay open until the consumer drops the stream.
    Hang(Vec<ModelEvent>),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A plain text reply that finishes normally.
    pub fn text(text: &str) -> Self {
        Self::Stream(vec![
            Ok(ModelEvent::TextDelta(text.to_string())),
            Ok(ModelEvent::Finish(FinishReason::Stop)),
        ])
    }

    /// A single tool call that finishes for tool use.
    pub fn tool_call(id: &str, name: &str, arguments: &str) -> Self {
        Self::Stream(vec![
            Ok(ModelEvent::ToolCall(ModelToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            })),
            Ok(ModelEvent::Finish(FinishReason::ToolCalls)),
        ])
    }

    pub fn events(events: Vec<ModelEvent>) -> Self {
        Self::Stream(events.into_iter().map(Ok).collect())
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Model client that replays responses in order and records every request.
pub struct MockModelClient {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<ModelRequest>>,
    call_count: AtomicUsize,
}

impl MockModelClient {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ModelClient for MockModelClient {
    fn provider(&self) -> ProviderType {
        ProviderType::Custom
    }

    async fn stream(&self, request: &ModelRequest) -> Result<ModelStream, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let mut next = self.responses.lock().pop_front().ok_or_else(|| {
            ProviderError::InvalidRequest(format!("mock: no response configured for call {idx}"))
        })?;

        loop {
            match next {
                MockResponse::Stream(items) => return Ok(Box::pin(stream::iter(items))),
                MockResponse::Error(e) => return Err(e),
                MockResponse::Hang(events) => {
                    let head = stream::iter(events.into_iter().map(Ok));
                    return Ok(Box::pin(futures::StreamExt::chain(head, stream::pending())));
                }
                MockResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    next = *inner;
                }
            }
        }
    }
}

/// Hands out one shared mock client and records the API keys it was given.
pub struct MockClientFactory {
    client: Arc<MockModelClient>,
    api_keys: Mutex<Vec<String>>,
}

impl MockClientFactory {
    pub fn new(client: Arc<MockModelClient>) -> Self {
        Self {
            client,
            api_keys: Mutex::new(Vec::new()),
        }
    }

    pub fn api_keys(&self) -> Vec<String> {
        self.api_keys.lock().clone()
    }
}

impl ClientFactory for MockClientFactory {
    fn create(
        &self,
        _config: &ProviderConfig,
        api_key: SecretString,
    ) -> Result<Arc<dyn ModelClient>, ProviderError> {
        self.api_keys.lock().push(api_key.expose_secret().to_string());
        Ok(self.client.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn req() -> ModelRequest {
        ModelRequest {
            model: "m".into(),
            system: None,
            turns: Vec::new(),
            tools: Vec::new(),
            temperature: None,
            reasoning: None,
        }
    }

    #[tokio::test]
    async fn replays_in_order_then_errors() {
        let mock = MockModelClient::new(vec![
            MockResponse::text("one"),
            MockResponse::Error(ProviderError::RateLimited),
        ]);

        let events: Vec<_> = mock.stream(&req()).await.unwrap().collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(mock.stream(&req()).await, Err(ProviderError::RateLimited)));
        assert!(matches!(
            mock.stream(&req()).await,
            Err(ProviderError::InvalidRequest(_))
        ));
        assert_eq!(mock.call_count(), 3);
        assert_eq!(mock.requests().len(), 3);
    }

    #[tokio::test]
    async fn delay_resolves_inner() {
        tokio::time::pause();
        let mock = MockModelClient::new(vec![MockResponse::delayed(
            Duration::from_secs(2),
            MockResponse::tool_call("c1", "x", "{}"),
        )]);
        let events: Vec<_> = mock.stream(&req()).await.unwrap().collect().await;
        assert!(matches!(events[0], Ok(ModelEvent::ToolCall(_))));
    }
}
