//! HTTP Transport
//!
//! The seam between provider adapters and the network. Adapters build JSON
//! bodies and hand them to a [`Transport`]; tests swap in canned responses.

use std::pin::Pin;
use std::time::Duration;

use agent_core::error::{AgentError, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;

/// Raw response body chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Header name/value pairs sent with a request
pub type Headers = [(String, String)];

#[async_trait]
pub trait Transport: Send + Sync {
    /// POST a JSON body and decode the JSON response
    async fn post_json(&self, url: &str, headers: &Headers, body: &Value) -> Result<Value>;

    /// POST a JSON body and return the response body as it arrives
    async fn post_stream(&self, url: &str, headers: &Headers, body: &Value) -> Result<ByteStream>;

    /// GET a JSON document
    async fn get_json(&self, url: &str, headers: &Headers) -> Result<Value>;
}

/// `reqwest`-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    /// `timeout` bounds connecting and whole non-streaming exchanges;
    /// streamed bodies are bounded by the caller
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, timeout })
    }

    fn request(&self, builder: reqwest::RequestBuilder, headers: &Headers) -> reqwest::RequestBuilder {
        headers
            .iter()
            .fold(builder, |builder, (name, value)| builder.header(name.as_str(), value.as_str()))
    }

    fn map_error(&self, error: reqwest::Error) -> AgentError {
        if error.is_timeout() {
            AgentError::ProviderTimeout(self.timeout)
        } else {
            AgentError::Transport(error.to_string())
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await.map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::Transport(format!("HTTP {}: {}", status, text)));
        }

        Ok(response)
    }

    async fn decode(&self, response: reqwest::Response) -> Result<Value> {
        let bytes = response.bytes().await.map_err(|e| self.map_error(e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AgentError::Protocol(format!("invalid JSON response: {}", e)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_json(&self, url: &str, headers: &Headers, body: &Value) -> Result<Value> {
        let builder = self.request(self.client.post(url), headers).timeout(self.timeout).json(body);
        let response = self.send(builder).await?;
        self.decode(response).await
    }

    async fn post_stream(&self, url: &str, headers: &Headers, body: &Value) -> Result<ByteStream> {
        let builder = self.request(self.client.post(url), headers).json(body);
        let response = self.send(builder).await?;

        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| AgentError::Transport(format!("stream interrupted: {}", e)))
        });
        Ok(Box::pin(stream))
    }

    async fn get_json(&self, url: &str, headers: &Headers) -> Result<Value> {
        let builder = self.request(self.client.get(url), headers).timeout(self.timeout);
        let response = self.send(builder).await?;
        self.decode(response).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Request seen by [`CannedTransport`]
    #[derive(Clone, Debug)]
    pub struct SentRequest {
        pub url: String,
        pub headers: Vec<(String, String)>,
        pub body: Value,
    }

    /// Replays queued JSON bodies and SSE chunk sequences
    #[derive(Default)]
    pub struct CannedTransport {
        json: Mutex<VecDeque<Result<Value>>>,
        streams: Mutex<VecDeque<Vec<Vec<u8>>>>,
        sent: Mutex<Vec<SentRequest>>,
    }

    impl CannedTransport {
        pub fn with_json(self, value: Value) -> Self {
            self.json.lock().unwrap().push_back(Ok(value));
            self
        }

        pub fn with_error(self, error: AgentError) -> Self {
            self.json.lock().unwrap().push_back(Err(error));
            self
        }

        /// Queue a streamed body split into the given chunks
        pub fn with_chunks(self, chunks: &[&str]) -> Self {
            self.streams
                .lock()
                .unwrap()
                .push_back(chunks.iter().map(|c| c.as_bytes().to_vec()).collect());
            self
        }

        pub fn sent(&self) -> Vec<SentRequest> {
            self.sent.lock().unwrap().clone()
        }

        fn record(&self, url: &str, headers: &Headers, body: Value) {
            self.sent.lock().unwrap().push(SentRequest {
                url: url.to_string(),
                headers: headers.to_vec(),
                body,
            });
        }

        fn next_json(&self) -> Result<Value> {
            self.json
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AgentError::Transport("no canned response".into())))
        }
    }

    #[async_trait]
    impl Transport for CannedTransport {
        async fn post_json(&self, url: &str, headers: &Headers, body: &Value) -> Result<Value> {
            self.record(url, headers, body.clone());
            self.next_json()
        }

        async fn post_stream(&self, url: &str, headers: &Headers, body: &Value) -> Result<ByteStream> {
            self.record(url, headers, body.clone());
            let chunks = self
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| AgentError::Transport("no canned stream".into()))?;
            Ok(futures::stream::iter(chunks.into_iter().map(Ok::<_, AgentError>)).boxed())
        }

        async fn get_json(&self, url: &str, headers: &Headers) -> Result<Value> {
            self.record(url, headers, Value::Null);
            self.next_json()
        }
    }
}
