use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::pool::{
    AddReport, AllocationOutcome, AllocationRequest, DeallocationReport, ExchangeOutcome, Node,
    NodeDescriptor, RemoveReport, TypeSummary,
};
use crate::server::{
    AddNodesRequest, DeallocateRequest, OperationStatus, PoolResponse, RemoveNodesRequest,
    ResetRequest, ResourceList,
};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON parse error: {0}")]
    Parse(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Deallocation for '{0}' already in progress")]
    InProgress(String),
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait NodeManagerApi: Send + Sync {
    async fn health(&self) -> Result<bool, ClientError>;

    async fn list_nodes(
        &self,
        consumer: Option<&str>,
        pattern: Option<&str>,
    ) -> Result<Vec<Node>, ClientError>;

    async fn summary(&self) -> Result<Vec<TypeSummary>, ClientError>;

    async fn add_nodes(&self, nodes: Vec<NodeDescriptor>, validate: bool) -> Result<AddReport, ClientError>;

    async fn remove_nodes(&self, request: &RemoveNodesRequest) -> Result<RemoveReport, ClientError>;

    async fn reset(&self, active_consumers: Vec<String>) -> Result<OperationStatus, ClientError>;

    async fn allocate(&self, request: &AllocationRequest) -> Result<AllocationOutcome, ClientError>;

    async fn deallocate(
        &self,
        consumer: &str,
        nodes: Option<Vec<String>>,
    ) -> Result<DeallocationReport, ClientError>;

    async fn exchange(&self, request: &AllocationRequest) -> Result<ExchangeOutcome, ClientError>;

    async fn refresh_cache(&self) -> Result<OperationStatus, ClientError>;
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

#[derive(Clone)]
pub struct NodeManagerClient {
    client: reqwest::Client,
    base_url: String,
}

impl NodeManagerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ClientError> {
        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::Api {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }
        Ok(response)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, ClientError> {
        let response = self.send(self.client.get(self.url(path)).query(query)).await?;
        parse(response).await
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ClientError> {
        let response = self.send(self.client.post(self.url(path)).json(body)).await?;
        parse(response).await
    }

    /// POST returning a [`PoolResponse`] envelope; unwraps its result
    async fn call<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ClientError> {
        let envelope: PoolResponse<T> = self.post(path, body).await?;
        unwrap_envelope(envelope)
    }
}

async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    response
        .json()
        .await
        .map_err(|e| ClientError::Parse(e.to_string()))
}

/// Pull the error text out of an error body, falling back to the raw body
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_string())
}

fn unwrap_envelope<T>(envelope: PoolResponse<T>) -> Result<T, ClientError> {
    match envelope.result {
        Some(result) if envelope.success => Ok(result),
        _ => Err(ClientError::Parse(
            envelope
                .error
                .unwrap_or_else(|| "response carried no result".to_string()),
        )),
    }
}

#[async_trait]
impl NodeManagerApi for NodeManagerClient {
    async fn health(&self) -> Result<bool, ClientError> {
        let response = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        Ok(response.status().is_success())
    }

    async fn list_nodes(
        &self,
        consumer: Option<&str>,
        pattern: Option<&str>,
    ) -> Result<Vec<Node>, ClientError> {
        let mut query = Vec::new();
        if let Some(consumer) = consumer {
            query.push(("consumer", consumer));
        }
        if let Some(pattern) = pattern {
            query.push(("pattern", pattern));
        }
        let list: ResourceList<Node> = self.get("/v1/nodes", &query).await?;
        Ok(list.items)
    }

    async fn summary(&self) -> Result<Vec<TypeSummary>, ClientError> {
        let list: ResourceList<TypeSummary> = self.get("/v1/nodes/summary", &[]).await?;
        Ok(list.items)
    }

    async fn add_nodes(&self, nodes: Vec<NodeDescriptor>, validate: bool) -> Result<AddReport, ClientError> {
        self.call("/v1/nodes/add", &AddNodesRequest { nodes, validate })
            .await
    }

    async fn remove_nodes(&self, request: &RemoveNodesRequest) -> Result<RemoveReport, ClientError> {
        self.call("/v1/nodes/remove", request).await
    }

    async fn reset(&self, active_consumers: Vec<String>) -> Result<OperationStatus, ClientError> {
        self.post("/v1/nodes/reset", &ResetRequest { active_consumers })
            .await
    }

    async fn allocate(&self, request: &AllocationRequest) -> Result<AllocationOutcome, ClientError> {
        self.call("/v1/nodes/allocate", request).await
    }

    async fn deallocate(
        &self,
        consumer: &str,
        nodes: Option<Vec<String>>,
    ) -> Result<DeallocationReport, ClientError> {
        let body = DeallocateRequest {
            consumer: consumer.to_string(),
            nodes,
        };
        let response = self
            .send(self.client.post(self.url("/v1/nodes/deallocate")).json(&body))
            .await?;
        if response.status() == reqwest::StatusCode::ACCEPTED {
            return Err(ClientError::InProgress(consumer.to_string()));
        }
        let envelope: PoolResponse<DeallocationReport> = parse(response).await?;
        unwrap_envelope(envelope)
    }

    async fn exchange(&self, request: &AllocationRequest) -> Result<ExchangeOutcome, ClientError> {
        self.call("/v1/nodes/exchange", request).await
    }

    async fn refresh_cache(&self) -> Result<OperationStatus, ClientError> {
        self.post("/v1/cache/refresh", &serde_json::json!({})).await
    }
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::pool::{AllocationState, Node};

    /// Hands out canned nodes and records which consumers asked
    pub struct MockNodeManager {
        nodes: Vec<Node>,
        consumers: Mutex<Vec<String>>,
        call_count: Arc<AtomicUsize>,
    }

    impl MockNodeManager {
        pub fn new(nodes: Vec<Node>) -> Self {
            Self {
                nodes,
                consumers: Mutex::new(Vec::new()),
                call_count: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        pub fn consumers(&self) -> Vec<String> {
            self.consumers.lock().unwrap().clone()
        }

        fn record(&self, consumer: &str) {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            self.consumers.lock().unwrap().push(consumer.to_string());
        }

        fn outcome(&self, consumer: &str) -> AllocationOutcome {
            let mut nodes: BTreeMap<String, Vec<Node>> = BTreeMap::new();
            for node in &self.nodes {
                nodes.entry(node.node_type.clone()).or_default().push(node.clone());
            }
            AllocationOutcome {
                consumer: consumer.to_string(),
                state: AllocationState::Satisfied,
                nodes,
                warnings: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl NodeManagerApi for MockNodeManager {
        async fn health(&self) -> Result<bool, ClientError> {
            Ok(true)
        }

        async fn list_nodes(
            &self,
            consumer: Option<&str>,
            _pattern: Option<&str>,
        ) -> Result<Vec<Node>, ClientError> {
            Ok(match consumer {
                Some(c) => self.nodes.iter().filter(|n| n.is_owned_by(c)).cloned().collect(),
                None => self.nodes.clone(),
            })
        }

        async fn summary(&self) -> Result<Vec<TypeSummary>, ClientError> {
            Ok(Vec::new())
        }

        async fn add_nodes(&self, nodes: Vec<NodeDescriptor>, _validate: bool) -> Result<AddReport, ClientError> {
            Ok(AddReport {
                added: nodes.into_iter().filter_map(|d| d.id).collect(),
                ..Default::default()
            })
        }

        async fn remove_nodes(&self, request: &RemoveNodesRequest) -> Result<RemoveReport, ClientError> {
            Ok(RemoveReport {
                removed: request.ids.clone(),
                ..Default::default()
            })
        }

        async fn reset(&self, _active_consumers: Vec<String>) -> Result<OperationStatus, ClientError> {
            Ok(OperationStatus::success("Node ownership reset"))
        }

        async fn allocate(&self, request: &AllocationRequest) -> Result<AllocationOutcome, ClientError> {
            self.record(&request.consumer);
            Ok(self.outcome(&request.consumer))
        }

        async fn deallocate(
            &self,
            consumer: &str,
            _nodes: Option<Vec<String>>,
        ) -> Result<DeallocationReport, ClientError> {
            self.record(consumer);
            Ok(DeallocationReport {
                consumer: consumer.to_string(),
                released: self.nodes.iter().map(|n| n.id.clone()).collect(),
                failed: Vec::new(),
            })
        }

        async fn exchange(&self, request: &AllocationRequest) -> Result<ExchangeOutcome, ClientError> {
            let released = self.deallocate(&request.consumer, None).await?;
            let allocated = self.allocate(request).await?;
            Ok(ExchangeOutcome { released, allocated })
        }

        async fn refresh_cache(&self) -> Result<OperationStatus, ClientError> {
            Ok(OperationStatus::success("Cache refreshed"))
        }
    }
}
