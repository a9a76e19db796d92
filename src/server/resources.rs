//! Wire types for the nodemanager API

use serde::{Deserialize, Serialize};

use crate::pool::NodeDescriptor;

pub const API_VERSION: &str = "nodepool/v1";

/// Response for listing resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceList<T> {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Kind (e.g., "NodeList", "TypeSummaryList")
    pub kind: String,

    pub items: Vec<T>,
}

impl<T> ResourceList<T> {
    pub fn new(kind: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: kind.into(),
            items,
        }
    }
}

/// Outcome of an operation with no payload of its own
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStatus {
    pub success: bool,

    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl OperationStatus {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            details: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Result envelope for pool operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> PoolResponse<T> {
    pub fn success(result: T) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(msg.into()),
        }
    }
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddNodesRequest {
    pub nodes: Vec<NodeDescriptor>,
    /// Run the sync check on each node before accepting it
    #[serde(default)]
    pub validate: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoveNodesRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub all: bool,
    /// Remove nodes even while allocated
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResetRequest {
    /// Consumers whose ownership survives the reset
    #[serde(default)]
    pub active_consumers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeallocateRequest {
    pub consumer: String,
    /// Only release these ids; everything the consumer holds when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListQuery {
    pub consumer: Option<String>,
    /// Comma-separated glob patterns
    pub pattern: Option<String>,
}

impl ListQuery {
    pub fn patterns(&self) -> Vec<String> {
        self.pattern
            .as_deref()
            .map(|p| {
                p.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_list_envelope() {
        let list: ResourceList<String> = ResourceList::new("NodeList", vec!["a".into()]);
        let json = serde_json::to_value(&list).unwrap();
        assert_eq!(json["apiVersion"], "nodepool/v1");
        assert_eq!(json["kind"], "NodeList");
    }

    #[test]
    fn test_pool_response_skips_empty_fields() {
        let json = serde_json::to_string(&PoolResponse::<u32>::error("boom")).unwrap();
        assert!(!json.contains("result"));
        let ok: PoolResponse<u32> = serde_json::from_str(r#"{"success":true,"result":3}"#).unwrap();
        assert_eq!(ok.result, Some(3));
    }

    #[test]
    fn test_list_query_patterns() {
        let query = ListQuery {
            consumer: None,
            pattern: Some("LTE*, ,CORE??".to_string()),
        };
        assert_eq!(query.patterns(), vec!["LTE*".to_string(), "CORE??".to_string()]);
    }
}
