//! Node resource - one allocatable network element in the pool
//!
//! A Node belongs to exactly one type and one simulation host. Consumers
//! attach to it through ownership edges; when an exclusive consumer holds
//! an exclusive-eligible node nobody else may attach.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{AttachError, RejectReason};

/// Authoritative type -> id -> Node view of the inventory
pub type NodeDict = BTreeMap<String, BTreeMap<String, Node>>;

/// A node in the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique, stable identifier
    pub id: String,

    /// Network element type
    #[serde(rename = "type")]
    pub node_type: String,

    /// Simulation host the node runs on
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulation: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Sub-category used for percentage splits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_element_type: Option<String>,

    /// Node IP address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Free-form descriptors usable by attribute filters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,

    /// Managed object name -> occurrence count
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cardinality: BTreeMap<String, u32>,

    /// Consumers currently attached
    #[serde(default)]
    pub ownership: BTreeSet<String>,

    /// Held by an exclusive consumer right now
    #[serde(default)]
    pub exclusive: bool,

    #[serde(default = "default_true")]
    pub exclusive_eligible: bool,

    /// Consumers this node is reserved for
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub available_to: BTreeSet<String>,

    /// Consumers that may never take this node
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub exclude_from: BTreeSet<String>,

    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

/// The identity and mode a consumer attaches with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub consumer: String,
    pub exclusive: bool,
    pub excluded_types: Vec<String>,
}

impl Claim {
    pub fn new(consumer: impl Into<String>, exclusive: bool) -> Self {
        Self {
            consumer: consumer.into(),
            exclusive,
            excluded_types: Vec::new(),
        }
    }

    pub fn with_excluded_types(mut self, types: Vec<String>) -> Self {
        self.excluded_types = types;
        self
    }
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, host: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            node_type: node_type.into(),
            host: host.into(),
            simulation: None,
            version: None,
            model: None,
            managed_element_type: None,
            address: None,
            attributes: BTreeMap::new(),
            cardinality: BTreeMap::new(),
            ownership: BTreeSet::new(),
            exclusive: false,
            exclusive_eligible: true,
            available_to: BTreeSet::new(),
            exclude_from: BTreeSet::new(),
            added_at: now,
            updated_at: now,
        }
    }

    pub fn with_simulation(mut self, simulation: impl Into<String>) -> Self {
        self.simulation = Some(simulation.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_managed_element_type(mut self, me_type: impl Into<String>) -> Self {
        self.managed_element_type = Some(me_type.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_cardinality(mut self, managed_object: impl Into<String>, count: u32) -> Self {
        self.cardinality.insert(managed_object.into(), count);
        self
    }

    pub fn with_exclusive_eligible(mut self, eligible: bool) -> Self {
        self.exclusive_eligible = eligible;
        self
    }

    pub fn reserved_for(mut self, consumer: impl Into<String>) -> Self {
        self.available_to.insert(consumer.into());
        self
    }

    pub fn excluded_from(mut self, consumer: impl Into<String>) -> Self {
        self.exclude_from.insert(consumer.into());
        self
    }

    /// Look up a descriptor by filter key
    ///
    /// Well-known keys map onto the typed fields; anything else is read from
    /// `attributes`.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        match key {
            "id" | "node_id" => Some(self.id.as_str()),
            "type" | "node_type" | "primary_type" => Some(self.node_type.as_str()),
            "host" | "netsim" => Some(self.host.as_str()),
            "simulation" => self.simulation.as_deref(),
            "version" | "node_version" => self.version.as_deref(),
            "model" => self.model.as_deref(),
            "managed_element_type" => self.managed_element_type.as_deref(),
            "address" | "node_ip" => self.address.as_deref(),
            other => self.attributes.get(other).map(String::as_str),
        }
    }

    pub fn is_used(&self) -> bool {
        !self.ownership.is_empty()
    }

    pub fn is_owned_by(&self, consumer: &str) -> bool {
        self.ownership.contains(consumer)
    }

    pub fn is_reserved_for(&self, consumer: &str) -> bool {
        self.available_to
            .iter()
            .any(|name| name.eq_ignore_ascii_case(consumer))
    }

    /// Whether `claim` may attach to this node right now
    pub fn is_available_for(&self, claim: &Claim, exclusive_consumers: &BTreeSet<String>) -> bool {
        if self.exclude_from.contains(&claim.consumer)
            || claim.excluded_types.iter().any(|t| t == &self.node_type)
        {
            return false;
        }

        if !self.exclusive_eligible {
            return true;
        }

        let held_by_exclusive = self
            .ownership
            .iter()
            .any(|owner| owner != &claim.consumer && exclusive_consumers.contains(owner));
        if held_by_exclusive {
            return false;
        }

        if !self.exclusive && !(claim.exclusive && self.is_used()) {
            return true;
        }

        !self.is_used() || self.is_owned_by(&claim.consumer)
    }

    /// Add an ownership edge; returns false when `claim` already held it
    pub fn attach(
        &mut self,
        claim: &Claim,
        exclusive_consumers: &BTreeSet<String>,
    ) -> Result<bool, AttachError> {
        if self.is_owned_by(&claim.consumer) {
            return Ok(false);
        }
        if !self.is_available_for(claim, exclusive_consumers) {
            return Err(AttachError::Unavailable {
                node: self.id.clone(),
                consumer: claim.consumer.clone(),
                holders: self.holders(),
            });
        }

        self.ownership.insert(claim.consumer.clone());
        let exclusive_claim = claim.exclusive || exclusive_consumers.contains(&claim.consumer);
        self.exclusive = exclusive_claim && self.exclusive_eligible;
        self.updated_at = Utc::now();
        Ok(true)
    }

    /// Remove the ownership edge held by `consumer`
    pub fn detach(&mut self, consumer: &str) -> Result<(), AttachError> {
        if !self.ownership.remove(consumer) {
            return Err(AttachError::NotAttached {
                node: self.id.clone(),
                consumer: consumer.to_string(),
            });
        }
        self.exclusive = false;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Drop every edge whose owner fails `keep`; returns the dropped owners
    pub fn release_owners<F>(&mut self, keep: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let dropped: Vec<String> = self
            .ownership
            .iter()
            .filter(|owner| !keep(owner))
            .cloned()
            .collect();
        if dropped.is_empty() {
            return dropped;
        }
        for owner in &dropped {
            self.ownership.remove(owner);
        }
        if self.ownership.is_empty() {
            self.exclusive = false;
        }
        self.updated_at = Utc::now();
        dropped
    }

    pub fn holders(&self) -> String {
        if self.ownership.is_empty() {
            return "none".to_string();
        }
        self.ownership.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}

/// Raw node description accepted on import
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    #[serde(default, alias = "node_id")]
    pub id: Option<String>,

    #[serde(default, rename = "type", alias = "primary_type")]
    pub node_type: Option<String>,

    #[serde(default, alias = "netsim")]
    pub host: Option<String>,

    #[serde(default)]
    pub simulation: Option<String>,

    #[serde(default, alias = "node_version")]
    pub version: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub managed_element_type: Option<String>,

    #[serde(default, alias = "node_ip")]
    pub address: Option<String>,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    #[serde(default)]
    pub cardinality: BTreeMap<String, u32>,

    #[serde(default)]
    pub exclusive_eligible: Option<bool>,

    #[serde(default)]
    pub available_to: BTreeSet<String>,

    #[serde(default)]
    pub exclude_from: BTreeSet<String>,
}

impl NodeDescriptor {
    /// Best-effort label for reporting rejected descriptors
    pub fn label(&self) -> String {
        self.id
            .clone()
            .or_else(|| self.address.clone())
            .unwrap_or_else(|| "<unnamed>".to_string())
    }
}

impl From<&Node> for NodeDescriptor {
    fn from(node: &Node) -> Self {
        Self {
            id: Some(node.id.clone()),
            node_type: Some(node.node_type.clone()),
            host: Some(node.host.clone()),
            simulation: node.simulation.clone(),
            version: node.version.clone(),
            model: node.model.clone(),
            managed_element_type: node.managed_element_type.clone(),
            address: node.address.clone(),
            attributes: node.attributes.clone(),
            cardinality: node.cardinality.clone(),
            exclusive_eligible: Some(node.exclusive_eligible),
            available_to: node.available_to.clone(),
            exclude_from: node.exclude_from.clone(),
        }
    }
}

impl TryFrom<NodeDescriptor> for Node {
    type Error = RejectReason;

    fn try_from(desc: NodeDescriptor) -> Result<Self, Self::Error> {
        let id = non_empty(desc.id).ok_or(RejectReason::MissingDescriptor)?;
        let host = non_empty(desc.host).ok_or(RejectReason::MissingDescriptor)?;
        let node_type = non_empty(desc.node_type).ok_or(RejectReason::MissingType)?;

        let mut node = Node::new(id, node_type, host);
        node.simulation = desc.simulation;
        node.version = desc.version;
        node.model = desc.model;
        node.managed_element_type = desc.managed_element_type;
        node.address = desc.address;
        node.attributes = desc.attributes;
        node.cardinality = desc.cardinality;
        node.exclusive_eligible = desc.exclusive_eligible.unwrap_or(true);
        node.available_to = desc.available_to;
        node.exclude_from = desc.exclude_from;
        Ok(node)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
