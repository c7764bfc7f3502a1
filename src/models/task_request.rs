//! # Task Request
//!
//! Immutable description of one compute job as it travels through the queue.
//!
//! ```text
//! TaskRequest
//! ├── task_id
//! ├── cluster_init_config   (parties, entry_address)
//! ├── device_configs        (secure?, homomorphic?)
//! └── task_parameters       (task_type?, ..algorithm fields)
//! ```

use crate::error::{Result, TaskError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};

/// Literal entry address that selects the in-process cluster.
pub const LOCAL_ENTRY_ADDRESS: &str = "local";

/// A single job submitted to a worker queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: String,
    pub cluster_init_config: ClusterInitConfig,
    #[serde(default)]
    pub device_configs: DeviceConfigs,
    pub task_parameters: TaskParameters,
}

impl TaskRequest {
    pub fn new(
        task_id: impl Into<String>,
        cluster_init_config: ClusterInitConfig,
        device_configs: DeviceConfigs,
        task_parameters: TaskParameters,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            cluster_init_config,
            device_configs,
            task_parameters,
        }
    }

    /// Task type, or `"unknown"` for logging when the field is missing.
    pub fn task_type_or_unknown(&self) -> &str {
        self.task_parameters.task_type().unwrap_or("unknown")
    }

    /// Structural checks a consumer can make without consulting a handler.
    pub fn validate(&self) -> Result<()> {
        if self.task_id.trim().is_empty() {
            return Err(TaskError::parameter("task_id must not be empty"));
        }
        self.cluster_init_config.validate()
    }
}

/// Cluster bootstrap configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInitConfig {
    /// Ordered, duplicate-free party identifiers.
    pub parties: Vec<String>,
    /// Cluster entry point (`"local"` or `host:port`).
    #[serde(default = "default_entry_address")]
    pub entry_address: String,
}

fn default_entry_address() -> String {
    LOCAL_ENTRY_ADDRESS.to_string()
}

impl ClusterInitConfig {
    pub fn new<I, S>(parties: I, entry_address: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parties: parties.into_iter().map(Into::into).collect(),
            entry_address: entry_address.into(),
        }
    }

    pub fn local<I, S>(parties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(parties, LOCAL_ENTRY_ADDRESS)
    }

    pub fn is_local(&self) -> bool {
        self.entry_address == LOCAL_ENTRY_ADDRESS
    }

    pub fn validate(&self) -> Result<()> {
        if self.parties.is_empty() {
            return Err(TaskError::parameter(
                "cluster_init_config.parties must not be empty",
            ));
        }
        let mut seen = HashSet::new();
        for party in &self.parties {
            if party.trim().is_empty() {
                return Err(TaskError::parameter(
                    "cluster_init_config.parties contains an empty party name",
                ));
            }
            if !seen.insert(party.as_str()) {
                return Err(TaskError::parameter(format!(
                    "cluster_init_config.parties contains duplicate party '{party}'"
                )));
            }
        }
        if self.entry_address.trim().is_empty() {
            return Err(TaskError::parameter(
                "cluster_init_config.entry_address must not be empty",
            ));
        }
        Ok(())
    }
}

/// Optional device configuration blocks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfigs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure_device_config: Option<SecureDeviceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homomorphic_device_config: Option<HomomorphicDeviceConfig>,
}

impl DeviceConfigs {
    pub fn with_secure(mut self, config: SecureDeviceConfig) -> Self {
        self.secure_device_config = Some(config);
        self
    }

    pub fn with_homomorphic(mut self, config: HomomorphicDeviceConfig) -> Self {
        self.homomorphic_device_config = Some(config);
        self
    }
}

/// Shared secure-computation device configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecureDeviceConfig {
    pub cluster_def: ClusterDef,
}

/// Node layout and runtime protocol of the secure-computation device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterDef {
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub runtime_config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub party: String,
    #[serde(default)]
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_address: Option<String>,
}

impl SecureDeviceConfig {
    /// Minimal configuration: one node per party, default runtime.
    pub fn for_parties<I, S>(parties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes = parties
            .into_iter()
            .enumerate()
            .map(|(index, party)| NodeDef {
                party: party.into(),
                address: format!("127.0.0.1:{}", 9100 + index),
                listen_address: None,
            })
            .collect();
        Self {
            cluster_def: ClusterDef {
                nodes,
                runtime_config: Value::Null,
            },
        }
    }

    /// Parties named by the node list, in node order.
    pub fn parties(&self) -> Vec<String> {
        self.cluster_def
            .nodes
            .iter()
            .map(|node| node.party.clone())
            .collect()
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.cluster_def.nodes.is_empty() {
            return Err("cluster_def.nodes must not be empty".to_string());
        }
        if let Some(node) = self
            .cluster_def
            .nodes
            .iter()
            .find(|node| node.party.trim().is_empty())
        {
            return Err(format!(
                "cluster_def node at '{}' has an empty party name",
                node.address
            ));
        }
        Ok(())
    }
}

/// Optional homomorphic-encryption device configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HomomorphicDeviceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sk_keeper: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evaluators: Vec<String>,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl HomomorphicDeviceConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.sk_keeper.is_none() && self.evaluators.is_empty() && self.settings.is_empty() {
            return Err("homomorphic device configuration is empty".to_string());
        }
        if let Some(keeper) = &self.sk_keeper {
            if self.evaluators.iter().any(|evaluator| evaluator == keeper) {
                return Err(format!(
                    "sk_keeper '{keeper}' must not also be listed as an evaluator"
                ));
            }
        }
        Ok(())
    }
}

/// Algorithm parameters. `task_type` selects the handler; every other field is
/// kept verbatim for the handler to interpret.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Fields whose object keys are party names.
const PARTY_KEYED_FIELDS: [&str; 3] = ["keys", "input_paths", "output_paths"];

impl TaskParameters {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: Some(task_type.into()),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn task_type(&self) -> Option<&str> {
        self.task_type.as_deref().filter(|t| !t.is_empty())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Deserialize a required field, reporting a validation error otherwise.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .fields
            .get(key)
            .ok_or_else(|| TaskError::parameter(format!("missing required field '{key}'")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| TaskError::parameter(format!("field '{key}' is invalid: {e}")))
    }

    /// Party names referenced by the conventional party-bearing fields.
    pub fn referenced_parties(&self) -> BTreeSet<String> {
        let mut parties = BTreeSet::new();

        for field in PARTY_KEYED_FIELDS {
            if let Some(Value::Object(map)) = self.fields.get(field) {
                parties.extend(map.keys().cloned());
            }
        }
        if let Some(receiver) = self.get_str("receiver") {
            parties.insert(receiver.to_string());
        }
        if let Some(Value::Array(items)) = self.fields.get("parties") {
            parties.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
        }

        parties
    }
}
