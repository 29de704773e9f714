//! Progress records written for each pipeline instance.

use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// Upsert key for a [`StateRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateKey {
    pub pipeline_id: String,
    pub pipeline_version: u64,
    pub total_instances: u32,
    pub instance_index: u32,
}

/// Per-instance progress, persisted by an external collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    pub pipeline_id: String,
    pub pipeline_version: u64,
    pub instance_index: u32,
    pub total_instances: u32,
    pub started_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub last_processed_timestamp: Option<Timestamp>,
    pub processed_count: u64,
    pub error_count: u64,
    pub total_count: u64,
    /// Events per second since `started_at`.
    pub throughput: f64,
}

impl StateRecord {
    pub fn key(&self) -> StateKey {
        StateKey {
            pipeline_id: self.pipeline_id.clone(),
            pipeline_version: self.pipeline_version,
            total_instances: self.total_instances,
            instance_index: self.instance_index,
        }
    }
}
