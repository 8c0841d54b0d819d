//! Versioned checkpoint format
//!
//! A checkpoint is the JSON encoding of a suspended flow: the instance
//! (sessions, pending request, buffered inbound payloads, processed message
//! ids) plus the serialized flow logic it resumes with.

use serde::{Deserialize, Serialize};

use super::flow_instance::{FlowId, FlowInstance};
use crate::CoreError;

/// Current checkpoint schema version
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Decoded checkpoint
#[derive(Debug, Clone, Deserialize)]
pub struct Checkpoint {
    /// Schema version the checkpoint was written with
    pub schema_version: u32,
    /// Flow instance state
    pub instance: FlowInstance,
    /// Serialized flow logic
    pub continuation: serde_json::Value,
}

#[derive(Serialize)]
struct CheckpointRef<'a> {
    schema_version: u32,
    instance: &'a FlowInstance,
    continuation: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct VersionProbe {
    schema_version: Option<u32>,
}

impl Checkpoint {
    /// Encode a flow as checkpoint bytes
    pub fn encode(
        instance: &FlowInstance,
        continuation: &serde_json::Value,
    ) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(&CheckpointRef {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            instance,
            continuation,
        })
        .map_err(|e| CoreError::CheckpointError(format!("Failed to encode checkpoint: {}", e)))
    }

    /// Decode checkpoint bytes, refusing unknown schema versions
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        let probe: VersionProbe = serde_json::from_slice(bytes)
            .map_err(|e| CoreError::CheckpointError(format!("Malformed checkpoint: {}", e)))?;
        match probe.schema_version {
            Some(CHECKPOINT_SCHEMA_VERSION) => {}
            Some(version) => {
                return Err(CoreError::CheckpointError(format!(
                    "Unsupported checkpoint schema version {}",
                    version
                )))
            }
            None => {
                return Err(CoreError::CheckpointError(
                    "Checkpoint has no schema version".to_string(),
                ))
            }
        }

        serde_json::from_slice(bytes)
            .map_err(|e| CoreError::CheckpointError(format!("Malformed checkpoint: {}", e)))
    }

    /// Id of the checkpointed flow
    pub fn flow_id(&self) -> &FlowId {
        &self.instance.id
    }
}
