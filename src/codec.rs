//! Offload policy: payloads strictly larger than the threshold go to the blob
//! store and the record keeps only the reference.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blob_store::{put_bytes, read_offloaded, BlobRef, BlobStore};
use crate::catalog::{StorageType, WorkspaceState};
use crate::error::{PersistenceError, PersistenceResult};

pub const DEFAULT_OFFLOAD_THRESHOLD: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffloadPolicy {
    threshold_bytes: usize,
}

impl Default for OffloadPolicy {
    fn default() -> Self {
        Self {
            threshold_bytes: DEFAULT_OFFLOAD_THRESHOLD,
        }
    }
}

impl OffloadPolicy {
    pub fn new(threshold_bytes: usize) -> Self {
        Self { threshold_bytes }
    }

    pub fn threshold_bytes(&self) -> usize {
        self.threshold_bytes
    }

    pub fn should_offload(&self, serialized_len: usize) -> bool {
        serialized_len > self.threshold_bytes
    }

    pub fn place(&self, payload: Bytes) -> Placement {
        if self.should_offload(payload.len()) {
            Placement::Offload(payload)
        } else {
            Placement::Inline(payload)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    Inline(Bytes),
    Offload(Bytes),
}

/// Where a payload currently lives. Serialized with a `storage_type` tag so a
/// record carries either `inline_data` or `offload_ref`, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "storage_type")]
pub enum PayloadSlot {
    #[serde(rename = "inline")]
    Inline {
        #[serde(with = "base64_bytes")]
        inline_data: Bytes,
    },
    #[serde(rename = "offloaded")]
    Offloaded { offload_ref: BlobRef },
}

impl PayloadSlot {
    pub fn storage_type(&self) -> StorageType {
        match self {
            PayloadSlot::Inline { .. } => StorageType::Inline,
            PayloadSlot::Offloaded { .. } => StorageType::Offloaded,
        }
    }

    pub fn offload_ref(&self) -> Option<&BlobRef> {
        match self {
            PayloadSlot::Inline { .. } => None,
            PayloadSlot::Offloaded { offload_ref } => Some(offload_ref),
        }
    }

    pub fn from_columns(
        storage_type: &str,
        inline_data: Option<Vec<u8>>,
        offload_ref: Option<String>,
    ) -> PersistenceResult<Self> {
        match (StorageType::parse(storage_type)?, inline_data, offload_ref) {
            (StorageType::Inline, Some(data), None) => Ok(PayloadSlot::Inline {
                inline_data: Bytes::from(data),
            }),
            (StorageType::Offloaded, None, Some(reference)) => Ok(PayloadSlot::Offloaded {
                offload_ref: BlobRef::from(reference),
            }),
            (storage_type, data, reference) => Err(PersistenceError::corrupt(format!(
                "Record marked {} has inline_data={} offload_ref={}",
                storage_type,
                data.is_some(),
                reference.is_some()
            ))),
        }
    }

    /// Splits the slot into `(storage_type, inline_data, offload_ref)` columns.
    pub fn into_columns(self) -> (&'static str, Option<Vec<u8>>, Option<String>) {
        match self {
            PayloadSlot::Inline { inline_data } => ("inline", Some(inline_data.to_vec()), None),
            PayloadSlot::Offloaded { offload_ref } => {
                ("offloaded", None, Some(offload_ref.into_string()))
            }
        }
    }
}

/// Applies `policy` to `payload`, uploading it when it must be offloaded.
pub async fn store_payload(
    policy: &OffloadPolicy,
    blobs: &dyn BlobStore,
    part_size: usize,
    payload: Bytes,
) -> PersistenceResult<PayloadSlot> {
    match policy.place(payload) {
        Placement::Inline(inline_data) => Ok(PayloadSlot::Inline { inline_data }),
        Placement::Offload(payload) => {
            let len = payload.len();
            let offload_ref = put_bytes(blobs, payload, part_size).await?;
            debug!("Offloaded {} byte payload to {}", len, offload_ref);
            Ok(PayloadSlot::Offloaded { offload_ref })
        }
    }
}

pub async fn load_payload(blobs: &dyn BlobStore, slot: &PayloadSlot) -> PersistenceResult<Bytes> {
    match slot {
        PayloadSlot::Inline { inline_data } => Ok(inline_data.clone()),
        PayloadSlot::Offloaded { offload_ref } => read_offloaded(blobs, offload_ref).await,
    }
}

/// The three workspace artifacts, serialized together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspacePayload {
    #[serde(default)]
    pub predictive_analysis: Option<serde_json::Value>,
    #[serde(default)]
    pub visualization: Option<serde_json::Value>,
    #[serde(default)]
    pub variable_selection: Option<serde_json::Value>,
}

impl WorkspacePayload {
    pub fn from_state(state: &WorkspaceState) -> Self {
        Self {
            predictive_analysis: state.predictive_analysis.clone(),
            visualization: state.visualization.clone(),
            variable_selection: state.variable_selection.clone(),
        }
    }

    pub fn apply_to(self, state: &mut WorkspaceState) {
        state.predictive_analysis = self.predictive_analysis;
        state.visualization = self.visualization;
        state.variable_selection = self.variable_selection;
    }

    pub fn encode(&self) -> PersistenceResult<Bytes> {
        serde_json::to_vec(self).map(Bytes::from).map_err(|e| {
            PersistenceError::validation(format!("Workspace payload is not serializable: {}", e))
        })
    }

    pub fn decode(bytes: &[u8]) -> PersistenceResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            PersistenceError::corrupt(format!("Workspace payload cannot be decoded: {}", e))
        })
    }
}

pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_exclusive() {
        let policy = OffloadPolicy::new(10);
        assert!(!policy.should_offload(10));
        assert!(policy.should_offload(11));

        assert!(matches!(
            policy.place(Bytes::from_static(b"0123456789")),
            Placement::Inline(_)
        ));
        assert!(matches!(
            policy.place(Bytes::from_static(b"0123456789A")),
            Placement::Offload(_)
        ));
    }

    #[test]
    fn default_threshold_is_five_mebibytes() {
        assert_eq!(OffloadPolicy::default().threshold_bytes(), 5 * 1024 * 1024);
    }

    #[test]
    fn slot_serializes_with_storage_type_tag() {
        let inline = PayloadSlot::Inline {
            inline_data: Bytes::from_static(b"hello"),
        };
        let json = serde_json::to_value(&inline).unwrap();
        assert_eq!(json["storage_type"], "inline");
        assert_eq!(json["inline_data"], "aGVsbG8=");
        assert!(json.get("offload_ref").is_none());

        let offloaded = PayloadSlot::Offloaded {
            offload_ref: BlobRef::from("blob_1".to_string()),
        };
        let json = serde_json::to_value(&offloaded).unwrap();
        assert_eq!(json["storage_type"], "offloaded");
        assert_eq!(json["offload_ref"], "blob_1");
        assert!(json.get("inline_data").is_none());

        let back: PayloadSlot = serde_json::from_value(json).unwrap();
        assert_eq!(back, offloaded);
    }

    #[test]
    fn slot_columns_must_agree_with_storage_type() {
        assert!(PayloadSlot::from_columns("inline", Some(vec![1]), None).is_ok());
        assert!(PayloadSlot::from_columns("offloaded", None, Some("blob_1".into())).is_ok());

        let both = PayloadSlot::from_columns("inline", Some(vec![1]), Some("blob_1".into()));
        assert!(matches!(both, Err(PersistenceError::CorruptPayload { .. })));

        let neither = PayloadSlot::from_columns("offloaded", None, None);
        assert!(matches!(neither, Err(PersistenceError::CorruptPayload { .. })));
    }

    #[test]
    fn workspace_payload_is_measured_as_one_document() {
        let mut state = WorkspaceState::new("v1", "ds_1");
        state.predictive_analysis = Some(serde_json::json!({"r2": 0.9}));
        state.visualization = Some(serde_json::json!({"charts": ["hist"]}));

        let encoded = WorkspacePayload::from_state(&state).encode().unwrap();
        let decoded = WorkspacePayload::decode(&encoded).unwrap();

        assert_eq!(decoded.predictive_analysis, state.predictive_analysis);
        assert_eq!(decoded.visualization, state.visualization);
        assert_eq!(decoded.variable_selection, None);
    }

    #[test]
    fn undecodable_workspace_payload_is_corrupt() {
        let err = WorkspacePayload::decode(b"not json").unwrap_err();
        assert!(matches!(err, PersistenceError::CorruptPayload { .. }));
    }
}
