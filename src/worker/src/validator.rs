//! Decides whether a deletion candidate may be physically deleted.
//!
//! Every check runs against the live indexes at the time of the call; nothing
//! is cached between deliveries.

use std::sync::Arc;

use common::records::{ObjectMetadataRecord, ProbableDeleteRecord};
use common::store::{MetadataStore, list_all};

/// Result of validating one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The live metadata still names the candidate, or is gone entirely.
    Delete { record: ProbableDeleteRecord },
    /// The object id now belongs to a newer object.
    Stale { live_name: String },
    /// No probable-delete record, someone already handled it.
    AlreadyHandled,
    /// The write-path instance that wrote the record may still be working on the object.
    InstanceActive { instance_id: String },
    /// Not enough information to decide; try again on a later tick.
    Skip { reason: String },
}

pub struct DeletionValidator {
    store: Arc<dyn MetadataStore>,
    probable_delete_index: String,
    object_metadata_index: String,
    instance_index: Option<String>,
    max_keys: usize,
}

impl DeletionValidator {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        probable_delete_index: impl Into<String>,
        object_metadata_index: impl Into<String>,
        max_keys: usize,
    ) -> Self {
        Self {
            store,
            probable_delete_index: probable_delete_index.into(),
            object_metadata_index: object_metadata_index.into(),
            instance_index: None,
            max_keys,
        }
    }

    /// Enable the write-path liveness check against `index_id`.
    pub fn with_instance_index(mut self, index_id: Option<String>) -> Self {
        self.instance_index = index_id;
        self
    }

    pub async fn validate(&self, object_id: &str) -> Verdict {
        let raw = match self.store.get(&self.probable_delete_index, object_id).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Verdict::AlreadyHandled,
            Err(e) => {
                tracing::warn!(object_id = %object_id, error = %e, "Probable-delete lookup failed, treating as handled");
                return Verdict::AlreadyHandled;
            }
        };

        let record = match ProbableDeleteRecord::from_json(&raw) {
            Ok(record) => record,
            Err(e) => {
                return Verdict::Skip {
                    reason: format!("malformed probable-delete record: {e}"),
                };
            }
        };

        if let Some(instance_id) = &record.global_instance_id
            && self.instance_is_active(instance_id).await
        {
            return Verdict::InstanceActive {
                instance_id: instance_id.clone(),
            };
        }

        match self.store.get(&self.object_metadata_index, object_id).await {
            Ok(None) => Verdict::Delete { record },
            Ok(Some(raw)) => match ObjectMetadataRecord::from_json(&raw) {
                Ok(live) if live.object_name == record.probable_object_name => {
                    Verdict::Delete { record }
                }
                Ok(live) => Verdict::Stale {
                    live_name: live.object_name,
                },
                Err(e) => Verdict::Skip {
                    reason: format!("malformed object metadata: {e}"),
                },
            },
            Err(e) => Verdict::Skip {
                reason: format!("object metadata lookup failed: {e}"),
            },
        }
    }

    /// An instance counts as active while the instance index lists it, or
    /// when the index cannot be read.
    async fn instance_is_active(&self, instance_id: &str) -> bool {
        let Some(index_id) = &self.instance_index else {
            return false;
        };

        match list_all(self.store.as_ref(), index_id, self.max_keys).await {
            Ok(entries) => entries.iter().any(|e| e.value == instance_id),
            Err(e) => {
                tracing::warn!(index_id = %index_id, error = %e, "Instance index unavailable, assuming instance is active");
                true
            }
        }
    }
}
