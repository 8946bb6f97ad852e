//! Applies one deletion job: validate, delete the data, retire the record.

use std::fmt;
use std::sync::Arc;

use common::storage::object_path;
use common::store::MetadataStore;
use messaging::DeletionJob;
use object_store::ObjectStore;

use crate::validator::{DeletionValidator, Verdict};

/// Outcome of processing one job. Every outcome acknowledges the delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Object data was removed and the record retired.
    Deleted,
    /// The object store reported the data already gone; the record was retired.
    AlreadyDeleted,
    /// The object id was reused by a newer object; only the record was retired.
    Stale,
    /// No probable-delete record.
    AlreadyHandled,
    /// Write path still active; the record stays for a later tick.
    InstanceActive,
    /// Could not decide or could not delete; the record stays for a later tick.
    Skipped(String),
}

impl fmt::Display for ProcessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessOutcome::Deleted => write!(f, "deleted"),
            ProcessOutcome::AlreadyDeleted => write!(f, "already deleted"),
            ProcessOutcome::Stale => write!(f, "stale"),
            ProcessOutcome::AlreadyHandled => write!(f, "already handled"),
            ProcessOutcome::InstanceActive => write!(f, "instance active"),
            ProcessOutcome::Skipped(reason) => write!(f, "skipped: {reason}"),
        }
    }
}

pub struct JobProcessor {
    validator: DeletionValidator,
    store: Arc<dyn MetadataStore>,
    object_store: Arc<dyn ObjectStore>,
    probable_delete_index: String,
    object_prefix: String,
}

impl JobProcessor {
    pub fn new(
        validator: DeletionValidator,
        store: Arc<dyn MetadataStore>,
        object_store: Arc<dyn ObjectStore>,
        probable_delete_index: impl Into<String>,
        object_prefix: impl Into<String>,
    ) -> Self {
        Self {
            validator,
            store,
            object_store,
            probable_delete_index: probable_delete_index.into(),
            object_prefix: object_prefix.into(),
        }
    }

    /// Process one job. Safe to call again for the same object id: once the
    /// record is retired a repeat is `AlreadyHandled`, and a repeat after a
    /// crash between the data delete and retirement is `AlreadyDeleted`.
    pub async fn process(&self, job: &DeletionJob) -> ProcessOutcome {
        let object_id = job.object_id.as_str();

        let outcome = match self.validator.validate(object_id).await {
            Verdict::AlreadyHandled => return ProcessOutcome::AlreadyHandled,
            Verdict::InstanceActive { instance_id } => {
                tracing::debug!(object_id = %object_id, instance_id = %instance_id, "Write path still active, keeping record");
                return ProcessOutcome::InstanceActive;
            }
            Verdict::Skip { reason } => {
                tracing::warn!(object_id = %object_id, reason = %reason, "Skipping deletion job");
                return ProcessOutcome::Skipped(reason);
            }
            Verdict::Stale { live_name } => {
                tracing::info!(object_id = %object_id, live_name = %live_name, "Object id reused, retiring stale record");
                ProcessOutcome::Stale
            }
            Verdict::Delete { record } => {
                let path = object_path(&self.object_prefix, object_id);
                match self.object_store.delete(&path).await {
                    Ok(()) => {
                        tracing::info!(
                            object_id = %object_id,
                            object_name = %record.probable_object_name,
                            path = %path,
                            "Deleted object data"
                        );
                        ProcessOutcome::Deleted
                    }
                    Err(object_store::Error::NotFound { .. }) => {
                        tracing::debug!(object_id = %object_id, path = %path, "Object data already gone");
                        ProcessOutcome::AlreadyDeleted
                    }
                    Err(e) => {
                        tracing::warn!(object_id = %object_id, path = %path, error = %e, "Failed to delete object data");
                        return ProcessOutcome::Skipped(format!("object delete failed: {e}"));
                    }
                }
            }
        };

        // A failed retirement leaves the record for the next tick, which
        // then finds the data gone or the id still reused.
        if let Err(e) = self
            .store
            .delete(&self.probable_delete_index, object_id)
            .await
        {
            tracing::warn!(object_id = %object_id, error = %e, "Failed to retire probable-delete record");
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::store::InMemoryMetadataStore;
    use object_store::PutPayload;
    use object_store::local::LocalFileSystem;
    use object_store::memory::InMemory;

    const PD: &str = "probable-delete";
    const META: &str = "object-metadata";
    const PREFIX: &str = "objects";

    struct Fixture {
        store: Arc<InMemoryMetadataStore>,
        objects: Arc<InMemory>,
        processor: JobProcessor,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryMetadataStore::new());
        let objects = Arc::new(InMemory::new());
        let shared = Arc::clone(&store) as Arc<dyn MetadataStore>;
        let processor = JobProcessor::new(
            DeletionValidator::new(Arc::clone(&shared), PD, META, 100),
            shared,
            Arc::clone(&objects) as Arc<dyn ObjectStore>,
            PD,
            PREFIX,
        );
        Fixture {
            store,
            objects,
            processor,
        }
    }

    async fn put_object(objects: &InMemory, object_id: &str) {
        objects
            .put(&object_path(PREFIX, object_id), PutPayload::from_static(b"data"))
            .await
            .unwrap();
    }

    async fn object_exists(objects: &InMemory, object_id: &str) -> bool {
        objects.head(&object_path(PREFIX, object_id)).await.is_ok()
    }

    #[tokio::test]
    async fn test_matching_candidate_is_deleted_and_retired() {
        let f = fixture();
        f.store.insert(PD, "oid-1", r#"{"probable_object_name":"bucket/obj"}"#);
        f.store.insert(META, "oid-1", r#"{"object_id":"oid-1","object_name":"bucket/obj"}"#);
        put_object(&f.objects, "oid-1").await;

        let outcome = f.processor.process(&DeletionJob::new("oid-1")).await;

        assert_eq!(outcome, ProcessOutcome::Deleted);
        assert!(!object_exists(&f.objects, "oid-1").await);
        assert!(f.store.snapshot(PD).is_empty());
    }

    #[tokio::test]
    async fn test_stale_candidate_keeps_data_and_retires_record() {
        let f = fixture();
        f.store.insert(PD, "oid-1", r#"{"probable_object_name":"bucket/obj"}"#);
        f.store.insert(META, "oid-1", r#"{"object_id":"oid-1","object_name":"bucket/obj-v2"}"#);
        put_object(&f.objects, "oid-1").await;

        let outcome = f.processor.process(&DeletionJob::new("oid-1")).await;

        assert_eq!(outcome, ProcessOutcome::Stale);
        assert!(object_exists(&f.objects, "oid-1").await);
        assert!(f.store.snapshot(PD).is_empty());
    }

    #[tokio::test]
    async fn test_repeat_after_retirement_is_a_no_op() {
        let f = fixture();
        f.store.insert(PD, "oid-1", r#"{"probable_object_name":"bucket/obj"}"#);
        put_object(&f.objects, "oid-1").await;

        assert_eq!(
            f.processor.process(&DeletionJob::new("oid-1")).await,
            ProcessOutcome::Deleted
        );
        let mutations = f.store.mutation_count();

        assert_eq!(
            f.processor.process(&DeletionJob::new("oid-1")).await,
            ProcessOutcome::AlreadyHandled
        );
        assert_eq!(f.store.mutation_count(), mutations);
    }

    #[tokio::test]
    async fn test_repeat_after_crash_before_retirement() {
        // the in-memory store deletes missing paths silently; the local
        // filesystem reports them
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(LocalFileSystem::new_with_prefix(dir.path()).unwrap());
        let store = Arc::new(InMemoryMetadataStore::new());
        let shared = Arc::clone(&store) as Arc<dyn MetadataStore>;
        let processor = JobProcessor::new(
            DeletionValidator::new(Arc::clone(&shared), PD, META, 100),
            shared,
            objects as Arc<dyn ObjectStore>,
            PD,
            PREFIX,
        );

        // data already gone, record never retired
        store.insert(PD, "oid-1", r#"{"probable_object_name":"bucket/obj"}"#);

        let outcome = processor.process(&DeletionJob::new("oid-1")).await;

        assert_eq!(outcome, ProcessOutcome::AlreadyDeleted);
        assert!(store.snapshot(PD).is_empty());
    }

    #[tokio::test]
    async fn test_skipped_candidate_keeps_record_and_data() {
        let f = fixture();
        f.store.insert(PD, "oid-1", r#"{"probable_object_name":"bucket/obj"}"#);
        put_object(&f.objects, "oid-1").await;
        f.store.set_unavailable(META, true);

        let outcome = f.processor.process(&DeletionJob::new("oid-1")).await;

        assert!(matches!(outcome, ProcessOutcome::Skipped(_)));
        assert!(object_exists(&f.objects, "oid-1").await);
        assert_eq!(f.store.snapshot(PD).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_retirement_still_reports_deletion() {
        let f = fixture();
        f.store.insert(PD, "oid-1", r#"{"probable_object_name":"bucket/obj"}"#);
        put_object(&f.objects, "oid-1").await;

        // reads succeed through a separate validator store, writes fail
        let failing = Arc::new(InMemoryMetadataStore::new());
        failing.set_unavailable(PD, true);
        let processor = JobProcessor::new(
            DeletionValidator::new(Arc::clone(&f.store) as Arc<dyn MetadataStore>, PD, META, 100),
            failing as Arc<dyn MetadataStore>,
            Arc::clone(&f.objects) as Arc<dyn ObjectStore>,
            PD,
            PREFIX,
        );

        let outcome = processor.process(&DeletionJob::new("oid-1")).await;

        assert_eq!(outcome, ProcessOutcome::Deleted);
        assert_eq!(f.store.snapshot(PD).len(), 1);
    }
}
