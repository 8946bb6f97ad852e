//! Detects and repairs divergence between the primary and replica copies of
//! the bucket indexes.
//!
//! Two replica pairs are reconciled together: the flat bucket list index,
//! keyed by bucket name, and the bucket metadata index, keyed by
//! `accountId/bucketName`. A bucket is only restored when both pairs agree it
//! exists; entries that fail that cross-check are removed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use common::config::IndexConfig;
use common::store::{IndexEntry, MetadataStore, StoreError, list_all};

pub mod merge;
pub mod prompt;
pub mod report;

pub use prompt::{AlwaysConfirm, Confirm};
pub use report::{DivergenceReport, ListingStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Primary,
    Replica,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Primary => f.write_str("primary"),
            Side::Replica => f.write_str("replica"),
        }
    }
}

/// A primary index and the replica expected to converge with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaPair {
    pub name: String,
    pub primary: String,
    pub replica: String,
}

impl ReplicaPair {
    pub fn new(
        name: impl Into<String>,
        primary: impl Into<String>,
        replica: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            primary: primary.into(),
            replica: replica.into(),
        }
    }

    pub fn bucket_list(indexes: &IndexConfig) -> Self {
        Self::new(
            "global bucket list",
            &indexes.global_bucket_index_id,
            &indexes.global_bucket_index_id_replica,
        )
    }

    pub fn bucket_metadata(indexes: &IndexConfig) -> Self {
        Self::new(
            "bucket metadata",
            &indexes.bucket_metadata_index_id,
            &indexes.bucket_metadata_index_id_replica,
        )
    }

    pub fn index(&self, side: Side) -> &str {
        match side {
            Side::Primary => &self.primary,
            Side::Replica => &self.replica,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("refusing to restore {pair}: listing of index {index_id} failed")]
    ValidationRefused { pair: String, index_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Counters for a restore pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub written: usize,
    pub in_sync: usize,
    pub declined: usize,
    pub failed: usize,
}

impl RestoreStats {
    fn add(&mut self, other: RestoreStats) {
        self.written += other.written;
        self.in_sync += other.in_sync;
        self.declined += other.declined;
        self.failed += other.failed;
    }
}

/// Everything a recovery run did.
#[derive(Debug, Default)]
pub struct RecoverySummary {
    pub reports: Vec<DivergenceReport>,
    pub common_keys: BTreeSet<String>,
    pub restore: RestoreStats,
    pub removed: usize,
    pub errors: Vec<ReconcileError>,
}

impl RecoverySummary {
    /// Whether any index could not be listed during the run
    pub fn listing_failed(&self) -> bool {
        self.reports.iter().any(|r| r.failed_side().is_some())
            || self
                .errors
                .iter()
                .any(|e| matches!(e, ReconcileError::Store(_)))
    }
}

impl fmt::Display for RecoverySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Common buckets: {}", self.common_keys.len())?;
        writeln!(
            f,
            "Entries written: {} (already in sync: {}, declined: {}, failed: {})",
            self.restore.written, self.restore.in_sync, self.restore.declined, self.restore.failed
        )?;
        writeln!(f, "Entries removed: {}", self.removed)?;
        for error in &self.errors {
            writeln!(f, "Error: {error}")?;
        }
        Ok(())
    }
}

/// Bucket name of a bucket metadata key (`accountId/bucketName`).
fn bucket_of(metadata_key: &str) -> Option<&str> {
    metadata_key.split_once('/').map(|(_, bucket)| bucket)
}

pub struct IndexReconciler {
    store: Arc<dyn MetadataStore>,
    max_keys: usize,
}

impl IndexReconciler {
    pub fn new(store: Arc<dyn MetadataStore>, max_keys: usize) -> Self {
        Self { store, max_keys }
    }

    /// List every entry of an index.
    pub async fn list_index(&self, index_id: &str) -> Result<Vec<IndexEntry>, StoreError> {
        list_all(self.store.as_ref(), index_id, self.max_keys).await
    }

    /// List one side, treating a failed listing as empty.
    async fn list_side(&self, index_id: &str) -> (BTreeMap<String, String>, ListingStatus) {
        match self.list_index(index_id).await {
            Ok(entries) => {
                let status = ListingStatus::Complete {
                    entries: entries.len(),
                };
                let map = entries.into_iter().map(|e| (e.key, e.value)).collect();
                (map, status)
            }
            Err(e) => {
                tracing::error!(index_id = %index_id, error = %e, "Index listing failed, treating as empty");
                (
                    BTreeMap::new(),
                    ListingStatus::Failed {
                        error: e.to_string(),
                    },
                )
            }
        }
    }

    /// Compare both sides of a pair without writing anything.
    pub async fn dry_run(&self, pair: &ReplicaPair) -> DivergenceReport {
        let primary = self.list_side(&pair.primary).await;
        let replica = self.list_side(&pair.replica).await;
        let merged = merge::merge(&primary.0, &replica.0);

        tracing::info!(
            pair = %pair.name,
            keys = merged.winners.len(),
            primary_only = merged.primary_only.len(),
            replica_only = merged.replica_only.len(),
            conflicts = merged.conflicts.len(),
            "Compared replica pair"
        );

        DivergenceReport::new(pair.clone(), primary, replica, merged)
    }

    /// Buckets present in the list index that also have a metadata entry.
    pub fn check_consistency(
        list_result: &BTreeMap<String, String>,
        metadata_result: &BTreeMap<String, String>,
    ) -> BTreeSet<String> {
        let with_metadata: BTreeSet<&str> = metadata_result
            .keys()
            .filter_map(|key| bucket_of(key))
            .collect();

        list_result
            .keys()
            .filter(|key| with_metadata.contains(key.as_str()))
            .cloned()
            .collect()
    }

    /// Write the winning value of each of `keys` to every side not already holding it.
    ///
    /// Refused when either listing of the pair failed.
    pub async fn restore_data(
        &self,
        report: &DivergenceReport,
        keys: &BTreeSet<String>,
        confirm: &mut dyn Confirm,
    ) -> Result<RestoreStats, ReconcileError> {
        if let Some(side) = report.failed_side() {
            return Err(ReconcileError::ValidationRefused {
                pair: report.pair.name.clone(),
                index_id: report.pair.index(side).to_string(),
            });
        }

        let mut stats = RestoreStats::default();
        for key in keys {
            let Some(winner) = report.winners.get(key) else {
                continue;
            };

            for side in [Side::Primary, Side::Replica] {
                let index_id = report.pair.index(side);
                let current = report.value(side, key);
                if current == Some(winner.as_str()) {
                    stats.in_sync += 1;
                    continue;
                }

                let prompt = format!(
                    "Write {key} to {side} index {index_id}?\n  current: {}\n  new:     {winner}\n",
                    current.unwrap_or("<missing>")
                );
                if !confirm.confirm(&prompt) {
                    tracing::info!(index_id = %index_id, key = %key, "Restore declined");
                    stats.declined += 1;
                    continue;
                }

                match self.store.put(index_id, key, winner).await {
                    Ok(()) => {
                        tracing::info!(index_id = %index_id, key = %key, side = %side, "Restored index entry");
                        stats.written += 1;
                    }
                    Err(e) => {
                        tracing::error!(index_id = %index_id, key = %key, error = %e, "Failed to restore index entry");
                        stats.failed += 1;
                    }
                }
            }
        }

        Ok(stats)
    }

    /// Remove entries of `index_id` rejected by `keep`, working from a fresh listing.
    async fn cleanup(
        &self,
        index_id: &str,
        keep: impl Fn(&str) -> bool,
        confirm: &mut dyn Confirm,
    ) -> Result<usize, StoreError> {
        let entries = self.list_index(index_id).await?;
        let mut removed = 0;

        for entry in entries.iter().filter(|e| !keep(&e.key)) {
            let prompt = format!(
                "Delete {} from index {index_id}?\n  value: {}\n",
                entry.key, entry.value
            );
            if !confirm.confirm(&prompt) {
                tracing::info!(index_id = %index_id, key = %entry.key, "Cleanup declined");
                continue;
            }

            match self.store.delete(index_id, &entry.key).await {
                Ok(_) => {
                    tracing::info!(index_id = %index_id, key = %entry.key, "Removed inconsistent index entry");
                    removed += 1;
                }
                Err(e) => {
                    tracing::error!(index_id = %index_id, key = %entry.key, error = %e, "Failed to remove index entry");
                }
            }
        }

        Ok(removed)
    }

    /// Restore both bucket index pairs, then remove entries that fail the cross-check.
    pub async fn recover(&self, indexes: &IndexConfig) -> RecoverySummary {
        self.run_recovery(indexes, &mut AlwaysConfirm).await
    }

    /// Like [`recover`](Self::recover), asking `confirm` before every write and delete.
    pub async fn interactive_recover(
        &self,
        indexes: &IndexConfig,
        confirm: &mut dyn Confirm,
    ) -> RecoverySummary {
        self.run_recovery(indexes, confirm).await
    }

    async fn run_recovery(
        &self,
        indexes: &IndexConfig,
        confirm: &mut dyn Confirm,
    ) -> RecoverySummary {
        let list_pair = ReplicaPair::bucket_list(indexes);
        let metadata_pair = ReplicaPair::bucket_metadata(indexes);

        let (list_report, metadata_report) =
            tokio::join!(self.dry_run(&list_pair), self.dry_run(&metadata_pair));

        let mut summary = RecoverySummary::default();

        // The cross-check needs complete views of both pairs
        let failed_index = [&list_report, &metadata_report]
            .into_iter()
            .find_map(|report| {
                report
                    .failed_side()
                    .map(|side| report.pair.index(side).to_string())
            });

        if let Some(index_id) = failed_index {
            for pair in [&list_pair, &metadata_pair] {
                let error = ReconcileError::ValidationRefused {
                    pair: pair.name.clone(),
                    index_id: index_id.clone(),
                };
                tracing::error!(error = %error, "Recovery refused");
                summary.errors.push(error);
            }
            summary.reports = vec![list_report, metadata_report];
            return summary;
        }

        let common = Self::check_consistency(&list_report.winners, &metadata_report.winners);
        tracing::info!(common = common.len(), "Cross-checked bucket indexes");

        let metadata_keys: BTreeSet<String> = metadata_report
            .winners
            .keys()
            .filter(|key| bucket_of(key).is_some_and(|bucket| common.contains(bucket)))
            .cloned()
            .collect();

        for (report, keys) in [(&list_report, &common), (&metadata_report, &metadata_keys)] {
            match self.restore_data(report, keys, confirm).await {
                Ok(stats) => summary.restore.add(stats),
                Err(e) => {
                    tracing::error!(error = %e, "Restore skipped");
                    summary.errors.push(e);
                }
            }
        }

        let keep_list = |key: &str| common.contains(key);
        let keep_metadata =
            |key: &str| bucket_of(key).is_some_and(|bucket| common.contains(bucket));

        for side in [Side::Primary, Side::Replica] {
            for (index_id, is_metadata) in [
                (list_pair.index(side), false),
                (metadata_pair.index(side), true),
            ] {
                let result = if is_metadata {
                    self.cleanup(index_id, keep_metadata, confirm).await
                } else {
                    self.cleanup(index_id, keep_list, confirm).await
                };
                match result {
                    Ok(removed) => summary.removed += removed,
                    Err(e) => {
                        tracing::error!(index_id = %index_id, error = %e, "Cleanup skipped, index listing failed");
                        summary.errors.push(e.into());
                    }
                }
            }
        }

        summary.common_keys = common;
        summary.reports = vec![list_report, metadata_report];
        summary
    }
}
