//! Conflict resolution between the two copies of an index entry.

use std::collections::BTreeMap;
use std::fmt;

use common::records::create_timestamp;

use crate::Side;

/// Why a side won a conflicting key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeReason {
    /// Both values carry a `create_timestamp`; the later one won.
    NewerTimestamp,
    /// Equal timestamps, primary kept.
    TimestampTie,
    /// Only the winning value carries a parseable `create_timestamp`.
    OnlyTimestamped,
    /// Neither value carries a parseable `create_timestamp`, primary kept.
    NoTimestamp,
}

impl fmt::Display for MergeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MergeReason::NewerTimestamp => "newer create_timestamp",
            MergeReason::TimestampTie => "equal create_timestamp, primary kept",
            MergeReason::OnlyTimestamped => "only side with a create_timestamp",
            MergeReason::NoTimestamp => "no create_timestamp, primary kept",
        };
        f.write_str(text)
    }
}

/// A key present on both sides with different values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub key: String,
    pub chosen: Side,
    pub reason: MergeReason,
}

/// Pick the value to keep when both sides hold different values.
pub fn choose(primary: &str, replica: &str) -> (Side, MergeReason) {
    match (create_timestamp(primary), create_timestamp(replica)) {
        (Some(p), Some(r)) if r > p => (Side::Replica, MergeReason::NewerTimestamp),
        (Some(p), Some(r)) if p > r => (Side::Primary, MergeReason::NewerTimestamp),
        (Some(_), Some(_)) => (Side::Primary, MergeReason::TimestampTie),
        (Some(_), None) => (Side::Primary, MergeReason::OnlyTimestamped),
        (None, Some(_)) => (Side::Replica, MergeReason::OnlyTimestamped),
        (None, None) => (Side::Primary, MergeReason::NoTimestamp),
    }
}

/// Result of merging two listings key by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Merged {
    pub winners: BTreeMap<String, String>,
    pub primary_only: Vec<String>,
    pub replica_only: Vec<String>,
    pub conflicts: Vec<Conflict>,
}

/// Union of both listings, resolving each key present on both sides.
pub fn merge(primary: &BTreeMap<String, String>, replica: &BTreeMap<String, String>) -> Merged {
    let mut merged = Merged::default();

    for (key, value) in primary {
        match replica.get(key) {
            None => {
                merged.primary_only.push(key.clone());
                merged.winners.insert(key.clone(), value.clone());
            }
            Some(other) if other == value => {
                merged.winners.insert(key.clone(), value.clone());
            }
            Some(other) => {
                let (chosen, reason) = choose(value, other);
                let winner = match chosen {
                    Side::Primary => value,
                    Side::Replica => other,
                };
                merged.winners.insert(key.clone(), winner.clone());
                merged.conflicts.push(Conflict {
                    key: key.clone(),
                    chosen,
                    reason,
                });
            }
        }
    }

    for (key, value) in replica {
        if !primary.contains_key(key) {
            merged.replica_only.push(key.clone());
            merged.winners.insert(key.clone(), value.clone());
        }
    }

    merged
}
