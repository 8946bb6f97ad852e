use std::collections::BTreeMap;
use std::fmt;

use crate::merge::{Conflict, Merged};
use crate::{ReplicaPair, Side};

/// Outcome of listing one side of a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingStatus {
    Complete { entries: usize },
    Failed { error: String },
}

impl ListingStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, ListingStatus::Failed { .. })
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListingStatus::Complete { entries } => write!(f, "{entries} entries"),
            ListingStatus::Failed { error } => write!(f, "listing failed: {error}"),
        }
    }
}

/// Differences between the two sides of a replica pair.
#[derive(Debug, Clone)]
pub struct DivergenceReport {
    pub pair: ReplicaPair,
    pub primary_status: ListingStatus,
    pub replica_status: ListingStatus,
    /// Key to the value both sides should hold
    pub winners: BTreeMap<String, String>,
    pub primary_only: Vec<String>,
    pub replica_only: Vec<String>,
    pub conflicts: Vec<Conflict>,
    pub(crate) primary: BTreeMap<String, String>,
    pub(crate) replica: BTreeMap<String, String>,
}

impl DivergenceReport {
    pub(crate) fn new(
        pair: ReplicaPair,
        primary: (BTreeMap<String, String>, ListingStatus),
        replica: (BTreeMap<String, String>, ListingStatus),
        merged: Merged,
    ) -> Self {
        Self {
            pair,
            primary_status: primary.1,
            replica_status: replica.1,
            winners: merged.winners,
            primary_only: merged.primary_only,
            replica_only: merged.replica_only,
            conflicts: merged.conflicts,
            primary: primary.0,
            replica: replica.0,
        }
    }

    /// The first side whose listing failed.
    pub fn failed_side(&self) -> Option<Side> {
        if self.primary_status.is_failed() {
            Some(Side::Primary)
        } else if self.replica_status.is_failed() {
            Some(Side::Replica)
        } else {
            None
        }
    }

    pub fn is_converged(&self) -> bool {
        self.primary_only.is_empty() && self.replica_only.is_empty() && self.conflicts.is_empty()
    }

    /// Value currently held by `side`, as listed.
    pub fn value(&self, side: Side, key: &str) -> Option<&str> {
        match side {
            Side::Primary => self.primary.get(key),
            Side::Replica => self.replica.get(key),
        }
        .map(String::as_str)
    }
}

impl fmt::Display for DivergenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Replica pair {} (primary {}, replica {})",
            self.pair.name, self.pair.primary, self.pair.replica
        )?;
        writeln!(f, "  primary: {}", self.primary_status)?;
        writeln!(f, "  replica: {}", self.replica_status)?;

        if self.is_converged() {
            writeln!(f, "  no divergence")?;
        }

        writeln!(f, "  primary-only keys ({}):", self.primary_only.len())?;
        for key in &self.primary_only {
            writeln!(f, "    {key}")?;
        }
        writeln!(f, "  replica-only keys ({}):", self.replica_only.len())?;
        for key in &self.replica_only {
            writeln!(f, "    {key}")?;
        }
        writeln!(f, "  conflicting keys ({}):", self.conflicts.len())?;
        for conflict in &self.conflicts {
            writeln!(
                f,
                "    {} -> {} ({})",
                conflict.key, conflict.chosen, conflict.reason
            )?;
        }
        writeln!(f, "  winning values ({}):", self.winners.len())?;
        for (key, value) in &self.winners {
            writeln!(f, "    {key} = {value}")?;
        }
        Ok(())
    }
}
