//! Opaque identifiers shared by every participant.

/// A user identifier. Opaque per [`crate::User`]'s data model.
pub type Uid = u64;

/// A message identifier, unique for the lifetime of a run.
pub type Mid = u64;

/// A view (passive action) identifier.
pub type Vid = u64;

/// Index of a worker participant within the configured worker-rank set.
pub type WorkerRank = usize;
