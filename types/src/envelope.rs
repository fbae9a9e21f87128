use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::WorkerRank;

/// Tags every inter-participant payload with its sender, per §3's
/// `(sender_role, body)` envelope shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SenderRole {
    Worker(WorkerRank),
    DataMngr,
    RecSys,
    AgntPoolMngr,
    PolicyEval,
    Analyzer,
}

impl fmt::Display for SenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SenderRole::Worker(rank) => write!(f, "worker[{rank}]"),
            SenderRole::DataMngr => write!(f, "dataMngr"),
            SenderRole::RecSys => write!(f, "recSys"),
            SenderRole::AgntPoolMngr => write!(f, "agntPoolMngr"),
            SenderRole::PolicyEval => write!(f, "policyEval"),
            SenderRole::Analyzer => write!(f, "analyzer"),
        }
    }
}

/// An envelope carrying a typed body from a known sender. The STOP control
/// tag is not a variant of `T`: it travels out-of-band as a shared
/// `StopSignal` every participant holds a clone of, rather than interleaved
/// with data frames on the same mailbox (see `simsom_engine::protocol`).
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub sender: SenderRole,
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(sender: SenderRole, body: T) -> Self {
        Self { sender, body }
    }
}
